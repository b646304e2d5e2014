use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::MINIMUM_PACKET_SIZE;
use crate::options::DhcpOption;
use crate::reservation::Reservation;

/// Whether a configured option is always appended to replies or only when
/// the client asks for its code in the parameter request list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionMode {
    Default,
    Force,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredOption {
    pub mode: OptionMode,
    pub option: DhcpOption,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_ip: Ipv4Addr,
    pub port: u16,
    pub subnet_mask: Ipv4Addr,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    pub offer_expiration_seconds: u64,
    /// Signed so hand-edited configs survive a `normalize` pass; negative
    /// values clamp to zero, values past `u32::MAX` mean an infinite lease.
    pub lease_time_seconds: i64,
    pub minimum_packet_size: u16,
    pub options: Vec<ConfiguredOption>,
    pub reservations: Vec<Reservation>,
    /// How long a DECLINEd address stays out of the allocatable set.
    pub decline_hold_seconds: u64,
    pub client_store_file: String,
    /// Linux only: bind the socket to this device (SO_BINDTODEVICE).
    pub interface: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            port: 67,
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            pool_start: Ipv4Addr::new(192, 168, 1, 100),
            pool_end: Ipv4Addr::new(192, 168, 1, 200),
            offer_expiration_seconds: 30,
            lease_time_seconds: 86_400,
            minimum_packet_size: MINIMUM_PACKET_SIZE,
            options: Vec::new(),
            reservations: Vec::new(),
            decline_hold_seconds: 3_600,
            client_store_file: "clients.json".to_string(),
            interface: None,
        }
    }
}

impl Config {
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let mut config: Config = serde_json::from_str(&content)?;
            config.normalize();
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Clamps out-of-range values instead of rejecting them.
    pub fn normalize(&mut self) {
        self.lease_time_seconds = self.lease_time_seconds.max(0);
        self.minimum_packet_size = self.minimum_packet_size.max(MINIMUM_PACKET_SIZE);
    }

    pub fn validate(&self) -> Result<()> {
        if u32::from(self.pool_start) > u32::from(self.pool_end) {
            return Err(Error::InvalidConfig(
                "pool_start must not exceed pool_end".to_string(),
            ));
        }

        if !Self::is_valid_subnet_mask(self.subnet_mask) {
            return Err(Error::InvalidConfig(format!(
                "invalid subnet mask: {} (must be contiguous)",
                self.subnet_mask
            )));
        }

        for reservation in &self.reservations {
            if reservation.mac_prefix.is_none() && reservation.hostname_prefix.is_none() {
                return Err(Error::InvalidConfig(
                    "reservation needs a mac_prefix or hostname_prefix".to_string(),
                ));
            }
            if let Some(prefix) = &reservation.mac_prefix {
                if prefix.prefix_bits as usize > prefix.bytes.len() * 8 {
                    return Err(Error::InvalidConfig(format!(
                        "mac prefix declares {} bits but carries only {} bytes",
                        prefix.prefix_bits,
                        prefix.bytes.len()
                    )));
                }
            }
            if u32::from(reservation.pool_start) > u32::from(reservation.pool_end) {
                return Err(Error::InvalidConfig(
                    "reservation pool_start must not exceed pool_end".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn is_valid_subnet_mask(mask: Ipv4Addr) -> bool {
        let bits = u32::from(mask);
        if bits == 0 {
            return false;
        }
        let inverted = !bits;
        inverted.count_ones() == inverted.trailing_ones()
    }

    pub fn endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.server_ip, self.port)
    }

    /// Lease duration on the wire; `u32::MAX` is the RFC 2131 infinite
    /// lease.
    pub fn lease_time(&self) -> u32 {
        self.lease_time_seconds.clamp(0, u32::MAX as i64) as u32
    }

    pub fn offer_expiration(&self) -> TimeDelta {
        TimeDelta::seconds(self.offer_expiration_seconds.min(i64::MAX as u64) as i64)
    }

    pub fn decline_hold(&self) -> TimeDelta {
        TimeDelta::seconds(self.decline_hold_seconds.min(i64::MAX as u64) as i64)
    }

    /// Forces an address into the server's subnet, keeping its host part:
    /// `(server & mask) | (addr & !mask)`.
    pub fn clamp_to_subnet(&self, addr: Ipv4Addr) -> Ipv4Addr {
        let mask = u32::from(self.subnet_mask);
        Ipv4Addr::from((u32::from(self.server_ip) & mask) | (u32::from(addr) & !mask))
    }

    pub fn in_subnet(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::from(self.subnet_mask);
        u32::from(addr) & mask == u32::from(self.server_ip) & mask
    }

    /// The dynamic pool bounds after subnet sanitization.
    pub fn pool_range(&self) -> (Ipv4Addr, Ipv4Addr) {
        (
            self.clamp_to_subnet(self.pool_start),
            self.clamp_to_subnet(self.pool_end),
        )
    }

    pub fn ip_in_pool(&self, addr: Ipv4Addr) -> bool {
        let (start, end) = self.pool_range();
        u32::from(addr) >= u32::from(start) && u32::from(addr) <= u32::from(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reservation::MacPrefix;

    #[test]
    fn test_default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_pool_order_enforced() {
        let config = Config {
            pool_start: Ipv4Addr::new(192, 168, 1, 200),
            pool_end: Ipv4Addr::new(192, 168, 1, 100),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_subnet_mask_validation() {
        assert!(Config::is_valid_subnet_mask(Ipv4Addr::new(255, 255, 255, 0)));
        assert!(Config::is_valid_subnet_mask(Ipv4Addr::new(255, 255, 240, 0)));
        assert!(!Config::is_valid_subnet_mask(Ipv4Addr::new(255, 0, 255, 0)));
        assert!(!Config::is_valid_subnet_mask(Ipv4Addr::new(0, 0, 0, 0)));
    }

    #[test]
    fn test_normalize_clamps() {
        let mut config = Config {
            lease_time_seconds: -5,
            minimum_packet_size: 100,
            ..Default::default()
        };
        config.normalize();
        assert_eq!(config.lease_time_seconds, 0);
        assert_eq!(config.minimum_packet_size, 312);
    }

    #[test]
    fn test_lease_time_clamps_to_wire_width() {
        let config = Config {
            lease_time_seconds: i64::MAX,
            ..Default::default()
        };
        assert_eq!(config.lease_time(), u32::MAX);
    }

    #[test]
    fn test_clamp_to_subnet() {
        let config = Config {
            server_ip: Ipv4Addr::new(10, 0, 0, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            ..Default::default()
        };
        // Wrong network bits, host part preserved.
        assert_eq!(
            config.clamp_to_subnet(Ipv4Addr::new(192, 168, 7, 100)),
            Ipv4Addr::new(10, 0, 0, 100)
        );
        assert_eq!(
            config.clamp_to_subnet(Ipv4Addr::new(10, 0, 0, 100)),
            Ipv4Addr::new(10, 0, 0, 100)
        );
    }

    #[test]
    fn test_reservation_validation() {
        let empty_rule = Config {
            reservations: vec![Reservation {
                mac_prefix: None,
                hostname_prefix: None,
                pool_start: Ipv4Addr::new(192, 168, 1, 50),
                pool_end: Ipv4Addr::new(192, 168, 1, 50),
                preempt: false,
            }],
            ..Default::default()
        };
        assert!(empty_rule.validate().is_err());

        let short_prefix = Config {
            reservations: vec![Reservation {
                mac_prefix: Some(MacPrefix {
                    bytes: vec![0xaa],
                    prefix_bits: 16,
                }),
                hostname_prefix: None,
                pool_start: Ipv4Addr::new(192, 168, 1, 50),
                pool_end: Ipv4Addr::new(192, 168, 1, 50),
                preempt: false,
            }],
            ..Default::default()
        };
        assert!(short_prefix.validate().is_err());
    }
}
