use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// A MAC prefix expressed as leading bytes plus a bit count, so rules can
/// cover an OUI (24 bits), a full address (48 bits), or anything between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacPrefix {
    pub bytes: Vec<u8>,
    pub prefix_bits: u8,
}

impl MacPrefix {
    pub fn matches(&self, hardware: &[u8]) -> bool {
        let bits = self.prefix_bits as usize;
        let full_bytes = bits / 8;
        let trailing_bits = bits % 8;

        let needed = full_bytes + usize::from(trailing_bits > 0);
        if hardware.len() < needed || self.bytes.len() < needed {
            return false;
        }

        if hardware[..full_bytes] != self.bytes[..full_bytes] {
            return false;
        }

        if trailing_bits > 0 {
            let mask = 0xFFu8 << (8 - trailing_bits);
            return hardware[full_bytes] & mask == self.bytes[full_bytes] & mask;
        }

        true
    }
}

/// Binds clients matched by MAC prefix or hostname prefix to a dedicated
/// address range. With `preempt`, the range's first address is handed out
/// even while another client holds it (meant for single-address ranges).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    #[serde(default)]
    pub mac_prefix: Option<MacPrefix>,
    #[serde(default)]
    pub hostname_prefix: Option<String>,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    #[serde(default)]
    pub preempt: bool,
}

impl Reservation {
    pub fn matches(&self, hardware: &[u8], hostname: Option<&str>) -> bool {
        if let Some(prefix) = &self.mac_prefix
            && prefix.matches(hardware)
        {
            return true;
        }

        if let Some(wanted) = &self.hostname_prefix
            && let Some(name) = hostname
        {
            return name.to_lowercase().starts_with(&wanted.to_lowercase());
        }

        false
    }
}

/// Reservations are evaluated in declaration order; first match wins.
pub fn find_match<'a>(
    reservations: &'a [Reservation],
    hardware: &[u8],
    hostname: Option<&str>,
) -> Option<&'a Reservation> {
    reservations
        .iter()
        .find(|reservation| reservation.matches(hardware, hostname))
}
