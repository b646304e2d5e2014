use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DomainNameServer = 6,
    HostName = 12,
    NtpServers = 42,
    RequestedIpAddress = 50,
    AddressLeaseTime = 51,
    OptionOverload = 52,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    Message = 56,
    MaxMessageSize = 57,
    RenewalTime = 58,
    RebindingTime = 59,
    VendorClassIdentifier = 60,
    ClientIdentifier = 61,
    TftpServerName = 66,
    BootFileName = 67,
    UserClass = 77,
    ClientFqdn = 81,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DomainNameServer),
            12 => Ok(Self::HostName),
            42 => Ok(Self::NtpServers),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::AddressLeaseTime),
            52 => Ok(Self::OptionOverload),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            56 => Ok(Self::Message),
            57 => Ok(Self::MaxMessageSize),
            58 => Ok(Self::RenewalTime),
            59 => Ok(Self::RebindingTime),
            60 => Ok(Self::VendorClassIdentifier),
            61 => Ok(Self::ClientIdentifier),
            66 => Ok(Self::TftpServerName),
            67 => Ok(Self::BootFileName),
            77 => Ok(Self::UserClass),
            81 => Ok(Self::ClientFqdn),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// A decoded DHCP option. Codes without a typed variant round-trip through
/// [`DhcpOption::Generic`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    Router(Vec<Ipv4Addr>),
    DomainNameServer(Vec<Ipv4Addr>),
    HostName(String),
    NtpServers(Vec<Ipv4Addr>),
    RequestedIpAddress(Ipv4Addr),
    AddressLeaseTime(u32),
    OptionOverload(u8),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    Message(String),
    MaxMessageSize(u16),
    RenewalTime(u32),
    RebindingTime(u32),
    VendorClassIdentifier(Vec<u8>),
    ClientIdentifier(Vec<u8>),
    TftpServerName(String),
    BootFileName(String),
    UserClass(Vec<u8>),
    ClientFqdn(Vec<u8>),
    Generic(u8, Vec<u8>),
}

fn single_addr(code: u8, data: &[u8]) -> Result<Ipv4Addr> {
    if data.len() != 4 {
        return Err(Error::MalformedOption {
            code,
            reason: format!("expected 4 bytes, got {}", data.len()),
        });
    }
    Ok(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
}

fn addr_list(code: u8, data: &[u8]) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || data.len() % 4 != 0 {
        return Err(Error::MalformedOption {
            code,
            reason: format!("expected a multiple of 4 bytes, got {}", data.len()),
        });
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn u32_value(code: u8, data: &[u8]) -> Result<u32> {
    if data.len() != 4 {
        return Err(Error::MalformedOption {
            code,
            reason: format!("expected 4 bytes, got {}", data.len()),
        });
    }
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

fn u16_value(code: u8, data: &[u8]) -> Result<u16> {
    if data.len() != 2 {
        return Err(Error::MalformedOption {
            code,
            reason: format!("expected 2 bytes, got {}", data.len()),
        });
    }
    Ok(u16::from_be_bytes([data[0], data[1]]))
}

fn text(data: &[u8]) -> String {
    let end = data.iter().position(|&byte| byte == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

impl DhcpOption {
    /// Decodes the (already reassembled) value bytes for a given code.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Ok(Self::SubnetMask(single_addr(code, data)?)),
            Ok(OptionCode::Router) => Ok(Self::Router(addr_list(code, data)?)),
            Ok(OptionCode::DomainNameServer) => {
                Ok(Self::DomainNameServer(addr_list(code, data)?))
            }
            Ok(OptionCode::HostName) => Ok(Self::HostName(text(data))),
            Ok(OptionCode::NtpServers) => Ok(Self::NtpServers(addr_list(code, data)?)),
            Ok(OptionCode::RequestedIpAddress) => {
                Ok(Self::RequestedIpAddress(single_addr(code, data)?))
            }
            Ok(OptionCode::AddressLeaseTime) => Ok(Self::AddressLeaseTime(u32_value(code, data)?)),
            Ok(OptionCode::OptionOverload) => {
                if data.len() != 1 {
                    return Err(Error::MalformedOption {
                        code,
                        reason: format!("expected 1 byte, got {}", data.len()),
                    });
                }
                Ok(Self::OptionOverload(data[0]))
            }
            Ok(OptionCode::MessageType) => {
                if data.len() != 1 {
                    return Err(Error::MalformedOption {
                        code,
                        reason: format!("expected 1 byte, got {}", data.len()),
                    });
                }
                let kind = MessageType::try_from(data[0]).map_err(|value| {
                    Error::MalformedOption {
                        code,
                        reason: format!("unknown message type {}", value),
                    }
                })?;
                Ok(Self::MessageType(kind))
            }
            Ok(OptionCode::ServerIdentifier) => {
                Ok(Self::ServerIdentifier(single_addr(code, data)?))
            }
            Ok(OptionCode::ParameterRequestList) => {
                Ok(Self::ParameterRequestList(data.to_vec()))
            }
            Ok(OptionCode::Message) => Ok(Self::Message(text(data))),
            Ok(OptionCode::MaxMessageSize) => Ok(Self::MaxMessageSize(u16_value(code, data)?)),
            Ok(OptionCode::RenewalTime) => Ok(Self::RenewalTime(u32_value(code, data)?)),
            Ok(OptionCode::RebindingTime) => Ok(Self::RebindingTime(u32_value(code, data)?)),
            Ok(OptionCode::VendorClassIdentifier) => {
                Ok(Self::VendorClassIdentifier(data.to_vec()))
            }
            Ok(OptionCode::ClientIdentifier) => Ok(Self::ClientIdentifier(data.to_vec())),
            Ok(OptionCode::TftpServerName) => Ok(Self::TftpServerName(text(data))),
            Ok(OptionCode::BootFileName) => Ok(Self::BootFileName(text(data))),
            Ok(OptionCode::UserClass) => Ok(Self::UserClass(data.to_vec())),
            Ok(OptionCode::ClientFqdn) => Ok(Self::ClientFqdn(data.to_vec())),
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => Err(Error::MalformedOption {
                code,
                reason: "pad/end are not value-carrying options".to_string(),
            }),
            Err(unknown) => Ok(Self::Generic(unknown, data.to_vec())),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u8,
            Self::Router(_) => OptionCode::Router as u8,
            Self::DomainNameServer(_) => OptionCode::DomainNameServer as u8,
            Self::HostName(_) => OptionCode::HostName as u8,
            Self::NtpServers(_) => OptionCode::NtpServers as u8,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress as u8,
            Self::AddressLeaseTime(_) => OptionCode::AddressLeaseTime as u8,
            Self::OptionOverload(_) => OptionCode::OptionOverload as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList as u8,
            Self::Message(_) => OptionCode::Message as u8,
            Self::MaxMessageSize(_) => OptionCode::MaxMessageSize as u8,
            Self::RenewalTime(_) => OptionCode::RenewalTime as u8,
            Self::RebindingTime(_) => OptionCode::RebindingTime as u8,
            Self::VendorClassIdentifier(_) => OptionCode::VendorClassIdentifier as u8,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier as u8,
            Self::TftpServerName(_) => OptionCode::TftpServerName as u8,
            Self::BootFileName(_) => OptionCode::BootFileName as u8,
            Self::UserClass(_) => OptionCode::UserClass as u8,
            Self::ClientFqdn(_) => OptionCode::ClientFqdn as u8,
            Self::Generic(code, _) => *code,
        }
    }

    /// Raw value bytes, without the code/length framing. The encoder splits
    /// values longer than 255 bytes into repeated TLVs.
    pub fn value(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => addr.octets().to_vec(),
            Self::Router(addrs) | Self::DomainNameServer(addrs) | Self::NtpServers(addrs) => {
                addrs.iter().flat_map(|addr| addr.octets()).collect()
            }
            Self::HostName(value)
            | Self::Message(value)
            | Self::TftpServerName(value)
            | Self::BootFileName(value) => value.as_bytes().to_vec(),
            Self::AddressLeaseTime(value)
            | Self::RenewalTime(value)
            | Self::RebindingTime(value) => value.to_be_bytes().to_vec(),
            Self::OptionOverload(value) => vec![*value],
            Self::MessageType(kind) => vec![*kind as u8],
            Self::MaxMessageSize(value) => value.to_be_bytes().to_vec(),
            Self::ParameterRequestList(bytes)
            | Self::VendorClassIdentifier(bytes)
            | Self::ClientIdentifier(bytes)
            | Self::UserClass(bytes)
            | Self::ClientFqdn(bytes) => bytes.clone(),
            Self::Generic(_, bytes) => bytes.clone(),
        }
    }
}
