//! BOOTP/DHCP datagram codec.
//!
//! The wire layout is the fixed 236-byte BOOTP header, the 4-byte magic
//! cookie, then a TLV options stream. Options may spill into the legacy
//! `sname`/`file` fields via Option Overload (52); decoding reassembles
//! those buffers and merges same-code fragments before typed decode, per
//! RFC 2131 pp. 23-24.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OptionCode};

const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
const HEADER_SIZE: usize = 236;
const COOKIE_END: usize = 240;
const SNAME_RANGE: std::ops::Range<usize> = 44..108;
const FILE_RANGE: std::ops::Range<usize> = 108..236;
const BROADCAST_FLAG: u16 = 0x8000;

const OVERLOAD_FILE: u8 = 1;
const OVERLOAD_SNAME: u8 = 2;

pub const BOOT_REQUEST: u8 = 1;
pub const BOOT_REPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;

/// Hard floor for encoded packet size; some BOOTP relays drop anything
/// shorter (RFC 1542 §2.1).
pub const MINIMUM_PACKET_SIZE: u16 = 312;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: String,
    pub file: String,
    pub options: Vec<DhcpOption>,
}

impl DhcpMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < COOKIE_END {
            return Err(Error::MalformedHeader(format!(
                "packet too short: {} bytes (minimum {})",
                data.len(),
                COOKIE_END
            )));
        }

        if data[HEADER_SIZE..COOKIE_END] != MAGIC_COOKIE {
            return Err(Error::MalformedHeader("bad magic cookie".to_string()));
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);

        let sname_raw = &data[SNAME_RANGE];
        let file_raw = &data[FILE_RANGE];

        let mut fragments = Vec::new();
        parse_fragments(&data[COOKIE_END..], &mut fragments)?;

        // The overload option must live in the primary options area; its
        // bitmask selects which legacy fields carry additional options.
        let mut overload = 0u8;
        for (code, value) in &fragments {
            if *code == OptionCode::OptionOverload as u8 {
                if value.len() != 1 {
                    return Err(Error::MalformedOption {
                        code: *code,
                        reason: format!("expected 1 byte, got {}", value.len()),
                    });
                }
                overload = value[0];
                break;
            }
        }

        if overload & OVERLOAD_FILE != 0 {
            parse_fragments(file_raw, &mut fragments)?;
        }
        if overload & OVERLOAD_SNAME != 0 {
            parse_fragments(sname_raw, &mut fragments)?;
        }

        let options = merge_fragments(fragments)?;

        let sname = if overload & OVERLOAD_SNAME != 0 {
            String::new()
        } else {
            terminated_text(sname_raw)
        };
        let file = if overload & OVERLOAD_FILE != 0 {
            String::new()
        } else {
            terminated_text(file_raw)
        };

        Ok(Self {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            yiaddr: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            siaddr: Ipv4Addr::new(data[20], data[21], data[22], data[23]),
            giaddr: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
            chaddr,
            sname,
            file,
            options,
        })
    }

    /// Serializes the message, zero-padding the result to `minimum_size`
    /// after the End option.
    pub fn encode(&self, minimum_size: usize) -> Vec<u8> {
        let mut packet = Vec::with_capacity(minimum_size.max(COOKIE_END + 64));

        packet.push(self.op);
        packet.push(self.htype);
        packet.push(self.hlen);
        packet.push(self.hops);
        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());
        packet.extend_from_slice(&self.ciaddr.octets());
        packet.extend_from_slice(&self.yiaddr.octets());
        packet.extend_from_slice(&self.siaddr.octets());
        packet.extend_from_slice(&self.giaddr.octets());
        packet.extend_from_slice(&self.chaddr);

        let mut sname = [0u8; 64];
        copy_terminated(self.sname.as_bytes(), &mut sname);
        packet.extend_from_slice(&sname);

        let mut file = [0u8; 128];
        copy_terminated(self.file.as_bytes(), &mut file);
        packet.extend_from_slice(&file);

        packet.extend_from_slice(&MAGIC_COOKIE);

        for option in &self.options {
            let code = option.code();
            let value = option.value();
            if value.is_empty() {
                packet.push(code);
                packet.push(0);
                continue;
            }
            for chunk in value.chunks(255) {
                packet.push(code);
                packet.push(chunk.len() as u8);
                packet.extend_from_slice(chunk);
            }
        }

        packet.push(OptionCode::End as u8);

        while packet.len() < minimum_size {
            packet.push(0);
        }

        packet
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::MessageType(kind) => Some(*kind),
            _ => None,
        })
    }

    /// Replace-or-insert semantics: at most one option 53 in the message.
    pub fn set_message_type(&mut self, kind: MessageType) {
        for option in &mut self.options {
            if let DhcpOption::MessageType(current) = option {
                if *current != kind {
                    *option = DhcpOption::MessageType(kind);
                }
                return;
            }
        }
        self.options.push(DhcpOption::MessageType(kind));
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::RequestedIpAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ServerIdentifier(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn client_identifier(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ClientIdentifier(bytes) => Some(bytes.as_slice()),
            _ => None,
        })
    }

    pub fn hostname(&self) -> Option<&str> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::HostName(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn parameter_request_list(&self) -> &[u8] {
        self.options
            .iter()
            .find_map(|option| match option {
                DhcpOption::ParameterRequestList(codes) => Some(codes.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn requests(&self, code: OptionCode) -> bool {
        self.parameter_request_list().contains(&(code as u8))
    }

    pub fn has_option(&self, code: u8) -> bool {
        self.options.iter().any(|option| option.code() == code)
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }

    /// The hardware address truncated to the advertised `hlen`.
    pub fn hardware_address(&self) -> &[u8] {
        let len = (self.hlen as usize).min(self.chaddr.len());
        &self.chaddr[..len]
    }

    pub fn hardware_display(&self) -> String {
        self.hardware_address()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Builds a reply skeleton mirroring the request per RFC 2131 table 3:
    /// same xid, flags, giaddr and hardware address, zeroed secs.
    pub fn reply_to(request: &DhcpMessage, kind: MessageType, yiaddr: Ipv4Addr) -> Self {
        let mut reply = Self {
            op: BOOT_REPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: String::new(),
            file: String::new(),
            options: Vec::new(),
        };
        reply.set_message_type(kind);
        reply
    }
}

/// Appends raw `(code, value)` fragments from one options buffer. Pad is
/// skipped, End stops the scan, and a missing End is tolerated when the
/// buffer is exhausted.
fn parse_fragments(data: &[u8], fragments: &mut Vec<(u8, Vec<u8>)>) -> Result<()> {
    let mut index = 0;
    while index < data.len() {
        let code = data[index];

        if code == OptionCode::Pad as u8 {
            index += 1;
            continue;
        }
        if code == OptionCode::End as u8 {
            break;
        }

        if index + 1 >= data.len() {
            return Err(Error::MalformedOption {
                code,
                reason: "length byte missing".to_string(),
            });
        }
        let length = data[index + 1] as usize;
        if index + 2 + length > data.len() {
            return Err(Error::MalformedOption {
                code,
                reason: "value truncated".to_string(),
            });
        }

        fragments.push((code, data[index + 2..index + 2 + length].to_vec()));
        index += 2 + length;
    }
    Ok(())
}

/// Concatenates fragments sharing a code (in first-appearance order) and
/// runs the typed decoder over each merged value. The overload option is
/// consumed by reassembly and never reaches the output list.
fn merge_fragments(fragments: Vec<(u8, Vec<u8>)>) -> Result<Vec<DhcpOption>> {
    let mut order: Vec<u8> = Vec::new();
    let mut merged: HashMap<u8, Vec<u8>> = HashMap::new();

    for (code, value) in fragments {
        if code == OptionCode::OptionOverload as u8 {
            continue;
        }
        let entry = merged.entry(code).or_insert_with(|| {
            order.push(code);
            Vec::new()
        });
        entry.extend_from_slice(&value);
    }

    let mut options = Vec::with_capacity(order.len());
    for code in order {
        let value = &merged[&code];
        options.push(DhcpOption::parse(code, value)?);
    }
    Ok(options)
}

fn terminated_text(data: &[u8]) -> String {
    let end = data.iter().position(|&byte| byte == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn copy_terminated(source: &[u8], target: &mut [u8]) {
    // Keep the final byte as the NUL terminator.
    let len = source.len().min(target.len() - 1);
    target[..len].copy_from_slice(&source[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discover_bytes() -> Vec<u8> {
        let mut packet = vec![0u8; 300];

        packet[0] = BOOT_REQUEST;
        packet[1] = HTYPE_ETHERNET;
        packet[2] = 6;
        packet[4..8].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        packet[10..12].copy_from_slice(&BROADCAST_FLAG.to_be_bytes());
        packet[28..34].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        packet[236..240].copy_from_slice(&MAGIC_COOKIE);

        packet[240] = 53;
        packet[241] = 1;
        packet[242] = MessageType::Discover as u8;
        packet[243] = 255;

        packet
    }

    #[test]
    fn test_parse_discover() {
        let message = DhcpMessage::parse(&discover_bytes()).unwrap();

        assert_eq!(message.op, BOOT_REQUEST);
        assert_eq!(message.xid, 0xDEADBEEF);
        assert!(message.is_broadcast());
        assert_eq!(message.message_type(), Some(MessageType::Discover));
        assert_eq!(message.hardware_display(), "aa:bb:cc:dd:ee:01");
    }

    #[test]
    fn test_short_packet_rejected() {
        assert!(DhcpMessage::parse(&[0u8; 100]).is_err());
    }

    #[test]
    fn test_bad_cookie_rejected() {
        let mut packet = discover_bytes();
        packet[236..240].copy_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            DhcpMessage::parse(&packet),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_missing_end_tolerated() {
        let mut packet = discover_bytes();
        packet.truncate(243);
        let message = DhcpMessage::parse(&packet).unwrap();
        assert_eq!(message.message_type(), Some(MessageType::Discover));
    }

    #[test]
    fn test_truncated_option_rejected() {
        let mut packet = discover_bytes();
        packet.truncate(244);
        packet[243] = 50;
        // Length byte says 4 but the buffer ends here.
        assert!(DhcpMessage::parse(&packet).is_err());
    }

    #[test]
    fn test_fragmented_option_reassembled() {
        let mut packet = discover_bytes();
        packet.truncate(243);
        // Parameter request list split across two TLVs.
        packet.extend_from_slice(&[55, 2, 1, 3]);
        packet.extend_from_slice(&[55, 1, 6]);
        packet.push(255);

        let message = DhcpMessage::parse(&packet).unwrap();
        assert_eq!(message.parameter_request_list(), &[1, 3, 6]);
    }

    #[test]
    fn test_sname_file_overload() {
        let mut packet = discover_bytes();
        packet.truncate(243);
        // Overload both legacy fields.
        packet.extend_from_slice(&[52, 1, 3]);
        packet.push(255);

        // Requested address in `file`, hostname in `sname`.
        packet[108] = 50;
        packet[109] = 4;
        packet[110..114].copy_from_slice(&[10, 0, 0, 105]);
        packet[114] = 255;

        packet[44] = 12;
        packet[45] = 4;
        packet[46..50].copy_from_slice(b"wopr");
        packet[50] = 255;

        let message = DhcpMessage::parse(&packet).unwrap();
        assert_eq!(message.requested_ip(), Some(Ipv4Addr::new(10, 0, 0, 105)));
        assert_eq!(message.hostname(), Some("wopr"));
        assert_eq!(message.sname, "");
        assert_eq!(message.file, "");
        // The overload marker itself is consumed by reassembly.
        assert!(!message.has_option(52));
    }

    #[test]
    fn test_overload_equivalent_to_inline() {
        let mut inline = discover_bytes();
        inline.truncate(243);
        inline.extend_from_slice(&[50, 4, 10, 0, 0, 105]);
        inline.extend_from_slice(&[12, 4, b'w', b'o', b'p', b'r']);
        inline.push(255);
        let inline = DhcpMessage::parse(&inline).unwrap();

        let mut overloaded = discover_bytes();
        overloaded.truncate(243);
        overloaded.extend_from_slice(&[52, 1, 3]);
        overloaded.push(255);
        overloaded[108..114].copy_from_slice(&[50, 4, 10, 0, 0, 105]);
        overloaded[114] = 255;
        overloaded[44..50].copy_from_slice(&[12, 4, b'w', b'o', b'p', b'r']);
        overloaded[50] = 255;
        let overloaded = DhcpMessage::parse(&overloaded).unwrap();

        assert_eq!(inline.options, overloaded.options);
    }

    #[test]
    fn test_overload_bad_length_rejected() {
        let mut packet = discover_bytes();
        packet.truncate(243);
        packet.extend_from_slice(&[52, 2, 3, 0]);
        packet.push(255);
        assert!(matches!(
            DhcpMessage::parse(&packet),
            Err(Error::MalformedOption { code: 52, .. })
        ));
    }

    #[test]
    fn test_legacy_fields_decode_without_overload() {
        let mut packet = discover_bytes();
        packet[44..51].copy_from_slice(b"server\0");
        packet[108..113].copy_from_slice(b"boot\0");
        let message = DhcpMessage::parse(&packet).unwrap();
        assert_eq!(message.sname, "server");
        assert_eq!(message.file, "boot");
    }

    #[test]
    fn test_encode_roundtrip() {
        let original = DhcpMessage::parse(&discover_bytes()).unwrap();
        let reparsed = DhcpMessage::parse(&original.encode(0)).unwrap();
        assert_eq!(original, reparsed);
    }

    #[test]
    fn test_encode_pads_to_minimum() {
        let message = DhcpMessage::parse(&discover_bytes()).unwrap();
        assert!(message.encode(312).len() >= 312);
        assert!(message.encode(600).len() >= 600);
    }

    #[test]
    fn test_long_value_split_and_reassembled() {
        let mut message = DhcpMessage::parse(&discover_bytes()).unwrap();
        message.options.push(DhcpOption::Generic(120, vec![0x5a; 300]));

        let encoded = message.encode(0);
        let reparsed = DhcpMessage::parse(&encoded).unwrap();
        assert_eq!(message, reparsed);
    }

    #[test]
    fn test_set_message_type_replaces() {
        let mut message = DhcpMessage::parse(&discover_bytes()).unwrap();
        message.set_message_type(MessageType::Offer);
        message.set_message_type(MessageType::Ack);

        let count = message
            .options
            .iter()
            .filter(|option| option.code() == 53)
            .count();
        assert_eq!(count, 1);
        assert_eq!(message.message_type(), Some(MessageType::Ack));
    }

    #[test]
    fn test_reply_mirrors_request() {
        let request = DhcpMessage::parse(&discover_bytes()).unwrap();
        let reply = DhcpMessage::reply_to(&request, MessageType::Offer, Ipv4Addr::new(10, 0, 0, 100));

        assert_eq!(reply.op, BOOT_REPLY);
        assert_eq!(reply.xid, request.xid);
        assert_eq!(reply.flags, request.flags);
        assert_eq!(reply.chaddr, request.chaddr);
        assert_eq!(reply.secs, 0);
        assert_eq!(reply.yiaddr, Ipv4Addr::new(10, 0, 0, 100));
        assert_eq!(reply.message_type(), Some(MessageType::Offer));
    }
}
