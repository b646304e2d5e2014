use proptest::prelude::*;

use leasehold::DhcpMessage;

const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
const FIXED_HEADER_SIZE: usize = 240;

fn valid_header() -> Vec<u8> {
    let mut packet = vec![0u8; FIXED_HEADER_SIZE];
    packet[0] = 1;
    packet[1] = 1;
    packet[2] = 6;
    packet[236..240].copy_from_slice(&MAGIC_COOKIE);
    packet
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10000))]

    #[test]
    fn parse_never_panics_on_arbitrary_bytes(data: Vec<u8>) {
        let _ = DhcpMessage::parse(&data);
    }

    #[test]
    fn parse_never_panics_on_valid_header_with_random_options(
        options_data in prop::collection::vec(any::<u8>(), 0..512)
    ) {
        let mut packet = valid_header();
        packet.extend_from_slice(&options_data);
        let _ = DhcpMessage::parse(&packet);
    }

    #[test]
    fn parse_never_panics_on_corrupted_header(
        corrupted_bytes in prop::collection::vec(any::<u8>(), 240..600),
        corruption_indices in prop::collection::vec(0usize..240, 1..10),
        corruption_values in prop::collection::vec(any::<u8>(), 1..10)
    ) {
        let mut packet = corrupted_bytes;
        packet[236..240].copy_from_slice(&MAGIC_COOKIE);
        for (index, value) in corruption_indices.iter().zip(corruption_values.iter()) {
            if *index < packet.len() {
                packet[*index] = *value;
            }
        }
        let _ = DhcpMessage::parse(&packet);
    }

    #[test]
    fn parse_never_panics_on_random_option_lengths(
        option_code in 1u8..254,
        option_length in any::<u8>(),
        option_data in prop::collection::vec(any::<u8>(), 0..256)
    ) {
        let mut packet = valid_header();
        packet.push(option_code);
        packet.push(option_length);
        let actual_len = (option_length as usize).min(option_data.len());
        packet.extend_from_slice(&option_data[..actual_len]);
        packet.push(255);
        let _ = DhcpMessage::parse(&packet);
    }

    #[test]
    fn parse_never_panics_on_random_overload_buffers(
        overload_flag in 1u8..=3,
        sname_data in prop::collection::vec(any::<u8>(), 64..=64),
        file_data in prop::collection::vec(any::<u8>(), 128..=128)
    ) {
        let mut packet = valid_header();
        packet[44..108].copy_from_slice(&sname_data);
        packet[108..236].copy_from_slice(&file_data);
        packet.push(52);
        packet.push(1);
        packet.push(overload_flag);
        packet.push(255);
        let _ = DhcpMessage::parse(&packet);
    }

    #[test]
    fn roundtrip_preserves_header_fields(
        xid in any::<u32>(),
        secs in any::<u16>(),
        flags in any::<u16>(),
        ciaddr in any::<[u8; 4]>(),
        yiaddr in any::<[u8; 4]>(),
        siaddr in any::<[u8; 4]>(),
        giaddr in any::<[u8; 4]>(),
        chaddr in any::<[u8; 16]>(),
    ) {
        let mut packet = valid_header();
        packet[4..8].copy_from_slice(&xid.to_be_bytes());
        packet[8..10].copy_from_slice(&secs.to_be_bytes());
        packet[10..12].copy_from_slice(&flags.to_be_bytes());
        packet[12..16].copy_from_slice(&ciaddr);
        packet[16..20].copy_from_slice(&yiaddr);
        packet[20..24].copy_from_slice(&siaddr);
        packet[24..28].copy_from_slice(&giaddr);
        packet[28..44].copy_from_slice(&chaddr);
        packet.push(255);

        let parsed = DhcpMessage::parse(&packet).unwrap();
        let reparsed = DhcpMessage::parse(&parsed.encode(0)).unwrap();

        prop_assert_eq!(parsed.xid, reparsed.xid);
        prop_assert_eq!(parsed.secs, reparsed.secs);
        prop_assert_eq!(parsed.flags, reparsed.flags);
        prop_assert_eq!(parsed.ciaddr, reparsed.ciaddr);
        prop_assert_eq!(parsed.yiaddr, reparsed.yiaddr);
        prop_assert_eq!(parsed.siaddr, reparsed.siaddr);
        prop_assert_eq!(parsed.giaddr, reparsed.giaddr);
        prop_assert_eq!(parsed.chaddr, reparsed.chaddr);
    }

    #[test]
    fn roundtrip_preserves_decoded_options(
        requested in any::<[u8; 4]>(),
        hostname in "[a-z][a-z0-9-]{0,30}",
        parameters in prop::collection::vec(any::<u8>(), 0..32),
        generic_code in 96u8..=223,
        generic_value in prop::collection::vec(any::<u8>(), 0..300),
    ) {
        let mut packet = valid_header();
        packet.push(53);
        packet.push(1);
        packet.push(1);
        packet.push(50);
        packet.push(4);
        packet.extend_from_slice(&requested);
        packet.push(12);
        packet.push(hostname.len() as u8);
        packet.extend_from_slice(hostname.as_bytes());
        if !parameters.is_empty() {
            packet.push(55);
            packet.push(parameters.len() as u8);
            packet.extend_from_slice(&parameters);
        }
        for chunk in generic_value.chunks(255) {
            packet.push(generic_code);
            packet.push(chunk.len() as u8);
            packet.extend_from_slice(chunk);
        }
        packet.push(255);

        let parsed = DhcpMessage::parse(&packet).unwrap();
        let reparsed = DhcpMessage::parse(&parsed.encode(0)).unwrap();
        prop_assert_eq!(parsed.options, reparsed.options);
    }

    #[test]
    fn encode_honors_minimum_size(
        xid in any::<u32>(),
        minimum in 0usize..1024,
    ) {
        let mut packet = valid_header();
        packet[4..8].copy_from_slice(&xid.to_be_bytes());
        packet.push(255);

        let parsed = DhcpMessage::parse(&packet).unwrap();
        prop_assert!(parsed.encode(minimum).len() >= minimum);
    }

    #[test]
    fn short_packets_always_rejected(
        data in prop::collection::vec(any::<u8>(), 0..240)
    ) {
        prop_assert!(DhcpMessage::parse(&data).is_err());
    }

    #[test]
    fn bad_magic_cookie_always_rejected(
        cookie in any::<[u8; 4]>()
    ) {
        prop_assume!(cookie != MAGIC_COOKIE);

        let mut packet = valid_header();
        packet[236..240].copy_from_slice(&cookie);
        packet.push(255);

        prop_assert!(DhcpMessage::parse(&packet).is_err());
    }
}
