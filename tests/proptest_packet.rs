use std::net::Ipv4Addr;

use proptest::prelude::*;

use dhcpserve::hex::{bytes_to_hex_string, hex_string_to_bytes};
use dhcpserve::options::DhcpString;
use dhcpserve::packet::Opcode;
use dhcpserve::{DhcpOption, DhcpPacket, MessageType};

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const DHCP_FIXED_HEADER_SIZE: usize = 240;

fn valid_header() -> Vec<u8> {
    let mut packet = vec![0u8; DHCP_FIXED_HEADER_SIZE];
    packet[0] = 1;
    packet[1] = 1;
    packet[2] = 6;
    packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
    packet
}

fn message_type() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Discover),
        Just(MessageType::Offer),
        Just(MessageType::Request),
        Just(MessageType::Decline),
        Just(MessageType::Ack),
        Just(MessageType::Nak),
        Just(MessageType::Release),
        Just(MessageType::Inform),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2000))]

    #[test]
    fn parse_never_panics_on_arbitrary_bytes(data: Vec<u8>) {
        let _ = DhcpPacket::parse(&data);
    }

    #[test]
    fn parse_never_panics_on_valid_header_with_random_options(
        options_data in prop::collection::vec(any::<u8>(), 0..512)
    ) {
        let mut packet = valid_header();
        packet.extend_from_slice(&options_data);
        let _ = DhcpPacket::parse(&packet);
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
        let _ = DhcpPacket::parse(&packet);
    }

    #[test]
    fn parse_never_panics_on_overloaded_fields(
        overload_flag in 0u8..=3,
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
        let _ = DhcpPacket::parse(&packet);
    }

    #[test]
    fn roundtrip_preserves_fields_and_options(
        message_type in message_type(),
        host_name in "[a-zA-Z0-9-]{0,63}",
        zero_terminated in any::<bool>(),
        lease_time in any::<u32>(),
        xid in any::<u32>(),
        secs in any::<u16>(),
        broadcast in any::<bool>(),
        addresses in any::<[[u8; 4]; 4]>(),
        chaddr in prop::collection::vec(any::<u8>(), 0..=16),
        sname in "[a-z0-9.]{0,40}",
        file in "[a-z0-9./]{0,100}",
        minimum_size in 312usize..1500,
    ) {
        let host_name = DhcpString {
            text: host_name,
            zero_terminated,
        };
        let packet = DhcpPacket {
            op: Opcode::BootRequest,
            htype: 1,
            hops: 0,
            xid,
            secs,
            broadcast,
            ciaddr: Ipv4Addr::from(addresses[0]),
            yiaddr: Ipv4Addr::from(addresses[1]),
            siaddr: Ipv4Addr::from(addresses[2]),
            giaddr: Ipv4Addr::from(addresses[3]),
            chaddr,
            sname,
            file,
            options: vec![
                DhcpOption::MessageType(message_type),
                DhcpOption::HostName(host_name),
                DhcpOption::LeaseTime(lease_time),
            ],
        };

        let encoded = packet.encode_with_minimum(minimum_size);
        prop_assert!(encoded.len() >= minimum_size);

        let decoded = DhcpPacket::parse(&encoded).unwrap();
        prop_assert_eq!(decoded, packet);
    }

    #[test]
    fn short_packets_always_rejected(
        data in prop::collection::vec(any::<u8>(), 0..240)
    ) {
        prop_assert!(DhcpPacket::parse(&data).is_err());
    }

    #[test]
    fn bad_magic_cookie_always_rejected(
        cookie in any::<[u8; 4]>()
    ) {
        prop_assume!(cookie != DHCP_MAGIC_COOKIE);

        let mut packet = valid_header();
        packet[236..240].copy_from_slice(&cookie);
        packet.push(255);

        prop_assert!(DhcpPacket::parse(&packet).is_err());
    }

    #[test]
    fn excessive_hops_always_rejected(
        hops in 17u8..=255
    ) {
        let mut packet = valid_header();
        packet[3] = hops;
        packet.push(255);

        prop_assert!(DhcpPacket::parse(&packet).is_err());
    }

    #[test]
    fn hex_helpers_are_inverse(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let text = bytes_to_hex_string(&bytes, ":");
        prop_assert_eq!(hex_string_to_bytes(&text), bytes.clone());

        let compact = bytes_to_hex_string(&bytes, "");
        prop_assert_eq!(hex_string_to_bytes(&compact), bytes);
    }

    #[test]
    fn hex_odd_trailing_nibble_is_dropped(
        bytes in prop::collection::vec(any::<u8>(), 0..32),
        nibble in "[0-9a-f]",
    ) {
        let text = format!("{}{}", bytes_to_hex_string(&bytes, ""), nibble);
        prop_assert_eq!(hex_string_to_bytes(&text), bytes);
    }
}
