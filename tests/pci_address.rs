//! S1 and invariant 1: PCI address parse/format round-trip.

use ixy_rs::PciAddress;
use proptest::prelude::*;

#[test]
fn s1_parses_address_without_domain_and_formats_with_one() {
    let addr = PciAddress::parse("0000:00:15.0").unwrap();
    assert_eq!(addr.domain, 0);
    assert_eq!(addr.bus, 0);
    assert_eq!(addr.device, 0x15);
    assert_eq!(addr.function, 0);
    assert_eq!(addr.to_string(), "0000:00:15.0");
}

#[test]
fn s1_rejects_malformed_address() {
    assert!(PciAddress::parse("00ff:ff:33:3").is_err());
}

proptest! {
    #[test]
    fn invariant1_parse_format_round_trips(
        domain in 0u16..=0xFFFF,
        bus in 0u8..=0xFF,
        device in 0u8..(1 << 5),
        function in 0u8..(1 << 3),
    ) {
        let s = format!("{domain:04x}:{bus:02x}:{device:02x}.{function:01x}");
        let parsed = PciAddress::parse(&s).unwrap();
        let reformatted = parsed.to_string();
        let reparsed = PciAddress::parse(&reformatted).unwrap();
        prop_assert_eq!(parsed, reparsed);
    }
}
