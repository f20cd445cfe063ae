//! S2: config-space decode from a literal byte pattern.

use ixy_rs::pci::PciConfig;

#[test]
fn s2_decodes_vendor_device_and_class_code() {
    let mut buf = [0u8; 64];
    buf[0..2].copy_from_slice(&0x1AF4u16.to_le_bytes());
    buf[2..4].copy_from_slice(&0x1000u16.to_le_bytes());
    // class_code = 0x020000: class=0x02, subclass=0x00, prog_if=0x00.
    buf[0x09] = 0x00;
    buf[0x0A] = 0x00;
    buf[0x0B] = 0x02;

    let cfg = PciConfig::decode(&buf).unwrap();
    assert_eq!(cfg.vendor_id, 0x1AF4);
    assert_eq!(cfg.device_id, 0x1000);
    assert_eq!(cfg.class_code, 0x020000);
}

#[test]
fn rejects_short_buffer() {
    let buf = [0u8; 32];
    assert!(PciConfig::decode(&buf).is_err());
}
