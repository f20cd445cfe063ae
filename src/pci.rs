//! PCI address parsing and config-space access.
//!
//! Bus discovery (scanning every device under `/sys/bus/pci/devices` to
//! find one matching a vendor/class) is out of scope — that is thin sysfs
//! iteration with no design content. What lives here is what a driver
//! needs once it already has one address: parse it, read its config
//! space, enable bus-master DMA, detach the kernel driver, map BAR0.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::ptr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{IxyError, Result};

const SYSFS_PCI_ROOT: &str = "/sys/bus/pci/devices";

static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:([0-9a-fA-F]{4}):)?([0-9a-fA-F]{2}):([0-9a-fA-F]{2})\.([0-9a-fA-F])$").unwrap()
});

/// A `[DDDD:]BB:DD.F` PCI bus/device/function address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    /// Parses a PCI address string, defaulting an omitted domain to 0x0000.
    ///
    /// Returns `ConfigurationFault` if the string does not match the
    /// `([0-9a-f]{4}:)?[0-9a-f]{2}:[0-9a-f]{2}\.[0-9a-f]` grammar, or if any
    /// field overflows its PCI-defined bit width (device: 5 bits, function:
    /// 3 bits).
    pub fn parse(s: &str) -> Result<PciAddress> {
        let caps = ADDRESS_RE
            .captures(s)
            .ok_or_else(|| IxyError::ConfigurationFault(format!("invalid PCI address <{s}>")))?;

        let domain = match caps.get(1) {
            Some(m) => u16::from_str_radix(m.as_str(), 16).unwrap(),
            None => 0,
        };
        let bus = u8::from_str_radix(&caps[2], 16).unwrap();
        let device = u8::from_str_radix(&caps[3], 16).unwrap();
        let function = u8::from_str_radix(&caps[4], 16).unwrap();

        if device >= 1 << 5 {
            return Err(IxyError::ConfigurationFault(format!(
                "device {device:#x} exceeds 5-bit range"
            )));
        }
        if function >= 1 << 3 {
            return Err(IxyError::ConfigurationFault(format!(
                "function {function:#x} exceeds 3-bit range"
            )));
        }

        Ok(PciAddress { domain, bus, device, function })
    }

    fn sysfs_path(&self) -> PathBuf {
        PathBuf::from(SYSFS_PCI_ROOT).join(self.to_string())
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:01x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// The first 64 bytes of a type-0 PCI configuration header, as read from
/// `<device>/config`. All multi-byte fields are little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciConfig {
    pub vendor_id: u16,
    pub device_id: u16,
    pub command: u16,
    pub status: u16,
    pub revision_id: u8,
    /// `(class << 16) | (subclass << 8) | prog_if`, e.g. `0x020000` for a
    /// network controller with subclass/prog_if both zero.
    pub class_code: u32,
    pub cache_line_size: u8,
    pub latency_timer: u8,
    pub header_type: u8,
    pub bist: u8,
    pub base_address_registers: [u32; 6],
    pub cardbus_cis_pointer: u32,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub expansion_rom_base_address: u32,
    pub capabilities_pointer: u8,
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
    pub min_grant: u8,
    pub max_latency: u8,
}

/// Vendor id of Intel NICs (ixgbe lives here).
pub const VENDOR_INTEL: u16 = 0x8086;
/// Vendor id of the virtio standard device family.
pub const VENDOR_VIRTIO: u16 = 0x1AF4;

impl PciConfig {
    /// Decodes a 64-byte (or larger) little-endian config-space buffer.
    pub fn decode(buf: &[u8]) -> Result<PciConfig> {
        if buf.len() < 64 {
            return Err(IxyError::ConfigurationFault(
                "config space buffer shorter than 64 bytes".into(),
            ));
        }
        let u16_at = |o: usize| u16::from_le_bytes([buf[o], buf[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);

        let mut bars = [0u32; 6];
        for (i, bar) in bars.iter_mut().enumerate() {
            *bar = u32_at(0x10 + i * 4);
        }

        Ok(PciConfig {
            vendor_id: u16_at(0x00),
            device_id: u16_at(0x02),
            command: u16_at(0x04),
            status: u16_at(0x06),
            revision_id: buf[0x08],
            class_code: u32_at(0x08) >> 8,
            cache_line_size: buf[0x0C],
            latency_timer: buf[0x0D],
            header_type: buf[0x0E],
            bist: buf[0x0F],
            base_address_registers: bars,
            cardbus_cis_pointer: u32_at(0x28),
            subsystem_vendor_id: u16_at(0x2C),
            subsystem_id: u16_at(0x2E),
            expansion_rom_base_address: u32_at(0x30),
            capabilities_pointer: buf[0x34],
            interrupt_line: buf[0x3C],
            interrupt_pin: buf[0x3D],
            min_grant: buf[0x3E],
            max_latency: buf[0x3F],
        })
    }
}

/// A handle to one, already-addressed PCI device: its config-space file and
/// (once mapped) its BAR0 window.
pub struct PciDevice {
    addr: PciAddress,
    path: PathBuf,
}

impl PciDevice {
    /// Opens the device at `addr` and reads its config header to confirm it
    /// exists. Does not touch the kernel driver or map any memory yet.
    pub fn open(addr: PciAddress) -> Result<PciDevice> {
        let path = addr.sysfs_path();
        if !path.exists() {
            return Err(IxyError::ConfigurationFault(format!(
                "no PCI device at {addr}"
            )));
        }
        Ok(PciDevice { addr, path })
    }

    pub fn address(&self) -> PciAddress {
        self.addr
    }

    fn config_path(&self) -> PathBuf {
        self.path.join("config")
    }

    /// Reads and decodes the device's configuration header.
    pub fn read_config(&self) -> Result<PciConfig> {
        let mut file = File::open(self.config_path())?;
        let mut buf = [0u8; 64];
        file.read_exact(&mut buf)?;
        PciConfig::decode(&buf)
    }

    /// Sets bit 2 (bus master enable) in the 16-bit command register at
    /// config-space offset 4.
    pub fn enable_dma(&self) -> Result<()> {
        const COMMAND_OFFSET: u64 = 4;
        const BUS_MASTER_ENABLE: u16 = 1 << 2;

        let mut file = OpenOptions::new().read(true).write(true).open(self.config_path())?;
        file.seek(SeekFrom::Start(COMMAND_OFFSET))?;
        let mut raw = [0u8; 2];
        file.read_exact(&mut raw)?;
        let command = u16::from_le_bytes(raw) | BUS_MASTER_ENABLE;

        file.seek(SeekFrom::Start(COMMAND_OFFSET))?;
        file.write_all(&command.to_le_bytes())?;
        Ok(())
    }

    /// Detaches whatever kernel driver currently owns this device. A device
    /// with nothing bound is not an error.
    pub fn unbind_driver(&self) -> Result<()> {
        let unbind_path = self.path.join("driver").join("unbind");
        if !unbind_path.exists() {
            return Ok(());
        }
        let mut file = OpenOptions::new().write(true).open(unbind_path)?;
        write!(file, "{}", self.addr)?;
        Ok(())
    }

    /// Memory-maps `resource0` (BAR0) read/write and returns its base
    /// pointer and byte length.
    pub fn map_resource0(&self) -> Result<(*mut u8, usize)> {
        let resource_path = self.path.join("resource0");
        let len = fs::metadata(&resource_path)?.len() as usize;
        let file = OpenOptions::new().read(true).write(true).open(&resource_path)?;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(IxyError::IoFault(std::io::Error::last_os_error()));
        }
        Ok((ptr as *mut u8, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_address_without_domain() {
        let addr = PciAddress::parse("00:15.0").unwrap();
        assert_eq!(addr, PciAddress { domain: 0, bus: 0x00, device: 0x15, function: 0 });
    }

    #[test]
    fn parses_address_with_domain() {
        let addr = PciAddress::parse("0000:00:15.0").unwrap();
        assert_eq!(addr, PciAddress { domain: 0, bus: 0, device: 0x15, function: 0 });
        assert_eq!(addr.to_string(), "0000:00:15.0");
    }

    #[test]
    fn rejects_malformed_address() {
        assert!(PciAddress::parse("00ff:ff:33:3").is_err());
    }

    #[test]
    fn decodes_config_header() {
        let mut buf = [0u8; 64];
        buf[0..2].copy_from_slice(&0x1AF4u16.to_le_bytes());
        buf[2..4].copy_from_slice(&0x1000u16.to_le_bytes());
        // class_code=0x020000 -> class=0x02, subclass=0x00, prog_if=0x00,
        // packed into the little-endian dword at offset 0x08 shifted by 8.
        buf[0x09] = 0x00; // prog_if
        buf[0x0A] = 0x00; // subclass
        buf[0x0B] = 0x02; // class
        let cfg = PciConfig::decode(&buf).unwrap();
        assert_eq!(cfg.vendor_id, 0x1AF4);
        assert_eq!(cfg.device_id, 0x1000);
        assert_eq!(cfg.class_code, 0x020000);
    }
}
