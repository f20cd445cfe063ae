//! Userspace, poll-mode driver core for the Intel 82599 (ixgbe) and legacy
//! virtio-net families: no interrupts, no kernel driver once bound, batched
//! RX/TX on whatever core calls in.

pub mod device;
pub mod error;
pub mod ixgbe;
pub mod memory;
pub mod mmio;
pub mod pci;
pub mod stats;
pub mod virtio;

pub use device::{Device, IxyDevice, Packet};
pub use error::{IxyError, Result};
pub use pci::PciAddress;

use crate::ixgbe::IxgbeDevice;
use crate::pci::{PciDevice, VENDOR_INTEL, VENDOR_VIRTIO};
use crate::virtio::VirtioDevice;

/// Opens the NIC at `addr` with one RX and one TX queue. Dispatches to the
/// ixgbe or virtio-net driver by PCI vendor id; see `open_with_queues` for
/// ixgbe's multi-queue support (virtio-net has none).
pub fn open(addr: PciAddress) -> Result<Device> {
    open_with_queues(addr, 1, 1)
}

/// As `open`, but lets ixgbe callers request more than one RX/TX queue.
/// virtio-net ignores both counts: the legacy device exposes exactly one
/// queue pair plus the control queue.
pub fn open_with_queues(addr: PciAddress, num_rx_queues: u16, num_tx_queues: u16) -> Result<Device> {
    let probe = PciDevice::open(addr)?;
    let config = probe.read_config()?;
    match config.vendor_id {
        VENDOR_INTEL => Ok(Device::Ixgbe(IxgbeDevice::init(addr, num_rx_queues, num_tx_queues)?)),
        VENDOR_VIRTIO => Ok(Device::Virtio(VirtioDevice::init(addr)?)),
        other => Err(IxyError::ConfigurationFault(format!(
            "device {addr} (vendor {other:#06x}) is neither ixgbe nor virtio-net"
        ))),
    }
}
