//! The capability set shared by both drivers, and the thin enum that lets
//! calling code hold either one without caring which.

use std::collections::VecDeque;

use crate::error::Result;
use crate::ixgbe::IxgbeDevice;
use crate::memory::Buffer;
use crate::pci::PciAddress;
use crate::stats::DeviceStats;
use crate::virtio::VirtioDevice;

/// A packet in flight: a pool-backed buffer, nothing more.
pub type Packet = Buffer;

/// Operations every driver variant exposes to application code.
///
/// `rx_batch` appends received packets into the caller's `buffer` rather
/// than returning a freshly allocated `Vec`, and `tx_batch` takes its input
/// by mutable reference, so a short count leaves the unsent buffers in the
/// caller's queue to retry or pass to `tx_batch_busy_wait`.
pub trait IxyDevice {
    fn rx_batch(&mut self, queue_id: u16, buffer: &mut VecDeque<Packet>, num_packets: usize) -> usize;
    fn tx_batch(&mut self, queue_id: u16, packets: &mut VecDeque<Packet>) -> usize;
    fn tx_batch_busy_wait(&mut self, queue_id: u16, packets: &mut VecDeque<Packet>);
    fn set_promisc(&mut self, enabled: bool) -> Result<()>;
    fn read_stats(&self, stats: &mut DeviceStats);
    fn get_link_speed(&self) -> u16;
}

/// Either backing driver, chosen at `open` time by the PCI vendor id.
pub enum Device {
    Ixgbe(IxgbeDevice),
    Virtio(VirtioDevice),
}

impl Device {
    pub fn address(&self) -> PciAddress {
        match self {
            Device::Ixgbe(d) => d.address(),
            Device::Virtio(d) => d.address(),
        }
    }
}

impl IxyDevice for Device {
    fn rx_batch(&mut self, queue_id: u16, buffer: &mut VecDeque<Packet>, num_packets: usize) -> usize {
        match self {
            Device::Ixgbe(d) => d.rx_batch(queue_id, buffer, num_packets),
            Device::Virtio(d) => d.rx_batch(queue_id, buffer, num_packets),
        }
    }

    fn tx_batch(&mut self, queue_id: u16, packets: &mut VecDeque<Packet>) -> usize {
        match self {
            Device::Ixgbe(d) => d.tx_batch(queue_id, packets),
            Device::Virtio(d) => d.tx_batch(queue_id, packets),
        }
    }

    fn tx_batch_busy_wait(&mut self, queue_id: u16, packets: &mut VecDeque<Packet>) {
        match self {
            Device::Ixgbe(d) => d.tx_batch_busy_wait(queue_id, packets),
            Device::Virtio(d) => d.tx_batch_busy_wait(queue_id, packets),
        }
    }

    fn set_promisc(&mut self, enabled: bool) -> Result<()> {
        match self {
            Device::Ixgbe(d) => d.set_promisc(enabled),
            Device::Virtio(d) => d.set_promisc(enabled),
        }
    }

    fn read_stats(&self, stats: &mut DeviceStats) {
        match self {
            Device::Ixgbe(d) => d.read_stats(stats),
            Device::Virtio(d) => d.read_stats(stats),
        }
    }

    fn get_link_speed(&self) -> u16 {
        match self {
            Device::Ixgbe(d) => d.get_link_speed(),
            Device::Virtio(d) => d.get_link_speed(),
        }
    }
}
