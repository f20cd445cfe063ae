//! Driver for legacy (0.9.5) virtio-net devices: the register handshake,
//! per-vq setup, and the RX/TX/control batch paths.

pub mod constants;
pub mod queue;

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use constants::*;
use queue::VRing;

use crate::device::Packet;
use crate::error::{IxyError, Result};
use crate::memory::{free_to_home_pool, Pool};
use crate::mmio::Mmio;
use crate::pci::{PciAddress, PciDevice, VENDOR_VIRTIO};
use crate::stats::DeviceStats;

struct VirtQueue {
    ring: VRing,
    bufs_in_use: Vec<Option<Packet>>,
    used_last: u16,
    pool: Option<Arc<Pool>>,
}

impl VirtQueue {
    fn find_free_descriptor(&self, from: usize) -> Option<usize> {
        (0..self.ring.size()).map(|i| (from + i) % self.ring.size()).find(|&i| self.ring.is_desc_free(i))
    }

    /// First index of `count` consecutive free slots, not wrapping — used
    /// only by the control path, which never has more than one command in
    /// flight at a time.
    fn find_free_chain(&self, count: usize) -> Option<usize> {
        (0..=self.ring.size().saturating_sub(count))
            .find(|&start| (start..start + count).all(|i| self.ring.is_desc_free(i)))
    }
}

/// Writes the legacy `virtio_net_hdr` into the tail of a buffer's 40-byte
/// scratch area, immediately before the payload. The descriptor backing
/// offset (`NET_HDR_STRUCT_LEN`) is the struct's real size, not the
/// semantic `hdr_len` value stored inside it — using the latter as an
/// offset would run two bytes into the buffer's `payload size` header.
fn write_net_header(buf: &mut Packet) {
    let scratch = buf.virtio_header_scratch_mut();
    let start = scratch.len() - NET_HDR_STRUCT_LEN;
    let hdr = &mut scratch[start..start + NET_HDR_STRUCT_LEN];
    hdr[0] = 0; // flags
    hdr[1] = GSO_NONE;
    hdr[2..4].copy_from_slice(&(NET_HDR_LEN as u16).to_le_bytes());
    hdr[4..6].copy_from_slice(&0u16.to_le_bytes()); // gso_size
    hdr[6..8].copy_from_slice(&0u16.to_le_bytes()); // csum_start
    hdr[8..10].copy_from_slice(&0u16.to_le_bytes()); // csum_offset
}

pub struct VirtioDevice {
    pci: PciDevice,
    mmio: Mmio,
    rx: VirtQueue,
    tx: VirtQueue,
    ctrl: VirtQueue,
}

impl VirtioDevice {
    pub fn init(addr: PciAddress) -> Result<VirtioDevice> {
        let pci = PciDevice::open(addr)?;
        let config = pci.read_config()?;
        if config.vendor_id != VENDOR_VIRTIO {
            return Err(IxyError::ConfigurationFault(format!(
                "device {addr} (vendor {:#06x}) is not a virtio device",
                config.vendor_id
            )));
        }
        if config.device_id != LEGACY_DEVICE_ID {
            return Err(IxyError::ConfigurationFault(format!(
                "device {addr} (device id {:#06x}) is not legacy virtio-net",
                config.device_id
            )));
        }

        pci.unbind_driver()?;
        pci.enable_dma()?;
        let (base, len) = pci.map_resource0()?;
        let mmio = unsafe { Mmio::new(base, len) };

        reset_device(&mmio);
        mmio.set8(STATUS, STATUS_ACKNOWLEDGE);
        mmio.set8(STATUS, STATUS_ACKNOWLEDGE | STATUS_DRIVER);
        negotiate_features(&mmio)?;

        let rx = build_queue(&mmio, VQ_RX, true)?;
        let tx = build_queue(&mmio, VQ_TX, false)?;
        let ctrl = build_queue(&mmio, VQ_CONTROL, true)?;

        mmio.set8(STATUS, STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_DRIVER_OK);
        if mmio.get8(STATUS) & STATUS_FAILED != 0 {
            return Err(IxyError::DeviceFault("device reports STATUS_FAILED".into()));
        }

        let mut dev = VirtioDevice { pci, mmio, rx, tx, ctrl };
        dev.set_promisc(true)?;
        Ok(dev)
    }

    pub fn address(&self) -> PciAddress {
        self.pci.address()
    }
}

fn reset_device(mmio: &Mmio) {
    mmio.set8(STATUS, 0);
    while mmio.get8(STATUS) != 0 {
        thread::sleep(Duration::from_millis(10));
    }
}

fn negotiate_features(mmio: &Mmio) -> Result<()> {
    let host_features = mmio.get(HOST_FEATURES);
    if host_features & REQUIRED_FEATURES != REQUIRED_FEATURES {
        return Err(IxyError::ConfigurationFault(
            "device does not offer the required virtio-net features".into(),
        ));
    }
    mmio.set(GUEST_FEATURES, REQUIRED_FEATURES);
    Ok(())
}

fn build_queue(mmio: &Mmio, id: u16, with_pool: bool) -> Result<VirtQueue> {
    mmio.set16(QUEUE_SEL, id);
    let max_size = mmio.get16(QUEUE_NUM) as usize;
    if max_size == 0 || max_size & (max_size - 1) != 0 {
        return Err(IxyError::ConfigurationFault(format!(
            "virtqueue {id} reports non-power-of-two size {max_size}"
        )));
    }

    // Not otherwise used: the legacy handshake has no per-queue doorbell
    // offset, but setup reads this register for parity with the source.
    let _notify_offset = mmio.get16(QUEUE_NOTIFY);

    let ring = VRing::allocate(max_size)?;
    mmio.set(QUEUE_PFN, ring.pfn());
    ring.set_avail_flags(AVAIL_F_NO_INTERRUPT);

    let pool = if with_pool {
        let multiplier = if id == VQ_CONTROL { 1 } else { 4 };
        Some(Pool::allocate(max_size * multiplier, 0)?)
    } else {
        None
    };

    Ok(VirtQueue { ring, bufs_in_use: (0..max_size).map(|_| None).collect(), used_last: 0, pool })
}

impl crate::device::IxyDevice for VirtioDevice {
    fn rx_batch(&mut self, _queue_id: u16, buffer: &mut VecDeque<Packet>, num_packets: usize) -> usize {
        let queue = &mut self.rx;
        let mut received = 0;

        let vring_used_index = queue.ring.used_index();
        for _ in 0..num_packets {
            if queue.used_last == vring_used_index {
                break;
            }
            let (desc_id, length) = queue.ring.used_element(queue.used_last);
            queue.used_last = queue.used_last.wrapping_add(1);

            let desc_id = desc_id as usize;
            if queue.ring.desc_flags(desc_id) != DESC_F_WRITE {
                log::error!("unexpected rx descriptor flags on slot {desc_id}");
            }
            queue.ring.reset_desc(desc_id);

            let mut buf = match queue.bufs_in_use[desc_id].take() {
                Some(buf) => buf,
                None => {
                    log::error!("rx descriptor {desc_id} had no parked buffer");
                    continue;
                }
            };
            buf.set_size(length.saturating_sub(NET_HDR_STRUCT_LEN as u32));
            buffer.push_back(buf);
            received += 1;
        }

        let pool = queue.pool.as_ref().expect("rx queue always has a pool").clone();
        // Descriptor length is the buffer's full receivable capacity, not
        // its (still zero) logical size field: the device fills in how much
        // it actually wrote, reported back through the used ring's length.
        let capacity = pool.payload_capacity() as u32;
        let mut replenished = false;
        for i in 0..queue.ring.size() {
            if !queue.ring.is_desc_free(i) {
                continue;
            }
            let mut fresh = match pool.get() {
                Some(buf) => buf,
                None => break,
            };
            write_net_header(&mut fresh);
            let addr = fresh.data_addr() - NET_HDR_STRUCT_LEN as u64;
            let len = capacity + NET_HDR_STRUCT_LEN as u32;
            queue.ring.set_desc(i, addr, len, DESC_F_WRITE, 0);
            queue.bufs_in_use[i] = Some(fresh);
            queue.ring.publish_avail(i as u16);
            replenished = true;
        }
        if replenished {
            self.mmio.set16(QUEUE_NOTIFY, VQ_RX);
        }

        received
    }

    fn tx_batch(&mut self, _queue_id: u16, packets: &mut VecDeque<Packet>) -> usize {
        let queue = &mut self.tx;

        while queue.used_last != queue.ring.used_index() {
            let (desc_id, _len) = queue.ring.used_element(queue.used_last);
            queue.used_last = queue.used_last.wrapping_add(1);
            let desc_id = desc_id as usize;
            queue.ring.reset_desc(desc_id);
            if let Some(buf) = queue.bufs_in_use[desc_id].take() {
                free_to_home_pool(buf);
            }
        }

        let mut sent = 0;
        let mut cursor = 0;
        while !packets.is_empty() {
            let slot = match queue.find_free_descriptor(cursor) {
                Some(slot) => slot,
                None => break,
            };
            let mut packet = packets.pop_front().expect("checked non-empty above");
            write_net_header(&mut packet);
            let addr = packet.data_addr() - NET_HDR_STRUCT_LEN as u64;
            let len = packet.size() + NET_HDR_STRUCT_LEN as u32;
            queue.ring.set_desc(slot, addr, len, 0, 0);
            queue.bufs_in_use[slot] = Some(packet);
            queue.ring.publish_avail(slot as u16);
            cursor = (slot + 1) % queue.ring.size();
            sent += 1;
        }

        if sent > 0 {
            self.mmio.set16(QUEUE_NOTIFY, VQ_TX);
        }
        sent
    }

    fn tx_batch_busy_wait(&mut self, queue_id: u16, packets: &mut VecDeque<Packet>) {
        while !packets.is_empty() {
            self.tx_batch(queue_id, packets);
        }
    }

    fn set_promisc(&mut self, enabled: bool) -> Result<()> {
        let pool = self.ctrl.pool.as_ref().expect("control queue always has a pool").clone();
        let mut buf = pool
            .get()
            .ok_or_else(|| IxyError::ResourceExhaustion("control pool exhausted".into()))?;
        buf.set_size(4);
        {
            let payload = buf.payload_mut();
            payload[0] = CTRL_CLASS_RX;
            payload[1] = CTRL_CMD_RX_PROMISC;
            payload[2] = u8::from(enabled);
            payload[3] = 0;
        }
        let base = buf.data_addr();

        let header_idx = self
            .ctrl
            .find_free_chain(3)
            .ok_or_else(|| IxyError::ResourceExhaustion("control queue full".into()))?;
        let payload_idx = header_idx + 1;
        let ack_idx = header_idx + 2;

        self.ctrl.ring.set_desc(header_idx, base, 2, DESC_F_NEXT, payload_idx as u16);
        self.ctrl.ring.set_desc(payload_idx, base + 2, 1, DESC_F_NEXT, ack_idx as u16);
        self.ctrl.ring.set_desc(ack_idx, base + 3, 1, DESC_F_WRITE, 0);
        self.ctrl.bufs_in_use[header_idx] = Some(buf);

        let target = self.ctrl.ring.used_index().wrapping_add(1);
        self.ctrl.ring.publish_avail(header_idx as u16);
        self.mmio.set16(QUEUE_NOTIFY, VQ_CONTROL);

        while self.ctrl.ring.used_index() != target {
            std::hint::spin_loop();
        }
        self.ctrl.used_last = self.ctrl.used_last.wrapping_add(1);

        let buf = self.ctrl.bufs_in_use[header_idx].take().expect("just parked above");
        let ack = buf.payload()[3];
        if ack != CTRL_ACK_OK {
            log::warn!("set_promisc: device returned ack {ack:#x}");
        }
        free_to_home_pool(buf);

        self.ctrl.ring.reset_desc(header_idx);
        self.ctrl.ring.reset_desc(payload_idx);
        self.ctrl.ring.reset_desc(ack_idx);

        Ok(())
    }

    fn read_stats(&self, _stats: &mut DeviceStats) {
        // Legacy virtio-net has no GPRC/GPTC-style hardware counters; byte
        // and packet totals are accumulated by the caller from rx_batch /
        // tx_batch return values instead.
    }

    fn get_link_speed(&self) -> u16 {
        1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_command_byte_pattern_matches_promisc_on() {
        // S6: {class=RX=0, cmd=PROMISC=0, data=1, ack=0}.
        let mut payload = [0u8; 4];
        payload[0] = CTRL_CLASS_RX;
        payload[1] = CTRL_CMD_RX_PROMISC;
        payload[2] = u8::from(true);
        payload[3] = 0;
        assert_eq!(payload, [0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn find_free_chain_needs_three_consecutive_slots() {
        let ring = VRing::allocate(8).unwrap();
        let queue = VirtQueue { ring, bufs_in_use: (0..8).map(|_| None).collect(), used_last: 0, pool: None };
        assert_eq!(queue.find_free_chain(3), Some(0));
        queue.ring.set_desc(1, 0xdead, 1, 0, 0);
        assert_eq!(queue.find_free_chain(3), Some(2));
    }
}
