//! Driver for the Intel 82599 ("ixgbe") 10GbE controller: bring-up per the
//! datasheet's Sec. 4.6 state machine, and the batched RX/TX hot paths.

pub mod descriptors;
pub mod regs;

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use crate::device::Packet;
use crate::error::{IxyError, Result};
use crate::memory::{free_to_home_pool, Dma, Pool};
use crate::mmio::Mmio;
use crate::pci::{PciAddress, PciDevice, VENDOR_INTEL};
use crate::stats::DeviceStats;
use descriptors::{RxDescriptor, TxDescriptor};

const NUM_RX_QUEUE_ENTRIES: usize = 512;
const NUM_TX_QUEUE_ENTRIES: usize = 512;
const TX_CLEAN_BATCH: usize = 32;
const DESCRIPTOR_SIZE: usize = 16;

fn wrap_ring(index: usize, ring_size: usize) -> usize {
    (index + 1) & (ring_size - 1)
}

struct IxgbeRxQueue {
    ring: Dma<u8>,
    num_descriptors: usize,
    pool: std::sync::Arc<Pool>,
    bufs_in_use: Vec<Option<Packet>>,
    rx_index: usize,
}

impl IxgbeRxQueue {
    fn descriptor(&self, i: usize) -> RxDescriptor {
        unsafe { RxDescriptor::at(self.ring.virt().add(i * DESCRIPTOR_SIZE)) }
    }
}

struct IxgbeTxQueue {
    ring: Dma<u8>,
    num_descriptors: usize,
    bufs_in_use: Vec<Option<Packet>>,
    clean_index: usize,
    tx_index: usize,
}

impl IxgbeTxQueue {
    fn descriptor(&self, i: usize) -> TxDescriptor {
        unsafe { TxDescriptor::at(self.ring.virt().add(i * DESCRIPTOR_SIZE)) }
    }
}

pub struct IxgbeDevice {
    pci: PciDevice,
    mmio: Mmio,
    rx_queues: Vec<IxgbeRxQueue>,
    tx_queues: Vec<IxgbeTxQueue>,
}

impl IxgbeDevice {
    pub fn init(addr: PciAddress, num_rx_queues: u16, num_tx_queues: u16) -> Result<IxgbeDevice> {
        let pci = PciDevice::open(addr)?;
        let config = pci.read_config()?;
        if config.vendor_id != VENDOR_INTEL {
            return Err(IxyError::ConfigurationFault(format!(
                "device {addr} (vendor {:#06x}) is not an Intel NIC",
                config.vendor_id
            )));
        }

        pci.unbind_driver()?;
        pci.enable_dma()?;
        let (base, len) = pci.map_resource0()?;
        let mmio = unsafe { Mmio::new(base, len) };

        let mut dev = IxgbeDevice { pci, mmio, rx_queues: Vec::new(), tx_queues: Vec::new() };
        dev.reset_and_init(num_rx_queues, num_tx_queues)?;
        Ok(dev)
    }

    pub fn address(&self) -> PciAddress {
        self.pci.address()
    }

    fn reset_and_init(&mut self, num_rx_queues: u16, num_tx_queues: u16) -> Result<()> {
        log::info!("resetting ixgbe device {}", self.pci.address());

        self.mmio.set(regs::EIMC, 0x7FFF_FFFF);
        self.mmio.set(regs::CTRL, regs::CTRL_RST_MASK);
        self.mmio.wait_clear(regs::CTRL, regs::CTRL_RST_MASK);
        thread::sleep(Duration::from_millis(10));
        self.mmio.set(regs::EIMC, 0x7FFF_FFFF);

        log::info!("initializing ixgbe device {}", self.pci.address());

        self.mmio.wait_set(regs::EEC, regs::EEC_ARD);
        self.mmio.wait_set(regs::RDRXCTL, regs::RDRXCTL_DMAIDONE);

        self.init_link();
        self.reset_stats_regs();

        self.init_rx(num_rx_queues)?;
        self.init_tx(num_tx_queues)?;

        for i in 0..num_rx_queues {
            self.start_rx_queue(i)?;
        }
        for i in 0..num_tx_queues {
            self.start_tx_queue(i)?;
        }

        self.set_promisc(true)?;

        let speed = self.wait_for_link();
        log::info!("link speed is {speed} Mbit/s");

        Ok(())
    }

    fn init_link(&self) {
        let autoc = self.mmio.get(regs::AUTOC);
        self.mmio.set(regs::AUTOC, (autoc & !regs::AUTOC_LMS_MASK) | regs::AUTOC_LMS_10G_SERIAL);
        let autoc = self.mmio.get(regs::AUTOC);
        self.mmio.set(regs::AUTOC, (autoc & !regs::AUTOC_10G_PMA_PMD_MASK) | regs::AUTOC_10G_XAUI);
        self.mmio.set_flags(regs::AUTOC, regs::AUTOC_AN_RESTART);
    }

    /// GPRC/GPTC/GORCL/GORCH/GOTCL/GOTCH self-clear on read.
    fn reset_stats_regs(&self) {
        self.mmio.get(regs::GPRC);
        self.mmio.get(regs::GPTC);
        self.mmio.get(regs::GORCL);
        self.mmio.get(regs::GORCH);
        self.mmio.get(regs::GOTCL);
        self.mmio.get(regs::GOTCH);
    }

    fn init_rx(&mut self, num_rx_queues: u16) -> Result<()> {
        self.mmio.clear_flags(regs::RXCTRL, regs::RXCTRL_RXEN);

        self.mmio.set(regs::rxpbsize(0), regs::RXPBSIZE_128KB);
        for i in 1..8 {
            self.mmio.set(regs::rxpbsize(i), 0);
        }

        self.mmio.set_flags(regs::HLREG0, regs::HLREG0_RXCRCSTRP);
        self.mmio.set_flags(regs::RDRXCTL, regs::RDRXCTL_CRCSTRIP);
        self.mmio.set_flags(regs::FCTRL, regs::FCTRL_BAM);

        let mempool_entries = (NUM_RX_QUEUE_ENTRIES + NUM_TX_QUEUE_ENTRIES).max(4096);

        for i in 0..num_rx_queues {
            log::debug!("initializing rx queue {i}");

            let srrctl = self.mmio.get(regs::srrctl(i as u32));
            self.mmio.set(
                regs::srrctl(i as u32),
                (srrctl & !regs::SRRCTL_DESCTYPE_MASK) | regs::SRRCTL_DESCTYPE_ADV_ONEBUF,
            );
            self.mmio.set_flags(regs::srrctl(i as u32), regs::SRRCTL_DROP_EN);

            let ring_size_bytes = NUM_RX_QUEUE_ENTRIES * DESCRIPTOR_SIZE;
            let ring: Dma<u8> = Dma::allocate(ring_size_bytes, true)?;
            unsafe { std::ptr::write_bytes(ring.virt(), 0xFF, ring_size_bytes) };

            self.mmio.set(regs::rdbal(i as u32), (ring.phys_addr() & 0xFFFF_FFFF) as u32);
            self.mmio.set(regs::rdbah(i as u32), (ring.phys_addr() >> 32) as u32);
            self.mmio.set(regs::rdlen(i as u32), ring_size_bytes as u32);
            self.mmio.set(regs::rdh(i as u32), 0);
            self.mmio.set(regs::rdt(i as u32), 0);

            let pool = Pool::allocate(mempool_entries, 0)?;

            self.rx_queues.push(IxgbeRxQueue {
                ring,
                num_descriptors: NUM_RX_QUEUE_ENTRIES,
                pool,
                bufs_in_use: (0..NUM_RX_QUEUE_ENTRIES).map(|_| None).collect(),
                rx_index: 0,
            });
        }

        self.mmio.set_flags(regs::CTRL_EXT, regs::CTRL_EXT_NS_DIS);
        for i in 0..num_rx_queues {
            self.mmio.clear_flags(regs::dca_rxctrl(i as u32), 1 << 12);
        }

        self.mmio.set_flags(regs::RXCTRL, regs::RXCTRL_RXEN);
        Ok(())
    }

    fn init_tx(&mut self, num_tx_queues: u16) -> Result<()> {
        self.mmio.set_flags(regs::HLREG0, regs::HLREG0_TXCRCEN | regs::HLREG0_TXPADEN);

        self.mmio.set(regs::txpbsize(0), regs::TXPBSIZE_40KB);
        for i in 1..8 {
            self.mmio.set(regs::txpbsize(i), 0);
        }

        self.mmio.set(regs::DTXMXSZRQ, 0xFFFF);
        self.mmio.clear_flags(regs::RTTDCS, regs::RTTDCS_ARBDIS);

        for i in 0..num_tx_queues {
            log::debug!("initializing tx queue {i}");

            let ring_size_bytes = NUM_TX_QUEUE_ENTRIES * DESCRIPTOR_SIZE;
            let ring: Dma<u8> = Dma::allocate(ring_size_bytes, true)?;
            unsafe { std::ptr::write_bytes(ring.virt(), 0xFF, ring_size_bytes) };

            self.mmio.set(regs::tdbal(i as u32), (ring.phys_addr() & 0xFFFF_FFFF) as u32);
            self.mmio.set(regs::tdbah(i as u32), (ring.phys_addr() >> 32) as u32);
            self.mmio.set(regs::tdlen(i as u32), ring_size_bytes as u32);

            // Sec. 7.2.3.3: writeback-threshold fields, pthresh:6:0 hthresh:14:8 wthresh:22:16.
            let mut txdctl = self.mmio.get(regs::txdctl(i as u32));
            txdctl &= !(0x3F | (0x3F << 8) | (0x3F << 16));
            txdctl |= 36 | (8 << 8) | (4 << 16);
            self.mmio.set(regs::txdctl(i as u32), txdctl);

            self.tx_queues.push(IxgbeTxQueue {
                ring,
                num_descriptors: NUM_TX_QUEUE_ENTRIES,
                bufs_in_use: (0..NUM_TX_QUEUE_ENTRIES).map(|_| None).collect(),
                clean_index: 0,
                tx_index: 0,
            });
        }

        self.mmio.set_flags(regs::DMATXCTL, regs::DMATXCTL_TE);
        Ok(())
    }

    fn start_rx_queue(&mut self, queue_id: u16) -> Result<()> {
        log::debug!("starting rx queue {queue_id}");
        let queue = &mut self.rx_queues[queue_id as usize];
        if queue.num_descriptors & (queue.num_descriptors - 1) != 0 {
            return Err(IxyError::ConfigurationFault("rx ring size must be a power of two".into()));
        }

        for i in 0..queue.num_descriptors {
            let buf = queue.pool.get().ok_or_else(|| {
                IxyError::ResourceExhaustion("not enough buffers to fill rx ring".into())
            })?;
            queue.descriptor(i).set_read(buf.data_addr(), 0);
            queue.bufs_in_use[i] = Some(buf);
        }

        self.mmio.set_flags(regs::rxdctl(queue_id as u32), regs::RXDCTL_ENABLE);
        self.mmio.wait_set(regs::rxdctl(queue_id as u32), regs::RXDCTL_ENABLE);

        self.mmio.set(regs::rdh(queue_id as u32), 0);
        self.mmio.set(regs::rdt(queue_id as u32), (queue.num_descriptors - 1) as u32);
        Ok(())
    }

    fn start_tx_queue(&mut self, queue_id: u16) -> Result<()> {
        log::debug!("starting tx queue {queue_id}");
        let queue = &self.tx_queues[queue_id as usize];
        if queue.num_descriptors & (queue.num_descriptors - 1) != 0 {
            return Err(IxyError::ConfigurationFault("tx ring size must be a power of two".into()));
        }

        self.mmio.set(regs::tdh(queue_id as u32), 0);
        self.mmio.set(regs::tdt(queue_id as u32), 0);
        self.mmio.set_flags(regs::txdctl(queue_id as u32), regs::TXDCTL_ENABLE);
        self.mmio.wait_set(regs::txdctl(queue_id as u32), regs::TXDCTL_ENABLE);
        Ok(())
    }

    /// Polls `LINKS` for up to 10 s. A timeout is logged, not fatal; the
    /// resulting (possibly zero) speed is returned either way.
    fn wait_for_link(&self) -> u16 {
        log::info!("waiting for link");
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let speed = self.get_link_speed();
            if speed != 0 || Instant::now() >= deadline {
                if speed == 0 {
                    log::warn!("link did not come up within 10s");
                }
                return speed;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}

impl crate::device::IxyDevice for IxgbeDevice {
    fn rx_batch(&mut self, queue_id: u16, buffer: &mut VecDeque<Packet>, num_packets: usize) -> usize {
        let mut received = 0;
        let queue = &mut self.rx_queues[queue_id as usize];

        let mut rx_index = queue.rx_index;
        let mut last_rx_index = queue.rx_index;

        for _ in 0..num_packets {
            let desc = queue.descriptor(rx_index);
            if !desc.dd() {
                break;
            }
            if !desc.eop() {
                log::error!("multi-segment packet on rx queue {queue_id}, dropping");
                break;
            }

            let fresh = match queue.pool.get() {
                Some(buf) => buf,
                None => {
                    log::error!("rx queue {queue_id} pool exhausted during refill");
                    break;
                }
            };

            let mut taken = queue.bufs_in_use[rx_index].take().expect("slot must hold a buffer");
            taken.set_size(desc.length() as u32);

            desc.set_read(fresh.data_addr(), 0);
            queue.bufs_in_use[rx_index] = Some(fresh);

            buffer.push_back(taken);
            received += 1;

            last_rx_index = rx_index;
            rx_index = wrap_ring(rx_index, queue.num_descriptors);
        }

        if rx_index != queue.rx_index {
            queue.rx_index = rx_index;
            // Intentionally one behind next_to_read: RDT must never equal
            // RDH, which would tell hardware the ring has zero free slots.
            self.mmio.set(regs::rdt(queue_id as u32), last_rx_index as u32);
        }

        received
    }

    fn tx_batch(&mut self, queue_id: u16, packets: &mut VecDeque<Packet>) -> usize {
        let queue = &mut self.tx_queues[queue_id as usize];
        clean_tx_queue(queue);

        let mut sent = 0;
        let mut cur_index = queue.tx_index;

        while !packets.is_empty() {
            let next_index = wrap_ring(cur_index, queue.num_descriptors);
            if next_index == queue.clean_index {
                break;
            }

            let packet = packets.pop_front().expect("checked non-empty above");
            let size = packet.size();
            let desc = queue.descriptor(cur_index);
            desc.set_read(
                packet.data_addr(),
                size | descriptors::ADVTXD_DCMD_EOP
                    | descriptors::ADVTXD_DCMD_RS
                    | descriptors::ADVTXD_DCMD_IFCS
                    | descriptors::ADVTXD_DCMD_DEXT
                    | descriptors::ADVTXD_DTYP_DATA,
                size << descriptors::ADVTXD_PAYLEN_SHIFT,
            );

            queue.bufs_in_use[cur_index] = Some(packet);
            cur_index = next_index;
            sent += 1;
        }

        queue.tx_index = cur_index;
        self.mmio.set(regs::tdt(queue_id as u32), cur_index as u32);

        sent
    }

    fn tx_batch_busy_wait(&mut self, queue_id: u16, packets: &mut VecDeque<Packet>) {
        while !packets.is_empty() {
            self.tx_batch(queue_id, packets);
        }
    }

    fn set_promisc(&mut self, enabled: bool) -> Result<()> {
        if enabled {
            log::info!("enabling promiscuous mode");
            self.mmio.set_flags(regs::FCTRL, regs::FCTRL_MPE | regs::FCTRL_UPE);
        } else {
            log::info!("disabling promiscuous mode");
            self.mmio.clear_flags(regs::FCTRL, regs::FCTRL_MPE | regs::FCTRL_UPE);
        }
        Ok(())
    }

    fn read_stats(&self, stats: &mut DeviceStats) {
        let rx_packets = u64::from(self.mmio.get(regs::GPRC));
        let tx_packets = u64::from(self.mmio.get(regs::GPTC));
        let rx_bytes =
            u64::from(self.mmio.get(regs::GORCL)) + (u64::from(self.mmio.get(regs::GORCH)) << 32);
        let tx_bytes =
            u64::from(self.mmio.get(regs::GOTCL)) + (u64::from(self.mmio.get(regs::GOTCH)) << 32);

        stats.rx_packets += rx_packets;
        stats.tx_packets += tx_packets;
        stats.rx_bytes += rx_bytes;
        stats.tx_bytes += tx_bytes;
    }

    fn get_link_speed(&self) -> u16 {
        let links = self.mmio.get(regs::LINKS);
        if links & regs::LINKS_UP == 0 {
            return 0;
        }
        match links & regs::LINKS_SPEED_MASK {
            regs::LINKS_SPEED_100 => 100,
            regs::LINKS_SPEED_1G => 1000,
            regs::LINKS_SPEED_10G => 10000,
            _ => 0,
        }
    }
}

/// Reclaims whole `TX_CLEAN_BATCH`-sized runs of descriptors hardware has
/// finished with. Reclaims all-or-nothing per batch: a minor stranding
/// cost, acceptable per the design notes, in exchange for a cheap check.
fn clean_tx_queue(queue: &mut IxgbeTxQueue) {
    loop {
        let mut inflight = queue.tx_index as i64 - queue.clean_index as i64;
        if inflight < 0 {
            inflight += queue.num_descriptors as i64;
        }
        if inflight < TX_CLEAN_BATCH as i64 {
            break;
        }

        let mut probe = queue.clean_index + TX_CLEAN_BATCH - 1;
        if probe >= queue.num_descriptors {
            probe -= queue.num_descriptors;
        }

        if !queue.descriptor(probe).dd() {
            break;
        }

        let mut idx = queue.clean_index;
        for _ in 0..TX_CLEAN_BATCH {
            if let Some(buf) = queue.bufs_in_use[idx].take() {
                free_to_home_pool(buf);
            }
            idx = wrap_ring(idx, queue.num_descriptors);
        }
        queue.clean_index = idx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_tx_queue(num_descriptors: usize) -> IxgbeTxQueue {
        let ring_bytes = num_descriptors * DESCRIPTOR_SIZE;
        let ring: Dma<u8> = Dma::allocate(ring_bytes, true).unwrap();
        IxgbeTxQueue {
            ring,
            num_descriptors,
            bufs_in_use: (0..num_descriptors).map(|_| None).collect(),
            clean_index: 0,
            tx_index: 6,
        }
    }

    #[test]
    fn wrap_ring_matches_mask_formula() {
        for n in [2usize, 8, 256, 4096] {
            for i in 0..n {
                assert_eq!(wrap_ring(i, n), (i + 1) & (n - 1));
            }
        }
    }

    #[test]
    fn tx_enqueue_stops_one_short_of_colliding_with_clean() {
        // S5: N=8, clean=0, next_to_use=6; submitting 4 buffers accepts 1.
        let mut queue = fake_tx_queue(8);
        let mut cur_index = queue.tx_index;
        let mut accepted = 0;
        for _ in 0..4 {
            let next_index = wrap_ring(cur_index, queue.num_descriptors);
            if next_index == queue.clean_index {
                break;
            }
            cur_index = next_index;
            accepted += 1;
        }
        assert_eq!(accepted, 1);
        assert_eq!(cur_index, 7);
    }
}
