//! Packet buffer pool.
//!
//! A pool is a hugepage-backed slab sliced into fixed-size buffers, each
//! carrying a small header the driver uses to track it (see `Buffer`). Pools
//! register themselves in a process-wide table keyed by a freshly assigned
//! id, so that code which only has a buffer's `pool_id` — TX completion,
//! RX refill called from a driver that doesn't own the pool directly — can
//! still return it to the right place.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::error::{IxyError, Result};
use crate::memory::dma::{Dma, HUGE_PAGE_SIZE};

pub const DEFAULT_ENTRY_SIZE: usize = 2048;
const HEADER_SIZE: usize = 64;

const OFFSET_PHYS_ADDR: usize = 0;
const OFFSET_POOL_ID: usize = 16;
const OFFSET_SIZE: usize = 20;
const OFFSET_VIRTIO_HEADER: usize = 24;
const VIRTIO_HEADER_LEN: usize = 40;

static POOL_REGISTRY: Lazy<Mutex<BTreeMap<u32, Arc<Pool>>>> = Lazy::new(|| Mutex::new(BTreeMap::new()));

fn lookup(id: u32) -> Option<Arc<Pool>> {
    POOL_REGISTRY.lock().unwrap().get(&id).cloned()
}

/// A single packet buffer handle: a pointer into a pool's DMA slab plus the
/// two fields cached for cheap access, `phys_addr` and `pool_id`. Both are
/// set once when the pool is built and never change afterwards.
pub struct Buffer {
    virt: *mut u8,
    phys_addr: u64,
    pool_id: u32,
}

unsafe impl Send for Buffer {}

impl Buffer {
    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    /// Address to hand to the NIC: the header's 64-byte headroom is skipped.
    pub fn data_addr(&self) -> u64 {
        self.phys_addr + HEADER_SIZE as u64
    }

    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    pub fn size(&self) -> u32 {
        u32::from_ne_bytes(self.header_field(OFFSET_SIZE))
    }

    pub fn set_size(&mut self, size: u32) {
        self.write_header_field(OFFSET_SIZE, size.to_ne_bytes());
    }

    /// The 40-byte scratch area virtio uses to stage its packet header,
    /// immediately before the payload.
    pub fn virtio_header_scratch_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.virt.add(OFFSET_VIRTIO_HEADER), VIRTIO_HEADER_LEN)
        }
    }

    pub fn payload(&self) -> &[u8] {
        let len = self.size() as usize;
        unsafe { std::slice::from_raw_parts(self.virt.add(HEADER_SIZE), len) }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let len = self.size() as usize;
        unsafe { std::slice::from_raw_parts_mut(self.virt.add(HEADER_SIZE), len) }
    }

    /// Raw pointer to the start of the buffer (header, not payload).
    pub fn virt_ptr(&self) -> *mut u8 {
        self.virt
    }

    fn header_field<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        unsafe { std::ptr::copy_nonoverlapping(self.virt.add(offset), out.as_mut_ptr(), N) };
        out
    }

    fn write_header_field<const N: usize>(&mut self, offset: usize, bytes: [u8; N]) {
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.virt.add(offset), N) };
    }
}

/// A fixed-size slab of packet buffers with a LIFO free list.
pub struct Pool {
    id: u32,
    _dma: Dma<u8>,
    entry_size: usize,
    num_entries: usize,
    base_virt: *mut u8,
    free_stack: Mutex<Vec<u32>>,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Allocates `num_entries` buffers of `entry_size` bytes (default 2048)
    /// and registers the pool under a freshly assigned id.
    pub fn allocate(num_entries: usize, entry_size: usize) -> Result<Arc<Pool>> {
        let entry_size = if entry_size == 0 { DEFAULT_ENTRY_SIZE } else { entry_size };

        if HUGE_PAGE_SIZE % entry_size != 0 {
            return Err(IxyError::ConfigurationFault(format!(
                "entry size {entry_size} does not evenly divide the hugepage size"
            )));
        }

        let dma: Dma<u8> = Dma::allocate(num_entries * entry_size, false)?;
        let base_virt = dma.virt();

        // Assign the id before writing any buffer headers, so every header
        // is written exactly once with its final pool id.
        let mut registry = POOL_REGISTRY.lock().unwrap();
        let id = (1..)
            .find(|id| !registry.contains_key(id))
            .expect("pool id space exhausted");

        let mut free_stack = Vec::with_capacity(num_entries);
        for i in 0..num_entries {
            let slot = unsafe { base_virt.add(i * entry_size) };
            let phys = dma.phys_of(i * entry_size)?;

            unsafe {
                std::ptr::write_bytes(slot, 0, entry_size);
                std::ptr::copy_nonoverlapping(phys.to_ne_bytes().as_ptr(), slot.add(OFFSET_PHYS_ADDR), 8);
                std::ptr::copy_nonoverlapping(id.to_ne_bytes().as_ptr(), slot.add(OFFSET_POOL_ID), 4);
            }
            free_stack.push(i as u32);
        }
        // Pop order is reverse of push order; reverse once up front so the
        // first buffer handed out is entry 0, matching build order.
        free_stack.reverse();

        let pool = Arc::new(Pool {
            id,
            _dma: dma,
            entry_size,
            num_entries,
            base_virt,
            free_stack: Mutex::new(free_stack),
        });
        registry.insert(id, pool.clone());
        drop(registry);

        Ok(pool)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Bytes available to a consumer past the buffer header, i.e. the most
    /// a single descriptor can ask the device to fill.
    pub fn payload_capacity(&self) -> usize {
        self.entry_size - HEADER_SIZE
    }

    fn buffer_at(&self, slot: u32) -> Buffer {
        let virt = unsafe { self.base_virt.add(slot as usize * self.entry_size) };
        let phys_addr = u64::from_ne_bytes(unsafe {
            let mut out = [0u8; 8];
            std::ptr::copy_nonoverlapping(virt.add(OFFSET_PHYS_ADDR), out.as_mut_ptr(), 8);
            out
        });
        Buffer { virt, phys_addr, pool_id: self.id }
    }

    /// Pops one buffer from the free stack, or `None` if the pool is empty.
    /// Emptiness is logged, not treated as an error: the hot path branches
    /// on this rather than unwinding.
    pub fn get(&self) -> Option<Buffer> {
        let slot = self.free_stack.lock().unwrap().pop();
        match slot {
            Some(slot) => Some(self.buffer_at(slot)),
            None => {
                log::debug!("pool {} is empty", self.id);
                None
            }
        }
    }

    /// Pops up to `n` buffers; returns fewer if the pool doesn't have them.
    pub fn get_many(&self, n: usize) -> Vec<Buffer> {
        let mut stack = self.free_stack.lock().unwrap();
        let take = n.min(stack.len());
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            out.push(self.buffer_at(stack.pop().unwrap()));
        }
        out
    }

    /// Returns `buf` to the free stack. The caller must guarantee it
    /// originated from this pool.
    pub fn free(&self, buf: Buffer) {
        debug_assert_eq!(buf.pool_id, self.id, "buffer returned to the wrong pool");
        let slot = ((buf.virt as usize) - (self.base_virt as usize)) / self.entry_size;
        self.free_stack.lock().unwrap().push(slot as u32);
    }
}

/// Returns `buf` to whichever pool it was built from, found through the
/// process-wide registry by `buf.pool_id()`. This is what TX completion and
/// RX refill use when they hold a buffer but not a reference to its pool.
pub fn free_to_home_pool(buf: Buffer) {
    match lookup(buf.pool_id) {
        Some(pool) => pool.free(buf),
        None => log::warn!("buffer references unknown pool {}", buf.pool_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_pool_id_and_data_addr() {
        let pool = Pool::allocate(64, 2048).unwrap();
        let mut taken = Vec::new();
        while let Some(buf) = pool.get() {
            assert_eq!(buf.pool_id(), pool.id());
            assert_eq!(buf.data_addr(), buf.phys_addr() + 64);
            taken.push(buf);
        }
        assert_eq!(taken.len(), 64);
        assert!(pool.get().is_none());

        while let Some(buf) = taken.pop() {
            pool.free(buf);
        }
        assert_eq!(pool.get_many(64).len(), 64);
    }

    #[test]
    fn rejects_entry_size_not_dividing_hugepage() {
        assert!(Pool::allocate(4, 3000).is_err());
    }
}
