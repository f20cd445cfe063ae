//! Hugepage-backed DMA memory.
//!
//! Every ring and pool in this driver is carved out of one of these blocks.
//! The physical address is resolved once, through `/proc/self/pagemap`,
//! because that's the only address the NIC understands — virtual addresses
//! mean nothing to a device doing DMA.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::marker::PhantomData;
use std::os::unix::io::AsRawFd;
use std::process;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{IxyError, Result};

const HUGE_PAGE_BITS: u32 = 21;
pub const HUGE_PAGE_SIZE: usize = 1 << HUGE_PAGE_BITS;

static HUGEPAGE_SEQ: AtomicUsize = AtomicUsize::new(0);

/// A DMA-capable block of `size` bytes, backed by one or more hugepages.
///
/// `T` is a tag for what the block is being used to store; `Dma<u8>` is the
/// common case (a raw byte arena sliced up by the caller).
pub struct Dma<T> {
    virt: *mut u8,
    phys: u64,
    size: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T> Send for Dma<T> {}

impl<T> Dma<T> {
    /// Allocates `size` bytes (rounded up to a hugepage) of pinned, DMA-safe
    /// memory. If `require_contiguous` is set, fails rather than span more
    /// than one hugepage, since this driver has no IOMMU to stitch a
    /// scattered allocation into one DMA-visible region.
    pub fn allocate(size: usize, require_contiguous: bool) -> Result<Dma<T>> {
        let size = round_up(size, HUGE_PAGE_SIZE);

        if require_contiguous && size > HUGE_PAGE_SIZE {
            return Err(IxyError::ConfigurationFault(format!(
                "{size} bytes cannot fit in one hugepage"
            )));
        }

        let seq = HUGEPAGE_SEQ.fetch_add(1, Ordering::SeqCst);
        let path = format!("/mnt/huge/ixy-{}-{}", process::id(), seq);

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| {
                IxyError::ConfigurationFault(format!(
                    "hugepage file {path} could not be created, are hugepages enabled? ({e})"
                ))
            })?;
        file.set_len(size as u64)?;

        let virt = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_HUGETLB,
                file.as_raw_fd(),
                0,
            )
        };
        if virt == libc::MAP_FAILED {
            return Err(IxyError::IoFault(std::io::Error::last_os_error()));
        }
        let virt = virt as *mut u8;

        if unsafe { libc::mlock(virt as *mut libc::c_void, size) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::munmap(virt as *mut libc::c_void, size) };
            return Err(IxyError::IoFault(err));
        }

        let phys = virt_to_phys(virt as usize)?;

        Ok(Dma { virt, phys, size, _marker: PhantomData })
    }

    pub fn virt(&self) -> *mut u8 {
        self.virt
    }

    pub fn phys_addr(&self) -> u64 {
        self.phys
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Translates a byte offset inside this block to a physical address,
    /// without assuming the block is one physically contiguous page run.
    pub fn phys_of(&self, offset: usize) -> Result<u64> {
        debug_assert!(offset < self.size);
        virt_to_phys(self.virt as usize + offset)
    }
}

fn round_up(value: usize, align: usize) -> usize {
    if value % align == 0 {
        value
    } else {
        ((value / align) + 1) * align
    }
}

fn virt_to_phys(addr: usize) -> Result<u64> {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) } as usize;

    let mut file = fs::OpenOptions::new().read(true).open("/proc/self/pagemap")?;
    file.seek(SeekFrom::Start((addr / page_size * 8) as u64))?;

    let mut entry = [0u8; 8];
    file.read_exact(&mut entry)?;
    let entry = u64::from_ne_bytes(entry);

    // Bits 0-54 hold the page frame number once the page is present (bit 63).
    let pfn = entry & 0x007f_ffff_ffff_ffff;
    Ok(pfn * page_size as u64 + (addr % page_size) as u64)
}
