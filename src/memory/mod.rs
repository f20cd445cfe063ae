//! DMA memory: hugepage-backed blocks and the packet buffer pool sliced
//! out of them.

pub mod dma;
pub mod mempool;

pub use dma::{Dma, HUGE_PAGE_SIZE};
pub use mempool::{free_to_home_pool, Buffer, Pool};
