//! Error taxonomy for the driver core.
//!
//! Mirrors the four failure classes the design distinguishes: a
//! misconfiguration caught before any hardware is touched, a device that
//! misbehaves but can sometimes be worked around, exhaustion of a bounded
//! resource on the hot path, and a failed syscall against sysfs/mmap.

#[derive(Debug, thiserror::Error)]
pub enum IxyError {
    /// Invalid PCI address, unsupported vendor, bad queue/ring sizing.
    /// Always fatal to initialization.
    #[error("configuration fault: {0}")]
    ConfigurationFault(String),

    /// A device-level condition such as an unexpected descriptor flag or a
    /// virtio status failure. Most call sites log this and continue rather
    /// than propagate it; init-time device faults are fatal.
    #[error("device fault: {0}")]
    DeviceFault(String),

    /// A bounded resource (packet pool, descriptor ring) ran out. On
    /// `rx_batch` this is fatal for the batch; on `tx_batch` it is not an
    /// error at all — it is reported as a short count.
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// mmap/open/read/write/ioctl failed against a sysfs or hugetlbfs path.
    #[error("I/O fault: {0}")]
    IoFault(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IxyError>;
