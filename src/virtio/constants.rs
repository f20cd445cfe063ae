//! Legacy (0.9.5) virtio-net register offsets, status/feature bits, and the
//! packet header layout.

/// Legacy PCI register offsets, relative to BAR0.
pub const HOST_FEATURES: usize = 0;
pub const GUEST_FEATURES: usize = 4;
pub const QUEUE_PFN: usize = 8;
pub const QUEUE_NUM: usize = 12;
pub const QUEUE_SEL: usize = 14;
pub const QUEUE_NOTIFY: usize = 16;
pub const STATUS: usize = 18;

pub const QUEUE_ADDR_SHIFT: u32 = 12;

pub const LEGACY_DEVICE_ID: u16 = 0x1000;

pub const STATUS_ACKNOWLEDGE: u8 = 1;
pub const STATUS_DRIVER: u8 = 2;
pub const STATUS_DRIVER_OK: u8 = 4;
pub const STATUS_FAILED: u8 = 0x80;

pub const NET_F_CSUM: u32 = 1 << 0;
pub const NET_F_GUEST_CSUM: u32 = 1 << 1;
pub const NET_F_CTRL_VQ: u32 = 1 << 17;
pub const NET_F_CTRL_RX: u32 = 1 << 18;
pub const REQUIRED_FEATURES: u32 = NET_F_CSUM | NET_F_GUEST_CSUM | NET_F_CTRL_VQ | NET_F_CTRL_RX;

pub const VQ_RX: u16 = 0;
pub const VQ_TX: u16 = 1;
pub const VQ_CONTROL: u16 = 2;

pub const DESC_F_NEXT: u16 = 1;
pub const DESC_F_WRITE: u16 = 2;
pub const AVAIL_F_NO_INTERRUPT: u16 = 1;

/// On-wire size of `struct virtio_net_hdr` (legacy): flags, gso_type,
/// hdr_len, gso_size, csum_start, csum_offset.
pub const NET_HDR_STRUCT_LEN: usize = 1 + 1 + 2 + 2 + 2 + 2;

/// Value written into the header's own `hdr_len` field: the Ethernet + IP
/// + TCP header span ahead of the payload. This is a semantic content
/// value only — the real descriptor backing offset is `NET_HDR_STRUCT_LEN`,
/// the struct's actual wire size; using this constant for that math would
/// run two bytes into the buffer's own `payload size` header.
pub const NET_HDR_LEN: u64 = 14 + 20 + 8;

pub const GSO_NONE: u8 = 0;

pub const CTRL_CLASS_RX: u8 = 0;
pub const CTRL_CMD_RX_PROMISC: u8 = 0;
pub const CTRL_ACK_OK: u8 = 0;
pub const CTRL_ACK_ERR: u8 = 1;
