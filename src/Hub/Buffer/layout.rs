use std::sync::atomic::AtomicU64;

/// State bit reserved for the producer (bit 63 of `buffer_state`).
pub const PRODUCER_STATE_BIT: u64 = 1 << 63;

/// Bits available for consumer state (bits 0..=62 of `buffer_state`).
pub const CONSUMER_STATE_MASK: u64 = !PRODUCER_STATE_BIT;

/// The maximum number of concurrently attached consumers per buffer.
pub const MAX_CONSUMERS: usize = 63;

/// Shared control header embedded at the start of every buffer's metadata
/// block.
///
/// This struct is the one cross-process wire contract in the system: every
/// process mapping the block sees the same three words at the same offsets,
/// followed by the user-defined metadata bytes. It is marked `#[repr(C)]` to
/// ensure a defined and stable memory layout.
#[repr(C)]
pub struct MetadataHeader {
    /// Slot index of this buffer within its producer queue (0 for
    /// stand-alone buffers). Written once at allocation time.
    pub queue_index: u64,

    /// The ownership bit-vector. Bit 63 is the producer-owns flag; each
    /// attached consumer holds one of bits 0..=62. The aggregate value is
    /// the buffer's state: Gained (bit 63 only), Posted/PartiallyAcquired
    /// (consumer bits set), Released (all clear).
    pub buffer_state: AtomicU64,

    /// Bit per consumer indicating "this consumer has acquired and still
    /// owes a release fence signal". Cleared when the consumer releases or
    /// is orphaned (it will never signal).
    pub fence_state: AtomicU64,
}

/// Size in bytes of the fixed header prefix; user metadata starts here.
pub const METADATA_HEADER_SIZE: usize = std::mem::size_of::<MetadataHeader>();

/// The four meaningful aggregate shapes of `buffer_state`/`fence_state`.
///
/// The shared-memory representation stays the raw bit-vectors; this enum is
/// derived read-only for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Producer owns the buffer and may write it.
    Gained,
    /// Posted to consumers; none has acquired yet.
    Posted,
    /// At least one consumer has acquired and is reading.
    PartiallyAcquired,
    /// No party holds the buffer; the producer may gain it.
    Released,
}

impl BufferState {
    /// Classify a `(buffer_state, fence_state)` pair.
    pub fn from_bits(buffer_state: u64, fence_state: u64) -> BufferState {
        if buffer_state & PRODUCER_STATE_BIT != 0 {
            BufferState::Gained
        } else if buffer_state & CONSUMER_STATE_MASK == 0 {
            BufferState::Released
        } else if fence_state & CONSUMER_STATE_MASK != 0 {
            BufferState::PartiallyAcquired
        } else {
            BufferState::Posted
        }
    }
}

/// Find the lowest consumer bit not present in `used`.
///
/// `used` is the union of active bits, orphaned bits and the producer bit;
/// returns `None` when all 63 consumer bits are taken.
pub fn find_lowest_clear_bit(used: u64) -> Option<u64> {
    let free = !used & CONSUMER_STATE_MASK;
    if free == 0 {
        None
    } else {
        Some(free & free.wrapping_neg())
    }
}
