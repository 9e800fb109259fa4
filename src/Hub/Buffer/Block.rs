// The shared block: one buffer's mapped region, control header included

use crate::Core::SharedMemory::SharedMemoryBackend;
use crate::Hub::Buffer::layout::MetadataHeader;
use crate::Hub::Structs::Buffer_Structs::BufferDescription;

/// One buffer's shared allocation.
///
/// Region layout, in mapping order:
///
/// ```text
/// [MetadataHeader][user metadata bytes][data band]
/// ```
///
/// The header prefix is the only cross-process contract; the data band is an
/// opaque byte area whose contents the hub never interprets. The struct owns
/// the mapping and holds a transient pointer view of the header, the same
/// way a ring-buffer view points into its control area.
pub struct SharedBlock {
    /// The underlying mapping; kept alive for the lifetime of the block.
    pub(crate) shm: Box<dyn SharedMemoryBackend>,

    /// Geometry this block was allocated with.
    pub(crate) description: BufferDescription,

    /// Pointer to the control header at offset 0 of the mapping.
    pub(crate) header: *mut MetadataHeader,

    /// Byte offset of the data band from the start of the mapping.
    pub(crate) data_offset: usize,

    /// Size of the data band in bytes.
    pub(crate) data_size: usize,
}

unsafe impl Send for SharedBlock {}
unsafe impl Sync for SharedBlock {}
