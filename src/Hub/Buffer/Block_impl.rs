use std::io;
use std::sync::atomic::Ordering::{AcqRel, Acquire};

use super::layout::{MetadataHeader, METADATA_HEADER_SIZE, PRODUCER_STATE_BIT};
use super::Block::SharedBlock;
use crate::Core::SharedMemory::{attach_shared_memory, create_shared_memory, RawHandle};
use crate::Hub::Structs::Buffer_Structs::BufferDescription;

// The hub never interprets pixel contents; the data band is sized at a
// nominal 4 bytes per cell regardless of format.
const BYTES_PER_CELL: usize = 4;

fn region_size(description: &BufferDescription) -> (usize, usize) {
    let meta_end = METADATA_HEADER_SIZE + description.metadata_size as usize;
    let data_offset = (meta_end + 127) & !127; // Align the data band to 128 bytes
    let data_size = description.width as usize * description.height as usize * BYTES_PER_CELL;
    (data_offset, data_size)
}

impl SharedBlock {
    /// Allocate a fresh shared block.
    ///
    /// The new block starts in the Gained state: the creating producer owns
    /// it and may write immediately.
    ///
    /// # Arguments
    /// * `description` - Geometry and usage of the buffer
    /// * `queue_index` - Slot index within the owning queue (0 if stand-alone)
    /// * `name` - Optional region name, for blocks other processes attach to
    pub fn allocate(
        description: BufferDescription,
        queue_index: u64,
        name: Option<&str>,
    ) -> io::Result<SharedBlock> {
        let (data_offset, data_size) = region_size(&description);
        let shm = create_shared_memory(data_offset + data_size, name)?;

        let header = shm.as_ptr() as *mut MetadataHeader;
        unsafe {
            std::ptr::write(
                header,
                MetadataHeader {
                    queue_index,
                    buffer_state: std::sync::atomic::AtomicU64::new(PRODUCER_STATE_BIT),
                    fence_state: std::sync::atomic::AtomicU64::new(0),
                },
            );
        }

        Ok(SharedBlock {
            shm,
            description,
            header,
            data_offset,
            data_size,
        })
    }

    /// Attach to an existing named block created by another process.
    ///
    /// The header is left untouched; whatever protocol state the creator's
    /// side holds remains valid.
    pub fn attach(name: &str, description: BufferDescription) -> io::Result<SharedBlock> {
        let (data_offset, data_size) = region_size(&description);
        let shm = attach_shared_memory(name, data_offset + data_size)?;
        let header = shm.as_ptr() as *mut MetadataHeader;

        Ok(SharedBlock {
            shm,
            description,
            header,
            data_offset,
            data_size,
        })
    }

    #[inline]
    pub(crate) fn header(&self) -> &MetadataHeader {
        // Safety: the header pointer is valid for the lifetime of the
        // mapping, which this struct owns.
        unsafe { &*self.header }
    }

    pub fn description(&self) -> &BufferDescription {
        &self.description
    }

    pub fn queue_index(&self) -> u64 {
        self.header().queue_index
    }

    pub fn raw_handle(&self) -> RawHandle {
        self.shm.raw_handle()
    }

    /// Current value of the shared ownership word.
    pub fn buffer_state(&self) -> u64 {
        self.header().buffer_state.load(Acquire)
    }

    /// Current value of the shared fence-obligation word.
    pub fn fence_state(&self) -> u64 {
        self.header().fence_state.load(Acquire)
    }

    /// Gained -> Posted: replace the producer bit with the pending-consumer
    /// mask in one atomic step. Only the owning producer drives this bit.
    pub(crate) fn post_with_mask(&self, consumer_mask: u64) -> u64 {
        self.header().buffer_state.swap(consumer_mask, AcqRel)
    }

    /// Released -> Gained: claim the producer bit, wiping any residue.
    pub(crate) fn gain(&self) -> u64 {
        self.header().buffer_state.swap(PRODUCER_STATE_BIT, AcqRel)
    }

    /// Mark a late-attaching consumer pending on the current frame.
    pub(crate) fn set_consumer_state_bit(&self, bit: u64) {
        self.header().buffer_state.fetch_or(bit, AcqRel);
    }

    /// Record that a consumer has acquired and now owes a release signal.
    pub(crate) fn set_fence_state_bit(&self, bit: u64) {
        self.header().fence_state.fetch_or(bit, AcqRel);
    }

    /// Resolve a consumer's obligation in both shared words.
    pub(crate) fn clear_consumer_bits(&self, bit: u64) {
        self.header().fence_state.fetch_and(!bit, AcqRel);
        self.header().buffer_state.fetch_and(!bit, AcqRel);
    }

    /// Pointer to the start of the data band.
    ///
    /// CPU access discipline is the protocol's: write only while Gained,
    /// read only while holding an acquire.
    pub fn data_ptr(&self) -> *mut u8 {
        unsafe { self.shm.as_ptr().add(self.data_offset) }
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Pointer to the user metadata bytes that follow the control header.
    pub fn user_metadata_ptr(&self) -> *mut u8 {
        unsafe { self.shm.as_ptr().add(METADATA_HEADER_SIZE) }
    }

    pub fn user_metadata_size(&self) -> usize {
        self.description.metadata_size as usize
    }
}
