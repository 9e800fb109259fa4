// Producer queue: a pool of buffer slots handed out as a batch

use std::io;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::Hub::consumer_queue::ConsumerQueueChannel;
use crate::Hub::producer::ProducerChannel;
use crate::Hub::service::BufferHubService;
use crate::Hub::Structs::Buffer_Structs::{BufferDescription, QueueConfig, QueueInfo};

/// Fixed number of buffer slots per queue.
pub const MAX_QUEUE_BUFFERS: usize = 64;

struct QueueState {
    /// One entry per slot; the queue does not own its producers, the
    /// service registry does.
    slots: [Option<Weak<ProducerChannel>>; MAX_QUEUE_BUFFERS],
    /// Number of currently occupied slots.
    capacity: usize,
    /// Attached subscriber queues, notified of every allocation.
    consumer_queues: Vec<Weak<ConsumerQueueChannel>>,
}

/// The allocating side of a buffer queue.
///
/// Buffers allocated here go through the same creation path as stand-alone
/// buffers; the queue only adds the slot bookkeeping and the usage policy.
pub struct ProducerQueueChannel {
    channel_id: u32,
    config: QueueConfig,
    service: Weak<BufferHubService>,
    state: Mutex<QueueState>,
}

impl ProducerQueueChannel {
    pub(crate) fn new(
        channel_id: u32,
        config: QueueConfig,
        service: Weak<BufferHubService>,
    ) -> Arc<ProducerQueueChannel> {
        Arc::new(ProducerQueueChannel {
            channel_id,
            config,
            service,
            state: Mutex::new(QueueState {
                slots: std::array::from_fn(|_| None),
                capacity: 0,
                consumer_queues: Vec::new(),
            }),
        })
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Snapshot for GetQueueInfo and diagnostics.
    pub fn queue_info(&self) -> QueueInfo {
        let st = self.state.lock();
        QueueInfo {
            capacity: st.capacity,
            consumer_count: st
                .consumer_queues
                .iter()
                .filter(|w| w.upgrade().is_some())
                .count(),
            policy: self.config.policy,
            metadata_size: self.config.metadata_size,
        }
    }

    /// Allocate one buffer through the queue.
    ///
    /// The requested usage is validated against the deny masks, then the
    /// set/clear masks are applied. Every attached consumer queue learns
    /// about the new (producer, slot) pair.
    ///
    /// # Returns
    /// The new producer channel and the slot it occupies.
    pub fn allocate_buffer(
        &self,
        width: u32,
        height: u32,
        format: u32,
        usage: u64,
    ) -> io::Result<(Arc<ProducerChannel>, usize)> {
        let service = self.service.upgrade().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "Service has terminated")
        })?;

        if !self.config.policy.allows(usage) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Usage {:#x} violates queue usage policy", usage),
            ));
        }
        let effective_usage = self.config.policy.effective_usage(usage);

        let mut st = self.state.lock();
        let slot = st
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::OutOfMemory, "All queue slots occupied")
            })?;

        let description = BufferDescription {
            width,
            height,
            format,
            usage: effective_usage,
            metadata_size: self.config.metadata_size,
        };
        let producer = service.create_queue_buffer(description, slot as u64)?;

        st.slots[slot] = Some(Arc::downgrade(&producer));
        st.capacity += 1;

        st.consumer_queues.retain(|w| match w.upgrade() {
            Some(cq) => {
                cq.on_buffer_allocated(Arc::downgrade(&producer), slot);
                true
            }
            None => false,
        });

        Ok((producer, slot))
    }

    /// Remove a buffer from its slot.
    ///
    /// The producer channel itself stays registered with the service; only
    /// the queue slot is vacated.
    pub fn remove_buffer(&self, slot: usize) -> io::Result<()> {
        let mut st = self.state.lock();
        if slot >= MAX_QUEUE_BUFFERS || st.slots[slot].is_none() || st.capacity == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("No buffer in slot {}", slot),
            ));
        }

        st.slots[slot] = None;
        st.capacity -= 1;

        st.consumer_queues.retain(|w| match w.upgrade() {
            Some(cq) => {
                cq.on_buffer_removed(slot);
                true
            }
            None => false,
        });
        Ok(())
    }

    /// Spawn a subscriber queue. Every already-occupied slot is immediately
    /// enqueued on the new subscriber, so a late joiner still learns about
    /// all existing buffers.
    pub(crate) fn create_consumer_queue(
        self: &Arc<Self>,
        channel_id: u32,
        silent: bool,
    ) -> Arc<ConsumerQueueChannel> {
        let consumer_queue = ConsumerQueueChannel::new(
            channel_id,
            Arc::downgrade(self),
            self.service.clone(),
            silent,
        );

        let mut st = self.state.lock();
        for (slot, entry) in st.slots.iter().enumerate() {
            if let Some(weak) = entry {
                consumer_queue.on_buffer_allocated(weak.clone(), slot);
            }
        }
        st.consumer_queues.push(Arc::downgrade(&consumer_queue));
        consumer_queue
    }

    /// Hangup fan-out on queue teardown.
    pub(crate) fn broadcast_hangup(&self) {
        use crate::Hub::events::EVENT_HANGUP;
        let st = self.state.lock();
        for weak in &st.consumer_queues {
            if let Some(cq) = weak.upgrade() {
                cq.events().signal(EVENT_HANGUP);
            }
        }
    }
}
