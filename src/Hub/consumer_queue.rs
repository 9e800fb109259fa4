// Consumer queue: one subscriber's import feed over a producer queue

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::Hub::consumer::ConsumerChannel;
use crate::Hub::events::{ChannelEvents, EVENT_AVAILABLE};
use crate::Hub::producer::ProducerChannel;
use crate::Hub::producer_queue::ProducerQueueChannel;
use crate::Hub::service::BufferHubService;

/// A subscriber's view of a producer queue.
///
/// Buffers allocated on the producer side land in this queue's pending FIFO
/// and stay there until the subscriber imports them, minting one consumer
/// channel per buffer. A silent queue observes queue activity through its
/// event word but refuses to import.
pub struct ConsumerQueueChannel {
    channel_id: u32,
    producer_queue: Weak<ProducerQueueChannel>,
    service: Weak<BufferHubService>,
    silent: bool,
    events: ChannelEvents,
    /// (producer, slot) pairs not yet imported by this subscriber.
    pending: Mutex<VecDeque<(Weak<ProducerChannel>, usize)>>,
    imported: AtomicUsize,
}

impl ConsumerQueueChannel {
    pub(crate) fn new(
        channel_id: u32,
        producer_queue: Weak<ProducerQueueChannel>,
        service: Weak<BufferHubService>,
        silent: bool,
    ) -> Arc<ConsumerQueueChannel> {
        Arc::new(ConsumerQueueChannel {
            channel_id,
            producer_queue,
            service,
            silent,
            events: ChannelEvents::new(),
            pending: Mutex::new(VecDeque::new()),
            imported: AtomicUsize::new(0),
        })
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    pub fn events(&self) -> &ChannelEvents {
        &self.events
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of buffers this subscriber has imported so far.
    pub fn imported_count(&self) -> usize {
        self.imported.load(Ordering::Relaxed)
    }

    pub fn producer_queue(&self) -> Option<Arc<ProducerQueueChannel>> {
        self.producer_queue.upgrade()
    }

    /// Producer-side notification of a new (producer, slot) pair.
    pub(crate) fn on_buffer_allocated(&self, producer: Weak<ProducerChannel>, slot: usize) {
        self.pending.lock().push_back((producer, slot));
        self.events.signal(EVENT_AVAILABLE);
    }

    /// Producer-side notification that a slot was vacated; drops any
    /// not-yet-imported entry for it.
    pub(crate) fn on_buffer_removed(&self, slot: usize) {
        self.pending.lock().retain(|(_, s)| *s != slot);
    }

    /// Drain the pending FIFO, minting one consumer channel per buffer.
    ///
    /// Producers that died before import are skipped silently. If the first
    /// live import fails the whole call fails and nothing is cleared; if a
    /// later one fails, the successfully imported prefix is returned and
    /// the remainder stays pending for a retry.
    ///
    /// # Returns
    /// The newly created consumer channels with their slot indices.
    pub fn import_pending(&self) -> io::Result<Vec<(Arc<ConsumerChannel>, usize)>> {
        if self.silent {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Silent consumer queue never imports",
            ));
        }

        let service = self.service.upgrade().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "Service has terminated")
        })?;

        let mut pending = self.pending.lock();
        let mut imported = Vec::new();

        while let Some((weak_producer, slot)) = pending.front().cloned() {
            let producer = match weak_producer.upgrade() {
                Some(producer) => producer,
                None => {
                    // The buffer died before this subscriber got to it.
                    pending.pop_front();
                    continue;
                }
            };

            match service.create_consumer_for(&producer) {
                Ok(consumer) => {
                    pending.pop_front();
                    imported.push((consumer, slot));
                }
                Err(e) if imported.is_empty() => return Err(e),
                Err(_) => break,
            }
        }

        self.imported.fetch_add(imported.len(), Ordering::Relaxed);
        Ok(imported)
    }
}
