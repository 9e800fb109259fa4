// Consumer side: a thin per-subscriber projection of one producer's buffer

use std::io;
use std::sync::Weak;

use parking_lot::Mutex;

use crate::Core::fence::Fence;
use crate::Hub::events::{ChannelEvents, EVENT_AVAILABLE};
use crate::Hub::producer::ProducerChannel;

/// Per-cycle progress of one consumer.
///
/// `released` starts true: a fresh consumer owes nothing until a post makes
/// it pending (both flags cleared), after which acquire/release each happen
/// at most once per cycle.
pub(crate) struct ConsumerFlags {
    pub(crate) acquired: bool,
    pub(crate) released: bool,
    pub(crate) ignored: bool,
}

/// One subscriber's channel, bound to a single bit of the shared state.
///
/// Holds only a weak reference to its producer; the producer may die first,
/// after which every delegating call fails BrokenPipe.
pub struct ConsumerChannel {
    channel_id: u32,
    consumer_state_bit: u64,
    producer: Weak<ProducerChannel>,
    events: ChannelEvents,
    flags: Mutex<ConsumerFlags>,
}

impl std::fmt::Debug for ConsumerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerChannel")
            .field("channel_id", &self.channel_id())
            .finish_non_exhaustive()
    }
}

impl ConsumerChannel {
    pub(crate) fn new(
        channel_id: u32,
        consumer_state_bit: u64,
        producer: Weak<ProducerChannel>,
    ) -> Self {
        Self {
            channel_id,
            consumer_state_bit,
            producer,
            events: ChannelEvents::new(),
            flags: Mutex::new(ConsumerFlags {
                acquired: false,
                released: true,
                ignored: false,
            }),
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// The state bit this consumer holds in the shared words.
    pub fn state_bit(&self) -> u64 {
        self.consumer_state_bit
    }

    /// Event word the subscribing client waits on (available / hangup).
    pub fn events(&self) -> &ChannelEvents {
        &self.events
    }

    pub(crate) fn flags(&self) -> &Mutex<ConsumerFlags> {
        &self.flags
    }

    /// The producer this consumer is bound to, if it is still alive.
    ///
    /// In-process clients use this to reach the shared block for reading.
    pub fn producer_channel(&self) -> Option<std::sync::Arc<ProducerChannel>> {
        self.producer.upgrade()
    }

    fn producer(&self) -> io::Result<std::sync::Arc<ProducerChannel>> {
        self.producer_channel().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "Producer has terminated")
        })
    }

    /// Take read access to the posted frame.
    ///
    /// # Returns
    /// * `Ok(fence)` - wait on it before reading the buffer contents
    /// * `Err(BrokenPipe)` if the producer is gone
    /// * `Err(WouldBlock)` if nothing is posted, or acquire is out of turn
    pub fn acquire(&self) -> io::Result<Fence> {
        self.producer()?.consumer_acquire(self)
    }

    /// Give read access back, with an optional fence the producer must wait
    /// on before reusing the memory. `Fence::empty()` means "none".
    pub fn release(&self, fence: Fence) -> io::Result<()> {
        self.producer()?.consumer_release(self, fence)
    }

    /// Fire-and-forget acquire; the post fence view is discarded.
    pub fn acquire_impulse(&self) {
        if let Err(e) = self.acquire() {
            log::debug!("consumer {}: impulse acquire dropped: {}", self.channel_id, e);
        }
    }

    /// Fire-and-forget release with no fence attached.
    pub fn release_impulse(&self) {
        if let Err(e) = self.release(Fence::empty()) {
            log::debug!("consumer {}: impulse release dropped: {}", self.channel_id, e);
        }
    }

    /// Toggle ignore mode: while set, future posts are auto-resolved and
    /// this subscriber is never notified. Enabling it mid-acquire releases
    /// immediately.
    pub fn set_ignore(&self, ignore: bool) -> io::Result<()> {
        match self.producer.upgrade() {
            Some(producer) => {
                producer.set_consumer_ignore(self, ignore);
            }
            None => {
                // No producer left to settle with; just record the mode.
                self.flags.lock().ignored = ignore;
            }
        }
        Ok(())
    }

    pub fn is_ignored(&self) -> bool {
        self.flags.lock().ignored
    }

    pub fn is_producer_alive(&self) -> bool {
        self.producer.upgrade().is_some()
    }

    /// Producer-posted notification.
    ///
    /// Returns whether this consumer became pending; ignored consumers are
    /// counted as already resolved and get no event.
    pub(crate) fn on_producer_posted(&self) -> bool {
        let mut flags = self.flags.lock();
        flags.acquired = false;
        if flags.ignored {
            flags.released = true;
            return false;
        }
        flags.released = false;
        self.events.signal(EVENT_AVAILABLE);
        true
    }

    /// Detach from the producer; unresolved obligations are orphaned there.
    pub fn detach(&self) {
        if let Some(producer) = self.producer.upgrade() {
            producer.remove_consumer(self);
        }
    }
}
