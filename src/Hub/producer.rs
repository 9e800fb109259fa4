// Producer side of the buffer ownership state machine

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::Core::fence::Fence;
use crate::Hub::consumer::ConsumerChannel;
use crate::Hub::events::{ChannelEvents, EVENT_AVAILABLE, EVENT_HANGUP};
use crate::Hub::Buffer::layout::{find_lowest_clear_bit, PRODUCER_STATE_BIT};
use crate::Hub::Buffer::Block::SharedBlock;
use crate::Hub::Structs::Buffer_Structs::BufferDescription;

/// Sentinel uid/gid: skip the access check entirely.
pub const NO_CHECK: u32 = u32::MAX;

/// Sentinel uid/gid: record the caller's current real id at registration.
pub const USE_CALLER: u32 = u32::MAX - 1;

/// Broker-private bookkeeping, never visible across the process boundary.
/// The shared `buffer_state`/`fence_state` words live in the block's header.
struct ProducerState {
    /// Mirrors bit 63 of the shared word; only this side flips it.
    producer_owns: bool,
    /// Consumers notified by the last post that have not yet resolved.
    pending_consumers: usize,
    /// State bits of currently attached consumers.
    active_mask: u64,
    /// State bits of consumers that died while still owing a release.
    orphaned_mask: u64,
    /// Attached consumers; non-owning, removed explicitly on detach.
    consumers: Vec<(u64, Weak<ConsumerChannel>)>,
    /// Fence supplied by the last post; consumers wait on it before reading.
    post_fence: Fence,
    /// Merged union of consumer release fences, handed out on gain.
    returned_fence: Fence,
    /// Persistent registration, if any.
    name: Option<String>,
    owner_uid: u32,
    owner_gid: u32,
}

/// The single writer-side channel of one shared buffer.
///
/// Owns the shared block and drives the Gained/Posted/Released transitions.
/// All mutation of the shared words happens as single atomic bit updates;
/// the mutex below only guards the broker-private lists and counters.
pub struct ProducerChannel {
    /// Reassigned when a detached persistent buffer is re-attached under a
    /// fresh channel id.
    channel_id: AtomicU32,
    block: SharedBlock,
    events: ChannelEvents,
    state: Mutex<ProducerState>,
}

impl std::fmt::Debug for ProducerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerChannel")
            .field("channel_id", &self.channel_id())
            .finish_non_exhaustive()
    }
}

impl ProducerChannel {
    /// Create a producer channel with a freshly allocated shared block.
    ///
    /// The new buffer starts Gained: the creator may write immediately.
    ///
    /// # Arguments
    /// * `channel_id` - Service-assigned id; doubles as the buffer id
    /// * `description` - Buffer geometry and usage
    /// * `queue_index` - Slot within the owning queue, 0 if stand-alone
    pub fn new(
        channel_id: u32,
        description: BufferDescription,
        queue_index: u64,
    ) -> io::Result<Arc<ProducerChannel>> {
        // Channel ids restart per service instance, so region names carry a
        // process-unique sequence instead.
        static NEXT_REGION: AtomicU64 = AtomicU64::new(0);
        let region = format!(
            "dmxp_bufferhub_{}_{}",
            std::process::id(),
            NEXT_REGION.fetch_add(1, Ordering::Relaxed)
        );
        let block = SharedBlock::allocate(description, queue_index, Some(&region))?;

        Ok(Arc::new(ProducerChannel {
            channel_id: AtomicU32::new(channel_id),
            block,
            events: ChannelEvents::new(),
            state: Mutex::new(ProducerState {
                producer_owns: true,
                pending_consumers: 0,
                active_mask: 0,
                orphaned_mask: 0,
                consumers: Vec::new(),
                post_fence: Fence::empty(),
                returned_fence: Fence::empty(),
                name: None,
                owner_uid: NO_CHECK,
                owner_gid: NO_CHECK,
            }),
        }))
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id.load(Ordering::Relaxed)
    }

    /// The producer's channel id IS the externally visible buffer id.
    pub fn buffer_id(&self) -> u32 {
        self.channel_id()
    }

    pub(crate) fn set_channel_id(&self, channel_id: u32) {
        self.channel_id.store(channel_id, Ordering::Relaxed);
    }

    pub fn description(&self) -> &BufferDescription {
        self.block.description()
    }

    pub fn block(&self) -> &SharedBlock {
        &self.block
    }

    /// Event word the producer-side client waits on (available / hangup).
    pub fn events(&self) -> &ChannelEvents {
        &self.events
    }

    pub fn pending_consumers(&self) -> usize {
        self.state.lock().pending_consumers
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    pub fn name(&self) -> Option<String> {
        self.state.lock().name.clone()
    }

    /// Publish the current buffer contents.
    ///
    /// Fails `WouldBlock` unless the producer currently owns the buffer
    /// (a second post before gaining back is a protocol violation).
    pub fn post(&self, fence: Fence) -> io::Result<()> {
        let mut st = self.state.lock();
        if !st.producer_owns {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "Post while not gained",
            ));
        }

        st.post_fence = fence;
        // New cycle: drop whatever guard fence the previous orphan handling
        // may have armed.
        st.returned_fence = Fence::empty();
        st.producer_owns = false;

        let mut pending_mask = 0u64;
        let mut pending = 0usize;
        for (bit, weak) in &st.consumers {
            if let Some(consumer) = weak.upgrade() {
                if consumer.on_producer_posted() {
                    pending_mask |= *bit;
                    pending += 1;
                }
            }
        }
        st.pending_consumers = pending;

        // Single atomic step: producer bit out, pending consumer bits in.
        // With zero attached consumers the word goes to 0 and the frame
        // simply stays posted until someone attaches.
        self.block.post_with_mask(pending_mask);
        Ok(())
    }

    /// Fire-and-forget post with no fence: the impulse variant for callers
    /// that do not observe success or failure.
    pub fn post_impulse(&self) {
        if let Err(e) = self.post(Fence::empty()) {
            debug!("producer {}: impulse post dropped: {}", self.channel_id(), e);
        }
    }

    /// Fire-and-forget gain; the merged release fence is discarded.
    pub fn gain_impulse(&self) {
        match self.gain() {
            Ok(_fence) => {}
            Err(e) => debug!("producer {}: impulse gain dropped: {}", self.channel_id(), e),
        }
    }

    /// Reclaim write ownership once every consumer has resolved.
    ///
    /// Returns the merged release fence; the caller must wait on it before
    /// touching the buffer memory. Ownership of the fence transfers out.
    pub fn gain(&self) -> io::Result<Fence> {
        let mut st = self.state.lock();
        if st.producer_owns {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "Buffer already gained",
            ));
        }
        if st.pending_consumers > 0 {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("{} consumers still pending", st.pending_consumers),
            ));
        }

        self.events.clear(EVENT_AVAILABLE);
        st.producer_owns = true;
        st.post_fence = Fence::empty();
        self.block.gain();
        Ok(std::mem::take(&mut st.returned_fence))
    }

    /// Consumer-side acquire, called through the consumer's channel.
    ///
    /// Returns a duplicate view of the post fence; the shared fence-state
    /// bit is raised to record the consumer's release obligation.
    pub(crate) fn consumer_acquire(&self, consumer: &ConsumerChannel) -> io::Result<Fence> {
        let st = self.state.lock();
        if st.producer_owns {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "Acquire while buffer is gained",
            ));
        }

        let mut flags = consumer.flags().lock();
        if flags.acquired || flags.released {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "Acquire out of turn",
            ));
        }
        flags.acquired = true;
        self.block.set_fence_state_bit(consumer.state_bit());
        st.post_fence.try_clone()
    }

    /// Consumer-side release, called through the consumer's channel.
    ///
    /// A pending consumer may release without ever acquiring (declining the
    /// frame); releasing twice in one cycle is a protocol violation.
    pub(crate) fn consumer_release(
        &self,
        consumer: &ConsumerChannel,
        fence: Fence,
    ) -> io::Result<()> {
        let mut st = self.state.lock();
        if st.producer_owns {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "Release while buffer is gained",
            ));
        }

        {
            let mut flags = consumer.flags().lock();
            if flags.released {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "Release out of turn",
                ));
            }
            flags.acquired = false;
            flags.released = true;
        }

        if !fence.is_empty() {
            let merged = std::mem::take(&mut st.returned_fence).merge(fence);
            st.returned_fence = merged;
        }
        self.block.clear_consumer_bits(consumer.state_bit());
        self.resolve_pending(&mut st);
        Ok(())
    }

    /// Toggle a consumer's ignore mode; enabling it while the consumer holds
    /// an unresolved acquire force-releases on the spot.
    pub(crate) fn set_consumer_ignore(&self, consumer: &ConsumerChannel, ignore: bool) {
        let mut st = self.state.lock();
        let force_release = {
            let mut flags = consumer.flags().lock();
            flags.ignored = ignore;
            if ignore && flags.acquired {
                flags.acquired = false;
                flags.released = true;
                true
            } else {
                false
            }
        };

        if force_release {
            self.block.clear_consumer_bits(consumer.state_bit());
            self.resolve_pending(&mut st);
        }
    }

    /// Attach a new consumer, assigning the lowest free state bit.
    ///
    /// A consumer attaching while a frame is posted is immediately pending
    /// on that frame; a late joiner never misses the current contents.
    pub fn create_consumer(
        self: &Arc<Self>,
        channel_id: u32,
    ) -> io::Result<Arc<ConsumerChannel>> {
        let mut st = self.state.lock();
        let used = st.active_mask | st.orphaned_mask | PRODUCER_STATE_BIT;
        let bit = find_lowest_clear_bit(used).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "Too many attached consumers")
        })?;

        st.active_mask |= bit;
        let consumer = Arc::new(ConsumerChannel::new(channel_id, bit, Arc::downgrade(self)));
        st.consumers.push((bit, Arc::downgrade(&consumer)));

        if !st.producer_owns && consumer.on_producer_posted() {
            st.pending_consumers += 1;
            self.block.set_consumer_state_bit(bit);
        }
        Ok(consumer)
    }

    /// Detach a consumer; driven by the transport noticing channel closure.
    ///
    /// A consumer that vanishes while still owing a release is orphaned:
    /// its shared bits are force-cleared, its debt absorbed, and if it owed
    /// a fence signal an already-signaled guard is merged into the returned
    /// fence so the producer's release wait can never block forever.
    pub(crate) fn remove_consumer(&self, consumer: &ConsumerChannel) {
        let mut st = self.state.lock();
        // Identify the entry by pointer, not by bit: a freed bit may already
        // belong to a newer consumer by the time a stale detach arrives.
        let me = consumer as *const ConsumerChannel;
        let pos = match st.consumers.iter().position(|(_, w)| w.as_ptr() == me) {
            Some(pos) => pos,
            None => return,
        };
        let (bit, _) = st.consumers.remove(pos);
        st.active_mask &= !bit;

        let owed_state = self.block.buffer_state() & bit != 0;
        let owed_fence = self.block.fence_state() & bit != 0;
        if !(owed_state || owed_fence) {
            return;
        }

        warn!(
            "producer {}: consumer bit {:#x} detached with unresolved obligations (state={}, fence={})",
            self.channel_id(), bit, owed_state, owed_fence
        );
        st.orphaned_mask |= bit;
        self.block.clear_consumer_bits(bit);

        if owed_fence {
            // The dead consumer will never signal; arm the guard.
            match Fence::signaled() {
                Ok(guard) => {
                    let merged = std::mem::take(&mut st.returned_fence).merge(guard);
                    st.returned_fence = merged;
                }
                Err(e) => warn!(
                    "producer {}: failed to arm guard fence for orphan: {}",
                    self.channel_id(), e
                ),
            }
        }

        if owed_state {
            self.resolve_pending(&mut st);
        }
    }

    /// One consumer obligation resolved; fires the producer's available
    /// event on the transition into Released.
    fn resolve_pending(&self, st: &mut ProducerState) {
        st.pending_consumers = st.pending_consumers.saturating_sub(1);
        if st.pending_consumers > 0 {
            return;
        }

        if st.orphaned_mask != 0 {
            debug!(
                "producer {}: orphaned consumer bits {:#x} absorbed",
                self.channel_id(), st.orphaned_mask
            );
            st.orphaned_mask = 0;
        }
        self.events.signal(EVENT_AVAILABLE);
    }

    /// Stamp persistent ownership; the service owns the name directory and
    /// calls this once the name is reserved.
    pub(crate) fn make_persistent(&self, name: &str, uid: u32, gid: u32) {
        let mut st = self.state.lock();
        st.name = Some(name.to_string());
        st.owner_uid = if uid == USE_CALLER { current_uid() } else { uid };
        st.owner_gid = if gid == USE_CALLER { current_gid() } else { gid };
    }

    pub(crate) fn remove_persistence(&self) {
        self.state.lock().name = None;
    }

    /// Access predicate for persistent re-open.
    pub fn check_access(&self, uid: u32, gid: u32) -> bool {
        let st = self.state.lock();
        (st.owner_uid == NO_CHECK || st.owner_uid == uid)
            && (st.owner_gid == NO_CHECK || st.owner_gid == gid)
    }

    /// Compatibility predicate for persistent re-open.
    pub fn check_parameters(&self, description: &BufferDescription) -> bool {
        self.block.description().matches(description)
    }

    /// Fan a hangup out to every attached consumer; called by the service
    /// when this producer's channel closes.
    pub(crate) fn broadcast_hangup(&self) {
        let st = self.state.lock();
        for (_, weak) in &st.consumers {
            if let Some(consumer) = weak.upgrade() {
                consumer.events().signal(EVENT_HANGUP);
            }
        }
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    unsafe { libc::getuid() as u32 }
}

#[cfg(unix)]
fn current_gid() -> u32 {
    unsafe { libc::getgid() as u32 }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    NO_CHECK
}

#[cfg(not(unix))]
fn current_gid() -> u32 {
    NO_CHECK
}
