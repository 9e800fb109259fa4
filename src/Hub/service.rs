// Process-wide registry: channel ids, persistent names, teardown dispatch

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use log::debug;
use parking_lot::Mutex;

use crate::Hub::consumer::ConsumerChannel;
use crate::Hub::consumer_queue::ConsumerQueueChannel;
use crate::Hub::producer::ProducerChannel;
use crate::Hub::producer_queue::ProducerQueueChannel;
use crate::Hub::Buffer::layout::BufferState;
use crate::Hub::Structs::Buffer_Structs::{BufferDescription, QueueConfig, QueueInfo};

#[derive(Clone)]
enum ChannelKind {
    Producer(Arc<ProducerChannel>),
    Consumer(Arc<ConsumerChannel>),
    ProducerQueue(Arc<ProducerQueueChannel>),
    ConsumerQueue(Arc<ConsumerQueueChannel>),
}

struct NamedEntry {
    producer: Arc<ProducerChannel>,
    /// Whether a live channel id currently maps to this buffer; a detached
    /// entry is parked here awaiting re-attachment.
    attached: bool,
}

/// The broker's front door.
///
/// Owns every live channel object through the id registry, plus the
/// name directory for persistent buffers. Registry operations serialize on
/// the maps' locks; the per-buffer ownership transitions never run under
/// them, so registry traffic and in-flight post/acquire/release calls do
/// not block each other.
pub struct BufferHubService {
    channels: Mutex<HashMap<u32, ChannelKind>>,
    named_buffers: Mutex<HashMap<String, NamedEntry>>,
    next_channel_id: CachePadded<AtomicU32>,
}

impl Default for BufferHubService {
    fn default() -> Self {
        Self::new_inner()
    }
}

impl BufferHubService {
    fn new_inner() -> BufferHubService {
        BufferHubService {
            channels: Mutex::new(HashMap::new()),
            named_buffers: Mutex::new(HashMap::new()),
            next_channel_id: CachePadded::new(AtomicU32::new(1)),
        }
    }

    pub fn new() -> Arc<BufferHubService> {
        Arc::new(Self::new_inner())
    }

    fn next_id(&self) -> u32 {
        self.next_channel_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, id: u32, kind: ChannelKind) {
        self.channels.lock().insert(id, kind);
    }

    fn lookup(&self, id: u32) -> io::Result<ChannelKind> {
        self.channels.lock().get(&id).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("Channel {} not found", id))
        })
    }

    /// Create a stand-alone buffer; the new producer channel's id is the
    /// buffer id.
    pub fn create_buffer(
        &self,
        description: BufferDescription,
    ) -> io::Result<Arc<ProducerChannel>> {
        let id = self.next_id();
        let producer = ProducerChannel::new(id, description, 0)?;
        self.register(id, ChannelKind::Producer(producer.clone()));
        Ok(producer)
    }

    /// Queue-side buffer creation; same path, but stamped with the slot.
    pub(crate) fn create_queue_buffer(
        &self,
        description: BufferDescription,
        queue_index: u64,
    ) -> io::Result<Arc<ProducerChannel>> {
        let id = self.next_id();
        let producer = ProducerChannel::new(id, description, queue_index)?;
        self.register(id, ChannelKind::Producer(producer.clone()));
        Ok(producer)
    }

    /// Look up a producer by buffer id.
    pub fn get_buffer(&self, id: u32) -> io::Result<Arc<ProducerChannel>> {
        match self.lookup(id)? {
            ChannelKind::Producer(producer) => Ok(producer),
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Channel {} is not a producer", id),
            )),
        }
    }

    /// Attach a new consumer to the producer registered under `producer_id`.
    pub fn create_consumer(&self, producer_id: u32) -> io::Result<Arc<ConsumerChannel>> {
        let producer = self.get_buffer(producer_id)?;
        self.create_consumer_for(&producer)
    }

    pub(crate) fn create_consumer_for(
        &self,
        producer: &Arc<ProducerChannel>,
    ) -> io::Result<Arc<ConsumerChannel>> {
        let id = self.next_id();
        let consumer = producer.create_consumer(id)?;
        self.register(id, ChannelKind::Consumer(consumer.clone()));
        Ok(consumer)
    }

    /// Create a persistent buffer, or re-attach an existing detached one if
    /// the name, access rights and parameters all line up.
    pub fn create_persistent_buffer(
        &self,
        name: &str,
        uid: u32,
        gid: u32,
        description: BufferDescription,
    ) -> io::Result<Arc<ProducerChannel>> {
        let mut named = self.named_buffers.lock();
        if let Some(entry) = named.get_mut(name) {
            if !entry.producer.check_access(uid, gid) {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("Access to persistent buffer \"{}\" denied", name),
                ));
            }
            if !entry.producer.check_parameters(&description) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Parameter mismatch for persistent buffer \"{}\"", name),
                ));
            }
            if entry.attached {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("Persistent buffer \"{}\" is still attached", name),
                ));
            }

            let id = self.next_id();
            entry.producer.set_channel_id(id);
            entry.attached = true;
            debug!("persistent buffer \"{}\" re-attached as channel {}", name, id);
            self.register(id, ChannelKind::Producer(entry.producer.clone()));
            return Ok(entry.producer.clone());
        }

        let id = self.next_id();
        let producer = ProducerChannel::new(id, description, 0)?;
        producer.make_persistent(name, uid, gid);
        named.insert(
            name.to_string(),
            NamedEntry {
                producer: producer.clone(),
                attached: true,
            },
        );
        self.register(id, ChannelKind::Producer(producer.clone()));
        Ok(producer)
    }

    /// Re-open an existing persistent buffer by name.
    pub fn get_persistent_buffer(
        &self,
        name: &str,
        uid: u32,
        gid: u32,
    ) -> io::Result<Arc<ProducerChannel>> {
        let mut named = self.named_buffers.lock();
        let entry = named.get_mut(name).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("No persistent buffer named \"{}\"", name),
            )
        })?;

        if !entry.producer.check_access(uid, gid) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("Access to persistent buffer \"{}\" denied", name),
            ));
        }
        if entry.attached {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Persistent buffer \"{}\" is still attached", name),
            ));
        }

        let id = self.next_id();
        entry.producer.set_channel_id(id);
        entry.attached = true;
        debug!("persistent buffer \"{}\" re-attached as channel {}", name, id);
        self.register(id, ChannelKind::Producer(entry.producer.clone()));
        Ok(entry.producer.clone())
    }

    /// Register an already-created buffer under a persistent name.
    pub fn make_persistent(
        &self,
        producer_id: u32,
        name: &str,
        uid: u32,
        gid: u32,
    ) -> io::Result<()> {
        let producer = self.get_buffer(producer_id)?;
        let mut named = self.named_buffers.lock();
        if named.contains_key(name) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Persistent buffer \"{}\" already exists", name),
            ));
        }
        producer.make_persistent(name, uid, gid);
        named.insert(
            name.to_string(),
            NamedEntry {
                producer,
                attached: true,
            },
        );
        Ok(())
    }

    /// Drop a buffer's persistent registration; it lives and dies with its
    /// channel from here on.
    pub fn remove_persistence(&self, producer_id: u32) -> io::Result<()> {
        let producer = self.get_buffer(producer_id)?;
        let name = match producer.name() {
            Some(name) => name,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Channel {} has no persistent name", producer_id),
                ))
            }
        };
        producer.remove_persistence();
        self.named_buffers.lock().remove(&name);
        Ok(())
    }

    /// Create a producer queue.
    pub fn create_producer_queue(
        self: &Arc<Self>,
        config: QueueConfig,
    ) -> Arc<ProducerQueueChannel> {
        let id = self.next_id();
        let queue = ProducerQueueChannel::new(id, config, Arc::downgrade(self));
        self.register(id, ChannelKind::ProducerQueue(queue.clone()));
        queue
    }

    /// Subscribe a consumer queue to the producer queue `queue_id`.
    pub fn create_consumer_queue(
        &self,
        queue_id: u32,
        silent: bool,
    ) -> io::Result<Arc<ConsumerQueueChannel>> {
        let queue = match self.lookup(queue_id)? {
            ChannelKind::ProducerQueue(queue) => queue,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Channel {} is not a producer queue", queue_id),
                ))
            }
        };
        let id = self.next_id();
        let consumer_queue = queue.create_consumer_queue(id, silent);
        self.register(id, ChannelKind::ConsumerQueue(consumer_queue.clone()));
        Ok(consumer_queue)
    }

    /// GetQueueInfo against a producer queue id.
    pub fn queue_info(&self, queue_id: u32) -> io::Result<QueueInfo> {
        match self.lookup(queue_id)? {
            ChannelKind::ProducerQueue(queue) => Ok(queue.queue_info()),
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Channel {} is not a producer queue", queue_id),
            )),
        }
    }

    /// Transport-side notification that a channel went away.
    ///
    /// Driven for clean detaches and peer crashes alike: a consumer is
    /// removed from its producer (orphaning its obligations if any), a
    /// producer hangs up its consumers, and a persistent producer is parked
    /// in the name directory instead of dying.
    pub fn close_channel(&self, id: u32) -> io::Result<()> {
        let kind = {
            let mut channels = self.channels.lock();
            channels.remove(&id).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("Channel {} not found", id))
            })?
        };

        match kind {
            ChannelKind::Producer(producer) => {
                if let Some(name) = producer.name() {
                    let mut named = self.named_buffers.lock();
                    if let Some(entry) = named.get_mut(&name) {
                        entry.attached = false;
                        debug!("persistent buffer \"{}\" detached", name);
                        return Ok(());
                    }
                }
                producer.broadcast_hangup();
            }
            ChannelKind::Consumer(consumer) => {
                consumer.detach();
            }
            ChannelKind::ProducerQueue(queue) => {
                queue.broadcast_hangup();
            }
            ChannelKind::ConsumerQueue(_) => {}
        }
        Ok(())
    }

    /// Human-readable state listing for operators; not contractual.
    pub fn dump_state(&self) -> String {
        let snapshot: Vec<(u32, ChannelKind)> = {
            let channels = self.channels.lock();
            let mut entries: Vec<_> =
                channels.iter().map(|(id, kind)| (*id, kind.clone())).collect();
            entries.sort_by_key(|(id, _)| *id);
            entries
        };

        let mut out = String::new();
        let _ = writeln!(out, "buffer producers:");
        for (id, kind) in &snapshot {
            if let ChannelKind::Producer(p) = kind {
                let d = p.description();
                let state = p.block().buffer_state();
                let fence = p.block().fence_state();
                let _ = writeln!(
                    out,
                    "  id={} consumers={} pending={} geometry={}x{} format={} usage={:#x} \
                     state={:#018x} ({:?}) fence={:#018x} queue_index={} name={:?}",
                    id,
                    p.consumer_count(),
                    p.pending_consumers(),
                    d.width,
                    d.height,
                    d.format,
                    d.usage,
                    state,
                    BufferState::from_bits(state, fence),
                    fence,
                    p.block().queue_index(),
                    p.name().unwrap_or_default(),
                );
            }
        }

        let _ = writeln!(out, "producer queues:");
        for (id, kind) in &snapshot {
            if let ChannelKind::ProducerQueue(q) = kind {
                let info = q.queue_info();
                let _ = writeln!(
                    out,
                    "  id={} capacity={} consumers={} set={:#x} clear={:#x} deny_set={:#x} deny_clear={:#x}",
                    id,
                    info.capacity,
                    info.consumer_count,
                    info.policy.usage_set_mask,
                    info.policy.usage_clear_mask,
                    info.policy.usage_deny_set_mask,
                    info.policy.usage_deny_clear_mask,
                );
            }
        }

        let _ = writeln!(out, "consumer queues:");
        for (id, kind) in &snapshot {
            if let ChannelKind::ConsumerQueue(q) = kind {
                let _ = writeln!(
                    out,
                    "  id={} imported={} pending={} silent={}",
                    id,
                    q.imported_count(),
                    q.pending_count(),
                    q.is_silent(),
                );
            }
        }

        let _ = writeln!(out, "orphaned consumers:");
        for (id, kind) in &snapshot {
            if let ChannelKind::Consumer(c) = kind {
                if !c.is_producer_alive() {
                    let _ = writeln!(
                        out,
                        "  id={} state_bit={:#x} (producer gone)",
                        id,
                        c.state_bit(),
                    );
                }
            }
        }
        out
    }
}
