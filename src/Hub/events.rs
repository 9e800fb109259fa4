// Per-channel edge-triggered event word, the out-of-band notification path

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::Core::futex;

/// A frame (producer side) or buffer (consumer side) is ready.
pub const EVENT_AVAILABLE: u32 = 1 << 0;

/// The peer channel has gone away.
pub const EVENT_HANGUP: u32 = 1 << 1;

/// Fire-and-forget notification bits attached to every channel.
///
/// Signalling is edge-triggered: a bit is raised once per state transition
/// and consumed by the reader. Waiters block on the word itself, so raising
/// a bit is a single store plus a wake, with no lock anywhere on the path.
pub struct ChannelEvents {
    bits: CachePadded<AtomicU32>,
}

impl Default for ChannelEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelEvents {
    pub fn new() -> Self {
        Self {
            bits: CachePadded::new(AtomicU32::new(0)),
        }
    }

    /// Raise `events` and wake every waiter.
    pub fn signal(&self, events: u32) {
        self.bits.fetch_or(events, Ordering::Release);
        futex::futex_wake_all(&self.bits);
    }

    /// Read and consume all currently pending events.
    pub fn take(&self) -> u32 {
        self.bits.swap(0, Ordering::Acquire)
    }

    /// Read pending events without consuming them.
    pub fn peek(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    /// Consume only `events`, leaving other pending bits intact.
    pub fn clear(&self, events: u32) {
        self.bits.fetch_and(!events, Ordering::AcqRel);
    }

    /// Block until any of `events` is raised, then consume and return the
    /// full pending set.
    ///
    /// # Arguments
    /// * `events` - Bits of interest
    /// * `timeout` - `None` waits indefinitely; `Some(d)` returns 0 after `d`
    pub fn wait(&self, events: u32, timeout: Option<Duration>) -> u32 {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let current = self.bits.load(Ordering::Acquire);
            if current & events != 0 {
                return self.take();
            }

            match deadline {
                None => futex::futex_wait(&self.bits, current),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return 0;
                    }
                    futex::futex_wait_timeout(&self.bits, current, d - now);
                }
            }
        }
    }
}
