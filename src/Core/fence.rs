// Fence: opaque waitable handle backed by eventfd on Linux
//
// A fence is a set of file descriptors; it is satisfied once every
// descriptor in the set has been signaled. Merging two fences therefore
// gives wait-for-both semantics, matching how release fences from several
// consumers combine into the single fence the producer waits on.

use std::io;
use std::time::{Duration, Instant};

#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// A waitable synchronization fence.
///
/// An empty fence is always satisfied; it stands for "no fence was provided"
/// and is what `Fence::default()` returns.
#[derive(Debug, Default)]
pub struct Fence {
    #[cfg(target_os = "linux")]
    fds: Vec<OwnedFd>,
    #[cfg(not(target_os = "linux"))]
    _unsupported: (),
}

#[cfg(target_os = "linux")]
impl Fence {
    /// Create a new unsignaled fence.
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fds: vec![unsafe { OwnedFd::from_raw_fd(fd) }],
        })
    }

    /// Create a fence that is already satisfied.
    ///
    /// Used as the guard merged into a producer's returned fence when a
    /// consumer dies while still owing a signal, so the producer's wait
    /// terminates regardless.
    pub fn signaled() -> io::Result<Self> {
        let fence = Self::new()?;
        fence.signal()?;
        Ok(fence)
    }

    /// Create an empty fence (always satisfied, carries no descriptors).
    pub fn empty() -> Self {
        Self { fds: Vec::new() }
    }

    /// Whether this fence carries no descriptors at all.
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Signal every descriptor in this fence.
    pub fn signal(&self) -> io::Result<()> {
        for fd in &self.fds {
            let value: u64 = 1;
            let rc = unsafe {
                libc::write(
                    fd.as_raw_fd(),
                    &value as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Wait until every descriptor is signaled.
    ///
    /// # Arguments
    /// * `timeout` - `None` waits indefinitely; `Some(d)` gives up after `d`.
    ///
    /// # Returns
    /// * `Ok(true)` once the fence is satisfied
    /// * `Ok(false)` if the timeout elapsed first
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        if self.fds.is_empty() {
            return Ok(true);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pending: Vec<i32> = self.fds.iter().map(|fd| fd.as_raw_fd()).collect();

        while !pending.is_empty() {
            let mut pollfds: Vec<libc::pollfd> = pending
                .iter()
                .map(|&fd| libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();

            // An expired deadline still polls once with a zero timeout, so a
            // fence that is already satisfied reports it.
            let poll_ms: i32 = match deadline {
                None => -1,
                Some(d) => d
                    .saturating_duration_since(Instant::now())
                    .as_millis()
                    .min(i32::MAX as u128) as i32,
            };

            let rc = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, poll_ms)
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if rc == 0 {
                return Ok(false); // timed out
            }

            pending = pollfds
                .iter()
                .filter(|p| p.revents & libc::POLLIN == 0)
                .map(|p| p.fd)
                .collect();
        }

        Ok(true)
    }

    /// Non-blocking check whether the fence is currently satisfied.
    pub fn is_signaled(&self) -> io::Result<bool> {
        self.wait(Some(Duration::ZERO))
    }

    /// Merge two fences into one satisfied only when both are.
    ///
    /// Commutative and associative; release ordering of the inputs does not
    /// matter to the merged result.
    pub fn merge(mut self, mut other: Fence) -> Fence {
        self.fds.append(&mut other.fds);
        self
    }

    /// Duplicate the fence (dup(2) on every descriptor).
    ///
    /// The duplicate observes the same signal state as the original.
    pub fn try_clone(&self) -> io::Result<Fence> {
        let mut fds = Vec::with_capacity(self.fds.len());
        for fd in &self.fds {
            let dup = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
            if dup < 0 {
                return Err(io::Error::last_os_error());
            }
            fds.push(unsafe { OwnedFd::from_raw_fd(dup) });
        }
        Ok(Fence { fds })
    }
}

#[cfg(not(target_os = "linux"))]
impl Fence {
    pub fn new() -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Fences only supported on Linux",
        ))
    }

    pub fn signaled() -> io::Result<Self> {
        Self::new()
    }

    pub fn empty() -> Self {
        Self { _unsupported: () }
    }

    pub fn is_empty(&self) -> bool {
        true
    }

    pub fn signal(&self) -> io::Result<()> {
        Ok(())
    }

    pub fn wait(&self, _timeout: Option<Duration>) -> io::Result<bool> {
        Ok(true)
    }

    pub fn is_signaled(&self) -> io::Result<bool> {
        Ok(true)
    }

    pub fn merge(self, _other: Fence) -> Fence {
        self
    }

    pub fn try_clone(&self) -> io::Result<Fence> {
        Ok(Fence::empty())
    }
}
