// Shared memory backend abstraction for Linux
// Uses /dev/shm files + mmap so a region can be reopened by name

use std::fmt::Debug;
use std::io;
use std::ptr;
use std::ptr::NonNull;

#[cfg(target_os = "linux")]
use std::fs::OpenOptions;
#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, IntoRawFd};
#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Shared memory backend trait for cross-platform memory mapping
pub trait SharedMemoryBackend: Send + Sync + Debug {
    /// Get a pointer to the mapped memory region
    fn as_ptr(&self) -> *mut u8;

    /// Get the size of the mapped region in bytes
    fn size(&self) -> usize;

    /// Get the underlying file descriptor
    fn raw_handle(&self) -> RawHandle;
}

/// Platform-specific handle type
#[derive(Debug, Clone, Copy)]
pub enum RawHandle {
    /// Unix file descriptor (Linux)
    Fd(i32),
}

/// Create a new shared memory region with the specified size.
///
/// # Arguments
/// * `size` - Size of the shared memory region in bytes
/// * `name` - Optional name for the shared memory region (for cross-process access)
///
/// # Returns
/// A boxed trait object implementing SharedMemoryBackend
#[cfg(target_os = "linux")]
pub fn create_shared_memory(
    size: usize,
    name: Option<&str>,
) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::create(size, name)?))
}

/// Attach to an existing shared memory region by name.
///
/// # Arguments
/// * `name` - Name of the shared memory region to attach to
/// * `size` - Minimum expected size of the region (for validation)
///
/// # Returns
/// A boxed trait object implementing SharedMemoryBackend
#[cfg(target_os = "linux")]
pub fn attach_shared_memory(
    name: &str,
    size: usize,
) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::attach(name, size)?))
}

#[cfg(not(target_os = "linux"))]
pub fn create_shared_memory(
    _size: usize,
    _name: Option<&str>,
) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn attach_shared_memory(
    _name: &str,
    _size: usize,
) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct LinuxSharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    fd: i32,
    original_ptr: Option<(*mut u8, usize)>,
}

#[cfg(target_os = "linux")]
unsafe impl Send for LinuxSharedMemory {}
#[cfg(target_os = "linux")]
unsafe impl Sync for LinuxSharedMemory {}

#[cfg(target_os = "linux")]
impl LinuxSharedMemory {
    /// Create a new shared memory region backed by a /dev/shm file
    pub fn create(size: usize, name: Option<&str>) -> io::Result<Self> {
        let shm_name = name.unwrap_or("dmxp_bufferhub");
        let path = format!("/dev/shm/{}", shm_name);

        // Create or truncate the file in /dev/shm
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::Other,
                    format!("Failed to create shared memory file at {}: {}", path, e),
                )
            })?;

        let fd = file.as_raw_fd();

        // Set size
        if unsafe { libc::ftruncate(fd, size as i64) } != 0 {
            return Err(io::Error::last_os_error());
        }

        // Keep the file descriptor alive
        let fd = file.into_raw_fd();

        let (ptr, original_ptr) = unsafe { Self::map(fd, size)? };

        Ok(Self {
            ptr: NonNull::new(ptr).unwrap(),
            size,
            fd,
            original_ptr,
        })
    }

    /// Attach to an existing /dev/shm region created by another party
    pub fn attach(name: &str, expected_size: usize) -> io::Result<Self> {
        let path = format!("/dev/shm/{}", name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Failed to open shared memory at {}: {}", path, e),
                )
            })?;

        let file_size = file.metadata()?.len() as usize;
        if file_size < expected_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Shared memory size too small: expected at least {} bytes, got {}",
                    expected_size, file_size
                ),
            ));
        }

        let fd = file.into_raw_fd();
        let (ptr, original_ptr) = unsafe {
            match Self::map(fd, file_size) {
                Ok(v) => v,
                Err(e) => {
                    libc::close(fd);
                    return Err(e);
                }
            }
        };

        Ok(Self {
            ptr: NonNull::new(ptr).unwrap(),
            size: file_size,
            fd,
            original_ptr,
        })
    }

    /// Map `size` bytes of `fd` and align the returned pointer to 128 bytes.
    ///
    /// # Safety
    /// `fd` must be a valid file descriptor of at least `size` bytes.
    unsafe fn map(fd: i32, size: usize) -> io::Result<(*mut u8, Option<(*mut u8, usize)>)> {
        let total_size = size + 127; // Extra space for alignment
        let ptr = libc::mmap(
            ptr::null_mut(),
            total_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Align the pointer to 128 bytes
        let aligned_ptr = ((ptr as usize + 127) & !127) as *mut u8;

        Ok((aligned_ptr, Some((ptr as *mut u8, total_size))))
    }
}

#[cfg(target_os = "linux")]
impl Drop for LinuxSharedMemory {
    fn drop(&mut self) {
        unsafe {
            // Use the original pointer and size for munmap
            if let Some((ptr, size)) = self.original_ptr {
                libc::munmap(ptr as *mut libc::c_void, size);
            } else {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
            libc::close(self.fd);
        }
    }
}

#[cfg(target_os = "linux")]
impl SharedMemoryBackend for LinuxSharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn raw_handle(&self) -> RawHandle {
        RawHandle::Fd(self.fd)
    }
}
