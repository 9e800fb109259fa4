use std::sync::Arc;

use lazy_static::lazy_static;

use crate::Core::fence::Fence;
use crate::Hub::{BufferHubService, ConsumerChannel, ProducerChannel};
use crate::Hub::Structs::Buffer_Structs::BufferDescription;

// Error codes
const BUFFERHUB_SUCCESS: i32 = 0;
const BUFFERHUB_ERROR_NULL_POINTER: i32 = -1;
const BUFFERHUB_ERROR_BUSY: i32 = -2;
const BUFFERHUB_ERROR_ALLOCATION_FAILED: i32 = -3;
const BUFFERHUB_ERROR_NOT_FOUND: i32 = -4;
const BUFFERHUB_ERROR_BROKEN_PIPE: i32 = -5;
const BUFFERHUB_ERROR_INTERNAL: i32 = -6;

lazy_static! {
    /// The process-global hub every FFI client talks to.
    static ref GLOBAL_HUB: Arc<BufferHubService> = BufferHubService::new();
}

fn error_code(e: &std::io::Error) -> i32 {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::AlreadyExists => BUFFERHUB_ERROR_BUSY,
        std::io::ErrorKind::NotFound => BUFFERHUB_ERROR_NOT_FOUND,
        std::io::ErrorKind::BrokenPipe => BUFFERHUB_ERROR_BROKEN_PIPE,
        _ => BUFFERHUB_ERROR_INTERNAL,
    }
}

/// Handle to a producer channel (opaque pointer)
pub struct ProducerHandle {
    inner: Arc<ProducerChannel>,
}

/// Handle to a consumer channel (opaque pointer)
pub struct ConsumerHandle {
    inner: Arc<ConsumerChannel>,
}

// -----------------------------------------------------------------------------
// Producer API
// -----------------------------------------------------------------------------

/// Create a new buffer and return its producer handle.
///
/// # Arguments
/// * `width`, `height`, `format`, `usage` - Buffer geometry
/// * `metadata_size` - Bytes of user metadata to reserve
///
/// # Returns
/// * Pointer to `ProducerHandle`, or NULL on failure.
#[no_mangle]
pub extern "C" fn bufferhub_producer_new(
    width: u32,
    height: u32,
    format: u32,
    usage: u64,
    metadata_size: u32,
) -> *mut ProducerHandle {
    let description = BufferDescription {
        width,
        height,
        format,
        usage,
        metadata_size,
    };

    match GLOBAL_HUB.create_buffer(description) {
        Ok(producer) => Box::into_raw(Box::new(ProducerHandle { inner: producer })),
        Err(e) => {
            eprintln!("FFI Error: Failed to create buffer: {}", e);
            std::ptr::null_mut()
        }
    }
}

/// Buffer id of a producer handle (also its channel id).
#[no_mangle]
pub extern "C" fn bufferhub_producer_id(handle: *const ProducerHandle) -> u32 {
    if handle.is_null() {
        return 0;
    }
    unsafe { (*handle).inner.buffer_id() }
}

/// Post the current buffer contents with no fence attached.
#[no_mangle]
pub extern "C" fn bufferhub_producer_post(handle: *mut ProducerHandle) -> i32 {
    if handle.is_null() {
        return BUFFERHUB_ERROR_NULL_POINTER;
    }
    let producer = unsafe { &(*handle).inner };
    match producer.post(Fence::empty()) {
        Ok(()) => BUFFERHUB_SUCCESS,
        Err(e) => error_code(&e),
    }
}

/// Gain the buffer back, blocking on the merged release fence.
#[no_mangle]
pub extern "C" fn bufferhub_producer_gain(handle: *mut ProducerHandle) -> i32 {
    if handle.is_null() {
        return BUFFERHUB_ERROR_NULL_POINTER;
    }
    let producer = unsafe { &(*handle).inner };
    match producer.gain() {
        Ok(fence) => match fence.wait(None) {
            Ok(_) => BUFFERHUB_SUCCESS,
            Err(_) => BUFFERHUB_ERROR_INTERNAL,
        },
        Err(e) => error_code(&e),
    }
}

/// Free a producer handle and close its channel.
#[no_mangle]
pub extern "C" fn bufferhub_producer_free(handle: *mut ProducerHandle) {
    if !handle.is_null() {
        unsafe {
            let handle = Box::from_raw(handle);
            let _ = GLOBAL_HUB.close_channel(handle.inner.channel_id());
        }
    }
}

// -----------------------------------------------------------------------------
// Consumer API
// -----------------------------------------------------------------------------

/// Attach a new consumer to the buffer registered under `buffer_id`.
///
/// # Returns
/// * Pointer to `ConsumerHandle`, or NULL on failure.
#[no_mangle]
pub extern "C" fn bufferhub_consumer_new(buffer_id: u32) -> *mut ConsumerHandle {
    match GLOBAL_HUB.create_consumer(buffer_id) {
        Ok(consumer) => Box::into_raw(Box::new(ConsumerHandle { inner: consumer })),
        Err(e) => {
            eprintln!("FFI Error: Failed to attach consumer: {}", e);
            std::ptr::null_mut()
        }
    }
}

/// Acquire the posted frame, blocking on the post fence.
#[no_mangle]
pub extern "C" fn bufferhub_consumer_acquire(handle: *mut ConsumerHandle) -> i32 {
    if handle.is_null() {
        return BUFFERHUB_ERROR_NULL_POINTER;
    }
    let consumer = unsafe { &(*handle).inner };
    match consumer.acquire() {
        Ok(fence) => match fence.wait(None) {
            Ok(_) => BUFFERHUB_SUCCESS,
            Err(_) => BUFFERHUB_ERROR_INTERNAL,
        },
        Err(e) => error_code(&e),
    }
}

/// Release the frame with no fence attached.
#[no_mangle]
pub extern "C" fn bufferhub_consumer_release(handle: *mut ConsumerHandle) -> i32 {
    if handle.is_null() {
        return BUFFERHUB_ERROR_NULL_POINTER;
    }
    let consumer = unsafe { &(*handle).inner };
    match consumer.release(Fence::empty()) {
        Ok(()) => BUFFERHUB_SUCCESS,
        Err(e) => error_code(&e),
    }
}

/// Free a consumer handle and close its channel, orphaning any unresolved
/// obligations back onto the producer.
#[no_mangle]
pub extern "C" fn bufferhub_consumer_free(handle: *mut ConsumerHandle) {
    if !handle.is_null() {
        unsafe {
            let handle = Box::from_raw(handle);
            let _ = GLOBAL_HUB.close_channel(handle.inner.channel_id());
        }
    }
}
