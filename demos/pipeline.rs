// In demos/pipeline.rs
//
// Drives one buffer through repeated post/acquire/release cycles between a
// producer loop and a consumer thread, verifying frame contents by digest.

use dmxp_bufferhub::Core::fence::Fence;
use dmxp_bufferhub::Hub::{BufferHubService, EVENT_AVAILABLE, EVENT_HANGUP};
use dmxp_bufferhub::Hub::Structs::Buffer_Structs::BufferDescription;
use sha2::{Digest, Sha256};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DIGEST_SIZE: u32 = 32;

fn fill_frame(data: &mut [u8], frame: usize) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (frame + i) as u8;
    }
}

fn main() -> std::io::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <num_frames>", args[0]);
        std::process::exit(1);
    }
    let num_frames: usize = args[1].parse().expect("Invalid number of frames");

    let hub = BufferHubService::new();
    let producer = hub.create_buffer(BufferDescription {
        width: 640,
        height: 480,
        format: 1,
        usage: 0,
        metadata_size: DIGEST_SIZE,
    })?;
    let consumer = hub.create_consumer(producer.buffer_id())?;

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_for_handler.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");

    println!(
        "Pipeline: buffer id {} ({} bytes per frame)",
        producer.buffer_id(),
        producer.block().data_size()
    );

    // Consumer thread: acquire, verify digest, release.
    let consumer_running = Arc::clone(&running);
    let consumer_thread = std::thread::spawn(move || {
        let mut verified = 0usize;
        loop {
            let events = consumer
                .events()
                .wait(EVENT_AVAILABLE | EVENT_HANGUP, Some(Duration::from_millis(100)));
            if events & EVENT_HANGUP != 0 {
                break;
            }
            if events & EVENT_AVAILABLE == 0 {
                if !consumer_running.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            }

            let fence = match consumer.acquire() {
                Ok(fence) => fence,
                Err(_) => break,
            };
            fence.wait(None).expect("post fence wait failed");

            let producer = match consumer.producer_channel() {
                Some(p) => p,
                None => break,
            };
            let block = producer.block();
            let (frame, digest) = unsafe {
                let data = std::slice::from_raw_parts(block.data_ptr(), block.data_size());
                let meta = std::slice::from_raw_parts(
                    block.user_metadata_ptr(),
                    block.user_metadata_size(),
                );
                (Sha256::digest(data), meta.to_vec())
            };
            assert_eq!(&frame[..], &digest[..], "frame digest mismatch");
            verified += 1;

            consumer.release(Fence::empty()).expect("release failed");
        }
        verified
    });

    // Producer loop: fill, digest, post, wait for the release, gain back.
    let start = std::time::Instant::now();
    let mut posted = 0usize;
    for frame in 0..num_frames {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let block = producer.block();
        unsafe {
            let data = std::slice::from_raw_parts_mut(block.data_ptr(), block.data_size());
            fill_frame(data, frame);
            let digest = Sha256::digest(&*data);
            let meta = std::slice::from_raw_parts_mut(
                block.user_metadata_ptr(),
                block.user_metadata_size(),
            );
            meta.copy_from_slice(&digest);
        }

        producer.post(Fence::empty())?;
        posted += 1;

        loop {
            producer.events().wait(EVENT_AVAILABLE, Some(Duration::from_millis(100)));
            match producer.gain() {
                Ok(fence) => {
                    fence.wait(None)?;
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    let elapsed = start.elapsed();
    running.store(false, Ordering::SeqCst);
    let verified = consumer_thread.join().expect("consumer thread panicked");

    println!(
        "Pipeline: posted {} frames, verified {} in {:.2?} ({:.0} frames/sec)",
        posted,
        verified,
        elapsed,
        posted as f64 / elapsed.as_secs_f64()
    );
    Ok(())
}
