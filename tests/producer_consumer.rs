// Ownership state machine tests: post/gain/acquire/release, orphans,
// bit reuse, fence merging.

#![cfg(target_os = "linux")]

use dmxp_bufferhub::Core::fence::Fence;
use dmxp_bufferhub::Hub::Buffer::layout::{BufferState, PRODUCER_STATE_BIT};
use dmxp_bufferhub::Hub::Structs::Buffer_Structs::BufferDescription;
use dmxp_bufferhub::Hub::{BufferHubService, ProducerChannel, EVENT_AVAILABLE, EVENT_HANGUP};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

fn description() -> BufferDescription {
    BufferDescription {
        width: 16,
        height: 16,
        format: 1,
        usage: 0,
        metadata_size: 64,
    }
}

fn hub_with_buffer() -> (Arc<BufferHubService>, Arc<ProducerChannel>) {
    let hub = BufferHubService::new();
    let producer = hub.create_buffer(description()).unwrap();
    (hub, producer)
}

fn current_state(producer: &ProducerChannel) -> BufferState {
    BufferState::from_bits(producer.block().buffer_state(), producer.block().fence_state())
}

#[test]
fn new_buffer_starts_gained() {
    let (_hub, producer) = hub_with_buffer();
    assert_eq!(producer.block().buffer_state(), PRODUCER_STATE_BIT);
    assert_eq!(current_state(&producer), BufferState::Gained);

    // Gain while already gained is its own error, distinct from busy.
    let err = producer.gain().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[test]
fn double_post_is_busy() {
    let (_hub, producer) = hub_with_buffer();
    producer.post(Fence::empty()).unwrap();
    let err = producer.post(Fence::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock);
}

#[test]
fn single_writer_invariant() {
    let (hub, producer) = hub_with_buffer();
    let c1 = hub.create_consumer(producer.buffer_id()).unwrap();
    let c2 = hub.create_consumer(producer.buffer_id()).unwrap();

    producer.post(Fence::empty()).unwrap();
    assert_eq!(producer.pending_consumers(), 2);
    assert_eq!(current_state(&producer), BufferState::Posted);

    assert_eq!(producer.gain().unwrap_err().kind(), ErrorKind::WouldBlock);

    c1.acquire().unwrap();
    assert_eq!(current_state(&producer), BufferState::PartiallyAcquired);
    c1.release(Fence::empty()).unwrap();
    assert_eq!(producer.gain().unwrap_err().kind(), ErrorKind::WouldBlock);

    c2.release(Fence::empty()).unwrap();
    assert_eq!(current_state(&producer), BufferState::Released);
    producer.gain().unwrap();
    assert_eq!(current_state(&producer), BufferState::Gained);
}

#[test]
fn release_transition_fires_available_event() {
    let (hub, producer) = hub_with_buffer();
    let consumer = hub.create_consumer(producer.buffer_id()).unwrap();

    producer.post(Fence::empty()).unwrap();
    assert_eq!(consumer.events().peek() & EVENT_AVAILABLE, EVENT_AVAILABLE);

    consumer.acquire().unwrap();
    consumer.release(Fence::empty()).unwrap();
    let events = producer.events().wait(EVENT_AVAILABLE, Some(Duration::from_secs(1)));
    assert_eq!(events & EVENT_AVAILABLE, EVENT_AVAILABLE);
}

#[test]
fn no_lost_frame_with_zero_consumers() {
    let (hub, producer) = hub_with_buffer();

    // Nobody is listening; the frame stays posted rather than dropped.
    producer.post(Fence::empty()).unwrap();
    assert_eq!(producer.block().buffer_state(), 0);
    assert_eq!(producer.pending_consumers(), 0);

    // A late consumer still receives exactly that frame.
    let consumer = hub.create_consumer(producer.buffer_id()).unwrap();
    assert_eq!(producer.pending_consumers(), 1);
    assert_eq!(consumer.events().peek() & EVENT_AVAILABLE, EVENT_AVAILABLE);
    assert_eq!(current_state(&producer), BufferState::Posted);

    consumer.acquire().unwrap();
    consumer.release(Fence::empty()).unwrap();
    producer.gain().unwrap();
}

#[test]
fn late_attach_while_posted_becomes_pending() {
    let (hub, producer) = hub_with_buffer();
    let c1 = hub.create_consumer(producer.buffer_id()).unwrap();

    producer.post(Fence::empty()).unwrap();
    c1.acquire().unwrap();

    let c2 = hub.create_consumer(producer.buffer_id()).unwrap();
    assert_eq!(producer.pending_consumers(), 2);

    c1.release(Fence::empty()).unwrap();
    assert_eq!(producer.gain().unwrap_err().kind(), ErrorKind::WouldBlock);

    c2.acquire().unwrap();
    c2.release(Fence::empty()).unwrap();
    producer.gain().unwrap();
}

#[test]
fn orphan_self_heals() {
    let (hub, producer) = hub_with_buffer();
    let c1 = hub.create_consumer(producer.buffer_id()).unwrap();
    let c2 = hub.create_consumer(producer.buffer_id()).unwrap();
    let c3 = hub.create_consumer(producer.buffer_id()).unwrap();

    producer.post(Fence::empty()).unwrap();
    assert_eq!(producer.pending_consumers(), 3);

    // Consumer #2 acquires, then its channel dies without releasing.
    c2.acquire().unwrap();
    hub.close_channel(c2.channel_id()).unwrap();
    assert_eq!(producer.pending_consumers(), 2);

    c1.release(Fence::empty()).unwrap();
    c3.release(Fence::empty()).unwrap();

    // The orphan's debt was absorbed; gain succeeds and its merged fence is
    // already satisfied by the armed guard.
    let fence = producer.gain().unwrap();
    assert!(fence.wait(Some(Duration::from_millis(100))).unwrap());
}

#[test]
fn orphan_of_sole_consumer_unblocks_producer_immediately() {
    let (hub, producer) = hub_with_buffer();
    let consumer = hub.create_consumer(producer.buffer_id()).unwrap();

    producer.post(Fence::empty()).unwrap();
    consumer.acquire().unwrap();
    hub.close_channel(consumer.channel_id()).unwrap();

    assert_eq!(producer.pending_consumers(), 0);
    let fence = producer.gain().unwrap();
    assert!(fence.wait(Some(Duration::from_millis(100))).unwrap());
}

#[test]
fn clean_detach_leaves_no_orphan() {
    let (hub, producer) = hub_with_buffer();
    let c1 = hub.create_consumer(producer.buffer_id()).unwrap();
    let c2 = hub.create_consumer(producer.buffer_id()).unwrap();

    producer.post(Fence::empty()).unwrap();
    c1.acquire().unwrap();
    c1.release(Fence::empty()).unwrap();

    // c1 resolved everything before detaching.
    hub.close_channel(c1.channel_id()).unwrap();
    assert_eq!(producer.pending_consumers(), 1);

    c2.release(Fence::empty()).unwrap();
    producer.gain().unwrap();
}

#[test]
fn consumer_bits_are_unique_and_reusable() {
    let (hub, producer) = hub_with_buffer();

    let first: Vec<_> = (0..3)
        .map(|_| hub.create_consumer(producer.buffer_id()).unwrap())
        .collect();
    let mut bits: Vec<u64> = first.iter().map(|c| c.state_bit()).collect();
    bits.sort_unstable();
    bits.dedup();
    assert_eq!(bits.len(), 3, "active consumers share a state bit");

    for consumer in &first {
        hub.close_channel(consumer.channel_id()).unwrap();
    }

    // Freed bits may be handed out again once removal completed.
    let second: Vec<_> = (0..3)
        .map(|_| hub.create_consumer(producer.buffer_id()).unwrap())
        .collect();
    let mut bits2: Vec<u64> = second.iter().map(|c| c.state_bit()).collect();
    bits2.sort_unstable();
    bits2.dedup();
    assert_eq!(bits2.len(), 3);
}

#[test]
fn orphaned_bit_is_not_reused_until_cycle_completes() {
    let (hub, producer) = hub_with_buffer();
    let c1 = hub.create_consumer(producer.buffer_id()).unwrap();
    let c2 = hub.create_consumer(producer.buffer_id()).unwrap();
    let orphan_bit = c1.state_bit();

    producer.post(Fence::empty()).unwrap();
    c1.acquire().unwrap();
    hub.close_channel(c1.channel_id()).unwrap();

    // c2 is still pending, so the cycle is not over: the orphaned bit stays
    // reserved and a new consumer must get a different one.
    let c3 = hub.create_consumer(producer.buffer_id()).unwrap();
    assert_ne!(c3.state_bit(), orphan_bit);

    c2.release(Fence::empty()).unwrap();
    c3.release(Fence::empty()).unwrap();
    producer.gain().unwrap();

    // Cycle complete, orphan bookkeeping cleared: the bit is free again.
    let c4 = hub.create_consumer(producer.buffer_id()).unwrap();
    assert_eq!(c4.state_bit(), orphan_bit);
}

#[test]
fn fence_merge_waits_for_both_release_orders() {
    for reversed in [false, true] {
        let (hub, producer) = hub_with_buffer();
        let c1 = hub.create_consumer(producer.buffer_id()).unwrap();
        let c2 = hub.create_consumer(producer.buffer_id()).unwrap();

        producer.post(Fence::empty()).unwrap();
        c1.acquire().unwrap();
        c2.acquire().unwrap();

        let fence_a = Fence::new().unwrap();
        let fence_b = Fence::new().unwrap();

        let (first, first_fence, second, second_fence) = if reversed {
            (&c2, &fence_b, &c1, &fence_a)
        } else {
            (&c1, &fence_a, &c2, &fence_b)
        };
        first.release(first_fence.try_clone().unwrap()).unwrap();
        second.release(second_fence.try_clone().unwrap()).unwrap();

        let merged = producer.gain().unwrap();
        assert!(!merged.is_signaled().unwrap());

        fence_a.signal().unwrap();
        assert!(
            !merged.is_signaled().unwrap(),
            "merged release fence satisfied with one signal outstanding"
        );

        fence_b.signal().unwrap();
        assert!(merged.wait(Some(Duration::from_millis(100))).unwrap());
    }
}

#[test]
fn ignored_consumer_is_auto_resolved() {
    let (hub, producer) = hub_with_buffer();
    let consumer = hub.create_consumer(producer.buffer_id()).unwrap();
    consumer.set_ignore(true).unwrap();

    producer.post(Fence::empty()).unwrap();
    assert_eq!(producer.pending_consumers(), 0);
    assert_eq!(consumer.events().peek() & EVENT_AVAILABLE, 0);
    producer.gain().unwrap();
}

#[test]
fn ignore_mid_acquire_force_releases() {
    let (hub, producer) = hub_with_buffer();
    let consumer = hub.create_consumer(producer.buffer_id()).unwrap();

    producer.post(Fence::empty()).unwrap();
    consumer.acquire().unwrap();
    consumer.set_ignore(true).unwrap();

    assert_eq!(producer.pending_consumers(), 0);
    producer.gain().unwrap();
}

#[test]
fn acquire_and_release_out_of_turn() {
    let (hub, producer) = hub_with_buffer();
    let consumer = hub.create_consumer(producer.buffer_id()).unwrap();

    // Nothing posted yet.
    assert_eq!(consumer.acquire().unwrap_err().kind(), ErrorKind::WouldBlock);

    producer.post(Fence::empty()).unwrap();
    consumer.acquire().unwrap();
    assert_eq!(consumer.acquire().unwrap_err().kind(), ErrorKind::WouldBlock);

    consumer.release(Fence::empty()).unwrap();
    assert_eq!(
        consumer.release(Fence::empty()).unwrap_err().kind(),
        ErrorKind::WouldBlock
    );
    assert_eq!(consumer.acquire().unwrap_err().kind(), ErrorKind::WouldBlock);
}

#[test]
fn producer_death_breaks_consumers() {
    let (hub, producer) = hub_with_buffer();
    let consumer = hub.create_consumer(producer.buffer_id()).unwrap();
    let id = producer.buffer_id();
    drop(producer);

    hub.close_channel(id).unwrap();
    assert_eq!(consumer.events().peek() & EVENT_HANGUP, EVENT_HANGUP);
    assert_eq!(consumer.acquire().unwrap_err().kind(), ErrorKind::BrokenPipe);
    assert!(!consumer.is_producer_alive());
}

#[test]
fn consumer_bit_space_is_bounded() {
    let (hub, producer) = hub_with_buffer();
    let consumers: Vec<_> = (0..63)
        .map(|_| hub.create_consumer(producer.buffer_id()).unwrap())
        .collect();
    assert_eq!(consumers.len(), 63);

    let err = hub.create_consumer(producer.buffer_id()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
}

#[test]
fn repeated_cycles_with_threads() {
    let (hub, producer) = hub_with_buffer();
    let consumers: Vec<_> = (0..2)
        .map(|_| hub.create_consumer(producer.buffer_id()).unwrap())
        .collect();
    let frames = 50usize;

    let mut handles = Vec::new();
    for consumer in consumers {
        handles.push(std::thread::spawn(move || {
            let mut seen = 0usize;
            while seen < frames {
                let events = consumer
                    .events()
                    .wait(EVENT_AVAILABLE, Some(Duration::from_secs(5)));
                if events & EVENT_AVAILABLE == 0 {
                    panic!("consumer starved after {} frames", seen);
                }

                consumer.acquire().unwrap();
                if fastrand::bool() {
                    std::thread::sleep(Duration::from_micros(fastrand::u64(0..500)));
                }
                consumer.release(Fence::empty()).unwrap();
                seen += 1;
            }
            seen
        }));
    }

    for _ in 0..frames {
        producer.post(Fence::empty()).unwrap();
        loop {
            producer
                .events()
                .wait(EVENT_AVAILABLE, Some(Duration::from_secs(5)));
            match producer.gain() {
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => panic!("gain failed: {}", e),
            }
        }
    }

    for handle in handles {
        assert_eq!(handle.join().unwrap(), frames);
    }
}

#[test]
fn impulse_variants_never_report() {
    let (hub, producer) = hub_with_buffer();
    let consumer = hub.create_consumer(producer.buffer_id()).unwrap();

    // A full cycle driven by the fire-and-forget variants.
    producer.post_impulse();
    assert_eq!(producer.pending_consumers(), 1);
    consumer.acquire_impulse();
    consumer.release_impulse();
    producer.gain_impulse();
    assert_eq!(current_state(&producer), BufferState::Gained);

    // Out-of-turn impulses are silently dropped, leaving state untouched.
    consumer.acquire_impulse();
    producer.gain_impulse();
    assert_eq!(current_state(&producer), BufferState::Gained);
}

#[test]
fn dump_state_lists_the_world() {
    let (hub, producer) = hub_with_buffer();
    let _consumer = hub.create_consumer(producer.buffer_id()).unwrap();
    producer.post(Fence::empty()).unwrap();

    let dump = hub.dump_state();
    assert!(dump.contains("buffer producers:"));
    assert!(dump.contains(&format!("id={}", producer.buffer_id())));
    assert!(dump.contains("consumers=1"));
    assert!(dump.contains("pending=1"));
    assert!(dump.contains("Posted"));
}
