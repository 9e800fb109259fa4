// Fence primitive tests: signal, wait, timeout, merge semantics.

#![cfg(target_os = "linux")]

use dmxp_bufferhub::Core::fence::Fence;
use std::time::Duration;

#[test]
fn empty_fence_is_always_satisfied() {
    let fence = Fence::empty();
    assert!(fence.is_empty());
    assert!(fence.wait(None).unwrap());
    assert!(fence.is_signaled().unwrap());
}

#[test]
fn unsignaled_fence_times_out() {
    let fence = Fence::new().unwrap();
    assert!(!fence.is_signaled().unwrap());
    assert!(!fence.wait(Some(Duration::from_millis(10))).unwrap());
}

#[test]
fn signal_satisfies_wait() {
    let fence = Fence::new().unwrap();
    fence.signal().unwrap();
    assert!(fence.wait(Some(Duration::from_millis(100))).unwrap());
    // Signal state is persistent, not consumed by waiting.
    assert!(fence.is_signaled().unwrap());
}

#[test]
fn signaled_constructor() {
    let fence = Fence::signaled().unwrap();
    assert!(fence.is_signaled().unwrap());
}

#[test]
fn wait_from_other_thread() {
    let fence = Fence::new().unwrap();
    let view = fence.try_clone().unwrap();

    let waiter = std::thread::spawn(move || view.wait(Some(Duration::from_secs(5))).unwrap());
    std::thread::sleep(Duration::from_millis(20));
    fence.signal().unwrap();
    assert!(waiter.join().unwrap());
}

#[test]
fn merge_waits_for_both() {
    // Either signal order must give the same merged result.
    for signal_first in [0, 1] {
        let a = Fence::new().unwrap();
        let b = Fence::new().unwrap();
        let merged = a.try_clone().unwrap().merge(b.try_clone().unwrap());

        assert!(!merged.is_signaled().unwrap());

        let (first, second) = if signal_first == 0 { (&a, &b) } else { (&b, &a) };
        first.signal().unwrap();
        assert!(
            !merged.is_signaled().unwrap(),
            "merged fence satisfied with only one input signaled"
        );

        second.signal().unwrap();
        assert!(merged.wait(Some(Duration::from_millis(100))).unwrap());
    }
}

#[test]
fn merge_with_empty_is_identity() {
    let a = Fence::new().unwrap();
    let merged = a.try_clone().unwrap().merge(Fence::empty());
    assert!(!merged.is_signaled().unwrap());
    a.signal().unwrap();
    assert!(merged.is_signaled().unwrap());
}

#[test]
fn clone_observes_original_signal() {
    let fence = Fence::new().unwrap();
    let dup = fence.try_clone().unwrap();
    fence.signal().unwrap();
    assert!(dup.is_signaled().unwrap());
}
