//! End-to-end timer-core scenarios.

use esp_time::HostClock;
use esp_timers::TimerCore;
use std::sync::mpsc;
use std::time::{Duration, Instant};

#[test]
fn s4_alarm_ordering_across_cores() {
    let (tx, rx) = mpsc::channel();
    let (timers, handle) = TimerCore::spawn(HostClock, move |core| {
        tx.send(core).unwrap();
    });

    let now = Instant::now();
    // core 0 fires first, core 1 second, core 2 never.
    timers.set_alarm(0, now + Duration::from_millis(20));
    timers.set_alarm(1, now + Duration::from_millis(80));

    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first, 0, "nearer deadline must fire first");

    let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(second, 1);

    // No third alarm should ever arrive.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    timers.shutdown();
    handle.join().unwrap();
}

#[test]
fn p5_alarm_resets_before_next_sleep() {
    let (tx, rx) = mpsc::channel();
    let (timers, handle) = TimerCore::spawn(HostClock, move |core| {
        tx.send(core).unwrap();
    });

    timers.set_alarm(2, Instant::now() + Duration::from_millis(10));
    let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(fired, 2);
    assert!(!timers.alarm_pending(2), "deadline must be reset to the sentinel before sleeping again");

    timers.shutdown();
    handle.join().unwrap();
}
