//! Timer core: a dedicated thread scanning each CPU core's next-alarm
//! deadline and firing a callback when it elapses.
//!
//! Mirrors the original engine's `timerEntryPoint`: each core publishes at
//! most one pending deadline (`None` meaning "no alarm armed"); the timer
//! thread wakes at the nearest of all armed deadlines (or a bounded poll
//! interval if none are armed, so a shutdown request is never missed for
//! long), fires the alarm callback for every core whose deadline has
//! elapsed, and goes back to sleep. Setting a nearer deadline than the one
//! the thread is currently sleeping on wakes it immediately via the
//! condition variable instead of waiting out the stale sleep.

use esp_time::TimeSource;
use esp_types::NUM_CORES;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Upper bound on how long the timer thread sleeps when no core has an
/// alarm armed, so a `shutdown()` call is noticed promptly.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Shared {
    deadlines: Vec<Mutex<Option<Instant>>>,
    wake: Condvar,
    wake_lock: Mutex<()>,
    shutting_down: AtomicBool,
}

/// Handle to a running timer thread. Dropping this does not stop the
/// thread; call [`TimerCore::shutdown`] and join the handle explicitly.
pub struct TimerCore {
    shared: Arc<Shared>,
}

impl TimerCore {
    /// Spawns the timer thread named `"Timer Thread"`. `on_alarm(core_id)`
    /// is invoked from the timer thread itself whenever a core's deadline
    /// elapses; it must not block.
    pub fn spawn<C, F>(clock: C, on_alarm: F) -> (Self, JoinHandle<()>)
    where
        C: TimeSource + 'static,
        F: Fn(usize) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            deadlines: (0..NUM_CORES).map(|_| Mutex::new(None)).collect(),
            wake: Condvar::new(),
            wake_lock: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("Timer Thread".to_string())
            .spawn(move || run(worker_shared, clock, on_alarm))
            .expect("failed to spawn timer thread");
        (TimerCore { shared }, handle)
    }

    /// Arms (or rearms) `core`'s alarm for `deadline`. Wakes the timer
    /// thread if this is sooner than whatever it is currently sleeping on.
    pub fn set_alarm(&self, core: usize, deadline: Instant) {
        *self.shared.deadlines[core].lock().unwrap() = Some(deadline);
        self.shared.wake.notify_all();
    }

    /// Disarms `core`'s alarm, if any.
    pub fn cancel_alarm(&self, core: usize) {
        *self.shared.deadlines[core].lock().unwrap() = None;
    }

    pub fn alarm_pending(&self, core: usize) -> bool {
        self.shared.deadlines[core].lock().unwrap().is_some()
    }

    /// Signals the timer thread to exit. The caller is responsible for
    /// joining the `JoinHandle` returned by [`Self::spawn`].
    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared.wake.notify_all();
    }
}

fn run<C, F>(shared: Arc<Shared>, clock: C, on_alarm: F)
where
    C: TimeSource,
    F: Fn(usize),
{
    loop {
        if shared.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let now = clock.now();
        let mut nearest: Option<Instant> = None;
        for (core, slot) in shared.deadlines.iter().enumerate() {
            let mut guard = slot.lock().unwrap();
            match *guard {
                Some(deadline) if deadline <= now => {
                    *guard = None;
                    drop(guard);
                    on_alarm(core);
                }
                Some(deadline) => {
                    nearest = Some(nearest.map_or(deadline, |m| m.min(deadline)));
                }
                None => {}
            }
        }

        let wake_guard = shared.wake_lock.lock().unwrap();
        if shared.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let timeout = match nearest {
            Some(deadline) => deadline.saturating_duration_since(clock.now()),
            None => IDLE_POLL_INTERVAL,
        };
        let _ = shared.wake.wait_timeout(wake_guard, timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use esp_time::FakeClock;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn fires_alarm_after_deadline() {
        let clock = FakeClock::new();
        let (tx, rx) = mpsc::channel();
        let (timers, handle) = TimerCore::spawn(clock.clone(), move |core| {
            tx.send(core).unwrap();
        });

        timers.set_alarm(1, clock.now());
        clock.advance(Duration::from_millis(1));
        timers.shared_wake_for_test();

        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(fired, 1);

        timers.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn cancel_prevents_alarm() {
        let clock = FakeClock::new();
        let (timers, handle) = TimerCore::spawn(clock.clone(), |_core| {
            panic!("alarm should not fire after cancellation");
        });
        timers.set_alarm(0, clock.now() + Duration::from_secs(10));
        timers.cancel_alarm(0);
        assert!(!timers.alarm_pending(0));
        timers.shutdown();
        handle.join().unwrap();
    }

    impl TimerCore {
        fn shared_wake_for_test(&self) {
            self.shared.wake.notify_all();
        }
    }
}
