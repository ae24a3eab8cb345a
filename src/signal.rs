//! Signaling primitives backing the engine's wait protocol
//!
//! The engine assumes a host signaling layer: manual/auto-reset events, counting
//! semaphores, a waitable timer, a bounded multi-wait, and a registered-wait
//! facility. Rust has no single OS-neutral API matching that contract, so this
//! module builds it on `parking_lot`'s mutex/condvar pair, the same primitive a
//! `BlockingWaitStrategy` uses. The observable semantics match the abstract
//! contract; only the mechanism differs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A point in time a wait must not exceed, or "wait forever".
#[derive(Clone, Copy, Debug)]
pub enum Deadline {
    /// Block until signaled.
    Infinite,
    /// Never block; poll once.
    Immediate,
    /// Block until this instant.
    At(Instant),
}

impl Deadline {
    /// Build a deadline from a millisecond timeout using the engine's convention:
    /// negative means infinite, zero means poll, positive is a relative timeout.
    pub fn from_millis(ms: i32) -> Self {
        if ms < 0 {
            Deadline::Infinite
        } else if ms == 0 {
            Deadline::Immediate
        } else {
            Deadline::At(Instant::now() + Duration::from_millis(ms as u64))
        }
    }

    /// Remaining time until the deadline, or `None` if infinite.
    ///
    /// A `Some(Duration::ZERO)` means the deadline has already passed.
    pub fn remaining(self) -> Option<Duration> {
        match self {
            Deadline::Infinite => None,
            Deadline::Immediate => Some(Duration::ZERO),
            Deadline::At(at) => Some(at.saturating_duration_since(Instant::now())),
        }
    }

    pub fn is_expired(self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }
}

/// A binary event, manual- or auto-reset.
///
/// Manual-reset: `set` leaves the event signaled until an explicit `reset`.
/// Auto-reset: a successful `wait` atomically consumes the signal.
pub struct Event {
    signaled: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
    auto_reset: bool,
}

impl Event {
    pub fn manual_reset() -> Self {
        Self {
            signaled: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
            auto_reset: false,
        }
    }

    pub fn auto_reset() -> Self {
        Self {
            signaled: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
            auto_reset: true,
        }
    }

    pub fn set(&self) {
        let _guard = self.mutex.lock();
        self.signaled.store(true, Ordering::Release);
        if self.auto_reset {
            self.condvar.notify_one();
        } else {
            self.condvar.notify_all();
        }
    }

    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    /// Fast, non-blocking check. Does not consume an auto-reset signal.
    pub fn is_set(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Block until signaled or `deadline` passes. Returns whether it was signaled.
    pub fn wait(&self, deadline: Deadline) -> bool {
        if self.signaled.load(Ordering::Acquire) {
            return self.consume();
        }
        if matches!(deadline, Deadline::Immediate) {
            return false;
        }

        let mut guard = self.mutex.lock();
        loop {
            if self.signaled.load(Ordering::Acquire) {
                return self.consume_locked(&mut guard);
            }
            match deadline.remaining() {
                None => {
                    self.condvar.wait(&mut guard);
                }
                Some(remaining) => {
                    if remaining.is_zero() {
                        return false;
                    }
                    let timed_out = self.condvar.wait_for(&mut guard, remaining).timed_out();
                    if timed_out && !self.signaled.load(Ordering::Acquire) {
                        return false;
                    }
                }
            }
        }
    }

    fn consume(&self) -> bool {
        if self.auto_reset {
            self.signaled
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
                || true
        } else {
            true
        }
    }

    fn consume_locked(&self, _guard: &mut parking_lot::MutexGuard<'_, ()>) -> bool {
        if self.auto_reset {
            self.signaled.store(false, Ordering::Release);
        }
        true
    }
}

/// A bounded counting semaphore.
pub struct Semaphore {
    count: Mutex<usize>,
    condvar: Condvar,
    max: usize,
}

impl Semaphore {
    pub fn new(initial: usize, max: usize) -> Self {
        debug_assert!(initial <= max);
        Self {
            count: Mutex::new(initial),
            condvar: Condvar::new(),
            max,
        }
    }

    /// Block until a permit is available or `deadline` passes.
    pub fn acquire(&self, deadline: Deadline) -> bool {
        let mut count = self.count.lock();
        loop {
            if *count > 0 {
                *count -= 1;
                return true;
            }
            if matches!(deadline, Deadline::Immediate) {
                return false;
            }
            match deadline.remaining() {
                None => self.condvar.wait(&mut count),
                Some(remaining) => {
                    if remaining.is_zero() {
                        return false;
                    }
                    self.condvar.wait_for(&mut count, remaining);
                }
            }
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.acquire(Deadline::Immediate)
    }

    /// Non-consuming check for whether a permit is currently available.
    pub fn peek(&self) -> bool {
        *self.count.lock() > 0
    }

    /// Release `n` permits, capped at the configured maximum.
    pub fn release(&self, n: usize) {
        let mut count = self.count.lock();
        *count = (*count + n).min(self.max);
        if n == 1 {
            self.condvar.notify_one();
        } else {
            self.condvar.notify_all();
        }
    }
}

/// Outcome of waiting on a set of events.
pub enum WaitMultiple {
    /// Indices (into the input slice) that were observed signaled.
    ///
    /// For wait-any this contains exactly one index; for wait-all it contains every
    /// index in the input slice.
    Signaled(Vec<usize>),
    TimedOut,
}

/// Poll up to `events.len()` events (bounded by `MAX_WAIT_CHUNK` by convention of the
/// caller) until either the combined condition is met or `deadline` passes.
///
/// This stands in for the host's bounded multi-wait primitive: since the events
/// here are backed by plain atomics, the most direct portable implementation is a
/// spin/backoff poll rather than a single blocking syscall.
pub fn wait_multiple(events: &[&Event], wait_all: bool, deadline: Deadline) -> WaitMultiple {
    let backoff = crossbeam::utils::Backoff::new();
    loop {
        let mut signaled = Vec::with_capacity(events.len());
        for (i, event) in events.iter().enumerate() {
            if event.is_set() {
                signaled.push(i);
                if !wait_all {
                    break;
                }
            }
        }

        if wait_all && signaled.len() == events.len() {
            return WaitMultiple::Signaled(signaled);
        }
        if !wait_all && !signaled.is_empty() {
            return WaitMultiple::Signaled(signaled);
        }

        if deadline.is_expired() {
            return WaitMultiple::TimedOut;
        }
        if matches!(deadline, Deadline::Immediate) {
            return WaitMultiple::TimedOut;
        }

        if backoff.is_completed() {
            std::thread::sleep(Duration::from_micros(200));
        } else {
            backoff.snooze();
        }
    }
}

/// A heterogeneous handle this process's combined waits (worker loop, dispatch relay)
/// can multiplex over: an event or a semaphore, referred to by the caller without
/// needing a common blocking trait.
pub enum WaitSource<'a> {
    Event(&'a Event),
    Semaphore(&'a Semaphore),
    /// Like `Semaphore`, but only peeks: observing readiness does not consume a
    /// permit. Used where the caller will re-acquire properly through the owning
    /// API (e.g. `Ring::push`) once it decides to act on the wakeup.
    SemaphorePeek(&'a Semaphore),
}

impl<'a> WaitSource<'a> {
    /// Non-blocking check-and-consume. For a semaphore this acquires one permit; for
    /// an auto-reset event this consumes the signal; for a manual-reset event this
    /// just observes it, since observing a manual-reset event doesn't consume it.
    fn try_consume(&self) -> bool {
        match self {
            WaitSource::Event(e) => e.wait(Deadline::Immediate),
            WaitSource::Semaphore(s) => s.try_acquire(),
            WaitSource::SemaphorePeek(s) => s.peek(),
        }
    }
}

/// Multiplex a blocking wait over a small, fixed set of heterogeneous sources.
///
/// Returns the index of the first source observed ready, or `None` on timeout. Used
/// by the worker loop (`{shutdown_event, read_semaphore}`) and the dispatch relay
/// (`{dispatch_read_sem, dispatch_request, work_write_sem}`), both three-or-fewer-
/// handle waits where a dedicated poll loop is simpler than routing through
/// [`wait_multiple`]'s same-typed-event contract.
pub fn wait_any_source(sources: &[WaitSource<'_>], deadline: Deadline) -> Option<usize> {
    let backoff = crossbeam::utils::Backoff::new();
    loop {
        for (i, source) in sources.iter().enumerate() {
            if source.try_consume() {
                return Some(i);
            }
        }
        if deadline.is_expired() || matches!(deadline, Deadline::Immediate) {
            return None;
        }
        if backoff.is_completed() {
            std::thread::sleep(Duration::from_micros(200));
        } else {
            backoff.snooze();
        }
    }
}

/// A single outstanding registration in the registered-wait fallback (Case D).
///
/// Stands in for the host's `RegisterWaitForSingleObject`-style facility: rather than
/// handing the wait to an OS thread pool, this spawns one dedicated waiter thread per
/// registration. The thread blocks on the event up to the shared deadline and invokes
/// `on_fire` at most once if the event signaled in time.
pub struct RegisteredWait {
    handle: Option<std::thread::JoinHandle<()>>,
}

impl RegisteredWait {
    pub fn spawn<F>(event: Arc<Event>, deadline: Deadline, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name("engine-registered-wait".into())
            .spawn(move || {
                if event.wait(deadline) {
                    on_fire();
                }
            })
            .expect("failed to spawn registered-wait thread");
        Self {
            handle: Some(handle),
        }
    }

    /// Block until the waiter thread exits (it always does, at the latest when the
    /// shared deadline passes).
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RegisteredWait {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_manual_reset_event_stays_signaled() {
        let e = Event::manual_reset();
        e.set();
        assert!(e.wait(Deadline::Immediate));
        assert!(e.wait(Deadline::Immediate));
    }

    #[test]
    fn test_auto_reset_event_consumes_signal() {
        let e = Event::auto_reset();
        e.set();
        assert!(e.wait(Deadline::Immediate));
        assert!(!e.wait(Deadline::Immediate));
    }

    #[test]
    fn test_event_wait_times_out() {
        let e = Event::manual_reset();
        let deadline = Deadline::At(Instant::now() + Duration::from_millis(10));
        assert!(!e.wait(deadline));
    }

    #[test]
    fn test_semaphore_basic() {
        let s = Semaphore::new(1, 4);
        assert!(s.try_acquire());
        assert!(!s.try_acquire());
        s.release(2);
        assert!(s.try_acquire());
        assert!(s.try_acquire());
        assert!(!s.try_acquire());
    }

    #[test]
    fn test_semaphore_caps_at_max() {
        let s = Semaphore::new(0, 2);
        s.release(10);
        assert!(s.try_acquire());
        assert!(s.try_acquire());
        assert!(!s.try_acquire());
    }

    #[test]
    fn test_wait_multiple_any() {
        let a = Event::manual_reset();
        let b = Event::manual_reset();
        b.set();
        let events: Vec<&Event> = vec![&a, &b];
        match wait_multiple(&events, false, Deadline::Immediate) {
            WaitMultiple::Signaled(idx) => assert_eq!(idx, vec![1]),
            WaitMultiple::TimedOut => panic!("expected signaled"),
        }
    }

    #[test]
    fn test_wait_multiple_all_times_out_when_incomplete() {
        let a = Event::manual_reset();
        let b = Event::manual_reset();
        a.set();
        let events: Vec<&Event> = vec![&a, &b];
        assert!(matches!(
            wait_multiple(&events, true, Deadline::Immediate),
            WaitMultiple::TimedOut
        ));
    }

    #[test]
    fn test_wait_any_source_picks_ready_semaphore() {
        let event = Event::manual_reset();
        let sem = Semaphore::new(1, 1);
        let sources = [WaitSource::Event(&event), WaitSource::Semaphore(&sem)];
        assert_eq!(wait_any_source(&sources, Deadline::Immediate), Some(1));
    }

    #[test]
    fn test_wait_any_source_times_out_when_nothing_ready() {
        let event = Event::manual_reset();
        let sem = Semaphore::new(0, 1);
        let sources = [WaitSource::Event(&event), WaitSource::Semaphore(&sem)];
        assert_eq!(wait_any_source(&sources, Deadline::Immediate), None);
    }

    #[test]
    fn test_registered_wait_fires_callback() {
        let event = Arc::new(Event::manual_reset());
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let event_clone = event.clone();
        let waiter = RegisteredWait::spawn(event_clone, Deadline::Infinite, move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        event.set();
        waiter.join();
        assert!(fired.load(Ordering::SeqCst));
    }
}
