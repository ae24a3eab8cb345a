//! The worker loop
//!
//! Each worker is a long-lived OS thread that alternates between waiting for work and
//! executing it. Workers never touch the dispatch queue, the dispatch array, or the
//! slot-table bitmap — those are exclusively owned by the dispatch thread and the
//! pool's owner thread, respectively.

use std::sync::Arc;

use tracing::{trace_span, warn};

use crate::ring::Ring;
use crate::signal::{wait_any_source, Deadline, Event, WaitSource};
use crate::slot::WorkerContext;

/// Called once per worker at startup (`startup = true`) and once at termination
/// (`startup = false`), both on the worker thread. Supplements the base submission
/// API with `init_ex`'s setup-callback contract.
pub type SetupCallback = Arc<dyn Fn(u64, bool) + Send + Sync>;

pub(crate) fn run(
    worker_index: usize,
    work_queue: Arc<Ring>,
    shutdown_event: Arc<Event>,
    setup: Option<SetupCallback>,
) {
    let thread_id = current_thread_id();

    if let Some(setup) = &setup {
        setup(thread_id, true);
    }

    loop {
        let sources = [
            WaitSource::Event(&shutdown_event),
            WaitSource::SemaphorePeek(work_queue.read_semaphore()),
        ];
        match wait_any_source(&sources, Deadline::Infinite) {
            Some(0) => break,
            Some(1) => {
                if let Some(slot) = pop_one(&work_queue) {
                    execute(thread_id, slot);
                }
                // A `None` pop result is the documented spurious case: the owner
                // stole this slot via unpublish-by-slot before we reached it, or
                // another worker's `pop` consumed the permit first.
            }
            _ => unreachable!("only two sources are ever registered"),
        }
    }

    if let Some(setup) = &setup {
        setup(thread_id, false);
    }
    let _ = worker_index;
}

fn pop_one(work_queue: &Ring) -> Option<crate::slot::SlotRef> {
    match work_queue.pop(Deadline::Immediate) {
        Ok(slot) => slot,
        Err(_) => None,
    }
}

pub(crate) fn execute(thread_id: u64, slot_ref: crate::slot::SlotRef) {
    let slot = slot_ref.as_ref();
    let Some(job) = slot.take_job() else {
        // Another thread (a stealing owner) already claimed this job.
        return;
    };

    let span = trace_span!("job_execution", thread_id);
    let _guard = span.enter();

    let mut context = WorkerContext::new(thread_id, slot_ref);
    // A panicking job must not take down the worker thread or leave waiters blocked
    // forever; catch it, signal completion regardless, and move on.
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        job(&mut context);
    }));
    if result.is_err() {
        warn!(thread_id, "job procedure panicked; slot marked complete regardless");
    }
    slot.complete();
}

pub(crate) fn current_thread_id() -> u64 {
    // `std::thread::ThreadId` has no stable numeric representation, so this hashes
    // it into a stable-for-the-process u64 purely for diagnostics.
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotTable;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_execute_runs_job_exactly_once_and_signals_event() {
        let mut table = SlotTable::new();
        let (slot_ref, _) = table.alloc_slot().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        slot_ref.as_ref().set_job(Box::new(move |_ctx| {
            ran_clone.store(true, Ordering::SeqCst);
        }));

        execute(1, slot_ref);

        assert!(ran.load(Ordering::SeqCst));
        assert!(slot_ref.as_ref().is_event_signaled());
        assert!(slot_ref.as_ref().event().wait(Deadline::Immediate));
    }

    #[test]
    fn test_execute_tolerates_already_claimed_job() {
        let mut table = SlotTable::new();
        let (slot_ref, _) = table.alloc_slot().unwrap();
        slot_ref.as_ref().set_job(Box::new(|_ctx| {}));
        assert!(slot_ref.as_ref().take_job().is_some());
        // Job already taken by a "stealing" thread; execute must be a no-op, not panic.
        execute(1, slot_ref);
        assert!(!slot_ref.as_ref().is_event_signaled());
    }

    #[test]
    fn test_execute_signals_completion_even_if_job_panics() {
        let mut table = SlotTable::new();
        let (slot_ref, _) = table.alloc_slot().unwrap();
        slot_ref.as_ref().set_job(Box::new(|_ctx| {
            panic!("boom");
        }));
        execute(1, slot_ref);
        assert!(slot_ref.as_ref().is_event_signaled());
    }
}
