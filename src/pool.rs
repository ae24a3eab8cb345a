//! The pool: owner-facing API tying the slot table, queues, dispatch relay, and
//! worker threads together.
//!
//! Everything here except construction and [`Pool::destroy`] enforces a single
//! restriction: only the thread that called [`Pool::init`] (or [`Pool::init_ex`])
//! may call it. That thread's ID is captured at construction and compared against
//! the caller's on every entry point.

use std::cell::RefCell;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use crate::config::Config;
use crate::dispatch::{self, DispatchChannel, DispatchRequest};
use crate::error::{self, EngineError, ErrorKind};
use crate::handle::Handle;
use crate::ring::Ring;
use crate::signal::{Deadline, Event};
use crate::slot::{Job, SlotTable};
use crate::wait::{self, WaitContext};
use crate::worker;

/// Result of a `wait_any`-style call: the index of the handle that fired, or the
/// error that ended the wait.
#[derive(Debug, Clone, Copy)]
pub struct WaitAnyResult {
    /// Index into the handles slice that was observed signaled, if any.
    pub index: Option<usize>,
    /// The error that ended the wait, if it ended in failure rather than a hit.
    pub error: Option<ErrorKind>,
}

/// The execution engine's pool of workers, queues, and slot storage.
///
/// Constructed once via [`Pool::init`] or [`Pool::init_ex`] and torn down once via
/// [`Pool::destroy`]. All other methods may only be called from the thread that
/// constructed it.
pub struct Pool {
    slots: RefCell<SlotTable>,
    work_queue: Arc<Ring>,
    dispatch_queue: Arc<Ring>,
    dispatch_channel: Arc<DispatchChannel>,
    shutdown_event: Arc<Event>,
    workers: Vec<JoinHandle<()>>,
    dispatch_thread: Option<JoinHandle<()>>,
    owner: ThreadId,
    owner_numeric_id: u64,
    max_wait_chunk: usize,
}

impl Pool {
    /// Create a pool with `worker_count` workers and otherwise-default configuration.
    pub fn init(worker_count: usize) -> std::result::Result<Pool, EngineError> {
        Pool::init_ex(Config::new(worker_count)?)
    }

    /// Create a pool from a fully-specified [`Config`], including its optional
    /// per-worker setup callback.
    pub fn init_ex(config: Config) -> std::result::Result<Pool, EngineError> {
        config.validate()?;

        let work_queue = Arc::new(Ring::new(config.ring_capacity));
        let dispatch_queue = Arc::new(Ring::new(config.ring_capacity));
        let dispatch_channel = Arc::new(DispatchChannel::new());
        let shutdown_event = Arc::new(Event::manual_reset());

        let mut workers = Vec::with_capacity(config.worker_count);
        for index in 0..config.worker_count {
            let work_queue = Arc::clone(&work_queue);
            let shutdown_event = Arc::clone(&shutdown_event);
            let setup = config.setup.clone();
            let handle = std::thread::Builder::new()
                .name(format!("engine-worker-{index}"))
                .spawn(move || worker::run(index, work_queue, shutdown_event, setup))?;
            workers.push(handle);
        }

        let dispatch_thread = {
            let dispatch_queue = Arc::clone(&dispatch_queue);
            let work_queue = Arc::clone(&work_queue);
            let channel = Arc::clone(&dispatch_channel);
            std::thread::Builder::new()
                .name("engine-dispatch".into())
                .spawn(move || dispatch::run(dispatch_queue, work_queue, channel))?
        };

        Ok(Pool {
            slots: RefCell::new(SlotTable::new()),
            work_queue,
            dispatch_queue,
            dispatch_channel,
            shutdown_event,
            workers,
            dispatch_thread: Some(dispatch_thread),
            owner: std::thread::current().id(),
            owner_numeric_id: worker::current_thread_id(),
            max_wait_chunk: config.max_wait_chunk,
        })
    }

    fn assert_owner(&self) {
        assert_eq!(
            std::thread::current().id(),
            self.owner,
            "engine operation called from a thread other than the pool's owner"
        );
    }

    fn slot_at(&self, handle: Handle) -> crate::slot::SlotRef {
        self.slots.borrow().slot_at(handle.slot_index() as i32)
    }

    fn wait_ctx(&self) -> WaitContext<'_> {
        let slots = &self.slots;
        WaitContext {
            work_queue: &self.work_queue,
            dispatch_queue: &self.dispatch_queue,
            max_wait_chunk: self.max_wait_chunk,
            slot_at: Box::new(move |h: Handle| slots.borrow().slot_at(h.slot_index() as i32)),
            thread_id: self.owner_numeric_id,
        }
    }

    /// Submit a job. If `deferred` is false it is immediately handed to
    /// [`dispatch`](crate::dispatch::dispatch); otherwise it sits idle until
    /// [`Pool::dispatch_by_handle`] or a wait forces it onto a queue.
    pub fn push(&self, job: Job, deferred: bool) -> Handle {
        self.assert_owner();
        let (slot_ref, index) = match self.slots.borrow_mut().alloc_slot() {
            Ok(pair) => pair,
            Err(kind) => return Handle::from_error(kind),
        };
        slot_ref.as_ref().set_job(job);
        let handle = Handle::from_index(index);

        if !deferred {
            if let Err(kind) = dispatch::dispatch(&self.work_queue, &self.dispatch_queue, slot_ref) {
                return Handle::from_error(kind);
            }
        }
        handle
    }

    /// Force a deferred slot onto a queue. No-op (returns `true`) if already queued.
    pub fn dispatch_by_handle(&self, handle: Handle) -> bool {
        self.assert_owner();
        if !handle.is_valid() {
            return false;
        }
        let slot_ref = self.slot_at(handle);
        if slot_ref.as_ref().work_ring_pos() >= 0 {
            return true;
        }
        dispatch::dispatch(&self.work_queue, &self.dispatch_queue, slot_ref).is_ok()
    }

    /// Release a slot back to the table, blocking if a worker is still running it.
    /// Sets `*handle` to [`Handle::EMPTY`] on return.
    pub fn release(&self, handle: &mut Handle) {
        self.assert_owner();
        if !handle.is_valid() {
            return;
        }
        let slot_ref = self.slot_at(*handle);
        let slot = slot_ref.as_ref();
        if slot.work_ring_pos() >= 0 && !slot.is_event_signaled() && !self.work_queue.unpublish(slot_ref) {
            // A worker already claimed it; the only safe thing left is to wait.
            slot.event().wait(Deadline::Infinite);
        }
        self.slots.borrow_mut().free_slot(handle.slot_index() as i32);
        *handle = Handle::EMPTY;
    }

    /// Pointer to a slot's inline result storage, valid until the slot is released.
    pub fn storage(&self, handle: Handle) -> *mut u8 {
        self.assert_owner();
        self.slot_at(handle).as_ref().storage_ptr()
    }

    /// The slot's most recently reported progress value.
    pub fn progress(&self, handle: Handle) -> i32 {
        self.assert_owner();
        self.slot_at(handle).as_ref().progress()
    }

    /// Request cooperative cancellation; the job decides whether to honor it.
    pub fn cancel(&self, handle: Handle) {
        self.assert_owner();
        self.slot_at(handle).as_ref().cancel();
    }

    /// Whether the slot behind `handle` has been asked to cancel.
    pub fn is_cancelled(&self, handle: Handle) -> bool {
        self.assert_owner();
        self.slot_at(handle).as_ref().is_cancelled()
    }

    /// Block until `handle` completes.
    pub fn wait_single(&self, handle: Handle) -> error::Result<()> {
        self.assert_owner();
        wait::wait_single(&self.wait_ctx(), handle, Deadline::Infinite)
    }

    /// Block until `handle` completes or `ms` milliseconds pass.
    pub fn wait_single_for(&self, handle: Handle, ms: i32) -> error::Result<()> {
        self.assert_owner();
        wait::wait_single(&self.wait_ctx(), handle, Deadline::from_millis(ms))
    }

    /// Block until every handle in `handles` completes.
    pub fn wait_all(&self, handles: &[Handle]) -> error::Result<()> {
        self.assert_owner();
        wait::wait_many(&self.wait_ctx(), handles, true, Deadline::Infinite).map(|_| ())
    }

    /// Block until every handle in `handles` completes or `ms` milliseconds pass.
    pub fn wait_all_for(&self, handles: &[Handle], ms: i32) -> error::Result<()> {
        self.assert_owner();
        wait::wait_many(&self.wait_ctx(), handles, true, Deadline::from_millis(ms)).map(|_| ())
    }

    /// Block until any handle in `handles` completes.
    pub fn wait_any(&self, handles: &[Handle]) -> WaitAnyResult {
        self.assert_owner();
        Self::as_wait_any_result(wait::wait_many(&self.wait_ctx(), handles, false, Deadline::Infinite))
    }

    /// Block until any handle in `handles` completes or `ms` milliseconds pass.
    pub fn wait_any_for(&self, handles: &[Handle], ms: i32) -> WaitAnyResult {
        self.assert_owner();
        Self::as_wait_any_result(wait::wait_many(
            &self.wait_ctx(),
            handles,
            false,
            Deadline::from_millis(ms),
        ))
    }

    fn as_wait_any_result(result: error::Result<usize>) -> WaitAnyResult {
        match result {
            Ok(index) => WaitAnyResult {
                index: Some(index),
                error: None,
            },
            Err(error) => WaitAnyResult {
                index: None,
                error: Some(error),
            },
        }
    }

    /// Pop and execute every slot currently sitting in either queue, without
    /// blocking. Used both by user code that wants to force progress and by
    /// [`Pool::destroy`]'s drain phase.
    fn drain_queues_once(&self) {
        loop {
            let mut did_something = false;
            if let Ok(Some(slot)) = self.dispatch_queue.pop(Deadline::Immediate) {
                worker::execute(self.owner_numeric_id, slot);
                did_something = true;
            }
            if let Ok(Some(slot)) = self.work_queue.pop(Deadline::Immediate) {
                worker::execute(self.owner_numeric_id, slot);
                did_something = true;
            }
            if !did_something {
                break;
            }
        }
    }

    /// Non-consuming check: is there nothing left to pop from either queue?
    fn queues_are_empty(&self) -> bool {
        !self.dispatch_queue.read_semaphore().peek() && !self.work_queue.read_semaphore().peek()
    }

    /// Execute every allocated slot that was never handed to `dispatch::dispatch` —
    /// a deferred push that nobody ever forced onto a queue or waited on. Neither
    /// ring nor the dispatch thread's private array can ever see these, so without
    /// this step they would be silently dropped by `destroy`.
    fn drain_undispatched_slots(&self) {
        let pending: Vec<crate::slot::SlotRef> = {
            let slots = self.slots.borrow();
            let mut pending = Vec::new();
            slots.for_each_allocated_slot(|slot_ref| {
                let slot = slot_ref.as_ref();
                if !slot.is_dispatched() && !slot.is_event_signaled() {
                    pending.push(slot_ref);
                }
            });
            pending
        };
        for slot_ref in pending {
            worker::execute(self.owner_numeric_id, slot_ref);
        }
    }

    /// Tear the pool down, following the two-phase shutdown protocol: signal
    /// workers, drain outstanding work on the owner thread, then rendezvous with
    /// the dispatch thread until both it and the owner agree nothing remains.
    ///
    /// `complete` controls whether queues, the slot table, and thread handles are
    /// actually freed (`true`) or merely joined and then leaked (`false`), trading
    /// a clean teardown for a faster process exit.
    pub fn destroy(mut self, complete: bool) {
        self.assert_owner();
        self.shutdown_event.set();
        self.drain_queues_once();
        self.drain_undispatched_slots();

        for worker in std::mem::take(&mut self.workers) {
            let _ = worker.join();
        }

        loop {
            self.dispatch_channel.send(DispatchRequest::ReadyToShutdown);
            let array_was_empty = self.dispatch_channel.await_answer();
            if !array_was_empty {
                self.drain_queues_once();
                continue;
            }
            if self.queues_are_empty() {
                self.dispatch_channel.send(DispatchRequest::ShutdownNow);
                break;
            }
            self.dispatch_channel.send(DispatchRequest::Resume);
            self.drain_queues_once();
        }

        if let Some(dispatch_thread) = self.dispatch_thread.take() {
            let _ = dispatch_thread.join();
        }

        if !complete {
            // Resources are already joined; skip freeing them now and let process
            // exit reclaim the memory, trading a clean teardown for speed.
            std::mem::forget(self);
        }
    }
}

/// Block the calling thread for `ms` milliseconds. `ms <= 0` returns immediately.
pub fn sleep(ms: i32) {
    if ms <= 0 {
        return;
    }
    std::thread::sleep(std::time::Duration::from_millis(ms as u64));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_push_and_wait_single_runs_job() {
        let pool = Pool::init(2).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let handle = pool.push(
            Box::new(move |_ctx| {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }),
            false,
        );
        assert!(handle.is_valid());
        pool.wait_single(handle).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        pool.destroy(true);
    }

    #[test]
    fn test_wait_all_waits_for_every_handle() {
        let pool = Pool::init(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = counter.clone();
            handles.push(pool.push(
                Box::new(move |_ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                false,
            ));
        }
        pool.wait_all(&handles).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        pool.destroy(true);
    }

    #[test]
    fn test_wait_any_returns_a_signaled_index() {
        let pool = Pool::init(2).unwrap();
        let a = pool.push(Box::new(|_ctx| {}), false);
        let b = pool.push(Box::new(|_ctx| {}), false);
        let handles = [a, b];
        pool.wait_all(&handles).unwrap();
        let result = pool.wait_any(&handles);
        assert!(result.error.is_none());
        assert!(result.index.is_some());
        pool.destroy(true);
    }

    #[test]
    fn test_release_resets_handle_to_empty() {
        let pool = Pool::init(2).unwrap();
        let mut handle = pool.push(Box::new(|_ctx| {}), false);
        pool.wait_single(handle).unwrap();
        pool.release(&mut handle);
        assert!(!handle.is_valid());
        pool.destroy(true);
    }

    #[test]
    fn test_destroy_drains_undispatched_work() {
        let pool = Pool::init(1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let _handle = pool.push(
            Box::new(move |_ctx| {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        );
        // Never waited on or dispatched; destroy must still run it.
        pool.destroy(true);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "owner")]
    fn test_non_owner_thread_panics() {
        let pool = Arc::new(Pool::init(1).unwrap());
        let pool_clone = pool.clone();
        std::thread::spawn(move || {
            let _ = pool_clone.push(Box::new(|_ctx| {}), false);
        })
        .join()
        .unwrap();
    }
}
