//! The dispatch relay: a dedicated thread that buffers overflow work
//!
//! The work queue is small and hot; the dispatch queue is an overflow staging area
//! that lets the owner submit far more jobs than the work queue can hold without
//! ever blocking inside `push`. This module's relay thread drains the dispatch queue
//! into a private array and forwards from that array into the work queue as space
//! frees up, and answers the two-phase teardown rendezvous described in `pool.rs`.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::constants::DISPATCH_ARRAY_INLINE;
use crate::error::{ErrorKind, Result};
use crate::ring::Ring;
use crate::signal::{wait_any_source, Deadline, Event, WaitSource};
use crate::slot::SlotRef;

/// The three-variant control protocol used to rendezvous with the dispatch thread
/// during teardown. Kept as a literal enum because the two-phase handshake it drives
/// is a named protocol, not an incidental implementation detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchRequest {
    /// Stand down from a prior `ReadyToShutdown`; there was more work to drain.
    Resume,
    /// Asks the dispatch thread whether its array is empty.
    ReadyToShutdown,
    /// Unconditionally exit the relay loop.
    ShutdownNow,
}

/// Rendezvous channel between the owner thread and the dispatch thread during
/// teardown: a request/answer pair, each backed by an auto-reset event.
pub(crate) struct DispatchChannel {
    request: Mutex<Option<DispatchRequest>>,
    request_event: Event,
    answer: Mutex<Option<bool>>,
    answer_event: Event,
}

impl DispatchChannel {
    pub(crate) fn new() -> Self {
        DispatchChannel {
            request: Mutex::new(None),
            request_event: Event::auto_reset(),
            answer: Mutex::new(None),
            answer_event: Event::auto_reset(),
        }
    }

    /// Send a request to the dispatch thread, waking it if it is idle.
    pub(crate) fn send(&self, request: DispatchRequest) {
        *self.request.lock() = Some(request);
        self.request_event.set();
    }

    fn take_request(&self) -> Option<DispatchRequest> {
        self.request.lock().take()
    }

    fn answer(&self, is_array_empty: bool) {
        *self.answer.lock() = Some(is_array_empty);
        self.answer_event.set();
    }

    /// Block until the dispatch thread answers a `ReadyToShutdown` request.
    /// Returns whether its dispatch array was observed empty.
    pub(crate) fn await_answer(&self) -> bool {
        self.answer_event.wait(Deadline::Infinite);
        self.answer.lock().take().unwrap_or(false)
    }
}

/// Try the fast path into the work queue; on failure (full, or a transient publish
/// race) fall back to the dispatch queue, which always accepts (blocking if needed).
pub(crate) fn dispatch(work_queue: &Ring, dispatch_queue: &Ring, slot: SlotRef) -> Result<()> {
    slot.as_ref().mark_dispatched();
    let pushed_directly = match work_queue.try_push(slot) {
        Ok(published) => published,
        Err(ErrorKind::TimedOut) => false,
        Err(e) => return Err(e),
    };
    if pushed_directly {
        return Ok(());
    }
    dispatch_queue.push(slot, Deadline::Infinite)?;
    Ok(())
}

/// Entry point for the dispatch thread, spawned once per pool.
pub(crate) fn run(dispatch_queue: Arc<Ring>, work_queue: Arc<Ring>, channel: Arc<DispatchChannel>) {
    let mut array: Vec<SlotRef> = Vec::with_capacity(DISPATCH_ARRAY_INLINE);

    loop {
        let mut sources = vec![
            WaitSource::SemaphorePeek(dispatch_queue.read_semaphore()),
            WaitSource::Event(&channel.request_event),
        ];
        if !array.is_empty() {
            sources.push(WaitSource::SemaphorePeek(work_queue.write_semaphore()));
        }

        match wait_any_source(&sources, Deadline::Infinite) {
            Some(0) => {
                if let Ok(Some(slot)) = dispatch_queue.pop(Deadline::Immediate) {
                    if array.len() == array.capacity() {
                        debug!(new_len = array.len() + 1, "dispatch array growing past its inline capacity");
                    }
                    array.push(slot);
                }
            }
            Some(1) => {
                if let Some(request) = channel.take_request() {
                    if handle_request(request, &mut array, &channel) {
                        return;
                    }
                }
            }
            Some(2) | None => {
                // Either a work-queue slot freed up, or we're looping back after
                // forwarding below; either way fall through to the forward attempt.
            }
            Some(_) => unreachable!("only three sources are ever registered"),
        }

        forward_pending(&mut array, &work_queue);
    }
}

/// Answer (or act on) a control request. Returns `true` if the relay should exit.
fn handle_request(
    request: DispatchRequest,
    array: &mut Vec<SlotRef>,
    channel: &DispatchChannel,
) -> bool {
    match request {
        DispatchRequest::Resume => false,
        DispatchRequest::ShutdownNow => true,
        DispatchRequest::ReadyToShutdown => {
            let is_empty = array.is_empty();
            channel.answer(is_empty);
            if !is_empty {
                return false;
            }
            // Array was empty when asked; block for the owner's follow-up decision.
            channel.request_event.wait(Deadline::Infinite);
            matches!(channel.take_request(), Some(DispatchRequest::ShutdownNow))
        }
    }
}

fn forward_pending(array: &mut Vec<SlotRef>, work_queue: &Ring) {
    let before = array.len();
    while let Some(&slot) = array.first() {
        match work_queue.try_push(slot) {
            Ok(true) => {
                array.remove(0);
            }
            Ok(false) => break,
            Err(_) => break,
        }
    }
    if before > 0 && array.is_empty() {
        debug!("dispatch array drained");
    } else if before == array.len() && before > DISPATCH_ARRAY_INLINE {
        warn!(len = before, "dispatch array not draining, work queue may be saturated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotTable;

    #[test]
    fn test_dispatch_prefers_work_queue() {
        let work_queue = Ring::new(4);
        let dispatch_queue = Ring::new(4);
        let mut table = SlotTable::new();
        let (slot, _) = table.alloc_slot().unwrap();
        dispatch(&work_queue, &dispatch_queue, slot).unwrap();
        assert!(work_queue.pop(Deadline::Immediate).unwrap().is_some());
    }

    #[test]
    fn test_dispatch_falls_back_to_overflow_queue_when_full() {
        let work_queue = Ring::new(1);
        let dispatch_queue = Ring::new(4);
        let mut table = SlotTable::new();
        let (a, _) = table.alloc_slot().unwrap();
        let (b, _) = table.alloc_slot().unwrap();
        dispatch(&work_queue, &dispatch_queue, a).unwrap();
        dispatch(&work_queue, &dispatch_queue, b).unwrap();
        assert!(dispatch_queue.pop(Deadline::Immediate).unwrap().is_some());
    }

    #[test]
    fn test_ready_to_shutdown_blocks_then_exits_on_shutdown_now() {
        let channel = Arc::new(DispatchChannel::new());
        let follow_up = channel.clone();
        let sender = std::thread::spawn(move || {
            // Give `handle_request` time to answer and block on the next request.
            std::thread::sleep(std::time::Duration::from_millis(20));
            follow_up.send(DispatchRequest::ShutdownNow);
        });
        let mut array: Vec<SlotRef> = Vec::new();
        let exit = handle_request(DispatchRequest::ReadyToShutdown, &mut array, &channel);
        assert!(exit);
        assert_eq!(*channel.answer.lock(), Some(true));
        sender.join().unwrap();
    }

    #[test]
    fn test_ready_to_shutdown_returns_false_immediately_when_array_nonempty() {
        let channel = DispatchChannel::new();
        let mut table = SlotTable::new();
        let (slot, _) = table.alloc_slot().unwrap();
        let mut array = vec![slot];
        let exit = handle_request(DispatchRequest::ReadyToShutdown, &mut array, &channel);
        assert!(!exit);
        assert_eq!(*channel.answer.lock(), Some(false));
    }
}
