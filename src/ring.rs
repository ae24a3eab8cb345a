//! The bounded MPMC work queue ring
//!
//! Both the hot work queue and the dispatch overflow queue are instances of this same
//! structure: a fixed-capacity array of slot-pointer cells, a pair of ticketed cursors,
//! and a pair of counting semaphores that track producible items and free cells.
//! Producers and consumers never block each other directly; they coordinate purely
//! through CAS on cells and the semaphores' counts.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::error::{ErrorKind, Result};
use crate::signal::{Deadline, Semaphore};
use crate::slot::{Slot, SlotRef};

/// Cache-line padded cursor to keep the write and read cursors from false-sharing.
#[repr(align(128))]
struct PaddedCursor {
    value: AtomicUsize,
}

impl PaddedCursor {
    fn new(initial: usize) -> Self {
        Self {
            value: AtomicUsize::new(initial),
        }
    }
}

/// A bounded MPMC ring of slot pointers with a ticket/CAS publish protocol.
///
/// Capacity must be a power of two; indices are computed with a mask rather than a
/// modulo. Both the work queue and the dispatch queue are instances of this type.
pub(crate) struct Ring {
    cells: Box<[AtomicPtr<Slot>]>,
    mask: usize,
    write_pos: PaddedCursor,
    read_pos: PaddedCursor,
    /// Counts producible items; consumers wait on this before popping.
    read_semaphore: Semaphore,
    /// Counts free cells; producers wait on this before publishing.
    write_semaphore: Semaphore,
}

impl Ring {
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        let mut cells = Vec::with_capacity(capacity);
        cells.resize_with(capacity, || AtomicPtr::new(std::ptr::null_mut()));
        Ring {
            cells: cells.into_boxed_slice(),
            mask: capacity - 1,
            write_pos: PaddedCursor::new(0),
            read_pos: PaddedCursor::new(0),
            read_semaphore: Semaphore::new(0, capacity),
            write_semaphore: Semaphore::new(capacity, capacity),
        }
    }

    fn claim_write_ticket(&self) -> usize {
        let mut w = self.write_pos.value.load(Ordering::Relaxed);
        loop {
            let next = (w + 1) & self.mask;
            match self.write_pos.value.compare_exchange_weak(
                w,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(claimed) => return claimed & self.mask,
                Err(actual) => w = actual,
            }
        }
    }

    fn claim_read_ticket(&self) -> usize {
        let mut r = self.read_pos.value.load(Ordering::Relaxed);
        loop {
            let next = (r + 1) & self.mask;
            match self.read_pos.value.compare_exchange_weak(
                r,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(claimed) => return claimed & self.mask,
                Err(actual) => r = actual,
            }
        }
    }

    /// Attempt to publish `slot`, waiting on the write semaphore up to `deadline`.
    ///
    /// Returns `Ok(true)` on success, `Ok(false)` if the publish CAS lost a race and
    /// should be treated as transient (the caller retries, typically via the dispatch
    /// queue), and `Err(ErrorKind::TimedOut)` if the deadline passed first.
    pub(crate) fn push(&self, slot: SlotRef, deadline: Deadline) -> Result<bool> {
        if !self.write_semaphore.acquire(deadline) {
            return Err(ErrorKind::TimedOut);
        }

        let w = self.claim_write_ticket();
        let cell = &self.cells[w];
        let ptr = slot.as_ptr() as *mut Slot;
        match cell.compare_exchange(
            std::ptr::null_mut(),
            ptr,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                slot.as_ref().set_work_ring_pos(w as i32);
                self.read_semaphore.release(1);
                Ok(true)
            }
            Err(_) => {
                // The reservation this push claimed was never consumed; give it back
                // so a retry (or the dispatch thread) isn't throttled by our failure.
                self.write_semaphore.release(1);
                Ok(false)
            }
        }
    }

    /// Non-blocking variant used by the submission path's fast attempt into the work
    /// queue before falling back to the dispatch queue.
    pub(crate) fn try_push(&self, slot: SlotRef) -> Result<bool> {
        self.push(slot, Deadline::Immediate)
    }

    /// Pop the next available slot, waiting on the read semaphore up to `deadline`.
    ///
    /// A `None` is a tolerated spurious result: another thread unpublished the slot
    /// at this position before the consumer reached it.
    pub(crate) fn pop(&self, deadline: Deadline) -> Result<Option<SlotRef>> {
        if !self.read_semaphore.acquire(deadline) {
            return Err(ErrorKind::TimedOut);
        }

        let r = self.claim_read_ticket();
        let cell = &self.cells[r];
        let ptr = cell.swap(std::ptr::null_mut(), Ordering::SeqCst);
        self.write_semaphore.release(1);

        if ptr.is_null() {
            Ok(None)
        } else {
            // SAFETY: this pointer was published by `push` from a live `SlotRef` and
            // the slot table never frees slot storage while the pool is alive.
            Ok(Some(unsafe { SlotRef::from_raw(ptr) }))
        }
    }

    /// Steal `slot` out of its recorded ring position so the caller can execute it
    /// directly. Does not touch cursors or semaphores: the eventual consumer that
    /// advances past this position will observe a null cell and skip it.
    pub(crate) fn unpublish(&self, slot: SlotRef) -> bool {
        let pos = slot.as_ref().work_ring_pos();
        if pos < 0 {
            return false;
        }
        let index = pos as usize & self.mask;
        let cell = &self.cells[index];
        let ptr = slot.as_ptr() as *mut Slot;
        cell.compare_exchange(ptr, std::ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// The semaphore consumers wait on before popping; exposed so the dispatch
    /// thread and worker loops can fold it into their own multi-waits.
    pub(crate) fn read_semaphore(&self) -> &Semaphore {
        &self.read_semaphore
    }

    /// The semaphore producers wait on before publishing; exposed so the dispatch
    /// thread can learn when the work queue has drained enough to accept more.
    pub(crate) fn write_semaphore(&self) -> &Semaphore {
        &self.write_semaphore
    }
}
