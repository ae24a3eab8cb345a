//! Per-job state records and the chunked allocator that owns them
//!
//! A [`Slot`] is the fundamental unit of job state: the user's closure, its inline
//! result storage, and the atomics that publish progress and completion. Slots are
//! owned by a [`SlotTable`], a linked chain of fixed-size [`Chunk`]s; once allocated a
//! slot's address never moves for the lifetime of the pool, which is what lets the
//! work queue and dispatch array hand around raw slot pointers safely.

use std::cell::{Cell, UnsafeCell};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::constants::{BITMAP_WORDS, MAX_SLOT_INDEX, MAX_STORAGE_BYTES, SLOTS_PER_CHUNK};
use crate::error::{ErrorKind, Result};
use crate::signal::Event;

/// Context handed to a running job.
///
/// Exposes the job's inline result storage and the cooperative progress/cancellation
/// channel back to the owner: a thread id plus an opaque handle back into the slot.
pub struct WorkerContext {
    /// OS-level identifier of the worker thread executing the job, for diagnostics.
    pub thread_id: u64,
    slot: SlotRef,
}

impl WorkerContext {
    pub(crate) fn new(thread_id: u64, slot: SlotRef) -> Self {
        Self { thread_id, slot }
    }

    /// Mutable access to the slot's inline result buffer.
    pub fn storage(&mut self) -> &mut [u8; MAX_STORAGE_BYTES] {
        // SAFETY: only the thread currently executing this slot's job holds a
        // `WorkerContext` for it, and the owner does not touch `storage` until the
        // job has signaled completion.
        unsafe { &mut *self.slot.as_ref().storage.get() }
    }

    /// Publish a monotonic progress value, observable via `progress(handle)`.
    pub fn report_progress(&self, value: i32) {
        self.slot.as_ref().progress_report.store(value, Ordering::Release);
    }

    /// Whether the owner has requested cancellation. Advisory only; the job decides
    /// whether and when to act on it.
    pub fn is_cancelled(&self) -> bool {
        self.slot.as_ref().cancelled.load(Ordering::Relaxed)
    }
}

/// A job's work: a boxed closure invoked exactly once with its [`WorkerContext`].
pub type Job = Box<dyn FnOnce(&mut WorkerContext) + Send + 'static>;

/// Non-owning, `Send`/`Sync` pointer to a [`Slot`].
///
/// Slot storage lives inside a [`Chunk`] owned by the pool's [`SlotTable`] and is
/// never freed or relocated while the pool is alive, so handing this pointer across
/// threads (ring cells, the dispatch array, registered waits) is sound as long as
/// nothing outlives the pool.
#[derive(Clone, Copy)]
pub(crate) struct SlotRef(NonNull<Slot>);

unsafe impl Send for SlotRef {}
unsafe impl Sync for SlotRef {}

impl SlotRef {
    fn new(slot: &Slot) -> Self {
        SlotRef(NonNull::from(slot))
    }

    pub(crate) fn as_ref(&self) -> &Slot {
        // SAFETY: see the type's doc comment.
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn as_ptr(&self) -> *const Slot {
        self.0.as_ptr()
    }

    /// Reconstruct a `SlotRef` from a raw pointer previously obtained from
    /// [`SlotRef::as_ptr`]. The pointer must still refer to a live slot.
    pub(crate) unsafe fn from_raw(ptr: *mut Slot) -> Self {
        SlotRef(NonNull::new_unchecked(ptr))
    }
}

impl PartialEq for SlotRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

#[repr(align(16))]
struct Storage([u8; MAX_STORAGE_BYTES]);

/// The per-job state record.
///
/// Fields split into three groups: the lazily-created completion event and inline
/// storage (read-only for the slot's active lifetime once the job starts), the
/// atomics that are freely shared across the owner, workers, and the dispatch thread,
/// and `pending`, which only the owner thread ever touches.
pub struct Slot {
    event: OnceCell<Arc<Event>>,
    storage: UnsafeCell<Storage>,
    job: Mutex<Option<Job>>,
    progress_report: AtomicI32,
    cancelled: AtomicBool,
    event_signaled: AtomicBool,
    /// -1 when idle or staged; otherwise this slot's current index in the work ring.
    work_ring_pos: AtomicI32,
    /// Set once the slot has been handed to `dispatch::dispatch`, regardless of
    /// which queue it lands in or whether it has reached the work ring yet. A
    /// deferred slot that was never explicitly dispatched, and never waited on,
    /// never sets this; teardown uses it to find work that would otherwise be
    /// silently dropped.
    dispatched: AtomicBool,
    /// Set by the owner once it has observed the slot was picked up by a worker.
    /// Owner-exclusive, like the slot table's bitmap.
    pending: Cell<bool>,
}

// SAFETY: `pending` is only ever read or written by the pool's owner thread, which is
// enforced at the API boundary (see `Pool`'s owner-thread check), not by the type
// system here. Every other field is either an atomic or guarded by `job`'s mutex.
unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Self {
        Slot {
            event: OnceCell::new(),
            storage: UnsafeCell::new(Storage([0u8; MAX_STORAGE_BYTES])),
            job: Mutex::new(None),
            progress_report: AtomicI32::new(0),
            cancelled: AtomicBool::new(false),
            event_signaled: AtomicBool::new(false),
            work_ring_pos: AtomicI32::new(-1),
            dispatched: AtomicBool::new(false),
            pending: Cell::new(false),
        }
    }

    /// The slot's completion event, created on first use. Returned as a cheaply
    /// cloned `Arc` so callers (notably the Case D registered-wait fallback) can hand
    /// it to another thread without that thread's lifetime being tied to the slot's.
    pub(crate) fn event(&self) -> Arc<Event> {
        self.event.get_or_init(|| Arc::new(Event::manual_reset())).clone()
    }

    pub(crate) fn set_job(&self, job: Job) {
        *self.job.lock() = Some(job);
    }

    /// Take the job out for execution. Returns `None` if another thread already
    /// claimed it, which is how the design guarantees at-most-once execution under
    /// contention between a worker's pop and the owner's stealing unpublish.
    pub(crate) fn take_job(&self) -> Option<Job> {
        self.job.lock().take()
    }

    pub(crate) fn progress(&self) -> i32 {
        self.progress_report.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub(crate) fn is_event_signaled(&self) -> bool {
        self.event_signaled.load(Ordering::Acquire)
    }

    pub(crate) fn mark_event_signaled(&self) {
        self.event_signaled.store(true, Ordering::Release);
    }

    pub(crate) fn work_ring_pos(&self) -> i32 {
        self.work_ring_pos.load(Ordering::Acquire)
    }

    pub(crate) fn set_work_ring_pos(&self, pos: i32) {
        self.work_ring_pos.store(pos, Ordering::Release);
    }

    pub(crate) fn mark_dispatched(&self) {
        self.dispatched.store(true, Ordering::Release);
    }

    pub(crate) fn is_dispatched(&self) -> bool {
        self.dispatched.load(Ordering::Acquire)
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.get()
    }

    pub(crate) fn set_pending(&self, pending: bool) {
        self.pending.set(pending);
    }

    pub(crate) fn storage_ptr(&self) -> *mut u8 {
        self.storage.get() as *mut u8
    }

    /// Mark the slot as having completed: release-store the completion flag and
    /// signal its event. Called by whichever thread (worker or stealing owner)
    /// actually ran the job.
    pub(crate) fn complete(&self) {
        self.mark_event_signaled();
        self.event().set();
    }

    /// Reset all fields to their just-allocated state, ready for a new job.
    /// Called by the owner when reinitializing a freshly-allocated slot and again
    /// when a released slot returns to the chunk's bitmap.
    fn reset_for_reuse(&self) {
        *self.job.lock() = None;
        self.progress_report.store(0, Ordering::Release);
        self.cancelled.store(false, Ordering::Release);
        self.event_signaled.store(false, Ordering::Release);
        self.work_ring_pos.store(-1, Ordering::Release);
        self.dispatched.store(false, Ordering::Release);
        self.pending.set(false);
        if let Some(event) = self.event.get() {
            event.reset();
        }
    }
}

struct Chunk {
    slots: Box<[Slot]>,
    bitmap: [u32; BITMAP_WORDS],
    available_count: usize,
}

impl Chunk {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(SLOTS_PER_CHUNK);
        slots.resize_with(SLOTS_PER_CHUNK, Slot::new);
        Chunk {
            slots: slots.into_boxed_slice(),
            bitmap: [u32::MAX; BITMAP_WORDS],
            available_count: SLOTS_PER_CHUNK,
        }
    }

    fn alloc_local(&mut self) -> Option<usize> {
        for (word_idx, word) in self.bitmap.iter_mut().enumerate() {
            if *word != 0 {
                let bit = word.trailing_zeros() as usize;
                *word &= !(1 << bit);
                self.available_count -= 1;
                return Some(word_idx * 32 + bit);
            }
        }
        None
    }

    fn free_local(&mut self, local: usize) {
        let word_idx = local / 32;
        let bit = local % 32;
        debug_assert_eq!(self.bitmap[word_idx] & (1 << bit), 0, "double free of slot");
        self.bitmap[word_idx] |= 1 << bit;
        self.available_count += 1;
    }

    /// Call `f` once for every currently-allocated local index, lowest first. A
    /// clear bit means allocated; a set bit means free.
    fn for_each_allocated(&self, mut f: impl FnMut(usize)) {
        for (word_idx, word) in self.bitmap.iter().enumerate() {
            let mut allocated = !word;
            while allocated != 0 {
                let bit = allocated.trailing_zeros() as usize;
                f(word_idx * 32 + bit);
                allocated &= allocated - 1;
            }
        }
    }
}

/// Owner-exclusive chunked allocator for [`Slot`]s.
///
/// A slot's global index is `chunk_number * SLOTS_PER_CHUNK + local`. Chunks are
/// appended on demand and never freed while the table is alive, so a slot's address
/// is stable from allocation until the table itself is dropped.
pub(crate) struct SlotTable {
    chunks: Vec<Box<Chunk>>,
}

impl SlotTable {
    pub(crate) fn new() -> Self {
        SlotTable { chunks: Vec::new() }
    }

    /// Allocate a free slot, growing the chunk chain if necessary.
    ///
    /// Returns the slot reference and its global index.
    pub(crate) fn alloc_slot(&mut self) -> Result<(SlotRef, i32)> {
        for (chunk_number, chunk) in self.chunks.iter_mut().enumerate() {
            if chunk.available_count > 0 {
                let local = chunk.alloc_local().expect("available_count was inconsistent");
                let index = chunk_number * SLOTS_PER_CHUNK + local;
                return Self::finish_alloc(chunk, index);
            }
        }

        let next_chunk_number = self.chunks.len();
        let index_of_new_chunk_start = next_chunk_number
            .checked_mul(SLOTS_PER_CHUNK)
            .ok_or(ErrorKind::Overflow)?;
        if index_of_new_chunk_start + SLOTS_PER_CHUNK > MAX_SLOT_INDEX as usize {
            return Err(ErrorKind::Overflow);
        }

        self.chunks.push(Box::new(Chunk::new()));
        let chunk = self.chunks.last_mut().expect("just pushed");
        let local = chunk.alloc_local().expect("freshly allocated chunk must have free slots");
        let index = index_of_new_chunk_start + local;
        Self::finish_alloc(chunk, index)
    }

    fn finish_alloc(chunk: &Chunk, index: usize) -> Result<(SlotRef, i32)> {
        let index = i32::try_from(index).map_err(|_| ErrorKind::Overflow)?;
        let local = index as usize % SLOTS_PER_CHUNK;
        let slot_ref = SlotRef::new(&chunk.slots[local]);
        Ok((slot_ref, index))
    }

    /// Return a slot to its chunk's bitmap, resetting it for reuse.
    pub(crate) fn free_slot(&mut self, index: i32) {
        debug_assert!(index >= 0);
        let index = index as usize;
        let chunk_number = index / SLOTS_PER_CHUNK;
        let local = index % SLOTS_PER_CHUNK;
        let chunk = &mut self.chunks[chunk_number];
        chunk.slots[local].reset_for_reuse();
        chunk.free_local(local);
    }

    pub(crate) fn slot_at(&self, index: i32) -> SlotRef {
        debug_assert!(index >= 0);
        let index = index as usize;
        let chunk_number = index / SLOTS_PER_CHUNK;
        let local = index % SLOTS_PER_CHUNK;
        SlotRef::new(&self.chunks[chunk_number].slots[local])
    }

    /// Walk every currently-allocated slot across all chunks. Used by teardown to
    /// find work that was never handed to a queue.
    pub(crate) fn for_each_allocated_slot(&self, mut f: impl FnMut(SlotRef)) {
        for chunk in &self.chunks {
            chunk.for_each_allocated(|local| f(SlotRef::new(&chunk.slots[local])));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_free_round_trip() {
        let mut table = SlotTable::new();
        let (slot_ref, index) = table.alloc_slot().unwrap();
        assert_eq!(index, 0);
        assert!(!slot_ref.as_ref().is_event_signaled());
        table.free_slot(index);
    }

    #[test]
    fn test_alloc_fills_chunk_before_growing() {
        let mut table = SlotTable::new();
        let mut indices = Vec::new();
        for _ in 0..SLOTS_PER_CHUNK {
            let (_, index) = table.alloc_slot().unwrap();
            indices.push(index);
        }
        assert_eq!(table.chunks.len(), 1);
        let (_, overflow_index) = table.alloc_slot().unwrap();
        assert_eq!(overflow_index, SLOTS_PER_CHUNK as i32);
        assert_eq!(table.chunks.len(), 2);
    }

    #[test]
    fn test_freed_slot_is_reused() {
        let mut table = SlotTable::new();
        let (_, first) = table.alloc_slot().unwrap();
        table.free_slot(first);
        let (_, second) = table.alloc_slot().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_slot_reset_clears_job_and_flags() {
        let mut table = SlotTable::new();
        let (slot_ref, index) = table.alloc_slot().unwrap();
        let slot = slot_ref.as_ref();
        slot.set_job(Box::new(|_ctx| {}));
        slot.cancel();
        slot.mark_event_signaled();
        slot.set_work_ring_pos(3);
        slot.mark_dispatched();
        table.free_slot(index);
        let (slot_ref2, _) = table.alloc_slot().unwrap();
        let slot2 = slot_ref2.as_ref();
        assert!(!slot2.is_event_signaled());
        assert!(!slot2.is_cancelled());
        assert_eq!(slot2.work_ring_pos(), -1);
        assert!(!slot2.is_dispatched());
        assert!(slot2.take_job().is_none());
    }

    #[test]
    fn test_for_each_allocated_slot_skips_freed_and_includes_live() {
        let mut table = SlotTable::new();
        let (_, a) = table.alloc_slot().unwrap();
        let (_, b) = table.alloc_slot().unwrap();
        table.free_slot(a);

        let mut seen = Vec::new();
        table.for_each_allocated_slot(|slot_ref| {
            seen.push(slot_ref.as_ptr());
        });
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], table.slot_at(b).as_ptr());
    }
}
