//! Tuning constants and configuration defaults
//!
//! This module contains the fixed sizing constants the engine is built around,
//! along with a self-check that the invariants they imply still hold.

use static_assertions::const_assert;

/// Capacity of the work queue ring and the dispatch queue ring (must be a power of two).
pub const RING_CAPACITY: usize = 256;

/// Number of slots held by a single slot-table chunk.
pub const SLOTS_PER_CHUNK: usize = 256;

/// Number of 32-bit words in a chunk's availability bitmap (`SLOTS_PER_CHUNK / 32`).
pub const BITMAP_WORDS: usize = SLOTS_PER_CHUNK / 32;

/// Largest handle count the chunked multi-wait path handles directly.
///
/// Above this threshold, `wait_all`/`wait_any` fall back to the registered-wait path
/// (see `crate::wait`) instead of polling in chunks.
pub const MAX_WAIT_CHUNK: usize = 64;

/// Minimum guaranteed size, in bytes, of a slot's inline result storage.
pub const MAX_STORAGE_BYTES: usize = 32;

/// Inline capacity of the dispatch array before it spills to a heap allocation.
///
/// Sized to absorb a handful of jobs bursting past the work ring's capacity without
/// allocating; the array still grows unbounded beyond this if the dispatch thread
/// falls behind.
pub const DISPATCH_ARRAY_INLINE: usize = 16;

/// Largest slot index the handle encoding can address (`i32::MAX - 1`).
pub const MAX_SLOT_INDEX: i32 = i32::MAX - 1;

const_assert!(RING_CAPACITY.is_power_of_two());
const_assert!(SLOTS_PER_CHUNK % 32 == 0);
const_assert!(BITMAP_WORDS * 32 == SLOTS_PER_CHUNK);
const_assert!(MAX_WAIT_CHUNK > 0);

/// Validate that the sizing constants above are internally consistent.
pub fn validate_constants() -> Result<(), &'static str> {
    if !RING_CAPACITY.is_power_of_two() {
        return Err("RING_CAPACITY must be a power of 2");
    }
    if SLOTS_PER_CHUNK == 0 || SLOTS_PER_CHUNK % 32 != 0 {
        return Err("SLOTS_PER_CHUNK must be a non-zero multiple of 32");
    }
    if MAX_WAIT_CHUNK == 0 {
        return Err("MAX_WAIT_CHUNK must be greater than 0");
    }
    if MAX_STORAGE_BYTES == 0 {
        return Err("MAX_STORAGE_BYTES must be greater than 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_validation() {
        assert!(validate_constants().is_ok());
    }

    #[test]
    fn test_ring_capacity_is_power_of_two() {
        assert!(RING_CAPACITY.is_power_of_two());
    }

    #[test]
    fn test_bitmap_words_matches_chunk_size() {
        assert_eq!(BITMAP_WORDS * 32, SLOTS_PER_CHUNK);
    }
}
