//! Pool configuration
//!
//! A chainable builder: `Config::new` validates the sizing invariants up front,
//! `with_*` setters are chainable, and a couple of named presets stand in for
//! common low-latency / high-throughput tuning profiles.

use std::sync::Arc;

use crate::constants::{MAX_STORAGE_BYTES, MAX_WAIT_CHUNK, RING_CAPACITY, SLOTS_PER_CHUNK};
use crate::error::EngineError;
use crate::worker::SetupCallback;

/// Pool configuration.
///
/// `setup` is the per-worker lifecycle callback for `init_ex`: called once on a
/// worker's own thread at startup (`startup = true`) and once at termination
/// (`startup = false`).
#[derive(Clone)]
pub struct Config {
    pub worker_count: usize,
    pub ring_capacity: usize,
    pub slots_per_chunk: usize,
    pub max_wait_chunk: usize,
    pub max_storage_bytes: usize,
    pub setup: Option<SetupCallback>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("worker_count", &self.worker_count)
            .field("ring_capacity", &self.ring_capacity)
            .field("slots_per_chunk", &self.slots_per_chunk)
            .field("max_wait_chunk", &self.max_wait_chunk)
            .field("max_storage_bytes", &self.max_storage_bytes)
            .field("setup", &self.setup.is_some())
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            worker_count: num_cpus::get().max(1),
            ring_capacity: RING_CAPACITY,
            slots_per_chunk: SLOTS_PER_CHUNK,
            max_wait_chunk: MAX_WAIT_CHUNK,
            max_storage_bytes: MAX_STORAGE_BYTES,
            setup: None,
        }
    }
}

impl Config {
    /// Build a configuration with the given worker count, validating it immediately.
    pub fn new(worker_count: usize) -> Result<Self, EngineError> {
        Ok(Config {
            worker_count,
            ..Default::default()
        })
    }

    /// Favors responsiveness: one worker per core, a small ring to keep latency low.
    pub fn low_latency() -> Self {
        Config {
            worker_count: num_cpus::get().max(1),
            ring_capacity: 64,
            ..Default::default()
        }
    }

    /// Favors sustained submission rate: a larger ring and chunk size to amortize
    /// slot-table growth and dispatch-queue overflow under heavy load.
    pub fn high_throughput() -> Self {
        Config {
            worker_count: (num_cpus::get() * 2).max(2),
            ring_capacity: 1024,
            slots_per_chunk: 1024,
            ..Default::default()
        }
    }

    pub fn with_ring_capacity(mut self, ring_capacity: usize) -> Result<Self, EngineError> {
        if !ring_capacity.is_power_of_two() {
            return Err(EngineError::config("ring_capacity must be a power of two"));
        }
        self.ring_capacity = ring_capacity;
        Ok(self)
    }

    pub fn with_slots_per_chunk(mut self, slots_per_chunk: usize) -> Result<Self, EngineError> {
        if slots_per_chunk == 0 || slots_per_chunk % 32 != 0 {
            return Err(EngineError::config(
                "slots_per_chunk must be a non-zero multiple of 32",
            ));
        }
        self.slots_per_chunk = slots_per_chunk;
        Ok(self)
    }

    pub fn with_max_wait_chunk(mut self, max_wait_chunk: usize) -> Result<Self, EngineError> {
        if max_wait_chunk == 0 {
            return Err(EngineError::config("max_wait_chunk must be greater than 0"));
        }
        self.max_wait_chunk = max_wait_chunk;
        Ok(self)
    }

    pub fn with_max_storage_bytes(mut self, max_storage_bytes: usize) -> Result<Self, EngineError> {
        if max_storage_bytes == 0 {
            return Err(EngineError::config(
                "max_storage_bytes must be greater than 0",
            ));
        }
        self.max_storage_bytes = max_storage_bytes;
        Ok(self)
    }

    /// Install a per-worker setup/teardown callback, called on the worker's own
    /// thread once at startup and once at shutdown.
    pub fn with_setup<F>(mut self, setup: F) -> Self
    where
        F: Fn(u64, bool) + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(setup));
        self
    }

    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        if !self.ring_capacity.is_power_of_two() {
            return Err(EngineError::config("ring_capacity must be a power of two"));
        }
        if self.slots_per_chunk == 0 || self.slots_per_chunk % 32 != 0 {
            return Err(EngineError::config(
                "slots_per_chunk must be a non-zero multiple of 32",
            ));
        }
        if self.max_wait_chunk == 0 {
            return Err(EngineError::config("max_wait_chunk must be greater than 0"));
        }
        if self.max_storage_bytes == 0 {
            return Err(EngineError::config(
                "max_storage_bytes must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_non_power_of_two_ring_capacity() {
        let err = Config::default().with_ring_capacity(100).unwrap_err();
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn test_rejects_bad_slots_per_chunk() {
        let err = Config::default().with_slots_per_chunk(33).unwrap_err();
        assert!(err.to_string().contains("multiple of 32"));
    }

    #[test]
    fn test_low_latency_preset_is_valid() {
        assert!(Config::low_latency().validate().is_ok());
    }

    #[test]
    fn test_high_throughput_preset_is_valid() {
        assert!(Config::high_throughput().validate().is_ok());
    }

    #[test]
    fn test_with_setup_is_invoked() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let config = Config::default().with_setup(move |_tid, _startup| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        let setup = config.setup.unwrap();
        setup(1, true);
        setup(1, false);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
