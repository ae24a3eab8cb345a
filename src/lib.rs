//! A single-producer, multi-consumer asynchronous execution engine.
//!
//! A fixed-capacity pool of worker threads drains a lock-free bounded work queue;
//! a dispatch relay thread buffers submissions past the queue's capacity; and a
//! composite wait engine lets the owner thread block on one or many outstanding
//! jobs, stealing and running them itself rather than idling when it can.
//!
//! Only the thread that calls [`Pool::init`] may call any other method on the
//! resulting [`Pool`] — see that type's docs for the full contract.

pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod pool;
pub mod ring;
pub mod signal;
pub mod slot;
pub mod wait;
pub mod worker;

pub use config::Config;
pub use error::{EngineError, ErrorKind};
pub use handle::Handle;
pub use pool::{sleep, Pool, WaitAnyResult};
pub use slot::{Job, WorkerContext};

/// Crate version, as reported by Cargo.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_pool_init_and_destroy_is_clean() {
        let pool = Pool::init(2).unwrap();
        pool.destroy(true);
    }

    #[test]
    fn test_end_to_end_push_and_wait() {
        let pool = Pool::init(2).unwrap();
        let total = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..16 {
            let total = total.clone();
            handles.push(pool.push(
                Box::new(move |ctx| {
                    ctx.report_progress(i);
                    total.fetch_add(1, Ordering::SeqCst);
                }),
                false,
            ));
        }
        pool.wait_all(&handles).unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 16);
        pool.destroy(true);
    }
}
