//! Storage ports and drivers for lesson sync: relational store, snapshot store, retry policy.

use std::time::Duration;

mod error;
pub mod lookup;
pub mod memory;
pub mod ports;
pub mod postgres;
pub mod snapshot;

pub use error::StoreError;
pub use lookup::{LookupPlan, LOOKUP_CHUNK_SIZE, SMALL_LOOKUP_LIMIT};
pub use memory::MemoryStore;
pub use ports::{EntityStore, LessonStore, LessonTx, NewEntity, RunLock};
pub use postgres::PgStore;
pub use snapshot::{
    get_json, set_json, FileSnapshotStore, MemorySnapshotStore, SnapshotStore,
};

pub const CRATE_NAME: &str = "classync-storage";

/// Bounded exponential backoff for retrying a whole sync run.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn with_max_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}
