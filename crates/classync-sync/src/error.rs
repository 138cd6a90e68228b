use classync_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{entity}: {count} key(s) still unresolved after insert, first {first}")]
    Unresolved {
        entity: &'static str,
        count: usize,
        first: String,
    },
    #[error("{entity} key {key} does not match its key columns")]
    KeyShape { entity: &'static str, key: String },
    #[error("{entity} key {key} was never registered with the resolver")]
    UnknownKey { entity: &'static str, key: String },
    #[error("snapshot entry {key} is malformed: {detail}")]
    Snapshot { key: &'static str, detail: String },
}

impl SyncError {
    /// Storage hiccups and insert races are retryable; bad data is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(err) => err.is_retryable(),
            Self::Unresolved { .. } => true,
            Self::KeyShape { .. } | Self::UnknownKey { .. } | Self::Snapshot { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        let race = SyncError::Store(StoreError::UniqueViolation {
            table: "subject".into(),
            detail: "duplicate key".into(),
        });
        assert!(race.is_retryable());
        assert!(!SyncError::Snapshot {
            key: "scraped_groups",
            detail: "expected a map".into()
        }
        .is_retryable());
    }
}
