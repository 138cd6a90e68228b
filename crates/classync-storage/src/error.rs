use thiserror::Error;

const PG_UNIQUE_VIOLATION: &str = "23505";
const PG_SERIALIZATION_FAILURE: &str = "40001";
const PG_DEADLOCK_DETECTED: &str = "40P01";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated on {table}: {detail}")]
    UniqueViolation { table: String, detail: String },
    #[error("key {key} does not match the {table} key columns")]
    KeyShape { table: &'static str, key: String },
    #[error("{entity} row has no id")]
    MissingId { entity: &'static str },
    #[error("run lock unavailable: {0}")]
    Lock(String),
    #[error("snapshot entry {key} is not a {expected}")]
    WrongKind { key: String, expected: &'static str },
    #[error("{0}")]
    Unavailable(String),
    #[error(transparent)]
    Database(sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the whole run later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UniqueViolation { .. } | Self::Lock(_) | Self::Unavailable(_) | Self::Io(_) => {
                true
            }
            Self::Database(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => matches!(
                    db.code().as_deref(),
                    Some(PG_SERIALIZATION_FAILURE) | Some(PG_DEADLOCK_DETECTED)
                ),
                _ => false,
            },
            _ => false,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(PG_UNIQUE_VIOLATION) {
                return Self::UniqueViolation {
                    table: db.table().unwrap_or("unknown").to_string(),
                    detail: db.message().to_string(),
                };
            }
        }
        Self::Database(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn race_and_transport_errors_are_retryable() {
        let race = StoreError::UniqueViolation {
            table: "teacher".into(),
            detail: "duplicate key".into(),
        };
        assert!(race.is_retryable());
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_retryable());
        assert!(!StoreError::MissingId { entity: "Lesson" }.is_retryable());
    }
}
