use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient dependency problem: pool exhausted, connection failed,
    /// database busy/locked. Callers may retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Uniqueness or foreign-key violation. Never retried.
    #[error("store conflict: {0}")]
    Conflict(String),

    /// Any other query-level failure, wrapped so the cause is preserved.
    #[error("store query failed: {0}")]
    Query(#[source] rusqlite::Error),
}

/// Map a rusqlite error onto the taxonomy: busy/locked is transient,
/// constraint violations are conflicts, everything else surfaces as a
/// query failure.
pub fn classify(err: rusqlite::Error) -> StoreError {
    use rusqlite::ffi::ErrorCode;

    match &err {
        rusqlite::Error::SqliteFailure(inner, msg) => match inner.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen => {
                StoreError::Unavailable(
                    msg.clone().unwrap_or_else(|| "database busy".to_string()),
                )
            }
            ErrorCode::ConstraintViolation => StoreError::Conflict(
                msg.clone().unwrap_or_else(|| "constraint violation".to_string()),
            ),
            _ => StoreError::Query(err),
        },
        _ => StoreError::Query(err),
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        classify(err)
    }
}
