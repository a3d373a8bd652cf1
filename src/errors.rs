use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Domain-specific error types for the settlement engine.
/// Business-rule rejections are permanent and never retried.
/// Only infrastructure failures (`Store`, `Timeout`) are transient.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("insufficient balance: needed {needed}, available {available}")]
    InsufficientBalance { needed: Decimal, available: Decimal },

    #[error("daily quota exceeded, resets at {resets_at}")]
    QuotaExceeded { resets_at: DateTime<Utc> },

    #[error("trade {trade_id} not yet due (matures at {matures_at})")]
    NotYetDue {
        trade_id: String,
        matures_at: DateTime<Utc>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("trade {0} has no maturity time")]
    MissingMaturity(String),

    #[error("store unavailable: {0}")]
    Store(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("state corruption: {0}")]
    StateCorruption(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{op} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        last: Box<EngineError>,
    },
}

impl EngineError {
    /// Connectivity and timeout failures. Everything else aborts immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Store(_) | EngineError::Timeout(_))
    }

    /// Errors the caller caused and should see verbatim.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::InsufficientBalance { .. }
                | EngineError::QuotaExceeded { .. }
                | EngineError::NotFound(_)
                | EngineError::Permission(_)
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match e.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen,
            ) => EngineError::Store(e.to_string()),
            _ => EngineError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::StateCorruption(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Store(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::Store("down".into()).is_transient());
        assert!(EngineError::Timeout("slow".into()).is_transient());
        assert!(!EngineError::NotFound("t1".into()).is_transient());
        assert!(!EngineError::Validation("stake".into()).is_transient());
        assert!(!EngineError::Permission("nope".into()).is_transient());
    }

    #[test]
    fn test_busy_sqlite_is_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(EngineError::from(busy).is_transient());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!EngineError::from(constraint).is_transient());
    }
}
