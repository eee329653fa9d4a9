use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Concurrent write in progress for representative '{representative_id}'")]
    ConcurrencyConflict { representative_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True when the caller may retry the same operation unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. }) || self.is_store_busy()
    }

    /// SQLite gave up waiting for another connection's write lock.
    pub fn is_store_busy(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Map a busy store into a conflict scoped to one representative.
    pub fn into_conflict(self, representative_id: &str) -> Self {
        if self.is_store_busy() {
            Self::ConcurrencyConflict {
                representative_id: representative_id.to_string(),
            }
        } else {
            self
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
