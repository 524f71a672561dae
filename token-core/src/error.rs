use thiserror::Error;

/// Errors raised by a durable token store
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached (pool closed, timed out, I/O failure)
    #[error("Store connectivity error: {0}")]
    Connectivity(String),

    /// Errors that occur with the underlying storage backend
    #[error("Database error: {0}")]
    Database(String),

    /// A stored row could not be mapped back to a record
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Errors related to missing data
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic errors that don't fit in other categories
    #[error("Other error: {0}")]
    Other(String),

    /// Anyhow error wrapper for error context
    #[error(transparent)]
    Context(#[from] anyhow::Error),
}

/// Represents all possible errors that can occur when selecting tokens
#[derive(Error, Debug)]
pub enum SelectionError {
    /// The visible, unreserved records cannot cover the requested amount.
    /// Returned only after every partial reservation has been released.
    #[error("Insufficient spendable states identified for {0}")]
    InsufficientBalance(String),

    /// Enough records exist, but some of them are soft locked by other selections
    #[error("Insufficient not locked spendable states identified for {0}")]
    InsufficientUnlockedBalance(String),

    /// A selection handle was asked to select more than once
    #[error("Each instance can only be used to select tokens once")]
    DoubleSelection,

    /// The durable store failed; never retried by the selection logic
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The caller cancelled the selection while it was waiting to retry
    #[error("Token selection was cancelled")]
    Cancelled,

    /// A record violates the data model (for example, a zero quantity)
    #[error("Invalid token record: {0}")]
    InvalidRecord(String),

    /// A move or exit could not be planned from the selected records
    #[error("Invalid move: {0}")]
    InvalidMove(String),

    /// Configuration is missing or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Handle state could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No async runtime was available to schedule background work
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Summing quantities overflowed 64 bits
    #[error("Amount overflow")]
    AmountOverflow,
}

impl SelectionError {
    /// Whether the caller may reasonably retry the same request later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SelectionError::InsufficientBalance(_)
                | SelectionError::InsufficientUnlockedBalance(_)
        )
    }
}

impl From<bincode::Error> for SelectionError {
    fn from(err: bincode::Error) -> Self {
        SelectionError::Serialization(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("Row not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Connectivity(err.to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

impl From<String> for StoreError {
    fn from(err: String) -> Self {
        StoreError::Other(err)
    }
}

impl From<&str> for StoreError {
    fn from(err: &str) -> Self {
        StoreError::Other(err.to_string())
    }
}
