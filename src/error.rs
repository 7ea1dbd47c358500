use thiserror::Error;

/// Error taxonomy for the knowledge base engine.
///
/// Callers can rely on the variant to decide how to react:
/// [`KbError::InvalidInput`] is always raised before the store is touched,
/// [`KbError::StoreCorruption`] recommends running `kb repair`, and the
/// capability variants mean lexical behavior is still available.
#[derive(Debug, Error)]
pub enum KbError {
    /// Rejected before any store access (empty query, malformed path).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Schema mismatch or missing table; run `kb repair` to rebuild.
    #[error("index store corrupted: {0} (run `kb repair`)")]
    StoreCorruption(String),

    /// The embed/chat endpoint is not configured or failed after retries.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// The embed/chat call exceeded the configured timeout.
    #[error("capability timed out: {0}")]
    CapabilityTimeout(String),

    /// A write transaction could not commit; the document's prior state
    /// is preserved and other documents continue.
    #[error("transaction failed: {0}")]
    TransactionFailure(#[source] sqlx::Error),

    #[error(transparent)]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The store cannot be opened/created or the KB root does not exist.
    #[error("{0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, KbError>;
