use thiserror::Error;

/// Non-fatal failures of the known-senders pipeline.
///
/// None of these ever reject a message or drop a connection. A stage that
/// hits one logs it and continues without the trust annotation.
#[derive(Debug, Error)]
pub enum KnownSendersError {
    /// Connection, transaction or an expected field is absent.
    #[error("missing context: {0}")]
    MissingContext(String),

    /// A hostname could not be reduced to an organizational domain.
    #[error("no organizational domain for {0:?}")]
    ResolutionFailure(String),

    /// Network, timeout or protocol error against the reputation store.
    #[error("store failure: {0}")]
    StoreFailure(#[from] StoreError),

    /// The ignore list could not be reloaded; the previous snapshot stays active.
    #[error("ignore list reload failed: {0}")]
    ConfigurationReloadFailure(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation timed out after {0}ms")]
    Timeout(u64),

    #[error("store returned {got} replies for {expected} operations")]
    ReplyMismatch { expected: usize, got: usize },

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("{0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, KnownSendersError>;
