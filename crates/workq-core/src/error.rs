use thiserror::Error;

/// Errors raised at the edges of the queue: configuration and workers.
///
/// Queue and limiter operations themselves never fail.
#[derive(Debug, Error)]
pub enum WorkqError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("config parse failed: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("reconcile failed: {0}")]
    Reconcile(String),

    #[error("worker join failed: {0}")]
    Join(String),
}
