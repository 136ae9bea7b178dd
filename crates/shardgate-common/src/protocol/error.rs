use thiserror::Error;

use super::Namespace;

#[derive(Error, Debug)]
pub enum ShardgateError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A shard's partition version did not match the router's cached view.
    ///
    /// The namespace may be empty when the shard did not report one; callers
    /// fall back to the namespace of the operation they were running.
    #[error("Stale topology for namespace '{namespace}'")]
    StaleTopology { namespace: String },

    #[error("Operation exceeded time limit")]
    ExceededTimeLimit,

    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(String),

    #[error("Shard unavailable: {0}")]
    ShardUnavailable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ShardgateError {
    /// Builds a staleness signal for `namespace`.
    pub fn stale(namespace: &Namespace) -> Self {
        ShardgateError::StaleTopology {
            namespace: namespace.to_string(),
        }
    }

    /// Numeric code reported to clients in `{ok: 0, code: ...}` documents.
    pub fn code(&self) -> i32 {
        match self {
            ShardgateError::Unauthorized(_) => 13,
            ShardgateError::InvalidArgument(_) => 2,
            ShardgateError::StaleTopology { .. } => 13388,
            ShardgateError::ExceededTimeLimit => 50,
            ShardgateError::InternalInconsistency(_) => 17012,
            ShardgateError::ShardUnavailable(_) => 6,
            ShardgateError::Transport(_) => 9001,
            ShardgateError::InvalidResponse(_) => 10200,
            ShardgateError::Json(_) => 22,
            ShardgateError::Io(_) => 9001,
            ShardgateError::Config(_) => 14,
        }
    }

    pub fn is_stale_topology(&self) -> bool {
        matches!(self, ShardgateError::StaleTopology { .. })
    }
}

pub type Result<T> = std::result::Result<T, ShardgateError>;
