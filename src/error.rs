//! ShardSync Error Types

use thiserror::Error;

use crate::shard::ShardId;

/// Result type alias for ShardSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// ShardSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Pre-flight errors
    #[error("{shard_id} unavailable: {message}")]
    UnavailableShards { shard_id: ShardId, message: String },

    // Primary errors
    #[error("{shard_id} retry on primary: {message}")]
    RetryOnPrimary {
        shard_id: ShardId,
        message: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{shard_id} is no longer the primary: {reason}")]
    NoLongerPrimary { shard_id: ShardId, reason: String },

    #[error("Node closed: {0}")]
    NodeClosed(String),

    // Resource errors
    #[error("Circuit breaking: {0}")]
    CircuitBreaking(String),

    #[error("Rejected execution: {0}")]
    Rejected(String),

    // Transport errors
    #[error("Connection failed to [{node}]: {reason}")]
    ConnectTransport { node: String, reason: String },

    #[error("[{node}][{action}] remote failure")]
    Remote {
        node: String,
        action: String,
        #[source]
        source: Box<Error>,
    },

    // Shard availability errors
    #[error("{0} not found")]
    ShardNotFound(ShardId),

    #[error("{shard_id} closed: {reason}")]
    IndexShardClosed { shard_id: ShardId, reason: String },

    #[error("{shard_id} illegal state [{state}]: {reason}")]
    IllegalShardState {
        shard_id: ShardId,
        state: String,
        reason: String,
    },

    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Status code attached to a shard failure record
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Status {
    BadRequest,
    NotFound,
    TooManyRequests,
    InternalServerError,
    ServiceUnavailable,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::BadRequest => write!(f, "BAD_REQUEST"),
            Status::NotFound => write!(f, "NOT_FOUND"),
            Status::TooManyRequests => write!(f, "TOO_MANY_REQUESTS"),
            Status::InternalServerError => write!(f, "INTERNAL_SERVER_ERROR"),
            Status::ServiceUnavailable => write!(f, "SERVICE_UNAVAILABLE"),
        }
    }
}

impl Error {
    /// Strip transport wrappers and return the error that actually happened on the remote side
    pub fn unwrap_cause(&self) -> &Error {
        let mut current = self;
        while let Error::Remote { source, .. } = current {
            current = source;
        }
        current
    }

    /// Check if a replica call that failed with this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.unwrap_cause(),
            Error::CircuitBreaking(_) | Error::Rejected(_) | Error::ConnectTransport { .. }
        )
    }

    /// Check if this error only means the target copy is gone or not ready
    pub fn is_shard_not_available(&self) -> bool {
        matches!(
            self.unwrap_cause(),
            Error::ShardNotFound(_)
                | Error::IndexShardClosed { .. }
                | Error::IllegalShardState { .. }
                | Error::UnavailableShards { .. }
                | Error::AlreadyClosed(_)
        )
    }

    /// Check if this error is caused by the local node shutting down
    pub fn is_node_closed(&self) -> bool {
        matches!(self.unwrap_cause(), Error::NodeClosed(_))
    }

    /// Check if this error is a race with a shard that is closing
    pub fn is_already_closed(&self) -> bool {
        matches!(self.unwrap_cause(), Error::AlreadyClosed(_))
    }

    /// Status code for failure reporting
    pub fn status(&self) -> Status {
        match self.unwrap_cause() {
            Error::InvalidRequest(_) | Error::Config(_) | Error::ConfigParse(_) => {
                Status::BadRequest
            }
            Error::ShardNotFound(_) => Status::NotFound,
            Error::CircuitBreaking(_) | Error::Rejected(_) => Status::TooManyRequests,
            Error::UnavailableShards { .. }
            | Error::RetryOnPrimary { .. }
            | Error::NoLongerPrimary { .. }
            | Error::NodeClosed(_)
            | Error::IndexShardClosed { .. }
            | Error::IllegalShardState { .. } => Status::ServiceUnavailable,
            _ => Status::InternalServerError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(inner: Error) -> Error {
        Error::Remote {
            node: "node-2".into(),
            action: "indices:data/write[r]".into(),
            source: Box::new(inner),
        }
    }

    #[test]
    fn test_unwrap_cause_through_nested_wrappers() {
        let err = remote(remote(Error::CircuitBreaking("parent".into())));
        assert!(matches!(err.unwrap_cause(), Error::CircuitBreaking(_)));
        assert!(err.is_retryable());
        assert_eq!(err.status(), Status::TooManyRequests);
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::Rejected("queue full".into()).is_retryable());
        assert!(Error::ConnectTransport {
            node: "node-3".into(),
            reason: "refused".into()
        }
        .is_retryable());
        assert!(!Error::InvalidRequest("bad mapping".into()).is_retryable());
        assert!(!Error::NodeClosed("shutting down".into()).is_retryable());
    }

    #[test]
    fn test_shard_not_available_classification() {
        let shard_id = ShardId::new("logs", 0);
        assert!(remote(Error::ShardNotFound(shard_id.clone())).is_shard_not_available());
        assert!(Error::AlreadyClosed("engine".into()).is_shard_not_available());
        assert!(!Error::InvalidRequest("x".into()).is_shard_not_available());
        assert!(remote(Error::NodeClosed("bye".into())).is_node_closed());
    }
}
