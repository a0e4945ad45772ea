use serde::{Deserialize, Serialize};

use crate::types::{LeaseId, Revision};

/// Failure to establish a session with any endpoint. Fatal for callers that need a store.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ConnectionError {
    #[error("no endpoints configured")]
    NoEndpoints,
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),
    #[error("no endpoint reachable among [{endpoints}]: {reason}")]
    Unreachable { endpoints: String, reason: String },
    #[error("failed to build http client: {0}")]
    Client(String),
}

/// Failure of a single store operation. Surfaced to the caller unchanged.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq)]
pub enum StoreError {
    #[error("required revision {requested} has been compacted (compacted at {compact_revision})")]
    Compacted {
        requested: Revision,
        compact_revision: Revision,
    },
    #[error("required revision {requested} is a future revision (current {current})")]
    FutureRevision {
        requested: Revision,
        current: Revision,
    },
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("request timed out")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("internal store error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Internal(format!("{err:#}"))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for StoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        StoreError::Timeout
    }
}
