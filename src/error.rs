use std::fmt;

use thiserror::Error;

/// Errors returned by registry and role-topic operations.
///
/// Every variant is raised before any write happens, except `Storage`.
#[derive(Debug, Error)]
pub enum HookError {
    /// Malformed or missing request fields.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A record with the same unique key already exists.
    #[error("{0}")]
    Conflict(String),

    /// The principal may not use the topic or touch the record.
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl HookError {
    /// HTTP status an outer API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            HookError::Validation(_) => 400,
            HookError::Forbidden(_) => 403,
            HookError::NotFound(_) => 404,
            HookError::Conflict(_) => 409,
            HookError::Storage(_) => 500,
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        HookError::Validation(message.into())
    }
}

/// Failures surfaced by storage adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique key constraint rejected the write.
    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid pagination cursor")]
    InvalidCursor,
}

/// Errors returned by [`Dispatcher::notify`](crate::Dispatcher::notify).
///
/// Individual delivery failures are never errors; they are recorded outcomes.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Matching hooks could not be loaded.
    #[error("failed to load hooks for topic {topic}: {source}")]
    Storage {
        topic: String,
        #[source]
        source: StoreError,
    },

    /// The event could not be rendered as JSON.
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Final outcome of attempting to deliver an event to one hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { status: u16 },
    Failed(FailureReason),
}

impl DeliveryOutcome {
    /// Status stored in the delivery history.
    pub fn response_status(&self) -> u16 {
        match self {
            DeliveryOutcome::Delivered { status } => *status,
            DeliveryOutcome::Failed(reason) => reason.response_status(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// Reasons why an HTTP delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    Network,
    /// The request could not be built (bad header, bad URL).
    InvalidRequest,
    RemoteError(u16),
    ClientError(u16),
}

/// Status recorded when no HTTP response was received.
pub const TRANSPORT_FAILURE_STATUS: u16 = 500;

impl FailureReason {
    pub fn response_status(&self) -> u16 {
        match self {
            FailureReason::RemoteError(status) | FailureReason::ClientError(status) => *status,
            FailureReason::Timeout | FailureReason::Network | FailureReason::InvalidRequest => {
                TRANSPORT_FAILURE_STATUS
            }
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout =>
                write!(f, "request timed out"),
            FailureReason::Network =>
                write!(f, "network error"),
            FailureReason::InvalidRequest =>
                write!(f, "request could not be built"),
            FailureReason::RemoteError(status) =>
                write!(f, "remote endpoint returned {status}"),
            FailureReason::ClientError(status) =>
                write!(f, "endpoint rejected request with {status}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_use_sentinel_status() {
        assert_eq!(DeliveryOutcome::Failed(FailureReason::Timeout).response_status(), 500);
        assert_eq!(DeliveryOutcome::Failed(FailureReason::Network).response_status(), 500);
        assert_eq!(DeliveryOutcome::Failed(FailureReason::ClientError(404)).response_status(), 404);
        assert_eq!(DeliveryOutcome::Delivered { status: 204 }.response_status(), 204);
    }

    #[test]
    fn hook_errors_map_to_http_status() {
        assert_eq!(HookError::validation("x").status_code(), 400);
        assert_eq!(HookError::Forbidden("x".into()).status_code(), 403);
        assert_eq!(HookError::NotFound("x".into()).status_code(), 404);
        assert_eq!(HookError::Conflict("x".into()).status_code(), 409);
        assert_eq!(HookError::Storage(StoreError::InvalidCursor).status_code(), 500);
    }
}
