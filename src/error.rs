//! Error types for uasub.
//!
//! All errors are strongly typed using thiserror. Configuration errors are raised
//! synchronously at creation time and are never partially applied; service errors
//! concern a single resource and never affect its siblings; transport errors describe
//! the state of the channel a session runs on.

use thiserror::Error;

use crate::node_id::NodeId;
use crate::status::StatusCode;
use crate::subscription::{CloseReason, MonitoredItemId, SubscriptionId};
use crate::value::DataType;

/// Invalid subscription, monitored item or server parameters.
#[allow(missing_docs)]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Publishing interval must be greater than zero")]
    PublishingIntervalZero,

    #[error("Lifetime count {lifetime_count} must be greater than max keep-alive count {max_keep_alive_count}")]
    LifetimeNotAboveKeepAlive {
        lifetime_count: u32,
        max_keep_alive_count: u32,
    },

    #[error("Max keep-alive count must be at least 1")]
    KeepAliveCountZero,

    #[error("Queue size must be at least 1")]
    QueueSizeZero,

    #[error("Queue size {requested} exceeds the server maximum of {max}")]
    QueueSizeTooLarge {
        requested: usize,
        max: usize,
    },

    #[error("Cannot shrink queue to {requested}: {queued} notifications are still queued")]
    QueueShrinkWouldDiscard {
        requested: usize,
        queued: usize,
    },

    #[error("Too many subscriptions for this session (max: {max})")]
    TooManySubscriptions {
        max: usize,
    },

    #[error("Too many monitored items for this subscription (max: {max})")]
    TooManyMonitoredItems {
        max: usize,
    },

    #[error("Too many sessions (max: {max})")]
    TooManySessions {
        max: usize,
    },

    #[error("Invalid node id '{input}'")]
    InvalidNodeId {
        input: String,
    },

    #[error("Invalid browse path '{path}': {reason}")]
    InvalidBrowsePath {
        path: String,
        reason: String,
    },

    #[error("Duplicate node id {node_id}")]
    DuplicateNodeId {
        node_id: NodeId,
    },

    #[error("Invalid configuration field '{field}': {reason}")]
    InvalidField {
        field: String,
        reason: String,
    },
}

/// Errors returned by individual service calls.
#[allow(missing_docs)]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServiceError {
    #[error("Node not found: {node_id}")]
    NodeNotFound {
        node_id: NodeId,
    },

    #[error("Node {node_id} is not a variable")]
    NotAVariable {
        node_id: NodeId,
    },

    #[error("Browse path '{path}' does not resolve from {root}")]
    NoMatch {
        root: NodeId,
        path: String,
    },

    #[error("Subscription not found: {id}")]
    SubscriptionNotFound {
        id: SubscriptionId,
    },

    #[error("Monitored item {item} not found in subscription {subscription}")]
    MonitoredItemNotFound {
        subscription: SubscriptionId,
        item: MonitoredItemId,
    },

    #[error("Variable {node_id} is read-only")]
    ReadOnly {
        node_id: NodeId,
    },

    #[error("Type mismatch writing {node_id}: expected {expected}, got {actual}")]
    TypeMismatch {
        node_id: NodeId,
        expected: DataType,
        actual: DataType,
    },

    #[error("Write to {node_id} rejected by the variable: {status}")]
    WriteRejected {
        node_id: NodeId,
        status: StatusCode,
    },

    #[error("Subscription {id} is closed ({reason})")]
    SubscriptionClosed {
        id: SubscriptionId,
        reason: CloseReason,
    },

    #[error("Access denied for user '{user}'")]
    AccessDenied {
        user: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },
}

/// Errors describing the channel a session runs on.
#[allow(missing_docs)]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Channel disconnected: {reason}")]
    Disconnected {
        reason: String,
    },

    #[error("Session is closed")]
    SessionClosed,
}

/// Top-level error type for uasub.
#[allow(missing_docs)]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UaError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl UaError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub(crate) fn poisoned(context: &'static str) -> Self {
        Self::internal(format!("poisoned lock: {context}"))
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is a service error.
    #[must_use]
    pub const fn is_service(&self) -> bool {
        matches!(self, Self::Service(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the error names an unknown node, subscription or item.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Service(
                ServiceError::NodeNotFound { .. }
                    | ServiceError::NoMatch { .. }
                    | ServiceError::SubscriptionNotFound { .. }
                    | ServiceError::MonitoredItemNotFound { .. }
            )
        )
    }

    /// Returns true if the target subscription or session has already closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::Service(ServiceError::SubscriptionClosed { .. }) | Self::Transport(TransportError::SessionClosed)
        )
    }

    /// Maps the error onto the protocol status code reported to clients.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration(e) => match e {
                ConfigurationError::TooManySubscriptions { .. } => StatusCode::BadTooManySubscriptions,
                ConfigurationError::TooManyMonitoredItems { .. } => StatusCode::BadTooManyMonitoredItems,
                ConfigurationError::TooManySessions { .. } => StatusCode::BadTooManySessions,
                ConfigurationError::InvalidNodeId { .. } => StatusCode::BadNodeIdInvalid,
                ConfigurationError::InvalidBrowsePath { .. } => StatusCode::BadBrowseNameInvalid,
                ConfigurationError::DuplicateNodeId { .. } => StatusCode::BadNodeIdExists,
                _ => StatusCode::BadInvalidArgument,
            },
            Self::Service(e) => match e {
                ServiceError::NodeNotFound { .. } => StatusCode::BadNodeIdUnknown,
                ServiceError::NotAVariable { .. } => StatusCode::BadAttributeIdInvalid,
                ServiceError::NoMatch { .. } => StatusCode::BadNoMatch,
                ServiceError::SubscriptionNotFound { .. } | ServiceError::SubscriptionClosed { .. } => {
                    StatusCode::BadSubscriptionIdInvalid
                }
                ServiceError::MonitoredItemNotFound { .. } => StatusCode::BadMonitoredItemIdInvalid,
                ServiceError::ReadOnly { .. } => StatusCode::BadNotWritable,
                ServiceError::TypeMismatch { .. } => StatusCode::BadTypeMismatch,
                ServiceError::WriteRejected { status, .. } => *status,
                ServiceError::AccessDenied { .. } => StatusCode::BadUserAccessDenied,
                ServiceError::Timeout { .. } => StatusCode::BadTimeout,
            },
            Self::Transport(e) => match e {
                TransportError::Disconnected { .. } => StatusCode::BadNotConnected,
                TransportError::SessionClosed => StatusCode::BadSessionClosed,
            },
            Self::Internal { .. } => StatusCode::BadInternalError,
        }
    }
}

/// Result type alias for uasub operations.
pub type UaResult<T> = Result<T, UaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_lifetime() {
        let err = ConfigurationError::LifetimeNotAboveKeepAlive {
            lifetime_count: 10,
            max_keep_alive_count: 10,
        };
        let msg = format!("{err}");
        assert!(msg.contains("Lifetime count 10"));
        assert!(msg.contains("keep-alive count 10"));
    }

    #[test]
    fn test_service_error_read_only() {
        let err = ServiceError::ReadOnly {
            node_id: NodeId::string(1, "free_memory"),
        };
        let msg = format!("{err}");
        assert!(msg.contains("read-only"));
        assert!(msg.contains("ns=1;s=free_memory"));
    }

    #[test]
    fn test_ua_error_from_configuration() {
        let err: UaError = ConfigurationError::PublishingIntervalZero.into();
        assert!(err.is_configuration());
        assert!(!err.is_not_found());
        assert_eq!(err.status_code(), StatusCode::BadInvalidArgument);
    }

    #[test]
    fn test_ua_error_not_found_classification() {
        let err: UaError = ServiceError::SubscriptionNotFound { id: SubscriptionId::new(7) }.into();
        assert!(err.is_service());
        assert!(err.is_not_found());
        assert_eq!(err.status_code(), StatusCode::BadSubscriptionIdInvalid);

        let err: UaError = ServiceError::NodeNotFound {
            node_id: NodeId::numeric(1, 42),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::BadNodeIdUnknown);
    }

    #[test]
    fn test_ua_error_write_status_mapping() {
        let ro: UaError = ServiceError::ReadOnly {
            node_id: NodeId::numeric(1, 1),
        }
        .into();
        assert_eq!(ro.status_code(), StatusCode::BadNotWritable);

        let mismatch: UaError = ServiceError::TypeMismatch {
            node_id: NodeId::numeric(1, 1),
            expected: DataType::Double,
            actual: DataType::String,
        }
        .into();
        assert_eq!(mismatch.status_code(), StatusCode::BadTypeMismatch);
    }

    #[test]
    fn test_ua_error_closed_classification() {
        let err: UaError = ServiceError::SubscriptionClosed {
            id: SubscriptionId::new(3),
            reason: CloseReason::Expired,
        }
        .into();
        assert!(err.is_closed());
        assert!(!err.is_not_found());

        let err: UaError = TransportError::SessionClosed.into();
        assert!(err.is_closed());
        assert_eq!(err.status_code(), StatusCode::BadSessionClosed);
    }

    #[test]
    fn test_transport_error() {
        let err: UaError = TransportError::Disconnected {
            reason: "peer reset".to_string(),
        }
        .into();
        assert!(err.is_transport());
        assert!(format!("{err}").contains("peer reset"));
        assert_eq!(err.status_code(), StatusCode::BadNotConnected);
    }

    #[test]
    fn test_ua_error_internal() {
        let err = UaError::internal("unexpected state");
        assert!(err.is_internal());
        assert_eq!(err.status_code(), StatusCode::BadInternalError);
        assert!(format!("{err}").contains("unexpected state"));
    }
}
