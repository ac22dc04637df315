//! Unified error type for the broker core.
//!
//! Mirrors `baselib/messaging/BrokerErrorCodes.h`: every expected failure carries a
//! stable numeric code (§6); everything else is an internal error that gets wrapped with
//! a correlation id and logged, never handed raw to a peer.

use std::fmt;
use uuid::Uuid;

/// Numeric error codes carried in `AsyncRpcResponse.result.errorCode` (spec §6).
pub const ERR_AUTHORIZATION_FAILED: u32 = 13;
pub const ERR_PROTOCOL_VALIDATION_FAILED: u32 = 22;
pub const ERR_TARGET_PEER_NOT_FOUND: u32 = 99;
pub const ERR_TARGET_PEER_QUEUE_FULL: u32 = 105;
/// No single code is specified for `ServerError` in spec.md; 1 is used as the
/// catch-all and the connection is always closed alongside it (§7).
pub const ERR_SERVER_ERROR: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("protocol validation failed: {0}")]
    Protocol(String),

    #[error("authorization failed: {0}")]
    Auth(String),

    #[error("target peer not found")]
    TargetPeerNotFound,

    #[error("target peer queue full")]
    TargetPeerQueueFull,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation aborted")]
    Canceled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error [{correlation_id}]: {detail}")]
    Internal {
        correlation_id: Uuid,
        detail: String,
    },
}

impl BrokerError {
    /// Wrap an arbitrary failure as an internal error, attaching a correlation id a log
    /// line can reference without ever repeating token material (§7).
    pub fn internal(detail: impl fmt::Display) -> Self {
        BrokerError::Internal {
            correlation_id: Uuid::new_v4(),
            detail: detail.to_string(),
        }
    }

    /// Map this error to the numeric wire code from spec.md §6.
    pub fn code(&self) -> u32 {
        match self {
            BrokerError::Auth(_) => ERR_AUTHORIZATION_FAILED,
            BrokerError::Protocol(_) => ERR_PROTOCOL_VALIDATION_FAILED,
            BrokerError::TargetPeerNotFound => ERR_TARGET_PEER_NOT_FOUND,
            BrokerError::TargetPeerQueueFull => ERR_TARGET_PEER_QUEUE_FULL,
            BrokerError::Transport(_)
            | BrokerError::Timeout
            | BrokerError::Canceled
            | BrokerError::Storage(_)
            | BrokerError::Internal { .. } => ERR_SERVER_ERROR,
        }
    }

    /// Whether, per §7's propagation policy, the offending connection must be closed
    /// after this error is surfaced (protocol/transport/internal do; auth/routing/storage
    /// keep the connection open for a retry).
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            BrokerError::Protocol(_) | BrokerError::Transport(_) | BrokerError::Internal { .. }
        )
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
