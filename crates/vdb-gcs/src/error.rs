//! Error types for the group communication service.
//!
//! Every [`GcsError`] maps to a negative errno-style code through
//! [`GcsError::code`], so callers that speak the C convention can translate
//! results without matching on variants.

use thiserror::Error;

use crate::codec::CodecError;
use crate::transport::TransportError;
use crate::types::{ActionType, Seqno};

/// Result type for GCS operations.
pub type GcsResult<T> = Result<T, GcsError>;

/// errno values used by [`GcsError::code`].
mod errno {
    pub const EIO: i64 = 5;
    pub const EAGAIN: i64 = 11;
    pub const ENOMEM: i64 = 12;
    pub const EBUSY: i64 = 16;
    pub const EINVAL: i64 = 22;
    pub const EBADFD: i64 = 77;
    pub const ESOCKTNOSUPPORT: i64 = 94;
    pub const ECONNABORTED: i64 = 103;
    pub const ENOTCONN: i64 = 107;
    pub const EALREADY: i64 = 114;
}

/// Errors that can occur during GCS operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GcsError {
    /// Operation not permitted in the current connection state.
    #[error("cannot {operation} while connection is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// Connection is already open.
    #[error("connection is already open")]
    AlreadyOpen,

    /// Another operation of the same kind is in progress.
    #[error("connection is busy")]
    Busy,

    /// Connection has been destroyed.
    #[error("connection has been destroyed")]
    Destroyed,

    /// No member can serve a state transfer right now.
    #[error("no donor available for state transfer, try later")]
    NoDonor,

    /// A state transfer is in progress for this member.
    #[error("state transfer in progress")]
    StateTransferInProgress,

    /// Action was ordered while the view was non-primary.
    #[error("action {local_seqno} ordered in non-primary configuration")]
    NotCommitted { local_seqno: Seqno },

    /// Connection is closing or closed.
    #[error("connection is shutting down")]
    Shutdown,

    /// Local receive queue exceeded its hard limit.
    #[error("receive queue overflow: {len} actions (limit {limit})")]
    QueueOverflow { len: usize, limit: usize },

    /// The delivery thread stopped without a close.
    #[error("delivery thread aborted")]
    DeliveryAborted,

    /// Transport backend failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Wire codec failure on the send path.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Action type may not be sent by the application.
    #[error("action type {0} cannot be sent by the application")]
    InvalidActionType(ActionType),

    /// Backend locator is not of the form `scheme://address`.
    #[error("invalid backend locator: {0:?}")]
    InvalidLocator(String),

    /// No transport backend registered for the scheme.
    #[error("unknown backend scheme: {0:?}")]
    UnknownBackend(String),

    /// Member identifier is empty, too long or malformed.
    #[error("invalid member id: {0:?}")]
    InvalidMemberId(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Logging subscriber could not be installed.
    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl GcsError {
    /// Creates an invalid-state error.
    pub fn invalid_state(operation: &'static str, state: impl ToString) -> Self {
        Self::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// Returns the negative errno-style code of this error.
    pub fn code(&self) -> i64 {
        let errno = match self {
            GcsError::InvalidState { .. } | GcsError::Destroyed => errno::EBADFD,
            GcsError::AlreadyOpen => errno::EALREADY,
            GcsError::Busy => errno::EBUSY,
            GcsError::NoDonor | GcsError::StateTransferInProgress => errno::EAGAIN,
            GcsError::NotCommitted { .. } => errno::ENOTCONN,
            GcsError::Shutdown | GcsError::DeliveryAborted => errno::ECONNABORTED,
            GcsError::QueueOverflow { .. } => errno::ENOMEM,
            GcsError::Transport(_) | GcsError::Codec(_) => errno::EIO,
            GcsError::UnknownBackend(_) => errno::ESOCKTNOSUPPORT,
            GcsError::InvalidActionType(_)
            | GcsError::InvalidLocator(_)
            | GcsError::InvalidMemberId(_)
            | GcsError::Config(_)
            | GcsError::Logging(_) => errno::EINVAL,
        };
        -errno
    }

    /// Returns true if the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GcsError::NoDonor | GcsError::StateTransferInProgress)
    }

    /// Returns true if the connection cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            GcsError::QueueOverflow { .. } | GcsError::DeliveryAborted => true,
            GcsError::Transport(e) => e.is_fatal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative() {
        let errors = [
            GcsError::invalid_state("send", "closed"),
            GcsError::AlreadyOpen,
            GcsError::Busy,
            GcsError::Destroyed,
            GcsError::NoDonor,
            GcsError::StateTransferInProgress,
            GcsError::NotCommitted {
                local_seqno: Seqno::FIRST,
            },
            GcsError::Shutdown,
            GcsError::DeliveryAborted,
            GcsError::QueueOverflow { len: 2, limit: 1 },
            GcsError::InvalidActionType(ActionType::Conf),
            GcsError::InvalidLocator("x".into()),
            GcsError::UnknownBackend("x".into()),
            GcsError::Config("x".into()),
        ];
        for e in &errors {
            assert!(e.code() < 0, "{e} should map to a negative code");
        }
    }

    #[test]
    fn no_donor_is_eagain() {
        assert_eq!(GcsError::NoDonor.code(), -11);
        assert!(GcsError::NoDonor.is_retryable());
        assert!(!GcsError::NoDonor.is_fatal());
    }

    #[test]
    fn classification() {
        assert!(GcsError::QueueOverflow { len: 9, limit: 8 }.is_fatal());
        assert!(GcsError::DeliveryAborted.is_fatal());
        assert!(GcsError::Transport(TransportError::Disconnected).is_fatal());
        assert!(!GcsError::Shutdown.is_retryable());
        assert!(!GcsError::AlreadyOpen.is_fatal());
        assert_eq!(GcsError::UnknownBackend("spread".into()).code(), -94);
    }

    #[test]
    fn display_mentions_state() {
        let e = GcsError::invalid_state("open", "destroyed");
        assert_eq!(e.to_string(), "cannot open while connection is destroyed");
    }
}
