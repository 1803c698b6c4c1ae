//! Error kinds surfaced to the room side and the message-status model.
//!
//! Every non-ephemeral room-side event produces exactly one status event:
//! success, or an error mapped from a [`BridgeError`]. Defaults follow the
//! propagation policy: retriable status, generic reason, unless the error
//! kind specifies its own shape.

use std::error::Error;

use thiserror::Error;

use crate::ids::{EventId, RoomId};

/// Errors produced while bridging a room-side event.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("user is not logged into the remote network")]
    NotLoggedIn,

    #[error("reactions from relayed users cannot be bridged")]
    ReactionFromRelayedUser,

    #[error("unexpected parsed content type")]
    UnexpectedContent,

    #[error("this network does not support edits")]
    EditsNotSupported,

    #[error("edits are not supported in this chat")]
    EditsNotSupportedInPortal,

    #[error("this network does not support reactions")]
    ReactionsNotSupported,

    #[error("this network does not support deleting messages")]
    RedactionsNotSupported,

    #[error("captions are not supported in this chat")]
    CaptionsNotAllowed,

    #[error("location messages are not supported in this chat")]
    LocationMessagesNotAllowed,

    #[error("the message is too old to be edited")]
    EditTargetTooOld,

    #[error("the message has been edited too many times")]
    EditTargetTooManyEdits,

    #[error("{action} target message not found")]
    TargetNotFound { action: &'static str },

    #[error("database error while {action}")]
    Database {
        action: &'static str,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },

    #[error("event handler deadline exceeded")]
    Timeout,

    /// An error reported by the network connector.
    #[error("{message}")]
    Remote { message: String, retriable: bool },
}

impl BridgeError {
    pub fn database(
        action: &'static str,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        Self::Database {
            action,
            source: Box::new(source),
        }
    }
}

/// Final status of a bridged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Success,
    /// The failure may go away on retry.
    Retriable,
    /// The failure is permanent.
    Fail,
}

/// Machine-readable reason attached to failed statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    Generic,
    Unsupported,
    TooOld,
    NotFound,
}

/// Status reported back to the room side for one event.
#[derive(Debug, Clone)]
pub struct MessageStatus {
    pub status: StatusKind,
    pub reason: ErrorReason,
    /// Human-readable description, empty on success.
    pub message: String,
    /// Whether the outcome is known rather than assumed.
    pub is_certain: bool,
    /// Whether the room connector should additionally post a notice.
    pub send_notice: bool,
}

impl MessageStatus {
    pub fn success() -> Self {
        Self {
            status: StatusKind::Success,
            reason: ErrorReason::Generic,
            message: String::new(),
            is_certain: true,
            send_notice: false,
        }
    }

    /// Map an error to its status shape. Kinds without an explicit shape fall
    /// back to retriable + generic.
    pub fn from_error(err: &BridgeError) -> Self {
        let (status, reason, is_certain, send_notice) = match err {
            BridgeError::NotLoggedIn => (StatusKind::Fail, ErrorReason::Generic, true, true),
            BridgeError::ReactionFromRelayedUser
            | BridgeError::UnexpectedContent => (StatusKind::Fail, ErrorReason::Generic, true, false),
            BridgeError::EditsNotSupported
            | BridgeError::EditsNotSupportedInPortal
            | BridgeError::ReactionsNotSupported
            | BridgeError::RedactionsNotSupported
            | BridgeError::CaptionsNotAllowed
            | BridgeError::LocationMessagesNotAllowed => {
                (StatusKind::Fail, ErrorReason::Unsupported, true, false)
            }
            BridgeError::EditTargetTooOld | BridgeError::EditTargetTooManyEdits => {
                (StatusKind::Fail, ErrorReason::TooOld, true, false)
            }
            BridgeError::TargetNotFound { .. } => {
                (StatusKind::Fail, ErrorReason::NotFound, true, false)
            }
            BridgeError::Database { .. } | BridgeError::Timeout => {
                (StatusKind::Retriable, ErrorReason::Generic, false, false)
            }
            BridgeError::Remote { retriable, .. } => {
                if *retriable {
                    (StatusKind::Retriable, ErrorReason::Generic, false, false)
                } else {
                    (StatusKind::Fail, ErrorReason::Generic, true, false)
                }
            }
        };
        Self {
            status,
            reason,
            message: err.to_string(),
            is_certain,
            send_notice,
        }
    }
}

/// The event a status refers to.
#[derive(Debug, Clone)]
pub struct StatusTarget {
    pub event_id: EventId,
    pub room_id: RoomId,
}
