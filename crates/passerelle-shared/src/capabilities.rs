//! Capability descriptors for both sides of the bridge.
//!
//! Instead of probing a client object for optional interfaces, connectors
//! advertise what they support up front and handlers gate on these values.

use std::time::Duration;

/// Operations a network connector implements at all. An unset flag means the
/// corresponding room-side events are rejected with an "unsupported" status
/// before any remote call is made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkFeatures {
    pub edits: bool,
    pub reactions: bool,
    pub redactions: bool,
    pub read_receipts: bool,
    pub typing: bool,
}

impl NetworkFeatures {
    /// A connector that supports every optional operation.
    pub fn all() -> Self {
        Self {
            edits: true,
            reactions: true,
            redactions: true,
            read_receipts: true,
            typing: true,
        }
    }
}

/// What a specific remote chat supports. Queried per portal because many
/// networks vary capabilities by chat type (DM vs group vs broadcast).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomCapabilities {
    pub captions: bool,
    pub location_messages: bool,
    pub threads: bool,
    pub replies: bool,
    pub edits: bool,
    /// Oldest message age that may still be edited.
    pub edit_max_age: Option<Duration>,
    /// Maximum number of times a single message may be edited.
    pub edit_max_count: Option<u32>,
}

/// Capabilities of the room-side server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    /// Whether invited users join automatically during room creation. When
    /// false, participants are synced again after the room exists.
    pub auto_join_invites: bool,
}
