//! Identifier newtypes for both sides of the bridge.
//!
//! Remote-network identifiers (`ChatId`, `RemoteUserId`, ...) are opaque
//! strings handed to us by the network connector. Room-side identifiers
//! (`RoomId`, `EventId`, `RoomUserId`) follow the homeserver's formats but
//! are treated as opaque here as well.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Remote-network identifiers
// ---------------------------------------------------------------------------

/// Identifier of a conversation on the remote network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatId(pub String);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a user on the remote network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteUserId(pub String);

impl fmt::Display for RemoteUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a message on the remote network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteMessageId(pub String);

impl fmt::Display for RemoteMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one part of a remote message. A single remote message may
/// map to several room-side events; the empty part id is valid and denotes
/// the only part of a single-part message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartId(pub String);

impl fmt::Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a network login owned by a local user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoginId(pub String);

impl fmt::Display for LoginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network-side identifier of a reaction emoji. Empty when the network uses
/// free-form reactions, in which case the literal emoji is stored instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EmojiId(pub String);

impl EmojiId {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EmojiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Room-side identifiers
// ---------------------------------------------------------------------------

/// Identifier of a room on the room side (e.g. `!abc:example.org`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(pub String);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a single room-side event (e.g. `$deadbeef`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub String);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a user on the room side (e.g. `@alice:example.org`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomUserId(pub String);

impl fmt::Display for RoomUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to an uploaded file on the room side (content URI).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FileUrl(pub String);

impl fmt::Display for FileUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A room tag set through the local user's account data (e.g. favourites).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RoomTag(pub String);

impl fmt::Display for RoomTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Portal key
// ---------------------------------------------------------------------------

/// Identity of one bridged conversation.
///
/// Two forms exist:
/// - *shared*: `receiver` is `None`; one portal serves every local user of a
///   multi-user chat.
/// - *split*: `receiver` names a login; one portal per local user, used for
///   DMs on networks without a stable chat identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PortalKey {
    pub id: ChatId,
    pub receiver: Option<LoginId>,
}

impl PortalKey {
    /// A key for a portal shared by all local users.
    pub fn shared(id: impl Into<String>) -> Self {
        Self {
            id: ChatId(id.into()),
            receiver: None,
        }
    }

    /// A key for a portal split per receiving login.
    pub fn split(id: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self {
            id: ChatId(id.into()),
            receiver: Some(LoginId(receiver.into())),
        }
    }

    /// The same key with the receiver stripped. Used as the fallback form in
    /// registry lookups.
    pub fn without_receiver(&self) -> Self {
        Self {
            id: self.id.clone(),
            receiver: None,
        }
    }

    pub fn is_split(&self) -> bool {
        self.receiver.is_some()
    }
}

impl fmt::Display for PortalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.receiver {
            Some(receiver) => write!(f, "{}/{}", self.id, receiver),
            None => write!(f, "{}", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_key_forms() {
        let shared = PortalKey::shared("chat-1");
        assert!(!shared.is_split());
        assert_eq!(shared.to_string(), "chat-1");

        let split = PortalKey::split("chat-1", "login-a");
        assert!(split.is_split());
        assert_eq!(split.to_string(), "chat-1/login-a");
        assert_eq!(split.without_receiver(), shared);
    }

    #[test]
    fn empty_part_id_is_default() {
        assert_eq!(PartId::default(), PartId(String::new()));
    }
}
