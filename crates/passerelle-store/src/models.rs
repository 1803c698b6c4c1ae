use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use passerelle_shared::event::DisappearingSetting;
use passerelle_shared::ids::{
    ChatId, EmojiId, EventId, FileUrl, LoginId, PartId, PortalKey, RemoteMessageId, RemoteUserId,
    RoomId, RoomUserId,
};

/// Persisted state of one portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRow {
    pub key: PortalKey,
    /// Empty until the room-side room has been created.
    pub room_id: Option<RoomId>,
    pub parent_id: Option<ChatId>,
    pub name: String,
    pub topic: String,
    pub avatar_id: String,
    pub avatar_url: Option<FileUrl>,
    pub avatar_hash: Option<[u8; 32]>,
    /// Whether the room side currently reflects the stored value.
    pub name_set: bool,
    pub topic_set: bool,
    pub avatar_set: bool,
    pub is_direct: bool,
    pub is_space: bool,
    pub disappear: Option<DisappearingSetting>,
    pub relay_login_id: Option<LoginId>,
}

impl PortalRow {
    /// A fresh row for a portal that has not been materialized yet.
    pub fn new(key: PortalKey) -> Self {
        Self {
            key,
            room_id: None,
            parent_id: None,
            name: String::new(),
            topic: String::new(),
            avatar_id: String::new(),
            avatar_url: None,
            avatar_hash: None,
            name_set: false,
            topic_set: false,
            avatar_set: false,
            is_direct: false,
            is_space: false,
            disappear: None,
            relay_login_id: None,
        }
    }
}

/// One part of a bridged message. A remote message maps to one or more
/// room-side events; all parts share the portal and the remote sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Stable row identifier, used for reply/thread references. Zero until
    /// the row has been inserted.
    pub row_id: i64,
    pub remote_id: RemoteMessageId,
    pub part_id: PartId,
    pub event_id: EventId,
    pub portal: PortalKey,
    pub sender_remote_id: RemoteUserId,
    pub sender_room_id: RoomUserId,
    pub timestamp: DateTime<Utc>,
    /// Row id of the replied-to or thread-root message, when known.
    pub relates_to: Option<i64>,
    pub edit_count: u32,
    /// Opaque per-network metadata.
    pub metadata: Value,
}

/// A bridged reaction, keyed by (message, part, sender, emoji id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub remote_message_id: RemoteMessageId,
    pub part_id: PartId,
    pub sender_remote_id: RemoteUserId,
    /// Empty for networks with free-form reactions.
    pub emoji_id: EmojiId,
    /// The literal emoji, stored when `emoji_id` is empty.
    pub emoji: Option<String>,
    pub event_id: EventId,
    pub portal: PortalKey,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

/// Link between a local user's login and a portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPortal {
    pub user_id: RoomUserId,
    pub login_id: LoginId,
    pub portal: PortalKey,
    /// Whether the login is a member of the chat on the network side.
    pub in_chat: bool,
    pub last_read: Option<DateTime<Utc>>,
}

impl UserPortal {
    pub fn new(user_id: RoomUserId, login_id: LoginId, portal: PortalKey) -> Self {
        Self {
            user_id,
            login_id,
            portal,
            in_chat: false,
            last_read: None,
        }
    }
}

/// A room-side event scheduled for redaction by the sweeper loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisappearingMessage {
    pub room_id: RoomId,
    pub event_id: EventId,
    pub kind: passerelle_shared::event::DisappearKind,
    pub timer: std::time::Duration,
    /// Unset until the timer has started (after-read messages wait for the
    /// read receipt).
    pub disappear_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Row conversion helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_ts(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_opt_ts(
    idx: usize,
    value: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(idx, v)).transpose()
}

pub(crate) fn parse_hash(idx: usize, value: Option<String>) -> rusqlite::Result<Option<[u8; 32]>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let bytes = hex::decode(&value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })?;
    if bytes.len() != 32 {
        return Err(rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            "avatar hash must be 32 bytes".into(),
        ));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(Some(hash))
}

pub(crate) fn parse_metadata(value: Option<String>) -> Value {
    value
        .and_then(|v| serde_json::from_str(&v).ok())
        .unwrap_or(Value::Null)
}

pub(crate) fn encode_metadata(value: &Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        serde_json::to_string(value).ok()
    }
}

/// The receiver half of a portal key as stored: empty string for shared keys.
pub(crate) fn receiver_str(key: &PortalKey) -> &str {
    key.receiver.as_ref().map(|r| r.0.as_str()).unwrap_or("")
}

pub(crate) fn key_from_parts(id: String, receiver: String) -> PortalKey {
    PortalKey {
        id: ChatId(id),
        receiver: if receiver.is_empty() {
            None
        } else {
            Some(LoginId(receiver))
        },
    }
}
