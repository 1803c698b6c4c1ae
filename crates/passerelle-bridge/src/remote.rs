//! Events received from the network side, as a tagged union.
//!
//! Connectors translate whatever their wire protocol delivers into one of
//! these variants and queue it on the portal named by the event. The payload
//! of messages and edits stays opaque; the same connector interprets it again
//! during conversion.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use passerelle_shared::event::TypingKind;
use passerelle_shared::ids::{EmojiId, LoginId, PartId, RemoteMessageId, RemoteUserId, RoomTag};

/// Who triggered a remote event.
#[derive(Debug, Clone)]
pub struct EventSender {
    pub sender: RemoteUserId,
    /// The login the sender corresponds to, when the network knows it.
    pub sender_login: Option<LoginId>,
    /// True when the event was sent by the account of the source login
    /// itself.
    pub is_from_me: bool,
}

impl EventSender {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: RemoteUserId(sender.into()),
            sender_login: None,
            is_from_me: false,
        }
    }

    pub fn from_me(sender: impl Into<String>) -> Self {
        Self {
            is_from_me: true,
            ..Self::new(sender)
        }
    }
}

/// An event delivered by a network connector.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    Message(RemoteMessage),
    Edit(RemoteEdit),
    Reaction(RemoteReaction),
    ReactionRemove(RemoteReactionRemove),
    MessageRemove(RemoteMessageRemove),
    ReadReceipt(RemoteReceipt),
    /// Delivery receipts are accepted but not bridged.
    DeliveryReceipt(RemoteReceipt),
    MarkUnread(RemoteMarkUnread),
    Typing(RemoteTyping),
    ChatTag(RemoteChatTag),
    ChatMute(RemoteChatMute),
    Unknown,
}

impl RemoteEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Edit(_) => "edit",
            Self::Reaction(_) => "reaction",
            Self::ReactionRemove(_) => "reaction remove",
            Self::MessageRemove(_) => "message remove",
            Self::ReadReceipt(_) => "read receipt",
            Self::DeliveryReceipt(_) => "delivery receipt",
            Self::MarkUnread(_) => "mark unread",
            Self::Typing(_) => "typing",
            Self::ChatTag(_) => "chat tag",
            Self::ChatMute(_) => "chat mute",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this event may trigger portal creation, and whether it wants
    /// to. `None` for event kinds that never create portals.
    pub fn portal_creation(&self) -> Option<bool> {
        match self {
            Self::Message(message) => Some(message.create_portal),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Message(e) => e.timestamp,
            Self::Edit(e) => e.timestamp,
            Self::Reaction(e) => e.timestamp,
            Self::ReactionRemove(e) => e.timestamp,
            Self::MessageRemove(e) => e.timestamp,
            Self::ReadReceipt(e) | Self::DeliveryReceipt(e) => e.timestamp,
            Self::MarkUnread(_) | Self::Typing(_) | Self::ChatTag(_) | Self::ChatMute(_)
            | Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteMessage {
    pub id: RemoteMessageId,
    pub sender: EventSender,
    pub timestamp: Option<DateTime<Utc>>,
    /// Whether a portal without a room yet should be materialized for this
    /// message.
    pub create_portal: bool,
    /// Connector-defined payload consumed by `convert_message`.
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct RemoteEdit {
    pub target: RemoteMessageId,
    pub sender: EventSender,
    pub timestamp: Option<DateTime<Utc>>,
    /// Connector-defined payload consumed by `convert_edit`.
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct RemoteReaction {
    pub target: RemoteMessageId,
    /// Specific part the reaction applies to, first part otherwise.
    pub target_part: Option<PartId>,
    pub sender: EventSender,
    pub timestamp: Option<DateTime<Utc>>,
    pub emoji: String,
    /// Empty for free-form reaction networks.
    pub emoji_id: EmojiId,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct RemoteReactionRemove {
    pub target: RemoteMessageId,
    pub target_part: Option<PartId>,
    pub sender: EventSender,
    pub timestamp: Option<DateTime<Utc>>,
    pub emoji_id: EmojiId,
}

#[derive(Debug, Clone)]
pub struct RemoteMessageRemove {
    pub target: RemoteMessageId,
    pub sender: EventSender,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RemoteReceipt {
    pub sender: EventSender,
    pub timestamp: Option<DateTime<Utc>>,
    /// The newest read message, when the network reports one directly.
    pub last_target: Option<RemoteMessageId>,
    /// Read messages to pick the newest from otherwise.
    pub targets: Vec<RemoteMessageId>,
}

#[derive(Debug, Clone)]
pub struct RemoteMarkUnread {
    pub sender: EventSender,
    pub unread: bool,
}

#[derive(Debug, Clone)]
pub struct RemoteTyping {
    pub sender: EventSender,
    pub timeout: Duration,
    pub kind: TypingKind,
}

#[derive(Debug, Clone)]
pub struct RemoteChatTag {
    pub sender: EventSender,
    /// `None` clears the tag.
    pub tag: Option<RoomTag>,
}

#[derive(Debug, Clone)]
pub struct RemoteChatMute {
    pub sender: EventSender,
    /// `None` unmutes.
    pub muted_until: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_messages_may_create_portals() {
        let typing = RemoteEvent::Typing(RemoteTyping {
            sender: EventSender::new("remote-alice"),
            timeout: Duration::from_secs(5),
            kind: TypingKind::Text,
        });
        assert_eq!(typing.portal_creation(), None);

        let message = RemoteEvent::Message(RemoteMessage {
            id: RemoteMessageId("msg-1".into()),
            sender: EventSender::new("remote-alice"),
            timestamp: None,
            create_portal: true,
            payload: Value::Null,
        });
        assert_eq!(message.portal_creation(), Some(true));
    }
}
