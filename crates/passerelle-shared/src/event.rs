//! Room-side event content model.
//!
//! The bridge core never parses wire formats; the room connector hands it
//! pre-parsed content objects and receives structured payloads back. The
//! enums here are the tagged unions both sides dispatch on.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EventId, FileUrl, RoomId, RoomUserId};

// ---------------------------------------------------------------------------
// Incoming room events
// ---------------------------------------------------------------------------

/// A single event received from the room side.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub id: EventId,
    pub room_id: RoomId,
    pub sender: RoomUserId,
    pub timestamp: DateTime<Utc>,
    pub content: RoomEventContent,
}

/// Parsed content of a room-side event.
#[derive(Debug, Clone)]
pub enum RoomEventContent {
    Message(MessageContent),
    Sticker(MessageContent),
    Reaction(ReactionContent),
    Redaction(RedactionContent),
    /// Room name/topic/avatar/encryption state changes are accepted silently;
    /// remote metadata is authoritative.
    RoomName,
    Topic,
    Avatar,
    Encryption,
    Receipt(Vec<ReadReceipt>),
    Typing(TypingContent),
}

impl RoomEventContent {
    /// Ephemeral events never produce message statuses.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Receipt(_) | Self::Typing(_))
    }
}

/// Message type of a room-side message event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Notice,
    Emote,
    Image,
    Audio,
    Video,
    File,
    Location,
}

impl MessageKind {
    pub fn is_media(&self) -> bool {
        matches!(self, Self::Image | Self::Audio | Self::Video | Self::File)
    }
}

/// Content of a room-side message or sticker.
#[derive(Debug, Clone)]
pub struct MessageContent {
    pub msg_type: MessageKind,
    pub body: String,
    /// Set for media messages; a body differing from the filename is a caption.
    pub filename: Option<String>,
    pub relates_to: RelatesTo,
    pub mentions: Mentions,
    /// For edits, the replacement content.
    pub new_content: Option<Box<MessageContent>>,
    /// Raw keys that ride alongside the parsed content.
    pub extra: Value,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msg_type: MessageKind::Text,
            body: body.into(),
            filename: None,
            relates_to: RelatesTo::default(),
            mentions: Mentions::default(),
            new_content: None,
            extra: Value::Null,
        }
    }

    pub fn notice(body: impl Into<String>) -> Self {
        Self {
            msg_type: MessageKind::Notice,
            ..Self::text(body)
        }
    }

    /// Whether this media message carries a caption next to the file.
    pub fn has_caption(&self) -> bool {
        match &self.filename {
            Some(filename) => self.msg_type.is_media() && &self.body != filename,
            None => false,
        }
    }

    /// Turn this content into an edit of `target`: the current content
    /// becomes the replacement payload and the top level becomes a fallback.
    pub fn set_edit(&mut self, target: EventId) {
        let mut inner = self.clone();
        inner.relates_to = RelatesTo::default();
        self.new_content = Some(Box::new(inner));
        self.relates_to.replaces = Some(target);
    }
}

/// Users mentioned by a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mentions {
    pub user_ids: Vec<RoomUserId>,
}

impl Mentions {
    /// Add a user to the mention list unless already present.
    pub fn add(&mut self, user_id: RoomUserId) {
        if !self.user_ids.contains(&user_id) {
            self.user_ids.push(user_id);
        }
    }
}

/// Relation block of a room-side message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelatesTo {
    /// Event replaced by this one (edit).
    pub replaces: Option<EventId>,
    /// Root of the thread this message belongs to.
    pub thread_root: Option<EventId>,
    /// Replied-to event.
    pub reply_to: Option<EventId>,
    /// True when the reply is only a thread fallback, not a real reply.
    pub reply_is_thread_fallback: bool,
}

impl RelatesTo {
    pub fn replace_id(&self) -> Option<&EventId> {
        self.replaces.as_ref()
    }

    pub fn thread_parent(&self) -> Option<&EventId> {
        self.thread_root.as_ref()
    }

    /// The reply target regardless of thread fallback status.
    pub fn reply_target(&self) -> Option<&EventId> {
        self.reply_to.as_ref()
    }

    /// The reply target only when it is a deliberate reply. Used in rooms
    /// where threads are supported and the fallback reply is redundant.
    pub fn non_fallback_reply_target(&self) -> Option<&EventId> {
        if self.reply_is_thread_fallback {
            None
        } else {
            self.reply_to.as_ref()
        }
    }

    /// Attach this message to a thread, with `fallback` as the reply shown to
    /// clients without thread support.
    pub fn set_thread(&mut self, root: EventId, fallback: EventId) {
        self.thread_root = Some(root);
        self.reply_to = Some(fallback);
        self.reply_is_thread_fallback = true;
    }

    /// Mark this message as a deliberate reply to `target`.
    pub fn set_reply(&mut self, target: EventId) {
        self.reply_to = Some(target);
        self.reply_is_thread_fallback = false;
    }
}

/// Content of a room-side reaction event.
#[derive(Debug, Clone)]
pub struct ReactionContent {
    /// The reacted-to event.
    pub relates_to: EventId,
    /// The reaction key, usually an emoji.
    pub key: String,
}

/// Content of a room-side redaction event.
#[derive(Debug, Clone)]
pub struct RedactionContent {
    pub redacts: EventId,
    pub reason: Option<String>,
}

/// One read receipt from the ephemeral receipt event.
#[derive(Debug, Clone)]
pub struct ReadReceipt {
    pub event_id: EventId,
    pub user_id: RoomUserId,
    pub timestamp: DateTime<Utc>,
}

/// Content of the ephemeral typing event: the full set of currently typing
/// users, not a delta.
#[derive(Debug, Clone)]
pub struct TypingContent {
    pub user_ids: Vec<RoomUserId>,
}

/// Kind of typing notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TypingKind {
    #[default]
    Text,
    RecordingAudio,
    RecordingVideo,
}

// ---------------------------------------------------------------------------
// Outgoing room events
// ---------------------------------------------------------------------------

/// Timeline event payloads sent through an `Intent`.
#[derive(Debug, Clone)]
pub enum OutgoingContent {
    Message(OutgoingMessage),
    Sticker(OutgoingMessage),
    Reaction(ReactionContent),
    Redaction(RedactionContent),
}

/// A message payload together with raw top-level keys.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub content: MessageContent,
    pub extra: Value,
}

impl From<MessageContent> for OutgoingMessage {
    fn from(content: MessageContent) -> Self {
        Self {
            content,
            extra: Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// State events
// ---------------------------------------------------------------------------

/// State event payloads produced by the bridge.
#[derive(Debug, Clone)]
pub enum StateEventContent {
    RoomName { name: String },
    Topic { topic: String },
    Avatar { url: Option<FileUrl> },
    /// Bridge info under the canonical state event type.
    BridgeInfo(BridgeInfoContent),
    /// Bridge info under the legacy (half-shot) state event type.
    LegacyBridgeInfo(BridgeInfoContent),
    /// Members that are part of the bridge machinery rather than people.
    FunctionalMembers { members: Vec<RoomUserId> },
    SpaceParent { via: Vec<String>, canonical: bool },
    Member(MemberContent),
    PowerLevels { users: Vec<(RoomUserId, i64)> },
}

/// Membership state of a room member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Join,
    Invite,
    Leave,
    Ban,
}

/// Content of a member state event.
#[derive(Debug, Clone)]
pub struct MemberContent {
    pub membership: Membership,
    pub display_name: Option<String>,
    pub avatar_url: Option<FileUrl>,
    pub reason: Option<String>,
}

/// Room classification carried in bridge info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeRoomType {
    Dm,
    Space,
}

/// One section of the bridge info state event (protocol, channel, network).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeInfoSection {
    pub id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<FileUrl>,
}

/// Content of the bridge info state event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeInfoContent {
    pub bridge_bot: RoomUserId,
    pub creator: RoomUserId,
    pub protocol: BridgeInfoSection,
    pub channel: BridgeInfoSection,
    /// Present when the portal has a parent; describes the top-level parent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<BridgeInfoSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_type: Option<BridgeRoomType>,
}

// ---------------------------------------------------------------------------
// Disappearing messages
// ---------------------------------------------------------------------------

/// When a disappearing-message timer starts counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisappearKind {
    /// Timer starts when the recipient reads the message.
    AfterRead,
    /// Timer starts when the message is sent.
    AfterSend,
}

impl DisappearKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AfterRead => "after_read",
            Self::AfterSend => "after_send",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "after_read" => Some(Self::AfterRead),
            "after_send" => Some(Self::AfterSend),
            _ => None,
        }
    }
}

/// A disappearing-message rule, either as a portal default (no `disappear_at`)
/// or resolved for a concrete message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisappearingSetting {
    pub kind: DisappearKind,
    pub timer: Duration,
    pub disappear_at: Option<DateTime<Utc>>,
}

impl DisappearingSetting {
    pub fn new(kind: DisappearKind, timer: Duration) -> Self {
        Self {
            kind,
            timer,
            disappear_at: None,
        }
    }
}
