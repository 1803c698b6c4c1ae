//! Collaborator interfaces.
//!
//! The core drives two external clients: the room-side server client and the
//! per-login network connector. Both are consumed as trait objects so that
//! the core never depends on a concrete protocol implementation. Optional
//! network operations are gated by [`NetworkFeatures`] flags instead of
//! probing the client for extra interfaces.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use passerelle_shared::capabilities::{NetworkFeatures, RoomCapabilities, ServerCapabilities};
use passerelle_shared::event::{
    DisappearingSetting, MemberContent, MessageContent, OutgoingContent, RoomEvent,
    StateEventContent, TypingKind,
};
use passerelle_shared::ids::{
    EmojiId, EventId, FileUrl, PartId, RemoteMessageId, RemoteUserId, RoomId, RoomTag, RoomUserId,
};
use passerelle_shared::status::{MessageStatus, StatusTarget};
use passerelle_store::{DisappearingMessage, Message, Reaction};

use crate::portal::Portal;
use crate::remote::{RemoteEdit, RemoteMessage};
use crate::users::{OrigSender, UserLogin};

/// Error from a room-side API call.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The acting identity lacks permission. State sends fall back to the
    /// bridge bot on this error.
    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Other(String),
}

/// Error from a network connector call.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct NetworkError {
    pub message: String,
    pub retriable: bool,
}

impl NetworkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }
}

/// Response to a timeline send.
#[derive(Debug, Clone)]
pub struct EventSent {
    pub event_id: EventId,
}

// ---------------------------------------------------------------------------
// Room side
// ---------------------------------------------------------------------------

/// An acting room-side identity: the bridge bot, a ghost, or a real user's
/// double-puppeted session.
#[async_trait]
pub trait Intent: Send + Sync {
    fn user_id(&self) -> RoomUserId;

    async fn send_message(
        &self,
        room: &RoomId,
        content: OutgoingContent,
        ts: DateTime<Utc>,
    ) -> Result<EventSent, ApiError>;

    async fn send_state(
        &self,
        room: &RoomId,
        state_key: &str,
        content: StateEventContent,
        extra: Option<Value>,
        ts: DateTime<Utc>,
    ) -> Result<EventSent, ApiError>;

    /// Join the room, inviting first if necessary.
    async fn ensure_joined(&self, room: &RoomId) -> Result<(), ApiError>;

    async fn mark_read(
        &self,
        room: &RoomId,
        event_id: &EventId,
        ts: DateTime<Utc>,
    ) -> Result<(), ApiError>;

    async fn mark_typing(
        &self,
        room: &RoomId,
        kind: TypingKind,
        timeout: Duration,
    ) -> Result<(), ApiError>;

    async fn mark_unread(&self, room: &RoomId, unread: bool) -> Result<(), ApiError>;

    async fn tag_room(&self, room: &RoomId, tag: &RoomTag, tagged: bool) -> Result<(), ApiError>;

    async fn mute_room(
        &self,
        room: &RoomId,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), ApiError>;
}

/// Server-level operations on the room side.
#[async_trait]
pub trait RoomApi: Send + Sync {
    fn server_name(&self) -> &str;

    fn capabilities(&self) -> ServerCapabilities;

    async fn create_room(&self, request: CreateRoomRequest) -> Result<RoomId, ApiError>;

    async fn get_members(
        &self,
        room: &RoomId,
    ) -> Result<HashMap<RoomUserId, MemberContent>, ApiError>;

    async fn get_member_info(
        &self,
        room: &RoomId,
        user: &RoomUserId,
    ) -> Result<Option<MemberContent>, ApiError>;

    async fn invite_user(&self, room: &RoomId, user: &RoomUserId) -> Result<(), ApiError>;

    /// Deliver the status of a bridged event. Failures are the connector's
    /// problem; the core fires and forgets.
    async fn send_message_status(&self, target: &StatusTarget, status: &MessageStatus);
}

/// Room creation parameters.
#[derive(Debug, Clone, Default)]
pub struct CreateRoomRequest {
    pub name: String,
    pub topic: String,
    pub is_direct: bool,
    pub is_space: bool,
    pub preset: String,
    pub visibility: String,
    /// Non-default power levels, bridge bot first.
    pub power_levels: Vec<(RoomUserId, i64)>,
    pub initial_state: Vec<InitialStateEvent>,
    /// Server-local alias carrying the portal id.
    pub local_room_id: Option<RoomId>,
    pub initial_members: Vec<RoomUserId>,
    /// When set, `invite` is honoured and invited members join automatically.
    pub auto_join_invites: bool,
    pub invite: Vec<RoomUserId>,
}

#[derive(Debug, Clone)]
pub struct InitialStateEvent {
    pub state_key: String,
    pub content: StateEventContent,
}

// ---------------------------------------------------------------------------
// Network side
// ---------------------------------------------------------------------------

/// A connected network client belonging to one login.
#[async_trait]
pub trait NetworkApi: Send + Sync {
    /// Which optional operations this connector implements at all.
    fn features(&self) -> NetworkFeatures;

    /// Whether the remote user id belongs to this login's own account.
    fn is_this_user(&self, user: &RemoteUserId) -> bool;

    /// Per-chat capabilities; may differ between DMs and groups.
    async fn room_capabilities(&self, portal: &Portal) -> RoomCapabilities;

    async fn get_chat_info(&self, portal: &Portal) -> Result<ChatInfo, NetworkError>;

    /// Send a room-side message to the network. Returns the seed of the
    /// mapping row; the core fills whatever the connector leaves unset.
    async fn handle_message(&self, message: RoomMessage<'_>) -> Result<MessageSeed, NetworkError>;

    async fn handle_edit(&self, edit: RoomEdit<'_>) -> Result<EditResult, NetworkError>;

    /// Canonicalize a reaction before deduplication and cap enforcement.
    async fn pre_handle_reaction(
        &self,
        reaction: RoomReaction<'_>,
    ) -> Result<ReactionMeta, NetworkError>;

    async fn handle_reaction(
        &self,
        reaction: RoomReaction<'_>,
    ) -> Result<ReactionSeed, NetworkError>;

    async fn handle_reaction_remove(
        &self,
        removal: RoomReactionRemove<'_>,
    ) -> Result<(), NetworkError>;

    async fn handle_message_remove(
        &self,
        removal: RoomMessageRemove<'_>,
    ) -> Result<(), NetworkError>;

    async fn handle_read_receipt(
        &self,
        receipt: RoomReadReceipt<'_>,
    ) -> Result<(), NetworkError>;

    async fn handle_typing(&self, typing: RoomTyping<'_>) -> Result<(), NetworkError>;

    /// Translate a remote message into room-side parts.
    async fn convert_message(
        &self,
        portal: &Portal,
        intent: &dyn Intent,
        event: &RemoteMessage,
    ) -> Result<ConvertedMessage, NetworkError>;

    /// Translate a remote edit against the already-bridged parts.
    async fn convert_edit(
        &self,
        portal: &Portal,
        intent: &dyn Intent,
        existing: &[Message],
        event: &RemoteEdit,
    ) -> Result<ConvertedEdit, NetworkError>;
}

/// A room-side message headed to the network.
pub struct RoomMessage<'a> {
    pub event: &'a RoomEvent,
    pub content: &'a MessageContent,
    pub portal: &'a Portal,
    pub orig_sender: Option<&'a OrigSender>,
    pub thread_root: Option<&'a Message>,
    pub reply_to: Option<&'a Message>,
}

pub struct RoomEdit<'a> {
    pub event: &'a RoomEvent,
    pub content: &'a MessageContent,
    pub portal: &'a Portal,
    pub orig_sender: Option<&'a OrigSender>,
    pub edit_target: &'a Message,
}

pub struct RoomReaction<'a> {
    pub event: &'a RoomEvent,
    pub emoji: &'a str,
    pub portal: &'a Portal,
    pub target: &'a Message,
    /// Canonical reaction data; set for `handle_reaction`, absent for
    /// `pre_handle_reaction`.
    pub meta: Option<&'a ReactionMeta>,
    /// Prior reactions by the same sender that stay within the cap.
    pub existing_to_keep: &'a [Reaction],
}

pub struct RoomReactionRemove<'a> {
    pub event: &'a RoomEvent,
    pub portal: &'a Portal,
    pub orig_sender: Option<&'a OrigSender>,
    pub target: &'a Reaction,
}

pub struct RoomMessageRemove<'a> {
    pub event: &'a RoomEvent,
    pub portal: &'a Portal,
    pub orig_sender: Option<&'a OrigSender>,
    pub target: &'a Message,
}

pub struct RoomReadReceipt<'a> {
    pub portal: &'a Portal,
    pub event_id: &'a EventId,
    pub receipt_ts: DateTime<Utc>,
    /// The previously stored read marker, if any.
    pub last_read: Option<DateTime<Utc>>,
    /// The bridged message named by the receipt, when it maps to one.
    pub exact_message: Option<&'a Message>,
    /// Timestamp the network should mark as read up to.
    pub read_up_to: DateTime<Utc>,
}

pub struct RoomTyping<'a> {
    pub portal: &'a Portal,
    pub is_typing: bool,
    pub kind: TypingKind,
}

/// Mapping-row seed returned by [`NetworkApi::handle_message`].
#[derive(Debug, Clone)]
pub struct MessageSeed {
    pub remote_id: RemoteMessageId,
    pub part_id: PartId,
    pub sender_remote_id: RemoteUserId,
    /// Remote-assigned timestamp; the room event's timestamp otherwise.
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: Value,
}

/// Outcome of a successful edit on the network side.
#[derive(Debug, Clone, Default)]
pub struct EditResult {
    /// Replacement mapping-row metadata, if the connector changed it.
    pub metadata: Option<Value>,
}

/// Canonical reaction identity on the network side.
#[derive(Debug, Clone)]
pub struct ReactionMeta {
    pub sender_id: RemoteUserId,
    pub emoji_id: EmojiId,
    pub emoji: String,
    /// Maximum reactions one sender may have on one message; zero for
    /// unlimited.
    pub max_reactions: usize,
}

/// Mapping-row seed returned by [`NetworkApi::handle_reaction`].
#[derive(Debug, Clone, Default)]
pub struct ReactionSeed {
    pub emoji_id: Option<EmojiId>,
    pub emoji: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: Value,
}

impl Default for MessageSeed {
    fn default() -> Self {
        Self {
            remote_id: RemoteMessageId(String::new()),
            part_id: PartId::default(),
            sender_remote_id: RemoteUserId(String::new()),
            timestamp: None,
            metadata: Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Converted remote content
// ---------------------------------------------------------------------------

/// Reference to a bridged message, optionally to a specific part.
#[derive(Debug, Clone)]
pub struct MessageTarget {
    pub message_id: RemoteMessageId,
    pub part_id: Option<PartId>,
}

impl MessageTarget {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: RemoteMessageId(message_id.into()),
            part_id: None,
        }
    }
}

/// Room-side event kind of one converted part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Message,
    Sticker,
}

/// One room-side event produced from a remote message.
#[derive(Debug, Clone)]
pub struct ConvertedPart {
    pub part_id: PartId,
    pub kind: PartKind,
    pub content: MessageContent,
    /// Raw top-level keys sent with the event.
    pub extra: Value,
    /// Opaque metadata stored on the mapping row.
    pub db_metadata: Value,
}

/// Result of [`NetworkApi::convert_message`].
#[derive(Debug, Clone)]
pub struct ConvertedMessage {
    pub parts: Vec<ConvertedPart>,
    pub reply_to: Option<MessageTarget>,
    pub thread_root: Option<MessageTarget>,
    pub disappear: Option<DisappearingSetting>,
}

impl ConvertedMessage {
    pub fn single(part: ConvertedPart) -> Self {
        Self {
            parts: vec![part],
            reply_to: None,
            thread_root: None,
            disappear: None,
        }
    }
}

/// A part replaced by a remote edit.
#[derive(Debug, Clone)]
pub struct ModifiedPart {
    /// The stored mapping row of the part being edited.
    pub part: Message,
    pub content: MessageContent,
    /// Raw keys for the replacement payload, wrapped under `m.new_content`.
    pub extra: Option<Value>,
    /// Raw keys for the fallback payload at the top level.
    pub top_level_extra: Option<Value>,
    /// Replacement mapping-row metadata.
    pub metadata: Option<Value>,
}

/// Result of [`NetworkApi::convert_edit`].
#[derive(Debug, Clone, Default)]
pub struct ConvertedEdit {
    pub modified: Vec<ModifiedPart>,
    /// Parts removed by the edit; redacted and deleted from the store.
    pub deleted: Vec<Message>,
}

// ---------------------------------------------------------------------------
// Chat info
// ---------------------------------------------------------------------------

/// Remote chat metadata applied to a portal.
#[derive(Clone, Default)]
pub struct ChatInfo {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub avatar: Option<Avatar>,
    pub members: Option<Vec<RemoteUserId>>,
    pub is_direct: Option<bool>,
    pub is_space: Option<bool>,
    /// Settings that apply to the requesting user only.
    pub user_local: Option<UserLocalInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct UserLocalInfo {
    pub muted_until: Option<DateTime<Utc>>,
    pub tag: Option<RoomTag>,
}

/// A remote avatar change.
#[derive(Clone)]
pub struct Avatar {
    /// Network-side identity of the avatar, used for change detection.
    pub id: String,
    pub source: AvatarSource,
}

#[derive(Clone)]
pub enum AvatarSource {
    /// The avatar was removed remotely.
    Remove,
    /// The avatar must be fetched from the network and uploaded to the room
    /// side.
    Upload(Arc<dyn ReuploadAvatar>),
}

/// Uploads remote avatar data to the room side.
#[async_trait]
pub trait ReuploadAvatar: Send + Sync {
    /// Returns the uploaded URL and content hash. Implementations may skip
    /// the upload and return `known_hash` unchanged when the content has not
    /// changed.
    async fn reupload(
        &self,
        intent: &dyn Intent,
        known_hash: Option<[u8; 32]>,
    ) -> Result<(FileUrl, [u8; 32]), NetworkError>;
}

// ---------------------------------------------------------------------------
// Ghosts and background collaborators
// ---------------------------------------------------------------------------

/// A synthetic room-side identity representing one remote user.
#[async_trait]
pub trait Ghost: Send + Sync {
    fn intent(&self) -> Arc<dyn Intent>;

    /// Refresh the ghost's profile from the network when it is stale. Called
    /// detached; implementations decide whether anything needs doing.
    async fn update_info_if_necessary(&self, source: Arc<UserLogin>);
}

/// Creates or loads ghosts by remote user id.
#[async_trait]
pub trait GhostDirectory: Send + Sync {
    async fn ghost(&self, id: &RemoteUserId) -> Result<Arc<dyn Ghost>, ApiError>;
}

/// The disappearing-message sweeper loop.
#[async_trait]
pub trait DisappearLoop: Send + Sync {
    /// Schedule a message for disappearance.
    async fn add(&self, message: DisappearingMessage);

    /// Start the timers of waiting after-read messages in a room.
    async fn start_all(&self, room: &RoomId);
}

impl From<NetworkError> for passerelle_shared::status::BridgeError {
    fn from(err: NetworkError) -> Self {
        Self::Remote {
            message: err.message,
            retriable: err.retriable,
        }
    }
}

impl From<ApiError> for passerelle_shared::status::BridgeError {
    fn from(err: ApiError) -> Self {
        Self::Remote {
            message: err.to_string(),
            retriable: !matches!(err, ApiError::Forbidden),
        }
    }
}

/// Resolve a converted disappearing setting for a message sent at `ts`.
pub fn resolve_disappear_at(
    setting: &DisappearingSetting,
    ts: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    use passerelle_shared::event::DisappearKind;
    match setting.kind {
        DisappearKind::AfterSend => Some(setting.disappear_at.unwrap_or_else(|| {
            ts + chrono::Duration::from_std(setting.timer)
                .unwrap_or_else(|_| chrono::Duration::zero())
        })),
        DisappearKind::AfterRead => setting.disappear_at,
    }
}
