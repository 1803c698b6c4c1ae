//! Mock collaborators and a bridge harness for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use passerelle_bridge::api::{
    ApiError, ChatInfo, ConvertedEdit, ConvertedMessage, ConvertedPart, CreateRoomRequest,
    DisappearLoop, EditResult, EventSent, Ghost, GhostDirectory, Intent, MessageSeed, NetworkApi,
    NetworkError, PartKind, ReactionMeta, ReactionSeed, RoomApi, RoomEdit, RoomMessage,
    RoomMessageRemove, RoomReaction, RoomReactionRemove, RoomReadReceipt, RoomTyping,
};
use passerelle_bridge::remote::RemoteEdit;
use passerelle_bridge::remote::RemoteMessage;
use passerelle_bridge::{Bridge, BridgeConfig, Portal, User, UserLogin};
use passerelle_shared::capabilities::{NetworkFeatures, RoomCapabilities, ServerCapabilities};
use passerelle_shared::event::{
    MemberContent, MessageContent, OutgoingContent, RoomEvent, RoomEventContent, StateEventContent,
    TypingKind,
};
use passerelle_shared::ids::{
    EmojiId, EventId, LoginId, PartId, PortalKey, RemoteMessageId, RemoteUserId, RoomId, RoomTag,
    RoomUserId,
};
use passerelle_shared::status::{MessageStatus, StatusTarget};
use passerelle_store::{Database, DisappearingMessage, PortalRow, UserPortal};

pub const ROOM: &str = "!room:example.org";
pub const CHAT: &str = "chat-1";

pub fn ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum IntentCall {
    SendMessage {
        room: RoomId,
        content: OutgoingContent,
    },
    SendState {
        room: RoomId,
        state_key: String,
        content: StateEventContent,
        extra: Option<Value>,
    },
    EnsureJoined(RoomId),
    MarkRead(RoomId, EventId),
    MarkTyping(RoomId, bool),
    MarkUnread(RoomId, bool),
    TagRoom(RoomId, RoomTag, bool),
    MuteRoom(RoomId, Option<DateTime<Utc>>),
}

pub struct MockIntent {
    user_id: RoomUserId,
    pub calls: Mutex<Vec<IntentCall>>,
    counter: AtomicU64,
    pub fail_state_forbidden: Mutex<bool>,
}

impl MockIntent {
    pub fn new(user_id: &str) -> Arc<Self> {
        Arc::new(Self {
            user_id: RoomUserId(user_id.to_string()),
            calls: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
            fail_state_forbidden: Mutex::new(false),
        })
    }

    fn next_event_id(&self) -> EventId {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        EventId(format!("${}-{}", uuid::Uuid::new_v4(), n))
    }

    pub fn sent_messages(&self) -> Vec<OutgoingContent> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                IntentCall::SendMessage { content, .. } => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn state_sends(&self) -> Vec<StateEventContent> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                IntentCall::SendState { content, .. } => Some(content.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Intent for MockIntent {
    fn user_id(&self) -> RoomUserId {
        self.user_id.clone()
    }

    async fn send_message(
        &self,
        room: &RoomId,
        content: OutgoingContent,
        _ts: DateTime<Utc>,
    ) -> Result<EventSent, ApiError> {
        self.calls.lock().push(IntentCall::SendMessage {
            room: room.clone(),
            content,
        });
        Ok(EventSent {
            event_id: self.next_event_id(),
        })
    }

    async fn send_state(
        &self,
        room: &RoomId,
        state_key: &str,
        content: StateEventContent,
        extra: Option<Value>,
        _ts: DateTime<Utc>,
    ) -> Result<EventSent, ApiError> {
        if *self.fail_state_forbidden.lock() {
            return Err(ApiError::Forbidden);
        }
        self.calls.lock().push(IntentCall::SendState {
            room: room.clone(),
            state_key: state_key.to_string(),
            content,
            extra,
        });
        Ok(EventSent {
            event_id: self.next_event_id(),
        })
    }

    async fn ensure_joined(&self, room: &RoomId) -> Result<(), ApiError> {
        self.calls.lock().push(IntentCall::EnsureJoined(room.clone()));
        Ok(())
    }

    async fn mark_read(
        &self,
        room: &RoomId,
        event_id: &EventId,
        _ts: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        self.calls
            .lock()
            .push(IntentCall::MarkRead(room.clone(), event_id.clone()));
        Ok(())
    }

    async fn mark_typing(
        &self,
        room: &RoomId,
        _kind: TypingKind,
        timeout: Duration,
    ) -> Result<(), ApiError> {
        self.calls
            .lock()
            .push(IntentCall::MarkTyping(room.clone(), !timeout.is_zero()));
        Ok(())
    }

    async fn mark_unread(&self, room: &RoomId, unread: bool) -> Result<(), ApiError> {
        self.calls
            .lock()
            .push(IntentCall::MarkUnread(room.clone(), unread));
        Ok(())
    }

    async fn tag_room(&self, room: &RoomId, tag: &RoomTag, tagged: bool) -> Result<(), ApiError> {
        self.calls
            .lock()
            .push(IntentCall::TagRoom(room.clone(), tag.clone(), tagged));
        Ok(())
    }

    async fn mute_room(
        &self,
        room: &RoomId,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), ApiError> {
        self.calls
            .lock()
            .push(IntentCall::MuteRoom(room.clone(), until));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Room API
// ---------------------------------------------------------------------------

pub struct MockRoomApi {
    pub capabilities: Mutex<ServerCapabilities>,
    pub statuses: Mutex<Vec<(StatusTarget, MessageStatus)>>,
    pub create_requests: Mutex<Vec<CreateRoomRequest>>,
    pub members: Mutex<HashMap<RoomId, HashMap<RoomUserId, MemberContent>>>,
    pub invites: Mutex<Vec<(RoomId, RoomUserId)>>,
    next_room: Mutex<u64>,
}

impl MockRoomApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            capabilities: Mutex::new(ServerCapabilities::default()),
            statuses: Mutex::new(Vec::new()),
            create_requests: Mutex::new(Vec::new()),
            members: Mutex::new(HashMap::new()),
            invites: Mutex::new(Vec::new()),
            next_room: Mutex::new(0),
        })
    }

    pub fn status_count(&self) -> usize {
        self.statuses.lock().len()
    }

    pub fn last_status(&self) -> Option<(StatusTarget, MessageStatus)> {
        self.statuses.lock().last().cloned()
    }
}

#[async_trait]
impl RoomApi for MockRoomApi {
    fn server_name(&self) -> &str {
        "example.org"
    }

    fn capabilities(&self) -> ServerCapabilities {
        *self.capabilities.lock()
    }

    async fn create_room(&self, request: CreateRoomRequest) -> Result<RoomId, ApiError> {
        let mut next = self.next_room.lock();
        *next += 1;
        let room_id = RoomId(format!("!created-{}:example.org", *next));
        self.create_requests.lock().push(request);
        Ok(room_id)
    }

    async fn get_members(
        &self,
        room: &RoomId,
    ) -> Result<HashMap<RoomUserId, MemberContent>, ApiError> {
        Ok(self.members.lock().get(room).cloned().unwrap_or_default())
    }

    async fn get_member_info(
        &self,
        room: &RoomId,
        user: &RoomUserId,
    ) -> Result<Option<MemberContent>, ApiError> {
        Ok(self
            .members
            .lock()
            .get(room)
            .and_then(|members| members.get(user).cloned()))
    }

    async fn invite_user(&self, room: &RoomId, user: &RoomUserId) -> Result<(), ApiError> {
        self.invites.lock().push((room.clone(), user.clone()));
        Ok(())
    }

    async fn send_message_status(&self, target: &StatusTarget, status: &MessageStatus) {
        self.statuses.lock().push((target.clone(), status.clone()));
    }
}

// ---------------------------------------------------------------------------
// Network API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum NetworkCall {
    HandleMessage {
        body: String,
        thread_root: Option<RemoteMessageId>,
        reply_to: Option<RemoteMessageId>,
        relayed: bool,
    },
    HandleEdit {
        target: RemoteMessageId,
        body: String,
    },
    PreHandleReaction {
        emoji: String,
    },
    HandleReaction {
        emoji: String,
        existing_to_keep: Vec<EventId>,
    },
    HandleReactionRemove {
        target_event: EventId,
    },
    HandleMessageRemove {
        target: RemoteMessageId,
    },
    HandleReadReceipt {
        read_up_to: DateTime<Utc>,
    },
    HandleTyping {
        is_typing: bool,
    },
}

pub struct MockNetwork {
    pub features: Mutex<NetworkFeatures>,
    pub room_caps: Mutex<RoomCapabilities>,
    pub calls: Mutex<Vec<NetworkCall>>,
    pub chat_info: Mutex<ChatInfo>,
    /// Remote user this login belongs to, for `is_this_user`.
    pub own_remote: Mutex<Option<RemoteUserId>>,
    /// Emoji id assigned by `pre_handle_reaction`; the literal emoji is used
    /// when unset (free-form network).
    pub reaction_emoji_ids: Mutex<bool>,
    pub max_reactions: Mutex<usize>,
    pub reaction_sender: Mutex<RemoteUserId>,
    counter: AtomicU64,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            features: Mutex::new(NetworkFeatures::all()),
            room_caps: Mutex::new(RoomCapabilities::default()),
            calls: Mutex::new(Vec::new()),
            chat_info: Mutex::new(ChatInfo::default()),
            own_remote: Mutex::new(None),
            reaction_emoji_ids: Mutex::new(true),
            max_reactions: Mutex::new(0),
            reaction_sender: Mutex::new(RemoteUserId("remote-self".to_string())),
            counter: AtomicU64::new(0),
        })
    }

    pub fn message_bodies(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                NetworkCall::HandleMessage { body, .. } => Some(body.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn typing_calls(&self) -> Vec<bool> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                NetworkCall::HandleTyping { is_typing } => Some(*is_typing),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl NetworkApi for MockNetwork {
    fn features(&self) -> NetworkFeatures {
        *self.features.lock()
    }

    fn is_this_user(&self, user: &RemoteUserId) -> bool {
        self.own_remote.lock().as_ref() == Some(user)
    }

    async fn room_capabilities(&self, _portal: &Portal) -> RoomCapabilities {
        self.room_caps.lock().clone()
    }

    async fn get_chat_info(&self, _portal: &Portal) -> Result<ChatInfo, NetworkError> {
        Ok(self.chat_info.lock().clone())
    }

    async fn handle_message(&self, message: RoomMessage<'_>) -> Result<MessageSeed, NetworkError> {
        // Give concurrent handlers a chance to interleave if serialization
        // were broken.
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.calls.lock().push(NetworkCall::HandleMessage {
            body: message.content.body.clone(),
            thread_root: message.thread_root.map(|m| m.remote_id.clone()),
            reply_to: message.reply_to.map(|m| m.remote_id.clone()),
            relayed: message.orig_sender.is_some(),
        });
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(MessageSeed {
            remote_id: RemoteMessageId(format!("net-msg-{n}")),
            part_id: PartId::default(),
            sender_remote_id: self.reaction_sender.lock().clone(),
            timestamp: None,
            metadata: Value::Null,
        })
    }

    async fn handle_edit(&self, edit: RoomEdit<'_>) -> Result<EditResult, NetworkError> {
        self.calls.lock().push(NetworkCall::HandleEdit {
            target: edit.edit_target.remote_id.clone(),
            body: edit.content.body.clone(),
        });
        Ok(EditResult::default())
    }

    async fn pre_handle_reaction(
        &self,
        reaction: RoomReaction<'_>,
    ) -> Result<ReactionMeta, NetworkError> {
        self.calls.lock().push(NetworkCall::PreHandleReaction {
            emoji: reaction.emoji.to_string(),
        });
        let emoji_id = if *self.reaction_emoji_ids.lock() {
            EmojiId(format!("emoji-{}", reaction.emoji))
        } else {
            EmojiId::default()
        };
        Ok(ReactionMeta {
            sender_id: self.reaction_sender.lock().clone(),
            emoji_id,
            emoji: reaction.emoji.to_string(),
            max_reactions: *self.max_reactions.lock(),
        })
    }

    async fn handle_reaction(
        &self,
        reaction: RoomReaction<'_>,
    ) -> Result<ReactionSeed, NetworkError> {
        self.calls.lock().push(NetworkCall::HandleReaction {
            emoji: reaction.emoji.to_string(),
            existing_to_keep: reaction
                .existing_to_keep
                .iter()
                .map(|r| r.event_id.clone())
                .collect(),
        });
        Ok(ReactionSeed::default())
    }

    async fn handle_reaction_remove(
        &self,
        removal: RoomReactionRemove<'_>,
    ) -> Result<(), NetworkError> {
        self.calls.lock().push(NetworkCall::HandleReactionRemove {
            target_event: removal.target.event_id.clone(),
        });
        Ok(())
    }

    async fn handle_message_remove(
        &self,
        removal: RoomMessageRemove<'_>,
    ) -> Result<(), NetworkError> {
        self.calls.lock().push(NetworkCall::HandleMessageRemove {
            target: removal.target.remote_id.clone(),
        });
        Ok(())
    }

    async fn handle_read_receipt(
        &self,
        receipt: RoomReadReceipt<'_>,
    ) -> Result<(), NetworkError> {
        self.calls.lock().push(NetworkCall::HandleReadReceipt {
            read_up_to: receipt.read_up_to,
        });
        Ok(())
    }

    async fn handle_typing(&self, typing: RoomTyping<'_>) -> Result<(), NetworkError> {
        self.calls.lock().push(NetworkCall::HandleTyping {
            is_typing: typing.is_typing,
        });
        Ok(())
    }

    async fn convert_message(
        &self,
        _portal: &Portal,
        _intent: &dyn Intent,
        event: &RemoteMessage,
    ) -> Result<ConvertedMessage, NetworkError> {
        match &event.payload {
            Value::String(body) => Ok(ConvertedMessage::single(text_part("", body))),
            Value::Array(bodies) => Ok(ConvertedMessage {
                parts: bodies
                    .iter()
                    .enumerate()
                    .filter_map(|(i, body)| {
                        body.as_str().map(|body| text_part(&i.to_string(), body))
                    })
                    .collect(),
                reply_to: None,
                thread_root: None,
                disappear: None,
            }),
            other => Err(NetworkError::permanent(format!(
                "unsupported payload: {other}"
            ))),
        }
    }

    async fn convert_edit(
        &self,
        _portal: &Portal,
        _intent: &dyn Intent,
        existing: &[passerelle_store::Message],
        event: &RemoteEdit,
    ) -> Result<ConvertedEdit, NetworkError> {
        let Some(body) = event.payload.as_str() else {
            return Err(NetworkError::permanent("unsupported edit payload"));
        };
        Ok(ConvertedEdit {
            modified: existing
                .iter()
                .map(|part| passerelle_bridge::api::ModifiedPart {
                    part: part.clone(),
                    content: MessageContent::text(body),
                    extra: None,
                    top_level_extra: None,
                    metadata: None,
                })
                .collect(),
            deleted: Vec::new(),
        })
    }
}

pub fn text_part(part_id: &str, body: &str) -> ConvertedPart {
    ConvertedPart {
        part_id: PartId(part_id.to_string()),
        kind: PartKind::Message,
        content: MessageContent::text(body),
        extra: Value::Null,
        db_metadata: Value::Null,
    }
}

// ---------------------------------------------------------------------------
// Ghosts and sweeper
// ---------------------------------------------------------------------------

pub struct MockGhost {
    pub intent: Arc<MockIntent>,
    pub refreshes: AtomicU64,
}

#[async_trait]
impl Ghost for MockGhost {
    fn intent(&self) -> Arc<dyn Intent> {
        self.intent.clone()
    }

    async fn update_info_if_necessary(&self, _source: Arc<UserLogin>) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockGhostDirectory {
    pub ghosts: Mutex<HashMap<RemoteUserId, Arc<MockGhost>>>,
}

impl MockGhostDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ghosts: Mutex::new(HashMap::new()),
        })
    }

    pub fn ghost_intent(&self, id: &str) -> Option<Arc<MockIntent>> {
        self.ghosts
            .lock()
            .get(&RemoteUserId(id.to_string()))
            .map(|g| g.intent.clone())
    }
}

#[async_trait]
impl GhostDirectory for MockGhostDirectory {
    async fn ghost(&self, id: &RemoteUserId) -> Result<Arc<dyn Ghost>, ApiError> {
        let mut ghosts = self.ghosts.lock();
        let ghost = ghosts.entry(id.clone()).or_insert_with(|| {
            Arc::new(MockGhost {
                intent: MockIntent::new(&format!("@ghost_{}:example.org", id.0)),
                refreshes: AtomicU64::new(0),
            })
        });
        Ok(ghost.clone())
    }
}

pub struct MockDisappearLoop {
    pub added: Mutex<Vec<DisappearingMessage>>,
    pub started: Mutex<Vec<RoomId>>,
}

impl MockDisappearLoop {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            added: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DisappearLoop for MockDisappearLoop {
    async fn add(&self, message: DisappearingMessage) {
        self.added.lock().push(message);
    }

    async fn start_all(&self, room: &RoomId) {
        self.started.lock().push(room.clone());
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct TestBridge {
    pub bridge: Arc<Bridge>,
    pub matrix: Arc<MockRoomApi>,
    pub bot: Arc<MockIntent>,
    pub ghosts: Arc<MockGhostDirectory>,
    pub disappear: Arc<MockDisappearLoop>,
}

impl TestBridge {
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let db = Arc::new(Database::open_in_memory().expect("in-memory database"));
        let matrix = MockRoomApi::new();
        let bot = MockIntent::new("@bridgebot:example.org");
        let ghosts = MockGhostDirectory::new();
        let disappear = MockDisappearLoop::new();
        let bridge = Bridge::new(
            config,
            db,
            matrix.clone(),
            bot.clone(),
            ghosts.clone(),
            disappear.clone(),
        );
        Self {
            bridge,
            matrix,
            bot,
            ghosts,
            disappear,
        }
    }

    /// Register a user with one login backed by a mock network client, plus
    /// the user-portal row that makes the login preferred for `key`.
    pub fn add_user_with_login(
        &self,
        user_id: &str,
        login_id: &str,
        key: &PortalKey,
    ) -> (Arc<User>, Arc<UserLogin>, Arc<MockNetwork>) {
        let user = User::new(RoomUserId(user_id.to_string()));
        let login = UserLogin::new(LoginId(login_id.to_string()), user.user_id.clone());
        let network = MockNetwork::new();
        login.set_client(Some(network.clone()));
        self.bridge.add_user(user.clone());
        self.bridge.register_login(&user, login.clone());
        self.bridge
            .db
            .put_user_portal(&UserPortal::new(
                user.user_id.clone(),
                login.id.clone(),
                key.clone(),
            ))
            .expect("user portal row");
        (user, login, network)
    }

    /// Insert and load a portal that already has a room.
    pub fn portal_with_room(&self, key: &PortalKey, room: &str) -> Arc<Portal> {
        let mut row = PortalRow::new(key.clone());
        row.room_id = Some(RoomId(room.to_string()));
        self.bridge.db.insert_portal(&row).expect("portal row");
        self.bridge.get_portal_by_key(key).expect("portal load")
    }

    /// Insert and load a portal without a room.
    pub fn portal_without_room(&self, key: &PortalKey) -> Arc<Portal> {
        self.bridge.get_portal_by_key(key).expect("portal load")
    }
}

pub fn room_event(event_id: &str, sender: &str, content: RoomEventContent) -> RoomEvent {
    RoomEvent {
        id: EventId(event_id.to_string()),
        room_id: RoomId(ROOM.to_string()),
        sender: RoomUserId(sender.to_string()),
        timestamp: ts(),
        content,
    }
}

pub fn text_message_event(event_id: &str, sender: &str, body: &str) -> RoomEvent {
    room_event(
        event_id,
        sender,
        RoomEventContent::Message(MessageContent::text(body)),
    )
}

/// Poll until `check` passes or two seconds elapse.
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

/// Let any already-queued events drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
