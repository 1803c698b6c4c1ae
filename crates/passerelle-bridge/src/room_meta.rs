//! Portal metadata: room name/topic/avatar, bridge info, participant sync,
//! and room creation.
//!
//! The `*_set` flags track whether the room side currently reflects the
//! stored value; an update is a no-op when the value is unchanged and either
//! already set or there is no room yet.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use passerelle_shared::event::{
    BridgeInfoContent, BridgeInfoSection, BridgeRoomType, MemberContent, Membership,
    StateEventContent,
};
use passerelle_shared::ids::{RemoteUserId, RoomId, RoomUserId};
use passerelle_shared::status::BridgeError;

use crate::api::{
    ApiError, Avatar, AvatarSource, ChatInfo, CreateRoomRequest, Ghost, InitialStateEvent,
    UserLocalInfo,
};
use crate::bridge::Bridge;
use crate::portal::Portal;
use crate::users::UserLogin;

impl Portal {
    // -----------------------------------------------------------------------
    // Name / topic / avatar
    // -----------------------------------------------------------------------

    /// Returns whether the portal changed.
    pub async fn update_name(
        &self,
        bridge: &Bridge,
        name: &str,
        sender: Option<&Arc<dyn Ghost>>,
        ts: DateTime<Utc>,
    ) -> bool {
        let unchanged = self.with_state(|state| {
            state.name == name && (state.name_set || state.room_id.is_none())
        });
        if unchanged {
            return false;
        }
        self.with_state_mut(|state| state.name = name.to_string());
        let set = self
            .send_room_meta(
                bridge,
                sender,
                ts,
                "",
                StateEventContent::RoomName {
                    name: name.to_string(),
                },
            )
            .await;
        self.with_state_mut(|state| state.name_set = set);
        true
    }

    /// Returns whether the portal changed.
    pub async fn update_topic(
        &self,
        bridge: &Bridge,
        topic: &str,
        sender: Option<&Arc<dyn Ghost>>,
        ts: DateTime<Utc>,
    ) -> bool {
        let unchanged = self.with_state(|state| {
            state.topic == topic && (state.topic_set || state.room_id.is_none())
        });
        if unchanged {
            return false;
        }
        self.with_state_mut(|state| state.topic = topic.to_string());
        let set = self
            .send_room_meta(
                bridge,
                sender,
                ts,
                "",
                StateEventContent::Topic {
                    topic: topic.to_string(),
                },
            )
            .await;
        self.with_state_mut(|state| state.topic_set = set);
        true
    }

    /// Returns whether the portal changed. A failed reupload still counts as
    /// a change (the avatar id moved), but leaves `avatar_set` false.
    pub async fn update_avatar(
        &self,
        bridge: &Bridge,
        avatar: &Avatar,
        sender: Option<&Arc<dyn Ghost>>,
        ts: DateTime<Utc>,
    ) -> bool {
        let unchanged = self.with_state(|state| {
            state.avatar_id == avatar.id && (state.avatar_set || state.room_id.is_none())
        });
        if unchanged {
            return false;
        }
        self.with_state_mut(|state| state.avatar_id = avatar.id.clone());
        match &avatar.source {
            AvatarSource::Remove => {
                self.with_state_mut(|state| {
                    state.avatar_url = None;
                    state.avatar_hash = None;
                });
            }
            AvatarSource::Upload(reupload) => {
                let known_hash = self.with_state(|state| state.avatar_hash);
                let intent = match sender {
                    Some(ghost) => ghost.intent(),
                    None => bridge.bot.clone(),
                };
                match reupload.reupload(intent.as_ref(), known_hash).await {
                    Err(e) => {
                        self.with_state_mut(|state| state.avatar_set = false);
                        error!(error = %e, "Failed to reupload room avatar");
                        return true;
                    }
                    Ok((url, hash)) => {
                        if Some(hash) == known_hash {
                            return true;
                        }
                        self.with_state_mut(|state| {
                            state.avatar_url = Some(url);
                            state.avatar_hash = Some(hash);
                        });
                    }
                }
            }
        }
        let url = self.with_state(|state| state.avatar_url.clone());
        let set = self
            .send_room_meta(bridge, sender, ts, "", StateEventContent::Avatar { url })
            .await;
        self.with_state_mut(|state| state.avatar_set = set);
        true
    }

    /// Send a state event as the given ghost (or the bot), retrying as the
    /// bot when the ghost is not allowed to set state. Returns whether the
    /// event reached the room.
    pub(crate) async fn send_room_meta(
        &self,
        bridge: &Bridge,
        sender: Option<&Arc<dyn Ghost>>,
        ts: DateTime<Utc>,
        state_key: &str,
        content: StateEventContent,
    ) -> bool {
        let Some(room_id) = self.room_id() else {
            return false;
        };
        let intent = match sender {
            Some(ghost) => ghost.intent(),
            None => bridge.bot.clone(),
        };
        let mut result = intent
            .send_state(&room_id, state_key, content.clone(), None, ts)
            .await;
        if matches!(result, Err(ApiError::Forbidden)) && intent.user_id() != bridge.bot.user_id() {
            let extra = serde_json::json!({
                "fi.mau.bridge.set_by": intent.user_id().0,
            });
            result = bridge
                .bot
                .send_state(&room_id, state_key, content, Some(extra), ts)
                .await;
        }
        match result {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Failed to set room metadata");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Bridge info
    // -----------------------------------------------------------------------

    pub(crate) fn bridge_info(&self, bridge: &Bridge) -> (String, BridgeInfoContent) {
        let bot_id = bridge.bot.user_id();
        let (name, avatar_url, is_direct, is_space) = self.with_state(|state| {
            (
                state.name.clone(),
                state.avatar_url.clone(),
                state.is_direct,
                state.is_space,
            )
        });
        let room_type = if is_direct {
            Some(BridgeRoomType::Dm)
        } else if is_space {
            Some(BridgeRoomType::Space)
        } else {
            None
        };
        let network = self.top_level_parent().map(|parent| {
            let (parent_name, parent_avatar) =
                parent.with_state(|state| (state.name.clone(), state.avatar_url.clone()));
            BridgeInfoSection {
                id: parent.key.id.0.clone(),
                display_name: parent_name,
                avatar_url: parent_avatar,
            }
        });
        let info = BridgeInfoContent {
            bridge_bot: bot_id.clone(),
            creator: bot_id,
            protocol: BridgeInfoSection {
                id: bridge.config.network_id.clone(),
                display_name: bridge.config.network_name.clone(),
                avatar_url: None,
            },
            channel: BridgeInfoSection {
                id: self.key.id.0.clone(),
                display_name: name,
                avatar_url,
            },
            network,
            room_type,
        };
        (bridge.config.bridge_id.clone(), info)
    }

    /// Re-send the bridge info state events (canonical and legacy types).
    pub async fn update_bridge_info(&self, bridge: &Bridge) {
        if self.room_id().is_none() {
            return;
        }
        let (state_key, info) = self.bridge_info(bridge);
        self.send_room_meta(
            bridge,
            None,
            Utc::now(),
            &state_key,
            StateEventContent::BridgeInfo(info.clone()),
        )
        .await;
        self.send_room_meta(
            bridge,
            None,
            Utc::now(),
            &state_key,
            StateEventContent::LegacyBridgeInfo(info),
        )
        .await;
    }

    // -----------------------------------------------------------------------
    // Participants
    // -----------------------------------------------------------------------

    /// Bring the room's member list in line with the remote chat.
    ///
    /// Returns (expected room-side member ids, extra functional members).
    /// Members matching a logged-in local user use that user's double-puppet
    /// when available, otherwise the user is invited and their ghost is
    /// marked functional. With no relay configured, room members that are not
    /// expected are removed.
    pub async fn sync_participants(
        &self,
        bridge: &Arc<Bridge>,
        members: &[RemoteUserId],
        source: &Arc<UserLogin>,
    ) -> Result<(Vec<RoomUserId>, Vec<RoomUserId>), BridgeError> {
        let mut logins_in_portal: Vec<Arc<UserLogin>> = bridge
            .db
            .get_login_ids_in_portal(&self.key)
            .map_err(|e| BridgeError::database("getting user logins in portal", e))?
            .iter()
            .filter_map(|id| bridge.login(id))
            .collect();
        if !logins_in_portal.iter().any(|login| login.id == source.id) {
            logins_in_portal.push(source.clone());
        }

        let mut expected_user_ids = Vec::with_capacity(members.len());
        let mut expected_extra_users = Vec::new();
        let mut extra_functional_members = Vec::new();
        let mut expected_intents = Vec::with_capacity(members.len());
        for member in members {
            let mut user_intent = None;
            let mut is_logged_in_user = false;
            for login in &logins_in_portal {
                let Some(client) = login.client() else {
                    continue;
                };
                if client.is_this_user(member) {
                    is_logged_in_user = true;
                    match bridge.user(&login.user_id).and_then(|u| u.double_puppet()) {
                        Some(dp) => user_intent = Some(dp),
                        None => {
                            expected_extra_users.push(login.user_id.clone());
                            expected_user_ids.push(login.user_id.clone());
                        }
                    }
                    break;
                }
            }
            let ghost = bridge.ghosts.ghost(member).await.map_err(|e| {
                BridgeError::Remote {
                    message: format!("failed to get ghost for {member}: {e}"),
                    retriable: true,
                }
            })?;
            {
                let refresh = ghost.clone();
                let source = source.clone();
                tokio::spawn(async move {
                    refresh.update_info_if_necessary(source).await;
                });
            }
            let intent = match user_intent {
                Some(intent) => intent,
                None => {
                    let ghost_intent = ghost.intent();
                    if is_logged_in_user {
                        extra_functional_members.push(ghost_intent.user_id());
                    }
                    ghost_intent
                }
            };
            expected_user_ids.push(intent.user_id());
            expected_intents.push(intent);
        }

        let Some(room_id) = self.room_id() else {
            return Ok((expected_user_ids, extra_functional_members));
        };

        let mut current_members: HashMap<RoomUserId, MemberContent> =
            match bridge.matrix.get_members(&room_id).await {
                Ok(members) => members,
                Err(e) => {
                    error!(error = %e, "Failed to get current room members");
                    HashMap::new()
                }
            };
        // Ghosts and double-puppets are server-local, so they join directly.
        for intent in &expected_intents {
            let user_id = intent.user_id();
            let joined = matches!(
                current_members.remove(&user_id).map(|m| m.membership),
                Some(Membership::Join)
            );
            if !joined {
                if let Err(e) = intent.ensure_joined(&room_id).await {
                    error!(user_id = %user_id, error = %e, "Failed to ensure user is joined to room");
                }
            }
        }
        // Real local users without a double-puppet get a plain invite.
        for user_id in &expected_extra_users {
            let invited = matches!(
                current_members.remove(user_id).map(|m| m.membership),
                Some(Membership::Join) | Some(Membership::Invite)
            );
            if !invited {
                if let Err(e) = bridge.matrix.invite_user(&room_id, user_id).await {
                    error!(user_id = %user_id, error = %e, "Failed to invite user to room");
                }
            }
        }
        if self.relay().is_none() {
            let bot_id = bridge.bot.user_id();
            for (user_id, member) in current_members {
                if user_id == bot_id
                    || matches!(member.membership, Membership::Leave | Membership::Ban)
                {
                    continue;
                }
                let content = StateEventContent::Member(MemberContent {
                    membership: Membership::Leave,
                    display_name: member.display_name,
                    avatar_url: member.avatar_url,
                    reason: Some("User is not in remote chat".to_string()),
                });
                let result = bridge
                    .bot
                    .send_state(&room_id, &user_id.0, content, None, Utc::now())
                    .await;
                if let Err(e) = result {
                    error!(user_id = %user_id, error = %e, "Failed to remove user from room");
                }
            }
        }
        Ok((expected_user_ids, extra_functional_members))
    }

    // -----------------------------------------------------------------------
    // Composite info update
    // -----------------------------------------------------------------------

    pub async fn update_info(
        &self,
        bridge: &Arc<Bridge>,
        info: &ChatInfo,
        source: Option<&Arc<UserLogin>>,
        sender: Option<&Arc<dyn Ghost>>,
        ts: DateTime<Utc>,
    ) {
        let mut changed = false;
        if let Some(name) = &info.name {
            changed |= self.update_name(bridge, name, sender, ts).await;
        }
        if let Some(topic) = &info.topic {
            changed |= self.update_topic(bridge, topic, sender, ts).await;
        }
        if let Some(avatar) = &info.avatar {
            changed |= self.update_avatar(bridge, avatar, sender, ts).await;
        }
        if let (Some(members), Some(source)) = (&info.members, source) {
            if self.room_id().is_some() {
                if let Err(e) = self.sync_participants(bridge, members, source).await {
                    error!(error = %e, "Failed to sync room members");
                }
            }
        }
        if let Some(is_direct) = info.is_direct {
            let flipped = self.with_state_mut(|state| {
                if state.is_direct != is_direct {
                    state.is_direct = is_direct;
                    true
                } else {
                    false
                }
            });
            changed |= flipped;
        }
        if let Some(source) = source {
            if let Err(e) =
                bridge
                    .db
                    .ensure_user_portal_exists(&source.user_id, &source.id, &self.key)
            {
                warn!(error = %e, "Failed to ensure user portal row exists");
            }
            self.update_user_local_info(bridge, info.user_local.as_ref(), source)
                .await;
        }
        if changed {
            self.update_bridge_info(bridge).await;
            if let Err(e) = self.save(bridge) {
                error!(error = %e, "Failed to save portal to database after updating info");
            }
        }
    }

    /// Apply per-user room settings through the user's double-puppet.
    async fn update_user_local_info(
        &self,
        bridge: &Bridge,
        info: Option<&UserLocalInfo>,
        source: &Arc<UserLogin>,
    ) {
        let Some(info) = info else {
            return;
        };
        let Some(room_id) = self.room_id() else {
            return;
        };
        let Some(dp) = bridge.user(&source.user_id).and_then(|u| u.double_puppet()) else {
            return;
        };
        if let Some(muted_until) = info.muted_until {
            if let Err(e) = dp.mute_room(&room_id, Some(muted_until)).await {
                error!(error = %e, "Failed to mute room");
            }
        }
        if let Some(tag) = &info.tag {
            if let Err(e) = dp.tag_room(&room_id, tag, !tag.0.is_empty()).await {
                error!(error = %e, "Failed to tag room");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Room creation
    // -----------------------------------------------------------------------

    /// Create the room-side room for this portal. Idempotent: concurrent and
    /// repeated calls return once the room exists.
    pub async fn create_room(
        &self,
        bridge: &Arc<Bridge>,
        source: &Arc<UserLogin>,
        info: Option<ChatInfo>,
    ) -> Result<(), BridgeError> {
        let _guard = self.room_create_lock.lock().await;
        if self.room_id().is_some() {
            return Ok(());
        }
        info!(portal_id = %self.key, "Creating room");

        let info = match info {
            Some(info) => info,
            None => {
                let client = source.client().ok_or(BridgeError::NotLoggedIn)?;
                client
                    .get_chat_info(self)
                    .await
                    .map_err(BridgeError::from)?
            }
        };
        self.update_info(bridge, &info, Some(source), None, Utc::now())
            .await;
        if info.is_space.unwrap_or(false) {
            self.with_state_mut(|state| state.is_space = true);
        }
        let members = info.members.clone().unwrap_or_default();
        let (initial_members, extra_functional_members) =
            self.sync_participants(bridge, &members, source).await?;

        let (name, topic, avatar_url, is_direct, is_space) = self.with_state(|state| {
            (
                state.name.clone(),
                state.topic.clone(),
                state.avatar_url.clone(),
                state.is_direct,
                state.is_space,
            )
        });
        let auto_join_invites = bridge.matrix.capabilities().auto_join_invites;
        let mut request = CreateRoomRequest {
            name,
            topic: topic.clone(),
            is_direct,
            is_space,
            preset: "private_chat".to_string(),
            visibility: "private".to_string(),
            power_levels: vec![(bridge.bot.user_id(), 9001)],
            initial_state: Vec::with_capacity(6),
            local_room_id: Some(RoomId(format!(
                "!{}:{}",
                self.key.id,
                bridge.matrix.server_name()
            ))),
            initial_members: initial_members.clone(),
            auto_join_invites,
            invite: if auto_join_invites {
                initial_members
            } else {
                Vec::new()
            },
        };

        let (bridge_info_key, bridge_info) = self.bridge_info(bridge);
        let mut functional_members = extra_functional_members;
        functional_members.push(bridge.bot.user_id());
        request.initial_state.push(InitialStateEvent {
            state_key: String::new(),
            content: StateEventContent::FunctionalMembers {
                members: functional_members,
            },
        });
        request.initial_state.push(InitialStateEvent {
            state_key: bridge_info_key.clone(),
            content: StateEventContent::LegacyBridgeInfo(bridge_info.clone()),
        });
        request.initial_state.push(InitialStateEvent {
            state_key: bridge_info_key,
            content: StateEventContent::BridgeInfo(bridge_info),
        });
        if topic.is_empty() {
            // An explicit empty topic avoids a spurious state event if the
            // topic is set later.
            request.initial_state.push(InitialStateEvent {
                state_key: String::new(),
                content: StateEventContent::Topic {
                    topic: String::new(),
                },
            });
        }
        if let Some(url) = avatar_url {
            request.initial_state.push(InitialStateEvent {
                state_key: String::new(),
                content: StateEventContent::Avatar { url: Some(url) },
            });
        }
        if let Some(parent) = &self.parent {
            if let Some(parent_room) = parent.room_id() {
                request.initial_state.push(InitialStateEvent {
                    state_key: parent_room.0,
                    content: StateEventContent::SpaceParent {
                        via: vec![bridge.matrix.server_name().to_string()],
                        canonical: true,
                    },
                });
            }
        }

        let room_id = bridge
            .matrix
            .create_room(request)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to create room");
                BridgeError::from(e)
            })?;
        info!(portal_id = %self.key, room_id = %room_id, "Room created");
        self.with_state_mut(|state| {
            state.room_id = Some(room_id.clone());
            state.name_set = true;
            state.topic_set = true;
            state.avatar_set = true;
        });
        bridge.reindex_room(&self.key, room_id);
        self.save(bridge)
            .map_err(|e| BridgeError::database("saving portal after room creation", e))?;
        self.update_user_local_info(bridge, info.user_local.as_ref(), source)
            .await;
        if !auto_join_invites {
            if let Err(e) = self.sync_participants(bridge, &members, source).await {
                error!(error = %e, "Failed to sync participants after room creation");
            }
        }
        Ok(())
    }
}
