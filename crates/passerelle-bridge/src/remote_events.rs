//! Translation of network-side events into room-side calls.
//!
//! Remote events arrive as [`RemoteEvent`] variants. A portal without a room
//! only materializes for events that ask for it; everything else is dropped
//! until the room exists. Sends are per-part: a failing part is logged and
//! skipped rather than rolling back the whole event.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, warn};

use passerelle_shared::event::{
    DisappearingSetting, MessageContent, OutgoingContent, OutgoingMessage, ReactionContent,
    RedactionContent,
};
use passerelle_shared::ids::{EventId, RoomId};
use passerelle_store::{DisappearingMessage, Message, Reaction};

use crate::api::{resolve_disappear_at, Intent, NetworkError, PartKind};
use crate::bridge::Bridge;
use crate::portal::Portal;
use crate::remote::{
    EventSender, RemoteChatMute, RemoteChatTag, RemoteEdit, RemoteEvent, RemoteMarkUnread,
    RemoteMessage, RemoteMessageRemove, RemoteReaction, RemoteReactionRemove, RemoteReceipt,
    RemoteTyping,
};
use crate::users::UserLogin;

impl Portal {
    pub(crate) async fn handle_remote_event(
        &self,
        bridge: &Arc<Bridge>,
        source: Arc<UserLogin>,
        event: RemoteEvent,
    ) {
        if self.room_id().is_none() {
            if event.portal_creation() != Some(true) {
                debug!(
                    portal_id = %self.key,
                    kind = event.kind(),
                    "Dropping remote event for portal without a room"
                );
                return;
            }
            if let Err(e) = self.create_room(bridge, &source, None).await {
                error!(portal_id = %self.key, error = %e, "Failed to create room to handle event");
                return;
            }
        }
        match event {
            RemoteEvent::Message(event) => self.handle_remote_message(bridge, &source, event).await,
            RemoteEvent::Edit(event) => self.handle_remote_edit(bridge, &source, event).await,
            RemoteEvent::Reaction(event) => {
                self.handle_remote_reaction(bridge, &source, event).await
            }
            RemoteEvent::ReactionRemove(event) => {
                self.handle_remote_reaction_remove(bridge, &source, event).await
            }
            RemoteEvent::MessageRemove(event) => {
                self.handle_remote_message_remove(bridge, &source, event).await
            }
            RemoteEvent::ReadReceipt(event) => {
                self.handle_remote_read_receipt(bridge, &source, event).await
            }
            RemoteEvent::DeliveryReceipt(_) => {}
            RemoteEvent::MarkUnread(event) => {
                self.handle_remote_mark_unread(bridge, &source, event).await
            }
            RemoteEvent::Typing(event) => self.handle_remote_typing(bridge, &source, event).await,
            RemoteEvent::ChatTag(event) => self.handle_remote_chat_tag(bridge, &source, event).await,
            RemoteEvent::ChatMute(event) => {
                self.handle_remote_chat_mute(bridge, &source, event).await
            }
            RemoteEvent::Unknown => {
                debug!(portal_id = %self.key, "Ignoring remote event with unknown type");
            }
        }
    }

    /// Resolve the acting room-side identity for a remote sender: the source
    /// user's double-puppet for own events, the sender login's double-puppet
    /// when known, the sender's ghost otherwise.
    pub(crate) async fn intent_for(
        &self,
        bridge: &Arc<Bridge>,
        sender: &EventSender,
        source: &Arc<UserLogin>,
    ) -> Option<Arc<dyn Intent>> {
        let mut intent = None;
        if sender.is_from_me {
            intent = bridge.user(&source.user_id).and_then(|u| u.double_puppet());
        }
        if intent.is_none() {
            if let Some(login_id) = &sender.sender_login {
                intent = bridge
                    .login(login_id)
                    .and_then(|login| bridge.user(&login.user_id))
                    .and_then(|user| user.double_puppet());
            }
        }
        if intent.is_none() {
            match bridge.ghosts.ghost(&sender.sender).await {
                Ok(ghost) => {
                    let refresh = ghost.clone();
                    let source = source.clone();
                    tokio::spawn(async move {
                        refresh.update_info_if_necessary(source).await;
                    });
                    intent = Some(ghost.intent());
                }
                Err(e) => {
                    error!(sender = %sender.sender, error = %e, "Failed to get ghost for remote sender");
                    return None;
                }
            }
        }
        intent
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    async fn handle_remote_message(
        &self,
        bridge: &Arc<Bridge>,
        source: &Arc<UserLogin>,
        event: RemoteMessage,
    ) {
        match bridge.db.get_first_part_by_id(&event.id) {
            Ok(Some(existing)) => {
                debug!(
                    remote_id = %event.id,
                    existing_event_id = %existing.event_id,
                    "Ignoring duplicate message"
                );
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Failed to check if message is a duplicate");
            }
        }
        let Some(intent) = self.intent_for(bridge, &event.sender, source).await else {
            return;
        };
        let ts = event.timestamp.unwrap_or_else(Utc::now);
        let Some(client) = source.client() else {
            error!(login_id = %source.id, "Source login has no client to convert message");
            return;
        };
        let converted = match client.convert_message(self, intent.as_ref(), &event).await {
            Ok(converted) => converted,
            Err(e) => {
                error!(remote_id = %event.id, error = %e, "Failed to convert remote message");
                self.send_remote_error_notice(bridge, intent.as_ref(), &e, ts, "message")
                    .await;
                return;
            }
        };
        let Some(room_id) = self.room_id() else {
            return;
        };

        let mut relates_to_row = None;
        let mut reply_to: Option<Message> = None;
        if let Some(target) = &converted.reply_to {
            match bridge
                .db
                .get_first_or_specific_part(&target.message_id, target.part_id.as_ref())
            {
                Ok(Some(message)) => {
                    relates_to_row = Some(message.row_id);
                    reply_to = Some(message);
                }
                Ok(None) => warn!(target = %target.message_id, "Reply target message not found"),
                Err(e) => error!(error = %e, "Failed to get reply target message from database"),
            }
        }
        let mut thread_root: Option<Message> = None;
        let mut prev_thread_event: Option<Message> = None;
        if let Some(target) = &converted.thread_root {
            match bridge
                .db
                .get_first_or_specific_part(&target.message_id, target.part_id.as_ref())
            {
                Ok(Some(message)) => {
                    relates_to_row = Some(message.row_id);
                    // The thread root doubles as the reply fallback until a
                    // later part takes over.
                    prev_thread_event = Some(message.clone());
                    thread_root = Some(message);
                }
                Ok(None) => warn!(target = %target.message_id, "Thread root message not found"),
                Err(e) => error!(error = %e, "Failed to get thread root message from database"),
            }
        }

        for part in converted.parts {
            let mut content = part.content;
            if let (Some(root), Some(prev)) = (&thread_root, &prev_thread_event) {
                content
                    .relates_to
                    .set_thread(root.event_id.clone(), prev.event_id.clone());
            }
            if let Some(reply) = &reply_to {
                content.relates_to.set_reply(reply.event_id.clone());
                content.mentions.add(reply.sender_room_id.clone());
            }
            let outgoing = match part.kind {
                PartKind::Message => OutgoingContent::Message(OutgoingMessage {
                    content,
                    extra: part.extra,
                }),
                PartKind::Sticker => OutgoingContent::Sticker(OutgoingMessage {
                    content,
                    extra: part.extra,
                }),
            };
            let sent = match intent.send_message(&room_id, outgoing, ts).await {
                Ok(sent) => sent,
                Err(e) => {
                    error!(part_id = %part.part_id, error = %e, "Failed to send message part to room");
                    continue;
                }
            };
            debug!(
                event_id = %sent.event_id,
                part_id = %part.part_id,
                "Sent message part to room"
            );
            let mut row = Message {
                row_id: 0,
                remote_id: event.id.clone(),
                part_id: part.part_id.clone(),
                event_id: sent.event_id,
                portal: self.key.clone(),
                sender_remote_id: event.sender.sender.clone(),
                sender_room_id: intent.user_id(),
                timestamp: ts,
                relates_to: relates_to_row,
                edit_count: 0,
                metadata: part.db_metadata,
            };
            if let Err(e) = bridge.db.insert_message(&mut row) {
                error!(part_id = %part.part_id, error = %e, "Failed to save message part to database");
            }
            if let Some(disappear) = &converted.disappear {
                self.schedule_disappearance(bridge, &room_id, &row.event_id, disappear, ts);
            }
            if prev_thread_event.is_some() {
                prev_thread_event = Some(row);
            }
        }
    }

    async fn send_remote_error_notice(
        &self,
        bridge: &Arc<Bridge>,
        intent: &dyn Intent,
        err: &NetworkError,
        ts: DateTime<Utc>,
        kind: &str,
    ) {
        let Some(room_id) = self.room_id() else {
            return;
        };
        let content = MessageContent::notice(format!(
            "An error occurred while processing an incoming {kind}"
        ));
        let extra = serde_json::json!({
            "fi.mau.bridge.internal_error": err.to_string(),
        });
        let result = intent
            .send_message(
                &room_id,
                OutgoingContent::Message(OutgoingMessage { content, extra }),
                ts,
            )
            .await;
        match result {
            Ok(sent) => {
                debug!(event_id = %sent.event_id, "Sent error notice after remote event handling failed");
            }
            Err(e) => {
                error!(error = %e, "Failed to send error notice after remote event handling failed");
            }
        }
    }

    async fn handle_remote_edit(
        &self,
        bridge: &Arc<Bridge>,
        source: &Arc<UserLogin>,
        event: RemoteEdit,
    ) {
        let existing = match bridge.db.get_all_parts_by_id(&event.target) {
            Ok(existing) => existing,
            Err(e) => {
                error!(error = %e, "Failed to get edit target message");
                return;
            }
        };
        if existing.is_empty() {
            warn!(target = %event.target, "Edit target message not found");
            return;
        }
        let Some(intent) = self.intent_for(bridge, &event.sender, source).await else {
            return;
        };
        let ts = event.timestamp.unwrap_or_else(Utc::now);
        let Some(client) = source.client() else {
            error!(login_id = %source.id, "Source login has no client to convert edit");
            return;
        };
        let converted = match client
            .convert_edit(self, intent.as_ref(), &existing, &event)
            .await
        {
            Ok(converted) => converted,
            Err(e) => {
                error!(target = %event.target, error = %e, "Failed to convert remote edit");
                self.send_remote_error_notice(bridge, intent.as_ref(), &e, ts, "edit")
                    .await;
                return;
            }
        };
        let Some(room_id) = self.room_id() else {
            return;
        };

        for part in converted.modified {
            let mut content = part.content;
            content.set_edit(part.part.event_id.clone());
            // The replacement extras go under m.new_content; the top level
            // carries the fallback's extras.
            let mut extra = part.top_level_extra.unwrap_or(Value::Null);
            if let Some(inner) = part.extra {
                if !extra.is_object() {
                    extra = Value::Object(serde_json::Map::new());
                }
                if let Value::Object(map) = &mut extra {
                    map.insert("m.new_content".to_string(), inner);
                }
            }
            let result = intent
                .send_message(
                    &room_id,
                    OutgoingContent::Message(OutgoingMessage { content, extra }),
                    ts,
                )
                .await;
            match result {
                Ok(sent) => {
                    debug!(
                        event_id = %sent.event_id,
                        part_id = %part.part.part_id,
                        "Sent message part edit to room"
                    );
                }
                Err(e) => {
                    error!(part_event_id = %part.part.event_id, error = %e, "Failed to edit message part");
                }
            }
            let mut row = part.part;
            if let Some(metadata) = part.metadata {
                row.metadata = metadata;
            }
            if let Err(e) = bridge.db.update_message(&row) {
                error!(part_row_id = row.row_id, error = %e, "Failed to update message part in database");
            }
        }
        for part in converted.deleted {
            let result = intent
                .send_message(
                    &room_id,
                    OutgoingContent::Redaction(RedactionContent {
                        redacts: part.event_id.clone(),
                        reason: None,
                    }),
                    ts,
                )
                .await;
            match result {
                Ok(sent) => {
                    debug!(
                        redaction_event_id = %sent.event_id,
                        redacted_event_id = %part.event_id,
                        part_id = %part.part_id,
                        "Sent redaction of message part to room"
                    );
                }
                Err(e) => {
                    error!(part_event_id = %part.event_id, error = %e, "Failed to redact message part deleted in edit");
                }
            }
            if let Err(e) = bridge.db.delete_message(part.row_id) {
                error!(part_row_id = part.row_id, error = %e, "Failed to delete message part from database");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reactions
    // -----------------------------------------------------------------------

    async fn handle_remote_reaction(
        &self,
        bridge: &Arc<Bridge>,
        source: &Arc<UserLogin>,
        event: RemoteReaction,
    ) {
        let target = match bridge
            .db
            .get_first_or_specific_part(&event.target, event.target_part.as_ref())
        {
            Ok(Some(target)) => target,
            Ok(None) => {
                warn!(target = %event.target, "Reaction target message not found");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to get target message for reaction");
                return;
            }
        };
        let existing = match bridge.db.get_reaction(
            &target.remote_id,
            &target.part_id,
            &event.sender.sender,
            &event.emoji_id,
        ) {
            Ok(existing) => existing,
            Err(e) => {
                error!(error = %e, "Failed to check if reaction is a duplicate");
                return;
            }
        };
        if let Some(existing) = &existing {
            if !event.emoji_id.is_empty() || existing.emoji.as_deref() == Some(event.emoji.as_str())
            {
                debug!("Ignoring duplicate reaction");
                return;
            }
        }
        let ts = event.timestamp.unwrap_or_else(Utc::now);
        let Some(intent) = self.intent_for(bridge, &event.sender, source).await else {
            return;
        };
        let Some(room_id) = self.room_id() else {
            return;
        };
        let sent = match intent
            .send_message(
                &room_id,
                OutgoingContent::Reaction(ReactionContent {
                    relates_to: target.event_id.clone(),
                    key: event.emoji.clone(),
                }),
                ts,
            )
            .await
        {
            Ok(sent) => sent,
            Err(e) => {
                error!(error = %e, "Failed to send reaction to room");
                return;
            }
        };
        debug!(event_id = %sent.event_id, "Sent reaction to room");
        let reaction = Reaction {
            remote_message_id: target.remote_id.clone(),
            part_id: target.part_id.clone(),
            sender_remote_id: event.sender.sender.clone(),
            emoji_id: event.emoji_id.clone(),
            emoji: event.emoji_id.is_empty().then(|| event.emoji.clone()),
            event_id: sent.event_id,
            portal: self.key.clone(),
            timestamp: ts,
            metadata: event.metadata.clone(),
        };
        if let Err(e) = bridge.db.upsert_reaction(&reaction) {
            error!(error = %e, "Failed to save reaction to database");
        }
        if let Some(existing) = existing {
            let result = intent
                .send_message(
                    &room_id,
                    OutgoingContent::Redaction(RedactionContent {
                        redacts: existing.event_id.clone(),
                        reason: None,
                    }),
                    ts,
                )
                .await;
            if let Err(e) = result {
                error!(error = %e, "Failed to redact old reaction");
            }
        }
    }

    async fn handle_remote_reaction_remove(
        &self,
        bridge: &Arc<Bridge>,
        source: &Arc<UserLogin>,
        event: RemoteReactionRemove,
    ) {
        let target = match &event.target_part {
            Some(part) => bridge.db.get_reaction(
                &event.target,
                part,
                &event.sender.sender,
                &event.emoji_id,
            ),
            None => bridge.db.get_reaction_without_part(
                &event.target,
                &event.sender.sender,
                &event.emoji_id,
            ),
        };
        let target = match target {
            Ok(Some(target)) => target,
            Ok(None) => {
                warn!(target = %event.target, "Target reaction not found");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to get target reaction for removal");
                return;
            }
        };
        let Some(intent) = self.intent_for(bridge, &event.sender, source).await else {
            return;
        };
        let Some(room_id) = self.room_id() else {
            return;
        };
        let ts = event.timestamp.unwrap_or_else(Utc::now);
        let result = intent
            .send_message(
                &room_id,
                OutgoingContent::Redaction(RedactionContent {
                    redacts: target.event_id.clone(),
                    reason: None,
                }),
                ts,
            )
            .await;
        if let Err(e) = result {
            error!(reaction_event_id = %target.event_id, error = %e, "Failed to redact reaction");
        }
        if let Err(e) = bridge.db.delete_reaction(&target) {
            error!(error = %e, "Failed to delete target reaction from database");
        }
    }

    async fn handle_remote_message_remove(
        &self,
        bridge: &Arc<Bridge>,
        source: &Arc<UserLogin>,
        event: RemoteMessageRemove,
    ) {
        let parts = match bridge.db.get_all_parts_by_id(&event.target) {
            Ok(parts) => parts,
            Err(e) => {
                error!(error = %e, "Failed to get target message for removal");
                return;
            }
        };
        let Some(intent) = self.intent_for(bridge, &event.sender, source).await else {
            return;
        };
        let Some(room_id) = self.room_id() else {
            return;
        };
        let ts = event.timestamp.unwrap_or_else(Utc::now);
        for part in &parts {
            let result = intent
                .send_message(
                    &room_id,
                    OutgoingContent::Redaction(RedactionContent {
                        redacts: part.event_id.clone(),
                        reason: None,
                    }),
                    ts,
                )
                .await;
            match result {
                Ok(sent) => {
                    debug!(
                        redaction_event_id = %sent.event_id,
                        redacted_event_id = %part.event_id,
                        part_id = %part.part_id,
                        "Sent redaction of message part to room"
                    );
                }
                Err(e) => {
                    error!(part_event_id = %part.event_id, error = %e, "Failed to redact message part");
                }
            }
        }
        if let Err(e) = bridge.db.delete_all_parts(&event.target) {
            error!(error = %e, "Failed to delete target message from database");
        }
    }

    // -----------------------------------------------------------------------
    // Receipts, typing, and account-data events
    // -----------------------------------------------------------------------

    async fn handle_remote_read_receipt(
        &self,
        bridge: &Arc<Bridge>,
        source: &Arc<UserLogin>,
        event: RemoteReceipt,
    ) {
        let mut last_target: Option<Message> = None;
        if let Some(last_id) = &event.last_target {
            match bridge.db.get_last_part_by_id(last_id) {
                Ok(Some(message)) => last_target = Some(message),
                Ok(None) => {
                    debug!(last_target_id = %last_id, "Last target message not found");
                }
                Err(e) => {
                    error!(last_target_id = %last_id, error = %e, "Failed to get last target message for read receipt");
                    return;
                }
            }
        }
        if last_target.is_none() {
            for target_id in &event.targets {
                match bridge.db.get_last_part_by_id(target_id) {
                    Ok(Some(message)) => {
                        let newer = last_target
                            .as_ref()
                            .map(|last| message.timestamp > last.timestamp)
                            .unwrap_or(true);
                        if newer {
                            last_target = Some(message);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(target_id = %target_id, error = %e, "Failed to get target message for read receipt");
                        return;
                    }
                }
            }
        }
        let Some(last_target) = last_target else {
            warn!("No target message found for read receipt");
            return;
        };
        let Some(intent) = self.intent_for(bridge, &event.sender, source).await else {
            return;
        };
        let Some(room_id) = self.room_id() else {
            return;
        };
        let ts = event.timestamp.unwrap_or_else(Utc::now);
        match intent.mark_read(&room_id, &last_target.event_id, ts).await {
            Ok(()) => {
                debug!(target_event_id = %last_target.event_id, "Bridged read receipt");
            }
            Err(e) => {
                error!(target_event_id = %last_target.event_id, error = %e, "Failed to bridge read receipt");
            }
        }
        if event.sender.is_from_me {
            bridge.disappear.start_all(&room_id).await;
        }
    }

    async fn handle_remote_typing(
        &self,
        bridge: &Arc<Bridge>,
        source: &Arc<UserLogin>,
        event: RemoteTyping,
    ) {
        let Some(intent) = self.intent_for(bridge, &event.sender, source).await else {
            return;
        };
        let Some(room_id) = self.room_id() else {
            return;
        };
        if let Err(e) = intent.mark_typing(&room_id, event.kind, event.timeout).await {
            error!(error = %e, "Failed to bridge typing event");
        }
    }

    async fn handle_remote_mark_unread(
        &self,
        bridge: &Arc<Bridge>,
        source: &Arc<UserLogin>,
        event: RemoteMarkUnread,
    ) {
        let Some(dp) = self.double_puppet_for_self_event(bridge, source, &event.sender, "mark unread")
        else {
            return;
        };
        let Some(room_id) = self.room_id() else {
            return;
        };
        if let Err(e) = dp.mark_unread(&room_id, event.unread).await {
            error!(error = %e, "Failed to bridge mark unread event");
        }
    }

    async fn handle_remote_chat_tag(
        &self,
        bridge: &Arc<Bridge>,
        source: &Arc<UserLogin>,
        event: RemoteChatTag,
    ) {
        let Some(dp) = self.double_puppet_for_self_event(bridge, source, &event.sender, "chat tag")
        else {
            return;
        };
        let Some(room_id) = self.room_id() else {
            return;
        };
        let tag = event
            .tag
            .clone()
            .unwrap_or(passerelle_shared::ids::RoomTag(String::new()));
        let result = dp.tag_room(&room_id, &tag, event.tag.is_some()).await;
        if let Err(e) = result {
            error!(error = %e, "Failed to bridge chat tag event");
        }
    }

    async fn handle_remote_chat_mute(
        &self,
        bridge: &Arc<Bridge>,
        source: &Arc<UserLogin>,
        event: RemoteChatMute,
    ) {
        let Some(dp) = self.double_puppet_for_self_event(bridge, source, &event.sender, "chat mute")
        else {
            return;
        };
        let Some(room_id) = self.room_id() else {
            return;
        };
        if let Err(e) = dp.mute_room(&room_id, event.muted_until).await {
            error!(error = %e, "Failed to bridge chat mute event");
        }
    }

    /// Account-data events only make sense from the user's own account, acted
    /// out by their double-puppet.
    fn double_puppet_for_self_event(
        &self,
        bridge: &Bridge,
        source: &Arc<UserLogin>,
        sender: &EventSender,
        kind: &str,
    ) -> Option<Arc<dyn Intent>> {
        if !sender.is_from_me {
            warn!(portal_id = %self.key, "Ignoring {kind} event from non-self user");
            return None;
        }
        bridge.user(&source.user_id).and_then(|u| u.double_puppet())
    }

    // -----------------------------------------------------------------------
    // Disappearing messages
    // -----------------------------------------------------------------------

    /// Schedule disappearance for a message with an explicit per-message
    /// setting from conversion.
    pub(crate) fn schedule_disappearance(
        &self,
        bridge: &Arc<Bridge>,
        room_id: &RoomId,
        event_id: &EventId,
        setting: &DisappearingSetting,
        ts: DateTime<Utc>,
    ) {
        let message = DisappearingMessage {
            room_id: room_id.clone(),
            event_id: event_id.clone(),
            kind: setting.kind,
            timer: setting.timer,
            disappear_at: resolve_disappear_at(setting, ts),
        };
        let sweeper = bridge.disappear.clone();
        tokio::spawn(async move {
            sweeper.add(message).await;
        });
    }

    /// Schedule disappearance for a room-side message using the portal's
    /// default timer, if one is set.
    pub(crate) fn schedule_portal_disappearance(&self, bridge: &Arc<Bridge>, message: &Message) {
        let Some(room_id) = self.room_id() else {
            return;
        };
        let setting = self.with_state(|state| state.disappear.clone());
        let Some(setting) = setting else {
            return;
        };
        self.schedule_disappearance(bridge, &room_id, &message.event_id, &setting, message.timestamp);
    }
}
