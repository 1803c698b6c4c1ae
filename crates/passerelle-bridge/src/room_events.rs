//! Translation of room-side events into network-side calls.
//!
//! Every non-ephemeral event ends in exactly one message status: success or
//! an error kind from the status module. Mapping rows are only written after
//! the remote operation succeeded, so an aborted handler never leaves a
//! half-written row behind.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, warn};

use passerelle_shared::capabilities::RoomCapabilities;
use passerelle_shared::event::{
    MessageContent, MessageKind, OutgoingContent, ReactionContent, ReadReceipt, RedactionContent,
    RoomEvent, RoomEventContent, TypingKind,
};
use passerelle_shared::ids::{EventId, RoomUserId};
use passerelle_shared::status::BridgeError;
use passerelle_store::{Message, Reaction, UserPortal};

use crate::api::{
    NetworkApi, RoomEdit, RoomMessage, RoomMessageRemove, RoomReaction, RoomReactionRemove,
    RoomReadReceipt, RoomTyping,
};
use crate::bridge::Bridge;
use crate::portal::{Portal, PreferredLogin, TypingState};
use crate::users::{OrigSender, User, UserLogin};

impl Portal {
    pub(crate) async fn handle_room_event(
        &self,
        bridge: &Arc<Bridge>,
        sender: Arc<User>,
        event: RoomEvent,
    ) {
        match &event.content {
            RoomEventContent::Receipt(receipts) => {
                for receipt in receipts.clone() {
                    let Some(user) = bridge.user(&receipt.user_id) else {
                        debug!(user_id = %receipt.user_id, "Ignoring read receipt from unknown user");
                        continue;
                    };
                    self.handle_room_read_receipt(bridge, user, receipt).await;
                }
                return;
            }
            RoomEventContent::Typing(content) => {
                self.handle_room_typing(bridge, content.user_ids.clone())
                    .await;
                return;
            }
            _ => {}
        }

        let login = match self.find_preferred_login(bridge, &sender, true) {
            Ok(login) => login,
            Err(err) => {
                error!(
                    event_id = %event.id,
                    sender = %sender.user_id,
                    error = %err,
                    "Failed to get user login to handle room event"
                );
                self.send_error_status(bridge, &event, &err).await;
                return;
            }
        };
        let (login, orig_sender) = match login {
            PreferredLogin::Login { login, .. } => (login, None),
            PreferredLogin::Relay => {
                let Some(relay) = self.relay() else {
                    self.send_error_status(bridge, &event, &BridgeError::NotLoggedIn)
                        .await;
                    return;
                };
                let member = match self.room_id() {
                    Some(room_id) => bridge
                        .matrix
                        .get_member_info(&room_id, &sender.user_id)
                        .await
                        .unwrap_or_else(|e| {
                            warn!(error = %e, "Failed to get member info for user being relayed");
                            None
                        }),
                    None => None,
                };
                (
                    relay,
                    Some(OrigSender {
                        user: sender.clone(),
                        member,
                    }),
                )
            }
        };

        match &event.content {
            RoomEventContent::Message(content) | RoomEventContent::Sticker(content) => {
                self.handle_room_message(bridge, &login, orig_sender.as_ref(), &event, content)
                    .await;
            }
            RoomEventContent::Reaction(content) => {
                if orig_sender.is_some() {
                    debug!(event_id = %event.id, "Ignoring reaction event from relayed user");
                    self.send_error_status(bridge, &event, &BridgeError::ReactionFromRelayedUser)
                        .await;
                    return;
                }
                self.handle_room_reaction(bridge, &login, &event, content)
                    .await;
            }
            RoomEventContent::Redaction(content) => {
                self.handle_room_redaction(bridge, &login, orig_sender.as_ref(), &event, content)
                    .await;
            }
            // Room metadata is owned by the remote side; local changes are
            // accepted without being bridged.
            RoomEventContent::RoomName
            | RoomEventContent::Topic
            | RoomEventContent::Avatar
            | RoomEventContent::Encryption => {}
            RoomEventContent::Receipt(_) | RoomEventContent::Typing(_) => {}
        }
    }

    // -----------------------------------------------------------------------
    // Messages and edits
    // -----------------------------------------------------------------------

    async fn handle_room_message(
        &self,
        bridge: &Arc<Bridge>,
        login: &Arc<UserLogin>,
        orig_sender: Option<&OrigSender>,
        event: &RoomEvent,
        content: &MessageContent,
    ) {
        let Some(client) = login.client() else {
            self.send_error_status(bridge, event, &BridgeError::NotLoggedIn)
                .await;
            return;
        };
        let caps = client.room_capabilities(self).await;

        if content.relates_to.replace_id().is_some() {
            self.handle_room_edit(bridge, &client, orig_sender, event, content, &caps)
                .await;
            return;
        }
        if let Err(err) = check_content_caps(&caps, content) {
            self.send_error_status(bridge, event, &err).await;
            return;
        }

        let mut thread_root = None;
        let mut reply_to = None;
        if caps.threads {
            if let Some(root_id) = content.relates_to.thread_parent() {
                match bridge.db.get_message_part_by_event_id(root_id) {
                    Ok(row) => thread_root = row,
                    Err(e) => {
                        error!(error = %e, "Failed to get thread root message from database")
                    }
                }
            }
        }
        if caps.replies {
            let reply_id = if caps.threads {
                content.relates_to.non_fallback_reply_target()
            } else {
                content.relates_to.reply_target()
            };
            if let Some(reply_id) = reply_id {
                match bridge.db.get_message_part_by_event_id(reply_id) {
                    Ok(row) => reply_to = row,
                    Err(e) => {
                        error!(error = %e, "Failed to get reply target message from database")
                    }
                }
            }
        }

        let seed = match client
            .handle_message(RoomMessage {
                event,
                content,
                portal: self,
                orig_sender,
                thread_root: thread_root.as_ref(),
                reply_to: reply_to.as_ref(),
            })
            .await
        {
            Ok(seed) => seed,
            Err(e) => {
                error!(event_id = %event.id, error = %e, "Failed to handle room message");
                let err: BridgeError = e.into();
                self.send_error_status(bridge, event, &err).await;
                return;
            }
        };

        let mut message = Message {
            row_id: 0,
            remote_id: seed.remote_id,
            part_id: seed.part_id,
            event_id: event.id.clone(),
            portal: self.key.clone(),
            sender_remote_id: seed.sender_remote_id,
            sender_room_id: event.sender.clone(),
            timestamp: seed.timestamp.unwrap_or(event.timestamp),
            relates_to: None,
            edit_count: 0,
            metadata: seed.metadata,
        };
        // The mapping row references the sender's ghost; make sure it exists.
        if let Err(e) = bridge.ghosts.ghost(&message.sender_remote_id).await {
            warn!(error = %e, "Failed to ensure ghost row for message sender");
        }
        if let Err(e) = bridge.db.insert_message(&mut message) {
            error!(error = %e, "Failed to save message to database");
        }
        self.schedule_portal_disappearance(bridge, &message);
        self.send_success_status(bridge, event).await;
    }

    async fn handle_room_edit(
        &self,
        bridge: &Arc<Bridge>,
        client: &Arc<dyn NetworkApi>,
        orig_sender: Option<&OrigSender>,
        event: &RoomEvent,
        content: &MessageContent,
        caps: &RoomCapabilities,
    ) {
        let Some(edit_target_id) = content.relates_to.replace_id().cloned() else {
            return;
        };
        let content = content.new_content.as_deref().unwrap_or(content);
        if !client.features().edits {
            debug!(event_id = %event.id, "Ignoring edit as the network connector doesn't support edits");
            self.send_error_status(bridge, event, &BridgeError::EditsNotSupported)
                .await;
            return;
        }
        if !caps.edits {
            debug!(event_id = %event.id, "Ignoring edit as the room doesn't support edits");
            self.send_error_status(bridge, event, &BridgeError::EditsNotSupportedInPortal)
                .await;
            return;
        }
        if let Err(err) = check_content_caps(caps, content) {
            self.send_error_status(bridge, event, &err).await;
            return;
        }
        let edit_target = match bridge.db.get_message_part_by_event_id(&edit_target_id) {
            Ok(Some(target)) => target,
            Ok(None) => {
                warn!(edit_target = %edit_target_id, "Edit target message not found in database");
                self.send_error_status(bridge, event, &BridgeError::TargetNotFound { action: "edit" })
                    .await;
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to get edit target message from database");
                self.send_error_status(
                    bridge,
                    event,
                    &BridgeError::database("getting edit target", e),
                )
                .await;
                return;
            }
        };
        if let Some(max_age) = caps.edit_max_age {
            let age = Utc::now().signed_duration_since(edit_target.timestamp);
            let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
            if age > max_age {
                self.send_error_status(bridge, event, &BridgeError::EditTargetTooOld)
                    .await;
                return;
            }
        }
        if let Some(max_count) = caps.edit_max_count {
            if edit_target.edit_count >= max_count {
                self.send_error_status(bridge, event, &BridgeError::EditTargetTooManyEdits)
                    .await;
                return;
            }
        }
        let result = match client
            .handle_edit(RoomEdit {
                event,
                content,
                portal: self,
                orig_sender,
                edit_target: &edit_target,
            })
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!(event_id = %event.id, error = %e, "Failed to handle room edit");
                let err: BridgeError = e.into();
                self.send_error_status(bridge, event, &err).await;
                return;
            }
        };
        let mut edit_target = edit_target;
        edit_target.edit_count += 1;
        if let Some(metadata) = result.metadata {
            edit_target.metadata = metadata;
        }
        if let Err(e) = bridge.db.update_message(&edit_target) {
            error!(error = %e, "Failed to save message to database after editing");
        }
        self.send_success_status(bridge, event).await;
    }

    // -----------------------------------------------------------------------
    // Reactions and redactions
    // -----------------------------------------------------------------------

    async fn handle_room_reaction(
        &self,
        bridge: &Arc<Bridge>,
        login: &Arc<UserLogin>,
        event: &RoomEvent,
        content: &ReactionContent,
    ) {
        let Some(client) = login.client() else {
            self.send_error_status(bridge, event, &BridgeError::NotLoggedIn)
                .await;
            return;
        };
        if !client.features().reactions {
            debug!(event_id = %event.id, "Ignoring reaction as the network connector doesn't support reactions");
            self.send_error_status(bridge, event, &BridgeError::ReactionsNotSupported)
                .await;
            return;
        }
        let target = match bridge.db.get_message_part_by_event_id(&content.relates_to) {
            Ok(Some(target)) => target,
            Ok(None) => {
                warn!(target = %content.relates_to, "Reaction target message not found in database");
                self.send_error_status(
                    bridge,
                    event,
                    &BridgeError::TargetNotFound { action: "reaction" },
                )
                .await;
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to get reaction target message from database");
                self.send_error_status(
                    bridge,
                    event,
                    &BridgeError::database("getting reaction target", e),
                )
                .await;
                return;
            }
        };
        let meta = match client
            .pre_handle_reaction(RoomReaction {
                event,
                emoji: &content.key,
                portal: self,
                target: &target,
                meta: None,
                existing_to_keep: &[],
            })
            .await
        {
            Ok(meta) => meta,
            Err(e) => {
                error!(event_id = %event.id, error = %e, "Failed to pre-handle room reaction");
                let err: BridgeError = e.into();
                self.send_error_status(bridge, event, &err).await;
                return;
            }
        };
        let existing = match bridge.db.get_reaction(
            &target.remote_id,
            &target.part_id,
            &meta.sender_id,
            &meta.emoji_id,
        ) {
            Ok(existing) => existing,
            Err(e) => {
                error!(error = %e, "Failed to check if reaction is a duplicate");
                return;
            }
        };
        if let Some(existing) = &existing {
            if !existing.emoji_id.is_empty() || existing.emoji.as_deref() == Some(meta.emoji.as_str())
            {
                debug!(event_id = %event.id, "Ignoring duplicate reaction");
                self.send_success_status(bridge, event).await;
                return;
            }
            self.redact_as_bot(bridge, &existing.event_id, "Failed to remove old reaction")
                .await;
        }
        let mut existing_to_keep: Vec<Reaction> = Vec::new();
        if meta.max_reactions > 0 {
            let all = match bridge
                .db
                .get_all_reactions_to_message_by_sender(&target.remote_id, &meta.sender_id)
            {
                Ok(all) => all,
                Err(e) => {
                    error!(error = %e, "Failed to get all reactions to message by sender");
                    self.send_error_status(
                        bridge,
                        event,
                        &BridgeError::database("getting previous reactions", e),
                    )
                    .await;
                    return;
                }
            };
            if all.len() < meta.max_reactions {
                existing_to_keep = all;
            } else {
                // Keep the oldest max-1 reactions; the incoming one fills the
                // last slot.
                let (keep, over_limit) = all.split_at(meta.max_reactions - 1);
                existing_to_keep = keep.to_vec();
                for old in over_limit {
                    self.redact_as_bot(
                        bridge,
                        &old.event_id,
                        "Failed to remove previous reaction over the limit",
                    )
                    .await;
                    if let Err(e) = bridge.db.delete_reaction(old) {
                        error!(error = %e, "Failed to delete previous reaction from database");
                    }
                }
            }
        }
        let seed = match client
            .handle_reaction(RoomReaction {
                event,
                emoji: &content.key,
                portal: self,
                target: &target,
                meta: Some(&meta),
                existing_to_keep: &existing_to_keep,
            })
            .await
        {
            Ok(seed) => seed,
            Err(e) => {
                error!(event_id = %event.id, error = %e, "Failed to handle room reaction");
                let err: BridgeError = e.into();
                self.send_error_status(bridge, event, &err).await;
                return;
            }
        };
        let emoji_id = seed.emoji_id.unwrap_or_else(|| meta.emoji_id.clone());
        let emoji = if emoji_id.is_empty() {
            seed.emoji.or(Some(meta.emoji.clone()))
        } else {
            seed.emoji
        };
        let reaction = Reaction {
            remote_message_id: target.remote_id.clone(),
            part_id: target.part_id.clone(),
            sender_remote_id: meta.sender_id.clone(),
            emoji_id,
            emoji,
            event_id: event.id.clone(),
            portal: self.key.clone(),
            timestamp: seed.timestamp.unwrap_or(event.timestamp),
            metadata: seed.metadata,
        };
        if let Err(e) = bridge.db.upsert_reaction(&reaction) {
            error!(error = %e, "Failed to save reaction to database");
        }
        self.send_success_status(bridge, event).await;
    }

    async fn handle_room_redaction(
        &self,
        bridge: &Arc<Bridge>,
        login: &Arc<UserLogin>,
        orig_sender: Option<&OrigSender>,
        event: &RoomEvent,
        content: &RedactionContent,
    ) {
        let Some(client) = login.client() else {
            self.send_error_status(bridge, event, &BridgeError::NotLoggedIn)
                .await;
            return;
        };
        let features = client.features();
        if !features.redactions && !features.reactions {
            debug!(
                event_id = %event.id,
                "Ignoring redaction without checking target as the network connector supports neither deletions nor reactions"
            );
            self.send_error_status(bridge, event, &BridgeError::RedactionsNotSupported)
                .await;
            return;
        }
        let target_message = match bridge.db.get_message_part_by_event_id(&content.redacts) {
            Ok(target) => target,
            Err(e) => {
                error!(error = %e, "Failed to get redaction target message from database");
                self.send_error_status(
                    bridge,
                    event,
                    &BridgeError::database("getting redaction target message", e),
                )
                .await;
                return;
            }
        };
        let result = if let Some(target) = target_message {
            if !features.redactions {
                debug!(event_id = %event.id, "Ignoring message redaction as the network connector doesn't support deletions");
                self.send_error_status(bridge, event, &BridgeError::RedactionsNotSupported)
                    .await;
                return;
            }
            client
                .handle_message_remove(RoomMessageRemove {
                    event,
                    portal: self,
                    orig_sender,
                    target: &target,
                })
                .await
        } else {
            let target_reaction = match bridge.db.get_reaction_by_event_id(&content.redacts) {
                Ok(target) => target,
                Err(e) => {
                    error!(error = %e, "Failed to get redaction target reaction from database");
                    self.send_error_status(
                        bridge,
                        event,
                        &BridgeError::database("getting redaction target reaction", e),
                    )
                    .await;
                    return;
                }
            };
            let Some(target) = target_reaction else {
                debug!(target = %content.redacts, "Redaction target not found in database");
                self.send_error_status(
                    bridge,
                    event,
                    &BridgeError::TargetNotFound { action: "redaction" },
                )
                .await;
                return;
            };
            if !features.reactions {
                debug!(event_id = %event.id, "Ignoring reaction redaction as the network connector doesn't support reactions");
                self.send_error_status(bridge, event, &BridgeError::ReactionsNotSupported)
                    .await;
                return;
            }
            client
                .handle_reaction_remove(RoomReactionRemove {
                    event,
                    portal: self,
                    orig_sender,
                    target: &target,
                })
                .await
        };
        if let Err(e) = result {
            error!(event_id = %event.id, error = %e, "Failed to handle room redaction");
            let err: BridgeError = e.into();
            self.send_error_status(bridge, event, &err).await;
            return;
        }
        // TODO delete the mapping row; currently it is only removed when the
        // network echoes the removal back as a remote event.
        self.send_success_status(bridge, event).await;
    }

    async fn redact_as_bot(&self, bridge: &Bridge, event_id: &EventId, log_msg: &str) {
        let Some(room_id) = self.room_id() else {
            return;
        };
        let content = OutgoingContent::Redaction(RedactionContent {
            redacts: event_id.clone(),
            reason: None,
        });
        if let Err(e) = bridge.bot.send_message(&room_id, content, Utc::now()).await {
            error!(target = %event_id, error = %e, "{log_msg}");
        }
    }

    // -----------------------------------------------------------------------
    // Read receipts
    // -----------------------------------------------------------------------

    async fn handle_room_read_receipt(
        &self,
        bridge: &Arc<Bridge>,
        user: Arc<User>,
        receipt: ReadReceipt,
    ) {
        let (login, user_portal) = match self.find_preferred_login(bridge, &user, false) {
            Ok(PreferredLogin::Login { login, user_portal }) => (login, user_portal),
            Ok(PreferredLogin::Relay) => return,
            Err(e) => {
                error!(user_id = %user.user_id, error = %e, "Failed to get preferred login for read receipt");
                return;
            }
        };
        let Some(client) = login.client() else {
            return;
        };
        if !client.features().read_receipts {
            return;
        }
        let mut user_portal = user_portal.unwrap_or_else(|| {
            UserPortal::new(user.user_id.clone(), login.id.clone(), self.key.clone())
        });
        let exact_message = match bridge.db.get_message_part_by_event_id(&receipt.event_id) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "Failed to get exact message from database");
                None
            }
        };
        let read_up_to = exact_message
            .as_ref()
            .map(|m| m.timestamp)
            .unwrap_or(receipt.timestamp);
        let result = client
            .handle_read_receipt(RoomReadReceipt {
                portal: self,
                event_id: &receipt.event_id,
                receipt_ts: receipt.timestamp,
                last_read: user_portal.last_read,
                exact_message: exact_message.as_ref(),
                read_up_to,
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "Failed to handle read receipt");
            return;
        }
        user_portal.last_read = Some(read_up_to);
        if let Err(e) = bridge.db.put_user_portal(&user_portal) {
            error!(error = %e, "Failed to save user portal metadata");
        }
        if let Some(room_id) = self.room_id() {
            bridge.disappear.start_all(&room_id).await;
        }
    }

    // -----------------------------------------------------------------------
    // Typing
    // -----------------------------------------------------------------------

    async fn handle_room_typing(&self, bridge: &Arc<Bridge>, mut user_ids: Vec<RoomUserId>) {
        let mut typing = self.typing.lock().await;
        user_ids.sort();
        let (stopped, started) = sorted_diff(&typing.currently_typing, &user_ids);
        self.send_typings(bridge, &mut typing, &stopped, false).await;
        self.send_typings(bridge, &mut typing, &started, true).await;
        typing.currently_typing = user_ids;
    }

    async fn send_typings(
        &self,
        bridge: &Arc<Bridge>,
        typing: &mut TypingState,
        user_ids: &[RoomUserId],
        is_typing: bool,
    ) {
        for user_id in user_ids {
            let login = match typing.logins.get(user_id) {
                Some(login) => login.clone(),
                None if !is_typing => continue,
                None => {
                    let Some(user) = bridge.user(user_id) else {
                        continue;
                    };
                    let login = match self.find_preferred_login(bridge, &user, false) {
                        Ok(PreferredLogin::Login { login, .. }) => login,
                        Ok(PreferredLogin::Relay) => continue,
                        Err(e) => {
                            error!(user_id = %user_id, error = %e, "Failed to get user login to send typing event");
                            continue;
                        }
                    };
                    let Some(client) = login.client() else {
                        continue;
                    };
                    if !client.features().typing {
                        continue;
                    }
                    typing.logins.insert(user_id.clone(), login.clone());
                    login
                }
            };
            if !is_typing {
                typing.logins.remove(user_id);
            }
            let Some(client) = login.client() else {
                continue;
            };
            if !client.features().typing {
                continue;
            }
            let result = client
                .handle_typing(RoomTyping {
                    portal: self,
                    is_typing,
                    kind: TypingKind::Text,
                })
                .await;
            if let Err(e) = result {
                error!(user_id = %user_id, error = %e, "Failed to bridge typing event");
            } else {
                debug!(user_id = %user_id, typing = is_typing, "Sent typing event");
            }
        }
    }

    /// One pass of the periodic refresher: re-signal typing for every user
    /// still in the typing set.
    pub(crate) async fn refresh_typing(&self) {
        let typing = self.typing.lock().await;
        if typing.currently_typing.is_empty() {
            return;
        }
        for user_id in &typing.currently_typing {
            let Some(login) = typing.logins.get(user_id) else {
                continue;
            };
            let Some(client) = login.client() else {
                continue;
            };
            if !client.features().typing {
                continue;
            }
            let result = client
                .handle_typing(RoomTyping {
                    portal: self,
                    is_typing: true,
                    kind: TypingKind::Text,
                })
                .await;
            if let Err(e) = result {
                error!(user_id = %user_id, error = %e, "Failed to repeat typing event");
            } else {
                debug!(user_id = %user_id, "Sent repeated typing event");
            }
        }
    }
}

/// Gate message content on per-room capabilities. Text-like messages are not
/// pre-checked; their length is validated during conversion.
fn check_content_caps(
    caps: &RoomCapabilities,
    content: &MessageContent,
) -> Result<(), BridgeError> {
    match content.msg_type {
        MessageKind::Text | MessageKind::Notice | MessageKind::Emote => Ok(()),
        MessageKind::Location => {
            if caps.location_messages {
                Ok(())
            } else {
                Err(BridgeError::LocationMessagesNotAllowed)
            }
        }
        MessageKind::Image | MessageKind::Audio | MessageKind::Video | MessageKind::File => {
            if content.has_caption() && !caps.captions {
                Err(BridgeError::CaptionsNotAllowed)
            } else {
                Ok(())
            }
        }
    }
}

/// Diff two sorted user lists into (removed, added).
fn sorted_diff(old: &[RoomUserId], new: &[RoomUserId]) -> (Vec<RoomUserId>, Vec<RoomUserId>) {
    let mut removed = Vec::new();
    let mut added = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        match old[i].cmp(&new[j]) {
            std::cmp::Ordering::Less => {
                removed.push(old[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                added.push(new[j].clone());
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    removed.extend_from_slice(&old[i..]);
    added.extend_from_slice(&new[j..]);
    (removed, added)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ids: &[&str]) -> Vec<RoomUserId> {
        ids.iter().map(|id| RoomUserId(id.to_string())).collect()
    }

    #[test]
    fn typing_diff() {
        let old = ids(&["@a:s", "@b:s"]);
        let new = ids(&["@b:s", "@c:s"]);
        let (removed, added) = sorted_diff(&old, &new);
        assert_eq!(removed, ids(&["@a:s"]));
        assert_eq!(added, ids(&["@c:s"]));
    }

    #[test]
    fn typing_diff_empty_sides() {
        let (removed, added) = sorted_diff(&[], &ids(&["@a:s"]));
        assert!(removed.is_empty());
        assert_eq!(added, ids(&["@a:s"]));

        let (removed, added) = sorted_diff(&ids(&["@a:s"]), &[]);
        assert_eq!(removed, ids(&["@a:s"]));
        assert!(added.is_empty());
    }

    #[test]
    fn caption_gating() {
        let caps = RoomCapabilities::default();
        let mut content = MessageContent::text("a caption");
        content.msg_type = MessageKind::Image;
        content.filename = Some("img.png".to_string());
        assert!(matches!(
            check_content_caps(&caps, &content),
            Err(BridgeError::CaptionsNotAllowed)
        ));

        let caps = RoomCapabilities {
            captions: true,
            ..Default::default()
        };
        assert!(check_content_caps(&caps, &content).is_ok());
    }

    #[test]
    fn text_is_never_pre_checked() {
        let caps = RoomCapabilities::default();
        let content = MessageContent::text("hi");
        assert!(check_content_caps(&caps, &content).is_ok());
    }
}
