//! Network-side event handling: deduplication, portal creation, parts,
//! edits, removals, and double-puppet-only events.

mod support;

use passerelle_bridge::remote::{
    EventSender, RemoteEvent, RemoteMarkUnread, RemoteMessage, RemoteMessageRemove, RemoteReaction,
    RemoteTyping,
};
use passerelle_bridge::api::Intent;
use passerelle_shared::event::{OutgoingContent, StateEventContent, TypingKind};
use passerelle_shared::ids::{EmojiId, PortalKey, RemoteMessageId, RemoteUserId};
use serde_json::{json, Value};

use support::*;

fn remote_text(id: &str, sender: EventSender, body: &str) -> RemoteEvent {
    RemoteEvent::Message(RemoteMessage {
        id: RemoteMessageId(id.to_string()),
        sender,
        timestamp: Some(ts()),
        create_portal: true,
        payload: json!(body),
    })
}

#[tokio::test]
async fn duplicate_remote_message_is_bridged_once() {
    let tb = TestBridge::new();
    let key = PortalKey::shared(CHAT);
    let (_user, login, _network) = tb.add_user_with_login("@alice:example.org", "login-a", &key);
    let portal = tb.portal_with_room(&key, ROOM);

    let event = remote_text("m1", EventSender::new("remote-bob"), "hello");
    portal.queue_remote_event(login.clone(), event.clone()).await;
    portal.queue_remote_event(login.clone(), event).await;

    wait_for(|| {
        tb.ghosts
            .ghost_intent("remote-bob")
            .map(|intent| !intent.sent_messages().is_empty())
            .unwrap_or(false)
    })
    .await;
    settle().await;

    let ghost = tb.ghosts.ghost_intent("remote-bob").unwrap();
    assert_eq!(ghost.sent_messages().len(), 1);
    let parts = tb
        .bridge
        .db
        .get_all_parts_by_id(&RemoteMessageId("m1".into()))
        .unwrap();
    assert_eq!(parts.len(), 1);
}

#[tokio::test]
async fn portal_creation_is_gated_by_event_kind() {
    let tb = TestBridge::new();
    let key = PortalKey::shared("chat-new");
    let (_user, login, network) = tb.add_user_with_login("@alice:example.org", "login-a", &key);
    {
        let mut info = network.chat_info.lock();
        info.name = Some("Remote Chat".to_string());
        info.members = Some(vec![RemoteUserId("remote-bob".into())]);
    }
    let portal = tb.portal_without_room(&key);

    // Typing cannot create a portal: nothing happens.
    portal
        .queue_remote_event(
            login.clone(),
            RemoteEvent::Typing(RemoteTyping {
                sender: EventSender::new("remote-bob"),
                timeout: std::time::Duration::from_secs(5),
                kind: TypingKind::Text,
            }),
        )
        .await;
    settle().await;
    assert!(portal.room_id().is_none());
    assert!(tb.matrix.create_requests.lock().is_empty());

    // A message asking for portal creation materializes the room first.
    portal
        .queue_remote_event(
            login.clone(),
            remote_text("m1", EventSender::new("remote-bob"), "hi there"),
        )
        .await;
    wait_for(|| portal.room_id().is_some()).await;

    let requests = tb.matrix.create_requests.lock();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.name, "Remote Chat");
    assert_eq!(request.preset, "private_chat");
    assert_eq!(request.visibility, "private");
    let mut has_functional = false;
    let mut bridge_infos = 0;
    for state in &request.initial_state {
        match &state.content {
            StateEventContent::FunctionalMembers { members } => {
                has_functional = true;
                assert!(members.contains(&tb.bot.user_id()));
            }
            StateEventContent::BridgeInfo(_) | StateEventContent::LegacyBridgeInfo(_) => {
                bridge_infos += 1;
            }
            _ => {}
        }
    }
    assert!(has_functional);
    assert_eq!(bridge_infos, 2);
    assert!(!request.initial_members.is_empty());
    drop(requests);

    // The room is indexed and the message got bridged into it.
    let room_id = portal.room_id().unwrap();
    let by_room = tb
        .bridge
        .get_portal_by_room_id(&room_id)
        .unwrap()
        .expect("portal by room id");
    assert_eq!(by_room.key, key);
    wait_for(|| {
        tb.bridge
            .db
            .get_first_part_by_id(&RemoteMessageId("m1".into()))
            .unwrap()
            .is_some()
    })
    .await;
}

#[tokio::test]
async fn multi_part_message_shares_sender_and_portal() {
    let tb = TestBridge::new();
    let key = PortalKey::shared(CHAT);
    let (_user, login, _network) = tb.add_user_with_login("@alice:example.org", "login-a", &key);
    let portal = tb.portal_with_room(&key, ROOM);

    portal
        .queue_remote_event(
            login.clone(),
            RemoteEvent::Message(RemoteMessage {
                id: RemoteMessageId("m1".into()),
                sender: EventSender::new("remote-bob"),
                timestamp: Some(ts()),
                create_portal: false,
                payload: json!(["first", "second"]),
            }),
        )
        .await;
    wait_for(|| {
        tb.bridge
            .db
            .get_all_parts_by_id(&RemoteMessageId("m1".into()))
            .unwrap()
            .len()
            == 2
    })
    .await;

    let parts = tb
        .bridge
        .db
        .get_all_parts_by_id(&RemoteMessageId("m1".into()))
        .unwrap();
    assert_eq!(parts[0].sender_remote_id, parts[1].sender_remote_id);
    assert_eq!(parts[0].portal, parts[1].portal);
    assert_ne!(parts[0].event_id, parts[1].event_id);
    assert_ne!(parts[0].part_id, parts[1].part_id);
}

#[tokio::test]
async fn remote_edit_replaces_parts() {
    let tb = TestBridge::new();
    let key = PortalKey::shared(CHAT);
    let (_user, login, _network) = tb.add_user_with_login("@alice:example.org", "login-a", &key);
    let portal = tb.portal_with_room(&key, ROOM);

    portal
        .queue_remote_event(
            login.clone(),
            remote_text("m1", EventSender::new("remote-bob"), "original"),
        )
        .await;
    wait_for(|| {
        tb.bridge
            .db
            .get_first_part_by_id(&RemoteMessageId("m1".into()))
            .unwrap()
            .is_some()
    })
    .await;

    portal
        .queue_remote_event(
            login.clone(),
            RemoteEvent::Edit(passerelle_bridge::remote::RemoteEdit {
                target: RemoteMessageId("m1".into()),
                sender: EventSender::new("remote-bob"),
                timestamp: Some(ts()),
                payload: json!("corrected"),
            }),
        )
        .await;

    let ghost = tb.ghosts.ghost_intent("remote-bob").unwrap();
    wait_for(|| ghost.sent_messages().len() == 2).await;

    let sends = ghost.sent_messages();
    let OutgoingContent::Message(edit) = &sends[1] else {
        panic!("expected message send, got {:?}", sends[1]);
    };
    let original = tb
        .bridge
        .db
        .get_first_part_by_id(&RemoteMessageId("m1".into()))
        .unwrap()
        .unwrap();
    assert_eq!(
        edit.content.relates_to.replaces,
        Some(original.event_id.clone())
    );
    let new_content = edit.content.new_content.as_ref().expect("replacement");
    assert_eq!(new_content.body, "corrected");
}

#[tokio::test]
async fn remote_message_remove_redacts_every_part() {
    let tb = TestBridge::new();
    let key = PortalKey::shared(CHAT);
    let (_user, login, _network) = tb.add_user_with_login("@alice:example.org", "login-a", &key);
    let portal = tb.portal_with_room(&key, ROOM);

    portal
        .queue_remote_event(
            login.clone(),
            RemoteEvent::Message(RemoteMessage {
                id: RemoteMessageId("m1".into()),
                sender: EventSender::new("remote-bob"),
                timestamp: Some(ts()),
                create_portal: false,
                payload: json!(["first", "second"]),
            }),
        )
        .await;
    wait_for(|| {
        tb.bridge
            .db
            .get_all_parts_by_id(&RemoteMessageId("m1".into()))
            .unwrap()
            .len()
            == 2
    })
    .await;

    portal
        .queue_remote_event(
            login.clone(),
            RemoteEvent::MessageRemove(RemoteMessageRemove {
                target: RemoteMessageId("m1".into()),
                sender: EventSender::new("remote-bob"),
                timestamp: Some(ts()),
            }),
        )
        .await;

    let ghost = tb.ghosts.ghost_intent("remote-bob").unwrap();
    wait_for(|| {
        ghost
            .sent_messages()
            .iter()
            .filter(|c| matches!(c, OutgoingContent::Redaction(_)))
            .count()
            == 2
    })
    .await;
    wait_for(|| {
        tb.bridge
            .db
            .get_all_parts_by_id(&RemoteMessageId("m1".into()))
            .unwrap()
            .is_empty()
    })
    .await;
}

#[tokio::test]
async fn duplicate_remote_reaction_is_ignored() {
    let tb = TestBridge::new();
    let key = PortalKey::shared(CHAT);
    let (_user, login, _network) = tb.add_user_with_login("@alice:example.org", "login-a", &key);
    let portal = tb.portal_with_room(&key, ROOM);

    portal
        .queue_remote_event(
            login.clone(),
            remote_text("m1", EventSender::new("remote-bob"), "hello"),
        )
        .await;
    wait_for(|| {
        tb.bridge
            .db
            .get_first_part_by_id(&RemoteMessageId("m1".into()))
            .unwrap()
            .is_some()
    })
    .await;

    let reaction = RemoteEvent::Reaction(RemoteReaction {
        target: RemoteMessageId("m1".into()),
        target_part: None,
        sender: EventSender::new("remote-carol"),
        timestamp: Some(ts()),
        emoji: "👍".into(),
        emoji_id: EmojiId("thumbs".into()),
        metadata: Value::Null,
    });
    portal.queue_remote_event(login.clone(), reaction.clone()).await;
    portal.queue_remote_event(login.clone(), reaction).await;

    wait_for(|| tb.ghosts.ghost_intent("remote-carol").is_some()).await;
    let carol = tb.ghosts.ghost_intent("remote-carol").unwrap();
    wait_for(|| !carol.sent_messages().is_empty()).await;
    settle().await;

    assert_eq!(carol.sent_messages().len(), 1);
    let stored = tb
        .bridge
        .db
        .get_reaction_without_part(
            &RemoteMessageId("m1".into()),
            &RemoteUserId("remote-carol".into()),
            &EmojiId("thumbs".into()),
        )
        .unwrap();
    assert!(stored.is_some());
}

#[tokio::test]
async fn mark_unread_requires_self_sender_and_double_puppet() {
    let tb = TestBridge::new();
    let key = PortalKey::shared(CHAT);
    let (user, login, _network) = tb.add_user_with_login("@alice:example.org", "login-a", &key);
    let dp = MockIntent::new("@alice:example.org");
    user.set_double_puppet(Some(dp.clone()));
    let portal = tb.portal_with_room(&key, ROOM);

    // Not from the user's own account: dropped.
    portal
        .queue_remote_event(
            login.clone(),
            RemoteEvent::MarkUnread(RemoteMarkUnread {
                sender: EventSender::new("remote-bob"),
                unread: true,
            }),
        )
        .await;
    settle().await;
    assert!(dp.calls.lock().is_empty());

    portal
        .queue_remote_event(
            login.clone(),
            RemoteEvent::MarkUnread(RemoteMarkUnread {
                sender: EventSender::from_me("remote-self"),
                unread: true,
            }),
        )
        .await;
    wait_for(|| !dp.calls.lock().is_empty()).await;
    assert!(matches!(
        dp.calls.lock()[0],
        IntentCall::MarkUnread(_, true)
    ));
}

#[tokio::test]
async fn self_message_uses_double_puppet_intent() {
    let tb = TestBridge::new();
    let key = PortalKey::shared(CHAT);
    let (user, login, _network) = tb.add_user_with_login("@alice:example.org", "login-a", &key);
    let dp = MockIntent::new("@alice:example.org");
    user.set_double_puppet(Some(dp.clone()));
    let portal = tb.portal_with_room(&key, ROOM);

    portal
        .queue_remote_event(
            login.clone(),
            remote_text("m1", EventSender::from_me("remote-self"), "from my phone"),
        )
        .await;
    wait_for(|| !dp.sent_messages().is_empty()).await;

    // No ghost was created for the sender.
    assert!(tb.ghosts.ghost_intent("remote-self").is_none());
    let row = tb
        .bridge
        .db
        .get_first_part_by_id(&RemoteMessageId("m1".into()))
        .unwrap()
        .unwrap();
    assert_eq!(row.sender_room_id, user.user_id);
}
