//! The portal: one bridged conversation.
//!
//! Every event touching a conversation, from either side, goes through the
//! portal's bounded queue and is handled by a single consumer task. That
//! task is the only place portal state and mapping rows are mutated, which
//! is what keeps the bidirectional mapping consistent without per-row
//! locking.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use passerelle_shared::event::{DisappearingSetting, RoomEvent};
use passerelle_shared::ids::{FileUrl, PortalKey, RoomId, RoomUserId};
use passerelle_shared::status::{BridgeError, MessageStatus, StatusTarget};
use passerelle_store::{PortalRow, UserPortal};

use crate::bridge::Bridge;
use crate::config::{BridgeConfig, OverflowPolicy};
use crate::remote::RemoteEvent;
use crate::users::{User, UserLogin};

/// An event queued for a portal's consumer task.
pub(crate) enum PortalEvent {
    Room {
        sender: Arc<User>,
        event: RoomEvent,
    },
    Remote {
        source: Arc<UserLogin>,
        event: RemoteEvent,
    },
}

/// Mutable portal attributes, mirrored to the `portals` table on save.
#[derive(Debug, Clone)]
pub struct PortalState {
    pub room_id: Option<RoomId>,
    pub name: String,
    pub topic: String,
    pub avatar_id: String,
    pub avatar_url: Option<FileUrl>,
    pub avatar_hash: Option<[u8; 32]>,
    /// True only while the room side reflects the stored value.
    pub name_set: bool,
    pub topic_set: bool,
    pub avatar_set: bool,
    pub is_direct: bool,
    pub is_space: bool,
    pub disappear: Option<DisappearingSetting>,
}

/// Typing users and the logins used to signal for them.
#[derive(Default)]
pub(crate) struct TypingState {
    /// Sorted list of currently typing room-side users.
    pub(crate) currently_typing: Vec<RoomUserId>,
    pub(crate) logins: HashMap<RoomUserId, Arc<UserLogin>>,
}

/// One bridged conversation.
pub struct Portal {
    pub key: PortalKey,
    /// Parent portal for space hierarchies. Parents are resolved before
    /// their children, so this chain cannot form a cycle.
    pub parent: Option<Arc<Portal>>,
    bridge: Weak<Bridge>,
    state: RwLock<PortalState>,
    relay: RwLock<Option<Arc<UserLogin>>>,
    events_tx: mpsc::Sender<PortalEvent>,
    overflow: OverflowPolicy,
    pub(crate) typing: tokio::sync::Mutex<TypingState>,
    pub(crate) room_create_lock: tokio::sync::Mutex<()>,
}

impl Portal {
    pub(crate) fn from_row(
        row: PortalRow,
        parent: Option<Arc<Portal>>,
        relay: Option<Arc<UserLogin>>,
        bridge: Weak<Bridge>,
        config: &BridgeConfig,
    ) -> (Arc<Self>, mpsc::Receiver<PortalEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.queue_capacity);
        let portal = Arc::new(Self {
            key: row.key,
            parent,
            bridge,
            state: RwLock::new(PortalState {
                room_id: row.room_id,
                name: row.name,
                topic: row.topic,
                avatar_id: row.avatar_id,
                avatar_url: row.avatar_url,
                avatar_hash: row.avatar_hash,
                name_set: row.name_set,
                topic_set: row.topic_set,
                avatar_set: row.avatar_set,
                is_direct: row.is_direct,
                is_space: row.is_space,
                disappear: row.disappear,
            }),
            relay: RwLock::new(relay),
            events_tx,
            overflow: config.overflow,
            typing: tokio::sync::Mutex::new(TypingState::default()),
            room_create_lock: tokio::sync::Mutex::new(()),
        });
        (portal, events_rx)
    }

    /// Spawn the consumer task and the typing refresher for a freshly loaded
    /// portal. Both tasks hold weak references and exit once the portal is
    /// gone.
    pub(crate) fn start(portal: &Arc<Self>, events_rx: mpsc::Receiver<PortalEvent>) {
        let weak = Arc::downgrade(portal);
        tokio::spawn(event_loop(weak.clone(), events_rx));
        tokio::spawn(periodic_typing_refresh(weak));
    }

    // -----------------------------------------------------------------------
    // State access
    // -----------------------------------------------------------------------

    pub fn room_id(&self) -> Option<RoomId> {
        self.state.read().room_id.clone()
    }

    pub fn state(&self) -> PortalState {
        self.state.read().clone()
    }

    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&PortalState) -> T) -> T {
        f(&self.state.read())
    }

    pub(crate) fn with_state_mut<T>(&self, f: impl FnOnce(&mut PortalState) -> T) -> T {
        f(&mut self.state.write())
    }

    pub fn relay(&self) -> Option<Arc<UserLogin>> {
        self.relay.read().clone()
    }

    pub fn set_relay(&self, relay: Option<Arc<UserLogin>>) {
        *self.relay.write() = relay;
    }

    pub(crate) fn bridge(&self) -> Option<Arc<Bridge>> {
        self.bridge.upgrade()
    }

    /// The outermost parent of this portal, if it has one.
    pub fn top_level_parent(&self) -> Option<Arc<Portal>> {
        let mut current = self.parent.clone()?;
        while let Some(next) = current.parent.clone() {
            current = next;
        }
        Some(current)
    }

    /// Serialize the portal back into its storage row.
    pub(crate) fn to_row(&self) -> PortalRow {
        let state = self.state.read();
        PortalRow {
            key: self.key.clone(),
            room_id: state.room_id.clone(),
            parent_id: self.parent.as_ref().map(|p| p.key.id.clone()),
            name: state.name.clone(),
            topic: state.topic.clone(),
            avatar_id: state.avatar_id.clone(),
            avatar_url: state.avatar_url.clone(),
            avatar_hash: state.avatar_hash,
            name_set: state.name_set,
            topic_set: state.topic_set,
            avatar_set: state.avatar_set,
            is_direct: state.is_direct,
            is_space: state.is_space,
            disappear: state.disappear.clone(),
            relay_login_id: self.relay.read().as_ref().map(|l| l.id.clone()),
        }
    }

    pub fn save(&self, bridge: &Bridge) -> passerelle_store::Result<()> {
        bridge.db.update_portal(&self.to_row())
    }

    /// Delete the portal's storage row and drop it from the registry. Child
    /// portals are left alone.
    pub fn delete(&self, bridge: &Bridge) -> passerelle_store::Result<()> {
        bridge.db.delete_portal(&self.key)?;
        bridge.remove_portal_from_cache(self);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Event queue
    // -----------------------------------------------------------------------

    pub async fn queue_room_event(&self, sender: Arc<User>, event: RoomEvent) {
        self.queue_event(PortalEvent::Room { sender, event }).await;
    }

    pub async fn queue_remote_event(&self, source: Arc<UserLogin>, event: RemoteEvent) {
        self.queue_event(PortalEvent::Remote { source, event })
            .await;
    }

    async fn queue_event(&self, event: PortalEvent) {
        match self.overflow {
            OverflowPolicy::Drop => match self.events_tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    error!(portal_id = %self.key, "Portal event queue is full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    error!(portal_id = %self.key, "Portal event queue is closed");
                }
            },
            OverflowPolicy::Block => {
                if self.events_tx.send(event).await.is_err() {
                    error!(portal_id = %self.key, "Portal event queue is closed");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Login resolution
    // -----------------------------------------------------------------------

    /// Pick the login used to bridge an event from `user`.
    ///
    /// User-portal rows are walked in order and the first login with a
    /// connected client wins. Without one, relaying is offered when allowed
    /// and configured; as a last resort any login of the user is returned
    /// with a warning.
    pub fn find_preferred_login(
        &self,
        bridge: &Bridge,
        user: &User,
        allow_relay: bool,
    ) -> Result<PreferredLogin, BridgeError> {
        let rows = bridge
            .db
            .get_user_portals_by_user(&user.user_id, &self.key)
            .map_err(|e| BridgeError::database("getting user portal rows", e))?;
        for row in rows {
            if let Some(login) = user.login(&row.login_id) {
                if login.client().is_some() {
                    return Ok(PreferredLogin::Login {
                        login,
                        user_portal: Some(row),
                    });
                }
            }
        }
        if !allow_relay {
            return Err(BridgeError::NotLoggedIn);
        }
        if self.relay().is_some() {
            return Ok(PreferredLogin::Relay);
        }
        match user.logins().into_iter().next() {
            Some(login) => {
                warn!(
                    portal_id = %self.key,
                    chosen_login_id = %login.id,
                    "No usable user portal rows found, returning random login"
                );
                Ok(PreferredLogin::Login {
                    login,
                    user_portal: None,
                })
            }
            None => Err(BridgeError::NotLoggedIn),
        }
    }

    // -----------------------------------------------------------------------
    // Status reporting
    // -----------------------------------------------------------------------

    pub(crate) async fn send_success_status(&self, bridge: &Bridge, event: &RoomEvent) {
        bridge
            .matrix
            .send_message_status(&status_target(event), &MessageStatus::success())
            .await;
    }

    pub(crate) async fn send_error_status(
        &self,
        bridge: &Bridge,
        event: &RoomEvent,
        err: &BridgeError,
    ) {
        bridge
            .matrix
            .send_message_status(&status_target(event), &MessageStatus::from_error(err))
            .await;
    }
}

/// The login chosen for a room-side event.
pub enum PreferredLogin {
    Login {
        login: Arc<UserLogin>,
        user_portal: Option<UserPortal>,
    },
    /// No login of the user is connected; the caller must substitute the
    /// portal's relay and wrap the original sender.
    Relay,
}

pub(crate) fn status_target(event: &RoomEvent) -> StatusTarget {
    StatusTarget {
        event_id: event.id.clone(),
        room_id: event.room_id.clone(),
    }
}

// ---------------------------------------------------------------------------
// Consumer task
// ---------------------------------------------------------------------------

async fn event_loop(portal: Weak<Portal>, mut events_rx: mpsc::Receiver<PortalEvent>) {
    while let Some(event) = events_rx.recv().await {
        let Some(portal) = portal.upgrade() else {
            break;
        };
        let Some(bridge) = portal.bridge() else {
            break;
        };
        handle_portal_event(&portal, &bridge, event).await;
    }
    debug!("Portal event loop terminated");
}

async fn handle_portal_event(portal: &Arc<Portal>, bridge: &Arc<Bridge>, event: PortalEvent) {
    let timeout = bridge.config.event_timeout;
    match event {
        PortalEvent::Room { sender, event } => {
            let status_target =
                (!event.content.is_ephemeral()).then(|| status_target(&event));
            let handled = portal.handle_room_event(bridge, sender, event);
            match timeout {
                None => handled.await,
                Some(limit) => {
                    if tokio::time::timeout(limit, handled).await.is_err() {
                        error!(portal_id = %portal.key, "Room event handler deadline exceeded");
                        if let Some(target) = status_target {
                            bridge
                                .matrix
                                .send_message_status(
                                    &target,
                                    &MessageStatus::from_error(&BridgeError::Timeout),
                                )
                                .await;
                        }
                    }
                }
            }
        }
        PortalEvent::Remote { source, event } => {
            let handled = portal.handle_remote_event(bridge, source, event);
            match timeout {
                None => handled.await,
                Some(limit) => {
                    if tokio::time::timeout(limit, handled).await.is_err() {
                        error!(portal_id = %portal.key, "Remote event handler deadline exceeded");
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Typing refresher
// ---------------------------------------------------------------------------

/// Re-send typing=true for every still-typing user at a fixed cadence, for
/// networks that treat typing as a heartbeat rather than a toggle.
async fn periodic_typing_refresh(portal: Weak<Portal>) {
    let interval = {
        let Some(portal) = portal.upgrade() else {
            return;
        };
        let Some(bridge) = portal.bridge() else {
            return;
        };
        bridge.config.typing_refresh_interval
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(portal) = portal.upgrade() else {
            return;
        };
        portal.refresh_typing().await;
    }
}
