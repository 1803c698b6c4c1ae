//! The bridge value shared by all portals: collaborator handles, caches, and
//! the portal registry.
//!
//! The registry lock guards the in-memory indexes and storage read-through
//! on a miss; it is never held across event handling.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use passerelle_shared::event::RoomEvent;
use passerelle_shared::ids::{ChatId, LoginId, PortalKey, RoomId, RoomUserId};
use passerelle_store::{Database, PortalRow, Result as StoreResult, StoreError};

use crate::api::{DisappearLoop, GhostDirectory, Intent, RoomApi};
use crate::config::BridgeConfig;
use crate::portal::Portal;
use crate::remote::RemoteEvent;
use crate::users::{User, UserLogin};

#[derive(Default)]
struct BridgeCache {
    portals_by_key: HashMap<PortalKey, Arc<Portal>>,
    portals_by_room: HashMap<RoomId, Arc<Portal>>,
    users: HashMap<RoomUserId, Arc<User>>,
    logins: HashMap<LoginId, Arc<UserLogin>>,
}

/// Everything a portal needs from the rest of the bridge.
pub struct Bridge {
    pub config: BridgeConfig,
    pub db: Arc<Database>,
    pub matrix: Arc<dyn RoomApi>,
    pub bot: Arc<dyn Intent>,
    pub ghosts: Arc<dyn GhostDirectory>,
    pub disappear: Arc<dyn DisappearLoop>,
    cache: Mutex<BridgeCache>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        db: Arc<Database>,
        matrix: Arc<dyn RoomApi>,
        bot: Arc<dyn Intent>,
        ghosts: Arc<dyn GhostDirectory>,
        disappear: Arc<dyn DisappearLoop>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            db,
            matrix,
            bot,
            ghosts,
            disappear,
            cache: Mutex::new(BridgeCache::default()),
        })
    }

    // -----------------------------------------------------------------------
    // Users and logins
    // -----------------------------------------------------------------------

    pub fn add_user(&self, user: Arc<User>) {
        self.cache
            .lock()
            .users
            .insert(user.user_id.clone(), user);
    }

    /// Attach a login to its user and make it resolvable by id.
    pub fn register_login(&self, user: &Arc<User>, login: Arc<UserLogin>) {
        user.add_login(login.clone());
        let mut cache = self.cache.lock();
        cache
            .users
            .entry(user.user_id.clone())
            .or_insert_with(|| user.clone());
        cache.logins.insert(login.id.clone(), login);
    }

    pub fn user(&self, id: &RoomUserId) -> Option<Arc<User>> {
        self.cache.lock().users.get(id).cloned()
    }

    pub fn login(&self, id: &LoginId) -> Option<Arc<UserLogin>> {
        self.cache.lock().logins.get(id).cloned()
    }

    // -----------------------------------------------------------------------
    // Portal registry
    // -----------------------------------------------------------------------

    /// Load or create the portal for a key. A missing storage row is
    /// inserted, the portal indexed, and its event loop started.
    pub fn get_portal_by_key(self: &Arc<Self>, key: &PortalKey) -> StoreResult<Arc<Portal>> {
        let mut cache = self.cache.lock();
        let mut loading = Vec::new();
        self.locked_get_by_key(&mut cache, key, true, &mut loading)?
            .ok_or(StoreError::NotFound)
    }

    /// Find a portal that already exists: by the exact key, then by the
    /// receiver-less form, then by the uncertain-receiver storage lookup.
    pub fn get_existing_portal_by_key(
        self: &Arc<Self>,
        key: &PortalKey,
    ) -> StoreResult<Option<Arc<Portal>>> {
        let mut cache = self.cache.lock();
        let mut loading = Vec::new();
        if key.receiver.is_none() {
            return self.locked_get_by_key(&mut cache, key, false, &mut loading);
        }
        if let Some(portal) = cache.portals_by_key.get(key) {
            return Ok(Some(portal.clone()));
        }
        if let Some(portal) = cache.portals_by_key.get(&key.without_receiver()) {
            return Ok(Some(portal.clone()));
        }
        match self.db.get_portal_by_key_with_uncertain_receiver(key)? {
            Some(row) => Ok(Some(self.locked_index_portal(&mut cache, row, &mut loading)?)),
            None => Ok(None),
        }
    }

    pub fn get_portal_by_room_id(
        self: &Arc<Self>,
        room_id: &RoomId,
    ) -> StoreResult<Option<Arc<Portal>>> {
        let mut cache = self.cache.lock();
        if let Some(portal) = cache.portals_by_room.get(room_id) {
            return Ok(Some(portal.clone()));
        }
        match self.db.get_portal_by_room_id(room_id)? {
            Some(row) => {
                let mut loading = Vec::new();
                Ok(Some(self.locked_index_portal(&mut cache, row, &mut loading)?))
            }
            None => Ok(None),
        }
    }

    fn locked_get_by_key(
        self: &Arc<Self>,
        cache: &mut BridgeCache,
        key: &PortalKey,
        create_if_missing: bool,
        loading: &mut Vec<ChatId>,
    ) -> StoreResult<Option<Arc<Portal>>> {
        if let Some(portal) = cache.portals_by_key.get(key) {
            return Ok(Some(portal.clone()));
        }
        let row = match self.db.get_portal_by_key(key)? {
            Some(row) => row,
            None if create_if_missing => {
                let row = PortalRow::new(key.clone());
                self.db.insert_portal(&row)?;
                row
            }
            None => return Ok(None),
        };
        Ok(Some(self.locked_index_portal(cache, row, loading)?))
    }

    /// Wrap a storage row into a live portal: resolve the parent chain
    /// (depth-first, same lock), index both maps, and start the event loop.
    fn locked_index_portal(
        self: &Arc<Self>,
        cache: &mut BridgeCache,
        row: PortalRow,
        loading: &mut Vec<ChatId>,
    ) -> StoreResult<Arc<Portal>> {
        if let Some(portal) = cache.portals_by_key.get(&row.key) {
            return Ok(portal.clone());
        }
        let parent = match &row.parent_id {
            Some(parent_id) if loading.contains(parent_id) || parent_id == &row.key.id => {
                warn!(
                    portal_id = %row.key,
                    parent_id = %parent_id,
                    "Refusing to load parent portal that would form a cycle"
                );
                None
            }
            Some(parent_id) => {
                loading.push(row.key.id.clone());
                let parent_key = PortalKey {
                    id: parent_id.clone(),
                    receiver: None,
                };
                let parent = self.locked_get_by_key(cache, &parent_key, false, loading)?;
                loading.pop();
                parent
            }
            None => None,
        };
        let relay = row
            .relay_login_id
            .as_ref()
            .and_then(|id| cache.logins.get(id).cloned());
        let (portal, events_rx) =
            Portal::from_row(row, parent, relay, Arc::downgrade(self), &self.config);
        cache
            .portals_by_key
            .insert(portal.key.clone(), portal.clone());
        if let Some(room_id) = portal.room_id() {
            cache.portals_by_room.insert(room_id, portal.clone());
        }
        Portal::start(&portal, events_rx);
        Ok(portal)
    }

    /// Add the room index for a portal that just got its room created.
    pub(crate) fn reindex_room(&self, key: &PortalKey, room_id: RoomId) {
        let mut cache = self.cache.lock();
        if let Some(portal) = cache.portals_by_key.get(key).cloned() {
            cache.portals_by_room.insert(room_id, portal);
        }
    }

    pub(crate) fn remove_portal_from_cache(&self, portal: &Portal) {
        let mut cache = self.cache.lock();
        cache.portals_by_key.remove(&portal.key);
        if let Some(room_id) = portal.room_id() {
            cache.portals_by_room.remove(&room_id);
        }
    }

    // -----------------------------------------------------------------------
    // Event intake
    // -----------------------------------------------------------------------

    /// Queue a remote event onto its portal, creating the portal lazily.
    pub async fn queue_remote_event(
        self: &Arc<Self>,
        key: &PortalKey,
        source: &Arc<UserLogin>,
        event: RemoteEvent,
    ) -> StoreResult<()> {
        let portal = self.get_portal_by_key(key)?;
        if let Err(e) = self
            .db
            .ensure_user_portal_exists(&source.user_id, &source.id, key)
        {
            warn!(error = %e, "Failed to ensure user portal row exists");
        }
        portal.queue_remote_event(source.clone(), event).await;
        Ok(())
    }

    /// Queue a room-side event onto the portal owning its room. Events for
    /// unbridged rooms are dropped.
    pub async fn queue_room_event(
        self: &Arc<Self>,
        sender: &Arc<User>,
        event: RoomEvent,
    ) -> StoreResult<()> {
        match self.get_portal_by_room_id(&event.room_id)? {
            Some(portal) => portal.queue_room_event(sender.clone(), event).await,
            None => {
                debug!(room_id = %event.room_id, "Dropping event for unknown room");
            }
        }
        Ok(())
    }
}
