//! Local users and their network logins.
//!
//! User and login lifecycle (authentication, connection management) lives
//! outside the core; the bridge only caches the objects and reads their
//! current connection state when routing events.

use std::sync::Arc;

use parking_lot::RwLock;

use passerelle_shared::event::MemberContent;
use passerelle_shared::ids::{LoginId, RoomUserId};

use crate::api::{Intent, NetworkApi};

/// A local user of the room side.
pub struct User {
    pub user_id: RoomUserId,
    logins: RwLock<Vec<Arc<UserLogin>>>,
    double_puppet: RwLock<Option<Arc<dyn Intent>>>,
}

impl User {
    pub fn new(user_id: RoomUserId) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            logins: RwLock::new(Vec::new()),
            double_puppet: RwLock::new(None),
        })
    }

    /// The user's own room-side session acting as themselves, when double
    /// puppeting is set up.
    pub fn double_puppet(&self) -> Option<Arc<dyn Intent>> {
        self.double_puppet.read().clone()
    }

    pub fn set_double_puppet(&self, intent: Option<Arc<dyn Intent>>) {
        *self.double_puppet.write() = intent;
    }

    /// The user's logins in registration order.
    pub fn logins(&self) -> Vec<Arc<UserLogin>> {
        self.logins.read().clone()
    }

    pub fn login(&self, id: &LoginId) -> Option<Arc<UserLogin>> {
        self.logins.read().iter().find(|l| &l.id == id).cloned()
    }

    pub(crate) fn add_login(&self, login: Arc<UserLogin>) {
        let mut logins = self.logins.write();
        if !logins.iter().any(|l| l.id == login.id) {
            logins.push(login);
        }
    }
}

/// One network login of a local user.
pub struct UserLogin {
    pub id: LoginId,
    pub user_id: RoomUserId,
    client: RwLock<Option<Arc<dyn NetworkApi>>>,
}

impl UserLogin {
    pub fn new(id: LoginId, user_id: RoomUserId) -> Arc<Self> {
        Arc::new(Self {
            id,
            user_id,
            client: RwLock::new(None),
        })
    }

    /// The connected network client, if any. A login without a client is
    /// skipped when picking the preferred login for an event.
    pub fn client(&self) -> Option<Arc<dyn NetworkApi>> {
        self.client.read().clone()
    }

    pub fn set_client(&self, client: Option<Arc<dyn NetworkApi>>) {
        *self.client.write() = client;
    }
}

/// The original sender of an event that goes out through the relay login.
pub struct OrigSender {
    pub user: Arc<User>,
    /// Room-side profile of the sender, for display in relayed messages.
    pub member: Option<MemberContent>,
}
