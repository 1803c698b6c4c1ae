use rusqlite::{params, OptionalExtension, Row};

use passerelle_shared::event::{DisappearKind, DisappearingSetting};
use passerelle_shared::ids::{ChatId, FileUrl, LoginId, PortalKey, RoomId};

use crate::database::Database;
use crate::error::Result;
use crate::models::{key_from_parts, parse_hash, receiver_str, PortalRow};

const PORTAL_COLUMNS: &str = "id, receiver, room_id, parent_id, name, topic, avatar_id, \
     avatar_url, avatar_hash, name_set, topic_set, avatar_set, is_direct, is_space, \
     disappear_kind, disappear_timer_ms, relay_login_id";

impl Database {
    pub fn insert_portal(&self, portal: &PortalRow) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO portals ({PORTAL_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                portal.key.id.0,
                receiver_str(&portal.key),
                portal.room_id.as_ref().map(|r| r.0.as_str()),
                portal.parent_id.as_ref().map(|p| p.0.as_str()),
                portal.name,
                portal.topic,
                portal.avatar_id,
                portal.avatar_url.as_ref().map(|u| u.0.as_str()),
                portal.avatar_hash.as_ref().map(hex::encode),
                portal.name_set,
                portal.topic_set,
                portal.avatar_set,
                portal.is_direct,
                portal.is_space,
                portal.disappear.as_ref().map(|d| d.kind.as_str()),
                portal.disappear.as_ref().map(|d| d.timer.as_millis() as i64),
                portal.relay_login_id.as_ref().map(|l| l.0.as_str()),
            ],
        )?;
        Ok(())
    }

    pub fn update_portal(&self, portal: &PortalRow) -> Result<()> {
        self.conn().execute(
            "UPDATE portals SET room_id = ?3, parent_id = ?4, name = ?5, topic = ?6, \
             avatar_id = ?7, avatar_url = ?8, avatar_hash = ?9, name_set = ?10, \
             topic_set = ?11, avatar_set = ?12, is_direct = ?13, is_space = ?14, \
             disappear_kind = ?15, disappear_timer_ms = ?16, relay_login_id = ?17 \
             WHERE id = ?1 AND receiver = ?2",
            params![
                portal.key.id.0,
                receiver_str(&portal.key),
                portal.room_id.as_ref().map(|r| r.0.as_str()),
                portal.parent_id.as_ref().map(|p| p.0.as_str()),
                portal.name,
                portal.topic,
                portal.avatar_id,
                portal.avatar_url.as_ref().map(|u| u.0.as_str()),
                portal.avatar_hash.as_ref().map(hex::encode),
                portal.name_set,
                portal.topic_set,
                portal.avatar_set,
                portal.is_direct,
                portal.is_space,
                portal.disappear.as_ref().map(|d| d.kind.as_str()),
                portal.disappear.as_ref().map(|d| d.timer.as_millis() as i64),
                portal.relay_login_id.as_ref().map(|l| l.0.as_str()),
            ],
        )?;
        Ok(())
    }

    pub fn get_portal_by_key(&self, key: &PortalKey) -> Result<Option<PortalRow>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {PORTAL_COLUMNS} FROM portals WHERE id = ?1 AND receiver = ?2"),
                params![key.id.0, receiver_str(key)],
                row_to_portal,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_portal_by_room_id(&self, room_id: &RoomId) -> Result<Option<PortalRow>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {PORTAL_COLUMNS} FROM portals WHERE room_id = ?1"),
                params![room_id.0],
                row_to_portal,
            )
            .optional()?;
        Ok(row)
    }

    /// Look up a portal whose stored receiver may be either the given one or
    /// empty. The exact match wins when both rows exist.
    pub fn get_portal_by_key_with_uncertain_receiver(
        &self,
        key: &PortalKey,
    ) -> Result<Option<PortalRow>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {PORTAL_COLUMNS} FROM portals \
                     WHERE id = ?1 AND (receiver = ?2 OR receiver = '') \
                     ORDER BY receiver DESC LIMIT 1"
                ),
                params![key.id.0, receiver_str(key)],
                row_to_portal,
            )
            .optional()?;
        Ok(row)
    }

    pub fn delete_portal(&self, key: &PortalKey) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM portals WHERE id = ?1 AND receiver = ?2",
            params![key.id.0, receiver_str(key)],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_portal(row: &Row<'_>) -> rusqlite::Result<PortalRow> {
    let id: String = row.get(0)?;
    let receiver: String = row.get(1)?;
    let disappear_kind: Option<String> = row.get(14)?;
    let disappear_timer_ms: Option<i64> = row.get(15)?;
    let disappear = match (disappear_kind.as_deref().and_then(DisappearKind::from_str), disappear_timer_ms) {
        (Some(kind), Some(ms)) => Some(DisappearingSetting::new(
            kind,
            std::time::Duration::from_millis(ms.max(0) as u64),
        )),
        _ => None,
    };

    Ok(PortalRow {
        key: key_from_parts(id, receiver),
        room_id: row.get::<_, Option<String>>(2)?.map(RoomId),
        parent_id: row.get::<_, Option<String>>(3)?.map(ChatId),
        name: row.get(4)?,
        topic: row.get(5)?,
        avatar_id: row.get(6)?,
        avatar_url: row.get::<_, Option<String>>(7)?.map(FileUrl),
        avatar_hash: parse_hash(8, row.get(8)?)?,
        name_set: row.get(9)?,
        topic_set: row.get(10)?,
        avatar_set: row.get(11)?,
        is_direct: row.get(12)?,
        is_space: row.get(13)?,
        disappear,
        relay_login_id: row.get::<_, Option<String>>(16)?.map(LoginId),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let mut portal = PortalRow::new(PortalKey::shared("chat-1"));
        portal.name = "General".to_string();
        portal.avatar_hash = Some([7u8; 32]);
        portal.disappear = Some(DisappearingSetting::new(
            DisappearKind::AfterRead,
            std::time::Duration::from_secs(60),
        ));
        db.insert_portal(&portal).unwrap();

        let loaded = db.get_portal_by_key(&portal.key).unwrap().unwrap();
        assert_eq!(loaded, portal);

        portal.room_id = Some(RoomId("!room:example.org".into()));
        portal.name_set = true;
        db.update_portal(&portal).unwrap();
        let loaded = db.get_portal_by_room_id(&RoomId("!room:example.org".into()))
            .unwrap()
            .unwrap();
        assert_eq!(loaded, portal);
    }

    #[test]
    fn uncertain_receiver_falls_back_to_shared() {
        let db = Database::open_in_memory().unwrap();
        db.insert_portal(&PortalRow::new(PortalKey::shared("dm-1"))).unwrap();

        let split = PortalKey::split("dm-1", "login-a");
        assert!(db.get_portal_by_key(&split).unwrap().is_none());
        let found = db
            .get_portal_by_key_with_uncertain_receiver(&split)
            .unwrap()
            .unwrap();
        assert_eq!(found.key, PortalKey::shared("dm-1"));
    }

    #[test]
    fn uncertain_receiver_prefers_exact_match() {
        let db = Database::open_in_memory().unwrap();
        db.insert_portal(&PortalRow::new(PortalKey::shared("dm-2"))).unwrap();
        db.insert_portal(&PortalRow::new(PortalKey::split("dm-2", "login-a")))
            .unwrap();

        let found = db
            .get_portal_by_key_with_uncertain_receiver(&PortalKey::split("dm-2", "login-a"))
            .unwrap()
            .unwrap();
        assert_eq!(found.key, PortalKey::split("dm-2", "login-a"));
    }

    #[test]
    fn delete_removes_row() {
        let db = Database::open_in_memory().unwrap();
        let key = PortalKey::shared("gone");
        db.insert_portal(&PortalRow::new(key.clone())).unwrap();
        assert!(db.delete_portal(&key).unwrap());
        assert!(db.get_portal_by_key(&key).unwrap().is_none());
        assert!(!db.delete_portal(&key).unwrap());
    }
}
