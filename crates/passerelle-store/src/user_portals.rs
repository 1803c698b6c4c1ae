use rusqlite::{params, OptionalExtension, Row};

use passerelle_shared::ids::{LoginId, PortalKey, RoomUserId};

use crate::database::Database;
use crate::error::Result;
use crate::models::{key_from_parts, parse_opt_ts, receiver_str, UserPortal};

const USER_PORTAL_COLUMNS: &str =
    "user_id, login_id, portal_id, portal_receiver, in_chat, last_read";

impl Database {
    /// Insert or replace a user-portal link.
    pub fn put_user_portal(&self, user_portal: &UserPortal) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO user_portals ({USER_PORTAL_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT (login_id, portal_id, portal_receiver) \
                 DO UPDATE SET user_id = ?1, in_chat = ?5, last_read = ?6"
            ),
            params![
                user_portal.user_id.0,
                user_portal.login_id.0,
                user_portal.portal.id.0,
                receiver_str(&user_portal.portal),
                user_portal.in_chat,
                user_portal.last_read.map(|ts| ts.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Insert an empty link if none exists yet, without touching an existing
    /// row.
    pub fn ensure_user_portal_exists(
        &self,
        user_id: &RoomUserId,
        login_id: &LoginId,
        portal: &PortalKey,
    ) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT OR IGNORE INTO user_portals ({USER_PORTAL_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, 0, NULL)"
            ),
            params![user_id.0, login_id.0, portal.id.0, receiver_str(portal)],
        )?;
        Ok(())
    }

    pub fn get_user_portal(
        &self,
        login_id: &LoginId,
        portal: &PortalKey,
    ) -> Result<Option<UserPortal>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {USER_PORTAL_COLUMNS} FROM user_portals \
                     WHERE login_id = ?1 AND portal_id = ?2 AND portal_receiver = ?3"
                ),
                params![login_id.0, portal.id.0, receiver_str(portal)],
                row_to_user_portal,
            )
            .optional()?;
        Ok(row)
    }

    /// All of one user's links to a portal, ordered by login id so that login
    /// preference is stable.
    pub fn get_user_portals_by_user(
        &self,
        user_id: &RoomUserId,
        portal: &PortalKey,
    ) -> Result<Vec<UserPortal>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_PORTAL_COLUMNS} FROM user_portals \
             WHERE user_id = ?1 AND portal_id = ?2 AND portal_receiver = ?3 \
             ORDER BY login_id ASC"
        ))?;
        let rows = stmt.query_map(
            params![user_id.0, portal.id.0, receiver_str(portal)],
            row_to_user_portal,
        )?;

        let mut links = Vec::new();
        for row in rows {
            links.push(row?);
        }
        Ok(links)
    }

    /// Login ids of every user with a link to the portal.
    pub fn get_login_ids_in_portal(&self, portal: &PortalKey) -> Result<Vec<LoginId>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT login_id FROM user_portals \
             WHERE portal_id = ?1 AND portal_receiver = ?2 ORDER BY login_id ASC",
        )?;
        let rows = stmt.query_map(params![portal.id.0, receiver_str(portal)], |row| {
            Ok(LoginId(row.get(0)?))
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}

fn row_to_user_portal(row: &Row<'_>) -> rusqlite::Result<UserPortal> {
    Ok(UserPortal {
        user_id: RoomUserId(row.get(0)?),
        login_id: LoginId(row.get(1)?),
        portal: key_from_parts(row.get(2)?, row.get(3)?),
        in_chat: row.get(4)?,
        last_read: parse_opt_ts(5, row.get(5)?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    #[test]
    fn put_and_get_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let mut link = UserPortal::new(
            RoomUserId("@alice:example.org".into()),
            LoginId("login-a".into()),
            PortalKey::shared("chat-1"),
        );
        db.put_user_portal(&link).unwrap();

        link.in_chat = true;
        link.last_read = Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap());
        db.put_user_portal(&link).unwrap();

        let loaded = db
            .get_user_portal(&link.login_id, &link.portal)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, link);
    }

    #[test]
    fn ensure_exists_does_not_clobber() {
        let db = Database::open_in_memory().unwrap();
        let mut link = UserPortal::new(
            RoomUserId("@alice:example.org".into()),
            LoginId("login-a".into()),
            PortalKey::shared("chat-1"),
        );
        link.last_read = Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap());
        db.put_user_portal(&link).unwrap();

        db.ensure_user_portal_exists(&link.user_id, &link.login_id, &link.portal)
            .unwrap();
        let loaded = db
            .get_user_portal(&link.login_id, &link.portal)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.last_read, link.last_read);
    }

    #[test]
    fn links_are_ordered_by_login() {
        let db = Database::open_in_memory().unwrap();
        let user = RoomUserId("@alice:example.org".into());
        let portal = PortalKey::shared("chat-1");
        for login in ["login-b", "login-a"] {
            db.put_user_portal(&UserPortal::new(
                user.clone(),
                LoginId(login.into()),
                portal.clone(),
            ))
            .unwrap();
        }

        let links = db.get_user_portals_by_user(&user, &portal).unwrap();
        let ids: Vec<_> = links.iter().map(|l| l.login_id.0.as_str()).collect();
        assert_eq!(ids, vec!["login-a", "login-b"]);

        let all = db.get_login_ids_in_portal(&portal).unwrap();
        assert_eq!(all.len(), 2);
    }
}
