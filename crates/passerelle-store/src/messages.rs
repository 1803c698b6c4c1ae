use rusqlite::{params, OptionalExtension, Row};

use passerelle_shared::ids::{EventId, PartId, RemoteMessageId, RemoteUserId, RoomUserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{
    encode_metadata, key_from_parts, parse_metadata, parse_ts, receiver_str, Message,
};

const MESSAGE_COLUMNS: &str = "row_id, remote_id, part_id, event_id, portal_id, \
     portal_receiver, sender_remote_id, sender_room_id, timestamp, relates_to_row, \
     edit_count, metadata";

impl Database {
    /// Insert one message part and fill in its row id.
    ///
    /// All parts of a remote message must live in the same portal and carry
    /// the same remote sender; a mismatching part is rejected.
    pub fn insert_message(&self, message: &mut Message) -> Result<()> {
        if let Some(first) = self.get_first_part_by_id(&message.remote_id)? {
            if first.portal != message.portal || first.sender_remote_id != message.sender_remote_id
            {
                return Err(StoreError::PartIdentityMismatch);
            }
        }
        let conn = self.conn();
        conn.execute(
            "INSERT INTO messages (remote_id, part_id, event_id, portal_id, portal_receiver, \
             sender_remote_id, sender_room_id, timestamp, relates_to_row, edit_count, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.remote_id.0,
                message.part_id.0,
                message.event_id.0,
                message.portal.id.0,
                receiver_str(&message.portal),
                message.sender_remote_id.0,
                message.sender_room_id.0,
                message.timestamp.to_rfc3339(),
                message.relates_to,
                message.edit_count,
                encode_metadata(&message.metadata),
            ],
        )?;
        message.row_id = conn.last_insert_rowid();
        Ok(())
    }

    pub fn update_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "UPDATE messages SET event_id = ?2, timestamp = ?3, relates_to_row = ?4, \
             edit_count = ?5, metadata = ?6 WHERE row_id = ?1",
            params![
                message.row_id,
                message.event_id.0,
                message.timestamp.to_rfc3339(),
                message.relates_to,
                message.edit_count,
                encode_metadata(&message.metadata),
            ],
        )?;
        Ok(())
    }

    /// Look up the part that produced the given room-side event.
    pub fn get_message_part_by_event_id(&self, event_id: &EventId) -> Result<Option<Message>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE event_id = ?1"),
                params![event_id.0],
                row_to_message,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_first_part_by_id(&self, remote_id: &RemoteMessageId) -> Result<Option<Message>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE remote_id = ?1 \
                     ORDER BY row_id ASC LIMIT 1"
                ),
                params![remote_id.0],
                row_to_message,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_last_part_by_id(&self, remote_id: &RemoteMessageId) -> Result<Option<Message>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE remote_id = ?1 \
                     ORDER BY row_id DESC LIMIT 1"
                ),
                params![remote_id.0],
                row_to_message,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_part_by_id(
        &self,
        remote_id: &RemoteMessageId,
        part_id: &PartId,
    ) -> Result<Option<Message>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE remote_id = ?1 AND part_id = ?2"
                ),
                params![remote_id.0, part_id.0],
                row_to_message,
            )
            .optional()?;
        Ok(row)
    }

    /// Look up a specific part when one is named, the first part otherwise.
    pub fn get_first_or_specific_part(
        &self,
        remote_id: &RemoteMessageId,
        part_id: Option<&PartId>,
    ) -> Result<Option<Message>> {
        match part_id {
            Some(part_id) => self.get_part_by_id(remote_id, part_id),
            None => self.get_first_part_by_id(remote_id),
        }
    }

    pub fn get_all_parts_by_id(&self, remote_id: &RemoteMessageId) -> Result<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE remote_id = ?1 ORDER BY row_id ASC"
        ))?;
        let rows = stmt.query_map(params![remote_id.0], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn delete_message(&self, row_id: i64) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM messages WHERE row_id = ?1", params![row_id])?;
        Ok(affected > 0)
    }

    pub fn delete_all_parts(&self, remote_id: &RemoteMessageId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE remote_id = ?1",
            params![remote_id.0],
        )?;
        Ok(affected)
    }
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        row_id: row.get(0)?,
        remote_id: RemoteMessageId(row.get(1)?),
        part_id: PartId(row.get(2)?),
        event_id: EventId(row.get(3)?),
        portal: key_from_parts(row.get(4)?, row.get(5)?),
        sender_remote_id: RemoteUserId(row.get(6)?),
        sender_room_id: RoomUserId(row.get(7)?),
        timestamp: parse_ts(8, row.get(8)?)?,
        relates_to: row.get(9)?,
        edit_count: row.get(10)?,
        metadata: parse_metadata(row.get(11)?),
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use passerelle_shared::ids::PortalKey;
    use serde_json::json;

    use super::*;

    fn sample(part: &str, event: &str) -> Message {
        Message {
            row_id: 0,
            remote_id: RemoteMessageId("msg-1".into()),
            part_id: PartId(part.into()),
            event_id: EventId(event.into()),
            portal: PortalKey::shared("chat-1"),
            sender_remote_id: RemoteUserId("remote-alice".into()),
            sender_room_id: RoomUserId("@alice:example.org".into()),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            relates_to: None,
            edit_count: 0,
            metadata: json!({"net": {"seq": 4}}),
        }
    }

    #[test]
    fn insert_fills_row_id_and_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let mut msg = sample("", "$evt1");
        db.insert_message(&mut msg).unwrap();
        assert!(msg.row_id > 0);

        let by_event = db
            .get_message_part_by_event_id(&EventId("$evt1".into()))
            .unwrap()
            .unwrap();
        assert_eq!(by_event, msg);
    }

    #[test]
    fn part_lookups() {
        let db = Database::open_in_memory().unwrap();
        let mut first = sample("0", "$evt1");
        let mut second = sample("1", "$evt2");
        db.insert_message(&mut first).unwrap();
        db.insert_message(&mut second).unwrap();

        let id = RemoteMessageId("msg-1".into());
        assert_eq!(db.get_first_part_by_id(&id).unwrap().unwrap(), first);
        assert_eq!(db.get_last_part_by_id(&id).unwrap().unwrap(), second);
        assert_eq!(
            db.get_part_by_id(&id, &PartId("1".into())).unwrap().unwrap(),
            second
        );
        assert_eq!(
            db.get_first_or_specific_part(&id, None).unwrap().unwrap(),
            first
        );
        assert_eq!(db.get_all_parts_by_id(&id).unwrap(), vec![first, second]);
    }

    #[test]
    fn parts_must_share_portal_and_sender() {
        let db = Database::open_in_memory().unwrap();
        let mut first = sample("0", "$evt1");
        db.insert_message(&mut first).unwrap();

        let mut stray = sample("1", "$evt2");
        stray.sender_remote_id = RemoteUserId("remote-bob".into());
        assert!(matches!(
            db.insert_message(&mut stray),
            Err(StoreError::PartIdentityMismatch)
        ));

        let mut stray = sample("2", "$evt3");
        stray.portal = PortalKey::shared("other-chat");
        assert!(matches!(
            db.insert_message(&mut stray),
            Err(StoreError::PartIdentityMismatch)
        ));
    }

    #[test]
    fn delete_all_parts_removes_everything() {
        let db = Database::open_in_memory().unwrap();
        let mut first = sample("0", "$evt1");
        let mut second = sample("1", "$evt2");
        db.insert_message(&mut first).unwrap();
        db.insert_message(&mut second).unwrap();

        let id = RemoteMessageId("msg-1".into());
        assert_eq!(db.delete_all_parts(&id).unwrap(), 2);
        assert!(db.get_first_part_by_id(&id).unwrap().is_none());
    }
}
