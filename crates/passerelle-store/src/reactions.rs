use rusqlite::{params, OptionalExtension, Row};

use passerelle_shared::ids::{EmojiId, EventId, PartId, RemoteMessageId, RemoteUserId};

use crate::database::Database;
use crate::error::Result;
use crate::models::{
    encode_metadata, key_from_parts, parse_metadata, parse_ts, receiver_str, Reaction,
};

const REACTION_COLUMNS: &str = "remote_message_id, part_id, sender_remote_id, emoji_id, \
     emoji, event_id, portal_id, portal_receiver, timestamp, metadata";

impl Database {
    /// Insert or replace a reaction by its composite key.
    pub fn upsert_reaction(&self, reaction: &Reaction) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO reactions ({REACTION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT (remote_message_id, part_id, sender_remote_id, emoji_id) \
                 DO UPDATE SET emoji = ?5, event_id = ?6, timestamp = ?9, metadata = ?10"
            ),
            params![
                reaction.remote_message_id.0,
                reaction.part_id.0,
                reaction.sender_remote_id.0,
                reaction.emoji_id.0,
                reaction.emoji,
                reaction.event_id.0,
                reaction.portal.id.0,
                receiver_str(&reaction.portal),
                reaction.timestamp.to_rfc3339(),
                encode_metadata(&reaction.metadata),
            ],
        )?;
        Ok(())
    }

    pub fn get_reaction(
        &self,
        remote_message_id: &RemoteMessageId,
        part_id: &PartId,
        sender: &RemoteUserId,
        emoji_id: &EmojiId,
    ) -> Result<Option<Reaction>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {REACTION_COLUMNS} FROM reactions WHERE remote_message_id = ?1 \
                     AND part_id = ?2 AND sender_remote_id = ?3 AND emoji_id = ?4"
                ),
                params![remote_message_id.0, part_id.0, sender.0, emoji_id.0],
                row_to_reaction,
            )
            .optional()?;
        Ok(row)
    }

    /// Like [`Database::get_reaction`] but matching any message part.
    pub fn get_reaction_without_part(
        &self,
        remote_message_id: &RemoteMessageId,
        sender: &RemoteUserId,
        emoji_id: &EmojiId,
    ) -> Result<Option<Reaction>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {REACTION_COLUMNS} FROM reactions WHERE remote_message_id = ?1 \
                     AND sender_remote_id = ?2 AND emoji_id = ?3 LIMIT 1"
                ),
                params![remote_message_id.0, sender.0, emoji_id.0],
                row_to_reaction,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_reaction_by_event_id(&self, event_id: &EventId) -> Result<Option<Reaction>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {REACTION_COLUMNS} FROM reactions WHERE event_id = ?1"),
                params![event_id.0],
                row_to_reaction,
            )
            .optional()?;
        Ok(row)
    }

    /// All reactions by one sender to any part of a message, oldest first.
    pub fn get_all_reactions_to_message_by_sender(
        &self,
        remote_message_id: &RemoteMessageId,
        sender: &RemoteUserId,
    ) -> Result<Vec<Reaction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REACTION_COLUMNS} FROM reactions WHERE remote_message_id = ?1 \
             AND sender_remote_id = ?2 ORDER BY timestamp ASC"
        ))?;
        let rows = stmt.query_map(params![remote_message_id.0, sender.0], row_to_reaction)?;

        let mut reactions = Vec::new();
        for row in rows {
            reactions.push(row?);
        }
        Ok(reactions)
    }

    pub fn delete_reaction(&self, reaction: &Reaction) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM reactions WHERE remote_message_id = ?1 AND part_id = ?2 \
             AND sender_remote_id = ?3 AND emoji_id = ?4",
            params![
                reaction.remote_message_id.0,
                reaction.part_id.0,
                reaction.sender_remote_id.0,
                reaction.emoji_id.0,
            ],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_reaction(row: &Row<'_>) -> rusqlite::Result<Reaction> {
    Ok(Reaction {
        remote_message_id: RemoteMessageId(row.get(0)?),
        part_id: PartId(row.get(1)?),
        sender_remote_id: RemoteUserId(row.get(2)?),
        emoji_id: EmojiId(row.get(3)?),
        emoji: row.get(4)?,
        event_id: EventId(row.get(5)?),
        portal: key_from_parts(row.get(6)?, row.get(7)?),
        timestamp: parse_ts(8, row.get(8)?)?,
        metadata: parse_metadata(row.get(9)?),
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use passerelle_shared::ids::PortalKey;
    use serde_json::Value;

    use super::*;

    fn sample(emoji: &str, event: &str) -> Reaction {
        Reaction {
            remote_message_id: RemoteMessageId("msg-1".into()),
            part_id: PartId::default(),
            sender_remote_id: RemoteUserId("remote-alice".into()),
            emoji_id: EmojiId::default(),
            emoji: Some(emoji.to_string()),
            event_id: EventId(event.into()),
            portal: PortalKey::shared("chat-1"),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            metadata: Value::Null,
        }
    }

    #[test]
    fn upsert_replaces_by_composite_key() {
        let db = Database::open_in_memory().unwrap();
        let first = sample("👍", "$r1");
        db.upsert_reaction(&first).unwrap();

        let mut second = sample("❤️", "$r2");
        second.timestamp = first.timestamp + Duration::seconds(5);
        db.upsert_reaction(&second).unwrap();

        // Same composite key (empty emoji id), so only the newer row remains.
        let stored = db
            .get_reaction(
                &first.remote_message_id,
                &first.part_id,
                &first.sender_remote_id,
                &first.emoji_id,
            )
            .unwrap()
            .unwrap();
        assert_eq!(stored.emoji.as_deref(), Some("❤️"));
        assert_eq!(stored.event_id, EventId("$r2".into()));
    }

    #[test]
    fn sender_reactions_are_ordered_oldest_first() {
        let db = Database::open_in_memory().unwrap();
        for (i, emoji) in ["a", "b", "c"].iter().enumerate() {
            let mut reaction = sample(emoji, &format!("$r{i}"));
            reaction.emoji_id = EmojiId(format!("emoji-{emoji}"));
            reaction.timestamp = reaction.timestamp + Duration::seconds(i as i64);
            db.upsert_reaction(&reaction).unwrap();
        }

        let all = db
            .get_all_reactions_to_message_by_sender(
                &RemoteMessageId("msg-1".into()),
                &RemoteUserId("remote-alice".into()),
            )
            .unwrap();
        let emojis: Vec<_> = all.iter().filter_map(|r| r.emoji.as_deref()).collect();
        assert_eq!(emojis, vec!["a", "b", "c"]);
    }

    #[test]
    fn lookup_without_part_and_delete() {
        let db = Database::open_in_memory().unwrap();
        let reaction = sample("👍", "$r1");
        db.upsert_reaction(&reaction).unwrap();

        let found = db
            .get_reaction_without_part(
                &reaction.remote_message_id,
                &reaction.sender_remote_id,
                &reaction.emoji_id,
            )
            .unwrap();
        assert!(found.is_some());

        assert!(db.delete_reaction(&reaction).unwrap());
        assert!(db
            .get_reaction_by_event_id(&EventId("$r1".into()))
            .unwrap()
            .is_none());
    }
}
