use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use passerelle_shared::event::DisappearKind;
use passerelle_shared::ids::{EventId, RoomId};

use crate::database::Database;
use crate::error::Result;
use crate::models::{parse_opt_ts, DisappearingMessage};

const DISAPPEARING_COLUMNS: &str = "event_id, room_id, kind, timer_ms, disappear_at";

impl Database {
    pub fn upsert_disappearing_message(&self, message: &DisappearingMessage) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO disappearing_messages ({DISAPPEARING_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (event_id) DO UPDATE SET kind = ?3, timer_ms = ?4, disappear_at = ?5"
            ),
            params![
                message.event_id.0,
                message.room_id.0,
                message.kind.as_str(),
                message.timer.as_millis() as i64,
                message.disappear_at.map(|ts| ts.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn delete_disappearing_message(&self, event_id: &EventId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM disappearing_messages WHERE event_id = ?1",
            params![event_id.0],
        )?;
        Ok(affected > 0)
    }

    /// Messages whose timer has expired.
    pub fn get_due_disappearing_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DisappearingMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DISAPPEARING_COLUMNS} FROM disappearing_messages \
             WHERE disappear_at IS NOT NULL AND disappear_at <= ?1 \
             ORDER BY disappear_at ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![now.to_rfc3339(), limit as i64],
            row_to_disappearing,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Start the timer of every waiting after-read message in a room.
    /// Returns the number of timers started.
    pub fn start_disappearing_timers(&self, room_id: &RoomId, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT event_id, timer_ms FROM disappearing_messages \
             WHERE room_id = ?1 AND disappear_at IS NULL",
        )?;
        let rows = stmt.query_map(params![room_id.0], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut started = 0;
        let pending: Vec<(String, i64)> = rows.collect::<rusqlite::Result<_>>()?;
        for (event_id, timer_ms) in pending {
            let disappear_at = now + chrono::Duration::milliseconds(timer_ms);
            conn.execute(
                "UPDATE disappearing_messages SET disappear_at = ?2 WHERE event_id = ?1",
                params![event_id, disappear_at.to_rfc3339()],
            )?;
            started += 1;
        }
        Ok(started)
    }
}

fn row_to_disappearing(row: &Row<'_>) -> rusqlite::Result<DisappearingMessage> {
    let kind: String = row.get(2)?;
    let kind = DisappearKind::from_str(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown disappearing kind: {kind}").into(),
        )
    })?;
    let timer_ms: i64 = row.get(3)?;
    Ok(DisappearingMessage {
        event_id: EventId(row.get(0)?),
        room_id: RoomId(row.get(1)?),
        kind,
        timer: std::time::Duration::from_millis(timer_ms.max(0) as u64),
        disappear_at: parse_opt_ts(4, row.get(4)?)?,
    })
}
