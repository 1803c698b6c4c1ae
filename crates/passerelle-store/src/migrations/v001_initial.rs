//! v001 -- Initial schema creation.
//!
//! Creates the five mapping tables: `portals`, `messages`, `reactions`,
//! `user_portals`, and `disappearing_messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Portals
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS portals (
    id                TEXT NOT NULL,               -- remote chat id
    receiver          TEXT NOT NULL DEFAULT '',    -- login id, '' for shared portals
    room_id           TEXT UNIQUE,                 -- room-side id, NULL until created
    parent_id         TEXT,                        -- remote chat id of the parent portal
    name              TEXT NOT NULL DEFAULT '',
    topic             TEXT NOT NULL DEFAULT '',
    avatar_id         TEXT NOT NULL DEFAULT '',
    avatar_url        TEXT,
    avatar_hash       TEXT,                        -- hex-encoded 32 bytes
    name_set          INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    topic_set         INTEGER NOT NULL DEFAULT 0,
    avatar_set        INTEGER NOT NULL DEFAULT 0,
    is_direct         INTEGER NOT NULL DEFAULT 0,
    is_space          INTEGER NOT NULL DEFAULT 0,
    disappear_kind    TEXT,                        -- 'after_read' / 'after_send'
    disappear_timer_ms INTEGER,
    relay_login_id    TEXT,

    PRIMARY KEY (id, receiver)
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    row_id            INTEGER PRIMARY KEY,         -- stable reply/thread reference
    remote_id         TEXT NOT NULL,
    part_id           TEXT NOT NULL DEFAULT '',
    event_id          TEXT NOT NULL UNIQUE,        -- room-side event id
    portal_id         TEXT NOT NULL,
    portal_receiver   TEXT NOT NULL DEFAULT '',
    sender_remote_id  TEXT NOT NULL,
    sender_room_id    TEXT NOT NULL,
    timestamp         TEXT NOT NULL,               -- ISO-8601 / RFC-3339
    relates_to_row    INTEGER,
    edit_count        INTEGER NOT NULL DEFAULT 0,
    metadata          TEXT,                        -- opaque JSON

    UNIQUE (remote_id, part_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_remote ON messages(remote_id);
CREATE INDEX IF NOT EXISTS idx_messages_portal ON messages(portal_id, portal_receiver);

-- ----------------------------------------------------------------
-- Reactions
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS reactions (
    remote_message_id TEXT NOT NULL,
    part_id           TEXT NOT NULL DEFAULT '',
    sender_remote_id  TEXT NOT NULL,
    emoji_id          TEXT NOT NULL DEFAULT '',    -- '' for free-form reactions
    emoji             TEXT,                        -- literal emoji when emoji_id is ''
    event_id          TEXT NOT NULL UNIQUE,
    portal_id         TEXT NOT NULL,
    portal_receiver   TEXT NOT NULL DEFAULT '',
    timestamp         TEXT NOT NULL,
    metadata          TEXT,

    PRIMARY KEY (remote_message_id, part_id, sender_remote_id, emoji_id)
);

CREATE INDEX IF NOT EXISTS idx_reactions_sender
    ON reactions(remote_message_id, sender_remote_id);

-- ----------------------------------------------------------------
-- User portals
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS user_portals (
    user_id           TEXT NOT NULL,               -- room-side user id
    login_id          TEXT NOT NULL,
    portal_id         TEXT NOT NULL,
    portal_receiver   TEXT NOT NULL DEFAULT '',
    in_chat           INTEGER NOT NULL DEFAULT 0,
    last_read         TEXT,

    PRIMARY KEY (login_id, portal_id, portal_receiver)
);

CREATE INDEX IF NOT EXISTS idx_user_portals_user
    ON user_portals(user_id, portal_id, portal_receiver);

-- ----------------------------------------------------------------
-- Disappearing messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS disappearing_messages (
    event_id          TEXT PRIMARY KEY NOT NULL,
    room_id           TEXT NOT NULL,
    kind              TEXT NOT NULL,               -- 'after_read' / 'after_send'
    timer_ms          INTEGER NOT NULL,
    disappear_at      TEXT                         -- NULL until the timer starts
);

CREATE INDEX IF NOT EXISTS idx_disappearing_room ON disappearing_messages(room_id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
