//! Schema initialisation for the session store.
//!
//! One SQLite file holds sessions, their message history, plan documents and
//! usage records. The on-disk format is private to this crate; the rest of
//! the runtime only sees the typed API in `store.rs`.

use rusqlite::Connection;

use crate::error::Result;

/// Create all tables and indexes if they do not exist yet.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sessions (
            id            TEXT PRIMARY KEY,
            session_key   TEXT NOT NULL UNIQUE,
            last_model    TEXT,
            message_count INTEGER NOT NULL DEFAULT 0,
            total_tokens  INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            seq          INTEGER PRIMARY KEY AUTOINCREMENT,
            id           TEXT NOT NULL,
            session_key  TEXT NOT NULL,
            role         TEXT NOT NULL,
            content      TEXT,
            tool_call_id TEXT,
            tool_name    TEXT,
            tool_calls   TEXT NOT NULL DEFAULT '[]',
            metadata     TEXT NOT NULL DEFAULT 'null',
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages(session_key, seq);

        CREATE TABLE IF NOT EXISTS plans (
            id          TEXT PRIMARY KEY,
            session_key TEXT NOT NULL,
            status      TEXT NOT NULL,
            title       TEXT,
            markdown    TEXT NOT NULL DEFAULT '',
            model_tier  TEXT NOT NULL DEFAULT 'balanced',
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_plans_session
            ON plans(session_key, updated_at);

        CREATE TABLE IF NOT EXISTS usage (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            session_key TEXT NOT NULL,
            model       TEXT NOT NULL,
            tokens_in   INTEGER NOT NULL,
            tokens_out  INTEGER NOT NULL,
            created_at  TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}
