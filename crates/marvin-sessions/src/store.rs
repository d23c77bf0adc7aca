use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{Result, SessionError};
use crate::types::{Message, Plan, PlanStatus, Role, Session, SessionKey, UsageRecord};

/// Thread-safe store for sessions, message history, plans and usage.
///
/// Wraps a single SQLite connection in a `Mutex`. Reads return the last
/// committed write — the only guarantee the runtime relies on.
pub struct SessionStore {
    db: Mutex<Connection>,
}

impl SessionStore {
    /// Wrap an already-open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::new(Connection::open(path)?)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Return an existing session or create a new one (upsert pattern).
    #[instrument(skip(self), fields(key = %key))]
    pub fn get_or_create(&self, key: &SessionKey) -> Result<Session> {
        if let Some(session) = self.get(key)? {
            debug!("session cache hit");
            return Ok(session);
        }

        let id = Uuid::now_v7().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let key_str = key.format();

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO sessions
             (id, session_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            rusqlite::params![id, key_str, now],
        )?;

        // Read back — handles the race where two threads insert simultaneously.
        let session = db.query_row(
            "SELECT id, session_key, last_model, message_count, total_tokens,
                    created_at, updated_at
             FROM sessions WHERE session_key = ?1",
            rusqlite::params![key_str],
            row_to_session,
        )?;

        Ok(session)
    }

    /// Retrieve a session by key, returning `None` if it does not exist.
    pub fn get(&self, key: &SessionKey) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, session_key, last_model, message_count, total_tokens,
                    created_at, updated_at
             FROM sessions WHERE session_key = ?1",
            rusqlite::params![key.format()],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SessionError::Database(e)),
        }
    }

    /// Load a session's messages in append order, most recent `limit` entries.
    #[instrument(skip(self), fields(key = %key, limit))]
    pub fn history(&self, key: &SessionKey, limit: usize) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, role, content, tool_call_id, tool_name, tool_calls,
                    metadata, created_at
             FROM (SELECT * FROM messages WHERE session_key = ?1
                   ORDER BY seq DESC LIMIT ?2)
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![key.format(), limit as i64],
            row_to_message,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(SessionError::Database)
    }

    /// Append a single message to a session's history.
    pub fn append_message(&self, key: &SessionKey, msg: &Message) -> Result<()> {
        let db = self.db.lock().unwrap();
        insert_message(&db, key, msg)
    }

    /// Replace the entire history of a session atomically.
    ///
    /// Used by model-switch flattening and compaction, which rewrite the
    /// session list to match the turn's working list.
    #[instrument(skip(self, messages), fields(key = %key, count = messages.len()))]
    pub fn replace_messages(&self, key: &SessionKey, messages: &[Message]) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE session_key = ?1",
            rusqlite::params![key.format()],
        )?;
        for msg in messages {
            insert_message(&tx, key, msg)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Bump aggregate stats and record the model used for the turn.
    pub fn update_stats(&self, key: &SessionKey, tokens: u64, model: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let key_str = key.format();
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "UPDATE sessions
             SET message_count = message_count + 1,
                 total_tokens  = total_tokens + ?1,
                 last_model    = ?2,
                 updated_at    = ?3
             WHERE session_key = ?4",
            rusqlite::params![tokens as i64, model, now, key_str],
        )?;
        if rows_changed == 0 {
            return Err(SessionError::NotFound { key: key_str });
        }
        Ok(())
    }

    /// Record the model on the session without touching counters.
    ///
    /// Called by the flatten pass so the rewrite and the model stamp land
    /// together from the turn's point of view.
    pub fn set_last_model(&self, key: &SessionKey, model: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET last_model = ?1, updated_at = ?2 WHERE session_key = ?3",
            rusqlite::params![model, now, key.format()],
        )?;
        Ok(())
    }

    // ── Plans ──────────────────────────────────────────────────────

    /// Insert or overwrite a plan document.
    pub fn save_plan(&self, plan: &Plan) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO plans (id, session_key, status, title, markdown, model_tier,
                                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 title = excluded.title,
                 markdown = excluded.markdown,
                 updated_at = excluded.updated_at",
            rusqlite::params![
                plan.id,
                plan.session_key.format(),
                plan.status.as_str(),
                plan.title,
                plan.markdown,
                plan.model_tier,
                plan.created_at,
                plan.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Load a plan by id.
    pub fn load_plan(&self, id: &str) -> Result<Plan> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, session_key, status, title, markdown, model_tier,
                    created_at, updated_at
             FROM plans WHERE id = ?1",
            rusqlite::params![id],
            row_to_plan,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => SessionError::PlanNotFound {
                id: id.to_string(),
            },
            other => SessionError::Database(other),
        })
    }

    // ── Usage ──────────────────────────────────────────────────────

    /// Append one usage record (one row per LLM attempt).
    pub fn record_usage(&self, usage: &UsageRecord) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO usage (session_key, model, tokens_in, tokens_out, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                usage.session_key.format(),
                usage.model,
                usage.tokens_in,
                usage.tokens_out,
                usage.created_at,
            ],
        )?;
        Ok(())
    }
}

fn insert_message(conn: &Connection, key: &SessionKey, msg: &Message) -> Result<()> {
    let tool_calls = serde_json::to_string(&msg.tool_calls)?;
    let metadata = serde_json::to_string(&msg.metadata)?;
    conn.execute(
        "INSERT INTO messages (id, session_key, role, content, tool_call_id,
                               tool_name, tool_calls, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            msg.id,
            key.format(),
            msg.role.as_str(),
            msg.content,
            msg.tool_call_id,
            msg.tool_name,
            tool_calls,
            metadata,
            msg.created_at,
        ],
    )?;
    Ok(())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let key_str: String = row.get(1)?;
    let key = SessionKey::parse(&key_str).unwrap_or_else(|_| SessionKey::new("unknown", key_str));
    Ok(Session {
        id: row.get(0)?,
        key,
        last_model: row.get(2)?,
        message_count: row.get::<_, i64>(3)? as u32,
        total_tokens: row.get::<_, i64>(4)? as u64,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(1)?;
    let role = Role::from_str(&role_str).unwrap_or(Role::User);
    let tool_calls_json: String = row.get(5)?;
    let metadata_json: String = row.get(6)?;
    Ok(Message {
        id: row.get(0)?,
        role,
        content: row.get(2)?,
        tool_call_id: row.get(3)?,
        tool_name: row.get(4)?,
        tool_calls: serde_json::from_str(&tool_calls_json).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
        created_at: row.get(7)?,
    })
}

fn row_to_plan(row: &rusqlite::Row<'_>) -> rusqlite::Result<Plan> {
    let key_str: String = row.get(1)?;
    let key = SessionKey::parse(&key_str).unwrap_or_else(|_| SessionKey::new("unknown", key_str));
    let status_str: String = row.get(2)?;
    Ok(Plan {
        id: row.get(0)?,
        session_key: key,
        status: PlanStatus::from_str(&status_str).unwrap_or(PlanStatus::Cancelled),
        title: row.get(3)?,
        markdown: row.get(4)?,
        model_tier: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCallRecord;

    fn store() -> SessionStore {
        SessionStore::in_memory().unwrap()
    }

    fn key() -> SessionKey {
        SessionKey::new("telegram", "42")
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let store = store();
        let a = store.get_or_create(&key()).unwrap();
        let b = store.get_or_create(&key()).unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn history_preserves_append_order() {
        let store = store();
        store.get_or_create(&key()).unwrap();
        for i in 0..4 {
            let msg = Message::user(format!("m{i}"), "2026-01-01T00:00:00Z");
            store.append_message(&key(), &msg).unwrap();
        }
        let history = store.history(&key(), 10).unwrap();
        let texts: Vec<&str> = history.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["m0", "m1", "m2", "m3"]);
    }

    #[test]
    fn history_limit_keeps_most_recent() {
        let store = store();
        store.get_or_create(&key()).unwrap();
        for i in 0..6 {
            let msg = Message::user(format!("m{i}"), "2026-01-01T00:00:00Z");
            store.append_message(&key(), &msg).unwrap();
        }
        let history = store.history(&key(), 2).unwrap();
        let texts: Vec<&str> = history.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["m4", "m5"]);
    }

    #[test]
    fn tool_calls_survive_roundtrip() {
        let store = store();
        store.get_or_create(&key()).unwrap();
        let msg = Message::assistant_tool_calls(
            None,
            vec![ToolCallRecord {
                id: "call-1".into(),
                name: "fs_read".into(),
                arguments: serde_json::json!({"path": "README.md"}),
            }],
            "2026-01-01T00:00:00Z",
        );
        store.append_message(&key(), &msg).unwrap();
        let history = store.history(&key(), 10).unwrap();
        assert_eq!(history[0].tool_calls.len(), 1);
        assert_eq!(history[0].tool_calls[0].name, "fs_read");
        assert_eq!(
            history[0].tool_calls[0].arguments,
            serde_json::json!({"path": "README.md"})
        );
    }

    #[test]
    fn replace_messages_rewrites_history() {
        let store = store();
        store.get_or_create(&key()).unwrap();
        for i in 0..3 {
            store
                .append_message(&key(), &Message::user(format!("m{i}"), "t"))
                .unwrap();
        }
        let replacement = vec![
            Message::system("[Conversation summary]\nstuff", "t"),
            Message::user("m2", "t"),
        ];
        store.replace_messages(&key(), &replacement).unwrap();
        let history = store.history(&key(), 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::System);
    }

    #[test]
    fn update_stats_bumps_counters_and_model() {
        let store = store();
        store.get_or_create(&key()).unwrap();
        store.update_stats(&key(), 120, "claude-sonnet-4-6").unwrap();
        let session = store.get(&key()).unwrap().unwrap();
        assert_eq!(session.message_count, 1);
        assert_eq!(session.total_tokens, 120);
        assert_eq!(session.last_model.as_deref(), Some("claude-sonnet-4-6"));
    }

    #[test]
    fn update_stats_unknown_session_errors() {
        let store = store();
        let missing = SessionKey::new("ws", "nope");
        assert!(store.update_stats(&missing, 1, "m").is_err());
    }

    #[test]
    fn plan_save_and_load() {
        let store = store();
        let plan = Plan {
            id: "p-1".into(),
            session_key: key(),
            status: PlanStatus::Collecting,
            title: None,
            markdown: String::new(),
            model_tier: "balanced".into(),
            created_at: "t".into(),
            updated_at: "t".into(),
        };
        store.save_plan(&plan).unwrap();

        let mut updated = plan.clone();
        updated.status = PlanStatus::Ready;
        updated.markdown = "# Plan".into();
        store.save_plan(&updated).unwrap();

        let loaded = store.load_plan("p-1").unwrap();
        assert_eq!(loaded.status, PlanStatus::Ready);
        assert_eq!(loaded.markdown, "# Plan");
    }

    #[test]
    fn load_missing_plan_errors() {
        let store = store();
        assert!(matches!(
            store.load_plan("nope"),
            Err(SessionError::PlanNotFound { .. })
        ));
    }
}
