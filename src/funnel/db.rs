use super::types::{
    BotSettings, Conversation, ConversationStatus, DailyCounter, Funnel, FunnelCounter, JsonMap,
    Lead, LeadSource, MatchMode, Step, StepConfig, Trigger, TriggerKind, UserProfile, UserState,
    WaitingFor,
};
use super::validate::validate_funnel;
use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One row of the message audit log.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub conversation_id: String,
    pub bot_id: String,
    pub user_id: i64,
    pub telegram_message_id: Option<i64>,
    pub chat_id: i64,
    pub direction: String,
    pub sender_type: String,
    pub content_type: String,
    pub content: Value,
    pub keyboard: Option<Value>,
    pub funnel_id: Option<String>,
    pub step_id: Option<String>,
}

/// Daily aggregate counters for one (bot, date).
#[derive(Debug, Clone)]
pub struct DailyStatRow {
    pub bot_id: String,
    pub date: String,
    pub messages_in: i64,
    pub messages_out: i64,
    pub conversations_started: i64,
    pub leads_captured: i64,
    pub handoffs: i64,
    pub funnel_stats: Value,
    pub trigger_stats: Value,
}

/// SQLite-backed storage for bots, funnel graphs, triggers, per-user
/// state, conversations, the message audit log, leads, and daily stats.
///
/// Thread safety: wraps `Connection` in `Mutex`; the server shares a
/// single `FunnelDb` across tasks via `Arc<FunnelDb>`.
pub struct FunnelDb {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl FunnelDb {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Create an in-memory database (for tests).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;

             CREATE TABLE IF NOT EXISTS bots (
                 id          TEXT PRIMARY KEY NOT NULL,
                 settings    TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS funnels (
                 id                 TEXT PRIMARY KEY NOT NULL,
                 bot_id             TEXT NOT NULL,
                 name               TEXT NOT NULL,
                 is_active          INTEGER NOT NULL DEFAULT 1,
                 first_step_id      TEXT,
                 completion_message TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_funnels_bot
                 ON funnels(bot_id, is_active);

             CREATE TABLE IF NOT EXISTS steps (
                 id           TEXT PRIMARY KEY NOT NULL,
                 funnel_id    TEXT NOT NULL,
                 name         TEXT NOT NULL,
                 step_type    TEXT NOT NULL,
                 config       TEXT NOT NULL,
                 input        TEXT,
                 next_step_id TEXT,
                 action       TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_steps_funnel
                 ON steps(funnel_id, step_type);

             CREATE TABLE IF NOT EXISTS triggers (
                 id         TEXT PRIMARY KEY NOT NULL,
                 bot_id     TEXT NOT NULL,
                 name       TEXT NOT NULL,
                 kind       TEXT NOT NULL,
                 value      TEXT NOT NULL,
                 match_mode TEXT NOT NULL DEFAULT 'contains',
                 funnel_id  TEXT,
                 step_id    TEXT,
                 priority   INTEGER NOT NULL DEFAULT 0,
                 is_active  INTEGER NOT NULL DEFAULT 1
             );
             CREATE INDEX IF NOT EXISTS idx_triggers_bot_kind
                 ON triggers(bot_id, kind, is_active);

             CREATE TABLE IF NOT EXISTS users (
                 bot_id      TEXT NOT NULL,
                 telegram_id INTEGER NOT NULL,
                 profile     TEXT NOT NULL,
                 PRIMARY KEY (bot_id, telegram_id)
             );

             CREATE TABLE IF NOT EXISTS user_states (
                 bot_id            TEXT NOT NULL,
                 user_id           INTEGER NOT NULL,
                 current_funnel_id TEXT,
                 current_step_id   TEXT,
                 collected_data    TEXT NOT NULL DEFAULT '{}',
                 waiting_for       TEXT NOT NULL DEFAULT 'none',
                 last_message_id   INTEGER,
                 last_chat_id      INTEGER,
                 context           TEXT NOT NULL DEFAULT '{}',
                 updated_at        TEXT NOT NULL DEFAULT (datetime('now')),
                 PRIMARY KEY (bot_id, user_id)
             );

             CREATE TABLE IF NOT EXISTS conversations (
                 id                TEXT PRIMARY KEY NOT NULL,
                 bot_id            TEXT NOT NULL,
                 user_id           INTEGER NOT NULL,
                 status            TEXT NOT NULL DEFAULT 'active',
                 started_funnel_id TEXT,
                 lead_id           TEXT,
                 started_at        TEXT NOT NULL DEFAULT (datetime('now')),
                 last_message_at   TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_conversations_user
                 ON conversations(bot_id, user_id, status);

             CREATE TABLE IF NOT EXISTS messages (
                 id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                 conversation_id     TEXT NOT NULL,
                 bot_id              TEXT NOT NULL,
                 user_id             INTEGER NOT NULL,
                 telegram_message_id INTEGER,
                 chat_id             INTEGER NOT NULL,
                 direction           TEXT NOT NULL,
                 sender_type         TEXT NOT NULL,
                 content_type        TEXT NOT NULL,
                 content             TEXT NOT NULL,
                 keyboard            TEXT,
                 funnel_id           TEXT,
                 step_id             TEXT,
                 created_at          TEXT NOT NULL DEFAULT (datetime('now'))
             );
             CREATE INDEX IF NOT EXISTS idx_messages_user
                 ON messages(bot_id, user_id);

             CREATE TABLE IF NOT EXISTS leads (
                 id          TEXT PRIMARY KEY NOT NULL,
                 business_id TEXT NOT NULL,
                 source_id   TEXT,
                 name        TEXT,
                 phone       TEXT,
                 email       TEXT,
                 status      TEXT NOT NULL DEFAULT 'new',
                 notes       TEXT NOT NULL DEFAULT '',
                 data        TEXT NOT NULL DEFAULT '{}',
                 created_at  TEXT NOT NULL DEFAULT (datetime('now'))
             );

             CREATE TABLE IF NOT EXISTS lead_sources (
                 id          TEXT PRIMARY KEY NOT NULL,
                 business_id TEXT NOT NULL,
                 code        TEXT NOT NULL,
                 name        TEXT NOT NULL,
                 category    TEXT NOT NULL DEFAULT 'digital',
                 is_active   INTEGER NOT NULL DEFAULT 1,
                 UNIQUE (business_id, code)
             );

             CREATE TABLE IF NOT EXISTS daily_stats (
                 bot_id                TEXT NOT NULL,
                 date                  TEXT NOT NULL,
                 messages_in           INTEGER NOT NULL DEFAULT 0,
                 messages_out          INTEGER NOT NULL DEFAULT 0,
                 conversations_started INTEGER NOT NULL DEFAULT 0,
                 leads_captured        INTEGER NOT NULL DEFAULT 0,
                 handoffs              INTEGER NOT NULL DEFAULT 0,
                 funnel_stats          TEXT NOT NULL DEFAULT '{}',
                 trigger_stats         TEXT NOT NULL DEFAULT '{}',
                 PRIMARY KEY (bot_id, date)
             );",
        )?;
        Ok(())
    }

    // ── Bots ─────────────────────────────────────────────────────

    pub fn upsert_bot(&self, bot: &BotSettings) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute(
            "INSERT OR REPLACE INTO bots (id, settings) VALUES (?1, ?2)",
            params![bot.id, serde_json::to_string(bot)?],
        )?;
        Ok(())
    }

    pub fn get_bot(&self, id: &str) -> anyhow::Result<Option<BotSettings>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let settings: Option<String> = guard
            .query_row("SELECT settings FROM bots WHERE id = ?1", params![id], |r| {
                r.get(0)
            })
            .optional()?;
        settings
            .map(|s| serde_json::from_str(&s).context("bad bot settings json"))
            .transpose()
    }

    pub fn list_bots(&self) -> anyhow::Result<Vec<BotSettings>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = guard.prepare("SELECT settings FROM bots ORDER BY rowid")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut result = Vec::new();
        for r in rows {
            result.push(serde_json::from_str(&r?).context("bad bot settings json")?);
        }
        Ok(result)
    }

    // ── Funnels ──────────────────────────────────────────────────

    pub fn insert_funnel(&self, funnel: &Funnel) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute(
            "INSERT OR REPLACE INTO funnels
                (id, bot_id, name, is_active, first_step_id, completion_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                funnel.id,
                funnel.bot_id,
                funnel.name,
                funnel.is_active,
                funnel.first_step_id,
                funnel.completion_message,
            ],
        )?;
        Ok(())
    }

    pub fn get_funnel(&self, id: &str) -> anyhow::Result<Option<Funnel>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .query_row(
                "SELECT id, bot_id, name, is_active, first_step_id, completion_message
                 FROM funnels WHERE id = ?1",
                params![id],
                row_to_funnel,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Active funnels for a bot, in insertion order.
    pub fn active_funnels(&self, bot_id: &str) -> anyhow::Result<Vec<Funnel>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = guard.prepare(
            "SELECT id, bot_id, name, is_active, first_step_id, completion_message
             FROM funnels WHERE bot_id = ?1 AND is_active = 1
             ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![bot_id], row_to_funnel)?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?);
        }
        Ok(result)
    }

    pub fn first_active_funnel(&self, bot_id: &str) -> anyhow::Result<Option<Funnel>> {
        Ok(self.active_funnels(bot_id)?.into_iter().next())
    }

    /// Validate a funnel graph and insert it with all its steps.
    pub fn insert_funnel_graph(&self, funnel: &Funnel, steps: &[Step]) -> anyhow::Result<()> {
        if let Err(errors) = validate_funnel(funnel, steps) {
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            anyhow::bail!("funnel graph invalid: {joined}");
        }
        self.insert_funnel(funnel)?;
        for step in steps {
            self.insert_step(step)?;
        }
        Ok(())
    }

    // ── Steps ────────────────────────────────────────────────────

    pub fn insert_step(&self, step: &Step) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute(
            "INSERT OR REPLACE INTO steps
                (id, funnel_id, name, step_type, config, input, next_step_id, action)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                step.id,
                step.funnel_id,
                step.name,
                step.step_type(),
                serde_json::to_string(&step.config)?,
                step.input
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                step.next_step_id,
                step.action
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            ],
        )?;
        Ok(())
    }

    pub fn get_step(&self, id: &str) -> anyhow::Result<Option<Step>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = guard
            .query_row(
                "SELECT id, funnel_id, name, config, input, next_step_id, action
                 FROM steps WHERE id = ?1",
                params![id],
                row_to_step_parts,
            )
            .optional()?;
        row.map(step_from_parts).transpose()
    }

    pub fn steps_for_funnel(&self, funnel_id: &str) -> anyhow::Result<Vec<Step>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = guard.prepare(
            "SELECT id, funnel_id, name, config, input, next_step_id, action
             FROM steps WHERE funnel_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![funnel_id], row_to_step_parts)?;
        let mut result = Vec::new();
        for r in rows {
            result.push(step_from_parts(r?)?);
        }
        Ok(result)
    }

    /// Entry-marker steps of a funnel, for the keyword scan.
    pub fn trigger_keyword_steps(&self, funnel_id: &str) -> anyhow::Result<Vec<Step>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = guard.prepare(
            "SELECT id, funnel_id, name, config, input, next_step_id, action
             FROM steps WHERE funnel_id = ?1 AND step_type = 'trigger_keyword'
             ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![funnel_id], row_to_step_parts)?;
        let mut result = Vec::new();
        for r in rows {
            result.push(step_from_parts(r?)?);
        }
        Ok(result)
    }

    // ── Triggers ─────────────────────────────────────────────────

    pub fn insert_trigger(&self, trigger: &Trigger) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute(
            "INSERT OR REPLACE INTO triggers
                (id, bot_id, name, kind, value, match_mode, funnel_id, step_id, priority, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                trigger.id,
                trigger.bot_id,
                trigger.name,
                trigger.kind.as_str(),
                trigger.value,
                match_mode_str(trigger.match_mode),
                trigger.funnel_id,
                trigger.step_id,
                trigger.priority,
                trigger.is_active,
            ],
        )?;
        Ok(())
    }

    /// Active command trigger with the exact command value.
    pub fn command_trigger(&self, bot_id: &str, command: &str) -> anyhow::Result<Option<Trigger>> {
        self.exact_trigger(bot_id, "command", command)
    }

    /// Active deep-link trigger with the exact payload value.
    pub fn start_payload_trigger(
        &self,
        bot_id: &str,
        payload: &str,
    ) -> anyhow::Result<Option<Trigger>> {
        self.exact_trigger(bot_id, "start_payload", payload)
    }

    /// Active callback trigger with the exact callback data.
    pub fn callback_trigger(&self, bot_id: &str, data: &str) -> anyhow::Result<Option<Trigger>> {
        self.exact_trigger(bot_id, "callback", data)
    }

    fn exact_trigger(
        &self,
        bot_id: &str,
        kind: &str,
        value: &str,
    ) -> anyhow::Result<Option<Trigger>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .query_row(
                "SELECT id, bot_id, name, kind, value, match_mode, funnel_id, step_id, priority, is_active
                 FROM triggers
                 WHERE bot_id = ?1 AND kind = ?2 AND value = ?3 AND is_active = 1
                 LIMIT 1",
                params![bot_id, kind, value],
                row_to_trigger,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Active keyword/text triggers, highest priority first.
    pub fn keyword_triggers(&self, bot_id: &str) -> anyhow::Result<Vec<Trigger>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = guard.prepare(
            "SELECT id, bot_id, name, kind, value, match_mode, funnel_id, step_id, priority, is_active
             FROM triggers
             WHERE bot_id = ?1 AND kind IN ('keyword', 'text') AND is_active = 1
             ORDER BY priority DESC, rowid",
        )?;
        let rows = stmt.query_map(params![bot_id], row_to_trigger)?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?);
        }
        Ok(result)
    }

    // ── Users ────────────────────────────────────────────────────

    pub fn upsert_user(&self, user: &UserProfile) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute(
            "INSERT OR REPLACE INTO users (bot_id, telegram_id, profile) VALUES (?1, ?2, ?3)",
            params![user.bot_id, user.telegram_id, serde_json::to_string(user)?],
        )?;
        Ok(())
    }

    pub fn get_user(&self, bot_id: &str, telegram_id: i64) -> anyhow::Result<Option<UserProfile>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let profile: Option<String> = guard
            .query_row(
                "SELECT profile FROM users WHERE bot_id = ?1 AND telegram_id = ?2",
                params![bot_id, telegram_id],
                |r| r.get(0),
            )
            .optional()?;
        profile
            .map(|p| serde_json::from_str(&p).context("bad user profile json"))
            .transpose()
    }

    // ── User states ──────────────────────────────────────────────

    pub fn get_state(&self, bot_id: &str, user_id: i64) -> anyhow::Result<Option<UserState>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = guard
            .query_row(
                "SELECT bot_id, user_id, current_funnel_id, current_step_id, collected_data,
                        waiting_for, last_message_id, last_chat_id, context
                 FROM user_states WHERE bot_id = ?1 AND user_id = ?2",
                params![bot_id, user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<i64>>(6)?,
                        row.get::<_, Option<i64>>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            bot_id,
            user_id,
            current_funnel_id,
            current_step_id,
            collected,
            waiting,
            last_message_id,
            last_chat_id,
            context,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(UserState {
            bot_id,
            user_id,
            current_funnel_id,
            current_step_id,
            collected_data: json_map(&collected)?,
            waiting_for: WaitingFor::parse(&waiting),
            last_message_id,
            last_chat_id,
            context: json_map(&context)?,
        }))
    }

    pub fn save_state(&self, state: &UserState) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute(
            "INSERT OR REPLACE INTO user_states
                (bot_id, user_id, current_funnel_id, current_step_id, collected_data,
                 waiting_for, last_message_id, last_chat_id, context, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'))",
            params![
                state.bot_id,
                state.user_id,
                state.current_funnel_id,
                state.current_step_id,
                serde_json::to_string(&state.collected_data)?,
                state.waiting_for.as_str(),
                state.last_message_id,
                state.last_chat_id,
                serde_json::to_string(&state.context)?,
            ],
        )?;
        Ok(())
    }

    // ── Conversations ────────────────────────────────────────────

    /// The one active-or-handoff conversation for a (bot, user), if any.
    pub fn open_conversation(
        &self,
        bot_id: &str,
        user_id: i64,
    ) -> anyhow::Result<Option<Conversation>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .query_row(
                "SELECT id, bot_id, user_id, status, started_funnel_id, lead_id
                 FROM conversations
                 WHERE bot_id = ?1 AND user_id = ?2 AND status IN ('active', 'handoff')
                 ORDER BY started_at DESC LIMIT 1",
                params![bot_id, user_id],
                row_to_conversation,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn insert_conversation(&self, conversation: &Conversation) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute(
            "INSERT INTO conversations (id, bot_id, user_id, status, started_funnel_id, lead_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conversation.id,
                conversation.bot_id,
                conversation.user_id,
                conversation.status.as_str(),
                conversation.started_funnel_id,
                conversation.lead_id,
            ],
        )?;
        Ok(())
    }

    pub fn update_conversation(&self, conversation: &Conversation) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute(
            "UPDATE conversations
             SET status = ?2, started_funnel_id = ?3, lead_id = ?4
             WHERE id = ?1",
            params![
                conversation.id,
                conversation.status.as_str(),
                conversation.started_funnel_id,
                conversation.lead_id,
            ],
        )?;
        Ok(())
    }

    pub fn touch_conversation(&self, id: &str) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute(
            "UPDATE conversations SET last_message_at = datetime('now') WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    // ── Message audit log ────────────────────────────────────────

    pub fn log_message(&self, record: &MessageRecord) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute(
            "INSERT INTO messages
                (conversation_id, bot_id, user_id, telegram_message_id, chat_id,
                 direction, sender_type, content_type, content, keyboard, funnel_id, step_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.conversation_id,
                record.bot_id,
                record.user_id,
                record.telegram_message_id,
                record.chat_id,
                record.direction,
                record.sender_type,
                record.content_type,
                serde_json::to_string(&record.content)?,
                record
                    .keyboard
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                record.funnel_id,
                record.step_id,
            ],
        )?;
        Ok(())
    }

    /// Total logged messages for a user (the `interaction_count` field).
    pub fn message_count(&self, bot_id: &str, user_id: i64) -> anyhow::Result<i64> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count = guard.query_row(
            "SELECT COUNT(*) FROM messages WHERE bot_id = ?1 AND user_id = ?2",
            params![bot_id, user_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    // ── Leads ────────────────────────────────────────────────────

    pub fn insert_lead(&self, lead: &Lead) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute(
            "INSERT INTO leads (id, business_id, source_id, name, phone, email, status, notes, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                lead.id,
                lead.business_id,
                lead.source_id,
                lead.name,
                lead.phone,
                lead.email,
                lead.status,
                lead.notes,
                serde_json::to_string(&lead.data)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_lead(&self, id: &str) -> anyhow::Result<Option<Lead>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = guard
            .query_row(
                "SELECT id, business_id, source_id, name, phone, email, status, notes, data
                 FROM leads WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, business_id, source_id, name, phone, email, status, notes, data)) = row
        else {
            return Ok(None);
        };
        Ok(Some(Lead {
            id,
            business_id,
            source_id,
            name,
            phone,
            email,
            status,
            notes,
            data: json_map(&data)?,
        }))
    }

    pub fn lead_count(&self, business_id: &str) -> anyhow::Result<i64> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count = guard.query_row(
            "SELECT COUNT(*) FROM leads WHERE business_id = ?1",
            params![business_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    // ── Lead sources ─────────────────────────────────────────────

    pub fn lead_source_by_code(
        &self,
        business_id: &str,
        code: &str,
    ) -> anyhow::Result<Option<LeadSource>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .query_row(
                "SELECT id, business_id, code, name, category, is_active
                 FROM lead_sources WHERE business_id = ?1 AND code = ?2",
                params![business_id, code],
                row_to_lead_source,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn lead_source_by_name_like(
        &self,
        business_id: &str,
        pattern: &str,
    ) -> anyhow::Result<Option<LeadSource>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .query_row(
                "SELECT id, business_id, code, name, category, is_active
                 FROM lead_sources
                 WHERE business_id = ?1 AND name LIKE ?2 COLLATE NOCASE
                 LIMIT 1",
                params![business_id, pattern],
                row_to_lead_source,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Insert a lead source; a duplicate (business, code) surfaces as Err.
    pub fn insert_lead_source(&self, source: &LeadSource) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute(
            "INSERT INTO lead_sources (id, business_id, code, name, category, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                source.id,
                source.business_id,
                source.code,
                source.name,
                source.category,
                source.is_active,
            ],
        )?;
        Ok(())
    }

    // ── Daily stats ──────────────────────────────────────────────

    fn today() -> String {
        chrono::Utc::now().date_naive().to_string()
    }

    pub fn increment_daily(&self, bot_id: &str, counter: DailyCounter) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let column = counter.column();
        guard.execute(
            &format!(
                "INSERT INTO daily_stats (bot_id, date, {column}) VALUES (?1, ?2, 1)
                 ON CONFLICT (bot_id, date) DO UPDATE SET {column} = {column} + 1"
            ),
            params![bot_id, Self::today()],
        )?;
        Ok(())
    }

    pub fn increment_funnel_stat(
        &self,
        bot_id: &str,
        funnel_id: &str,
        counter: FunnelCounter,
    ) -> anyhow::Result<()> {
        self.bump_json_stat(bot_id, "funnel_stats", |stats| {
            let entry = stats
                .entry(funnel_id.to_string())
                .or_insert_with(|| Value::Object(JsonMap::new()));
            if let Value::Object(map) = entry {
                let count = map.get(counter.key()).and_then(Value::as_i64).unwrap_or(0);
                map.insert(counter.key().to_string(), Value::from(count + 1));
            }
        })
    }

    pub fn increment_trigger_stat(&self, bot_id: &str, trigger_id: &str) -> anyhow::Result<()> {
        self.bump_json_stat(bot_id, "trigger_stats", |stats| {
            let count = stats
                .get(trigger_id)
                .and_then(Value::as_i64)
                .unwrap_or(0);
            stats.insert(trigger_id.to_string(), Value::from(count + 1));
        })
    }

    fn bump_json_stat(
        &self,
        bot_id: &str,
        column: &str,
        mutate: impl FnOnce(&mut JsonMap),
    ) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let date = Self::today();
        guard.execute(
            "INSERT OR IGNORE INTO daily_stats (bot_id, date) VALUES (?1, ?2)",
            params![bot_id, date],
        )?;
        let raw: String = guard.query_row(
            &format!("SELECT {column} FROM daily_stats WHERE bot_id = ?1 AND date = ?2"),
            params![bot_id, date],
            |r| r.get(0),
        )?;
        let mut stats = json_map(&raw)?;
        mutate(&mut stats);
        guard.execute(
            &format!("UPDATE daily_stats SET {column} = ?3 WHERE bot_id = ?1 AND date = ?2"),
            params![bot_id, date, serde_json::to_string(&stats)?],
        )?;
        Ok(())
    }

    /// Today's counters for a bot; zeroes when no row exists yet.
    pub fn daily_stat(&self, bot_id: &str) -> anyhow::Result<DailyStatRow> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let date = Self::today();
        let row = guard
            .query_row(
                "SELECT messages_in, messages_out, conversations_started, leads_captured,
                        handoffs, funnel_stats, trigger_stats
                 FROM daily_stats WHERE bot_id = ?1 AND date = ?2",
                params![bot_id, date],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let (mi, mo, cs, lc, ho, fs, ts) =
            row.unwrap_or((0, 0, 0, 0, 0, "{}".into(), "{}".into()));
        Ok(DailyStatRow {
            bot_id: bot_id.to_string(),
            date,
            messages_in: mi,
            messages_out: mo,
            conversations_started: cs,
            leads_captured: lc,
            handoffs: ho,
            funnel_stats: serde_json::from_str(&fs)?,
            trigger_stats: serde_json::from_str(&ts)?,
        })
    }

    /// One funnel counter from today's stats.
    pub fn funnel_stat(
        &self,
        bot_id: &str,
        funnel_id: &str,
        counter: FunnelCounter,
    ) -> anyhow::Result<i64> {
        let stats = self.daily_stat(bot_id)?;
        Ok(stats.funnel_stats[funnel_id][counter.key()]
            .as_i64()
            .unwrap_or(0))
    }
}

// ── Row mappers ─────────────────────────────────────────────────

fn json_map(raw: &str) -> anyhow::Result<JsonMap> {
    serde_json::from_str(raw).context("bad json column")
}

fn match_mode_str(mode: MatchMode) -> &'static str {
    match mode {
        MatchMode::Exact => "exact",
        MatchMode::Contains => "contains",
        MatchMode::StartsWith => "starts_with",
        MatchMode::EndsWith => "ends_with",
        MatchMode::Regex => "regex",
    }
}

fn match_mode_parse(s: &str) -> MatchMode {
    match s {
        "exact" => MatchMode::Exact,
        "starts_with" => MatchMode::StartsWith,
        "ends_with" => MatchMode::EndsWith,
        "regex" => MatchMode::Regex,
        _ => MatchMode::Contains,
    }
}

fn row_to_funnel(row: &rusqlite::Row<'_>) -> rusqlite::Result<Funnel> {
    Ok(Funnel {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        name: row.get(2)?,
        is_active: row.get(3)?,
        first_step_id: row.get(4)?,
        completion_message: row.get(5)?,
    })
}

type StepParts = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn row_to_step_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn step_from_parts(parts: StepParts) -> anyhow::Result<Step> {
    let (id, funnel_id, name, config, input, next_step_id, action) = parts;
    let config: StepConfig = serde_json::from_str(&config).context("bad step config json")?;
    Ok(Step {
        id,
        funnel_id,
        name,
        config,
        input: input
            .map(|i| serde_json::from_str(&i).context("bad step input json"))
            .transpose()?,
        next_step_id,
        action: action
            .map(|a| serde_json::from_str(&a).context("bad step action json"))
            .transpose()?,
    })
}

fn row_to_lead_source(row: &rusqlite::Row<'_>) -> rusqlite::Result<LeadSource> {
    Ok(LeadSource {
        id: row.get(0)?,
        business_id: row.get(1)?,
        code: row.get(2)?,
        name: row.get(3)?,
        category: row.get(4)?,
        is_active: row.get(5)?,
    })
}

fn row_to_trigger(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trigger> {
    let kind: String = row.get(3)?;
    let mode: String = row.get(5)?;
    Ok(Trigger {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        name: row.get(2)?,
        kind: TriggerKind::from_str(&kind).unwrap_or(TriggerKind::Keyword),
        value: row.get(4)?,
        match_mode: match_mode_parse(&mode),
        funnel_id: row.get(6)?,
        step_id: row.get(7)?,
        priority: row.get(8)?,
        is_active: row.get(9)?,
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let status: String = row.get(3)?;
    Ok(Conversation {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        user_id: row.get(2)?,
        status: ConversationStatus::parse(&status),
        started_funnel_id: row.get(4)?,
        lead_id: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::types::*;

    fn sample_step(id: &str) -> Step {
        Step {
            id: id.into(),
            funnel_id: "f1".into(),
            name: id.into(),
            config: StepConfig::Content(ContentConfig::text("Hello {first_name}")),
            input: Some(InputSpec::new(InputKind::Text)),
            next_step_id: Some("s2".into()),
            action: None,
        }
    }

    #[test]
    fn bot_settings_roundtrip() {
        let db = FunnelDb::open_in_memory().unwrap();
        let mut bot = BotSettings::new("bot1", "biz1", "token");
        bot.default_funnel_id = Some("f1".into());
        db.upsert_bot(&bot).unwrap();
        let loaded = db.get_bot("bot1").unwrap().unwrap();
        assert_eq!(loaded.default_funnel_id.as_deref(), Some("f1"));
        assert!(db.get_bot("missing").unwrap().is_none());
    }

    #[test]
    fn step_config_json_column_roundtrip() {
        let db = FunnelDb::open_in_memory().unwrap();
        let step = sample_step("s1");
        db.insert_step(&step).unwrap();
        let loaded = db.get_step("s1").unwrap().unwrap();
        assert!(matches!(loaded.config, StepConfig::Content(_)));
        assert_eq!(loaded.next_step_id.as_deref(), Some("s2"));
        assert_eq!(
            loaded.input.unwrap().kind,
            InputKind::Text
        );
    }

    #[test]
    fn trigger_keyword_steps_filtered_by_type() {
        let db = FunnelDb::open_in_memory().unwrap();
        db.insert_step(&sample_step("s1")).unwrap();
        let mut marker = sample_step("kw");
        marker.config = StepConfig::TriggerKeyword(KeywordSpec {
            all_messages: false,
            keywords: "price".into(),
            match_mode: MatchMode::Contains,
        });
        db.insert_step(&marker).unwrap();

        let markers = db.trigger_keyword_steps("f1").unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].id, "kw");
    }

    #[test]
    fn keyword_triggers_ordered_by_priority() {
        let db = FunnelDb::open_in_memory().unwrap();
        for (id, priority) in [("low", 1), ("high", 9), ("mid", 5)] {
            db.insert_trigger(&Trigger {
                id: id.into(),
                bot_id: "bot1".into(),
                name: id.into(),
                kind: TriggerKind::Keyword,
                value: "hello".into(),
                match_mode: MatchMode::Contains,
                funnel_id: None,
                step_id: None,
                priority,
                is_active: true,
            })
            .unwrap();
        }
        let triggers = db.keyword_triggers("bot1").unwrap();
        let ids: Vec<&str> = triggers.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[test]
    fn exact_trigger_lookup_respects_active_flag() {
        let db = FunnelDb::open_in_memory().unwrap();
        db.insert_trigger(&Trigger {
            id: "t1".into(),
            bot_id: "bot1".into(),
            name: "start".into(),
            kind: TriggerKind::Command,
            value: "/promo".into(),
            match_mode: MatchMode::Exact,
            funnel_id: Some("f1".into()),
            step_id: None,
            priority: 0,
            is_active: false,
        })
        .unwrap();
        assert!(db.command_trigger("bot1", "/promo").unwrap().is_none());
    }

    #[test]
    fn user_state_roundtrip() {
        let db = FunnelDb::open_in_memory().unwrap();
        let mut state = UserState::idle("bot1", 42);
        state.current_funnel_id = Some("f1".into());
        state.current_step_id = Some("s1".into());
        state
            .collected_data
            .insert("email".into(), Value::String("a@b.co".into()));
        state.waiting_for = WaitingFor::Input(InputKind::Email);
        state.last_message_id = Some(99);
        db.save_state(&state).unwrap();

        let loaded = db.get_state("bot1", 42).unwrap().unwrap();
        assert_eq!(loaded.current_step_id.as_deref(), Some("s1"));
        assert_eq!(loaded.waiting_for, WaitingFor::Input(InputKind::Email));
        assert_eq!(loaded.collected_data["email"], "a@b.co");
        assert_eq!(loaded.last_message_id, Some(99));
        assert!(db.get_state("bot1", 43).unwrap().is_none());
    }

    #[test]
    fn open_conversation_excludes_closed() {
        let db = FunnelDb::open_in_memory().unwrap();
        let mut conversation = Conversation {
            id: "c1".into(),
            bot_id: "bot1".into(),
            user_id: 42,
            status: ConversationStatus::Active,
            started_funnel_id: None,
            lead_id: None,
        };
        db.insert_conversation(&conversation).unwrap();
        assert!(db.open_conversation("bot1", 42).unwrap().is_some());

        conversation.status = ConversationStatus::Closed;
        db.update_conversation(&conversation).unwrap();
        assert!(db.open_conversation("bot1", 42).unwrap().is_none());
    }

    #[test]
    fn message_log_and_interaction_count() {
        let db = FunnelDb::open_in_memory().unwrap();
        for i in 0..3 {
            db.log_message(&MessageRecord {
                conversation_id: "c1".into(),
                bot_id: "bot1".into(),
                user_id: 42,
                telegram_message_id: Some(i),
                chat_id: 42,
                direction: "incoming".into(),
                sender_type: "user".into(),
                content_type: "text".into(),
                content: serde_json::json!({"text": "hi"}),
                keyboard: None,
                funnel_id: None,
                step_id: None,
            })
            .unwrap();
        }
        assert_eq!(db.message_count("bot1", 42).unwrap(), 3);
        assert_eq!(db.message_count("bot1", 7).unwrap(), 0);
    }

    #[test]
    fn lead_source_unique_code_conflicts() {
        let db = FunnelDb::open_in_memory().unwrap();
        let source = LeadSource {
            id: "ls1".into(),
            business_id: "biz1".into(),
            code: "telegram_bot".into(),
            name: "Telegram Bot".into(),
            category: "digital".into(),
            is_active: true,
        };
        db.insert_lead_source(&source).unwrap();
        let mut dup = source.clone();
        dup.id = "ls2".into();
        assert!(db.insert_lead_source(&dup).is_err());

        let found = db
            .lead_source_by_code("biz1", "telegram_bot")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "ls1");
        let by_name = db
            .lead_source_by_name_like("biz1", "%telegram%")
            .unwrap()
            .unwrap();
        assert_eq!(by_name.id, "ls1");
    }

    #[test]
    fn daily_counters_accumulate() {
        let db = FunnelDb::open_in_memory().unwrap();
        db.increment_daily("bot1", DailyCounter::MessagesIn).unwrap();
        db.increment_daily("bot1", DailyCounter::MessagesIn).unwrap();
        db.increment_daily("bot1", DailyCounter::Handoffs).unwrap();
        let stats = db.daily_stat("bot1").unwrap();
        assert_eq!(stats.messages_in, 2);
        assert_eq!(stats.handoffs, 1);
        assert_eq!(stats.messages_out, 0);
    }

    #[test]
    fn funnel_and_trigger_stats_accumulate() {
        let db = FunnelDb::open_in_memory().unwrap();
        db.increment_funnel_stat("bot1", "f1", FunnelCounter::Started)
            .unwrap();
        db.increment_funnel_stat("bot1", "f1", FunnelCounter::Started)
            .unwrap();
        db.increment_funnel_stat("bot1", "f1", FunnelCounter::Completed)
            .unwrap();
        db.increment_trigger_stat("bot1", "t1").unwrap();

        assert_eq!(
            db.funnel_stat("bot1", "f1", FunnelCounter::Started).unwrap(),
            2
        );
        assert_eq!(
            db.funnel_stat("bot1", "f1", FunnelCounter::Completed)
                .unwrap(),
            1
        );
        let stats = db.daily_stat("bot1").unwrap();
        assert_eq!(stats.trigger_stats["t1"], 1);
    }

    #[test]
    fn insert_funnel_graph_rejects_invalid() {
        let db = FunnelDb::open_in_memory().unwrap();
        let funnel = Funnel {
            id: "f1".into(),
            bot_id: "bot1".into(),
            name: "broken".into(),
            is_active: true,
            first_step_id: Some("ghost".into()),
            completion_message: None,
        };
        let err = db.insert_funnel_graph(&funnel, &[]).unwrap_err();
        assert!(err.to_string().contains("entry step"));
    }

    #[test]
    fn active_funnels_in_insertion_order() {
        let db = FunnelDb::open_in_memory().unwrap();
        for (id, active) in [("f1", true), ("f2", false), ("f3", true)] {
            db.insert_funnel(&Funnel {
                id: id.into(),
                bot_id: "bot1".into(),
                name: id.into(),
                is_active: active,
                first_step_id: None,
                completion_message: None,
            })
            .unwrap();
        }
        let active = db.active_funnels("bot1").unwrap();
        let ids: Vec<&str> = active.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["f1", "f3"]);
        assert_eq!(db.first_active_funnel("bot1").unwrap().unwrap().id, "f1");
    }
}
