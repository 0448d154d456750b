use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use crate::models::{
    Conversation, Credits, Message, NewMessage, Role, StoredFile, User,
};

const FREE_PLAN: &str = "free";

/// Owner and expiry of an upload ticket.
#[derive(Debug, Clone)]
pub struct UploadTicket {
    pub id: String,
    pub owner_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed precision keeps lexical order equal to time order.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Bad timestamp in database: {}", raw))?
        .with_timezone(&Utc))
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        tracing::info!(path = %path.display(), "database ready");
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| anyhow!("database connection mutex poisoned"))?;
            f(&mut *conn)
        })
        .await
        .context("database task panicked")?
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            );",
        )?;

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .context("Failed to read schema version")?;

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE users (
                    id TEXT PRIMARY KEY,
                    email TEXT,
                    name TEXT,
                    plan TEXT NOT NULL DEFAULT 'free',
                    standard_credits INTEGER NOT NULL DEFAULT 0,
                    premium_credits INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE conversations (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    pinned INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    FOREIGN KEY (owner_id) REFERENCES users(id)
                );

                CREATE TABLE files (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    mime_type TEXT NOT NULL,
                    data BLOB NOT NULL,
                    size INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE messages (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    conversation_id TEXT NOT NULL,
                    author TEXT NOT NULL,
                    text TEXT,
                    attachment_id TEXT,
                    model TEXT,
                    is_error INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    CHECK ((text IS NOT NULL AND length(trim(text)) > 0) OR attachment_id IS NOT NULL),
                    FOREIGN KEY (conversation_id) REFERENCES conversations(id),
                    FOREIGN KEY (attachment_id) REFERENCES files(id)
                );

                CREATE INDEX idx_conversations_owner ON conversations(owner_id, created_at DESC);
                CREATE INDEX idx_messages_conversation ON messages(conversation_id, seq);

                INSERT INTO schema_version (version) VALUES (1);",
            )?;
        }

        if version < 2 {
            conn.execute_batch(
                "CREATE TABLE upload_tickets (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    expires_at TEXT NOT NULL
                );

                CREATE TABLE user_preferences (
                    user_id TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    FOREIGN KEY (user_id) REFERENCES users(id)
                );

                UPDATE schema_version SET version = 2;",
            )?;
        }

        Ok(())
    }

    // --- Users ---

    /// Insert the user on first sight; refresh email/name when they are given.
    pub async fn upsert_user(
        &self,
        id: &str,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<User> {
        let id = id.to_string();
        let email = email.map(str::to_string);
        let name = name.map(str::to_string);
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO users (id, email, name, plan, standard_credits, premium_credits, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    email = COALESCE(excluded.email, users.email),
                    name = COALESCE(excluded.name, users.name)",
                params![
                    id,
                    email,
                    name,
                    FREE_PLAN,
                    Credits::FREE_PLAN.standard,
                    Credits::FREE_PLAN.premium,
                    timestamp(Utc::now())
                ],
            )?;
            Self::query_user(conn, &id)?.ok_or_else(|| anyhow!("user {} vanished after upsert", id))
        })
        .await
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let id = id.to_string();
        self.run(move |conn| Self::query_user(conn, &id)).await
    }

    fn query_user(conn: &Connection, id: &str) -> Result<Option<User>> {
        let row = conn
            .query_row(
                "SELECT id, email, name, plan, standard_credits, premium_credits, created_at
                 FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, email, name, plan, standard, premium, created)| -> Result<User> {
            Ok(User {
                id,
                email,
                name,
                plan,
                credits: Credits { standard, premium },
                created_at: parse_timestamp(&created)?,
            })
        })
        .transpose()
    }

    // --- Conversations ---

    pub async fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conv = conversation.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO conversations (id, owner_id, name, pinned, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    conv.id,
                    conv.owner_id,
                    conv.name,
                    conv.pinned as i32,
                    timestamp(conv.created_at),
                    timestamp(conv.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let id = id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, name, pinned, created_at, updated_at
                 FROM conversations WHERE id = ?1",
            )?;
            let result = stmt
                .query_row(params![id], |row| Ok(Self::row_to_conversation(row)))
                .optional()?;
            result.transpose()
        })
        .await
    }

    /// Newest first.
    pub async fn list_conversations(&self, owner_id: &str) -> Result<Vec<Conversation>> {
        let owner_id = owner_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, name, pinned, created_at, updated_at
                 FROM conversations WHERE owner_id = ?1
                 ORDER BY created_at DESC, rowid DESC",
            )?;
            let conversations = stmt
                .query_map(params![owner_id], |row| Ok(Self::row_to_conversation(row)))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(conversations)
        })
        .await
    }

    /// Returns false when no such conversation exists.
    pub async fn rename_conversation(&self, id: &str, name: &str) -> Result<bool> {
        let id = id.to_string();
        let name = name.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE conversations SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, timestamp(Utc::now()), id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn set_conversation_pinned(&self, id: &str, pinned: bool) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE conversations SET pinned = ?1 WHERE id = ?2",
                params![pinned as i32, id],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete the messages and then the conversation in one transaction.
    /// Returns the number of messages removed.
    pub async fn delete_conversation(&self, id: &str) -> Result<usize> {
        let id = id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])?;
            tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    // --- Messages ---

    pub async fn insert_message(
        &self,
        conversation_id: &str,
        author: Role,
        message: NewMessage,
    ) -> Result<Message> {
        let now = Utc::now();
        let stored = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            author,
            text: message.text,
            attachment_id: message.attachment_id,
            model: message.model,
            is_error: message.is_error,
            created_at: now,
        };

        let msg = stored.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (id, conversation_id, author, text, attachment_id, model, is_error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    msg.id,
                    msg.conversation_id,
                    msg.author.as_str(),
                    msg.text,
                    msg.attachment_id,
                    msg.model,
                    msg.is_error as i32,
                    timestamp(msg.created_at),
                ],
            )?;
            tx.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![timestamp(msg.created_at), msg.conversation_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        Ok(stored)
    }

    /// All messages of a conversation in insertion order.
    pub async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.query_messages(conversation_id, None).await
    }

    /// The newest `limit` messages, still in insertion order.
    pub async fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        self.query_messages(conversation_id, Some(limit)).await
    }

    async fn query_messages(&self, conversation_id: &str, limit: Option<usize>) -> Result<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        // -1 means no limit to SQLite.
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, author, text, attachment_id, model, is_error, created_at FROM (
                    SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY seq DESC LIMIT ?2
                 ) ORDER BY seq ASC",
            )?;
            let messages = stmt
                .query_map(params![conversation_id, limit], |row| Ok(Self::row_to_message(row)))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await
    }

    #[cfg(test)]
    pub async fn count_messages(&self, conversation_id: &str) -> Result<i64> {
        let conversation_id = conversation_id.to_string();
        self.run(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    // --- Files ---

    pub async fn insert_file(&self, file: &StoredFile) -> Result<()> {
        let file = file.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO files (id, owner_id, mime_type, data, size, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    file.id,
                    file.owner_id,
                    file.mime_type,
                    file.data,
                    file.size,
                    timestamp(file.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_file(&self, id: &str) -> Result<Option<StoredFile>> {
        let id = id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, mime_type, data, size, created_at FROM files WHERE id = ?1",
            )?;
            let result = stmt
                .query_row(params![id], |row| Ok(Self::row_to_file(row)))
                .optional()?;
            result.transpose()
        })
        .await
    }

    // --- Upload tickets ---

    pub async fn insert_upload_ticket(&self, ticket: &UploadTicket) -> Result<()> {
        let ticket = ticket.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO upload_tickets (id, owner_id, expires_at) VALUES (?1, ?2, ?3)",
                params![ticket.id, ticket.owner_id, timestamp(ticket.expires_at)],
            )?;
            Ok(())
        })
        .await
    }

    /// Remove a ticket and return it. Each ticket can be taken once.
    pub async fn take_upload_ticket(&self, id: &str) -> Result<Option<UploadTicket>> {
        let id = id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let row = tx
                .query_row(
                    "SELECT id, owner_id, expires_at FROM upload_tickets WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;
            tx.execute("DELETE FROM upload_tickets WHERE id = ?1", params![id])?;
            tx.commit()?;

            row.map(|(id, owner_id, expires)| -> Result<UploadTicket> {
                Ok(UploadTicket {
                    id,
                    owner_id,
                    expires_at: parse_timestamp(&expires)?,
                })
            })
            .transpose()
        })
        .await
    }

    pub async fn purge_expired_tickets(&self, now: DateTime<Utc>) -> Result<usize> {
        self.run(move |conn| {
            let removed = conn.execute(
                "DELETE FROM upload_tickets WHERE expires_at <= ?1",
                params![timestamp(now)],
            )?;
            Ok(removed)
        })
        .await
    }

    // --- Preferences ---

    pub async fn get_preferences(&self, user_id: &str) -> Result<Option<String>> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let result: Option<String> = conn
                .query_row(
                    "SELECT value FROM user_preferences WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(result)
        })
        .await
    }

    pub async fn set_preferences(&self, user_id: &str, value: &str) -> Result<()> {
        let user_id = user_id.to_string();
        let value = value.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO user_preferences (user_id, value) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET value = ?2",
                params![user_id, value],
            )?;
            Ok(())
        })
        .await
    }

    // --- Row helpers ---

    fn row_to_conversation(row: &rusqlite::Row) -> Result<Conversation> {
        let pinned_int: i32 = row.get(3)?;
        let created_str: String = row.get(4)?;
        let updated_str: String = row.get(5)?;

        Ok(Conversation {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            pinned: pinned_int != 0,
            created_at: parse_timestamp(&created_str)?,
            updated_at: parse_timestamp(&updated_str)?,
        })
    }

    fn row_to_message(row: &rusqlite::Row) -> Result<Message> {
        let author_str: String = row.get(2)?;
        let is_error_int: i32 = row.get(6)?;
        let created_str: String = row.get(7)?;

        Ok(Message {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            author: Role::from_str(&author_str)
                .ok_or_else(|| anyhow!("Unknown author: {}", author_str))?,
            text: row.get(3)?,
            attachment_id: row.get(4)?,
            model: row.get(5)?,
            is_error: is_error_int != 0,
            created_at: parse_timestamp(&created_str)?,
        })
    }

    fn row_to_file(row: &rusqlite::Row) -> Result<StoredFile> {
        let created_str: String = row.get(5)?;

        Ok(StoredFile {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            mime_type: row.get(2)?,
            data: row.get(3)?,
            size: row.get(4)?,
            created_at: parse_timestamp(&created_str)?,
        })
    }
}
