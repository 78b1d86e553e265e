use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::schema;
use super::{
    CleanupReport, Conversation, ConversationStatus, ErrorRecord, Ledger, LedgerError, Message,
    NewMessage, Role, StoredCredentials, UsageEvent, UsageSummary,
};
use crate::upstream::Source;
use crate::util::{format_ts, Clock};

const CREDENTIAL_KEYS: [&str; 4] = ["access_key", "secret_key", "region", "application_id"];

/// SQLite ledger.  All statements run on the tokio-rusqlite background
/// thread; every call is a short single statement or the two-statement
/// message transaction.
pub struct SqliteLedger {
    conn: tokio_rusqlite::Connection,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger").finish_non_exhaustive()
    }
}

fn to_db_id(id: Option<u64>) -> Option<i64> {
    id.map(|v| v as i64)
}

fn from_db_id(id: Option<i64>) -> Option<u64> {
    id.map(|v| v as u64)
}

fn connection_error(err: impl std::fmt::Display) -> LedgerError {
    LedgerError::Connection(err.to_string())
}

impl SqliteLedger {
    /// Open (or create) the database file, switch it to WAL and run the
    /// schema migration.
    pub async fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, LedgerError> {
        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(connection_error)?;
        conn.call(|conn| -> rusqlite::Result<()> {
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
            Ok(())
        })
        .await
        .map_err(connection_error)?;
        Self::from_connection(conn, clock).await
    }

    pub async fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, LedgerError> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(connection_error)?;
        Self::from_connection(conn, clock).await
    }

    async fn from_connection(conn: tokio_rusqlite::Connection, clock: Arc<dyn Clock>) -> Result<Self, LedgerError> {
        conn.call(|conn| -> rusqlite::Result<()> {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            schema::migrate(conn)
        })
        .await
        .map_err(connection_error)?;
        Ok(Self { conn, clock })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn.call(f).await.map_err(connection_error)
    }

    fn now(&self) -> String {
        format_ts(self.clock.now())
    }

    fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<(Conversation, String)> {
        let status: String = row.get(6)?;
        let count: i64 = row.get(5)?;
        Ok((
            Conversation {
                id: row.get(0)?,
                external_id: row.get(1)?,
                actor_id: from_db_id(row.get(2)?),
                started_at: row.get(3)?,
                last_message_at: row.get(4)?,
                message_count: count.max(0) as u64,
                status: ConversationStatus::Active,
            },
            status,
        ))
    }
}

struct MessageRow {
    id: i64,
    conversation_id: Option<i64>,
    actor_id: Option<i64>,
    role: String,
    content: String,
    sources: Option<String>,
    created_at: String,
    response_time_ms: Option<i64>,
}

impl MessageRow {
    fn into_message(self) -> Result<Message, LedgerError> {
        let sources: Vec<Source> = match self.sources.as_deref() {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => Vec::new(),
        };
        Ok(Message {
            id: self.id,
            conversation_id: self.conversation_id,
            actor_id: from_db_id(self.actor_id),
            role: Role::parse(&self.role)?,
            content: self.content,
            sources,
            created_at: self.created_at,
            response_time_ms: self.response_time_ms.map(|v| v.max(0) as u64),
        })
    }
}

#[async_trait::async_trait]
impl Ledger for SqliteLedger {
    async fn log_conversation(&self, external_id: &str, actor_id: Option<u64>) -> Result<i64, LedgerError> {
        let now = self.now();
        let external_id = external_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO conversations (external_id, actor_id, started_at, last_message_at, message_count, status)
                 VALUES (?1, ?2, ?3, ?3, 0, 'active')",
                params![external_id, to_db_id(actor_id), now],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn get_conversation(&self, external_id: &str) -> Result<Option<Conversation>, LedgerError> {
        let external_id = external_id.to_string();
        let found = self
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, external_id, actor_id, started_at, last_message_at, message_count, status
                     FROM conversations WHERE external_id = ?1
                     ORDER BY id DESC LIMIT 1",
                    params![external_id],
                    Self::conversation_from_row,
                )
                .optional()
            })
            .await?;
        match found {
            Some((mut conversation, status)) => {
                conversation.status = ConversationStatus::parse(&status)?;
                Ok(Some(conversation))
            }
            None => Ok(None),
        }
    }

    async fn log_message(&self, message: &NewMessage<'_>) -> Result<i64, LedgerError> {
        let now = self.now();
        let sources = if message.sources.is_empty() {
            None
        } else {
            Some(serde_json::to_string(message.sources)?)
        };
        let conversation_id = message.conversation_id;
        let actor_id = to_db_id(message.actor_id);
        let role = message.role.as_str();
        let content = message.content.to_string();
        let response_time_ms = message.response_time_ms.map(|v| v as i64);
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (conversation_id, actor_id, role, content, sources, created_at, response_time_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![conversation_id, actor_id, role, content, sources, now, response_time_ms],
            )?;
            let id = tx.last_insert_rowid();
            if let Some(conversation_id) = conversation_id {
                tx.execute(
                    "UPDATE conversations
                     SET last_message_at = ?1, message_count = message_count + 1
                     WHERE id = ?2",
                    params![now, conversation_id],
                )?;
            }
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn conversation_messages(&self, conversation_id: i64) -> Result<Vec<Message>, LedgerError> {
        let rows = self
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, conversation_id, actor_id, role, content, sources, created_at, response_time_ms
                     FROM messages WHERE conversation_id = ?1
                     ORDER BY created_at ASC, id ASC",
                )?;
                let rows = stmt.query_map(params![conversation_id], |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        actor_id: row.get(2)?,
                        role: row.get(3)?,
                        content: row.get(4)?,
                        sources: row.get(5)?,
                        created_at: row.get(6)?,
                        response_time_ms: row.get(7)?,
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    async fn count_user_messages_since(
        &self,
        actor_id: Option<u64>,
        since: DateTime<Utc>,
    ) -> Result<u64, LedgerError> {
        let since = format_ts(since);
        let count: i64 = self
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM messages
                     WHERE actor_id IS ?1 AND role = 'user' AND created_at >= ?2",
                    params![to_db_id(actor_id), since],
                    |row| row.get(0),
                )
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn log_usage(&self, event: &UsageEvent) -> Result<i64, LedgerError> {
        let now = self.now();
        let metadata = if event.metadata.is_null() {
            None
        } else {
            Some(event.metadata.to_string())
        };
        let event = event.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO usage_events (actor_id, action, metadata, page_url, ip_address, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    to_db_id(event.actor_id),
                    event.action,
                    metadata,
                    event.page_url,
                    event.ip_address,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn log_error(&self, record: &ErrorRecord) -> Result<i64, LedgerError> {
        let now = self.now();
        let context = record.context.as_ref().map(|c| c.to_string());
        let record = record.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO error_records (category, message, trace, context, actor_id, created_at, resolved)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![
                    record.category,
                    record.message,
                    record.trace,
                    context,
                    to_db_id(record.actor_id),
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn resolve_error(&self, id: i64) -> Result<bool, LedgerError> {
        let changed = self
            .call(move |conn| {
                conn.execute(
                    "UPDATE error_records SET resolved = 1 WHERE id = ?1",
                    params![id],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    async fn cleanup(&self, retention_days: u32) -> Result<CleanupReport, LedgerError> {
        let cutoff = format_ts(self.clock.now() - Duration::days(i64::from(retention_days)));
        self.call(move |conn| {
            let usage_deleted = conn.execute(
                "DELETE FROM usage_events WHERE created_at < ?1",
                params![cutoff],
            )?;
            let errors_deleted = conn.execute(
                "DELETE FROM error_records WHERE created_at < ?1 AND resolved = 1",
                params![cutoff],
            )?;
            let conversations_archived = conn.execute(
                "UPDATE conversations SET status = 'archived'
                 WHERE last_message_at < ?1 AND status = 'active'",
                params![cutoff],
            )?;
            Ok(CleanupReport {
                usage_deleted: usage_deleted as u64,
                errors_deleted: errors_deleted as u64,
                conversations_archived: conversations_archived as u64,
            })
        })
        .await
    }

    async fn analytics(&self, since: DateTime<Utc>) -> Result<UsageSummary, LedgerError> {
        let since = format_ts(since);
        self.call(move |conn| {
            let (total_conversations, unique_users, avg_messages): (i64, i64, Option<f64>) = conn
                .query_row(
                    "SELECT COUNT(*), COUNT(DISTINCT actor_id), AVG(message_count)
                     FROM conversations WHERE started_at >= ?1",
                    params![since],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
            let total_messages: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE created_at >= ?1",
                params![since],
                |row| row.get(0),
            )?;
            let avg_latency: Option<f64> = conn.query_row(
                "SELECT AVG(response_time_ms) FROM messages
                 WHERE created_at >= ?1 AND role = 'assistant'",
                params![since],
                |row| row.get(0),
            )?;
            Ok(UsageSummary {
                total_conversations: total_conversations.max(0) as u64,
                total_messages: total_messages.max(0) as u64,
                unique_users: unique_users.max(0) as u64,
                avg_messages_per_conversation: (avg_messages.unwrap_or(0.0) * 100.0).round() / 100.0,
                avg_response_time_ms: avg_latency.unwrap_or(0.0).round(),
            })
        })
        .await
    }

    async fn load_credentials(&self) -> Result<Option<StoredCredentials>, LedgerError> {
        self.call(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
            let mut creds = StoredCredentials::default();
            let mut seen = false;
            for row in rows {
                let (key, value) = row?;
                let slot = match key.as_str() {
                    "access_key" => &mut creds.access_key,
                    "secret_key" => &mut creds.secret_key,
                    "region" => &mut creds.region,
                    "application_id" => &mut creds.application_id,
                    _ => continue,
                };
                *slot = value;
                seen = true;
            }
            Ok(seen.then_some(creds))
        })
        .await
    }

    async fn store_credentials(&self, credentials: &StoredCredentials) -> Result<(), LedgerError> {
        let values = [
            credentials.access_key.clone(),
            credentials.secret_key.clone(),
            credentials.region.clone(),
            credentials.application_id.clone(),
        ];
        self.call(move |conn| {
            let tx = conn.transaction()?;
            for (key, value) in CREDENTIAL_KEYS.iter().zip(values) {
                tx.execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )?;
            }
            tx.commit()
        })
        .await
    }
}
