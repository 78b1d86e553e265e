//! Conversation ledger: the durable record of conversations, messages, usage
//! events and error records.
//!
//! The [`Ledger`] trait is the seam the services depend on; [`SqliteLedger`]
//! is the production implementation.  Every call is async so that request
//! tasks never block a runtime worker on SQLite.  Timestamps are RFC 3339 UTC strings
//! with millisecond precision (see [`crate::util::format_ts`]).

mod schema;
mod sqlite;

pub use sqlite::SqliteLedger;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::upstream::Source;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The background connection thread failed or has shut down.
    #[error("database connection: {0}")]
    Connection(String),
    #[error("stored json is invalid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown {field} value '{value}'")]
    Corrupt { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub(crate) fn parse(raw: &str) -> Result<Self, LedgerError> {
        match raw {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(LedgerError::Corrupt {
                field: "role",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
        }
    }

    pub(crate) fn parse(raw: &str) -> Result<Self, LedgerError> {
        match raw {
            "active" => Ok(ConversationStatus::Active),
            "archived" => Ok(ConversationStatus::Archived),
            other => Err(LedgerError::Corrupt {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: i64,
    pub external_id: String,
    pub actor_id: Option<u64>,
    pub started_at: String,
    pub last_message_at: String,
    pub message_count: u64,
    pub status: ConversationStatus,
}

/// A message about to be written.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub conversation_id: Option<i64>,
    pub actor_id: Option<u64>,
    pub role: Role,
    pub content: &'a str,
    pub sources: &'a [Source],
    /// Upstream latency, assistant messages only.
    pub response_time_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub conversation_id: Option<i64>,
    pub actor_id: Option<u64>,
    pub role: Role,
    pub content: String,
    pub sources: Vec<Source>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct UsageEvent {
    pub actor_id: Option<u64>,
    pub action: String,
    pub metadata: serde_json::Value,
    pub page_url: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ErrorRecord {
    pub category: String,
    pub message: String,
    pub trace: Option<String>,
    pub context: Option<serde_json::Value>,
    pub actor_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub usage_deleted: u64,
    pub errors_deleted: u64,
    pub conversations_archived: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub total_conversations: u64,
    pub total_messages: u64,
    pub unique_users: u64,
    pub avg_messages_per_conversation: f64,
    pub avg_response_time_ms: f64,
}

/// Persisted upstream credential.  `access_key` and `secret_key` hold codec
/// blobs, never plaintext.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StoredCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub application_id: String,
}

impl std::fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("region", &self.region)
            .field("application_id", &self.application_id)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    /// Create a conversation for an upstream id and return its local id.
    async fn log_conversation(&self, external_id: &str, actor_id: Option<u64>) -> Result<i64, LedgerError>;

    async fn get_conversation(&self, external_id: &str) -> Result<Option<Conversation>, LedgerError>;

    /// Insert a message and, when linked, bump the conversation's
    /// `last_message_at` and `message_count` in the same transaction.
    async fn log_message(&self, message: &NewMessage<'_>) -> Result<i64, LedgerError>;

    /// Messages of one conversation, oldest first.
    async fn conversation_messages(&self, conversation_id: i64) -> Result<Vec<Message>, LedgerError>;

    /// Number of `user` messages written by `actor_id` at or after `since`.
    /// `None` counts anonymous messages.
    async fn count_user_messages_since(
        &self,
        actor_id: Option<u64>,
        since: DateTime<Utc>,
    ) -> Result<u64, LedgerError>;

    async fn log_usage(&self, event: &UsageEvent) -> Result<i64, LedgerError>;

    async fn log_error(&self, record: &ErrorRecord) -> Result<i64, LedgerError>;

    /// Returns false when no such error exists.
    async fn resolve_error(&self, id: i64) -> Result<bool, LedgerError>;

    /// Retention sweep.  Deletes usage events and resolved errors older
    /// than the window and archives inactive conversations.  Conversations
    /// and messages are never deleted.
    async fn cleanup(&self, retention_days: u32) -> Result<CleanupReport, LedgerError>;

    async fn analytics(&self, since: DateTime<Utc>) -> Result<UsageSummary, LedgerError>;

    async fn load_credentials(&self) -> Result<Option<StoredCredentials>, LedgerError>;

    async fn store_credentials(&self, credentials: &StoredCredentials) -> Result<(), LedgerError>;
}
