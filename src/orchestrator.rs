//! The chat request lifecycle and the other caller-facing operations.
//!
//! `send_message` runs: access check, rate check, validation, upstream call,
//! persistence, rate record, usage event.  The three gates short-circuit
//! without touching the ledger or the upstream.  Once the upstream has
//! answered, bookkeeping failures are logged and the reply is still
//! returned.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::GatewayError;
use crate::ledger::{
    CleanupReport, ErrorRecord, Ledger, NewMessage, Role, StoredCredentials, UsageEvent, UsageSummary,
};
use crate::security::access::{AccessDecision, AccessEvaluator, Actor, PageContext};
use crate::security::codec::SecretCodec;
use crate::security::rate_limit::{RateLimitStatus, RateLimiter};
use crate::security::validator;
use crate::upstream::{check_key_format, ChatBackend, ChatReply, ConnectionReport, HistoryMessage, Source};
use crate::util::Clock;

pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Who is asking and from where.  Supplied by the host application.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caller {
    #[serde(default)]
    pub actor: Option<Actor>,
    #[serde(default)]
    pub page: Option<PageContext>,
    /// Filled from the connection, never from the body.
    #[serde(skip)]
    pub ip: Option<String>,
}

impl Caller {
    pub fn actor_id(&self) -> Option<u64> {
        self.actor.as_ref().map(|a| a.id)
    }

    fn page_url(&self) -> Option<String> {
        self.page.as_ref().and_then(|p| p.url.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySource {
    /// Messages recorded by this service.
    #[default]
    Local,
    /// The upstream transcript.
    Upstream,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum AnalyticsPeriod {
    #[serde(rename = "7days")]
    Week,
    #[default]
    #[serde(rename = "30days")]
    Month,
    #[serde(rename = "90days")]
    Quarter,
}

impl AnalyticsPeriod {
    fn days(self) -> i64 {
        match self {
            AnalyticsPeriod::Week => 7,
            AnalyticsPeriod::Month => 30,
            AnalyticsPeriod::Quarter => 90,
        }
    }
}

/// Credential form as submitted by an administrator.  Fields containing the
/// `****` display mask, or left empty, keep their stored value.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CredentialsInput {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub application_id: String,
}

impl std::fmt::Debug for CredentialsInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsInput")
            .field("region", &self.region)
            .field("application_id", &self.application_id)
            .finish_non_exhaustive()
    }
}

fn submitted(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.is_empty() || value.contains("****") {
        None
    } else {
        Some(value)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
    pub sources: Vec<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

impl From<HistoryMessage> for HistoryEntry {
    fn from(m: HistoryMessage) -> Self {
        Self {
            role: m.role,
            content: m.content,
            sources: m.sources,
            time: m.time,
        }
    }
}

pub struct ChatService {
    access: AccessEvaluator,
    limiter: RateLimiter,
    backend: Arc<dyn ChatBackend>,
    ledger: Arc<dyn Ledger>,
    codec: SecretCodec,
    clock: Arc<dyn Clock>,
    max_message_length: usize,
    retention_days: u32,
}

impl ChatService {
    pub fn new(
        access: AccessEvaluator,
        limiter: RateLimiter,
        backend: Arc<dyn ChatBackend>,
        ledger: Arc<dyn Ledger>,
        codec: SecretCodec,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            access,
            limiter,
            backend,
            ledger,
            codec,
            clock,
            max_message_length: validator::DEFAULT_MAX_LENGTH,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }

    pub fn with_max_message_length(mut self, max: usize) -> Self {
        self.max_message_length = max;
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn ensure_access(&self, caller: &Caller) -> Result<(), GatewayError> {
        let decision = self
            .access
            .check_access(caller.actor.as_ref(), caller.page.as_ref());
        if decision.allowed {
            return Ok(());
        }
        let reason = decision.reason.unwrap_or_default();
        tracing::info!(actor = ?caller.actor_id(), reason = %reason, "access denied");
        Err(GatewayError::AccessDenied(reason))
    }

    /// Record a fault.  Gate outcomes are ignored; a failure to write the
    /// record is only traced.
    async fn record_fault(&self, category: &str, err: &GatewayError, actor_id: Option<u64>, context: serde_json::Value) {
        if err.is_gate() {
            return;
        }
        tracing::error!(category, kind = err.kind(), error = %err, "operation failed");
        let record = ErrorRecord {
            category: category.to_string(),
            message: err.to_string(),
            trace: Some(format!("{:?}", err)),
            context: Some(context),
            actor_id,
        };
        if let Err(log_err) = self.ledger.log_error(&record).await {
            tracing::error!(category, error = %log_err, "failed to write error record");
        }
    }

    async fn usage(&self, caller: &Caller, action: &str, metadata: serde_json::Value) -> Result<i64, GatewayError> {
        let event = UsageEvent {
            actor_id: caller.actor_id(),
            action: action.to_string(),
            metadata,
            page_url: caller.page_url(),
            ip_address: caller.ip.clone(),
        };
        Ok(self.ledger.log_usage(&event).await?)
    }

    pub fn check_access(&self, caller: &Caller) -> AccessDecision {
        self.access
            .check_access(caller.actor.as_ref(), caller.page.as_ref())
    }

    pub async fn send_message(
        &self,
        caller: &Caller,
        message: &str,
        conversation_id: Option<&str>,
    ) -> Result<ChatReply, GatewayError> {
        let actor_id = caller.actor_id();
        let conversation_id = conversation_id.map(str::trim).filter(|id| !id.is_empty());

        self.ensure_access(caller)?;

        let rate = self.limiter.check(actor_id).await;
        if !rate.allowed {
            tracing::info!(actor = ?actor_id, retry_after = rate.retry_after_secs, "rate limited");
            return Err(GatewayError::RateLimited {
                message: rate.message.unwrap_or_default(),
                retry_after_secs: rate.retry_after_secs,
            });
        }

        let cleaned = validator::validate(message, self.max_message_length)
            .into_result()
            .map_err(GatewayError::Validation)?;

        let mut reply = match self
            .backend
            .send_message(&cleaned, conversation_id, actor_id)
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                self.record_fault(
                    "message_send_failed",
                    &err,
                    actor_id,
                    json!({ "conversationId": conversation_id, "messageLength": cleaned.chars().count() }),
                )
                .await;
                return Err(err);
            }
        };

        let linked = self
            .link_conversation(actor_id, conversation_id, reply.conversation_id.as_deref())
            .await;
        if let Some((_, external_id)) = &linked {
            reply.conversation_id = Some(external_id.clone());
        }
        let local_id = linked.map(|(id, _)| id);

        let writes = [
            NewMessage {
                conversation_id: local_id,
                actor_id,
                role: Role::User,
                content: &cleaned,
                sources: &[],
                response_time_ms: None,
            },
            NewMessage {
                conversation_id: local_id,
                actor_id,
                role: Role::Assistant,
                content: &reply.message,
                sources: &reply.sources,
                response_time_ms: Some(reply.response_time_ms),
            },
        ];
        for write in &writes {
            if let Err(err) = self.ledger.log_message(write).await {
                self.record_fault(
                    "message_persist_failed",
                    &err.into(),
                    actor_id,
                    json!({ "conversationId": reply.conversation_id, "role": write.role.as_str() }),
                )
                .await;
            }
        }

        self.limiter.record(actor_id);

        if let Err(err) = self
            .usage(caller, "message_sent", json!({ "conversation_id": reply.conversation_id }))
            .await
        {
            tracing::warn!(actor = ?actor_id, error = %err, "failed to log usage event");
        }

        tracing::info!(
            actor = ?actor_id,
            conversation = ?reply.conversation_id,
            latency_ms = reply.response_time_ms,
            sources = reply.sources.len(),
            "message delivered"
        );
        Ok(reply)
    }

    /// Resolve the local conversation for this exchange.  Returns the local
    /// id and the external id the thread is known by.
    async fn link_conversation(
        &self,
        actor_id: Option<u64>,
        supplied: Option<&str>,
        returned: Option<&str>,
    ) -> Option<(i64, String)> {
        match supplied {
            None => {
                let external = returned?;
                match self.ledger.log_conversation(external, actor_id).await {
                    Ok(id) => Some((id, external.to_string())),
                    Err(err) => {
                        self.record_fault(
                            "conversation_persist_failed",
                            &err.into(),
                            actor_id,
                            json!({ "conversationId": external }),
                        )
                        .await;
                        None
                    }
                }
            }
            Some(supplied) => {
                for candidate in returned.into_iter().chain(std::iter::once(supplied)) {
                    match self.ledger.get_conversation(candidate).await {
                        Ok(Some(conv)) => return Some((conv.id, conv.external_id)),
                        Ok(None) => continue,
                        Err(err) => {
                            tracing::warn!(conversation = candidate, error = %err, "conversation lookup failed");
                            return None;
                        }
                    }
                }
                tracing::debug!(conversation = supplied, "conversation not in ledger, messages stored unlinked");
                None
            }
        }
    }

    pub async fn history(
        &self,
        caller: &Caller,
        conversation_id: &str,
        source: HistorySource,
    ) -> Result<Vec<HistoryEntry>, GatewayError> {
        self.ensure_access(caller)?;
        let conversation_id = conversation_id.trim();
        if conversation_id.is_empty() {
            return Err(GatewayError::Validation("Conversation ID is required.".to_string()));
        }
        match source {
            HistorySource::Local => {
                let conversation = self
                    .ledger
                    .get_conversation(conversation_id)
                    .await?
                    .ok_or_else(|| GatewayError::NotFound("Conversation not found.".to_string()))?;
                let messages = self.ledger.conversation_messages(conversation.id).await?;
                Ok(messages
                    .into_iter()
                    .map(|m| HistoryEntry {
                        role: m.role.as_str().to_string(),
                        content: m.content,
                        sources: m.sources,
                        time: Some(m.created_at),
                    })
                    .collect())
            }
            HistorySource::Upstream => match self.backend.get_history(conversation_id).await {
                Ok(items) => Ok(items.into_iter().map(HistoryEntry::from).collect()),
                Err(err) => {
                    self.record_fault(
                        "history_fetch_failed",
                        &err,
                        caller.actor_id(),
                        json!({ "conversationId": conversation_id }),
                    )
                    .await;
                    Err(err)
                }
            },
        }
    }

    pub async fn test_connection(&self) -> ConnectionReport {
        match self.backend.test_connection().await {
            Ok(report) => report,
            Err(GatewayError::Configuration(message)) => ConnectionReport {
                success: false,
                message,
                latency_ms: None,
                app_name: None,
            },
            Err(err) => {
                self.record_fault("connection_test", &err, None, json!({})).await;
                ConnectionReport {
                    success: false,
                    message: format!("Connection failed: {}", err.user_message()),
                    latency_ms: None,
                    app_name: None,
                }
            }
        }
    }

    pub async fn rate_limit_status(&self, caller: &Caller) -> RateLimitStatus {
        self.limiter.status(caller.actor_id()).await
    }

    pub async fn reset_conversation(&self, caller: &Caller) -> Result<(), GatewayError> {
        self.ensure_access(caller)?;
        if let Err(err) = self
            .usage(caller, "conversation_reset", serde_json::Value::Null)
            .await
        {
            tracing::warn!(actor = ?caller.actor_id(), error = %err, "failed to log usage event");
        }
        Ok(())
    }

    /// Client-reported usage event.  Only the actor check applies; the page
    /// the widget runs on was already vetted when it rendered.
    pub async fn log_event(
        &self,
        caller: &Caller,
        action: &str,
        metadata: serde_json::Value,
    ) -> Result<i64, GatewayError> {
        let decision = self.access.check_access(caller.actor.as_ref(), None);
        if !decision.allowed {
            return Err(GatewayError::AccessDenied("Access denied.".to_string()));
        }
        let action = action.trim();
        if action.is_empty() {
            return Err(GatewayError::Validation("Action type is required.".to_string()));
        }
        self.usage(caller, action, metadata).await
    }

    /// Admin settings save.  Re-checks the key format whenever either key
    /// changes and stores both keys encrypted.
    pub async fn save_credentials(&self, input: &CredentialsInput) -> Result<(), GatewayError> {
        let existing = self.ledger.load_credentials().await?.unwrap_or_default();
        let new_access = submitted(&input.access_key);
        let new_secret = submitted(&input.secret_key);

        let mut next = StoredCredentials {
            region: submitted(&input.region)
                .map(str::to_string)
                .unwrap_or(existing.region.clone()),
            application_id: submitted(&input.application_id)
                .map(str::to_string)
                .unwrap_or(existing.application_id.clone()),
            ..existing.clone()
        };

        if new_access.is_some() || new_secret.is_some() {
            let access_plain = match new_access {
                Some(v) => v.to_string(),
                None => self.codec.decrypt(&existing.access_key)?,
            };
            let secret_plain = match new_secret {
                Some(v) => v.to_string(),
                None => self.codec.decrypt(&existing.secret_key)?,
            };
            if !access_plain.is_empty() && !secret_plain.is_empty() {
                check_key_format(&access_plain, &secret_plain)?;
            }
            if let Some(v) = new_access {
                next.access_key = self.codec.encrypt(v)?;
            }
            if let Some(v) = new_secret {
                next.secret_key = self.codec.encrypt(v)?;
            }
        }

        self.ledger.store_credentials(&next).await?;
        tracing::info!(
            region = %next.region,
            access_key_changed = new_access.is_some(),
            secret_key_changed = new_secret.is_some(),
            "credentials saved"
        );
        Ok(())
    }

    /// Retention sweep.  Safe to run repeatedly.
    pub async fn cleanup(&self) -> Result<CleanupReport, GatewayError> {
        let report = self.ledger.cleanup(self.retention_days).await?;
        self.limiter.prune();
        tracing::info!(
            retention_days = self.retention_days,
            usage_deleted = report.usage_deleted,
            errors_deleted = report.errors_deleted,
            conversations_archived = report.conversations_archived,
            "retention sweep complete"
        );
        Ok(report)
    }

    pub async fn resolve_error(&self, id: i64) -> Result<(), GatewayError> {
        if self.ledger.resolve_error(id).await? {
            Ok(())
        } else {
            Err(GatewayError::NotFound(format!("Error record {} not found.", id)))
        }
    }

    pub async fn analytics(&self, period: AnalyticsPeriod) -> Result<UsageSummary, GatewayError> {
        let since = self.clock.now() - Duration::days(period.days());
        Ok(self.ledger.analytics(since).await?)
    }
}
