//! External chat service seam.
//!
//! [`ChatBackend`] is what the orchestrator talks to; [`QBusinessClient`] is
//! the AWS Q Business implementation.  Replies are normalized into
//! [`ChatReply`] so nothing above this module sees the upstream wire shape.

mod client;
pub mod sigv4;

pub use client::{check_key_format, QBusinessClient, UpstreamSettings};

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// One citation attached to an assistant reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Source {
    pub title: String,
    pub url: String,
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub message: String,
    pub sources: Vec<Source>,
    /// Upstream conversation id, or the caller's id when upstream sent none.
    pub conversation_id: Option<String>,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionReport {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
}

/// A message as the upstream service remembers it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    pub sources: Vec<Source>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// The request never produced an HTTP response.
    #[error("{0}")]
    Transport(String),
    /// Non-success HTTP status.  `message` is already user presentable.
    #[error("{message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("Invalid response from AWS Q Business: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    /// Server-side and transport failures may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Transport(_) => true,
            UpstreamError::Api { status, .. } => *status >= 500,
            UpstreamError::InvalidResponse(_) => false,
        }
    }

    /// Build from a failed HTTP exchange.  Known AWS error codes are mapped
    /// to actionable messages; anything else passes the upstream text
    /// through.
    pub fn from_response(status: u16, code: Option<String>, raw_message: Option<String>) -> Self {
        let message = code
            .as_deref()
            .and_then(friendly_message)
            .map(str::to_string)
            .or(raw_message.filter(|m| !m.trim().is_empty()))
            .unwrap_or_else(|| format!("HTTP {} error", status));
        UpstreamError::Api {
            status,
            code,
            message,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            UpstreamError::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

fn friendly_message(code: &str) -> Option<&'static str> {
    match code {
        "UnrecognizedClientException" | "InvalidSignatureException" => Some(
            "Invalid AWS credentials. Please check your Access Key ID and Secret Access Key.",
        ),
        "AccessDeniedException" => {
            Some("Access denied. Please ensure your IAM user has permissions for Q Business.")
        }
        "ResourceNotFoundException" => {
            Some("Q Business Application not found. Please check the Application ID.")
        }
        _ => None,
    }
}

#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    /// Fetch the configured application.  Idempotent, retried.
    async fn test_connection(&self) -> Result<ConnectionReport, GatewayError>;

    /// Send one user message.  Never retried.
    async fn send_message(
        &self,
        text: &str,
        conversation_id: Option<&str>,
        actor_id: Option<u64>,
    ) -> Result<ChatReply, GatewayError>;

    /// Upstream transcript of a conversation.  Idempotent, retried.
    async fn get_history(&self, conversation_id: &str) -> Result<Vec<HistoryMessage>, GatewayError>;
}

/// Retry budget for idempotent upstream calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `2^attempt * base`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }
}

/// Run `call` until it succeeds, fails permanently, or the retry budget is
/// spent.  `call` receives the zero-based attempt number.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, UpstreamError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut attempt = 0;
    loop {
        match call(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient upstream failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
