use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Method, Url};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use super::sigv4::{self, RequestParts};
use super::{
    with_retry, ChatBackend, ChatReply, ConnectionReport, HistoryMessage, RetryPolicy, Source,
    UpstreamError,
};
use crate::error::GatewayError;
use crate::ledger::Ledger;
use crate::security::codec::SecretCodec;
use crate::security::validator;
use crate::util::Clock;

const SERVICE: &str = "qbusiness";

pub const NOT_CONFIGURED: &str = "AWS credentials are not configured.";
pub const APP_ID_MISSING: &str = "Q Business Application ID is not configured.";
pub const KEYS_SWAPPED: &str = "Access Key and Secret Key appear to be swapped. Please re-enter your credentials with the Access Key ID (starts with AKIA) in the first field and the Secret Access Key in the second field.";

pub const INVALID_CONVERSATION_ID: &str = "Invalid conversation ID.";

static ACCESS_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(AKIA|ASIA|AIDA|AROA|AIPA|ANPA|ANVA|AGPA)[A-Z0-9]{16}$").unwrap()
});

/// Identifiers interpolated into request paths.  Anything outside this set
/// could rewrite the path (`/`, `..`) or smuggle a query (`?`, `#`).
static PATH_SEGMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,127}$").unwrap());

fn is_path_segment(value: &str) -> bool {
    PATH_SEGMENT_RE.is_match(value)
}

/// Reject an access key that does not look like an AWS access key id.
/// Detects the common mistake of pasting the two keys into each other's
/// fields.
pub fn check_key_format(access_key: &str, secret_key: &str) -> Result<(), GatewayError> {
    if ACCESS_KEY_RE.is_match(access_key) {
        return Ok(());
    }
    if ACCESS_KEY_RE.is_match(secret_key) {
        return Err(GatewayError::Configuration(KEYS_SWAPPED.to_string()));
    }
    let prefix: String = access_key.chars().take(4).collect();
    Err(GatewayError::Configuration(format!(
        "Invalid Access Key format. AWS Access Key IDs start with AKIA and are 20 characters. Your key starts with: {}...",
        prefix
    )))
}

/// Static client settings resolved from configuration.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Used when the stored credential record has no region.
    pub region: String,
    /// Used when the stored credential record has no application id.
    pub application_id: String,
    /// Replaces `https://qbusiness.{region}.api.aws`.
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    /// Forward conversation ids so the upstream continues a thread.  Off for
    /// anonymous-identity applications, which reject continuation.
    pub supports_continuation: bool,
    pub max_message_length: usize,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            application_id: String::new(),
            endpoint: None,
            timeout_ms: 30_000,
            max_retries: 3,
            backoff_base_ms: 1000,
            supports_continuation: false,
            max_message_length: validator::DEFAULT_MAX_LENGTH,
        }
    }
}

/// Credentials decrypted for the duration of one call.
struct CallCredentials {
    access_key: String,
    secret_key: SecretString,
    region: String,
    application_id: String,
}

/// AWS Q Business REST client.  Credentials are read from the ledger's
/// settings record and decrypted on every call.
pub struct QBusinessClient {
    settings: UpstreamSettings,
    http: reqwest::Client,
    ledger: Arc<dyn Ledger>,
    codec: SecretCodec,
    clock: Arc<dyn Clock>,
}

impl QBusinessClient {
    pub fn new(
        settings: UpstreamSettings,
        ledger: Arc<dyn Ledger>,
        codec: SecretCodec,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| GatewayError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            settings,
            http,
            ledger,
            codec,
            clock,
        })
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.settings.max_retries,
            backoff_base: Duration::from_millis(self.settings.backoff_base_ms),
        }
    }

    async fn credentials(&self) -> Result<CallCredentials, GatewayError> {
        let stored = self.ledger.load_credentials().await?.unwrap_or_default();
        let access_key = self.codec.decrypt(&stored.access_key)?;
        let secret_key = self.codec.decrypt(&stored.secret_key)?;
        if access_key.is_empty() || secret_key.is_empty() {
            return Err(GatewayError::Configuration(NOT_CONFIGURED.to_string()));
        }
        check_key_format(&access_key, &secret_key)?;

        let region = Some(stored.region)
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| self.settings.region.clone());
        let application_id = Some(stored.application_id)
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| self.settings.application_id.clone());
        let application_id = application_id.trim().to_string();
        if application_id.is_empty() {
            return Err(GatewayError::Configuration(APP_ID_MISSING.to_string()));
        }
        if !is_path_segment(&application_id) {
            return Err(GatewayError::Configuration(
                "Q Business Application ID contains invalid characters.".to_string(),
            ));
        }
        Ok(CallCredentials {
            access_key,
            secret_key: SecretString::from(secret_key),
            region,
            application_id,
        })
    }

    fn endpoint(&self, region: &str) -> String {
        match &self.settings.endpoint {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://qbusiness.{}.api.aws", region),
        }
    }

    async fn call(
        &self,
        creds: &CallCredentials,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, UpstreamError> {
        let mut raw_url = format!("{}{}", self.endpoint(&creds.region), path);
        if !query.is_empty() {
            let rendered: Vec<String> = query
                .iter()
                .map(|(k, v)| if v.is_empty() { k.to_string() } else { format!("{}={}", k, v) })
                .collect();
            raw_url.push('?');
            raw_url.push_str(&rendered.join("&"));
        }
        let url = Url::parse(&raw_url)
            .map_err(|e| UpstreamError::Transport(format!("invalid endpoint '{}': {}", raw_url, e)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            (None, _) => return Err(UpstreamError::Transport(format!("endpoint has no host: {}", raw_url))),
        };

        let payload = body.map(|b| b.to_string()).unwrap_or_default();
        let content_type = body.map(|_| "application/json");
        let signature = sigv4::sign(
            &RequestParts {
                method: method.as_str(),
                host: &host,
                path: url.path(),
                query,
                content_type,
                payload: payload.as_bytes(),
            },
            &creds.access_key,
            creds.secret_key.expose_secret(),
            &creds.region,
            SERVICE,
            self.clock.now(),
        );

        let mut rb = self
            .http
            .request(method, url)
            .header("accept", "application/json")
            .header("x-amz-date", &signature.amz_date)
            .header("authorization", &signature.authorization);
        if let Some(ct) = content_type {
            rb = rb.header("content-type", ct).body(payload);
        }

        let resp = rb
            .send()
            .await
            .map_err(|err| UpstreamError::Transport(format!("Could not reach AWS Q Business: {}", err)))?;
        let status = resp.status();
        let header_code = resp
            .headers()
            .get("x-amzn-errortype")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(':').next().unwrap_or(v).to_string());
        let text = resp
            .text()
            .await
            .map_err(|err| UpstreamError::Transport(format!("failed to read response: {}", err)))?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Object(Default::default()));
            }
            return serde_json::from_str(&text).map_err(|e| UpstreamError::InvalidResponse(e.to_string()));
        }

        let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let body_code = parsed
            .get("__type")
            .or_else(|| parsed.get("code"))
            .and_then(Value::as_str)
            .map(|t| t.rsplit('#').next().unwrap_or(t).to_string());
        let message = parsed
            .get("message")
            .or_else(|| parsed.get("Message"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let err = UpstreamError::from_response(status.as_u16(), header_code.or(body_code), message);
        tracing::debug!(status = status.as_u16(), code = ?err.code(), "upstream returned error");
        Err(err)
    }
}

fn extract_sources(items: Option<&Value>) -> Vec<Source> {
    let Some(Value::Array(items)) = items else {
        return Vec::new();
    };
    let field = |item: &Value, key: &str| item.get(key).and_then(Value::as_str).map(str::to_string);
    items
        .iter()
        .map(|item| Source {
            title: field(item, "title").unwrap_or_default(),
            url: field(item, "url").unwrap_or_default(),
            excerpt: field(item, "textExcerpt")
                .or_else(|| field(item, "snippet"))
                .unwrap_or_default(),
        })
        .collect()
}

#[async_trait::async_trait]
impl ChatBackend for QBusinessClient {
    async fn test_connection(&self) -> Result<ConnectionReport, GatewayError> {
        let creds = self.credentials().await?;
        let path = format!("/applications/{}", creds.application_id);
        let start = Instant::now();
        let app = with_retry(self.retry_policy(), "get_application", |_| {
            self.call(&creds, Method::GET, &path, &[], None)
        })
        .await?;
        let latency_ms = start.elapsed().as_millis() as u64;
        tracing::info!(latency_ms, region = %creds.region, "upstream connection test succeeded");
        Ok(ConnectionReport {
            success: true,
            message: format!("Connection successful! Latency: {}ms", latency_ms),
            latency_ms: Some(latency_ms),
            app_name: app
                .get("displayName")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn send_message(
        &self,
        text: &str,
        conversation_id: Option<&str>,
        actor_id: Option<u64>,
    ) -> Result<ChatReply, GatewayError> {
        let cleaned = validator::validate(text, self.settings.max_message_length)
            .into_result()
            .map_err(GatewayError::Validation)?;
        let creds = self.credentials().await?;

        let mut body = json!({ "userMessage": cleaned });
        let continued = conversation_id.filter(|id| self.settings.supports_continuation && !id.is_empty());
        if let Some(id) = continued {
            body["conversationId"] = Value::String(id.to_string());
        }
        tracing::debug!(actor = ?actor_id, continued = continued.is_some(), "sending chat message upstream");

        let path = format!("/applications/{}/conversations", creds.application_id);
        let start = Instant::now();
        let result = self
            .call(&creds, Method::POST, &path, &[("sync", "")], Some(&body))
            .await?;
        let response_time_ms = start.elapsed().as_millis() as u64;

        Ok(ChatReply {
            message: result
                .get("systemMessage")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            sources: extract_sources(result.get("sourceAttributions")),
            conversation_id: result
                .get("conversationId")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .or_else(|| conversation_id.map(str::to_string)),
            response_time_ms,
        })
    }

    async fn get_history(&self, conversation_id: &str) -> Result<Vec<HistoryMessage>, GatewayError> {
        if conversation_id.trim().is_empty() {
            return Err(GatewayError::Validation("Conversation ID is required.".to_string()));
        }
        if !is_path_segment(conversation_id) {
            tracing::warn!(len = conversation_id.len(), "rejected malformed conversation id");
            return Err(GatewayError::Validation(INVALID_CONVERSATION_ID.to_string()));
        }
        let creds = self.credentials().await?;
        let path = format!(
            "/applications/{}/conversations/{}",
            creds.application_id, conversation_id
        );
        let listing = with_retry(self.retry_policy(), "list_messages", |_| {
            self.call(&creds, Method::GET, &path, &[], None)
        })
        .await?;

        let messages = listing
            .get("messages")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|m| HistoryMessage {
                        role: match m.get("type").and_then(Value::as_str) {
                            Some("USER") => "user".to_string(),
                            _ => "assistant".to_string(),
                        },
                        content: m
                            .get("body")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        time: m.get("time").map(|t| match t {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        }),
                        sources: extract_sources(m.get("sourceAttribution")),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(messages)
    }
}
