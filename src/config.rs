use std::collections::HashSet;
use std::env;
use std::fs;

use anyhow::{anyhow, Context, Result};
use chrono::FixedOffset;
use serde::Deserialize;

use crate::orchestrator::DEFAULT_RETENTION_DAYS;
use crate::security::access::AccessPolicy;
use crate::security::rate_limit::RateLimitPolicy;
use crate::security::validator::DEFAULT_MAX_LENGTH;
use crate::upstream::UpstreamSettings;

/// Policy file contents (`QGATE_POLICY_CONFIG`).  Every section is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyConfig {
    pub access: AccessPolicy,
    pub rate_limits: RateLimitPolicy,
    pub max_message_length: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            access: AccessPolicy::default(),
            rate_limits: RateLimitPolicy::default(),
            max_message_length: DEFAULT_MAX_LENGTH,
        }
    }
}

/// The two installation secrets the credential codec key is derived from.
#[derive(Clone)]
pub struct CodecSecrets {
    pub auth_key: String,
    pub secure_auth_key: String,
}

impl std::fmt::Debug for CodecSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CodecSecrets(..)")
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub policy: PolicyConfig,
    pub database_path: String,
    pub secrets: CodecSecrets,
    pub upstream: UpstreamSettings,
    pub retention_days: u32,
    pub cleanup_interval_secs: Option<u64>,
    /// Client routes are disabled when unset.
    pub allowed_tokens: Option<HashSet<String>>,
    /// Admin routes are disabled when unset.
    pub admin_tokens: Option<HashSet<String>>,
    pub max_request_bytes: Option<usize>,
    /// Take the client IP from `X-Forwarded-For`.  Only safe behind a proxy
    /// that overwrites the header.
    pub trust_forwarded_for: bool,
    pub utc_offset: FixedOffset,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let mut policy = if let Ok(path) = env::var("QGATE_POLICY_CONFIG") {
            let content = fs::read_to_string(&path).with_context(|| {
                format!("Failed to read QGATE_POLICY_CONFIG '{}': file unreadable", path)
            })?;
            serde_json::from_str::<PolicyConfig>(&content).with_context(|| {
                format!(
                    "Failed to parse QGATE_POLICY_CONFIG '{}': invalid JSON configuration",
                    path
                )
            })?
        } else {
            PolicyConfig::default()
        };
        if let Some(ip_limit) = parse_optional_u64("QGATE_IP_LIMIT_PER_MINUTE")? {
            policy.rate_limits.ip_limit_per_minute = ip_limit;
        }
        if policy.max_message_length == 0 {
            return Err(anyhow!("maxMessageLength must be greater than zero"));
        }

        let secrets = CodecSecrets {
            auth_key: required("QGATE_AUTH_KEY")?,
            secure_auth_key: required("QGATE_SECURE_AUTH_KEY")?,
        };

        let database_path = env::var("QGATE_DATABASE")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| "qgate.db".to_string());

        let upstream = UpstreamSettings {
            region: env::var("QGATE_AWS_REGION")
                .ok()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| "us-east-1".to_string()),
            application_id: env::var("QGATE_APP_ID").unwrap_or_default(),
            endpoint: env::var("QGATE_UPSTREAM_ENDPOINT")
                .ok()
                .filter(|e| !e.trim().is_empty()),
            timeout_ms: parse_optional_u64("QGATE_UPSTREAM_TIMEOUT_MS")?.unwrap_or(30_000),
            max_retries: parse_optional_u32("QGATE_MAX_RETRIES")?.unwrap_or(3),
            backoff_base_ms: parse_optional_u64("QGATE_BACKOFF_BASE_MS")?.unwrap_or(1000),
            supports_continuation: parse_bool_env("QGATE_SUPPORTS_CONTINUATION")?.unwrap_or(false),
            max_message_length: policy.max_message_length,
        };

        let retention_days = parse_optional_u32("QGATE_RETENTION_DAYS")?.unwrap_or(DEFAULT_RETENTION_DAYS);
        let cleanup_interval_secs =
            parse_optional_u64("QGATE_CLEANUP_INTERVAL_SECS")?.filter(|s| *s > 0);
        let max_request_bytes = parse_optional_u64("QGATE_MAX_REQUEST_BYTES")?
            .map(|v| usize::try_from(v).map_err(|_| anyhow!("QGATE_MAX_REQUEST_BYTES is too large")))
            .transpose()?;
        let trust_forwarded_for = parse_bool_env("QGATE_TRUST_FORWARDED_FOR")?.unwrap_or(false);

        let offset_minutes = parse_optional_i64("QGATE_UTC_OFFSET_MINUTES")?.unwrap_or(0);
        let utc_offset = i32::try_from(offset_minutes)
            .ok()
            .filter(|m| m.abs() < 24 * 60)
            .and_then(|m| FixedOffset::east_opt(m * 60))
            .ok_or_else(|| anyhow!("QGATE_UTC_OFFSET_MINUTES must be between -1439 and 1439"))?;

        Ok(Self {
            policy,
            database_path,
            secrets,
            upstream,
            retention_days,
            cleanup_interval_secs,
            allowed_tokens: parse_token_set("QGATE_ALLOWED_TOKENS"),
            admin_tokens: parse_token_set("QGATE_ADMIN_TOKENS"),
            max_request_bytes,
            trust_forwarded_for,
            utc_offset,
        })
    }
}

fn required(var: &str) -> Result<String> {
    env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow!("{} must be set", var))
}

fn parse_token_set(var: &str) -> Option<HashSet<String>> {
    env::var(var)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect::<HashSet<_>>()
        })
        .filter(|set: &HashSet<String>| !set.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_optional_u32(var: &str) -> Result<Option<u32>> {
    parse_optional_u64(var)?
        .map(|value| u32::try_from(value).map_err(|_| anyhow!("{} must be at most {}", var, u32::MAX)))
        .transpose()
}

fn parse_optional_i64(var: &str) -> Result<Option<i64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be an integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
