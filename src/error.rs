//! Error taxonomy shared by the gateway services.
//!
//! Gate failures (`AccessDenied`, `RateLimited`, `Validation`, `NotFound`) are routine
//! control flow and never reach the ledger's error log.  Everything else is
//! a fault and is recorded for operator review.

use crate::ledger::LedgerError;
use crate::security::codec::CodecError;
use crate::upstream::UpstreamError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Missing or malformed credentials / application id.
    #[error("{0}")]
    Configuration(String),
    /// User input rejected by the request validator.
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    AccessDenied(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    RateLimited { message: String, retry_after_secs: i64 },
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("storage error: {0}")]
    Persistence(String),
    #[error("credential unavailable: {0}")]
    Codec(#[from] CodecError),
}

impl GatewayError {
    /// True for expected outcomes (gate denials, bad input, unknown ids)
    /// that must not be logged as errors.
    pub fn is_gate(&self) -> bool {
        matches!(
            self,
            GatewayError::AccessDenied(_)
                | GatewayError::RateLimited { .. }
                | GatewayError::Validation(_)
                | GatewayError::NotFound(_)
        )
    }

    /// Stable short label used for metrics and error-record categories.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Configuration(_) => "configuration",
            GatewayError::Validation(_) => "validation",
            GatewayError::AccessDenied(_) => "access_denied",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::Upstream(e) if e.is_transient() => "upstream_transient",
            GatewayError::Upstream(_) => "upstream_permanent",
            GatewayError::Persistence(_) => "persistence",
            GatewayError::Codec(_) => "codec",
        }
    }

    /// Text that is safe to show to the end user.
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Persistence(_) => {
                "An error occurred. Please try again.".to_string()
            }
            GatewayError::Codec(_) => "AWS credentials are not configured.".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<LedgerError> for GatewayError {
    fn from(err: LedgerError) -> Self {
        GatewayError::Persistence(err.to_string())
    }
}
