//! Request gates and credential protection.

pub mod access;
pub mod codec;
pub mod rate_limit;
pub mod validator;

pub use access::{AccessDecision, AccessEvaluator, AccessPolicy, Actor, PageContext};
pub use codec::{CodecError, SecretCodec};
pub use rate_limit::{RateDecision, RateLimitPolicy, RateLimitStatus, RateLimiter};
pub use validator::{validate, Validation};
