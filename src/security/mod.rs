//! Request-side hygiene (auth, origin, size, rate limits) plus the
//! security core: input sanitization, secret storage, and output redaction.

pub mod redact;
pub mod sanitizer;
pub mod secrets;

use crate::errors::AppError;
use axum::http::HeaderMap;
use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;

pub fn require_bearer(headers: &HeaderMap, expected: &str) -> Result<(), AppError> {
    let token = extract_bearer(headers).ok_or(AppError::Unauthorized)?;
    if token != expected {
        return Err(AppError::Unauthorized);
    }
    Ok(())
}

pub fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    auth.strip_prefix("Bearer ").map(|t| t.to_string())
}

pub fn check_origin(headers: &HeaderMap, allowed: &[String]) -> Result<(), AppError> {
    let origin = headers
        .get("Origin")
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::OriginDenied)?;
    if allowed.iter().any(|o| o == origin) {
        Ok(())
    } else {
        Err(AppError::OriginDenied)
    }
}

pub fn content_length_ok(headers: &HeaderMap, max_kb: usize) -> Result<(), AppError> {
    if let Some(len) = headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
    {
        if len > max_kb * 1024 {
            return Err(AppError::RequestTooLarge);
        }
    }
    Ok(())
}

/// Global and per-token request rate limits.
#[derive(Clone)]
pub struct RateLimiters {
    global: Arc<DefaultDirectRateLimiter>,
    per_token: Arc<DefaultKeyedRateLimiter<String>>,
}

impl RateLimiters {
    pub fn new(global_rps: u32, global_burst: u32, token_rps: u32, token_burst: u32) -> Self {
        let global = Quota::per_second(nonzero_or_one(global_rps))
            .allow_burst(nonzero_or_one(global_burst));
        let per_token =
            Quota::per_second(nonzero_or_one(token_rps)).allow_burst(nonzero_or_one(token_burst));
        Self {
            global: Arc::new(RateLimiter::direct(global)),
            per_token: Arc::new(RateLimiter::keyed(per_token)),
        }
    }

    pub fn check(&self, token: Option<&str>) -> Result<(), AppError> {
        if self.global.check().is_err() {
            return Err(AppError::RateLimited);
        }
        if let Some(token) = token {
            if self.per_token.check_key(&token.to_string()).is_err() {
                return Err(AppError::RateLimited);
            }
        }
        Ok(())
    }
}

fn nonzero_or_one(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap_or(nonzero!(1u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn bearer_required_and_checked() {
        let mut h = HeaderMap::new();
        assert!(require_bearer(&h, "token").is_err());
        h.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer token".parse().unwrap(),
        );
        assert!(require_bearer(&h, "token").is_ok());
        assert!(require_bearer(&h, "other").is_err());
    }

    #[test]
    fn origin_enforced() {
        let mut h = HeaderMap::new();
        h.insert("Origin", "http://localhost:3000".parse().unwrap());
        assert!(check_origin(&h, &["http://localhost:3000".into()]).is_ok());
        assert!(check_origin(&h, &["http://other".into()]).is_err());
    }

    #[test]
    fn rate_limiter_trips_after_burst() {
        let rls = RateLimiters::new(1, 2, 100, 100);
        assert!(rls.check(None).is_ok());
        assert!(rls.check(None).is_ok());
        assert!(rls.check(None).is_err());
    }
}
