//! Admission middleware for axum.
//!
//! Derives the subject from the request, asks the [`RateLimiter`] for a
//! decision, and either forwards the request or answers with a throttling
//! response. Backend failures are handled according to the configured
//! [`FailureMode`] and never reported as a policy denial.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use crate::config::FailureMode;
use crate::ratelimit::{RateLimiter, SubjectKey};

/// Header carrying the client's API token.
const API_KEY_HEADER: &str = "api_key";
/// Header carrying the token's tier label.
const TOKEN_TYPE_HEADER: &str = "token_type";

/// Tier assumed for a token presented without a tier label.
pub const DEFAULT_TIER: &str = "public";

/// Body returned with 429 responses.
pub const DENIED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Body returned with 503 responses when failing closed.
pub const UNAVAILABLE_MESSAGE: &str = "rate limiting is temporarily unavailable";

/// Shared state for [`admission_middleware`].
#[derive(Clone)]
pub struct AdmissionState {
    limiter: Arc<RateLimiter>,
    failure_mode: FailureMode,
}

impl AdmissionState {
    /// Create middleware state from a limiter and a failure mode.
    pub fn new(limiter: Arc<RateLimiter>, failure_mode: FailureMode) -> Self {
        Self {
            limiter,
            failure_mode,
        }
    }

    /// Get the failure mode.
    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }
}

/// Derive the subject key and tier label for a request.
///
/// A presented token wins over the source address. Tokens without a tier
/// label are treated as [`DEFAULT_TIER`]; address subjects get the empty
/// label, which selects the anonymous policy.
pub fn subject_from_headers(headers: &HeaderMap, client: IpAddr) -> (SubjectKey, String) {
    match header_value(headers, API_KEY_HEADER) {
        Some(token) => {
            let tier = header_value(headers, TOKEN_TYPE_HEADER).unwrap_or(DEFAULT_TIER);
            (SubjectKey::token(token), tier.to_string())
        }
        None => (SubjectKey::ip(client), String::new()),
    }
}

/// A trimmed, non-empty header value.
fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Admission middleware for use with `axum::middleware::from_fn_with_state`.
///
/// Requires the router to be served with connect info
/// (`into_make_service_with_connect_info::<SocketAddr>()`).
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let (key, tier) = subject_from_headers(request.headers(), addr.ip());

    match state.limiter.admit(&key, &tier).await {
        Ok(decision) if decision.is_allowed() => next.run(request).await,
        Ok(decision) => {
            debug!(
                key = %key,
                tier = %tier,
                decision = ?decision,
                path = %request.uri().path(),
                "Request throttled"
            );
            (StatusCode::TOO_MANY_REQUESTS, DENIED_MESSAGE).into_response()
        }
        Err(err) => match state.failure_mode {
            FailureMode::Open => {
                error!(key = %key, error = %err, "Rate limiter storage failed, admitting request");
                next.run(request).await
            }
            FailureMode::Closed => {
                error!(key = %key, error = %err, "Rate limiter storage failed, rejecting request");
                (StatusCode::SERVICE_UNAVAILABLE, UNAVAILABLE_MESSAGE).into_response()
            }
        },
    }
}
