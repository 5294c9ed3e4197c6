//! Request plumbing for the operations API.
//!
//! Rejections from these layers use the same `{error, meta}` envelope as the
//! handlers, carrying the request id assigned by [`request_id`].

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Mutex;
use uuid::Uuid;

use herald_core::AppConfig;

use crate::api::ApiError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Bearer keys accepted on the `/api/v1` operations routes.
#[derive(Debug, Clone)]
pub struct AuthState {
    api_keys: Arc<HashSet<String>>,
    pub enabled: bool,
}

impl AuthState {
    /// An empty key list disables auth unless `required` is set, in which case
    /// startup fails.
    ///
    /// # Errors
    ///
    /// Returns an error when `required` and no non-blank key was given.
    pub fn from_keys(keys: &[String], required: bool) -> anyhow::Result<Self> {
        let keys: HashSet<String> = keys
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(ToOwned::to_owned)
            .collect();

        if keys.is_empty() {
            anyhow::ensure!(
                !required,
                "HERALD_API_KEYS must list at least one bearer token in production"
            );
            tracing::warn!("api: HERALD_API_KEYS empty; operations routes are unauthenticated");
        }

        Ok(Self {
            enabled: !keys.is_empty(),
            api_keys: Arc::new(keys),
        })
    }

    /// Applies the same rule [`AppConfig::validate_for_server`] checks.
    ///
    /// # Errors
    ///
    /// See [`AuthState::from_keys`].
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        Self::from_keys(&config.api_keys, config.api_keys_required())
    }

    fn allows(&self, token: &str) -> bool {
        self.api_keys.contains(token)
    }
}

#[derive(Debug)]
struct Window {
    opened_at: Instant,
    admitted: u32,
}

/// Per-process request budget shared by every protected route.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    budget: u32,
    window: Duration,
    current: Arc<Mutex<Window>>,
}

#[derive(Debug, PartialEq, Eq)]
enum Admission {
    Admitted,
    Refused { retry_after: Duration },
}

impl RateLimitState {
    #[must_use]
    pub fn new(budget: u32, window: Duration) -> Self {
        Self {
            budget,
            window,
            current: Arc::new(Mutex::new(Window {
                opened_at: Instant::now(),
                admitted: 0,
            })),
        }
    }

    /// `HERALD_API_RATE_LIMIT` requests per `HERALD_API_RATE_WINDOW_SECS`.
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.api_rate_limit, config.api_rate_window())
    }

    async fn admit(&self, now: Instant) -> Admission {
        let mut current = self.current.lock().await;
        if now.saturating_duration_since(current.opened_at) >= self.window {
            current.opened_at = now;
            current.admitted = 0;
        }

        if current.admitted >= self.budget {
            let reopens_at = current.opened_at + self.window;
            return Admission::Refused {
                retry_after: reopens_at.saturating_duration_since(now),
            };
        }

        current.admitted += 1;
        Admission::Admitted
    }
}

/// Reuses the caller's `x-request-id` or mints a v4 UUID, exposes it to
/// handlers as [`RequestId`] and echoes it on the response.
pub async fn request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| Uuid::new_v4().to_string(), String::from);

    req.extensions_mut().insert(RequestId(id.clone()));

    let mut res = next.run(req).await;

    if let Ok(val) = HeaderValue::from_str(&id) {
        res.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    res
}

pub async fn require_bearer_auth(
    State(auth): State<AuthState>,
    req: Request,
    next: Next,
) -> Response {
    if !auth.enabled {
        return next.run(req).await;
    }

    match extract_bearer_token(req.headers().get(header::AUTHORIZATION)) {
        Some(token) if auth.allows(token) => next.run(req).await,
        _ => ApiError::new(
            request_id_of(&req),
            "unauthorized",
            "missing or invalid bearer token",
        )
        .into_response(),
    }
}

/// Refuses with 429 and `Retry-After` once the window's budget is spent.
pub async fn enforce_rate_limit(
    State(rate_limit): State<RateLimitState>,
    req: Request,
    next: Next,
) -> Response {
    match rate_limit.admit(Instant::now()).await {
        Admission::Admitted => next.run(req).await,
        Admission::Refused { retry_after } => {
            tracing::debug!(
                retry_after_secs = retry_after.as_secs(),
                "api: request refused by rate limit"
            );
            let mut res =
                ApiError::new(request_id_of(&req), "rate_limited", "rate limit exceeded")
                    .into_response();
            // Round up so clients never retry inside the closed window.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            res.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
            res
        }
    }
}

fn request_id_of(req: &Request) -> String {
    req.extensions()
        .get::<RequestId>()
        .map_or_else(String::new, |id| id.0.clone())
}

fn extract_bearer_token(value: Option<&HeaderValue>) -> Option<&str> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_is_taken_from_authorization_header() {
        let header = HeaderValue::from_static("Bearer ops-key");
        assert_eq!(extract_bearer_token(Some(&header)), Some("ops-key"));

        let basic = HeaderValue::from_static("Basic abc123");
        assert_eq!(extract_bearer_token(Some(&basic)), None);
        let blank = HeaderValue::from_static("Bearer   ");
        assert_eq!(extract_bearer_token(Some(&blank)), None);
    }

    #[test]
    fn empty_keys_disable_auth_unless_required() {
        let open = AuthState::from_keys(&[" ".to_string()], false).expect("optional keys");
        assert!(!open.enabled);

        assert!(AuthState::from_keys(&[], true).is_err());
    }

    #[test]
    fn configured_keys_are_trimmed_and_matched() {
        let state = AuthState::from_keys(&[" key-1 ".to_string()], true).expect("keys");
        assert!(state.enabled);
        assert!(state.allows("key-1"));
        assert!(!state.allows("key-2"));
    }

    #[tokio::test]
    async fn budget_resets_when_window_elapses() {
        let limiter = RateLimitState::new(2, Duration::from_secs(10));
        let start = Instant::now();

        assert_eq!(limiter.admit(start).await, Admission::Admitted);
        assert_eq!(limiter.admit(start).await, Admission::Admitted);
        match limiter.admit(start + Duration::from_secs(4)).await {
            Admission::Refused { retry_after } => {
                assert!(retry_after <= Duration::from_secs(6));
                assert!(retry_after > Duration::from_secs(5));
            }
            Admission::Admitted => panic!("third request should exceed the budget"),
        }

        assert_eq!(
            limiter.admit(start + Duration::from_secs(10)).await,
            Admission::Admitted
        );
    }
}
