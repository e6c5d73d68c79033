//! Admin token checks, failed-auth throttling and response hardening headers.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use axum::extract::Request;
use axum::http::header::{HeaderName, CACHE_CONTROL, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;
use tokio::time::Instant;

/// Failures tolerated from one client inside `WINDOW` before it is locked out.
const MAX_FAILURES: u32 = 5;
const WINDOW: Duration = Duration::from_secs(60);
const LOCKOUT: Duration = Duration::from_secs(60);

/// Compares a presented token against the configured one without leaking
/// the position of the first mismatch.
pub fn token_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Extracts the token of a `Bearer` authorization value.
pub fn bearer_token(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

struct Strikes {
    count: u32,
    since: Instant,
    locked_until: Option<Instant>,
}

/// Tracks failed admin authentications per client address.
#[derive(Default)]
pub struct AuthThrottle {
    clients: Mutex<HashMap<String, Strikes>>,
}

impl AuthThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure. Returns true when the client is now locked out.
    /// Expired clients are forgotten on the way.
    pub fn strike(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        Self::prune(&mut clients, now);
        let strikes = clients.entry(client.to_string()).or_insert(Strikes {
            count: 0,
            since: now,
            locked_until: None,
        });
        if now.duration_since(strikes.since) > WINDOW {
            strikes.count = 0;
            strikes.since = now;
        }
        strikes.count += 1;
        if strikes.count >= MAX_FAILURES {
            strikes.locked_until = Some(now + LOCKOUT);
        }
        strikes.locked_until.is_some_and(|until| until > now)
    }

    pub fn is_locked_out(&self, client: &str) -> bool {
        let clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients
            .get(client)
            .and_then(|s| s.locked_until)
            .is_some_and(|until| until > Instant::now())
    }

    /// Forgets clients whose window and lockout have both passed.
    fn prune(clients: &mut HashMap<String, Strikes>, now: Instant) {
        clients.retain(|_, s| {
            now.duration_since(s.since) <= WINDOW || s.locked_until.is_some_and(|u| u > now)
        });
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(
        HeaderName::from_static("strict-transport-security"),
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    response
}
