//! Admission middleware.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{error, trace, warn};

use crate::config::{ClientKeySource, FailurePolicy};
use crate::ratelimit::{ClientKey, RateLimiterBackend};

/// Shared state of the admission middleware.
#[derive(Clone)]
pub struct Admission {
    limiter: Arc<dyn RateLimiterBackend>,
    key_source: ClientKeySource,
    failure_policy: FailurePolicy,
}

impl Admission {
    pub fn new(
        limiter: Arc<dyn RateLimiterBackend>,
        key_source: ClientKeySource,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            limiter,
            key_source,
            failure_policy,
        }
    }
}

/// Let the request through to `next` only if its client is within its rate.
///
/// Denied requests get a bare 429 and never reach the upstream.
pub async fn admit(State(admission): State<Admission>, request: Request, next: Next) -> Response {
    let key = match ClientKey::from_request(admission.key_source, &request) {
        Ok(key) => key,
        Err(e) => {
            error!(error = %e, "Cannot derive client key");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match admission.limiter.check(&key).await {
        Ok(decision) if decision.allowed => {
            trace!(client = %key, remaining = decision.remaining, "Request admitted");
            next.run(request).await
        }
        Ok(_) => too_many_requests(),
        Err(e) => match admission.failure_policy {
            FailurePolicy::Closed => {
                warn!(
                    client = %key,
                    backend = admission.limiter.name(),
                    error = %e,
                    "Admission store unavailable, rejecting request"
                );
                too_many_requests()
            }
            FailurePolicy::Open => {
                warn!(
                    client = %key,
                    backend = admission.limiter.name(),
                    error = %e,
                    "Admission store unavailable, admitting request"
                );
                next.run(request).await
            }
        },
    }
}

fn too_many_requests() -> Response {
    let status = StatusCode::TOO_MANY_REQUESTS;
    (status, status.canonical_reason().unwrap_or_default()).into_response()
}
