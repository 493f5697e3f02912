use std::{num::NonZeroU32, sync::Arc};

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use nonzero_ext::nonzero;

type KeyedLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock>;

/// Per-client quota keyed on `x-forwarded-for`.
#[derive(Clone)]
pub struct RateLimit {
    rate_limiter: Arc<KeyedLimiter>,
    quota: Quota,
}

impl RateLimit {
    pub fn per_minute(requests: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(requests).unwrap_or(nonzero!(1u32)));

        RateLimit {
            rate_limiter: Arc::new(RateLimiter::dashmap(quota)),
            quota,
        }
    }
}

fn client_key(req: &Request) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|d| d.to_str().ok())
        .and_then(|d| d.split(',').next())
        .map(str::trim)
        .unwrap_or("unknown")
        .to_owned()
}

pub async fn rate_limit(State(limit): State<RateLimit>, req: Request, next: Next) -> Response {
    let ip = client_key(&req);

    if limit.rate_limiter.check_key(&ip).is_err() {
        tracing::warn!(%ip, "Rate limited.");

        return (
            StatusCode::TOO_MANY_REQUESTS,
            format!("Rate limit of API calls exceeded. {:?}", limit.quota),
        )
            .into_response();
    }

    next.run(req).await
}
