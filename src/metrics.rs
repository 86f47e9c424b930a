//! Metric names and registration. Counters and histograms are emitted
//! through the `metrics` facade; the Prometheus recorder installed in main
//! renders them for the `/metrics` route.

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use metrics::{describe_counter, describe_histogram, Unit};

pub const REQUESTS: &str = "favkit_requests_total";
pub const REQUEST_DURATION: &str = "favkit_request_duration_seconds";
pub const CACHE_HITS: &str = "favkit_cache_hits_total";
pub const UPSTREAM_FETCHES: &str = "favkit_upstream_fetches_total";
pub const UPSTREAM_EXHAUSTED: &str = "favkit_upstream_exhausted_total";
pub const RATE_LIMIT_GLOBAL: &str = "favkit_rate_limit_global_total";
pub const RATE_LIMIT_IP: &str = "favkit_rate_limit_ip_total";

pub fn describe() {
    describe_counter!(REQUESTS, "HTTP requests served, by route and status");
    describe_histogram!(
        REQUEST_DURATION,
        Unit::Seconds,
        "End-to-end request latency"
    );
    describe_counter!(CACHE_HITS, "Cache hits, by tier");
    describe_counter!(UPSTREAM_FETCHES, "Outbound fetches, by kind");
    describe_counter!(
        UPSTREAM_EXHAUSTED,
        "Requests whose discovery candidates were all unusable"
    );
    describe_counter!(RATE_LIMIT_GLOBAL, "Requests rejected by the global bucket");
    describe_counter!(RATE_LIMIT_IP, "Requests rejected by a per-IP bucket");
}

/// Request tracking middleware: per-route counter plus latency histogram.
pub async fn track(request: Request, next: Next) -> Response {
    let route = request.uri().path().to_string();
    let start = std::time::Instant::now();
    let response = next.run(request).await;

    metrics::counter!(
        REQUESTS,
        "route" => route,
        "status" => response.status().as_u16().to_string(),
    )
    .increment(1);
    metrics::histogram!(REQUEST_DURATION).record(start.elapsed().as_secs_f64());
    response
}
