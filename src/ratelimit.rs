use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::{RATE_LIMIT_GLOBAL, RATE_LIMIT_IP};

/// Idle per-IP buckets are evicted after this long without an `allow` call.
const BUCKET_IDLE_MAX: Duration = Duration::from_secs(10 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Token bucket: refilled lazily on each `allow`, clamped to capacity, one
/// token consumed per admitted request. State sits behind a mutex held only
/// across the refill arithmetic.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_update: Instant::now(),
            }),
        }
    }

    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.last_update = now;

        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn idle_for(&self) -> Duration {
        self.state.lock().last_update.elapsed()
    }
}

/// Global + per-client admission control. Per-IP buckets are created lazily
/// through the map's entry API (a losing racer discards its bucket) and
/// swept in the background to bound memory.
pub struct Limiter {
    global: Option<TokenBucket>,
    ip_rate: u32,
    ip_burst: u32,
    ip_buckets: DashMap<IpAddr, Arc<TokenBucket>>,
}

impl Limiter {
    /// Returns `None` when both rates are zero (limiting disabled). A zero
    /// burst defaults to twice the rate.
    pub fn new(
        global_rate: u32,
        global_burst: u32,
        ip_rate: u32,
        ip_burst: u32,
    ) -> Option<Arc<Self>> {
        if global_rate == 0 && ip_rate == 0 {
            return None;
        }
        let global_burst = if global_burst == 0 { global_rate * 2 } else { global_burst };
        let ip_burst = if ip_burst == 0 { ip_rate * 2 } else { ip_burst };

        Some(Arc::new(Self {
            global: (global_rate > 0)
                .then(|| TokenBucket::new(global_rate as f64, global_burst as f64)),
            ip_rate,
            ip_burst,
            ip_buckets: DashMap::new(),
        }))
    }

    /// Admission check: global bucket first, then the caller's bucket.
    pub fn allow(&self, ip: IpAddr) -> bool {
        if let Some(global) = &self.global {
            if !global.allow() {
                metrics::counter!(RATE_LIMIT_GLOBAL).increment(1);
                return false;
            }
        }

        if self.ip_rate > 0 {
            let bucket = self
                .ip_buckets
                .entry(ip)
                .or_insert_with(|| {
                    Arc::new(TokenBucket::new(self.ip_rate as f64, self.ip_burst as f64))
                })
                .clone();
            if !bucket.allow() {
                metrics::counter!(RATE_LIMIT_IP).increment(1);
                return false;
            }
        }

        true
    }

    /// Periodic eviction of idle per-IP buckets, until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_idle(),
                _ = cancel.cancelled() => return,
            }
        }
    }

    fn sweep_idle(&self) {
        let before = self.ip_buckets.len();
        self.ip_buckets
            .retain(|_, bucket| bucket.idle_for() < BUCKET_IDLE_MAX);
        let evicted = before.saturating_sub(self.ip_buckets.len());
        if evicted > 0 {
            debug!(evicted, "evicted idle rate-limit buckets");
        }
    }

}

/// Client IP: first valid entry of X-Forwarded-For, else X-Real-IP, else the
/// transport remote address with the port stripped.
pub fn client_ip(headers: &HeaderMap, remote: SocketAddr) -> IpAddr {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let first = xff.split(',').next().unwrap_or("");
        if let Ok(ip) = first.trim_matches([' ', '\t']).parse::<IpAddr>() {
            return ip;
        }
    }
    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if let Ok(ip) = xri.trim_matches([' ', '\t']).parse::<IpAddr>() {
            return ip;
        }
    }
    remote.ip()
}

/// Axum middleware rejecting over-limit clients with 429.
pub async fn middleware(
    State(limiter): State<Arc<Limiter>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(request.headers(), remote);
    if !limiter.allow(ip) {
        return (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    }
    next.run(request).await
}
