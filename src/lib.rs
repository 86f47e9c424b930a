use std::sync::Arc;
use std::time::SystemTime;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use url::Url;

pub mod cache;
pub mod config;
pub mod discover;
pub mod fetch;
pub mod metrics;
pub mod ratelimit;
pub mod transform;

use crate::cache::{Manager, OrigMeta};
use crate::config::{Config, IconFormat, DEFAULT_SIZE, FALLBACK_MAX_AGE, MAX_SIZE, MIN_SIZE};
use crate::discover::Candidate;
use crate::fetch::{FetchedBody, FetchedIcon, Fetcher};
use crate::transform::Rasterizer;

#[derive(Error, Debug)]
pub enum FaviconError {
    #[error("invalid request: {0}")]
    InvalidInput(String),
    #[error("upstream policy violation: {0}")]
    UpstreamPolicy(String),
    #[error("upstream network error: {0}")]
    UpstreamNetwork(String),
    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("icon rejected as nearly blank or black")]
    Rejected,
    #[error("encode error: {0}")]
    Encode(String),
    #[error("cache I/O error: {0}")]
    CacheIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FaviconError>;

/// A payload ready to serve: resized bytes (or a synthetic fallback) plus
/// the mtime feeding Last-Modified. Cloned to every singleflight co-caller.
#[derive(Clone)]
pub struct ServedIcon {
    pub bytes: Bytes,
    pub mtime: SystemTime,
    pub fallback: bool,
}

type FlightResult = std::result::Result<ServedIcon, Arc<FaviconError>>;

/// Shared collaborators, constructed once in main and injected everywhere.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Manager,
    pub fetcher: Fetcher,
    pub rasterizer: Arc<Rasterizer>,
    pub flights: Arc<cache::Group<FlightResult>>,
    pub limiter: Option<Arc<ratelimit::Limiter>>,
    /// Absent when no Prometheus recorder is installed (tests).
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let cache = Manager::new(config.cache_dir.clone(), config.cache_ttl);
        let limiter = ratelimit::Limiter::new(
            config.rate_limit,
            config.rate_limit_burst,
            config.ip_rate_limit,
            config.ip_rate_limit_burst,
        );
        Ok(Self {
            config: Arc::new(config),
            cache,
            fetcher: Fetcher::new()?,
            rasterizer: Arc::new(Rasterizer::new()),
            flights: Arc::new(cache::Group::new()),
            limiter,
            prometheus: None,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct FaviconQuery {
    pub url: String,
    #[serde(default)]
    pub size: Option<u32>,
    #[serde(default)]
    pub format: Option<String>,
}

/// Normalized site identity plus the origin URL discovery will fetch.
/// The site (lower-cased host, scheme stripped) is the cache and flight
/// namespace.
pub fn parse_site(input: &str) -> Result<(String, Url)> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(FaviconError::InvalidInput("url must not be empty".into()));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let parsed = Url::parse(&with_scheme)
        .map_err(|e| FaviconError::InvalidInput(format!("unparseable url: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| FaviconError::InvalidInput("url has no host".into()))?
        .to_ascii_lowercase();

    let mut origin = parsed;
    origin.set_path("/");
    origin.set_query(None);
    origin.set_fragment(None);
    Ok((host, origin))
}

fn resolve_format(param: Option<&str>, headers: &HeaderMap) -> Result<IconFormat> {
    if let Some(p) = param {
        return IconFormat::parse(p)
            .ok_or_else(|| FaviconError::InvalidInput(format!("unsupported format {p:?}")));
    }
    // No explicit format: let Accept pick a better encoding than the default.
    if let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) {
        if accept.contains("image/avif") {
            return Ok(IconFormat::Avif);
        }
        if accept.contains("image/webp") {
            return Ok(IconFormat::Webp);
        }
        if accept.contains("image/jpeg") {
            return Ok(IconFormat::Jpeg);
        }
    }
    Ok(IconFormat::Png)
}

async fn favicon_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FaviconQuery>,
) -> Response {
    let size = query.size.unwrap_or(DEFAULT_SIZE).clamp(MIN_SIZE, MAX_SIZE);
    let format = match resolve_format(query.format.as_deref(), &headers) {
        Ok(f) => f,
        Err(e) => return error_response(&e),
    };
    let (site, origin) = match parse_site(&query.url) {
        Ok(v) => v,
        Err(e) => return error_response(&e),
    };

    // Resized-tier hit short-circuits everything.
    if let Some((bytes, mtime)) = state.cache.read_resized(&site, size, format).await {
        ::metrics::counter!(crate::metrics::CACHE_HITS, "tier" => "resized").increment(1);
        return build_response(&state, &headers, Bytes::from(bytes), mtime, format, false);
    }

    let flight_key = format!("{site}|{size}|{format}");
    let flight_state = state.clone();
    let flight_site = site.clone();
    let outcome = state
        .flights
        .run(&flight_key, async move {
            produce_icon(flight_state, flight_site, origin, size, format)
                .await
                .map_err(Arc::new)
        })
        .await;

    match outcome {
        Ok(icon) => build_response(&state, &headers, icon.bytes, icon.mtime, format, icon.fallback),
        Err(err) => error_response(&err),
    }
}

/// The work inside a flight: original-tier lookup, conditional revalidation,
/// discovery, candidate iteration, fallback. Runs in a spawned task, so it
/// completes (and populates the cache) even if every caller disconnects.
async fn produce_icon(
    state: AppState,
    site: String,
    origin: Url,
    size: u32,
    format: IconFormat,
) -> Result<ServedIcon> {
    // A racing flight may have filled the resized tier after our miss.
    if let Some((bytes, mtime)) = state.cache.read_resized(&site, size, format).await {
        ::metrics::counter!(crate::metrics::CACHE_HITS, "tier" => "resized").increment(1);
        return Ok(ServedIcon {
            bytes: Bytes::from(bytes),
            mtime,
            fallback: false,
        });
    }

    // Fresh original: normalize without touching the network.
    if let Some(original) = state.cache.read_original(&site).await {
        ::metrics::counter!(crate::metrics::CACHE_HITS, "tier" => "orig").increment(1);
        match transform::normalize(&original, None, size, format, &state.rasterizer) {
            Ok(encoded) => return Ok(store_resized(&state, &site, size, format, encoded).await),
            Err(err) => debug!(site, "cached original unusable: {err}"),
        }
    }

    // Stale original with a validator: try a conditional refetch before
    // falling back to full discovery.
    if let Some(meta) = state.cache.read_validator(&site).await {
        if let Some(icon) = revalidate(&state, &site, &meta, size, format).await {
            return Ok(icon);
        }
    }

    let mut last_err: Option<FaviconError> = None;
    match state.fetcher.fetch_html(&origin).await {
        Ok((html, base)) => {
            for candidate in discover::discover_icons(&html, &base) {
                match try_candidate(&state, &site, &candidate, size, format).await {
                    Ok(icon) => return Ok(icon),
                    Err(err) => {
                        debug!(url = %candidate.url, "candidate failed: {err}");
                        last_err = Some(err);
                    }
                }
            }
        }
        Err(err) => {
            debug!(site, origin = %origin, "discovery fetch failed: {err}");
            last_err = Some(err);
        }
    }

    // Candidates exhausted: serve the synthetic globe.
    ::metrics::counter!(crate::metrics::UPSTREAM_EXHAUSTED).increment(1);
    if let Some((bytes, mtime)) = state.cache.read_fallback(size, format).await {
        ::metrics::counter!(crate::metrics::CACHE_HITS, "tier" => "fallback").increment(1);
        return Ok(ServedIcon {
            bytes: Bytes::from(bytes),
            mtime,
            fallback: true,
        });
    }
    match transform::fallback_icon(size, format, &state.rasterizer) {
        Ok(encoded) => {
            if let Err(err) = state.cache.write_fallback(size, format, &encoded).await {
                warn!(site, "fallback cache write failed: {err}");
            }
            Ok(ServedIcon {
                bytes: Bytes::from(encoded),
                mtime: SystemTime::now(),
                fallback: true,
            })
        }
        Err(fallback_err) => Err(last_err.unwrap_or(fallback_err)),
    }
}

/// Conditional refetch of the validator's icon URL. `None` means the caller
/// should continue with full discovery.
async fn revalidate(
    state: &AppState,
    site: &str,
    meta: &OrigMeta,
    size: u32,
    format: IconFormat,
) -> Option<ServedIcon> {
    let icon_url = Url::parse(&meta.url).ok()?;
    match state.fetcher.fetch_icon(&icon_url, Some(meta)).await {
        Ok(FetchedIcon::NotModified) => {
            if let Err(err) = state.cache.touch_original(site).await {
                debug!(site, "touch after 304 failed: {err}");
                return None;
            }
            let original = state.cache.read_original(site).await?;
            let encoded =
                transform::normalize(&original, None, size, format, &state.rasterizer).ok()?;
            Some(store_resized(state, site, size, format, encoded).await)
        }
        Ok(FetchedIcon::Fresh(body)) => {
            let encoded = transform::normalize(
                &body.bytes,
                body.content_type.as_deref(),
                size,
                format,
                &state.rasterizer,
            )
            .ok()?;
            store_original(state, site, &icon_url, &body).await;
            Some(store_resized(state, site, size, format, encoded).await)
        }
        Err(err) => {
            debug!(site, url = %icon_url, "revalidation failed: {err}");
            None
        }
    }
}

/// Fetch one discovery candidate and push it through the pipeline. Any
/// error advances the caller to the next candidate.
async fn try_candidate(
    state: &AppState,
    site: &str,
    candidate: &Candidate,
    size: u32,
    format: IconFormat,
) -> Result<ServedIcon> {
    let fetched = state.fetcher.fetch_icon(&candidate.url, None).await?;
    let FetchedIcon::Fresh(body) = fetched else {
        // Unconditional requests never yield 304.
        return Err(FaviconError::UpstreamStatus(304));
    };
    let declared = candidate.mime.as_deref().or(body.content_type.as_deref());
    let encoded = transform::normalize(&body.bytes, declared, size, format, &state.rasterizer)?;
    store_original(state, site, &candidate.url, &body).await;
    Ok(store_resized(state, site, size, format, encoded).await)
}

/// Cache writes never fail a live response; failures are logged and the
/// response is served from memory.
async fn store_original(state: &AppState, site: &str, icon_url: &Url, body: &FetchedBody) {
    if let Err(err) = state.cache.write_original(site, &body.bytes).await {
        warn!(site, "original cache write failed: {err}");
        return;
    }
    let meta = OrigMeta {
        url: icon_url.to_string(),
        etag: body.etag.clone(),
        last_modified: body.last_modified.clone(),
        updated_at: Utc::now(),
    };
    if let Err(err) = state.cache.write_validator(site, &meta).await {
        warn!(site, "validator write failed: {err}");
    }
}

async fn store_resized(
    state: &AppState,
    site: &str,
    size: u32,
    format: IconFormat,
    encoded: Vec<u8>,
) -> ServedIcon {
    if let Err(err) = state.cache.write_resized(site, size, format, &encoded).await {
        warn!(site, "resized cache write failed: {err}");
    }
    ServedIcon {
        bytes: Bytes::from(encoded),
        mtime: SystemTime::now(),
        fallback: false,
    }
}

fn error_response(err: &FaviconError) -> Response {
    let status = match err {
        FaviconError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, err.to_string()).into_response()
}

/// Assemble the final response, honoring client conditional headers.
fn build_response(
    state: &AppState,
    req_headers: &HeaderMap,
    bytes: Bytes,
    mtime: SystemTime,
    format: IconFormat,
    fallback: bool,
) -> Response {
    let etag = state
        .config
        .use_etag
        .then(|| format!("\"{}\"", hex::encode(Sha256::digest(&bytes))));

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.content_type()),
    );
    let (max_age, s_maxage) = if fallback {
        (FALLBACK_MAX_AGE, FALLBACK_MAX_AGE)
    } else {
        (
            state.config.effective_browser_max_age(),
            state.config.effective_cdn_s_maxage(),
        )
    };
    if let Ok(value) = HeaderValue::from_str(&format!(
        "public, max-age={}, s-maxage={}",
        max_age.as_secs(),
        s_maxage.as_secs()
    )) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    if let Some(etag) = &etag {
        if let Ok(value) = HeaderValue::from_str(etag) {
            headers.insert(header::ETAG, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&http_date(mtime)) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    headers.insert(header::VARY, HeaderValue::from_static("Accept"));

    if not_modified(req_headers, etag.as_deref(), mtime) {
        return (StatusCode::NOT_MODIFIED, headers).into_response();
    }
    (StatusCode::OK, headers, bytes).into_response()
}

/// RFC 7232 conditional evaluation: If-None-Match wins when present,
/// otherwise If-Modified-Since is compared at whole-second precision.
fn not_modified(req_headers: &HeaderMap, etag: Option<&str>, mtime: SystemTime) -> bool {
    if let Some(inm) = req_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        let Some(etag) = etag else { return false };
        return inm
            .split(',')
            .map(str::trim)
            .any(|candidate| candidate == "*" || candidate == etag);
    }
    if let Some(ims) = req_headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
    {
        if let Ok(since) = DateTime::parse_from_rfc2822(ims) {
            let mtime_secs = DateTime::<Utc>::from(mtime).timestamp();
            return mtime_secs <= since.timestamp();
        }
    }
    false
}

fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state
        .prometheus
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
        .into_response()
}

/// Build the service router. Layer order mirrors the original chain:
/// tracing outermost, then metrics tracking, with rate limiting closest to
/// the handler so rejected requests are still traced and counted.
pub fn router(state: AppState) -> Router {
    let limiter = state.limiter.clone();
    let mut app = Router::new()
        .route("/favicons", get(favicon_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);
    if let Some(limiter) = limiter {
        app = app.layer(axum::middleware::from_fn_with_state(
            limiter,
            ratelimit::middleware,
        ));
    }
    app.layer(axum::middleware::from_fn(metrics::track))
        .layer(TraceLayer::new_for_http())
}
