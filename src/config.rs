use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Output formats the service can encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IconFormat {
    Png,
    Webp,
    Avif,
    Jpeg,
}

impl IconFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            IconFormat::Png => "image/png",
            IconFormat::Webp => "image/webp",
            IconFormat::Avif => "image/avif",
            IconFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn ext(self) -> &'static str {
        match self {
            IconFormat::Png => "png",
            IconFormat::Webp => "webp",
            IconFormat::Avif => "avif",
            IconFormat::Jpeg => "jpeg",
        }
    }

    /// JPEG payloads carry no alpha channel; such images are composited
    /// over opaque white before encoding.
    pub fn supports_alpha(self) -> bool {
        !matches!(self, IconFormat::Jpeg)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Some(IconFormat::Png),
            "webp" => Some(IconFormat::Webp),
            "avif" => Some(IconFormat::Avif),
            "jpeg" | "jpg" => Some(IconFormat::Jpeg),
            _ => None,
        }
    }
}

impl std::fmt::Display for IconFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.ext())
    }
}

// Requested size bounds; out-of-range values are clamped, not rejected.
pub const MIN_SIZE: u32 = 16;
pub const MAX_SIZE: u32 = 256;
pub const DEFAULT_SIZE: u32 = 32;

/// Cache-Control max-age used for synthetic fallback responses, kept short
/// so clients retry sites whose discovery failed.
pub const FALLBACK_MAX_AGE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct Config {
    /// Full listen address, e.g. "0.0.0.0:9090". Overrides `port`.
    pub listen_addr: Option<String>,
    pub port: Option<u16>,
    pub cache_dir: PathBuf,
    pub cache_ttl: Duration,
    /// Cache-Control max-age; 0 means "use cache_ttl".
    pub browser_max_age: Duration,
    /// Cache-Control s-maxage; 0 means "use browser max-age".
    pub cdn_s_maxage: Duration,
    pub use_etag: bool,
    /// 0 disables the janitor.
    pub janitor_interval: Duration,
    /// 0 disables size-bounded eviction.
    pub max_cache_bytes: u64,
    pub log_level: String,
    /// Global requests/second; 0 = unlimited.
    pub rate_limit: u32,
    /// Global burst capacity; 0 = auto (rate * 2).
    pub rate_limit_burst: u32,
    /// Requests/second per client IP; 0 = unlimited.
    pub ip_rate_limit: u32,
    /// Per-IP burst capacity; 0 = auto (rate * 2).
    pub ip_rate_limit_burst: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: None,
            port: None,
            cache_dir: PathBuf::from("./cache"),
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            browser_max_age: Duration::ZERO,
            cdn_s_maxage: Duration::ZERO,
            use_etag: true,
            janitor_interval: Duration::from_secs(30 * 60),
            max_cache_bytes: 0,
            log_level: "info".into(),
            rate_limit: 0,
            rate_limit_burst: 0,
            ip_rate_limit: 0,
            ip_rate_limit_burst: 0,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cache TTL must be > 0")]
    InvalidTtl,
    #[error("invalid value for {0}: {1}")]
    InvalidEnv(&'static str, String),
}

impl Config {
    /// Build a config from `FAVKIT_*` environment variables (plus `PORT`,
    /// honored by most container platforms). Unset variables keep their
    /// defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        if let Ok(v) = std::env::var("FAVKIT_ADDR") {
            cfg.listen_addr = Some(v);
        }
        cfg.port = env_parse("FAVKIT_PORT")?.or(env_parse("PORT")?);
        if let Ok(v) = std::env::var("FAVKIT_CACHE_DIR") {
            cfg.cache_dir = PathBuf::from(v);
        }
        if let Some(secs) = env_parse::<u64>("FAVKIT_CACHE_TTL_SECS")? {
            cfg.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("FAVKIT_BROWSER_MAX_AGE_SECS")? {
            cfg.browser_max_age = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("FAVKIT_CDN_S_MAXAGE_SECS")? {
            cfg.cdn_s_maxage = Duration::from_secs(secs);
        }
        if let Some(v) = env_parse::<bool>("FAVKIT_ETAG")? {
            cfg.use_etag = v;
        }
        if let Some(secs) = env_parse::<u64>("FAVKIT_JANITOR_INTERVAL_SECS")? {
            cfg.janitor_interval = Duration::from_secs(secs);
        }
        if let Some(v) = env_parse::<u64>("FAVKIT_MAX_CACHE_BYTES")? {
            cfg.max_cache_bytes = v;
        }
        if let Ok(v) = std::env::var("FAVKIT_LOG_LEVEL") {
            cfg.log_level = v;
        }
        if let Some(v) = env_parse::<u32>("FAVKIT_RATE_LIMIT")? {
            cfg.rate_limit = v;
        }
        if let Some(v) = env_parse::<u32>("FAVKIT_RATE_LIMIT_BURST")? {
            cfg.rate_limit_burst = v;
        }
        if let Some(v) = env_parse::<u32>("FAVKIT_IP_RATE_LIMIT")? {
            cfg.ip_rate_limit = v;
        }
        if let Some(v) = env_parse::<u32>("FAVKIT_IP_RATE_LIMIT_BURST")? {
            cfg.ip_rate_limit_burst = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_ttl.is_zero() {
            return Err(ConfigError::InvalidTtl);
        }
        Ok(())
    }

    /// Effective Cache-Control max-age: configured value, or the cache TTL.
    pub fn effective_browser_max_age(&self) -> Duration {
        if self.browser_max_age.is_zero() {
            self.cache_ttl
        } else {
            self.browser_max_age
        }
    }

    /// Effective s-maxage: configured value, or the browser max-age.
    pub fn effective_cdn_s_maxage(&self) -> Duration {
        if self.cdn_s_maxage.is_zero() {
            self.effective_browser_max_age()
        } else {
            self.cdn_s_maxage
        }
    }

    pub fn resolve_listen_addr(&self) -> String {
        if let Some(addr) = &self.listen_addr {
            return addr.clone();
        }
        let port = self.port.unwrap_or(9090);
        format!("0.0.0.0:{port}")
    }
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv(key, raw)),
        Err(_) => Ok(None),
    }
}
