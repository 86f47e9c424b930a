//! Three-tier disk cache for favicon payloads: original upstream bytes,
//! resized/re-encoded artifacts, and synthetic fallbacks.

pub mod disk;
pub mod janitor;
pub mod singleflight;

pub use disk::Manager;
pub use singleflight::Group;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Validator sidecar stored next to an original-tier payload. `url` is the
/// icon URL the bytes were fetched from; `etag` / `last_modified` drive
/// conditional revalidation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrigMeta {
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_modified: String,
    pub updated_at: DateTime<Utc>,
}

/// Basename prefix of in-progress atomic writes. Files carrying it are
/// transient and swept by the janitor once stale.
pub const TMP_PREFIX: &str = ".tmp-";

/// Sidecar suffix for original-tier validators.
pub const META_SUFFIX: &str = ".meta";

/// Cache key: lowercase hex sha256 over a tier-prefixed canonical string.
/// The 256-bit key is the sole per-URL namespace; collisions are treated as
/// impossible.
pub fn hash_key(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn orig_key(site: &str) -> String {
    hash_key(&format!("orig|{site}"))
}

pub fn resized_key(site: &str, size: u32, format: crate::config::IconFormat) -> String {
    hash_key(&format!("res|{site}|{size}|{format}"))
}

pub fn fallback_key(size: u32, format: crate::config::IconFormat) -> String {
    hash_key(&format!("fb|{size}|{format}"))
}
