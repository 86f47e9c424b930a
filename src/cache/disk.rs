use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;

use crate::cache::{fallback_key, orig_key, resized_key, OrigMeta, META_SUFFIX, TMP_PREFIX};
use crate::config::IconFormat;

/// Disk cache manager for the three payload tiers.
///
/// Freshness is derived from file mtime: a read is a hit only while
/// `now - mtime <= ttl`. Readers tolerate the janitor deleting a file
/// between stat and read by degrading to a miss.
#[derive(Clone)]
pub struct Manager {
    root: PathBuf,
    ttl: Duration,
}

impl Manager {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn orig_dir(&self) -> PathBuf {
        self.root.join("orig")
    }

    pub fn resized_dir(&self) -> PathBuf {
        self.root.join("resized")
    }

    pub fn fallback_dir(&self) -> PathBuf {
        self.root.join("fallback")
    }

    /// Create the tier directories (idempotent, mode 0755 via umask).
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [self.orig_dir(), self.resized_dir(), self.fallback_dir()] {
            fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    fn orig_path(&self, site: &str) -> PathBuf {
        self.orig_dir().join(orig_key(site))
    }

    fn meta_path(&self, site: &str) -> PathBuf {
        self.orig_dir().join(format!("{}{META_SUFFIX}", orig_key(site)))
    }

    /// On-disk location of a resized artifact. The encoded format rides in
    /// the filename suffix so entries can be served without re-sniffing.
    pub fn resized_path(&self, site: &str, size: u32, format: IconFormat) -> PathBuf {
        self.resized_dir()
            .join(format!("{}.{}", resized_key(site, size, format), format.ext()))
    }

    pub fn fallback_path(&self, size: u32, format: IconFormat) -> PathBuf {
        self.fallback_dir()
            .join(format!("{}.{}", fallback_key(size, format), format.ext()))
    }

    pub async fn read_original(&self, site: &str) -> Option<Vec<u8>> {
        read_fresh(&self.orig_path(site), self.ttl).await.map(|(b, _)| b)
    }

    pub async fn write_original(&self, site: &str, bytes: &[u8]) -> std::io::Result<()> {
        atomic_write(&self.orig_path(site), bytes).await
    }

    /// Extend the freshness of a cached original after a 304 revalidation,
    /// without rewriting its bytes. Updates both atime and mtime.
    pub async fn touch_original(&self, site: &str) -> std::io::Result<()> {
        let path = self.orig_path(site);
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new().append(true).open(&path)?;
            let now = SystemTime::now();
            file.set_times(
                std::fs::FileTimes::new().set_accessed(now).set_modified(now),
            )
        })
        .await
        .map_err(std::io::Error::other)?
    }

    /// Read the validator sidecar. Not TTL-gated: a stale original plus its
    /// validator is exactly what permits a conditional refetch. Returns
    /// `None` when the sidecar is absent, unreadable, or orphaned (paired
    /// payload gone) — orphans must never produce a hit.
    pub async fn read_validator(&self, site: &str) -> Option<OrigMeta> {
        let data = fs::read(self.meta_path(site)).await.ok()?;
        let meta: OrigMeta = serde_json::from_slice(&data).ok()?;
        if fs::metadata(self.orig_path(site)).await.is_err() {
            return None;
        }
        Some(meta)
    }

    pub async fn write_validator(&self, site: &str, meta: &OrigMeta) -> std::io::Result<()> {
        let data = serde_json::to_vec_pretty(meta).map_err(std::io::Error::other)?;
        atomic_write(&self.meta_path(site), &data).await
    }

    /// Read a resized artifact; the mtime feeds the Last-Modified header.
    pub async fn read_resized(
        &self,
        site: &str,
        size: u32,
        format: IconFormat,
    ) -> Option<(Vec<u8>, SystemTime)> {
        read_fresh(&self.resized_path(site, size, format), self.ttl).await
    }

    pub async fn write_resized(
        &self,
        site: &str,
        size: u32,
        format: IconFormat,
        bytes: &[u8],
    ) -> std::io::Result<()> {
        atomic_write(&self.resized_path(site, size, format), bytes).await
    }

    pub async fn read_fallback(
        &self,
        size: u32,
        format: IconFormat,
    ) -> Option<(Vec<u8>, SystemTime)> {
        read_fresh(&self.fallback_path(size, format), self.ttl).await
    }

    pub async fn write_fallback(
        &self,
        size: u32,
        format: IconFormat,
        bytes: &[u8],
    ) -> std::io::Result<()> {
        atomic_write(&self.fallback_path(size, format), bytes).await
    }
}

/// TTL-gated read. A file that disappears between the stat and the read
/// (janitor race) is a miss, not an error.
async fn read_fresh(path: &Path, ttl: Duration) -> Option<(Vec<u8>, SystemTime)> {
    let meta = fs::metadata(path).await.ok()?;
    let mtime = meta.modified().ok()?;
    match mtime.elapsed() {
        Ok(age) if age <= ttl => {}
        Ok(_) => return None,
        // mtime in the future (clock skew): treat as fresh.
        Err(_) => {}
    }
    let bytes = fs::read(path).await.ok()?;
    Some((bytes, mtime))
}

/// Atomic write: temp sibling in the target directory, write, fsync, rename
/// over the final name. `NamedTempFile` unlinks the temp on any failure path.
async fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let path = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || {
        let dir = path
            .parent()
            .ok_or_else(|| std::io::Error::other("cache path has no parent"))?;
        let mut tmp = tempfile::Builder::new()
            .prefix(TMP_PREFIX)
            .tempfile_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}
