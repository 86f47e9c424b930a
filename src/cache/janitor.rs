use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::{META_SUFFIX, TMP_PREFIX};

/// Temp files from interrupted atomic writes are garbage after this long.
const TEMP_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Delay before the first sweep, so startup traffic isn't competing with a
/// full directory walk.
const START_DELAY: Duration = Duration::from_secs(2);

/// Background eviction loop: waits a short delay, sweeps once, then sweeps
/// on every tick until cancelled. Each sweep runs on the blocking pool; a
/// panicking sweep surfaces as a join error and is logged, so the ticker
/// survives.
pub async fn run(
    root: PathBuf,
    interval: Duration,
    ttl: Duration,
    max_size: u64,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = tokio::time::sleep(START_DELAY) => {}
        _ = cancel.cancelled() => return,
    }

    info!(
        interval_secs = interval.as_secs(),
        ttl_secs = ttl.as_secs(),
        max_size,
        "janitor started"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick completes immediately

    loop {
        sweep_guarded(root.clone(), ttl, max_size).await;
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => {
                info!("janitor stopped");
                return;
            }
        }
    }
}

async fn sweep_guarded(root: PathBuf, ttl: Duration, max_size: u64) {
    let result = tokio::task::spawn_blocking(move || sweep_once(&root, ttl, max_size)).await;
    if let Err(join_err) = result {
        error!("janitor sweep panicked: {join_err}");
    }
}

struct FileEntry {
    path: PathBuf,
    size: u64,
    mtime: SystemTime,
}

/// One full pass over the cache root: expire payloads (with their paired
/// sidecars), drop orphan sidecars, drop stale temps, then enforce the size
/// bound oldest-mtime-first.
pub fn sweep_once(root: &Path, ttl: Duration, max_size: u64) {
    let now = SystemTime::now();

    let mut payloads: Vec<PathBuf> = Vec::new();
    let mut temps: Vec<PathBuf> = Vec::new();
    // payload path (without .meta) -> sidecar path
    let mut sidecars: HashMap<PathBuf, PathBuf> = HashMap::new();

    walk(root, &mut |path| {
        if !is_cache_file(path) {
            return;
        }
        let base = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if base.starts_with(TMP_PREFIX) {
            temps.push(path.to_path_buf());
        } else if let Some(stripped) = path.to_str().and_then(|p| p.strip_suffix(META_SUFFIX)) {
            sidecars.insert(PathBuf::from(stripped), path.to_path_buf());
        } else {
            payloads.push(path.to_path_buf());
        }
    });

    let mut expired = 0usize;
    let mut orphans = 0usize;
    let mut stale_temps = 0usize;

    // Pass 1: expired payloads and their sidecars.
    let mut remaining: HashSet<PathBuf> = HashSet::with_capacity(payloads.len());
    for path in &payloads {
        match age_of(path, now) {
            Some(age) if age > ttl => {
                if std::fs::remove_file(path).is_ok() {
                    expired += 1;
                    if let Some(meta) = sidecars.remove(path) {
                        let _ = std::fs::remove_file(meta);
                    }
                    continue;
                }
            }
            Some(_) => {}
            None => continue, // raced away
        }
        remaining.insert(path.clone());
    }

    // Pass 2: orphan sidecars.
    for (payload, meta) in &sidecars {
        if !remaining.contains(payload) && std::fs::remove_file(meta).is_ok() {
            orphans += 1;
        }
    }

    // Pass 3: stale temps.
    for path in &temps {
        if matches!(age_of(path, now), Some(age) if age > TEMP_MAX_AGE)
            && std::fs::remove_file(path).is_ok()
        {
            stale_temps += 1;
        }
    }

    if expired > 0 || orphans > 0 || stale_temps > 0 {
        info!(expired, orphans, stale_temps, "janitor purged cache files");
    }

    if max_size > 0 {
        evict_to_size(root, max_size);
    }
}

/// Remove surviving payloads oldest-mtime-first (plus paired sidecars) until
/// the payload total is at or below the limit. Sidecars and temps are not
/// counted: sidecars are tiny and tied to payloads, temps have their own
/// sweep.
fn evict_to_size(root: &Path, max_size: u64) {
    let mut files: Vec<FileEntry> = Vec::new();
    let mut total: u64 = 0;

    walk(root, &mut |path| {
        if !is_cache_file(path) {
            return;
        }
        let base = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if base.starts_with(TMP_PREFIX) || base.ends_with(META_SUFFIX) {
            return;
        }
        let Ok(meta) = std::fs::metadata(path) else {
            return;
        };
        let Ok(mtime) = meta.modified() else { return };
        total += meta.len();
        files.push(FileEntry {
            path: path.to_path_buf(),
            size: meta.len(),
            mtime,
        });
    });

    if total <= max_size || files.is_empty() {
        return;
    }

    files.sort_by_key(|f| f.mtime);

    let mut evicted = 0usize;
    let mut freed: u64 = 0;
    for entry in &files {
        if total <= max_size {
            break;
        }
        if std::fs::remove_file(&entry.path).is_ok() {
            total -= entry.size;
            freed += entry.size;
            evicted += 1;
            let meta_path = PathBuf::from(format!("{}{META_SUFFIX}", entry.path.display()));
            let _ = std::fs::remove_file(meta_path);
        }
    }

    if evicted > 0 {
        info!(evicted, freed, remaining = total, "janitor evicted by size limit");
    }
}

/// Only files under a tier directory (`orig`, `resized`, `fallback` as a
/// full path component) are cache files; everything else in the root is
/// ignored.
fn is_cache_file(path: &Path) -> bool {
    let mut components = path.components().rev().skip(1); // skip basename
    components.any(|c| {
        matches!(
            c.as_os_str().to_str(),
            Some("orig") | Some("resized") | Some("fallback")
        )
    })
}

fn age_of(path: &Path, now: SystemTime) -> Option<Duration> {
    let mtime = std::fs::metadata(path).ok()?.modified().ok()?;
    // Future mtimes count as age zero.
    Some(now.duration_since(mtime).unwrap_or(Duration::ZERO))
}

fn walk(dir: &Path, visit: &mut impl FnMut(&Path)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => walk(&path, visit),
            Ok(ft) if ft.is_file() => visit(&path),
            _ => {}
        }
    }
}
