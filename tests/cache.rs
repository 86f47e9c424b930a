use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use favkit::cache::{janitor, Manager, OrigMeta, META_SUFFIX, TMP_PREFIX};
use favkit::config::IconFormat;

const TTL: Duration = Duration::from_secs(3600);

fn manager(dir: &Path) -> Manager {
    Manager::new(dir.to_path_buf(), TTL)
}

fn backdate(path: &Path, age: Duration) {
    let file = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .expect("open for backdating");
    let then = SystemTime::now() - age;
    file.set_times(
        std::fs::FileTimes::new()
            .set_accessed(then)
            .set_modified(then),
    )
    .expect("set_times");
}

#[tokio::test]
async fn original_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cache = manager(dir.path());
    cache.ensure_dirs().await.unwrap();

    assert!(cache.read_original("example.com").await.is_none());
    cache.write_original("example.com", b"icon-bytes").await.unwrap();
    assert_eq!(
        cache.read_original("example.com").await.unwrap(),
        b"icon-bytes"
    );
    // distinct sites get distinct keys
    assert!(cache.read_original("other.com").await.is_none());
}

#[tokio::test]
async fn stale_original_is_a_miss_until_touched() {
    let dir = tempfile::tempdir().unwrap();
    let cache = manager(dir.path());
    cache.ensure_dirs().await.unwrap();

    cache.write_original("example.com", b"old").await.unwrap();
    let key_path = only_file(&dir.path().join("orig"));
    backdate(&key_path, TTL + Duration::from_secs(60));

    assert!(cache.read_original("example.com").await.is_none());

    cache.touch_original("example.com").await.unwrap();
    assert_eq!(cache.read_original("example.com").await.unwrap(), b"old");
}

#[tokio::test]
async fn validator_sidecar_round_trip_and_orphan() {
    let dir = tempfile::tempdir().unwrap();
    let cache = manager(dir.path());
    cache.ensure_dirs().await.unwrap();

    cache.write_original("example.com", b"payload").await.unwrap();
    let meta = OrigMeta {
        url: "https://example.com/a.png".into(),
        etag: "\"v1\"".into(),
        last_modified: String::new(),
        updated_at: Utc::now(),
    };
    cache.write_validator("example.com", &meta).await.unwrap();

    let read = cache.read_validator("example.com").await.unwrap();
    assert_eq!(read.url, "https://example.com/a.png");
    assert_eq!(read.etag, "\"v1\"");

    // an orphaned sidecar must never produce a hit
    let payload = dir
        .path()
        .join("orig")
        .join(favkit::cache::orig_key("example.com"));
    std::fs::remove_file(payload).unwrap();
    assert!(cache.read_validator("example.com").await.is_none());
}

#[tokio::test]
async fn resized_entries_carry_format_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let cache = manager(dir.path());
    cache.ensure_dirs().await.unwrap();

    cache
        .write_resized("example.com", 32, IconFormat::Webp, b"webp-bytes")
        .await
        .unwrap();
    let path = cache.resized_path("example.com", 32, IconFormat::Webp);
    assert!(path.to_str().unwrap().ends_with(".webp"));
    assert!(path.exists());

    let (bytes, mtime) = cache
        .read_resized("example.com", 32, IconFormat::Webp)
        .await
        .unwrap();
    assert_eq!(bytes, b"webp-bytes");
    assert!(mtime.elapsed().unwrap() < Duration::from_secs(5));

    // same site, different size/format: different entries
    assert!(cache
        .read_resized("example.com", 64, IconFormat::Webp)
        .await
        .is_none());
    assert!(cache
        .read_resized("example.com", 32, IconFormat::Png)
        .await
        .is_none());
}

#[tokio::test]
async fn no_temp_files_survive_a_write() {
    let dir = tempfile::tempdir().unwrap();
    let cache = manager(dir.path());
    cache.ensure_dirs().await.unwrap();

    for i in 0..10u32 {
        cache
            .write_original("example.com", format!("payload-{i}").as_bytes())
            .await
            .unwrap();
    }
    let temps: Vec<_> = std::fs::read_dir(dir.path().join("orig"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(TMP_PREFIX))
        })
        .collect();
    assert!(temps.is_empty(), "temp files left behind: {temps:?}");
    assert_eq!(
        cache.read_original("example.com").await.unwrap(),
        b"payload-9"
    );
}

#[tokio::test]
async fn janitor_removes_expired_payloads_and_their_sidecars() {
    let dir = tempfile::tempdir().unwrap();
    let cache = manager(dir.path());
    cache.ensure_dirs().await.unwrap();

    cache.write_original("stale.com", b"stale").await.unwrap();
    let meta = OrigMeta {
        url: "https://stale.com/i.png".into(),
        etag: String::new(),
        last_modified: String::new(),
        updated_at: Utc::now(),
    };
    cache.write_validator("stale.com", &meta).await.unwrap();
    cache.write_original("fresh.com", b"fresh").await.unwrap();

    let stale_payload = dir
        .path()
        .join("orig")
        .join(favkit::cache::orig_key("stale.com"));
    backdate(&stale_payload, TTL + Duration::from_secs(1));

    janitor::sweep_once(dir.path(), TTL, 0);

    assert!(!stale_payload.exists());
    let sidecar = dir
        .path()
        .join("orig")
        .join(format!("{}{META_SUFFIX}", favkit::cache::orig_key("stale.com")));
    assert!(!sidecar.exists());
    assert!(cache.read_original("fresh.com").await.is_some());
}

#[tokio::test]
async fn janitor_removes_orphan_sidecars_and_stale_temps() {
    let dir = tempfile::tempdir().unwrap();
    let cache = manager(dir.path());
    cache.ensure_dirs().await.unwrap();

    let orig = dir.path().join("orig");
    std::fs::write(orig.join("deadbeef.meta"), b"{}").unwrap();

    let stale_tmp = orig.join(format!("{TMP_PREFIX}abc123"));
    std::fs::write(&stale_tmp, b"partial").unwrap();
    backdate(&stale_tmp, Duration::from_secs(6 * 60));
    let fresh_tmp = orig.join(format!("{TMP_PREFIX}def456"));
    std::fs::write(&fresh_tmp, b"partial").unwrap();

    janitor::sweep_once(dir.path(), TTL, 0);

    assert!(!orig.join("deadbeef.meta").exists(), "orphan meta kept");
    assert!(!stale_tmp.exists(), "stale temp kept");
    assert!(fresh_tmp.exists(), "fresh temp removed");
}

#[tokio::test]
async fn janitor_enforces_size_limit_oldest_first() {
    let dir = tempfile::tempdir().unwrap();
    let cache = manager(dir.path());
    cache.ensure_dirs().await.unwrap();

    // ten 200-byte payloads with ascending ages: site-0 oldest
    for i in 0..10u32 {
        let site = format!("site-{i}.com");
        cache.write_original(&site, &[b'x'; 200]).await.unwrap();
        let path = dir.path().join("orig").join(favkit::cache::orig_key(&site));
        backdate(&path, Duration::from_secs(600 - 60 * u64::from(i)));
    }

    // limit admits five payloads
    janitor::sweep_once(dir.path(), TTL, 1000);

    for i in 0..5u32 {
        let site = format!("site-{i}.com");
        assert!(
            cache.read_original(&site).await.is_none(),
            "oldest payload {site} survived"
        );
    }
    for i in 5..10u32 {
        let site = format!("site-{i}.com");
        assert!(
            cache.read_original(&site).await.is_some(),
            "newest payload {site} evicted"
        );
    }
}

#[tokio::test]
async fn janitor_ignores_files_outside_tier_directories() {
    let dir = tempfile::tempdir().unwrap();
    let cache = manager(dir.path());
    cache.ensure_dirs().await.unwrap();

    let stray = dir.path().join("README");
    std::fs::write(&stray, b"not a cache file").unwrap();
    backdate(&stray, TTL + Duration::from_secs(60));

    janitor::sweep_once(dir.path(), TTL, 1);
    assert!(stray.exists());
}

fn only_file(dir: &Path) -> std::path::PathBuf {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    assert_eq!(files.len(), 1, "expected exactly one file in {dir:?}");
    files.pop().unwrap()
}
