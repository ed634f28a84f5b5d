//! Durable pipeline state + archive retrieval: data layout, fingerprint
//! store, HTTP archive fetcher with bounded retries, failure manifest and
//! the run lock.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lvr-storage";

/// Pseudo period id for the current publication window. The feed serves it
/// from a different URL than the seasonal archives.
pub const CURRENT_PERIOD: &str = "latest_notice";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("state io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serializing state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("another run holds the lock at {path}")]
    Locked { path: PathBuf },
}

fn io_at(path: impl Into<PathBuf>, source: io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.into(),
        source,
    }
}

/// On-disk layout of one data root. Every component resolves paths through
/// this so tests can point the whole pipeline at a temp directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn old_dir(&self) -> PathBuf {
        self.root.join("old")
    }

    pub fn failures_dir(&self) -> PathBuf {
        self.root.join("failures")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn period_dir(&self, period_id: &str) -> PathBuf {
        self.raw_dir().join(period_id)
    }

    pub fn zip_path(&self, period_id: &str) -> PathBuf {
        self.raw_dir().join(format!("{period_id}.zip"))
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.raw_dir().join("fetch_options.json")
    }

    pub fn ensure(&self) -> Result<(), PersistenceError> {
        for dir in [
            self.raw_dir(),
            self.old_dir(),
            self.failures_dir(),
            self.reports_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| io_at(&dir, e))?;
        }
        Ok(())
    }

    /// Remove the extracted directory and any leftover archive for a period.
    pub fn purge_period(&self, period_id: &str) -> Result<(), PersistenceError> {
        let dir = self.period_dir(period_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| io_at(&dir, e))?;
        }
        let zip = self.zip_path(period_id);
        if zip.exists() {
            fs::remove_file(&zip).map_err(|e| io_at(&zip, e))?;
        }
        Ok(())
    }

    /// Move a processed period directory to `old/{period}_{stamp}/`. A
    /// missing source directory is not an error (nothing was extracted).
    pub fn archive_period(
        &self,
        period_id: &str,
        stamp: &str,
    ) -> Result<Option<PathBuf>, PersistenceError> {
        let source = self.period_dir(period_id);
        if !source.exists() {
            return Ok(None);
        }
        let old_dir = self.old_dir();
        fs::create_dir_all(&old_dir).map_err(|e| io_at(&old_dir, e))?;
        let dest = old_dir.join(format!("{period_id}_{stamp}"));
        fs::rename(&source, &dest).map_err(|e| io_at(&dest, e))?;
        Ok(Some(dest))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    FirstRun,
    Updated,
    Unchanged,
}

impl ChangeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FirstRun => "first run",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeOutcome {
    pub changed: bool,
    pub reason: ChangeReason,
}

/// Persists the notice content hash plus a first-run flag, and decides
/// whether freshly parsed content differs from what was stored.
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    dir: PathBuf,
}

impl FingerprintStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn hash_path(&self) -> PathBuf {
        self.dir.join("latest_notice.hash")
    }

    fn notice_path(&self) -> PathBuf {
        self.dir.join("latest_notice.json")
    }

    fn init_flag_path(&self) -> PathBuf {
        self.dir.join(".init_done")
    }

    /// Hash of the canonical JSON form. Callers pass content whose
    /// serialization has a stable key order (BTreeMap), so semantically
    /// identical content always hashes identically.
    pub fn compute_hash<T: Serialize>(content: &T) -> Result<String, PersistenceError> {
        let json = serde_json::to_string(content)?;
        Ok(sha256_hex(json.as_bytes()))
    }

    fn persist<T: Serialize>(&self, content: &T, hash: &str) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_at(&self.dir, e))?;
        let json = serde_json::to_vec_pretty(content)?;
        fs::write(self.notice_path(), json).map_err(|e| io_at(self.notice_path(), e))?;
        fs::write(self.hash_path(), hash).map_err(|e| io_at(self.hash_path(), e))?;
        Ok(())
    }

    pub fn check_and_update<T: Serialize>(
        &self,
        content: &T,
    ) -> Result<ChangeOutcome, PersistenceError> {
        let hash = Self::compute_hash(content)?;

        if !self.init_flag_path().exists() {
            self.persist(content, &hash)?;
            let stamp = format!("initialized at {}", Utc::now().to_rfc3339());
            fs::write(self.init_flag_path(), stamp)
                .map_err(|e| io_at(self.init_flag_path(), e))?;
            return Ok(ChangeOutcome {
                changed: true,
                reason: ChangeReason::FirstRun,
            });
        }

        let previous = match fs::read_to_string(self.hash_path()) {
            Ok(text) => text.trim().to_string(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_at(self.hash_path(), e)),
        };

        if previous != hash {
            self.persist(content, &hash)?;
            return Ok(ChangeOutcome {
                changed: true,
                reason: ChangeReason::Updated,
            });
        }

        Ok(ChangeOutcome {
            changed: false,
            reason: ChangeReason::Unchanged,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Fixed-interval retry: every attempt sleeps the same delay.
    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("writing archive {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("archive missing at {path}")]
    Missing { path: PathBuf },
    #[error("corrupt archive {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("extract io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

#[derive(Debug, Clone)]
pub struct ArchiveEndpoints {
    pub current_url: String,
    pub season_url: String,
    pub file_name: String,
}

impl Default for ArchiveEndpoints {
    fn default() -> Self {
        Self {
            current_url: "https://plvr.land.moi.gov.tw/Download".to_string(),
            season_url: "https://plvr.land.moi.gov.tw/DownloadSeason".to_string(),
            file_name: "lvr_landcsv.zip".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveClientConfig {
    pub endpoints: ArchiveEndpoints,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for ArchiveClientConfig {
    fn default() -> Self {
        Self {
            endpoints: ArchiveEndpoints::default(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Downloads one period's compressed archive and unpacks it under the raw
/// directory. Safe to call repeatedly for the same period: downloads land in
/// a temp file and are renamed into place, extraction replaces the previous
/// directory for that period only.
#[derive(Debug)]
pub struct ArchiveFetcher {
    client: reqwest::Client,
    endpoints: ArchiveEndpoints,
    layout: DataLayout,
    backoff: BackoffPolicy,
}

impl ArchiveFetcher {
    pub fn new(config: ArchiveClientConfig, layout: DataLayout) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoints: config.endpoints,
            layout,
            backoff: config.backoff,
        })
    }

    fn url_for(&self, period_id: &str) -> String {
        if period_id == CURRENT_PERIOD {
            format!(
                "{}?type=zip&fileName={}",
                self.endpoints.current_url, self.endpoints.file_name
            )
        } else {
            format!(
                "{}?season={}&type=zip&fileName={}",
                self.endpoints.season_url, period_id, self.endpoints.file_name
            )
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }

    /// Fetch one period's archive into `raw/{period_id}.zip`.
    pub async fn fetch(&self, run_id: Uuid, period_id: &str) -> Result<PathBuf, FetchError> {
        let url = self.url_for(period_id);
        let span = info_span!("archive_fetch", %run_id, period_id, url = url.as_str());
        let body = self.download(&url).instrument(span).await?;

        let raw_dir = self.layout.raw_dir();
        tokio::fs::create_dir_all(&raw_dir)
            .await
            .map_err(|e| FetchError::Io {
                path: raw_dir.clone(),
                source: e,
            })?;

        let dest = self.layout.zip_path(period_id);
        let temp = raw_dir.join(format!(".{}.{}.tmp", period_id, Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| FetchError::Io {
                path: temp.clone(),
                source: e,
            })?;
        file.write_all(&body).await.map_err(|e| FetchError::Io {
            path: temp.clone(),
            source: e,
        })?;
        file.flush().await.map_err(|e| FetchError::Io {
            path: temp.clone(),
            source: e,
        })?;
        drop(file);

        match tokio::fs::rename(&temp, &dest).await {
            Ok(()) => Ok(dest),
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                Err(FetchError::Io {
                    path: dest,
                    source: e,
                })
            }
        }
    }

    /// Unpack `raw/{period_id}.zip` into `raw/{period_id}/`, replacing any
    /// previous extraction for that period, then delete the archive.
    pub fn extract(&self, period_id: &str) -> Result<usize, ExtractError> {
        let zip_path = self.layout.zip_path(period_id);
        if !zip_path.exists() {
            return Err(ExtractError::Missing { path: zip_path });
        }

        let dest = self.layout.period_dir(period_id);
        if dest.exists() {
            fs::remove_dir_all(&dest).map_err(|e| ExtractError::Io {
                path: dest.clone(),
                source: e,
            })?;
        }
        fs::create_dir_all(&dest).map_err(|e| ExtractError::Io {
            path: dest.clone(),
            source: e,
        })?;

        let file = fs::File::open(&zip_path).map_err(|e| ExtractError::Io {
            path: zip_path.clone(),
            source: e,
        })?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| ExtractError::Corrupt {
            path: zip_path.clone(),
            source: e,
        })?;
        let entries = archive.len();
        archive.extract(&dest).map_err(|e| ExtractError::Corrupt {
            path: zip_path.clone(),
            source: e,
        })?;

        fs::remove_file(&zip_path).map_err(|e| ExtractError::Io {
            path: zip_path.clone(),
            source: e,
        })?;
        Ok(entries)
    }

    pub async fn fetch_and_extract(
        &self,
        run_id: Uuid,
        period_id: &str,
    ) -> Result<usize, ArchiveError> {
        self.fetch(run_id, period_id).await?;
        Ok(self.extract(period_id)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureManifest {
    pub recorded_at: DateTime<Utc>,
    pub failed: Vec<String>,
}

/// Record periods whose archives could not be fetched after exhausting
/// retries. The pipeline never auto-retries these; the manifest exists for
/// operator follow-up.
pub fn write_failure_manifest(
    layout: &DataLayout,
    failed: &[String],
    recorded_at: DateTime<Utc>,
) -> Result<PathBuf, PersistenceError> {
    let dir = layout.failures_dir();
    fs::create_dir_all(&dir).map_err(|e| io_at(&dir, e))?;
    let manifest = FailureManifest {
        recorded_at,
        failed: failed.to_vec(),
    };
    let path = dir.join(format!("{}.json", recorded_at.format("%Y%m%d_%H%M%S")));
    let bytes = serde_json::to_vec_pretty(&manifest)?;
    fs::write(&path, bytes).map_err(|e| io_at(&path, e))?;
    Ok(path)
}

/// Run-level mutual exclusion: one lock file per data root, created with
/// `create_new` semantics and removed on drop. Concurrent runs racing on the
/// fingerprint and catalog files are the primary correctness risk.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(raw_dir: &Path) -> Result<Self, PersistenceError> {
        fs::create_dir_all(raw_dir).map_err(|e| io_at(raw_dir, e))?;
        let path = raw_dir.join(".run.lock");
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use io::Write;
                let _ = writeln!(file, "locked at {}", Utc::now().to_rfc3339());
                Ok(Self { path })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(PersistenceError::Locked { path })
            }
            Err(e) => Err(io_at(&path, e)),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write;
    use tempfile::tempdir;

    fn sample_content(end_day: &str) -> BTreeMap<String, BTreeMap<String, String>> {
        let mut bounds = BTreeMap::new();
        bounds.insert("start".to_string(), "114-6-11".to_string());
        bounds.insert("end".to_string(), end_day.to_string());
        let mut content = BTreeMap::new();
        content.insert("登記日期".to_string(), bounds);
        content
    }

    #[test]
    fn hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn fingerprint_first_run_then_idempotent_then_updated() {
        let dir = tempdir().expect("tempdir");
        let store = FingerprintStore::new(dir.path());
        let content = sample_content("114-6-20");

        let first = store.check_and_update(&content).expect("first");
        assert!(first.changed);
        assert_eq!(first.reason, ChangeReason::FirstRun);
        assert!(dir.path().join(".init_done").exists());

        let hash_before = fs::read_to_string(dir.path().join("latest_notice.hash")).unwrap();
        let second = store.check_and_update(&content).expect("second");
        assert!(!second.changed);
        assert_eq!(second.reason, ChangeReason::Unchanged);
        let hash_after = fs::read_to_string(dir.path().join("latest_notice.hash")).unwrap();
        assert_eq!(hash_before, hash_after);

        let third = store
            .check_and_update(&sample_content("114-6-30"))
            .expect("third");
        assert!(third.changed);
        assert_eq!(third.reason, ChangeReason::Updated);
        let hash_new = fs::read_to_string(dir.path().join("latest_notice.hash")).unwrap();
        assert_ne!(hash_before, hash_new);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn fixed_backoff_sleeps_the_same_delay_each_attempt() {
        let policy = BackoffPolicy::fixed(2, Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
    }

    #[test]
    fn current_and_seasonal_periods_use_their_own_urls() {
        let dir = tempdir().expect("tempdir");
        let fetcher = ArchiveFetcher::new(
            ArchiveClientConfig::default(),
            DataLayout::new(dir.path()),
        )
        .expect("fetcher");

        assert_eq!(
            fetcher.url_for(CURRENT_PERIOD),
            "https://plvr.land.moi.gov.tw/Download?type=zip&fileName=lvr_landcsv.zip"
        );
        assert_eq!(
            fetcher.url_for("114S1"),
            "https://plvr.land.moi.gov.tw/DownloadSeason?season=114S1&type=zip&fileName=lvr_landcsv.zip"
        );
    }

    fn write_test_zip(path: &Path, files: &[(&str, &str)]) {
        let file = fs::File::create(path).expect("create zip");
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, body) in files {
            writer.start_file(*name, options).expect("start entry");
            writer.write_all(body.as_bytes()).expect("write entry");
        }
        writer.finish().expect("finish zip");
    }

    #[test]
    fn extract_replaces_previous_period_contents() {
        let dir = tempdir().expect("tempdir");
        let layout = DataLayout::new(dir.path());
        layout.ensure().expect("ensure");
        let fetcher =
            ArchiveFetcher::new(ArchiveClientConfig::default(), layout.clone()).expect("fetcher");

        let stale_dir = layout.period_dir("114S1");
        fs::create_dir_all(&stale_dir).unwrap();
        fs::write(stale_dir.join("stale.csv"), "old").unwrap();

        write_test_zip(
            &layout.zip_path("114S1"),
            &[("a_lvr_land_a.csv", "h1\nh2\nrow")],
        );
        let entries = fetcher.extract("114S1").expect("extract");
        assert_eq!(entries, 1);
        assert!(stale_dir.join("a_lvr_land_a.csv").exists());
        assert!(!stale_dir.join("stale.csv").exists());
        assert!(!layout.zip_path("114S1").exists());
    }

    #[test]
    fn extract_reports_missing_and_corrupt_archives_distinctly() {
        let dir = tempdir().expect("tempdir");
        let layout = DataLayout::new(dir.path());
        layout.ensure().expect("ensure");
        let fetcher =
            ArchiveFetcher::new(ArchiveClientConfig::default(), layout.clone()).expect("fetcher");

        assert!(matches!(
            fetcher.extract("113S4"),
            Err(ExtractError::Missing { .. })
        ));

        fs::write(layout.zip_path("113S4"), b"not a zip archive").unwrap();
        assert!(matches!(
            fetcher.extract("113S4"),
            Err(ExtractError::Corrupt { .. })
        ));
    }

    #[test]
    fn run_lock_is_exclusive_until_dropped() {
        let dir = tempdir().expect("tempdir");
        let lock = RunLock::acquire(dir.path()).expect("first lock");
        assert!(matches!(
            RunLock::acquire(dir.path()),
            Err(PersistenceError::Locked { .. })
        ));
        drop(lock);
        RunLock::acquire(dir.path()).expect("lock after release");
    }

    #[test]
    fn failure_manifest_round_trips() {
        let dir = tempdir().expect("tempdir");
        let layout = DataLayout::new(dir.path());
        let now = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let path = write_failure_manifest(&layout, &["113S4".to_string()], now).expect("write");
        let manifest: FailureManifest =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(manifest.failed, vec!["113S4".to_string()]);
        assert_eq!(manifest.recorded_at, now);
    }

    #[test]
    fn archive_period_moves_extracted_input_aside() {
        let dir = tempdir().expect("tempdir");
        let layout = DataLayout::new(dir.path());
        layout.ensure().expect("ensure");
        let period_dir = layout.period_dir("114S1");
        fs::create_dir_all(&period_dir).unwrap();
        fs::write(period_dir.join("a_lvr_land_a.csv"), "rows").unwrap();

        let moved = layout
            .archive_period("114S1", "20260224_120000")
            .expect("archive")
            .expect("dir existed");
        assert!(moved.ends_with("114S1_20260224_120000"));
        assert!(moved.join("a_lvr_land_a.csv").exists());
        assert!(!period_dir.exists());

        assert!(layout
            .archive_period("114S1", "20260224_120001")
            .expect("archive again")
            .is_none());
    }
}
