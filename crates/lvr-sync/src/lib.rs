//! Ingestion pipeline: file relevance filter, row transformation engine,
//! region-table load stage and the orchestrator that sequences one run.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lvr_adapters::{parse_notice, refresh_catalog, CatalogStore, PageSource, SnapshotPageSource};
use lvr_core::{
    canonical_content, classify_trade_object, condition_for_age, has_elevator, has_parking,
    is_presale_filename, region_for_filename, roc_compact_to_gregorian, strip_parenthetical,
    GregorianDate, HouseCondition, TransformedRecord, SQM_PER_PING,
};
use lvr_storage::{
    write_failure_manifest, ArchiveClientConfig, ArchiveEndpoints, ArchiveError, ArchiveFetcher,
    BackoffPolicy, ChangeReason, DataLayout, FingerprintStore, RunLock, CURRENT_PERIOD,
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lvr-sync";

/// Marker every relevant record file carries in its name.
pub const FEED_MARKER: &str = "lvr_land";
/// Transaction-type code for cancellation records.
pub const CANCELLATION_CODE: &str = "c";
/// Object-subtype files redundant with the combined feed.
pub const EXCLUDED_SUBTYPES: [&str; 3] = ["build", "land", "park"];

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_root: PathBuf,
    pub database_path: PathBuf,
    pub endpoints: ArchiveEndpoints,
    pub http_timeout_secs: u64,
    pub retry_limit: usize,
    pub retry_delay_ms: u64,
    pub history_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub notice_dump: PathBuf,
    pub period_page_dump: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let data_root = std::env::var("LVR_DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let mut endpoints = ArchiveEndpoints::default();
        if let Ok(url) = std::env::var("LVR_CURRENT_ZIP_URL") {
            endpoints.current_url = url;
        }
        if let Ok(url) = std::env::var("LVR_SEASON_ZIP_URL") {
            endpoints.season_url = url;
        }
        Self {
            database_path: std::env::var("LVR_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_root.join("lvr.sqlite")),
            endpoints,
            http_timeout_secs: env_parse("LVR_HTTP_TIMEOUT_SECS", 30),
            retry_limit: env_parse("LVR_RETRY_LIMIT", 1),
            retry_delay_ms: env_parse("LVR_RETRY_DELAY_MS", 1000),
            history_timeout_secs: env_parse("LVR_HISTORY_TIMEOUT_SECS", 3600),
            scheduler_enabled: std::env::var("LVR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("LVR_SYNC_CRON").unwrap_or_else(|_| "0 6 * * *".to_string()),
            user_agent: std::env::var("LVR_USER_AGENT")
                .unwrap_or_else(|_| "lvr-bot/0.1".to_string()),
            notice_dump: std::env::var("LVR_NOTICE_DUMP")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_root.join("pages").join("notice.txt")),
            period_page_dump: std::env::var("LVR_PERIOD_PAGE_DUMP")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_root.join("pages").join("options.html")),
            data_root,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Remove files that do not belong in the analysis set: names without the
/// feed marker, cancellation records and the redundant single-object
/// subtype files. In place and idempotent; a file matching none of the
/// rules is never touched.
pub fn filter_directory(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut removed = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let lower = name.to_ascii_lowercase();

        if !lower.contains(FEED_MARKER) {
            fs::remove_file(entry.path())?;
            removed.push(name);
            continue;
        }

        let parts: Vec<&str> = lower.split('_').collect();
        if parts.len() < 4 {
            continue;
        }

        let type_code = parts[3].trim_end_matches(".csv");
        if type_code == CANCELLATION_CODE {
            fs::remove_file(entry.path())?;
            removed.push(name);
            continue;
        }

        if parts.len() > 4 {
            let object_code = parts[4].trim_end_matches(".csv");
            if EXCLUDED_SUBTYPES.contains(&object_code) {
                fs::remove_file(entry.path())?;
                removed.push(name);
            }
        }
    }

    Ok(removed)
}

/// One raw CSV record keyed by the Chinese header row.
pub type RawRow = BTreeMap<String, String>;

/// Provenance of a row, carried into every per-row warning.
#[derive(Debug, Clone, Copy)]
pub struct RowSource<'a> {
    pub file: &'a str,
    pub index: usize,
    pub presale: bool,
}

fn normalize_header(raw: &str) -> String {
    let trimmed = raw.trim_start_matches('\u{feff}').trim();
    if trimmed == "車位移轉總面積(平方公尺)" {
        "車位移轉總面積平方公尺".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Read the raw rows of one record file. The first line is the Chinese
/// header, the second the English header (skipped); unreadable records are
/// skipped with a warning rather than failing the file.
pub fn read_raw_rows(path: &Path) -> Result<Vec<RawRow>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(false)
        .from_path(path)?;

    let mut headers: Vec<String> = Vec::new();
    let mut rows = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(file = %path.display(), row = idx, error = %e, "skipping unreadable record");
                continue;
            }
        };
        if idx == 0 {
            headers = record.iter().map(normalize_header).collect();
            continue;
        }
        if idx == 1 {
            continue;
        }
        let mut row = RawRow::new();
        for (header, value) in headers.iter().zip(record.iter()) {
            row.insert(header.clone(), value.to_string());
        }
        rows.push(row);
    }
    Ok(rows)
}

fn field<'a>(row: &'a RawRow, name: &str) -> &'a str {
    row.get(name).map(String::as_str).unwrap_or("")
}

fn parse_f64(row: &RawRow, name: &str) -> Option<f64> {
    field(row, name).trim().parse().ok()
}

fn parse_i64(row: &RawRow, name: &str) -> Option<i64> {
    field(row, name).trim().parse().ok()
}

/// A value usable for derived metrics: present, numeric and positive.
/// Unusable non-empty input is logged per row and skipped, never fatal.
fn derived_value(row: &RawRow, name: &str, source: &RowSource<'_>) -> Option<f64> {
    let raw = field(row, name).trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<f64>() {
        Ok(v) if v > 0.0 => Some(v),
        Ok(_) => {
            warn!(
                file = source.file,
                row = source.index,
                column = name,
                value = raw,
                "non-positive value skipped"
            );
            None
        }
        Err(_) => {
            warn!(
                file = source.file,
                row = source.index,
                column = name,
                value = raw,
                "non-numeric value skipped"
            );
            None
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Transform one raw row into a normalized record. Every derived field is
/// guarded independently: a failure in one never blocks the others, and
/// never aborts the row or the batch.
pub fn transform_row(region: &str, row: &RawRow, source: &RowSource<'_>) -> TransformedRecord {
    let trade_object_raw = field(row, "交易標的");
    let building_type_raw = field(row, "建物型態");

    let area = derived_value(row, "建物移轉總面積平方公尺", source);
    let area_ping = area.map(|v| round2(v / SQM_PER_PING)).unwrap_or(0.0);

    let total = derived_value(row, "總價元", source);
    let total_price_wan = total.map(|v| round1(v / 10_000.0)).unwrap_or(0.0);
    let unit_price_wan = match total {
        Some(v) if area_ping > 0.0 => round1(v / area_ping / 10_000.0),
        _ => 0.0,
    };

    let parking_area = derived_value(row, "車位移轉總面積平方公尺", source);
    let parking_ping = parking_area.map(|v| round2(v / SQM_PER_PING)).unwrap_or(0.0);
    let parking_total = derived_value(row, "車位總價元", source);
    let parking_price_wan = parking_total.map(|v| round1(v / 10_000.0)).unwrap_or(0.0);

    let trade = roc_compact_to_gregorian(field(row, "交易年月日"));
    let (trade_date, trade_year, trade_month, trade_day) = match trade {
        Some(d) => (
            d.compact(),
            d.year.to_string(),
            format!("{:02}", d.month),
            format!("{:02}", d.day),
        ),
        None => Default::default(),
    };
    let completion = roc_compact_to_gregorian(field(row, "建築完成年月"));
    let completion_date = completion.map(GregorianDate::compact).unwrap_or_default();

    let (house_age, house_condition) = if source.presale {
        (None, Some(HouseCondition::Presale))
    } else {
        match (
            trade.and_then(GregorianDate::to_naive),
            completion.and_then(GregorianDate::to_naive),
        ) {
            (Some(traded), Some(completed)) => {
                let days = (traded - completed).num_days();
                if days >= 0 {
                    // The fixed 365.25-day year is intentional; downstream
                    // consumers depend on this exact rounding.
                    let age = round1(days as f64 / 365.25);
                    (Some(age), Some(condition_for_age(age)))
                } else {
                    (None, None)
                }
            }
            _ => (None, None),
        }
    };

    TransformedRecord {
        region: region.to_string(),
        district: field(row, "鄉鎮市區").to_string(),
        trade_object: strip_parenthetical(trade_object_raw).to_string(),
        building_type: strip_parenthetical(building_type_raw).to_string(),
        main_use: field(row, "主要用途").to_string(),
        area_sqm: parse_f64(row, "建物移轉總面積平方公尺"),
        total_price: parse_i64(row, "總價元"),
        parking_area_sqm: parse_f64(row, "車位移轉總面積平方公尺"),
        parking_price: parse_i64(row, "車位總價元"),
        area_ping,
        total_price_wan,
        unit_price_wan,
        parking_ping,
        parking_price_wan,
        category: classify_trade_object(trade_object_raw),
        has_parking: has_parking(trade_object_raw),
        has_elevator: has_elevator(building_type_raw),
        trade_date,
        trade_year,
        trade_month,
        trade_day,
        completion_date,
        house_age,
        house_condition,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    pub fn sqlite_type(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
        }
    }
}

/// The fixed region-table schema. Declared up front from the record type
/// rather than inferred per batch, so every batch either fits or fails
/// loudly; existing tables are never altered.
pub const RECORD_COLUMNS: &[(&str, ColumnType)] = &[
    ("region", ColumnType::Text),
    ("district", ColumnType::Text),
    ("trade_object", ColumnType::Text),
    ("building_type", ColumnType::Text),
    ("main_use", ColumnType::Text),
    ("area_sqm", ColumnType::Real),
    ("total_price", ColumnType::Integer),
    ("parking_area_sqm", ColumnType::Real),
    ("parking_price", ColumnType::Integer),
    ("area_ping", ColumnType::Real),
    ("total_price_wan", ColumnType::Real),
    ("unit_price_wan", ColumnType::Real),
    ("parking_ping", ColumnType::Real),
    ("parking_price_wan", ColumnType::Real),
    ("category", ColumnType::Text),
    ("has_parking", ColumnType::Integer),
    ("has_elevator", ColumnType::Integer),
    ("trade_date", ColumnType::Text),
    ("trade_year", ColumnType::Text),
    ("trade_month", ColumnType::Text),
    ("trade_day", ColumnType::Text),
    ("completion_date", ColumnType::Text),
    ("house_age", ColumnType::Real),
    ("house_condition", ColumnType::Text),
];

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Integer(Option<i64>),
    Real(Option<f64>),
    Text(Option<String>),
}

pub fn record_values(record: &TransformedRecord) -> Vec<SqlValue> {
    vec![
        SqlValue::Text(Some(record.region.clone())),
        SqlValue::Text(Some(record.district.clone())),
        SqlValue::Text(Some(record.trade_object.clone())),
        SqlValue::Text(Some(record.building_type.clone())),
        SqlValue::Text(Some(record.main_use.clone())),
        SqlValue::Real(record.area_sqm),
        SqlValue::Integer(record.total_price),
        SqlValue::Real(record.parking_area_sqm),
        SqlValue::Integer(record.parking_price),
        SqlValue::Real(Some(record.area_ping)),
        SqlValue::Real(Some(record.total_price_wan)),
        SqlValue::Real(Some(record.unit_price_wan)),
        SqlValue::Real(Some(record.parking_ping)),
        SqlValue::Real(Some(record.parking_price_wan)),
        SqlValue::Text(Some(record.category.as_str().to_string())),
        SqlValue::Integer(Some(i64::from(record.has_parking))),
        SqlValue::Integer(Some(i64::from(record.has_elevator))),
        SqlValue::Text(Some(record.trade_date.clone())),
        SqlValue::Text(Some(record.trade_year.clone())),
        SqlValue::Text(Some(record.trade_month.clone())),
        SqlValue::Text(Some(record.trade_day.clone())),
        SqlValue::Text(Some(record.completion_date.clone())),
        SqlValue::Real(record.house_age),
        SqlValue::Text(record.house_condition.map(|c| c.as_str().to_string())),
    ]
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("region {region} table does not match the record schema: {detail}")]
    SchemaMismatch { region: String, detail: String },
}

/// Destination for normalized records, one table per region. Satisfied by
/// any store that can create a table and append rows.
#[async_trait]
pub trait RegionStore: Send + Sync {
    async fn create_if_absent(&self, region: &str) -> Result<(), LoadError>;

    /// Append one batch. Failure granularity is the batch: the store does
    /// not promise row-level recovery beyond what its backend offers.
    async fn append(&self, region: &str, records: &[TransformedRecord]) -> Result<usize, LoadError>;
}

fn column_names() -> Vec<&'static str> {
    RECORD_COLUMNS.iter().map(|(name, _)| *name).collect()
}

// Region names come from the static code map, never from feed input, so
// interpolating them into SQL identifiers is safe.
fn create_table_sql(region: &str) -> String {
    let columns = RECORD_COLUMNS
        .iter()
        .map(|(name, ty)| format!("\"{name}\" {}", ty.sqlite_type()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE IF NOT EXISTS \"{region}\" (id INTEGER PRIMARY KEY AUTOINCREMENT, {columns})"
    )
}

fn insert_sql(region: &str) -> String {
    let names = column_names()
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; RECORD_COLUMNS.len()].join(", ");
    format!("INSERT INTO \"{region}\" ({names}) VALUES ({placeholders})")
}

#[derive(Debug, Clone)]
pub struct SqliteRegionStore {
    pool: SqlitePool,
}

impl SqliteRegionStore {
    pub async fn connect(path: &Path) -> Result<Self, LoadError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl RegionStore for SqliteRegionStore {
    async fn create_if_absent(&self, region: &str) -> Result<(), LoadError> {
        let info = sqlx::query(&format!("PRAGMA table_info(\"{region}\")"))
            .fetch_all(&self.pool)
            .await?;
        if info.is_empty() {
            sqlx::query(&create_table_sql(region))
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        let actual = info
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<Vec<_>, _>>()?;
        let expected: Vec<String> = std::iter::once("id".to_string())
            .chain(column_names().iter().map(|n| n.to_string()))
            .collect();
        if actual != expected {
            return Err(LoadError::SchemaMismatch {
                region: region.to_string(),
                detail: format!("existing columns {actual:?}"),
            });
        }
        Ok(())
    }

    async fn append(&self, region: &str, records: &[TransformedRecord]) -> Result<usize, LoadError> {
        let sql = insert_sql(region);
        let mut tx = self.pool.begin().await?;
        for record in records {
            let mut query = sqlx::query(&sql);
            for value in record_values(record) {
                query = match value {
                    SqlValue::Integer(v) => query.bind(v),
                    SqlValue::Real(v) => query.bind(v),
                    SqlValue::Text(v) => query.bind(v),
                };
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }
}

/// In-memory store used by tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegionStore {
    tables: Arc<tokio::sync::Mutex<BTreeMap<String, Vec<TransformedRecord>>>>,
}

impl MemoryRegionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self, region: &str) -> Vec<TransformedRecord> {
        self.tables
            .lock()
            .await
            .get(region)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn regions(&self) -> Vec<String> {
        self.tables.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl RegionStore for MemoryRegionStore {
    async fn create_if_absent(&self, region: &str) -> Result<(), LoadError> {
        self.tables
            .lock()
            .await
            .entry(region.to_string())
            .or_default();
        Ok(())
    }

    async fn append(&self, region: &str, records: &[TransformedRecord]) -> Result<usize, LoadError> {
        self.tables
            .lock()
            .await
            .entry(region.to_string())
            .or_default()
            .extend_from_slice(records);
        Ok(records.len())
    }
}

/// Source of period archives. The HTTP fetcher is the production
/// implementation; tests substitute fakes.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    async fn fetch_and_extract(&self, run_id: Uuid, period_id: &str)
        -> Result<usize, ArchiveError>;
}

#[async_trait]
impl ArchiveSource for ArchiveFetcher {
    async fn fetch_and_extract(
        &self,
        run_id: Uuid,
        period_id: &str,
    ) -> Result<usize, ArchiveError> {
        ArchiveFetcher::fetch_and_extract(self, run_id, period_id).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub changed: bool,
    pub reason: String,
    pub catalog_added: usize,
    pub periods_fetched: usize,
    pub periods_failed: Vec<String>,
    pub files_removed: usize,
    pub rows_transformed: usize,
    pub rows_loaded: usize,
    pub load_errors: usize,
    pub failure_manifest: Option<PathBuf>,
}

impl RunSummary {
    fn unchanged(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            changed: false,
            reason: ChangeReason::Unchanged.as_str().to_string(),
            catalog_added: 0,
            periods_fetched: 0,
            periods_failed: Vec::new(),
            files_removed: 0,
            rows_transformed: 0,
            rows_loaded: 0,
            load_errors: 0,
            failure_manifest: None,
        }
    }
}

/// One pipeline run, sequenced as:
/// check notice -> (unchanged: done) -> purge old -> fetch current ->
/// refresh catalog -> fetch history -> filter -> transform and load ->
/// archive input.
pub struct Pipeline {
    config: SyncConfig,
    layout: DataLayout,
    fingerprints: FingerprintStore,
    catalog: CatalogStore,
    page: Box<dyn PageSource>,
    archives: Box<dyn ArchiveSource>,
    store: Box<dyn RegionStore>,
}

impl Pipeline {
    pub async fn new(config: SyncConfig) -> anyhow::Result<Self> {
        let layout = DataLayout::new(&config.data_root);
        let page = Box::new(SnapshotPageSource::new(
            &config.notice_dump,
            &config.period_page_dump,
        ));
        let archives = Box::new(ArchiveFetcher::new(
            ArchiveClientConfig {
                endpoints: config.endpoints.clone(),
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                backoff: BackoffPolicy::fixed(
                    config.retry_limit,
                    Duration::from_millis(config.retry_delay_ms),
                ),
            },
            layout.clone(),
        )?);
        if let Some(parent) = config.database_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
        let store = Box::new(SqliteRegionStore::connect(&config.database_path).await?);
        Self::with_components(config, page, archives, store)
    }

    /// Assemble a pipeline from explicit collaborators so tests can
    /// substitute in-memory implementations.
    pub fn with_components(
        config: SyncConfig,
        page: Box<dyn PageSource>,
        archives: Box<dyn ArchiveSource>,
        store: Box<dyn RegionStore>,
    ) -> anyhow::Result<Self> {
        let layout = DataLayout::new(&config.data_root);
        layout.ensure().context("preparing data directories")?;
        let fingerprints = FingerprintStore::new(layout.raw_dir());
        let catalog = CatalogStore::new(layout.catalog_path());
        Ok(Self {
            config,
            layout,
            fingerprints,
            catalog,
            page,
            archives,
            store,
        })
    }

    pub async fn run_once(&self) -> anyhow::Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let _lock = RunLock::acquire(&self.layout.raw_dir())?;

        // CHECK_NOTICE: any failure here aborts before the destructive
        // purge step, protecting previously-loaded data.
        let text = self
            .page
            .notice_text()
            .await
            .context("fetching notice text")?;
        let ranges = parse_notice(&text)?;
        let content = canonical_content(&ranges);
        let outcome = self.fingerprints.check_and_update(&content)?;
        info!(%run_id, changed = outcome.changed, reason = outcome.reason.as_str(), "notice check");
        if !outcome.changed {
            return Ok(RunSummary::unchanged(run_id, started_at));
        }
        let first_run = outcome.reason == ChangeReason::FirstRun;

        // PURGE_OLD
        let known: Vec<String> = self.catalog.load()?.periods.keys().cloned().collect();
        self.layout.purge_period(CURRENT_PERIOD)?;
        for period in &known {
            self.layout.purge_period(period)?;
        }

        // FETCH_CURRENT + EXTRACT_CURRENT
        self.archives
            .fetch_and_extract(run_id, CURRENT_PERIOD)
            .await
            .context("fetching current-period archive")?;

        // REFRESH_CATALOG: failure aborts the historical leg only; the
        // current-period leg already completed is preserved.
        let refresh = match refresh_catalog(self.page.as_ref(), &self.catalog).await {
            Ok(refresh) => Some(refresh),
            Err(e) => {
                warn!(%run_id, error = %e, "catalog refresh failed; skipping historical leg");
                None
            }
        };
        let catalog_added = refresh.as_ref().map(|r| r.added.len()).unwrap_or(0);

        // FETCH_HISTORY: full catalog, bounded retries inside the fetcher,
        // one period's exhaustion is never fatal to the run.
        let mut fetched_periods = Vec::new();
        let mut failed_periods = Vec::new();
        let run_history = refresh
            .as_ref()
            .map(|r| first_run || r.updated)
            .unwrap_or(false);
        if run_history {
            let periods: Vec<String> = self.catalog.load()?.periods.keys().cloned().collect();
            let deadline =
                Instant::now() + Duration::from_secs(self.config.history_timeout_secs);
            for period in periods {
                if Instant::now() >= deadline {
                    warn!(%run_id, %period, "history deadline reached; period recorded as failed");
                    failed_periods.push(period);
                    continue;
                }
                match self.archives.fetch_and_extract(run_id, &period).await {
                    Ok(files) => {
                        info!(%run_id, %period, files, "historical period extracted");
                        fetched_periods.push(period);
                    }
                    Err(e) => {
                        warn!(%run_id, %period, error = %e, "historical period failed after retries");
                        failed_periods.push(period);
                    }
                }
            }
        }
        let failure_manifest = if failed_periods.is_empty() {
            None
        } else {
            Some(write_failure_manifest(
                &self.layout,
                &failed_periods,
                Utc::now(),
            )?)
        };

        // FILTER + TRANSFORM_AND_LOAD + ARCHIVE_INPUT, per period.
        let stamp = started_at.format("%Y%m%d_%H%M%S").to_string();
        let mut files_removed = 0usize;
        let mut rows_transformed = 0usize;
        let mut rows_loaded = 0usize;
        let mut load_errors = 0usize;

        let mut process: Vec<String> = vec![CURRENT_PERIOD.to_string()];
        process.extend(fetched_periods.iter().cloned());
        for period in &process {
            let dir = self.layout.period_dir(period);
            if !dir.exists() {
                continue;
            }
            let removed = filter_directory(&dir)
                .with_context(|| format!("filtering {}", dir.display()))?;
            files_removed += removed.len();

            let (loaded, transformed, errors) = self.load_period_files(run_id, &dir).await?;
            rows_loaded += loaded;
            rows_transformed += transformed;
            load_errors += errors;

            if let Some(archived) = self.layout.archive_period(period, &stamp)? {
                info!(%run_id, %period, archived = %archived.display(), "raw input archived");
            }
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            changed: true,
            reason: outcome.reason.as_str().to_string(),
            catalog_added,
            periods_fetched: fetched_periods.len(),
            periods_failed: failed_periods,
            files_removed,
            rows_transformed,
            rows_loaded,
            load_errors,
            failure_manifest,
        };
        self.write_report(&summary)?;
        info!(%run_id, rows = summary.rows_loaded, failed = summary.periods_failed.len(), "run complete");
        Ok(summary)
    }

    async fn load_period_files(
        &self,
        run_id: Uuid,
        dir: &Path,
    ) -> anyhow::Result<(usize, usize, usize)> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .map(|ext| ext.eq_ignore_ascii_case("csv"))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut loaded = 0usize;
        let mut transformed = 0usize;
        let mut errors = 0usize;
        for path in paths {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let Some(region) = region_for_filename(&filename) else {
                warn!(%run_id, file = %filename, "unknown region code; file skipped");
                continue;
            };

            let rows = match read_raw_rows(&path) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(%run_id, file = %filename, error = %e, "unreadable record file skipped");
                    continue;
                }
            };
            let presale = is_presale_filename(&filename);
            let records: Vec<TransformedRecord> = rows
                .iter()
                .enumerate()
                .map(|(index, row)| {
                    transform_row(
                        region,
                        row,
                        &RowSource {
                            file: &filename,
                            index,
                            presale,
                        },
                    )
                })
                .collect();
            transformed += records.len();
            if records.is_empty() {
                continue;
            }

            let result = match self.store.create_if_absent(region).await {
                Ok(()) => self.store.append(region, &records).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(count) => loaded += count,
                Err(e) => {
                    error!(%run_id, file = %filename, region, error = %e, "batch load failed");
                    errors += 1;
                }
            }
        }
        Ok((loaded, transformed, errors))
    }

    fn write_report(&self, summary: &RunSummary) -> anyhow::Result<()> {
        let dir = self.layout.reports_dir().join(summary.run_id.to_string());
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        let path = dir.join("summary.json");
        fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Build the cron scheduler when enabled; the caller starts it.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => {
                        info!(run_id = %summary.run_id, changed = summary.changed, "scheduled run finished");
                    }
                    Err(e) => warn!(error = %e, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_once_from_env() -> anyhow::Result<RunSummary> {
    let pipeline = Pipeline::new(SyncConfig::from_env()).await?;
    pipeline.run_once().await
}
