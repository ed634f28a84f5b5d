//! External-page collaborator contract plus the parsers that sit on top of
//! it: the notice date-range parser and the historical period catalog.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use lvr_core::{NoticeDateLabel, NoticeDateRange, RocDate};
use lvr_storage::PersistenceError;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lvr-adapters";

/// Date-range patterns published in the notice, ROC calendar on both ends.
const NOTICE_PATTERN: &str =
    r"(登記日期|訂約日期|交易日期)\s*([0-9]+)年([0-9]+)月([0-9]+)日[至到 ]+([0-9]+)年([0-9]+)月([0-9]+)日";

const PERIOD_SELECT_ID: &str = "historySeason_id";

#[derive(Debug, Error)]
pub enum PageError {
    #[error("page source unavailable: {0}")]
    Unavailable(String),
    #[error("reading page snapshot {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Contract over the browser-automation collaborator that renders the
/// open-data page. Implementations must return within a bounded time or
/// fail with a `PageError`.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Free-form notice text from the current-period tab.
    async fn notice_text(&self) -> Result<String, PageError>;

    /// Rendered HTML of the historical-download tab, containing the period
    /// select element.
    async fn period_page_html(&self) -> Result<String, PageError>;
}

/// Fixture-first page source reading operator-staged page dumps from disk.
/// Used by tests and by deployments where the browser automation runs out
/// of process and drops its output into the data root.
#[derive(Debug, Clone)]
pub struct SnapshotPageSource {
    notice_path: PathBuf,
    page_path: PathBuf,
}

impl SnapshotPageSource {
    pub fn new(notice_path: impl Into<PathBuf>, page_path: impl Into<PathBuf>) -> Self {
        Self {
            notice_path: notice_path.into(),
            page_path: page_path.into(),
        }
    }

    fn read(path: &PathBuf) -> Result<String, PageError> {
        fs::read_to_string(path).map_err(|source| PageError::Snapshot {
            path: path.clone(),
            source,
        })
    }
}

#[async_trait]
impl PageSource for SnapshotPageSource {
    async fn notice_text(&self) -> Result<String, PageError> {
        Self::read(&self.notice_path)
    }

    async fn period_page_html(&self) -> Result<String, PageError> {
        Self::read(&self.page_path)
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("notice pattern failed to compile (trace {trace_id}): {source}")]
    Compile {
        trace_id: Uuid,
        #[source]
        source: regex::Error,
    },
    #[error("notice text matched no known date-range pattern (trace {trace_id})")]
    NoMatch { trace_id: Uuid },
}

/// Extract the date ranges from the published notice text. A successful
/// return always holds at least one range: zero matches is an error, so a
/// caller can never mistake "nothing found" for "nothing changed".
pub fn parse_notice(text: &str) -> Result<Vec<NoticeDateRange>, ParseError> {
    parse_with_pattern(NOTICE_PATTERN, text)
}

fn parse_with_pattern(pattern: &str, text: &str) -> Result<Vec<NoticeDateRange>, ParseError> {
    let trace_id = Uuid::new_v4();
    let re = Regex::new(pattern).map_err(|source| {
        error!(%trace_id, %source, "notice pattern failed to compile");
        ParseError::Compile { trace_id, source }
    })?;

    let mut ranges = Vec::new();
    for caps in re.captures_iter(text) {
        let Some(label) = NoticeDateLabel::from_feed_label(&caps[1]) else {
            continue;
        };
        let Some(range) = capture_range(label, &caps) else {
            continue;
        };
        ranges.push(range);
    }

    if ranges.is_empty() {
        error!(%trace_id, "no date range matched the notice text");
        return Err(ParseError::NoMatch { trace_id });
    }
    Ok(ranges)
}

fn capture_range(label: NoticeDateLabel, caps: &regex::Captures<'_>) -> Option<NoticeDateRange> {
    let num = |idx: usize| caps.get(idx).and_then(|m| m.as_str().parse::<u16>().ok());
    let small = |idx: usize| caps.get(idx).and_then(|m| m.as_str().parse::<u8>().ok());
    Some(NoticeDateRange {
        label,
        start: RocDate::new(num(2)?, small(3)?, small(4)?),
        end: RocDate::new(num(5)?, small(6)?, small(7)?),
    })
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Page(#[from] PageError),
    #[error("period select element `historySeason_id` not found in page")]
    MissingElement,
    #[error("bad period selector: {0}")]
    Selector(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Pairs of `(period_id, display_label)` from the period select element.
/// Options without a value attribute are skipped.
pub fn parse_period_options(html: &str) -> Result<Vec<(String, String)>, CatalogError> {
    let document = Html::parse_document(html);
    let select = Selector::parse(&format!("select#{PERIOD_SELECT_ID}"))
        .map_err(|e| CatalogError::Selector(e.to_string()))?;
    let Some(select_el) = document.select(&select).next() else {
        return Err(CatalogError::MissingElement);
    };

    let option = Selector::parse("option").map_err(|e| CatalogError::Selector(e.to_string()))?;
    let mut pairs = Vec::new();
    for opt in select_el.select(&option) {
        let Some(value) = opt.value().attr("value") else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        let label = opt.text().collect::<String>().trim().to_string();
        pairs.push((value.to_string(), label));
    }
    Ok(pairs)
}

/// The list of selectable historical periods. Mutated only by union: the
/// set of selectable past periods only grows, so known keys are never
/// dropped or overwritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodCatalog {
    #[serde(rename = "historySeason_id")]
    pub periods: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRefresh {
    pub added: Vec<String>,
    pub updated: bool,
}

#[derive(Debug, Clone)]
pub struct CatalogStore {
    path: PathBuf,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<PeriodCatalog, CatalogError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PeriodCatalog::default())
            }
            Err(e) => {
                return Err(CatalogError::Persistence(PersistenceError::Io {
                    path: self.path.clone(),
                    source: e,
                }))
            }
        };
        let catalog = serde_json::from_str(&text)
            .map_err(|e| CatalogError::Persistence(PersistenceError::Serialize(e)))?;
        Ok(catalog)
    }

    fn save(&self, catalog: &PeriodCatalog) -> Result<(), CatalogError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CatalogError::Persistence(PersistenceError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })
            })?;
        }
        let bytes = serde_json::to_vec_pretty(catalog)
            .map_err(|e| CatalogError::Persistence(PersistenceError::Serialize(e)))?;
        fs::write(&self.path, bytes).map_err(|e| {
            CatalogError::Persistence(PersistenceError::Io {
                path: self.path.clone(),
                source: e,
            })
        })?;
        Ok(())
    }

    /// Append-only union: keys already present keep their stored label.
    pub fn merge_and_save(
        &self,
        pairs: &[(String, String)],
    ) -> Result<CatalogRefresh, CatalogError> {
        let mut catalog = self.load()?;
        let mut added = Vec::new();
        for (period_id, label) in pairs {
            if !catalog.periods.contains_key(period_id) {
                catalog.periods.insert(period_id.clone(), label.clone());
                added.push(period_id.clone());
            }
        }

        let updated = !added.is_empty();
        if updated || !self.path.exists() {
            self.save(&catalog)?;
        }
        Ok(CatalogRefresh { added, updated })
    }
}

/// Pull the current period list from the page collaborator and merge it
/// into the stored catalog.
pub async fn refresh_catalog(
    page: &dyn PageSource,
    store: &CatalogStore,
) -> Result<CatalogRefresh, CatalogError> {
    let html = page.period_page_html().await?;
    let pairs = parse_period_options(&html)?;
    store.merge_and_save(&pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE_NOTICE: &str = "資料內容：登記日期 114年6月11日至 114年6月20日之買賣案件，\
及訂約日期 114年5月11日至 114年5月20日之租賃案件，\
及交易日期114年5月11日至 114年5月20日之預售屋案件";

    #[test]
    fn notice_parse_extracts_all_three_ranges() {
        let ranges = parse_notice(SAMPLE_NOTICE).expect("parse");
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].label, NoticeDateLabel::RegistrationDate);
        assert_eq!(ranges[0].start, RocDate::new(114, 6, 11));
        assert_eq!(ranges[0].end, RocDate::new(114, 6, 20));
        assert_eq!(ranges[2].label, NoticeDateLabel::TransactionDate);
        assert_eq!(ranges[2].start, RocDate::new(114, 5, 11));
    }

    #[test]
    fn notice_parse_accepts_alternate_range_separator() {
        let ranges = parse_notice("登記日期 113年1月1日到 113年1月10日").expect("parse");
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].end, RocDate::new(113, 1, 10));
    }

    #[test]
    fn notice_parse_zero_matches_is_an_error() {
        match parse_notice("本期無公告") {
            Err(ParseError::NoMatch { .. }) => {}
            other => panic!("expected NoMatch, got {other:?}"),
        }
    }

    #[test]
    fn broken_pattern_is_a_distinct_error_kind() {
        match parse_with_pattern("(", "登記日期") {
            Err(ParseError::Compile { .. }) => {}
            other => panic!("expected Compile, got {other:?}"),
        }
    }

    const SAMPLE_PAGE: &str = r#"<html><body>
<select id="historySeason_id">
  <option value="">請選擇</option>
  <option value="114S1">114年第1季</option>
  <option value="113S4">113年第4季</option>
</select>
</body></html>"#;

    #[test]
    fn period_options_skip_blank_values() {
        let pairs = parse_period_options(SAMPLE_PAGE).expect("parse");
        assert_eq!(
            pairs,
            vec![
                ("114S1".to_string(), "114年第1季".to_string()),
                ("113S4".to_string(), "113年第4季".to_string()),
            ]
        );
    }

    #[test]
    fn missing_select_element_is_an_error() {
        match parse_period_options("<html><body>no select here</body></html>") {
            Err(CatalogError::MissingElement) => {}
            other => panic!("expected MissingElement, got {other:?}"),
        }
    }

    #[test]
    fn catalog_merge_is_append_only() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path().join("fetch_options.json"));

        let first = store
            .merge_and_save(&[("113S4".to_string(), "113年第4季".to_string())])
            .expect("first merge");
        assert!(first.updated);
        assert_eq!(first.added, vec!["113S4".to_string()]);

        // Re-merging the same pair with a different label neither adds nor
        // overwrites.
        let second = store
            .merge_and_save(&[("113S4".to_string(), "renamed".to_string())])
            .expect("second merge");
        assert!(!second.updated);
        assert!(second.added.is_empty());

        let third = store
            .merge_and_save(&[
                ("113S4".to_string(), "113年第4季".to_string()),
                ("114S1".to_string(), "114年第1季".to_string()),
            ])
            .expect("third merge");
        assert!(third.updated);
        assert_eq!(third.added, vec!["114S1".to_string()]);

        let catalog = store.load().expect("load");
        assert_eq!(catalog.periods.len(), 2);
        assert_eq!(catalog.periods["113S4"], "113年第4季");
    }

    #[test]
    fn empty_external_result_does_not_update() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path().join("fetch_options.json"));
        store
            .merge_and_save(&[("113S4".to_string(), "113年第4季".to_string())])
            .expect("seed");
        let refresh = store.merge_and_save(&[]).expect("empty merge");
        assert!(!refresh.updated);
        assert_eq!(store.load().expect("load").periods.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_source_feeds_the_catalog_refresh() {
        let dir = tempdir().expect("tempdir");
        let notice_path = dir.path().join("notice.txt");
        let page_path = dir.path().join("options.html");
        fs::write(&notice_path, SAMPLE_NOTICE).unwrap();
        fs::write(&page_path, SAMPLE_PAGE).unwrap();

        let page = SnapshotPageSource::new(&notice_path, &page_path);
        let store = CatalogStore::new(dir.path().join("fetch_options.json"));
        let refresh = refresh_catalog(&page, &store).await.expect("refresh");
        assert!(refresh.updated);
        assert_eq!(refresh.added.len(), 2);

        let text = page.notice_text().await.expect("notice");
        assert!(parse_notice(&text).is_ok());
    }
}
