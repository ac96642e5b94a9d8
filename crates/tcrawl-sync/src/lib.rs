//! Paginated ingestion pipeline: page cache, normalization, dedup and persistence.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use tcrawl_adapters::{AdapterError, DetailRequest, TrackerAdapter};
use tcrawl_core::{plan_pages, IssueId, IssueRecord, PageWindow, RawBody, RawPage, Tracker, ISSUE_COLUMNS};
use tcrawl_storage::{
    replace_atomic, to_json_pretty, BackoffPolicy, CacheError, HttpClientConfig, HttpFetcher,
    PageCache, TokenBucketConfig, Transport,
};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tcrawl-sync";

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub retry_delay_secs: u64,
    pub max_retries: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            user_agent: "tracker-crawl/0.1".to_string(),
            http_timeout_secs: 20,
            retry_delay_secs: 5,
            max_retries: 3,
        }
    }
}

impl CrawlConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("DATA")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            user_agent: std::env::var("TCRAWL_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_number("TCRAWL_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            retry_delay_secs: env_number("TCRAWL_RETRY_DELAY_SECS")
                .unwrap_or(defaults.retry_delay_secs),
            max_retries: env_number("TCRAWL_MAX_RETRIES").unwrap_or(defaults.max_retries),
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn http_client_config(&self, min_request_interval: Option<Duration>) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_secs(self.retry_delay_secs),
                ..BackoffPolicy::default()
            },
            token_bucket: min_request_interval.map(|refill_every| TokenBucketConfig {
                capacity: 1,
                refill_every,
            }),
        }
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Where one project's files live under the data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
    stem: String,
}

impl ProjectLayout {
    pub fn new(data_dir: &Path, project: &str) -> Self {
        Self {
            root: data_dir.join(project),
            stem: project.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn json_path(&self) -> PathBuf {
        self.root.join(format!("{}.json", self.stem))
    }

    pub fn csv_path(&self) -> PathBuf {
        self.root.join(format!("{}.csv", self.stem))
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("crawl.log")
    }
}

/// Column-oriented copy of the accepted records, one vector per CSV column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueTable {
    pub issue_id: Vec<IssueId>,
    pub issue_sum: Vec<Option<String>>,
    pub issue_desc: Vec<Option<String>>,
    pub status: Vec<Option<String>>,
    pub url: Vec<Option<String>>,
    pub created_at: Vec<Option<String>>,
    pub updated_at: Vec<Option<String>>,
}

impl IssueTable {
    pub fn push(&mut self, record: &IssueRecord) {
        self.issue_id.push(record.issue_id.clone());
        self.issue_sum.push(record.issue_sum.clone());
        self.issue_desc.push(record.issue_desc.clone());
        self.status.push(record.status.clone());
        self.url.push(record.url.clone());
        self.created_at.push(record.created_at.clone());
        self.updated_at.push(record.updated_at.clone());
    }

    pub fn len(&self) -> usize {
        self.issue_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issue_id.is_empty()
    }

    /// CSV with a header row; nulls are written as empty cells.
    pub fn to_csv(&self) -> Result<Vec<u8>, PersistError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(ISSUE_COLUMNS)?;
        for row in 0..self.len() {
            let cell = |column: &[Option<String>]| {
                column
                    .get(row)
                    .cloned()
                    .flatten()
                    .unwrap_or_default()
            };
            writer.write_record([
                self.issue_id[row].to_string(),
                cell(&self.issue_sum),
                cell(&self.issue_desc),
                cell(&self.status),
                cell(&self.url),
                cell(&self.created_at),
                cell(&self.updated_at),
            ])?;
        }
        writer
            .into_inner()
            .map_err(|e| PersistError::Other(anyhow!("flushing CSV: {}", e.error())))
    }
}

/// Accepts each id once and keeps the id-keyed mapping and the CSV table
/// in step.
#[derive(Debug, Default)]
pub struct IssueAccumulator {
    seen: HashSet<IssueId>,
    mapping: Vec<IssueRecord>,
    table: IssueTable,
    duplicates: usize,
}

impl IssueAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &IssueId) -> bool {
        self.seen.contains(id)
    }

    /// Returns `false` and counts a duplicate when the id was already taken.
    pub fn insert(&mut self, record: IssueRecord) -> bool {
        if !self.seen.insert(record.issue_id.clone()) {
            self.duplicates += 1;
            return false;
        }
        self.table.push(&record);
        self.mapping.push(record);
        true
    }

    pub fn mark_duplicate(&mut self) {
        self.duplicates += 1;
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    pub fn records(&self) -> &[IssueRecord] {
        &self.mapping
    }

    pub fn table(&self) -> &IssueTable {
        &self.table
    }

    /// JSON object keyed by issue id, in first-seen order.
    pub fn mapping_json(&self) -> Result<Vec<u8>, PersistError> {
        Ok(to_json_pretty(&IssueMapping(&self.mapping))?)
    }
}

struct IssueMapping<'a>(&'a [IssueRecord]);

impl Serialize for IssueMapping<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for record in self.0 {
            map.serialize_entry(&record.issue_id.to_string(), record)?;
        }
        map.end()
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("data length mismatch: {mapping} mapped issues vs {table} table rows")]
    LengthMismatch { mapping: usize, table: usize },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct PersistedOutputs {
    pub json_path: PathBuf,
    pub csv_path: PathBuf,
    pub issues: usize,
}

pub async fn persist_outputs(
    layout: &ProjectLayout,
    issues: &IssueAccumulator,
) -> Result<PersistedOutputs, PersistError> {
    if issues.len() != issues.table().len() {
        return Err(PersistError::LengthMismatch {
            mapping: issues.len(),
            table: issues.table().len(),
        });
    }

    let json = issues.mapping_json()?;
    let csv = issues.table().to_csv()?;
    let json_path = layout.json_path();
    let csv_path = layout.csv_path();
    replace_atomic(&json_path, &json).await?;
    replace_atomic(&csv_path, &csv).await?;

    Ok(PersistedOutputs {
        json_path,
        csv_path,
        issues: issues.len(),
    })
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PageFailure {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CrawlRunSummary {
    pub run_id: Uuid,
    pub tracker: Tracker,
    pub project: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reported_total: Option<usize>,
    pub pages_planned: usize,
    pub pages_from_cache: usize,
    pub pages_fetched: usize,
    pub failed_pages: Vec<PageFailure>,
    pub issues_saved: usize,
    pub duplicates: usize,
    pub missing_fields: usize,
    pub detail_failures: usize,
    pub rejected_records: usize,
    pub json_path: String,
    pub csv_path: String,
}

impl CrawlRunSummary {
    pub fn has_failures(&self) -> bool {
        !self.failed_pages.is_empty()
    }
}

enum PageOutcome {
    Cached(RawPage),
    Fetched(RawPage),
    Failed(AdapterError),
    /// A cached copy exists but cannot be decoded.
    Unreadable(CacheError),
}

#[derive(Debug, Default)]
struct RunCounters {
    pages_from_cache: usize,
    pages_fetched: usize,
    failed_pages: Vec<PageFailure>,
    missing_fields: usize,
    detail_failures: usize,
    rejected_records: usize,
}

pub struct CrawlPipeline {
    config: CrawlConfig,
    adapter: Box<dyn TrackerAdapter>,
    http: Arc<dyn Transport>,
}

impl CrawlPipeline {
    pub fn new(config: CrawlConfig, adapter: Box<dyn TrackerAdapter>) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config(adapter.min_request_interval()))?;
        Ok(Self::with_transport(config, adapter, Arc::new(http)))
    }

    pub fn with_transport(
        config: CrawlConfig,
        adapter: Box<dyn TrackerAdapter>,
        http: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            adapter,
            http,
        }
    }

    pub fn layout(&self) -> ProjectLayout {
        ProjectLayout::new(&self.config.data_dir, self.adapter.project())
    }

    pub async fn run_once(&self) -> Result<CrawlRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "crawl",
            %run_id,
            tracker = %self.adapter.tracker(),
            project = self.adapter.project()
        );
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<CrawlRunSummary> {
        let started_at = Utc::now();
        let layout = self.layout();
        let cache = PageCache::new(layout.raw_dir());
        fs::create_dir_all(cache.root())
            .await
            .with_context(|| format!("creating {}", cache.root().display()))?;

        let reported_total = self
            .adapter
            .fetch_total(self.http.as_ref())
            .await
            .with_context(|| {
                format!(
                    "fetching issue count from {} for {}",
                    self.adapter.tracker(),
                    self.adapter.project()
                )
            })?;
        let plan = plan_pages(reported_total, self.adapter.page_size());
        match reported_total {
            Some(total) => info!(
                "start fetching {total} issues from {} ({}) in {} pages",
                self.adapter.tracker(),
                self.adapter.project(),
                plan.len()
            ),
            None => info!(
                "start fetching issues from {} ({}) in a single listing",
                self.adapter.tracker(),
                self.adapter.project()
            ),
        }

        let mut issues = IssueAccumulator::new();
        let mut counters = RunCounters::default();

        for window in &plan {
            let page = match self.load_page(&cache, *window).await? {
                PageOutcome::Cached(page) => {
                    counters.pages_from_cache += 1;
                    page
                }
                PageOutcome::Fetched(page) => {
                    counters.pages_fetched += 1;
                    page
                }
                PageOutcome::Failed(err) => {
                    error!(page = window.index, error = %err, "failed to fetch page");
                    counters.failed_pages.push(PageFailure {
                        index: window.index,
                        error: err.to_string(),
                    });
                    continue;
                }
                PageOutcome::Unreadable(err) => {
                    error!(page = window.index, error = %err, "cached page is unreadable");
                    counters.failed_pages.push(PageFailure {
                        index: window.index,
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            let raw_issues = match self.adapter.split_page(&page) {
                Ok(raw_issues) => raw_issues,
                Err(err) => {
                    error!(page = window.index, error = %err, "failed to read page");
                    counters.failed_pages.push(PageFailure {
                        index: window.index,
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            for raw in raw_issues {
                if issues.contains(&raw.id) {
                    warn!("duplicate issue found: {}", raw.id);
                    issues.mark_duplicate();
                    continue;
                }

                let detail = match self.adapter.detail_request(&raw) {
                    Some(request) => self.load_detail(&cache, &request, &raw.id, &mut counters).await?,
                    None => None,
                };

                match self.adapter.normalize(&raw, detail.as_ref()) {
                    Ok(normalized) => {
                        for missing in &normalized.missing {
                            warn!("{missing}");
                        }
                        counters.missing_fields += normalized.missing.len();
                        issues.insert(normalized.record);
                    }
                    Err(err) => {
                        error!(issue = %raw.id, error = %err, "failed to normalize issue");
                        counters.rejected_records += 1;
                    }
                }
            }

            info!(
                page = window.index + 1,
                pages = plan.len(),
                issues = issues.len(),
                "page processed"
            );
        }

        let outputs = persist_outputs(&layout, &issues)
            .await
            .with_context(|| format!("saving outputs to {}", layout.root().display()))?;
        info!("saved {} issues to {}", outputs.issues, layout.root().display());
        if !counters.failed_pages.is_empty() {
            warn!(
                failed = counters.failed_pages.len(),
                "some pages could not be fetched; re-run to fill them in"
            );
        }

        Ok(CrawlRunSummary {
            run_id,
            tracker: self.adapter.tracker(),
            project: self.adapter.project().to_string(),
            started_at,
            finished_at: Utc::now(),
            reported_total,
            pages_planned: plan.len(),
            pages_from_cache: counters.pages_from_cache,
            pages_fetched: counters.pages_fetched,
            failed_pages: counters.failed_pages,
            issues_saved: outputs.issues,
            duplicates: issues.duplicates(),
            missing_fields: counters.missing_fields,
            detail_failures: counters.detail_failures,
            rejected_records: counters.rejected_records,
            json_path: outputs.json_path.display().to_string(),
            csv_path: outputs.csv_path.display().to_string(),
        })
    }

    /// Cached page if present, otherwise fetch and cache it. A failed fetch
    /// leaves nothing on disk; only I/O errors on the cache are fatal.
    async fn load_page(&self, cache: &PageCache, window: PageWindow) -> Result<PageOutcome> {
        let kind = self.adapter.page_kind();
        let path = cache.page_path(self.adapter.cache_prefix(), window.index, kind);
        match cache.load(&path, kind).await {
            Ok(Some(body)) => {
                return Ok(PageOutcome::Cached(RawPage {
                    index: window.index,
                    body,
                }))
            }
            Ok(None) => {}
            Err(err @ CacheError::Corrupt { .. }) => return Ok(PageOutcome::Unreadable(err)),
            Err(err) => return Err(err.into()),
        }

        let page = match self.adapter.fetch_page(self.http.as_ref(), window).await {
            Ok(page) => page,
            Err(err) => return Ok(PageOutcome::Failed(err)),
        };
        let stored = cache.store(&path, &page.body).await?;
        info!(
            page = window.index,
            bytes = stored.byte_size,
            sha256 = %stored.content_hash,
            "cached page"
        );
        Ok(PageOutcome::Fetched(page))
    }

    async fn load_detail(
        &self,
        cache: &PageCache,
        request: &DetailRequest,
        id: &IssueId,
        counters: &mut RunCounters,
    ) -> Result<Option<RawBody>> {
        let path = cache.detail_path(self.adapter.cache_prefix(), &request.cache_key, request.kind);
        match cache.load(&path, request.kind).await {
            Ok(Some(body)) => return Ok(Some(body)),
            Ok(None) => {}
            Err(err @ CacheError::Corrupt { .. }) => {
                warn!(issue = %id, error = %err, "cached issue detail is unreadable");
                counters.detail_failures += 1;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }
        match self.adapter.fetch_detail(self.http.as_ref(), request).await {
            Ok(body) => {
                cache.store(&path, &body).await?;
                Ok(Some(body))
            }
            Err(err) => {
                warn!(issue = %id, error = %err, "failed to fetch issue detail");
                counters.detail_failures += 1;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tcrawl_adapters::{BugzillaAdapter, MysqlAdapter};
    use tcrawl_storage::testing::StaticTransport;
    use tempfile::tempdir;

    const BASE: &str = "https://bz.example/";

    fn record(id: u64, status: Option<&str>) -> IssueRecord {
        IssueRecord {
            issue_id: IssueId::Number(id),
            issue_sum: Some(format!("summary {id}")),
            issue_desc: None,
            status: status.map(str::to_string),
            url: Some(format!("{BASE}buglist.cgi?id={id}")),
            created_at: Some("2024-01-01T00:00:00Z".into()),
            updated_at: Some("2024-01-02T00:00:00Z".into()),
        }
    }

    fn bug(id: u64) -> serde_json::Value {
        json!({
            "id": id,
            "status": "NEW",
            "summary": format!("summary {id}"),
            "creation_time": "2024-01-01T00:00:00Z",
            "last_change_time": "2024-01-02T00:00:00Z"
        })
    }

    fn comments(id: u64) -> String {
        json!({"bugs": {(id.to_string()): {"comments": [{"text": format!("description {id}")}]}}})
            .to_string()
    }

    fn page_key(limit: usize, offset: usize) -> String {
        format!("{BASE}rest/bug?product=Fedora&limit={limit}&offset={offset}")
    }

    fn comment_key(id: u64) -> String {
        format!("{BASE}rest/bug/{id}/comment")
    }

    /// Three bugs over two pages of two; page 1 repeats bug 2.
    fn bugzilla_transport() -> StaticTransport {
        StaticTransport::new()
            .with_body(page_key(1, 0), json!({"bugs": [bug(1)], "total_matches": 3}).to_string())
            .with_body(page_key(2, 0), json!({"bugs": [bug(1), bug(2)]}).to_string())
            .with_body(page_key(2, 2), json!({"bugs": [bug(2), bug(3)]}).to_string())
            .with_body(comment_key(1), comments(1))
            .with_body(comment_key(2), comments(2))
            .with_body(comment_key(3), comments(3))
    }

    fn pipeline(data_dir: &Path, http: Arc<dyn Transport>) -> CrawlPipeline {
        CrawlPipeline::with_transport(
            CrawlConfig::default().with_data_dir(data_dir),
            Box::new(BugzillaAdapter::new(BASE, "Fedora").with_page_size(2)),
            http,
        )
    }

    #[test]
    fn accumulator_drops_duplicate_ids() {
        let mut issues = IssueAccumulator::new();
        assert!(issues.insert(record(1, Some("NEW"))));
        assert!(issues.insert(record(2, Some("NEW"))));
        assert!(!issues.insert(record(1, Some("CLOSED"))));

        assert_eq!(issues.len(), 2);
        assert_eq!(issues.table().len(), 2);
        assert_eq!(issues.duplicates(), 1);
        assert_eq!(issues.records()[0].status.as_deref(), Some("NEW"));
    }

    #[test]
    fn mapping_json_keeps_first_seen_order() {
        let mut issues = IssueAccumulator::new();
        issues.insert(record(1000, Some("NEW")));
        issues.insert(record(999, None));
        let text = String::from_utf8(issues.mapping_json().unwrap()).unwrap();

        let first = text.find("\"1000\"").unwrap();
        let second = text.find("\"999\"").unwrap();
        assert!(first < second);
        assert!(text.starts_with("{\n    \"1000\": {\n        \"issue_id\": 1000,"));
        assert!(text.contains("\"status\": null"));
    }

    #[test]
    fn csv_table_writes_header_and_blank_nulls() {
        let mut issues = IssueAccumulator::new();
        issues.insert(record(5, None));
        let text = String::from_utf8(issues.table().to_csv().unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("issue_id,issue_sum,issue_desc,status,url,created_at,updated_at")
        );
        assert_eq!(
            lines.next(),
            Some("5,summary 5,,,https://bz.example/buglist.cgi?id=5,2024-01-01T00:00:00Z,2024-01-02T00:00:00Z")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn layout_follows_the_data_directory_convention() {
        let layout = ProjectLayout::new(Path::new("/data"), "Fedora");
        assert_eq!(layout.raw_dir(), PathBuf::from("/data/Fedora/raw"));
        assert_eq!(layout.json_path(), PathBuf::from("/data/Fedora/Fedora.json"));
        assert_eq!(layout.csv_path(), PathBuf::from("/data/Fedora/Fedora.csv"));
        assert_eq!(layout.log_path(), PathBuf::from("/data/Fedora/crawl.log"));
    }

    #[test]
    fn retry_settings_flow_into_the_http_client() {
        let config = CrawlConfig {
            retry_delay_secs: 7,
            max_retries: 2,
            ..CrawlConfig::default()
        };
        let http = config.http_client_config(Some(Duration::from_secs(1)));
        assert_eq!(http.backoff.base_delay, Duration::from_secs(7));
        assert_eq!(http.backoff.max_retries, 2);
        assert_eq!(http.token_bucket.map(|b| b.capacity), Some(1));
    }

    #[tokio::test]
    async fn crawl_writes_matching_unique_outputs() {
        let dir = tempdir().expect("tempdir");
        let http = Arc::new(bugzilla_transport());
        let summary = pipeline(dir.path(), http.clone()).run_once().await.expect("crawl");

        assert_eq!(summary.reported_total, Some(3));
        assert_eq!(summary.pages_planned, 2);
        assert_eq!(summary.pages_fetched, 2);
        assert_eq!(summary.issues_saved, 3);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.missing_fields, 0);
        assert!(!summary.has_failures());

        let mapping: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&std::fs::read(&summary.json_path).unwrap()).unwrap();
        let csv_rows = std::fs::read_to_string(&summary.csv_path).unwrap().lines().count() - 1;
        assert_eq!(mapping.len(), 3);
        assert_eq!(csv_rows, 3);
        assert_eq!(mapping["2"]["issue_desc"], json!("description 2"));

        // The duplicate on page 1 is dropped before its detail is requested.
        let comment_calls = http
            .calls()
            .iter()
            .filter(|c| c.ends_with("/comment"))
            .count();
        assert_eq!(comment_calls, 3);

        let raw = dir.path().join("Fedora").join("raw");
        assert!(raw.join("Fedora_0.json").exists());
        assert!(raw.join("Fedora_1.json").exists());
        assert!(raw.join("detail").join("Fedora_3_comment.json").exists());
    }

    #[tokio::test]
    async fn warm_cache_rerun_matches_cold_run() {
        let dir = tempdir().expect("tempdir");
        let cold = pipeline(dir.path(), Arc::new(bugzilla_transport()))
            .run_once()
            .await
            .expect("cold run");
        let cold_json = std::fs::read(&cold.json_path).unwrap();
        let cold_csv = std::fs::read(&cold.csv_path).unwrap();

        let probe_only = Arc::new(StaticTransport::new().with_body(
            page_key(1, 0),
            json!({"bugs": [], "total_matches": 3}).to_string(),
        ));
        let warm = pipeline(dir.path(), probe_only.clone())
            .run_once()
            .await
            .expect("warm run");

        assert_eq!(warm.pages_from_cache, 2);
        assert_eq!(warm.pages_fetched, 0);
        assert_eq!(warm.detail_failures, 0);
        assert_eq!(probe_only.calls(), vec![page_key(1, 0)]);
        assert_eq!(std::fs::read(&warm.json_path).unwrap(), cold_json);
        assert_eq!(std::fs::read(&warm.csv_path).unwrap(), cold_csv);
    }

    #[tokio::test]
    async fn failed_page_is_reported_and_not_cached() {
        let dir = tempdir().expect("tempdir");
        let http = StaticTransport::new()
            .with_body(page_key(1, 0), json!({"bugs": [], "total_matches": 3}).to_string())
            .with_body(page_key(2, 0), json!({"bugs": [bug(1), bug(2)]}).to_string())
            .with_status(page_key(2, 2), 503)
            .with_body(comment_key(1), comments(1))
            .with_body(comment_key(2), comments(2));
        let summary = pipeline(dir.path(), Arc::new(http))
            .run_once()
            .await
            .expect("crawl");

        assert!(summary.has_failures());
        assert_eq!(summary.failed_pages.len(), 1);
        assert_eq!(summary.failed_pages[0].index, 1);
        assert_eq!(summary.issues_saved, 2);
        assert!(!dir.path().join("Fedora/raw/Fedora_1.json").exists());

        let retry = pipeline(dir.path(), Arc::new(bugzilla_transport()))
            .run_once()
            .await
            .expect("retry run");
        assert!(!retry.has_failures());
        assert_eq!(retry.pages_from_cache, 1);
        assert_eq!(retry.pages_fetched, 1);
        assert_eq!(retry.issues_saved, 3);
    }

    #[tokio::test]
    async fn missing_status_is_counted_once_and_saved_as_null() {
        let dir = tempdir().expect("tempdir");
        let mut no_status = bug(9);
        no_status.as_object_mut().unwrap().remove("status");
        let http = StaticTransport::new()
            .with_body(page_key(1, 0), json!({"bugs": [], "total_matches": 1}).to_string())
            .with_body(page_key(2, 0), json!({"bugs": [no_status]}).to_string())
            .with_body(comment_key(9), comments(9));
        let summary = pipeline(dir.path(), Arc::new(http))
            .run_once()
            .await
            .expect("crawl");

        assert_eq!(summary.missing_fields, 1);
        let mapping: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&summary.json_path).unwrap()).unwrap();
        assert_eq!(mapping["9"]["status"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn failed_count_probe_aborts_the_run() {
        let dir = tempdir().expect("tempdir");
        let err = pipeline(dir.path(), Arc::new(StaticTransport::new()))
            .run_once()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("fetching issue count from bugzilla"));
        assert!(!dir.path().join("Fedora/Fedora.json").exists());
    }

    #[tokio::test]
    async fn failed_detail_request_keeps_the_record_without_description() {
        let dir = tempdir().expect("tempdir");
        let http = StaticTransport::new()
            .with_body(page_key(1, 0), json!({"bugs": [], "total_matches": 3}).to_string())
            .with_body(page_key(2, 0), json!({"bugs": [bug(1), bug(2)]}).to_string())
            .with_body(page_key(2, 2), json!({"bugs": [bug(3)]}).to_string())
            .with_body(comment_key(1), comments(1))
            .with_status(comment_key(2), 500)
            .with_body(comment_key(3), comments(3));
        let summary = pipeline(dir.path(), Arc::new(http))
            .run_once()
            .await
            .expect("crawl");

        assert!(!summary.has_failures());
        assert_eq!(summary.issues_saved, 3);
        assert_eq!(summary.detail_failures, 1);
        assert_eq!(summary.missing_fields, 1);
        let mapping: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&summary.json_path).unwrap()).unwrap();
        assert_eq!(mapping["2"]["issue_desc"], serde_json::Value::Null);
        assert_eq!(mapping["2"]["status"], json!("NEW"));
        assert!(!dir.path().join("Fedora/raw/detail/Fedora_2_comment.json").exists());
    }

    #[tokio::test]
    async fn unreadable_cached_page_is_reported_and_outputs_are_still_written() {
        let dir = tempdir().expect("tempdir");
        let raw = dir.path().join("Fedora").join("raw");
        std::fs::create_dir_all(&raw).unwrap();
        std::fs::write(raw.join("Fedora_1.json"), b"{truncated").unwrap();

        let summary = pipeline(dir.path(), Arc::new(bugzilla_transport()))
            .run_once()
            .await
            .expect("crawl");

        assert!(summary.has_failures());
        assert_eq!(summary.failed_pages.len(), 1);
        assert_eq!(summary.failed_pages[0].index, 1);
        assert!(summary.failed_pages[0].error.contains("Fedora_1.json"));
        assert_eq!(summary.pages_fetched, 1);
        assert_eq!(summary.issues_saved, 2);
        assert!(Path::new(&summary.json_path).exists());
        assert!(Path::new(&summary.csv_path).exists());
    }

    #[tokio::test]
    async fn unreadable_cached_detail_counts_as_a_detail_failure() {
        let dir = tempdir().expect("tempdir");
        let detail = dir.path().join("Fedora").join("raw").join("detail");
        std::fs::create_dir_all(&detail).unwrap();
        std::fs::write(detail.join("Fedora_2_comment.json"), b"").unwrap();

        let summary = pipeline(dir.path(), Arc::new(bugzilla_transport()))
            .run_once()
            .await
            .expect("crawl");

        assert!(!summary.has_failures());
        assert_eq!(summary.issues_saved, 3);
        assert_eq!(summary.detail_failures, 1);
        let mapping: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&summary.json_path).unwrap()).unwrap();
        assert_eq!(mapping["2"]["issue_desc"], serde_json::Value::Null);
        assert_eq!(mapping["3"]["issue_desc"], json!("description 3"));
    }

    const MYSQL_BASE: &str = "https://mysql.example/";

    fn mysql_adapter() -> MysqlAdapter {
        MysqlAdapter::new("Server: InnoDB").with_base_url(MYSQL_BASE)
    }

    fn mysql_transport() -> StaticTransport {
        let listing = mysql_adapter()
            .page_request(PageWindow {
                index: 0,
                offset: 0,
                limit: usize::MAX,
            })
            .describe();
        let csv = "\"ID\",\"Summary\",\"Status\",\"Submitted\",\"Updated\"\n\
                   \"101\",\"InnoDB crash on boot\",\"Verified\",\"2024-01-01 10:00\",\"2024-01-03 09:00\"\n\
                   \"102\",\"Slow purge, large undo\",\"Open\",\"2024-02-01 11:00\",\"2024-02-02 12:00\"\n";
        let bug_page =
            |id: u64| format!("<html><body><div class=\"comment\">Description: crash {id}</div></body></html>");
        StaticTransport::new()
            .with_body(listing, csv)
            .with_body(format!("{MYSQL_BASE}bug.php?id=101"), bug_page(101))
            .with_body(format!("{MYSQL_BASE}bug.php?id=102"), bug_page(102))
    }

    fn mysql_pipeline(data_dir: &Path, http: Arc<dyn Transport>) -> CrawlPipeline {
        CrawlPipeline::with_transport(
            CrawlConfig::default().with_data_dir(data_dir),
            Box::new(mysql_adapter()),
            http,
        )
    }

    #[tokio::test]
    async fn mysql_export_is_cached_as_text_and_rerun_offline() {
        let dir = tempdir().expect("tempdir");
        let cold = mysql_pipeline(dir.path(), Arc::new(mysql_transport()))
            .run_once()
            .await
            .expect("cold run");

        assert_eq!(cold.reported_total, None);
        assert_eq!(cold.pages_planned, 1);
        assert_eq!(cold.issues_saved, 2);
        assert_eq!(cold.missing_fields, 0);

        let root = dir.path().join("server-innodb");
        assert!(root.join("raw").join("server-innodb_0.csv").exists());
        assert!(root.join("raw").join("detail").join("server-innodb_101.html").exists());
        assert!(root.join("raw").join("detail").join("server-innodb_102.html").exists());
        assert_eq!(PathBuf::from(&cold.json_path), root.join("server-innodb.json"));

        let mapping: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&cold.json_path).unwrap()).unwrap();
        assert_eq!(mapping["101"]["issue_id"], json!(101));
        assert_eq!(mapping["101"]["issue_desc"], json!("Description: crash 101"));
        assert_eq!(mapping["102"]["issue_sum"], json!("Slow purge, large undo"));
        assert_eq!(
            mapping["102"]["url"],
            json!("https://mysql.example/bug.php?id=102")
        );

        let offline = Arc::new(StaticTransport::new());
        let warm = mysql_pipeline(dir.path(), offline.clone())
            .run_once()
            .await
            .expect("warm run");

        assert!(offline.calls().is_empty());
        assert_eq!(warm.pages_from_cache, 1);
        assert_eq!(warm.detail_failures, 0);
        assert_eq!(
            std::fs::read(&warm.json_path).unwrap(),
            std::fs::read(&cold.json_path).unwrap()
        );
        assert_eq!(
            std::fs::read(&warm.csv_path).unwrap(),
            std::fs::read(&cold.csv_path).unwrap()
        );
    }
}
