//! Tracker adapter contracts + Bugzilla, Jira and MySQL implementations.

use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tcrawl_core::{
    BodyKind, IssueField, IssueId, Normalized, PageWindow, RawBody, RawIssue, RawPage,
    RecordBuilder, Tracker,
};
use tcrawl_storage::{decode_body, FetchError, HttpRequest, Transport};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "tcrawl-adapters";

pub const DEFAULT_BUGZILLA_URL: &str = "https://bugzilla.redhat.com/";
pub const DEFAULT_JIRA_URL: &str = "https://issues.apache.org/jira/";
pub const DEFAULT_MYSQL_URL: &str = "https://bugs.mysql.com/";

pub const BUGZILLA_PAGE_SIZE: usize = 20;
pub const JIRA_PAGE_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed {tracker} response: {message}")]
    Malformed { tracker: Tracker, message: String },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    fn malformed(tracker: Tracker, message: impl Into<String>) -> Self {
        AdapterError::Malformed {
            tracker,
            message: message.into(),
        }
    }
}

/// Secondary per-issue document an adapter needs to fill in a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailRequest {
    pub cache_key: String,
    pub kind: BodyKind,
    pub request: HttpRequest,
}

#[async_trait]
pub trait TrackerAdapter: Send + Sync {
    fn tracker(&self) -> Tracker;

    /// Directory and file stem of the outputs under the data root.
    fn project(&self) -> &str;

    /// File name prefix for cached raw pages.
    fn cache_prefix(&self) -> &str;

    fn page_size(&self) -> usize;

    fn page_kind(&self) -> BodyKind {
        BodyKind::Json
    }

    /// Minimum spacing between requests, for trackers that ask for it.
    fn min_request_interval(&self) -> Option<Duration> {
        None
    }

    /// Issue count reported by the tracker. `None` means the listing
    /// arrives in a single page.
    async fn fetch_total(&self, http: &dyn Transport) -> Result<Option<usize>, AdapterError>;

    fn page_request(&self, window: PageWindow) -> HttpRequest;

    async fn fetch_page(
        &self,
        http: &dyn Transport,
        window: PageWindow,
    ) -> Result<RawPage, AdapterError> {
        let response = http.get(&self.page_request(window)).await?;
        let body = decode_body(&response.body, self.page_kind())?;
        Ok(RawPage {
            index: window.index,
            body,
        })
    }

    fn split_page(&self, page: &RawPage) -> Result<Vec<RawIssue>, AdapterError>;

    fn detail_request(&self, _issue: &RawIssue) -> Option<DetailRequest> {
        None
    }

    async fn fetch_detail(
        &self,
        http: &dyn Transport,
        detail: &DetailRequest,
    ) -> Result<RawBody, AdapterError> {
        let response = http.get(&detail.request).await?;
        Ok(decode_body(&response.body, detail.kind)?)
    }

    fn normalize(&self, issue: &RawIssue, detail: Option<&RawBody>) -> Result<Normalized, AdapterError>;
}

/// One crawl target as chosen on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tracker", rename_all = "lowercase")]
pub enum TrackerTarget {
    Bugzilla {
        base_url: String,
        project_name: String,
        page_size: Option<usize>,
    },
    Jira {
        base_url: String,
        project_name: String,
        project_key: String,
        component: Option<String>,
        page_size: Option<usize>,
    },
    Mysql {
        base_url: String,
        bug_type: String,
    },
}

pub fn adapter_for_target(target: &TrackerTarget) -> Box<dyn TrackerAdapter> {
    match target {
        TrackerTarget::Bugzilla {
            base_url,
            project_name,
            page_size,
        } => Box::new(
            BugzillaAdapter::new(base_url, project_name)
                .with_page_size(page_size.unwrap_or(BUGZILLA_PAGE_SIZE)),
        ),
        TrackerTarget::Jira {
            base_url,
            project_name,
            project_key,
            component,
            page_size,
        } => Box::new(
            JiraAdapter::new(base_url, project_name, project_key)
                .with_component(component.clone())
                .with_page_size(page_size.unwrap_or(JIRA_PAGE_SIZE)),
        ),
        TrackerTarget::Mysql { base_url, bug_type } => {
            Box::new(MysqlAdapter::new(bug_type).with_base_url(base_url))
        }
    }
}

pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

/// Result of looking a key path up in a raw record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Absent,
    Present(Option<String>),
}

/// Walks `path` through nested objects. A null met along the way counts as
/// a present null; anything else that is not an object counts as absent.
pub fn lookup(value: &JsonValue, path: &[&str]) -> Lookup {
    let mut cur = value;
    for segment in path {
        match cur {
            JsonValue::Object(map) => match map.get(*segment) {
                Some(next) => cur = next,
                None => return Lookup::Absent,
            },
            JsonValue::Null => return Lookup::Present(None),
            _ => return Lookup::Absent,
        }
    }
    Lookup::Present(scalar_text(cur))
}

fn lookup_any(value: &JsonValue, keys: &[&str]) -> Lookup {
    keys.iter()
        .map(|key| lookup(value, &[key]))
        .find(|l| *l != Lookup::Absent)
        .unwrap_or(Lookup::Absent)
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn apply_lookup(builder: &mut RecordBuilder, field: IssueField, found: Lookup) {
    match found {
        Lookup::Absent => builder.set(field, None),
        Lookup::Present(value) => builder.set_present(field, value),
    };
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn page_json<'a>(tracker: Tracker, page: &'a RawPage) -> Result<&'a JsonValue, AdapterError> {
    page.json().ok_or_else(|| {
        AdapterError::malformed(tracker, format!("page {} is not a JSON document", page.index))
    })
}

fn total_from(tracker: Tracker, body: &[u8], key: &str) -> Result<usize, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| AdapterError::malformed(tracker, format!("invalid JSON: {e}")))?;
    value
        .get(key)
        .and_then(JsonValue::as_u64)
        .map(|n| n as usize)
        .ok_or_else(|| AdapterError::malformed(tracker, format!("missing numeric `{key}`")))
}

fn split_json_array(
    tracker: Tracker,
    page: &RawPage,
    array_key: &str,
) -> Result<Vec<RawIssue>, AdapterError> {
    let value = page_json(tracker, page)?;
    let items = value
        .get(array_key)
        .and_then(JsonValue::as_array)
        .ok_or_else(|| {
            AdapterError::malformed(
                tracker,
                format!("page {} has no `{array_key}` array", page.index),
            )
        })?;

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item.get("id").and_then(IssueId::from_json) {
            Some(id) => out.push(RawIssue {
                id,
                body: item.clone(),
            }),
            None => warn!(%tracker, page = page.index, "skipping record without id"),
        }
    }
    Ok(out)
}

/// Bugzilla REST (`rest/bug`) adapter; descriptions come from the first comment.
#[derive(Debug, Clone)]
pub struct BugzillaAdapter {
    base_url: String,
    product: String,
    page_size: usize,
}

impl BugzillaAdapter {
    pub fn new(base_url: &str, product: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            product: product.to_string(),
            page_size: BUGZILLA_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn issue_url(&self, id: &IssueId) -> String {
        format!("{}buglist.cgi?id={id}", self.base_url)
    }

    fn first_comment(&self, id: &IssueId, detail: Option<&RawBody>) -> Option<String> {
        let RawBody::Json(value) = detail? else {
            return None;
        };
        value
            .get("bugs")?
            .get(id.to_string())?
            .get("comments")?
            .as_array()?
            .first()?
            .get("text")
            .and_then(scalar_text)
    }
}

#[async_trait]
impl TrackerAdapter for BugzillaAdapter {
    fn tracker(&self) -> Tracker {
        Tracker::Bugzilla
    }

    fn project(&self) -> &str {
        &self.product
    }

    fn cache_prefix(&self) -> &str {
        &self.product
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    async fn fetch_total(&self, http: &dyn Transport) -> Result<Option<usize>, AdapterError> {
        let probe = self.page_request(PageWindow {
            index: 0,
            offset: 0,
            limit: 1,
        });
        let response = http.get(&probe).await?;
        total_from(self.tracker(), &response.body, "total_matches").map(Some)
    }

    fn page_request(&self, window: PageWindow) -> HttpRequest {
        HttpRequest::get(format!("{}rest/bug", self.base_url))
            .query("product", &self.product)
            .query("limit", window.limit)
            .query("offset", window.offset)
            .accept_json()
    }

    fn split_page(&self, page: &RawPage) -> Result<Vec<RawIssue>, AdapterError> {
        split_json_array(self.tracker(), page, "bugs")
    }

    fn detail_request(&self, issue: &RawIssue) -> Option<DetailRequest> {
        Some(DetailRequest {
            cache_key: format!("{}_comment", issue.id),
            kind: BodyKind::Json,
            request: HttpRequest::get(format!("{}rest/bug/{}/comment", self.base_url, issue.id))
                .accept_json(),
        })
    }

    fn normalize(&self, issue: &RawIssue, detail: Option<&RawBody>) -> Result<Normalized, AdapterError> {
        let url = self.issue_url(&issue.id);
        let mut builder = RecordBuilder::new(issue.id.clone()).with_context(url.clone());
        apply_lookup(&mut builder, IssueField::Status, lookup(&issue.body, &["status"]));
        apply_lookup(&mut builder, IssueField::Summary, lookup(&issue.body, &["summary"]));
        apply_lookup(
            &mut builder,
            IssueField::CreatedAt,
            lookup(&issue.body, &["creation_time"]),
        );
        apply_lookup(
            &mut builder,
            IssueField::UpdatedAt,
            lookup(&issue.body, &["last_change_time"]),
        );
        builder.set(IssueField::Description, self.first_comment(&issue.id, detail));
        builder.set(IssueField::Url, Some(url));
        Ok(builder.finish())
    }
}

/// Jira REST v2 search adapter.
#[derive(Debug, Clone)]
pub struct JiraAdapter {
    base_url: String,
    project_name: String,
    project_key: String,
    component: Option<String>,
    page_size: usize,
}

impl JiraAdapter {
    pub fn new(base_url: &str, project_name: &str, project_key: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            project_name: project_name.to_string(),
            project_key: project_key.to_string(),
            component: None,
            page_size: JIRA_PAGE_SIZE,
        }
    }

    pub fn with_component(mut self, component: Option<String>) -> Self {
        self.component = component.and_then(text_or_none);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn jql(&self) -> String {
        let mut jql = format!("project='{}'", self.project_key);
        if let Some(component) = &self.component {
            jql.push_str(&format!(" AND component='{component}'"));
        }
        jql
    }
}

#[async_trait]
impl TrackerAdapter for JiraAdapter {
    fn tracker(&self) -> Tracker {
        Tracker::Jira
    }

    fn project(&self) -> &str {
        &self.project_name
    }

    fn cache_prefix(&self) -> &str {
        &self.project_key
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    async fn fetch_total(&self, http: &dyn Transport) -> Result<Option<usize>, AdapterError> {
        let probe = self.page_request(PageWindow {
            index: 0,
            offset: 0,
            limit: 1,
        });
        let response = http.get(&probe).await?;
        total_from(self.tracker(), &response.body, "total").map(Some)
    }

    fn page_request(&self, window: PageWindow) -> HttpRequest {
        HttpRequest::get(format!("{}rest/api/2/search", self.base_url))
            .query("jql", self.jql())
            .query("startAt", window.offset)
            .query("maxResults", window.limit)
            .accept_json()
    }

    fn split_page(&self, page: &RawPage) -> Result<Vec<RawIssue>, AdapterError> {
        split_json_array(self.tracker(), page, "issues")
    }

    fn normalize(&self, issue: &RawIssue, _detail: Option<&RawBody>) -> Result<Normalized, AdapterError> {
        let url = issue
            .body
            .get("key")
            .and_then(JsonValue::as_str)
            .map(|key| format!("{}browse/{key}", self.base_url));
        let self_link = issue.body.get("self").and_then(JsonValue::as_str);
        let context = match (&url, self_link) {
            (Some(url), Some(link)) => format!("{url} - {link}"),
            (Some(url), None) => url.clone(),
            (None, Some(link)) => link.to_string(),
            (None, None) => format!("{}#{}", self.project_key, issue.id),
        };

        let mut builder = RecordBuilder::new(issue.id.clone()).with_context(context);
        builder.set(IssueField::Url, url);
        apply_lookup(
            &mut builder,
            IssueField::Status,
            lookup(&issue.body, &["fields", "status", "name"]),
        );
        apply_lookup(
            &mut builder,
            IssueField::Summary,
            lookup(&issue.body, &["fields", "summary"]),
        );
        apply_lookup(
            &mut builder,
            IssueField::Description,
            lookup(&issue.body, &["fields", "description"]),
        );
        apply_lookup(
            &mut builder,
            IssueField::CreatedAt,
            lookup(&issue.body, &["fields", "created"]),
        );
        apply_lookup(
            &mut builder,
            IssueField::UpdatedAt,
            lookup(&issue.body, &["fields", "updated"]),
        );
        Ok(builder.finish())
    }
}

/// bugs.mysql.com adapter: one CSV export for the listing, one HTML page per
/// bug for the description.
#[derive(Debug, Clone)]
pub struct MysqlAdapter {
    base_url: String,
    bug_type: String,
    /// Directory name, output stem and cache prefix; bug types can contain
    /// `/` and spaces.
    slug: String,
}

impl MysqlAdapter {
    pub fn new(bug_type: &str) -> Self {
        Self {
            base_url: DEFAULT_MYSQL_URL.to_string(),
            bug_type: bug_type.to_string(),
            slug: slug(bug_type),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = normalize_base_url(base_url);
        self
    }

    pub fn issue_url(&self, id: &IssueId) -> String {
        format!("{}bug.php?id={id}", self.base_url)
    }
}

fn slug(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Text of the first `div.comment` that contains "Description".
pub fn scrape_description(html: &str) -> Result<Option<String>, AdapterError> {
    let document = Html::parse_document(html);
    let selector =
        Selector::parse("div.comment").map_err(|e| AdapterError::Message(e.to_string()))?;
    Ok(document
        .select(&selector)
        .map(|n| n.text().collect::<String>())
        .find(|text| text.contains("Description"))
        .and_then(text_or_none))
}

/// Parses the CSV export into one JSON object per row with lower-cased
/// column names. Empty cells become nulls.
pub fn parse_csv_rows(text: &str) -> Result<Vec<JsonMap<String, JsonValue>>, AdapterError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| AdapterError::malformed(Tracker::Mysql, format!("reading CSV header: {e}")))?
        .iter()
        .map(|h| h.to_ascii_lowercase())
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record
            .map_err(|e| AdapterError::malformed(Tracker::Mysql, format!("reading CSV row: {e}")))?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(header, cell)| {
                let value = if cell.is_empty() {
                    JsonValue::Null
                } else {
                    JsonValue::String(cell.to_string())
                };
                (header.clone(), value)
            })
            .collect::<JsonMap<_, _>>();
        rows.push(row);
    }
    Ok(rows)
}

#[async_trait]
impl TrackerAdapter for MysqlAdapter {
    fn tracker(&self) -> Tracker {
        Tracker::Mysql
    }

    fn project(&self) -> &str {
        &self.slug
    }

    fn cache_prefix(&self) -> &str {
        &self.slug
    }

    fn page_size(&self) -> usize {
        usize::MAX
    }

    fn page_kind(&self) -> BodyKind {
        BodyKind::Csv
    }

    fn min_request_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(1))
    }

    async fn fetch_total(&self, _http: &dyn Transport) -> Result<Option<usize>, AdapterError> {
        Ok(None)
    }

    fn page_request(&self, _window: PageWindow) -> HttpRequest {
        HttpRequest::get(format!("{}search-csv.php", self.base_url))
            .query("status", "All")
            .query("severity", "all")
            .query("os", 0)
            .query("bug_age", 0)
            .query("order_by", "id")
            .query("direction", "ASC")
            .query("limit", "All")
            .query("mine", 0)
            .query("bug_type[]", &self.bug_type)
    }

    fn split_page(&self, page: &RawPage) -> Result<Vec<RawIssue>, AdapterError> {
        let text = page.text().ok_or_else(|| {
            AdapterError::malformed(Tracker::Mysql, format!("page {} is not a CSV export", page.index))
        })?;
        let mut out = Vec::new();
        for row in parse_csv_rows(text)? {
            let id = match row.get("id").and_then(JsonValue::as_str) {
                Some(raw) => match raw.parse::<u64>() {
                    Ok(n) => IssueId::Number(n),
                    Err(_) => IssueId::from(raw),
                },
                None => {
                    warn!(tracker = %Tracker::Mysql, "skipping CSV row without id");
                    continue;
                }
            };
            out.push(RawIssue {
                id,
                body: JsonValue::Object(row),
            });
        }
        Ok(out)
    }

    fn detail_request(&self, issue: &RawIssue) -> Option<DetailRequest> {
        Some(DetailRequest {
            cache_key: issue.id.to_string(),
            kind: BodyKind::Html,
            request: HttpRequest::get(format!("{}bug.php", self.base_url))
                .query("id", &issue.id),
        })
    }

    fn normalize(&self, issue: &RawIssue, detail: Option<&RawBody>) -> Result<Normalized, AdapterError> {
        let url = self.issue_url(&issue.id);
        let mut builder = RecordBuilder::new(issue.id.clone()).with_context(url.clone());
        apply_lookup(&mut builder, IssueField::Summary, lookup(&issue.body, &["summary"]));
        apply_lookup(&mut builder, IssueField::Status, lookup(&issue.body, &["status"]));
        apply_lookup(
            &mut builder,
            IssueField::CreatedAt,
            lookup_any(&issue.body, &["submitted", "date", "created"]),
        );
        apply_lookup(
            &mut builder,
            IssueField::UpdatedAt,
            lookup_any(&issue.body, &["updated", "last updated", "modified"]),
        );
        let description = match detail {
            Some(RawBody::Text(html)) => scrape_description(html)?,
            _ => None,
        };
        builder.set(IssueField::Description, description);
        builder.set(IssueField::Url, Some(url));
        Ok(builder.finish())
    }
}
