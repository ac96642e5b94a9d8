//! Core issue model and pagination types for tracker-crawl.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "tcrawl-core";

/// Column order of the CSV table and of every serialized record.
pub const ISSUE_COLUMNS: [&str; 7] = [
    "issue_id",
    "issue_sum",
    "issue_desc",
    "status",
    "url",
    "created_at",
    "updated_at",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tracker {
    Bugzilla,
    Jira,
    Mysql,
}

impl Tracker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tracker::Bugzilla => "bugzilla",
            Tracker::Jira => "jira",
            Tracker::Mysql => "mysql",
        }
    }
}

impl fmt::Display for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracker-native issue identifier.
///
/// Bugzilla and MySQL hand out numeric ids while Jira uses numeric strings;
/// the untagged representation keeps whichever JSON type the tracker used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IssueId {
    Number(u64),
    Text(String),
}

impl IssueId {
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Number(n) => n.as_u64().map(IssueId::Number),
            JsonValue::String(s) if !s.trim().is_empty() => Some(IssueId::Text(s.trim().to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueId::Number(n) => write!(f, "{n}"),
            IssueId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for IssueId {
    fn from(value: u64) -> Self {
        IssueId::Number(value)
    }
}

impl From<&str> for IssueId {
    fn from(value: &str) -> Self {
        IssueId::Text(value.to_string())
    }
}

impl From<String> for IssueId {
    fn from(value: String) -> Self {
        IssueId::Text(value)
    }
}

/// Normalized issue as written to both outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub issue_id: IssueId,
    pub issue_sum: Option<String>,
    pub issue_desc: Option<String>,
    pub status: Option<String>,
    pub url: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl IssueRecord {
    pub fn empty(issue_id: IssueId) -> Self {
        Self {
            issue_id,
            issue_sum: None,
            issue_desc: None,
            status: None,
            url: None,
            created_at: None,
            updated_at: None,
        }
    }
}

/// Nullable record fields that a tracker may fail to provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueField {
    Summary,
    Description,
    Status,
    Url,
    CreatedAt,
    UpdatedAt,
}

impl IssueField {
    pub fn column(&self) -> &'static str {
        match self {
            IssueField::Summary => "issue_sum",
            IssueField::Description => "issue_desc",
            IssueField::Status => "status",
            IssueField::Url => "url",
            IssueField::CreatedAt => "created_at",
            IssueField::UpdatedAt => "updated_at",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            IssueField::Summary => "summary",
            IssueField::Description => "description",
            IssueField::Status => "status",
            IssueField::Url => "url",
            IssueField::CreatedAt => "created_at",
            IssueField::UpdatedAt => "updated_at",
        }
    }
}

impl fmt::Display for IssueField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An expected key that was absent from a raw record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingField {
    pub issue_id: IssueId,
    pub field: IssueField,
    /// Tracker locator for the record (browse URL, API self link).
    pub context: Option<String>,
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "missing {} for issue {} ({context})", self.field, self.issue_id),
            None => write!(f, "missing {} for issue {}", self.field, self.issue_id),
        }
    }
}

/// Normalizer output: the record plus one entry per field that came back null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub record: IssueRecord,
    pub missing: Vec<MissingField>,
}

/// Builds an [`IssueRecord`] while collecting [`MissingField`] entries.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    record: IssueRecord,
    missing: Vec<MissingField>,
    context: Option<String>,
}

impl RecordBuilder {
    pub fn new(issue_id: IssueId) -> Self {
        Self {
            record: IssueRecord::empty(issue_id),
            missing: Vec::new(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Sets `field`; a `None` value records the field as missing.
    pub fn set(&mut self, field: IssueField, value: Option<String>) -> &mut Self {
        if value.is_none() {
            self.missing.push(MissingField {
                issue_id: self.record.issue_id.clone(),
                field,
                context: self.context.clone(),
            });
        }
        *self.slot(field) = value;
        self
    }

    /// Sets `field` from a key the tracker did send. An explicit null is
    /// kept as null without being reported missing.
    pub fn set_present(&mut self, field: IssueField, value: Option<String>) -> &mut Self {
        *self.slot(field) = value;
        self
    }

    fn slot(&mut self, field: IssueField) -> &mut Option<String> {
        match field {
            IssueField::Summary => &mut self.record.issue_sum,
            IssueField::Description => &mut self.record.issue_desc,
            IssueField::Status => &mut self.record.status,
            IssueField::Url => &mut self.record.url,
            IssueField::CreatedAt => &mut self.record.created_at,
            IssueField::UpdatedAt => &mut self.record.updated_at,
        }
    }

    pub fn finish(self) -> Normalized {
        Normalized {
            record: self.record,
            missing: self.missing,
        }
    }
}

/// Body of a cached page. JSON pages are re-parsed on load; text pages
/// (CSV exports, HTML) are kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum RawBody {
    Json(JsonValue),
    Text(String),
}

/// On-disk format of a raw document; decides the cache file extension and
/// whether the body is parsed as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyKind {
    Json,
    Csv,
    Html,
}

impl BodyKind {
    pub fn extension(&self) -> &'static str {
        match self {
            BodyKind::Json => "json",
            BodyKind::Csv => "csv",
            BodyKind::Html => "html",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    pub index: usize,
    pub body: RawBody,
}

impl RawPage {
    pub fn json(&self) -> Option<&JsonValue> {
        match &self.body {
            RawBody::Json(value) => Some(value),
            RawBody::Text(_) => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.body {
            RawBody::Json(_) => None,
            RawBody::Text(text) => Some(text),
        }
    }
}

/// One unnormalized issue split out of a raw page.
#[derive(Debug, Clone, PartialEq)]
pub struct RawIssue {
    pub id: IssueId,
    pub body: JsonValue,
}

/// A single paginated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageWindow {
    pub index: usize,
    pub offset: usize,
    pub limit: usize,
}

/// Pages needed to cover `total` issues at `page_size` per page.
///
/// Covers `0..=total / page_size`, so an exact multiple ends with an empty
/// page. Without a reported total the tracker returns everything in page 0.
pub fn plan_pages(total: Option<usize>, page_size: usize) -> Vec<PageWindow> {
    let page_size = page_size.max(1);
    let Some(total) = total else {
        return vec![PageWindow {
            index: 0,
            offset: 0,
            limit: page_size,
        }];
    };
    (0..=total / page_size)
        .map(|index| PageWindow {
            index,
            offset: index * page_size,
            limit: page_size,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn forty_five_issues_at_twenty_per_page_cover_three_pages() {
        let plan = plan_pages(Some(45), 20);
        let indexes = plan.iter().map(|w| w.index).collect::<Vec<_>>();
        let offsets = plan.iter().map(|w| w.offset).collect::<Vec<_>>();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(offsets, vec![0, 20, 40]);
        assert!(plan.iter().all(|w| w.limit == 20));
    }

    #[test]
    fn exact_multiple_and_empty_totals_still_plan_a_trailing_page() {
        assert_eq!(plan_pages(Some(40), 20).len(), 3);
        assert_eq!(plan_pages(Some(0), 50).len(), 1);
    }

    #[test]
    fn unknown_total_plans_a_single_page() {
        let plan = plan_pages(None, 0);
        assert_eq!(
            plan,
            vec![PageWindow {
                index: 0,
                offset: 0,
                limit: 1
            }]
        );
    }

    #[test]
    fn missing_status_yields_null_and_one_warning() {
        let mut builder = RecordBuilder::new(IssueId::Number(7)).with_context("https://t/7");
        builder
            .set(IssueField::Summary, Some("crash on start".into()))
            .set(IssueField::Status, None)
            .set(IssueField::CreatedAt, Some("2024-01-01T00:00:00Z".into()));
        let normalized = builder.finish();

        assert_eq!(normalized.record.status, None);
        assert_eq!(normalized.record.issue_sum.as_deref(), Some("crash on start"));
        assert_eq!(normalized.missing.len(), 1);
        assert_eq!(normalized.missing[0].field, IssueField::Status);
        assert_eq!(
            normalized.missing[0].to_string(),
            "missing status for issue 7 (https://t/7)"
        );
    }

    #[test]
    fn explicit_null_is_not_reported_missing() {
        let mut builder = RecordBuilder::new(IssueId::from("10001"));
        builder
            .set_present(IssueField::Description, None)
            .set(IssueField::UpdatedAt, None);
        let normalized = builder.finish();

        assert_eq!(normalized.record.issue_desc, None);
        assert_eq!(normalized.missing.len(), 1);
        assert_eq!(normalized.missing[0].field, IssueField::UpdatedAt);
    }

    #[test]
    fn issue_ids_keep_their_json_type() {
        assert_eq!(IssueId::from_json(&json!(42)), Some(IssueId::Number(42)));
        assert_eq!(IssueId::from_json(&json!("10001")), Some(IssueId::Text("10001".into())));
        assert_eq!(IssueId::from_json(&json!(null)), None);
        assert_eq!(IssueId::from_json(&json!("  ")), None);

        let record = IssueRecord::empty(IssueId::Number(42));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["issue_id"], json!(42));
        assert_eq!(value["status"], JsonValue::Null);

        let record = IssueRecord::empty(IssueId::from("10001"));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["issue_id"], json!("10001"));
    }
}
