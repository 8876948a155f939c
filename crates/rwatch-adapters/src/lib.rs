//! Catalog, notification and workflow collaborators for RWATCH.
//!
//! Every edge here is fire-and-forget from the pipeline's point of view: a
//! failing catalog query degrades to an empty partition and a failing
//! notification or workflow call is reported back as a value, never a panic.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use rwatch_core::{RawCatalogItem, SnapshotEntry};
use rwatch_storage::{FetchError, HttpFetcher, HttpRequest};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rwatch-adapters";

/// New entities listed per category in a notification.
pub const TOP_NEW_LIMIT: usize = 5;
/// Non-blank log lines quoted in a notification.
pub const LOG_EXCERPT_LINES: usize = 8;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding response: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryContext {
    pub run_id: Uuid,
    pub category: String,
    pub partition: usize,
}

/// Result of one partition query. `Degraded` stands in for every failure mode
/// and contributes nothing to the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Items(Vec<RawCatalogItem>),
    Degraded { reason: String },
}

impl FetchOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, FetchOutcome::Degraded { .. })
    }

    pub fn into_items(self) -> Vec<RawCatalogItem> {
        match self {
            FetchOutcome::Items(items) => items,
            FetchOutcome::Degraded { .. } => Vec::new(),
        }
    }
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Returns up to one page of items matching `filter`, highest metric first.
    async fn query(&self, ctx: &QueryContext, filter: &str) -> FetchOutcome;
}

#[derive(Debug, Clone)]
pub struct GithubSearchConfig {
    pub api_url: String,
    pub base_query: String,
    pub token: Option<String>,
    pub page_size: u32,
}

/// Repository search endpoint, sorted by stars descending.
pub struct GithubSearchCatalog {
    http: Arc<HttpFetcher>,
    config: GithubSearchConfig,
}

impl GithubSearchCatalog {
    pub fn new(http: Arc<HttpFetcher>, config: GithubSearchConfig) -> Self {
        Self { http, config }
    }

    pub fn full_query(&self, filter: &str) -> String {
        format!("{} {}", self.config.base_query.trim(), filter.trim())
            .trim()
            .to_string()
    }

    pub fn request_for(&self, filter: &str) -> HttpRequest {
        HttpRequest::get(&self.config.api_url)
            .query("q", self.full_query(filter))
            .query("sort", "stars")
            .query("order", "desc")
            .query("per_page", self.config.page_size.clamp(1, 100).to_string())
            .header("Accept", "application/vnd.github+json")
            .bearer(self.config.token.clone())
    }
}

#[async_trait]
impl CatalogSource for GithubSearchCatalog {
    fn source_id(&self) -> &'static str {
        "github-search"
    }

    async fn query(&self, ctx: &QueryContext, filter: &str) -> FetchOutcome {
        let request = self.request_for(filter);
        let result = match self.http.send(ctx.run_id, self.source_id(), &request).await {
            Ok(body) => parse_search_response(&body),
            Err(err) => Err(AdapterError::from(err)),
        };
        match result {
            Ok(items) => {
                info!(
                    category = %ctx.category,
                    partition = ctx.partition,
                    items = items.len(),
                    "catalog partition fetched"
                );
                FetchOutcome::Items(items)
            }
            Err(err) => {
                warn!(
                    category = %ctx.category,
                    partition = ctx.partition,
                    filter,
                    error = %err,
                    "catalog query failed; treating partition as empty"
                );
                FetchOutcome::Degraded {
                    reason: err.to_string(),
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    incomplete_results: bool,
    #[serde(default)]
    items: Vec<JsonValue>,
}

/// Decodes a search response body. Items that do not have the expected shape
/// are skipped with a warning instead of failing the whole page.
pub fn parse_search_response(body: &[u8]) -> Result<Vec<RawCatalogItem>, AdapterError> {
    let response: SearchResponse = serde_json::from_slice(body)?;
    if response.incomplete_results {
        warn!("catalog reported incomplete search results");
    }
    let mut items = Vec::with_capacity(response.items.len());
    for (index, value) in response.items.into_iter().enumerate() {
        match serde_json::from_value::<RawCatalogItem>(value) {
            Ok(item) => items.push(item),
            Err(err) => warn!(index, error = %err, "skipping ill-shaped catalog item"),
        }
    }
    Ok(items)
}

/// Per-category slice of a run summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryDigest {
    pub label: String,
    pub display_name: String,
    pub new_entries: Vec<SnapshotEntry>,
    pub changed_count: usize,
    pub total_rows: usize,
    /// The category's cumulative table was created by this run.
    pub initialized: bool,
    pub failure: Option<String>,
}

impl CategoryDigest {
    /// Highest-metric new entries, ties broken by id.
    pub fn top_new(&self, limit: usize) -> Vec<&SnapshotEntry> {
        let mut entries = self.new_entries.iter().collect::<Vec<_>>();
        entries.sort_by(|a, b| b.metric.cmp(&a.metric).then(a.id.cmp(&b.id)));
        entries.truncate(limit);
        entries
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunNotification {
    pub run_id: Uuid,
    pub captured_at: DateTime<FixedOffset>,
    pub categories: Vec<CategoryDigest>,
    pub log_lines: Vec<String>,
    /// `None` when no workflow trigger ran.
    pub workflow_triggered: Option<bool>,
}

impl RunNotification {
    pub fn total_new(&self) -> usize {
        self.categories.iter().map(|c| c.new_entries.len()).sum()
    }

    pub fn total_changed(&self) -> usize {
        self.categories.iter().map(|c| c.changed_count).sum()
    }

    pub fn log_excerpt(&self, max_lines: usize) -> Vec<&str> {
        self.log_lines
            .iter()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .take(max_lines)
            .collect()
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &RunNotification) -> Result<(), AdapterError>;
}

/// Used when no webhook is configured: the summary only goes to the log.
#[derive(Debug, Default)]
pub struct LogOnlySink;

#[async_trait]
impl NotificationSink for LogOnlySink {
    async fn deliver(&self, notification: &RunNotification) -> Result<(), AdapterError> {
        info!(
            run_id = %notification.run_id,
            new = notification.total_new(),
            changed = notification.total_changed(),
            "run summary (no notification webhook configured)"
        );
        Ok(())
    }
}

/// Interactive card posted to a chat group webhook.
pub struct FeishuCardSink {
    http: Arc<HttpFetcher>,
    webhook_url: String,
}

impl FeishuCardSink {
    pub fn new(http: Arc<HttpFetcher>, webhook_url: impl Into<String>) -> Self {
        Self {
            http,
            webhook_url: webhook_url.into(),
        }
    }
}

const COLUMN_COLORS: [&str; 4] = ["red", "orange", "blue", "green"];

fn digest_markdown(digest: &CategoryDigest) -> String {
    if let Some(failure) = &digest.failure {
        return format!("Run failed: {failure}");
    }
    if digest.initialized {
        return format!("Baseline recorded ({} entries)", digest.total_rows);
    }
    let lines = digest
        .top_new(TOP_NEW_LIMIT)
        .into_iter()
        .map(|entry| {
            format!(
                "• [{}]({}) <font color='grey'>🐣{}</font> **<font color='carmine'>★ {}</font>** <text_tag color='orange'>{}</text_tag>",
                entry.name,
                entry.url,
                entry.created_at.format("%Y-%m-%d"),
                entry.metric,
                entry.license
            )
        })
        .collect::<Vec<_>>();
    if lines.is_empty() {
        "No new entries".to_string()
    } else {
        lines.join("\n")
    }
}

/// Card payload for the chat webhook.
pub fn build_feishu_card(notification: &RunNotification) -> JsonValue {
    let total_new = notification.total_new();
    let columns = notification
        .categories
        .iter()
        .enumerate()
        .map(|(index, digest)| {
            let color = COLUMN_COLORS[index % COLUMN_COLORS.len()];
            json!({
                "tag": "column",
                "width": "weighted",
                "weight": 1,
                "background_style": format!("{color}-50"),
                "padding": "12px",
                "elements": [
                    {"tag": "markdown", "content": format!("**<font color='{color}'>{}</font>**", digest.display_name)},
                    {"tag": "markdown", "content": digest_markdown(digest)},
                ],
            })
        })
        .collect::<Vec<_>>();

    let totals = notification
        .categories
        .iter()
        .map(|digest| format!("{} {}", digest.display_name, digest.total_rows))
        .collect::<Vec<_>>()
        .join(" | ");

    let mut elements = vec![
        json!({"tag": "column_set", "flex_mode": "stretch", "horizontal_spacing": "12px", "columns": columns}),
        json!({"tag": "markdown", "content": format!("🔄 **{} known entries changed metric or content**", notification.total_changed())}),
        json!({"tag": "markdown", "content": format!("📝 **Log excerpt:**\n{}", notification.log_excerpt(LOG_EXCERPT_LINES).join("\n"))}),
    ];
    if let Some(triggered) = notification.workflow_triggered {
        let status = if triggered { "delivered" } else { "failed" };
        elements.push(json!({"tag": "markdown", "content": format!("⚙️ Workflow trigger: {status}")}));
    }
    elements.push(json!({"tag": "hr"}));
    elements.push(json!({
        "tag": "markdown",
        "content": format!(
            "<font color='grey' size='small'>📊 Totals: {totals}\n📅 Captured at: {}</font>",
            notification.captured_at.format("%Y-%m-%d %H:%M:%S")
        ),
    }));

    let template = if total_new > 0 { "red" } else { "blue" };
    json!({
        "msg_type": "interactive",
        "card": {
            "schema": "2.0",
            "header": {
                "template": template,
                "title": {"tag": "plain_text", "content": format!("Repository watch: {total_new} new entries")},
                "icon": {"tag": "standard_icon", "token": "code_outlined"},
            },
            "body": {"direction": "vertical", "elements": elements},
        },
    })
}

/// The webhook answers 200 even for rejected cards; the verdict is in `code`.
fn check_webhook_reply(body: &[u8]) -> Result<(), AdapterError> {
    let Ok(reply) = serde_json::from_slice::<JsonValue>(body) else {
        return Ok(());
    };
    match reply.get("code").and_then(JsonValue::as_i64) {
        Some(0) | None => Ok(()),
        Some(code) => Err(AdapterError::Message(format!(
            "webhook rejected card with code {code}: {}",
            reply.get("msg").and_then(JsonValue::as_str).unwrap_or("no message")
        ))),
    }
}

#[async_trait]
impl NotificationSink for FeishuCardSink {
    async fn deliver(&self, notification: &RunNotification) -> Result<(), AdapterError> {
        let request = HttpRequest::post_json(&self.webhook_url, build_feishu_card(notification));
        let body = self
            .http
            .send(notification.run_id, "notify", &request)
            .await?;
        check_webhook_reply(&body)
    }
}

#[async_trait]
pub trait WorkflowTrigger: Send + Sync {
    async fn trigger(&self, run_id: Uuid, text: &str) -> Result<(), AdapterError>;
}

/// Plain-text hand-off: one `Name: URL` line per new entity.
pub fn workflow_text<'a>(entries: impl IntoIterator<Item = &'a SnapshotEntry>) -> String {
    entries
        .into_iter()
        .map(|entry| format!("{}: {}", entry.name, entry.url))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Posts the hand-off text to an automation service webhook.
pub struct WebhookWorkflowTrigger {
    http: Arc<HttpFetcher>,
    url: String,
    token: Option<String>,
}

impl WebhookWorkflowTrigger {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl WorkflowTrigger for WebhookWorkflowTrigger {
    async fn trigger(&self, run_id: Uuid, text: &str) -> Result<(), AdapterError> {
        let request = HttpRequest::post_json(
            &self.url,
            json!({"run_id": run_id.to_string(), "text": text}),
        )
        .bearer(self.token.clone());
        self.http.send(run_id, "workflow", &request).await?;
        Ok(())
    }
}
