//! Sync run orchestration: fan-out catalog fetch, per-category reconciliation,
//! run log, notification and scheduling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset, SubsecRound, Utc};
use rwatch_adapters::{
    workflow_text, CatalogSource, CategoryDigest, FeishuCardSink, FetchOutcome,
    GithubSearchCatalog, GithubSearchConfig, LogOnlySink, NotificationSink, QueryContext,
    RunNotification, WebhookWorkflowTrigger, WorkflowTrigger,
};
use rwatch_core::{
    diff_snapshot, display_offset, merge_change_log, merge_total_table, normalize_snapshot,
    ChangeKind, DayKey, DiffOutcome, RawCatalogItem, SnapshotEntry,
};
use rwatch_storage::{
    HttpClientConfig, HttpFetcher, RateLimit, StoreError, StoredTable, TableStore,
};
use serde::Serialize;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

mod registry;
mod report;

pub use registry::{CategoryConfig, CategoryRegistry, REGISTRY_FILE};
pub use report::report_daily_markdown;

pub const CRATE_NAME: &str = "rwatch-sync";

pub const RUN_LOG_FILE: &str = "update_log.txt";

/// Pretty JSON copy of the most recent run summary, next to the run log.
pub const LAST_RUN_FILE: &str = "last_run.json";

const STAMP: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub github_token: Option<String>,
    pub api_url: String,
    pub data_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub feishu_webhook: Option<String>,
    pub workflow_url: Option<String>,
    pub workflow_token: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_workers: usize,
    pub page_size: u32,
    pub search_rate_per_min: Option<u32>,
    pub utc_offset_hours: i32,
    pub scheduler_enabled: bool,
    /// Six-field cron expression, evaluated in UTC.
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            github_token: None,
            api_url: "https://api.github.com/search/repositories".to_string(),
            data_dir: PathBuf::from("./data"),
            workspace_root: PathBuf::from("."),
            feishu_webhook: None,
            workflow_url: None,
            workflow_token: None,
            user_agent: "rwatch-bot/0.1".to_string(),
            http_timeout_secs: 20,
            fetch_workers: 6,
            page_size: 100,
            search_rate_per_min: None,
            utc_offset_hours: 8,
            scheduler_enabled: false,
            sync_cron: "0 0 9 * * *".to_string(),
        }
    }
}

fn env_text(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_text(key).and_then(|v| v.parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            github_token: env_text("GITHUB_TOKEN"),
            api_url: env_text("RWATCH_API_URL").unwrap_or(defaults.api_url),
            data_dir: env_text("RWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            workspace_root: env_text("RWATCH_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            feishu_webhook: env_text("FEISHU_WEBHOOK"),
            workflow_url: env_text("RWATCH_WORKFLOW_URL"),
            workflow_token: env_text("RWATCH_WORKFLOW_TOKEN"),
            user_agent: env_text("RWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("RWATCH_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            fetch_workers: env_parse("RWATCH_FETCH_WORKERS").unwrap_or(defaults.fetch_workers),
            page_size: env_parse("RWATCH_PAGE_SIZE").unwrap_or(defaults.page_size),
            search_rate_per_min: env_parse("RWATCH_SEARCH_RATE_PER_MIN"),
            utc_offset_hours: env_parse("RWATCH_UTC_OFFSET_HOURS")
                .unwrap_or(defaults.utc_offset_hours),
            scheduler_enabled: env_text("RWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: env_text("RWATCH_SYNC_CRON").unwrap_or(defaults.sync_cron),
        }
    }

    pub fn display_offset(&self) -> Result<FixedOffset> {
        display_offset(self.utc_offset_hours)
            .with_context(|| format!("invalid UTC offset {} hours", self.utc_offset_hours))
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join(REGISTRY_FILE)
    }
}

/// Aborts one category; the rest of the run continues.
#[derive(Debug, Error)]
pub enum CategoryError {
    #[error("loading stores of {category}: {source}")]
    Load {
        category: String,
        #[source]
        source: StoreError,
    },
    #[error("persisting stores of {category}: {source}")]
    Persist {
        category: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestEntry {
    pub kind: String,
    pub path: String,
    pub sha256: String,
    pub bytes: usize,
    pub rows: usize,
}

impl ManifestEntry {
    fn new(kind: &str, stored: StoredTable) -> Self {
        Self {
            kind: kind.to_string(),
            path: stored.path.display().to_string(),
            sha256: stored.sha256,
            bytes: stored.bytes,
            rows: stored.rows,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryReport {
    pub label: String,
    pub display_name: String,
    pub initialized: bool,
    pub fetched: usize,
    pub degraded_partitions: usize,
    pub overlapping_ids: usize,
    pub rejected: usize,
    /// Entities reported as newly discovered; empty for initialization runs.
    pub new: Vec<SnapshotEntry>,
    pub changed: usize,
    pub unchanged: usize,
    pub total_rows: usize,
    pub stores: Vec<ManifestEntry>,
    #[serde(skip)]
    log_lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryFailure {
    pub label: String,
    pub display_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub captured_at: DateTime<FixedOffset>,
    pub categories: Vec<CategoryReport>,
    pub failures: Vec<CategoryFailure>,
    pub log_lines: Vec<String>,
    pub workflow_triggered: Option<bool>,
    pub notified: bool,
}

impl SyncRunSummary {
    pub fn total_new(&self) -> usize {
        self.categories.iter().map(|c| c.new.len()).sum()
    }

    pub fn total_changed(&self) -> usize {
        self.categories.iter().map(|c| c.changed).sum()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn manifest(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.categories.iter().flat_map(|c| c.stores.iter())
    }
}

/// Partition results of one category, combined in configured order.
#[derive(Debug, Default)]
struct CategoryFetch {
    items: Vec<RawCatalogItem>,
    degraded: usize,
    overlaps: usize,
}

fn combine_partitions(category: &CategoryConfig, outcomes: Vec<FetchOutcome>) -> CategoryFetch {
    let mut fetch = CategoryFetch::default();
    let mut first_partition: HashMap<u64, usize> = HashMap::new();
    for (partition, outcome) in outcomes.into_iter().enumerate() {
        if outcome.is_degraded() {
            fetch.degraded += 1;
        }
        for item in outcome.into_items() {
            let seen_in = *first_partition.entry(item.id).or_insert(partition);
            if seen_in != partition {
                fetch.overlaps += 1;
                warn!(
                    category = %category.label,
                    id = item.id,
                    first_partition = seen_in,
                    partition,
                    "entity returned by more than one partition; keeping the later one"
                );
            }
            fetch.items.push(item);
        }
    }
    fetch
}

fn category_log_lines(
    label: &str,
    outcome: &DiffOutcome,
    total_rows: usize,
    captured_at: DateTime<FixedOffset>,
) -> Vec<String> {
    if outcome.initialization {
        return vec![format!(
            "[{}] {label} initialized with {total_rows} entities.",
            captured_at.format(STAMP)
        )];
    }
    let mut lines = outcome
        .new
        .iter()
        .map(|entry| format!("New: {} (★{})", entry.name, entry.metric))
        .chain(
            outcome
                .changed
                .iter()
                .map(|changed| format!("Changed: {} | {}", changed.entry.name, changed.describe())),
        )
        .collect::<Vec<_>>();
    if !lines.is_empty() {
        lines.insert(0, format!("[{label}]"));
    }
    lines
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: CategoryRegistry,
    zone: FixedOffset,
    store: TableStore,
    catalog: Arc<dyn CatalogSource>,
    notifier: Arc<dyn NotificationSink>,
    workflow: Option<Arc<dyn WorkflowTrigger>>,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, registry: CategoryRegistry) -> Result<Self> {
        registry.validate()?;
        let zone = config.display_offset()?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            concurrency: config.fetch_workers.max(1),
            rate_limit: config.search_rate_per_min.and_then(RateLimit::per_minute),
            ..Default::default()
        })?);

        let catalog = Arc::new(GithubSearchCatalog::new(
            Arc::clone(&http),
            GithubSearchConfig {
                api_url: config.api_url.clone(),
                base_query: registry.base_query.clone(),
                token: config.github_token.clone(),
                page_size: config.page_size,
            },
        ));
        let notifier: Arc<dyn NotificationSink> = match &config.feishu_webhook {
            Some(url) => Arc::new(FeishuCardSink::new(Arc::clone(&http), url.clone())),
            None => Arc::new(LogOnlySink),
        };
        let workflow = config.workflow_url.as_ref().map(|url| {
            Arc::new(WebhookWorkflowTrigger::new(
                Arc::clone(&http),
                url.clone(),
                config.workflow_token.clone(),
            )) as Arc<dyn WorkflowTrigger>
        });

        Ok(Self {
            store: TableStore::new(config.data_dir.clone()),
            config,
            registry,
            zone,
            catalog,
            notifier,
            workflow,
            run_lock: Mutex::new(()),
        })
    }

    pub fn with_collaborators(
        mut self,
        catalog: Arc<dyn CatalogSource>,
        notifier: Arc<dyn NotificationSink>,
        workflow: Option<Arc<dyn WorkflowTrigger>>,
    ) -> Self {
        self.catalog = catalog;
        self.notifier = notifier;
        self.workflow = workflow;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &CategoryRegistry {
        &self.registry
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    pub fn zone(&self) -> FixedOffset {
        self.zone
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_at(Utc::now()).await
    }

    /// Runs the pipeline with `now` as the capture time.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SyncRunSummary> {
        let _running = self.run_lock.lock().await;
        self.run_locked(now).await
    }

    /// Like [`Self::run_once`], but returns `Ok(None)` instead of waiting when
    /// another run holds the pipeline.
    pub async fn run_exclusive(&self) -> Result<Option<SyncRunSummary>> {
        let Ok(_running) = self.run_lock.try_lock() else {
            warn!("previous sync run still in progress; skipping");
            return Ok(None);
        };
        self.run_locked(Utc::now()).await.map(Some)
    }

    async fn run_locked(&self, now: DateTime<Utc>) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let captured_at = now.with_timezone(&self.zone).trunc_subsecs(0);
        let day = DayKey::of(&captured_at);
        let categories = self.registry.enabled().cloned().collect::<Vec<_>>();
        info!(%run_id, categories = categories.len(), %day, "sync run started");

        let fetched = self.fetch_all(run_id, &categories).await;

        let mut reports = Vec::new();
        let mut failures = Vec::new();
        let mut digests = Vec::new();
        let mut log_lines = Vec::new();
        for (category, fetch) in categories.iter().zip(fetched) {
            match self.process_category(category, fetch, captured_at, day).await {
                Ok(report) => {
                    log_lines.extend(report.log_lines.iter().cloned());
                    digests.push(CategoryDigest {
                        label: report.label.clone(),
                        display_name: report.display_name.clone(),
                        new_entries: report.new.clone(),
                        changed_count: report.changed,
                        total_rows: report.total_rows,
                        initialized: report.initialized,
                        failure: None,
                    });
                    reports.push(report);
                }
                Err(err) => {
                    error!(%run_id, category = %category.label, error = %err, "category aborted");
                    digests.push(CategoryDigest {
                        label: category.label.clone(),
                        display_name: category.display_name.clone(),
                        new_entries: Vec::new(),
                        changed_count: 0,
                        total_rows: 0,
                        initialized: false,
                        failure: Some(err.to_string()),
                    });
                    failures.push(CategoryFailure {
                        label: category.label.clone(),
                        display_name: category.display_name.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        if let Err(err) = self.append_run_log(&log_lines, captured_at).await {
            warn!(%run_id, error = %format!("{err:#}"), "run log not written");
        }

        let new_entries = reports.iter().flat_map(|r| r.new.iter()).collect::<Vec<_>>();
        let workflow_triggered = match &self.workflow {
            Some(trigger) if !new_entries.is_empty() => {
                let text = workflow_text(new_entries.iter().copied());
                match trigger.trigger(run_id, &text).await {
                    Ok(()) => Some(true),
                    Err(err) => {
                        warn!(%run_id, error = %err, "workflow trigger failed");
                        Some(false)
                    }
                }
            }
            _ => None,
        };

        let notification = RunNotification {
            run_id,
            captured_at,
            categories: digests,
            log_lines: log_lines.clone(),
            workflow_triggered,
        };
        let notified = match self.notifier.deliver(&notification).await {
            Ok(()) => true,
            Err(err) => {
                warn!(%run_id, error = %err, "notification delivery failed");
                false
            }
        };

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            captured_at,
            categories: reports,
            failures,
            log_lines,
            workflow_triggered,
            notified,
        };
        info!(
            %run_id,
            new = summary.total_new(),
            changed = summary.total_changed(),
            failed = summary.failures.len(),
            "sync run finished"
        );
        if let Err(err) = self.write_run_summary(&summary).await {
            warn!(%run_id, error = %format!("{err:#}"), "run summary not written");
        }
        Ok(summary)
    }

    /// Queries every partition of every category on the bounded worker pool
    /// and waits for all of them before returning.
    async fn fetch_all(&self, run_id: Uuid, categories: &[CategoryConfig]) -> Vec<CategoryFetch> {
        let workers = Arc::new(Semaphore::new(self.config.fetch_workers.max(1)));
        let mut tasks = JoinSet::new();
        for (category_index, category) in categories.iter().enumerate() {
            for (partition, filter) in category.partitions.iter().enumerate() {
                let catalog = Arc::clone(&self.catalog);
                let workers = Arc::clone(&workers);
                let ctx = QueryContext {
                    run_id,
                    category: category.label.clone(),
                    partition,
                };
                let filter = filter.clone();
                tasks.spawn(async move {
                    let outcome = match workers.acquire_owned().await {
                        Ok(_permit) => catalog.query(&ctx, &filter).await,
                        Err(_) => FetchOutcome::Degraded {
                            reason: "worker pool closed".to_string(),
                        },
                    };
                    (category_index, partition, outcome)
                });
            }
        }

        let mut slots = categories
            .iter()
            .map(|category| {
                vec![
                    FetchOutcome::Degraded {
                        reason: "fetch task did not complete".to_string(),
                    };
                    category.partitions.len()
                ]
            })
            .collect::<Vec<_>>();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((category_index, partition, outcome)) => {
                    slots[category_index][partition] = outcome;
                }
                Err(err) => {
                    warn!(%run_id, error = %err, "fetch task failed; partition treated as empty");
                }
            }
        }

        categories
            .iter()
            .zip(slots)
            .map(|(category, outcomes)| combine_partitions(category, outcomes))
            .collect()
    }

    async fn process_category(
        &self,
        category: &CategoryConfig,
        fetch: CategoryFetch,
        captured_at: DateTime<FixedOffset>,
        day: DayKey,
    ) -> Result<CategoryReport, CategoryError> {
        let label = category.label.as_str();
        let load = |source| CategoryError::Load {
            category: label.to_string(),
            source,
        };
        let persist = |source| CategoryError::Persist {
            category: label.to_string(),
            source,
        };

        let fetched = fetch.items.len();
        let normalized = normalize_snapshot(fetch.items, captured_at);
        let existing = self.store.load_total(label).await.map_err(load)?;

        let mut report = CategoryReport {
            label: label.to_string(),
            display_name: category.display_name.clone(),
            initialized: false,
            fetched,
            degraded_partitions: fetch.degraded,
            overlapping_ids: fetch.overlaps,
            rejected: normalized.rejected.len(),
            new: Vec::new(),
            changed: 0,
            unchanged: 0,
            total_rows: existing.as_ref().map_or(0, |t| t.len()),
            stores: Vec::new(),
            log_lines: Vec::new(),
        };

        if existing.is_none() && normalized.entries.is_empty() {
            warn!(
                category = label,
                "nothing fetched for a category without a table; staying uninitialized"
            );
            return Ok(report);
        }

        let outcome = diff_snapshot(&normalized.entries, existing.as_ref());
        for kind in ChangeKind::ALL {
            let rows = outcome.change_log_rows(kind);
            if rows.is_empty() {
                continue;
            }
            let current = self
                .store
                .load_change_log(label, kind, day)
                .await
                .map_err(load)?;
            let merged = merge_change_log(current, kind, rows);
            let stored = self
                .store
                .save_change_log(label, day, &merged)
                .await
                .map_err(persist)?;
            report.stores.push(ManifestEntry::new(kind.as_str(), stored));
        }

        let table = merge_total_table(existing, &normalized.entries);
        let stored = self.store.save_total(label, &table).await.map_err(persist)?;
        report.stores.push(ManifestEntry::new("total", stored));

        for entry in &report.stores {
            info!(
                category = label,
                kind = %entry.kind,
                path = %entry.path,
                sha256 = %entry.sha256,
                bytes = entry.bytes,
                rows = entry.rows,
                "store written"
            );
        }

        report.initialized = outcome.initialization;
        report.total_rows = table.len();
        report.changed = outcome.changed.len();
        report.unchanged = outcome.unchanged.len();
        report.log_lines = category_log_lines(label, &outcome, table.len(), captured_at);
        if !outcome.initialization {
            report.new = outcome.new;
        }
        Ok(report)
    }

    async fn append_run_log(
        &self,
        lines: &[String],
        captured_at: DateTime<FixedOffset>,
    ) -> Result<()> {
        let lines = lines
            .iter()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>();
        if lines.is_empty() {
            return Ok(());
        }
        let dir = self.config.data_dir.join("logs");
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(RUN_LOG_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let text = format!("{}\n--- {} ---\n\n", lines.join("\n"), captured_at.format(STAMP));
        file.write_all(text.as_bytes())
            .await
            .with_context(|| format!("appending to {}", path.display()))?;
        file.flush().await.context("flushing run log")?;
        Ok(())
    }

    async fn write_run_summary(&self, summary: &SyncRunSummary) -> Result<PathBuf> {
        let dir = self.config.data_dir.join("logs");
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(LAST_RUN_FILE);
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_exclusive().await {
                    Ok(Some(summary)) if !summary.is_success() => {
                        error!(
                            run_id = %summary.run_id,
                            failed = summary.failures.len(),
                            "scheduled sync finished with failures"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

async fn pipeline_from_env() -> Result<SyncPipeline> {
    let config = SyncConfig::from_env();
    if config.github_token.is_none() {
        bail!("GITHUB_TOKEN is not set");
    }
    let registry = CategoryRegistry::load(&config.registry_path()).await?;
    SyncPipeline::new(config, registry)
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    pipeline_from_env().await?.run_once().await
}

/// Runs the cron scheduler until Ctrl-C.
pub async fn run_scheduler_from_env() -> Result<()> {
    let pipeline = Arc::new(pipeline_from_env().await?);
    let cron = pipeline.config().sync_cron.clone();
    let Some(mut sched) = Arc::clone(&pipeline).maybe_build_scheduler().await? else {
        bail!("scheduler is disabled; set RWATCH_SCHEDULER_ENABLED=1");
    };
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}

/// Daily report for `day`, or for today in the display timezone.
pub async fn report_daily_from_env(day: Option<DayKey>) -> Result<String> {
    let config = SyncConfig::from_env();
    let registry = CategoryRegistry::load(&config.registry_path()).await?;
    let zone = config.display_offset()?;
    let day = day.unwrap_or_else(|| DayKey::of(&Utc::now().with_timezone(&zone)));
    let store = TableStore::new(config.data_dir.clone());
    report_daily_markdown(&store, &registry, day).await
}
