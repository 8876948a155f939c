use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rwatch_adapters::{
    AdapterError, CatalogSource, FetchOutcome, NotificationSink, QueryContext, RunNotification,
    WorkflowTrigger,
};
use rwatch_core::{ChangeKind, DayKey, EntityId, RawCatalogItem, RawLicense};
use rwatch_sync::{
    report_daily_markdown, CategoryConfig, CategoryRegistry, SyncConfig, SyncPipeline,
    LAST_RUN_FILE, RUN_LOG_FILE,
};
use uuid::Uuid;

const MIT: &str = "license:mit";
const APACHE: &str = "license:apache-2.0";
const REST: &str = "-license:mit -license:apache-2.0";

#[derive(Default)]
struct FakeCatalog {
    pages: Mutex<HashMap<String, FetchOutcome>>,
}

impl FakeCatalog {
    fn serve(&self, filter: &str, outcome: FetchOutcome) {
        self.pages.lock().unwrap().insert(filter.to_string(), outcome);
    }
}

#[async_trait]
impl CatalogSource for FakeCatalog {
    fn source_id(&self) -> &'static str {
        "fake"
    }

    async fn query(&self, _ctx: &QueryContext, filter: &str) -> FetchOutcome {
        self.pages
            .lock()
            .unwrap()
            .get(filter)
            .cloned()
            .unwrap_or(FetchOutcome::Items(Vec::new()))
    }
}

#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<RunNotification>>,
    fail: bool,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, notification: &RunNotification) -> Result<(), AdapterError> {
        self.delivered.lock().unwrap().push(notification.clone());
        if self.fail {
            return Err(AdapterError::Message("webhook unreachable".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingTrigger {
    texts: Mutex<Vec<String>>,
    fail: bool,
}

#[async_trait]
impl WorkflowTrigger for RecordingTrigger {
    async fn trigger(&self, _run_id: Uuid, text: &str) -> Result<(), AdapterError> {
        self.texts.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(AdapterError::Message("workflow returned 500".into()));
        }
        Ok(())
    }
}

fn registry() -> CategoryRegistry {
    CategoryRegistry {
        base_query: "skills".into(),
        categories: vec![
            CategoryConfig {
                label: "Major".into(),
                display_name: "Major licenses".into(),
                enabled: true,
                partitions: vec![MIT.into(), APACHE.into()],
            },
            CategoryConfig {
                label: "Other".into(),
                display_name: "Other or no license".into(),
                enabled: true,
                partitions: vec![REST.into()],
            },
        ],
    }
}

fn repo(id: u64, stars: i64, license: Option<&str>) -> RawCatalogItem {
    RawCatalogItem {
        id,
        full_name: format!("octo/r{id}"),
        html_url: format!("https://github.com/octo/r{id}"),
        stargazers_count: stars,
        license: license.map(|key| RawLicense { key: key.into() }),
        created_at: Some("2025-10-11T00:00:00Z".into()),
        updated_at: Some("2025-10-12T00:00:00Z".into()),
    }
}

fn utc(d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, d, h, 0, 0).single().unwrap()
}

struct Harness {
    _dir: tempfile::TempDir,
    pipeline: SyncPipeline,
    catalog: Arc<FakeCatalog>,
    sink: Arc<RecordingSink>,
    trigger: Arc<RecordingTrigger>,
}

fn harness(sink: RecordingSink, trigger: RecordingTrigger) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = SyncConfig {
        data_dir: dir.path().join("data"),
        workspace_root: dir.path().to_path_buf(),
        ..SyncConfig::default()
    };
    let catalog = Arc::new(FakeCatalog::default());
    let sink = Arc::new(sink);
    let trigger = Arc::new(trigger);
    let pipeline = SyncPipeline::new(config, registry()).unwrap().with_collaborators(
        catalog.clone(),
        sink.clone(),
        Some(trigger.clone() as Arc<dyn WorkflowTrigger>),
    );
    Harness {
        _dir: dir,
        pipeline,
        catalog,
        sink,
        trigger,
    }
}

fn seed_first_run(catalog: &FakeCatalog) {
    catalog.serve(
        MIT,
        FetchOutcome::Items(vec![repo(42, 100, Some("mit")), repo(7, 140, Some("mit"))]),
    );
    catalog.serve(APACHE, FetchOutcome::Items(vec![repo(8, 5, Some("apache-2.0"))]));
    catalog.serve(REST, FetchOutcome::Items(vec![repo(100, 1, None)]));
}

#[tokio::test]
async fn first_run_initializes_and_later_runs_report_changes() {
    let h = harness(RecordingSink::default(), RecordingTrigger::default());
    let store = h.pipeline.store().clone();
    let nov1 = DayKey::parse("20251101").unwrap();
    let nov2 = DayKey::parse("20251102").unwrap();

    seed_first_run(&h.catalog);
    let first = h.pipeline.run_at(utc(1, 1)).await.unwrap();
    assert!(first.is_success());
    assert_eq!(first.total_new(), 0);
    assert!(first.categories.iter().all(|c| c.initialized));
    assert_eq!(first.workflow_triggered, None);
    assert!(h.trigger.texts.lock().unwrap().is_empty());
    for kind in ChangeKind::ALL {
        assert!(store.load_change_log("Major", kind, nov1).await.unwrap().is_none());
    }
    let major = store.load_total("Major").await.unwrap().unwrap();
    assert_eq!(major.len(), 3);
    for record in major.records() {
        assert_eq!(record.first_seen_at, record.last_seen_at);
        assert_eq!(record.first_seen_at, utc(1, 1));
    }
    let other = store.load_total("Other").await.unwrap().unwrap();
    assert_eq!(other.get(EntityId(100)).unwrap().license, "None");

    // Second day: 42 gains stars, 99 appears, 8 drops out of the results,
    // the apache partition times out and Other returns nothing.
    h.catalog.serve(
        MIT,
        FetchOutcome::Items(vec![
            repo(42, 150, Some("mit")),
            repo(7, 140, Some("mit")),
            repo(99, 10, Some("mit")),
        ]),
    );
    h.catalog.serve(APACHE, FetchOutcome::Degraded { reason: "timeout".into() });
    h.catalog.serve(REST, FetchOutcome::Items(Vec::new()));
    let second = h.pipeline.run_at(utc(2, 1)).await.unwrap();

    assert!(second.is_success());
    let major_report = &second.categories[0];
    assert!(!major_report.initialized);
    assert_eq!(major_report.degraded_partitions, 1);
    assert_eq!(
        major_report.new.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![EntityId(99)]
    );
    assert_eq!(major_report.changed, 1);
    assert_eq!(major_report.unchanged, 1);
    assert_eq!(major_report.total_rows, 4);
    assert_eq!(
        major_report.stores.iter().map(|s| s.kind.as_str()).collect::<Vec<_>>(),
        vec!["new", "changed", "total"]
    );
    assert_eq!(second.workflow_triggered, Some(true));
    assert_eq!(
        h.trigger.texts.lock().unwrap().as_slice(),
        ["octo/r99: https://github.com/octo/r99".to_string()]
    );

    let major = store.load_total("Major").await.unwrap().unwrap();
    let r42 = major.get(EntityId(42)).unwrap();
    assert_eq!(r42.metric, 150);
    assert_eq!(r42.first_seen_at, utc(1, 1));
    assert_eq!(r42.last_seen_at, utc(2, 1));
    assert_eq!(major.get(EntityId(8)).unwrap().last_seen_at, utc(1, 1));
    let changed = store
        .load_change_log("Major", ChangeKind::Changed, nov2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        changed.get(EntityId(42)).unwrap().previous.as_ref().unwrap().delta,
        "metric 100 -> 150"
    );

    // Same snapshot again later that day: nothing new, stores untouched.
    let third = h.pipeline.run_at(utc(2, 9)).await.unwrap();
    assert_eq!(third.total_new(), 0);
    assert_eq!(third.total_changed(), 0);
    assert_eq!(third.workflow_triggered, None);
    let new = store.load_change_log("Major", ChangeKind::New, nov2).await.unwrap().unwrap();
    assert_eq!(new.len(), 1);
    assert_eq!(new.get(EntityId(99)).unwrap().record.first_seen_at, utc(2, 1));

    let delivered = h.sink.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 3);
    assert!(delivered[0].categories.iter().all(|c| c.initialized && c.new_entries.is_empty()));
    assert_eq!(delivered[1].total_new(), 1);
    assert_eq!(delivered[1].workflow_triggered, Some(true));
    drop(delivered);

    let logs_dir = h.pipeline.config().data_dir.join("logs");
    let log = std::fs::read_to_string(logs_dir.join(RUN_LOG_FILE)).unwrap();
    assert!(log.contains("[2025-11-01 09:00:00] Major initialized with 3 entities.\n"));
    assert!(log.contains(
        "[Major]\nNew: octo/r99 (★10)\nChanged: octo/r42 | metric 100 -> 150\n\
         --- 2025-11-02 09:00:00 ---\n\n"
    ));
    assert!(!log.contains("2025-11-02 17:00:00"), "quiet runs append nothing");

    let last_run: serde_json::Value =
        serde_json::from_slice(&std::fs::read(logs_dir.join(LAST_RUN_FILE)).unwrap()).unwrap();
    assert_eq!(last_run["run_id"], third.run_id.to_string());
    assert_eq!(last_run["categories"][0]["label"], "Major");
    assert_eq!(last_run["categories"][0]["changed"], 0);

    let report = report_daily_markdown(&store, h.pipeline.registry(), nov2).await.unwrap();
    assert!(report.starts_with("# Repository Watch daily report 20251102\n"));
    assert!(report.contains("## Major licenses\n\n- New: 1\n- Changed: 1\n- Cumulative: 4\n"));
    assert!(report.contains(
        "| [octo/r42](https://github.com/octo/r42) | 150 | metric 100 -> 150 |"
    ));
    assert!(report.contains(
        "## Other or no license\n\n- New: 0\n- Changed: 0\n- Cumulative: 1\n\n\
         _No changes recorded._"
    ));
}

#[tokio::test]
async fn malformed_store_aborts_only_its_category() {
    let h = harness(RecordingSink::default(), RecordingTrigger::default());
    let store = h.pipeline.store().clone();
    let other_path = store.total_path("Other");
    std::fs::create_dir_all(other_path.parent().unwrap()).unwrap();
    std::fs::write(&other_path, b"id,name\n1,broken\n").unwrap();

    seed_first_run(&h.catalog);
    let summary = h.pipeline.run_at(utc(1, 1)).await.unwrap();

    assert!(!summary.is_success());
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].label, "Other");
    assert_eq!(summary.categories.len(), 1);
    assert_eq!(store.load_total("Major").await.unwrap().unwrap().len(), 3);
    assert_eq!(std::fs::read(&other_path).unwrap(), b"id,name\n1,broken\n");

    let delivered = h.sink.delivered.lock().unwrap();
    let other = delivered[0].categories.iter().find(|c| c.label == "Other").unwrap();
    assert!(other.failure.as_deref().unwrap_or_default().contains("malformed"));
}

#[tokio::test]
async fn delivery_failures_do_not_fail_the_run() {
    let h = harness(
        RecordingSink {
            fail: true,
            ..RecordingSink::default()
        },
        RecordingTrigger {
            fail: true,
            ..RecordingTrigger::default()
        },
    );
    seed_first_run(&h.catalog);
    h.pipeline.run_at(utc(1, 1)).await.unwrap();

    h.catalog.serve(
        REST,
        FetchOutcome::Items(vec![repo(100, 1, None), repo(101, 3, Some("wtfpl"))]),
    );
    let summary = h.pipeline.run_at(utc(1, 5)).await.unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.total_new(), 1);
    assert_eq!(summary.workflow_triggered, Some(false));
    assert!(!summary.notified);
    assert_eq!(h.trigger.texts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn empty_first_fetch_leaves_category_uninitialized() {
    let h = harness(RecordingSink::default(), RecordingTrigger::default());
    h.catalog.serve(MIT, FetchOutcome::Degraded { reason: "rate limited".into() });
    let summary = h.pipeline.run_at(utc(1, 1)).await.unwrap();

    assert!(summary.is_success());
    assert!(h.pipeline.store().load_total("Major").await.unwrap().is_none());
    assert!(summary.categories.iter().all(|c| !c.initialized && c.stores.is_empty()));
}
