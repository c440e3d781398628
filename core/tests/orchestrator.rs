//! Orchestrator and job lifecycle tests.
//!
//! Tests cover: submission, inline execution, auto-matched controls,
//! tenant isolation, retrieval errors, worker timeouts and panics, the
//! stale-job sweep, artifacts, queue claiming and the threaded pool.

use chrono::{Duration as ChronoDuration, Utc};
use port_impact_core::{
    analysis::AnalysisStatus,
    config::EngineConfig,
    error::{EngineError, EngineResult},
    orchestrator::{Orchestrator, WorkerPool},
    panel::{InMemoryPanelSource, Observation, PanelQuery, PanelSource},
    request::{Method, Scope, Window},
    simulate::{simulate, SimulatedPanel, SimulationSpec, OUTCOME_GDP},
    store::AnalysisStore,
    types::UnitId,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TENANT: &str = "acme";

fn sim() -> SimulatedPanel {
    simulate(&SimulationSpec::default())
}

fn orchestrator_with(source: Arc<dyn PanelSource>, config: EngineConfig) -> Orchestrator {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = AnalysisStore::in_memory().expect("in-memory store");
    store.migrate().expect("migrate");
    Orchestrator::new(store, source, config)
}

fn orchestrator(sim: &SimulatedPanel) -> Orchestrator {
    let source = InMemoryPanelSource::new();
    sim.load_into(&source, TENANT);
    orchestrator_with(Arc::new(source), EngineConfig::default())
}

/// Panel source that takes longer than the worker timeout.
struct SlowSource {
    inner: InMemoryPanelSource,
    delay: Duration,
}

impl PanelSource for SlowSource {
    fn fetch(&self, tenant_id: &str, query: &PanelQuery) -> EngineResult<Vec<Observation>> {
        std::thread::sleep(self.delay);
        self.inner.fetch(tenant_id, query)
    }

    fn candidate_units(&self, tenant_id: &str, scope: Scope) -> EngineResult<Vec<UnitId>> {
        self.inner.candidate_units(tenant_id, scope)
    }
}

/// Panel source whose reads blow up.
struct PanickingSource;

impl PanelSource for PanickingSource {
    fn fetch(&self, _tenant_id: &str, _query: &PanelQuery) -> EngineResult<Vec<Observation>> {
        panic!("warehouse connection dropped");
    }

    fn candidate_units(&self, _tenant_id: &str, _scope: Scope) -> EngineResult<Vec<UnitId>> {
        Ok(Vec::new())
    }
}

/// Temp database file removed on drop.
struct TempDb(String);

impl TempDb {
    fn new() -> Self {
        let path = std::env::temp_dir().join(format!("port-impact-{}.db", uuid::Uuid::new_v4()));
        Self(path.to_str().expect("utf-8 temp path").to_string())
    }

    /// Install a trigger through a separate connection.
    fn install_trigger(&self, sql: &str) {
        let conn = rusqlite::Connection::open(&self.0).expect("open raw connection");
        conn.execute_batch(sql).expect("install trigger");
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", self.0));
        }
    }
}

fn file_orchestrator(db: &TempDb, sim: &SimulatedPanel) -> Orchestrator {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = AnalysisStore::open(&db.0).expect("open store");
    store.migrate().expect("migrate");
    let source = InMemoryPanelSource::new();
    sim.load_into(&source, TENANT);
    Orchestrator::new(store, Arc::new(source), EngineConfig::default())
}

// ── Submission and execution ─────────────────────────────────────────────────

/// Submission only enqueues; nothing runs until a worker claims the job.
#[test]
fn submit_returns_queued_analysis() {
    let sim = sim();
    let orch = orchestrator(&sim);

    let id = orch.submit(sim.request(Method::Did), TENANT).expect("submit");
    let analysis = orch.get_status(&id, TENANT).expect("status");

    assert_eq!(analysis.status, AnalysisStatus::Queued);
    assert_eq!(analysis.method, Method::Did);
    assert!(analysis.started_at.is_none() && analysis.completed_at.is_none());
    assert!(analysis.result_summary.is_none() && analysis.result_full.is_none());
    assert_eq!(orch.store().count_by_status(AnalysisStatus::Queued).expect("count"), 1);
}

/// Invalid requests are rejected at submission and never stored.
#[test]
fn invalid_request_is_rejected_at_submit() {
    let sim = sim();
    let orch = orchestrator(&sim);

    let mut request = sim.request(Method::Did);
    request.treated_ids.clear();
    let err = orch.submit(request, TENANT).expect_err("empty treated set");
    assert!(matches!(err, EngineError::Validation(_)), "got {err:?}");

    let err = orch.submit(sim.request(Method::Did), " ").expect_err("blank tenant");
    assert!(matches!(err, EngineError::Validation(_)), "got {err:?}");

    assert_eq!(orch.store().count_by_status(AnalysisStatus::Queued).expect("count"), 0);
}

/// Running the queue drives the job to success with both result forms.
#[test]
fn run_pending_completes_analysis() {
    let sim = sim();
    let orch = orchestrator(&sim);
    let id = orch.submit(sim.request(Method::Did), TENANT).expect("submit");

    assert_eq!(orch.run_pending().expect("run"), 1);
    let analysis = orch.get_status(&id, TENANT).expect("status");
    assert_eq!(analysis.status, AnalysisStatus::Success);
    assert!(analysis.started_at.is_some());
    assert!(analysis.completed_at.is_some());
    assert!(analysis.error_message.is_none());

    let summary = orch.get_summary(&id, TENANT).expect("summary");
    let result = orch.get_result(&id, TENANT).expect("result");
    assert_eq!(summary.n_treated, 3);
    assert_eq!(summary.n_control, 12);
    let headline = &summary.outcomes[0];
    assert_eq!(headline.outcome, OUTCOME_GDP);
    assert_eq!(headline.coef, result.outcomes[0].coef);
    assert!(headline.significant, "a 1.5 effect with 0.1 noise must be significant");
    assert!(result.outcomes[0].payload.is_some(), "full result keeps the method payload");

    assert_eq!(orch.run_pending().expect("second run"), 0, "queue is drained");
}

/// An indeterminate estimate is still a successful job.
#[test]
fn indeterminate_estimate_is_success() {
    let sim = sim();
    let orch = orchestrator(&sim);
    let mut request = sim.request(Method::Did);
    request.window = Window::new(2013, 2013);
    let id = orch.submit(request, TENANT).expect("submit");
    orch.run_pending().expect("run");

    let summary = orch.get_summary(&id, TENANT).expect("summary of a null estimate");
    assert!(summary.outcomes[0].coef.is_none());
    assert!(!summary.outcomes[0].significant);
    assert!(summary.outcomes[0].warnings[0].starts_with("insufficient data"));
}

/// With no controls given, matching selects them and the chosen set is
/// written back into the stored request.
#[test]
fn auto_selected_controls_are_recorded() {
    let sim = sim();
    let orch = orchestrator(&sim);
    let mut request = sim.request(Method::Did);
    request.control_ids = None;
    request.n_controls = Some(5);
    let id = orch.submit(request, TENANT).expect("submit");
    orch.run_pending().expect("run");

    let analysis = orch.get_status(&id, TENANT).expect("status");
    assert_eq!(analysis.status, AnalysisStatus::Success, "error: {:?}", analysis.error_message);
    let controls = analysis.request_params.control_ids.expect("controls written back");
    assert_eq!(controls.len(), 5);
    assert!(controls.is_disjoint(&sim.treated_ids), "treated unit selected as control");

    let result = orch.get_result(&id, TENANT).expect("result");
    let used: Vec<&String> = controls.iter().collect();
    let reported: Vec<&String> = result.control_ids.iter().collect();
    assert_eq!(used, reported);
}

/// A one-year window leaves matching nothing to rank on. Every candidate
/// in scope becomes a control and the job still succeeds with a null
/// coefficient.
#[test]
fn auto_controls_without_pre_period_still_succeed() {
    let sim = sim();
    let orch = orchestrator(&sim);
    let mut request = sim.request(Method::Did);
    request.control_ids = None;
    request.window = Window::new(2013, 2013);
    let id = orch.submit(request, TENANT).expect("submit");
    orch.run_pending().expect("run");

    let analysis = orch.get_status(&id, TENANT).expect("status");
    assert_eq!(analysis.status, AnalysisStatus::Success, "error: {:?}", analysis.error_message);
    let controls = analysis.request_params.control_ids.expect("controls written back");
    assert_eq!(controls, sim.control_ids);

    let summary = analysis.result_summary.expect("summary");
    let warnings = &summary.outcomes[0].warnings;
    assert!(summary.outcomes[0].coef.is_none());
    assert!(warnings[0].starts_with("insufficient data"), "warnings: {warnings:?}");
    assert!(
        warnings.iter().any(|w| w.starts_with("matching: no pre-treatment year")),
        "warnings: {warnings:?}"
    );
}

/// A panel with no data for the requested units fails the job.
#[test]
fn empty_panel_fails_analysis() {
    let sim = sim();
    let orch = orchestrator(&sim);
    let mut request = sim.request(Method::Did);
    request.treated_ids = ["NOWHERE".to_string()].into_iter().collect();
    request.control_ids = Some(["NOBODY".to_string()].into_iter().collect());
    let id = orch.submit(request, TENANT).expect("submit");
    orch.run_pending().expect("run");

    let analysis = orch.get_status(&id, TENANT).expect("status");
    assert_eq!(analysis.status, AnalysisStatus::Failed);
    let message = analysis.error_message.expect("error message");
    assert!(message.contains("Insufficient data"), "got {message}");

    let err = orch.get_result(&id, TENANT).expect_err("failed analysis has no result");
    assert!(matches!(err, EngineError::AnalysisFailed { .. }), "got {err:?}");
}

// ── Retrieval rules ──────────────────────────────────────────────────────────

/// Another tenant cannot see, read or annotate the analysis.
#[test]
fn foreign_tenant_gets_not_found() {
    let sim = sim();
    let orch = orchestrator(&sim);
    let id = orch.submit(sim.request(Method::Did), TENANT).expect("submit");
    orch.run_pending().expect("run");

    let not_found = |r: Result<(), EngineError>| {
        let err = r.expect_err("foreign tenant must be refused");
        assert!(matches!(err, EngineError::NotFound { .. }), "got {err:?}");
    };
    not_found(orch.get_status(&id, "globex").map(|_| ()));
    not_found(orch.get_result(&id, "globex").map(|_| ()));
    not_found(orch.get_summary(&id, "globex").map(|_| ()));
    not_found(orch.attach_artifact(&id, "globex", "plot", "/tmp/x.png"));
    assert!(orch.list_analyses("globex", 10).expect("list").is_empty());

    not_found(orch.get_status("no-such-id", TENANT).map(|_| ()));
}

/// Results of unfinished analyses are `NotReady`.
#[test]
fn unfinished_analysis_is_not_ready() {
    let sim = sim();
    let orch = orchestrator(&sim);
    let id = orch.submit(sim.request(Method::Did), TENANT).expect("submit");

    let err = orch.get_result(&id, TENANT).expect_err("queued");
    assert!(matches!(err, EngineError::NotReady { .. }), "got {err:?}");
    let err = orch.attach_artifact(&id, TENANT, "plot", "/tmp/x.png").expect_err("queued");
    assert!(matches!(err, EngineError::NotReady { .. }), "got {err:?}");
}

/// Artifacts attach after completion and show up on the analysis.
#[test]
fn artifacts_attach_after_completion() {
    let sim = sim();
    let orch = orchestrator(&sim);
    let id = orch.submit(sim.request(Method::EventStudy), TENANT).expect("submit");
    orch.run_pending().expect("run");

    orch.attach_artifact(&id, TENANT, "event_study_plot", "/plots/es.png").expect("attach");
    let analysis = orch.get_status(&id, TENANT).expect("status");
    assert_eq!(analysis.artifacts.len(), 1);
    assert_eq!(analysis.artifacts[0].kind, "event_study_plot");
    assert_eq!(analysis.artifacts[0].path, "/plots/es.png");
    assert_eq!(analysis.status, AnalysisStatus::Success, "artifacts never change status");
}

/// Listing is tenant-scoped, newest first and limited.
#[test]
fn list_is_newest_first() {
    let sim = sim();
    let orch = orchestrator(&sim);
    let ids: Vec<String> = [Method::Did, Method::EventStudy, Method::Scm]
        .into_iter()
        .map(|m| orch.submit(sim.request(m), TENANT).expect("submit"))
        .collect();
    orch.submit(sim.request(Method::Did), "globex").expect("submit other tenant");

    let listed: Vec<String> = orch.list_analyses(TENANT, 10).expect("list").into_iter().map(|a| a.id).collect();
    let expected: Vec<String> = ids.iter().rev().cloned().collect();
    assert_eq!(listed, expected);
    assert_eq!(orch.list_analyses(TENANT, 2).expect("list").len(), 2);
}

// ── Worker guarantees ────────────────────────────────────────────────────────

/// Claims are FIFO and never hand the same job out twice.
#[test]
fn claims_are_fifo_and_exclusive() {
    let sim = sim();
    let orch = orchestrator(&sim);
    let first = orch.submit(sim.request(Method::Did), TENANT).expect("submit");
    let second = orch.submit(sim.request(Method::Did), TENANT).expect("submit");

    let store = orch.store();
    let a = store.claim_next("w1", Utc::now()).expect("claim").expect("job");
    let b = store.claim_next("w2", Utc::now()).expect("claim").expect("job");
    assert_eq!((a.id.as_str(), b.id.as_str()), (first.as_str(), second.as_str()));
    assert_eq!(a.status, AnalysisStatus::Running);
    assert!(store.claim_next("w3", Utc::now()).expect("claim").is_none());

    // Terminal rows do not move again.
    store.record_failure(&a.id, "boom", Utc::now()).expect("fail");
    let err = store.record_failure(&a.id, "again", Utc::now()).expect_err("already terminal");
    assert!(matches!(err, EngineError::InvalidTransition { .. }), "got {err:?}");
}

/// A job slower than the worker limit ends `failed` with a timeout message.
#[test]
fn slow_job_times_out() {
    let sim = sim();
    let inner = InMemoryPanelSource::new();
    sim.load_into(&inner, TENANT);
    let mut config = EngineConfig::default();
    config.workers.job_timeout_secs = 1;
    let orch = orchestrator_with(Arc::new(SlowSource { inner, delay: Duration::from_secs(3) }), config);

    let id = orch.submit(sim.request(Method::Did), TENANT).expect("submit");
    let started = Instant::now();
    orch.run_pending().expect("run");
    assert!(started.elapsed() < Duration::from_secs(3), "worker must not wait for the slow job");

    let analysis = orch.get_status(&id, TENANT).expect("status");
    assert_eq!(analysis.status, AnalysisStatus::Failed);
    let message = analysis.error_message.expect("error message");
    assert!(message.starts_with("timeout"), "got {message}");
}

/// A panicking job is recorded as failed, and the worker survives.
#[test]
fn panicking_job_fails_cleanly() {
    let sim = sim();
    let orch = orchestrator_with(Arc::new(PanickingSource), EngineConfig::default());
    let first = orch.submit(sim.request(Method::Did), TENANT).expect("submit");
    let second = orch.submit(sim.request(Method::Did), TENANT).expect("submit");

    assert_eq!(orch.run_pending().expect("run"), 2);
    for id in [first, second] {
        let analysis = orch.get_status(&id, TENANT).expect("status");
        assert_eq!(analysis.status, AnalysisStatus::Failed);
        assert_eq!(analysis.error_message.as_deref(), Some("estimation panicked"));
    }
}

/// Jobs left running by a crashed worker are swept to failed.
#[test]
fn stale_running_jobs_are_swept() {
    let sim = sim();
    let orch = orchestrator(&sim);
    let stale = orch.submit(sim.request(Method::Did), TENANT).expect("submit");
    let fresh = orch.submit(sim.request(Method::Did), TENANT).expect("submit");

    let store = orch.store();
    store.claim_next("crashed", Utc::now() - ChronoDuration::hours(2)).expect("claim").expect("job");
    store.claim_next("alive", Utc::now()).expect("claim").expect("job");

    let swept = orch.sweep_stale().expect("sweep");
    assert_eq!(swept, vec![stale.clone()]);

    let analysis = orch.get_status(&stale, TENANT).expect("status");
    assert_eq!(analysis.status, AnalysisStatus::Failed);
    assert!(analysis.error_message.expect("message").starts_with("timeout"));
    assert_eq!(orch.get_status(&fresh, TENANT).expect("status").status, AnalysisStatus::Running);
}

/// A pool of threaded workers drains the queue of a shared database file.
#[test]
fn worker_pool_drains_queue() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = std::env::temp_dir().join(format!("port-impact-{}.db", uuid::Uuid::new_v4()));
    let db = path.to_str().expect("utf-8 temp path").to_string();

    let sim = sim();
    let source = InMemoryPanelSource::new();
    sim.load_into(&source, TENANT);
    let source: Arc<dyn PanelSource> = Arc::new(source);
    let mut config = EngineConfig::default();
    config.workers.worker_count = 3;
    config.workers.idle_poll_ms = 20;

    let store = AnalysisStore::open(&db).expect("open");
    store.migrate().expect("migrate");
    let orch = Orchestrator::new(store, Arc::clone(&source), config.clone());
    let ids: Vec<String> = [Method::Did, Method::EventStudy, Method::PanelIv, Method::Iv, Method::Did]
        .into_iter()
        .map(|m| orch.submit(sim.request(m), TENANT).expect("submit"))
        .collect();

    let pool = WorkerPool::start(&config, &db, source).expect("start pool");
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let done = ids
            .iter()
            .filter(|id| orch.get_status(id, TENANT).map(|a| a.is_terminal()).unwrap_or(false))
            .count();
        if done == ids.len() || Instant::now() > deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    pool.shutdown();

    for id in &ids {
        let analysis = orch.get_status(id, TENANT).expect("status");
        assert_eq!(
            analysis.status,
            AnalysisStatus::Success,
            "{id} ended {} ({:?})",
            analysis.status,
            analysis.error_message
        );
    }
    drop(orch);
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{db}{suffix}"));
    }
}

// ── Store write failures ─────────────────────────────────────────────────────

/// When the success write is rejected the job is failed with the store
/// error, never left running.
#[test]
fn rejected_result_write_fails_job() {
    let db = TempDb::new();
    let sim = sim();
    let orch = file_orchestrator(&db, &sim);
    db.install_trigger(
        "CREATE TRIGGER reject_success BEFORE UPDATE OF status ON analysis
         WHEN NEW.status = 'success'
         BEGIN SELECT RAISE(ABORT, 'disk quota exceeded'); END;",
    );
    let id = orch.submit(sim.request(Method::Did), TENANT).expect("submit");
    assert_eq!(orch.run_pending().expect("run"), 1);

    let analysis = orch.get_status(&id, TENANT).expect("status");
    assert_eq!(analysis.status, AnalysisStatus::Failed);
    let message = analysis.error_message.expect("error message");
    assert!(message.contains("could not store result"), "got {message}");
    assert!(message.contains("disk quota exceeded"), "got {message}");
    assert!(analysis.result_full.is_none());
}

/// When the auto-selected controls cannot be written back the job fails
/// instead of hanging in running.
#[test]
fn rejected_controls_write_fails_job() {
    let db = TempDb::new();
    let sim = sim();
    let orch = file_orchestrator(&db, &sim);
    db.install_trigger(
        "CREATE TRIGGER reject_params BEFORE UPDATE OF request_params ON analysis
         BEGIN SELECT RAISE(ABORT, 'request column locked'); END;",
    );
    let mut request = sim.request(Method::Did);
    request.control_ids = None;
    let id = orch.submit(request, TENANT).expect("submit");
    orch.run_pending().expect("run");

    let analysis = orch.get_status(&id, TENANT).expect("status");
    assert_eq!(analysis.status, AnalysisStatus::Failed);
    let message = analysis.error_message.expect("error message");
    assert!(message.contains("could not record selected controls"), "got {message}");
    assert!(analysis.request_params.control_ids.is_none());
}
