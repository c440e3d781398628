//! The analysis orchestrator: job lifecycle around the estimator.
//!
//! PIPELINE (per claimed job, fixed order):
//!   1. Matching engine, only when the request leaves `control_ids` null.
//!      The chosen controls are written back to `request_params`.
//!   2. Panel builder over treated ∪ controls.
//!   3. Causal estimator.
//!   4. Single terminal write: summary + full result, or an error message.
//!
//! RULES:
//!   - Submission only validates and enqueues; it never estimates.
//!   - Every read is tenant-scoped; a foreign id is `NotFound`.
//!   - A claimed job always ends terminal, including on timeout or panic.
//!   - Each worker owns its own store connection.

use crate::{
    analysis::{Analysis, AnalysisStatus},
    config::EngineConfig,
    error::{EngineError, EngineResult},
    estimator::{self, EstimationResult, EstimationSummary},
    matching::{MatchingEngine, MatchingOutcome, MatchingRequest},
    panel::{Panel, PanelBuilder, PanelSource, TreatmentAssignment},
    request::AnalysisRequest,
    store::AnalysisStore,
    types::AnalysisId,
};
use chrono::Utc;
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::JoinHandle,
    time::Instant,
};
use uuid::Uuid;

pub struct Orchestrator {
    store:  AnalysisStore,
    source: Arc<dyn PanelSource>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(store: AnalysisStore, source: Arc<dyn PanelSource>, config: EngineConfig) -> Self {
        Self { store, source, config }
    }

    pub fn store(&self) -> &AnalysisStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Submission ─────────────────────────────────────────────

    /// Validate and enqueue. Returns immediately with the job `queued`.
    pub fn submit(&self, request: AnalysisRequest, tenant_id: &str) -> EngineResult<AnalysisId> {
        if tenant_id.trim().is_empty() {
            return Err(EngineError::Validation("tenant_id must not be blank".into()));
        }
        request.validate()?;
        let now = Utc::now();
        let analysis = Analysis {
            id:             Uuid::new_v4().to_string(),
            tenant_id:      tenant_id.to_string(),
            status:         AnalysisStatus::Queued,
            method:         request.method,
            created_at:     now,
            updated_at:     now,
            started_at:     None,
            completed_at:   None,
            request_params: request,
            result_summary: None,
            result_full:    None,
            error_message:  None,
            artifacts:      Vec::new(),
        };
        self.store.insert_analysis(&analysis)?;
        log::info!(
            "submitted {} analysis {} for tenant {tenant_id}",
            analysis.method,
            analysis.id
        );
        Ok(analysis.id)
    }

    // ── Retrieval ──────────────────────────────────────────────

    pub fn get_status(&self, analysis_id: &str, tenant_id: &str) -> EngineResult<Analysis> {
        self.store
            .get_analysis(analysis_id, tenant_id)?
            .ok_or_else(|| EngineError::NotFound { analysis_id: analysis_id.to_string() })
    }

    /// The full result, method payloads included.
    pub fn get_result(&self, analysis_id: &str, tenant_id: &str) -> EngineResult<EstimationResult> {
        let analysis = self.finished(analysis_id, tenant_id)?;
        analysis.result_full.ok_or_else(|| {
            EngineError::Other(anyhow::anyhow!("analysis {analysis_id} succeeded without a stored result"))
        })
    }

    pub fn get_summary(&self, analysis_id: &str, tenant_id: &str) -> EngineResult<EstimationSummary> {
        let analysis = self.finished(analysis_id, tenant_id)?;
        analysis.result_summary.ok_or_else(|| {
            EngineError::Other(anyhow::anyhow!("analysis {analysis_id} succeeded without a stored summary"))
        })
    }

    fn finished(&self, analysis_id: &str, tenant_id: &str) -> EngineResult<Analysis> {
        let analysis = self.get_status(analysis_id, tenant_id)?;
        match analysis.status {
            AnalysisStatus::Success => Ok(analysis),
            AnalysisStatus::Failed => Err(EngineError::AnalysisFailed {
                analysis_id: analysis_id.to_string(),
                message:     analysis.error_message.unwrap_or_default(),
            }),
            status => Err(EngineError::NotReady {
                analysis_id: analysis_id.to_string(),
                status:      status.as_str().to_string(),
            }),
        }
    }

    pub fn list_analyses(&self, tenant_id: &str, limit: usize) -> EngineResult<Vec<Analysis>> {
        self.store.list_analyses(tenant_id, limit)
    }

    /// Record a rendered artifact. The only write allowed after completion.
    pub fn attach_artifact(
        &self,
        analysis_id: &str,
        tenant_id: &str,
        kind: &str,
        path: &str,
    ) -> EngineResult<()> {
        let analysis = self.get_status(analysis_id, tenant_id)?;
        if !analysis.is_terminal() {
            return Err(EngineError::NotReady {
                analysis_id: analysis_id.to_string(),
                status:      analysis.status.as_str().to_string(),
            });
        }
        self.store.attach_artifact(analysis_id, tenant_id, kind, path, Utc::now())
    }

    /// Pre-submission control selection for dashboards.
    pub fn suggest_controls(&self, tenant_id: &str, request: &MatchingRequest) -> EngineResult<MatchingOutcome> {
        MatchingEngine::new(self.source.as_ref()).suggest_controls(tenant_id, request)
    }

    // ── Execution ──────────────────────────────────────────────

    /// Run every queued job on the calling thread. Returns how many ran.
    pub fn run_pending(&self) -> EngineResult<usize> {
        let worker = Worker::new("inline", &self.store, Arc::clone(&self.source), self.config.clone());
        let mut ran = 0;
        while worker.run_once()?.is_some() {
            ran += 1;
        }
        Ok(ran)
    }

    pub fn sweep_stale(&self) -> EngineResult<Vec<AnalysisId>> {
        sweep_stale(&self.store, &self.config)
    }
}

/// Fail jobs left `running` longer than the stale threshold (crash recovery).
pub fn sweep_stale(store: &AnalysisStore, config: &EngineConfig) -> EngineResult<Vec<AnalysisId>> {
    let stale_after = chrono::Duration::from_std(config.workers.stale_after())
        .map_err(|e| EngineError::Other(anyhow::anyhow!("stale threshold out of range: {e}")))?;
    let now = Utc::now();
    let message = EngineError::Timeout { seconds: config.workers.stale_after().as_secs() }.to_string();
    let swept = store.fail_stale_running(now - stale_after, &message, now)?;
    if !swept.is_empty() {
        log::warn!("swept {} stale running analyses to failed", swept.len());
    }
    Ok(swept)
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// Messages from the job thread to its worker.
enum JobMessage {
    ControlsSelected(AnalysisRequest),
    Finished(EngineResult<EstimationResult>),
}

/// Matching (when needed), panel construction and estimation for one job.
///
/// `on_controls` sees the request once matching has filled `control_ids`.
pub fn run_analysis(
    source: &dyn PanelSource,
    tenant_id: &str,
    mut request: AnalysisRequest,
    config: &EngineConfig,
    mut on_controls: impl FnMut(&AnalysisRequest),
) -> EngineResult<EstimationResult> {
    request.validate()?;

    let mut matching_warnings = Vec::new();
    let controls = match &request.control_ids {
        Some(ids) => ids.clone(),
        None => {
            let matching = MatchingRequest::for_analysis(
                &request,
                &config.matching.default_features,
                config.matching.default_n_controls,
            );
            let outcome = MatchingEngine::new(source).suggest_controls(tenant_id, &matching)?;
            if outcome.selected.is_empty() {
                return Err(EngineError::InsufficientData("matching selected no controls".into()));
            }
            for w in &outcome.warnings {
                log::warn!("matching: {w}");
            }
            matching_warnings = outcome.warnings.iter().map(|w| format!("matching: {w}")).collect();
            let selected: BTreeSet<_> = outcome.selected.into_iter().collect();
            request.control_ids = Some(selected.clone());
            on_controls(&request);
            selected
        }
    };

    let units: BTreeSet<_> = request.treated_ids.union(&controls).cloned().collect();
    let rows = PanelBuilder::new(source).build(
        tenant_id,
        &units,
        &request.outcomes,
        &request.required_columns(),
        request.window,
        &TreatmentAssignment {
            treated_ids:    request.treated_ids.clone(),
            treatment_year: request.treatment_year,
        },
    )?;
    let panel = Panel::new(
        rows,
        request.treated_ids.clone(),
        controls,
        request.treatment_year,
        request.window,
    );
    let mut result = estimator::estimate(&panel, &request, &config.estimation)?;
    for estimate in &mut result.outcomes {
        estimate.warnings.extend(matching_warnings.iter().cloned());
    }
    Ok(result)
}

// ── Worker ───────────────────────────────────────────────────────────────────

/// Claims and executes jobs against one store connection.
pub struct Worker<'a> {
    id:     String,
    store:  &'a AnalysisStore,
    source: Arc<dyn PanelSource>,
    config: EngineConfig,
}

impl<'a> Worker<'a> {
    pub fn new(
        id: impl Into<String>,
        store: &'a AnalysisStore,
        source: Arc<dyn PanelSource>,
        config: EngineConfig,
    ) -> Self {
        Self { id: id.into(), store, source, config }
    }

    /// Claim one queued job and drive it to a terminal state.
    ///
    /// Returns `None` when the queue is empty.
    pub fn run_once(&self) -> EngineResult<Option<(AnalysisId, AnalysisStatus)>> {
        let Some(job) = self.store.claim_next(&self.id, Utc::now())? else {
            return Ok(None);
        };
        log::info!("{} claimed analysis {} ({})", self.id, job.id, job.method);

        let (tx, rx) = mpsc::channel();
        let source = Arc::clone(&self.source);
        let config = self.config.clone();
        let tenant_id = job.tenant_id.clone();
        let request = job.request_params.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-job", self.id))
            .spawn(move || {
                let progress = tx.clone();
                let result = run_analysis(source.as_ref(), &tenant_id, request, &config, |r| {
                    let _ = progress.send(JobMessage::ControlsSelected(r.clone()));
                });
                let _ = tx.send(JobMessage::Finished(result));
            });
        if let Err(e) = spawned {
            let message = format!("could not start estimation thread: {e}");
            self.store.record_failure(&job.id, &message, Utc::now())?;
            return Ok(Some((job.id, AnalysisStatus::Failed)));
        }

        let timeout = self.config.workers.job_timeout();
        let deadline = Instant::now() + timeout;
        let status = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(JobMessage::ControlsSelected(request)) => {
                    if let Err(e) = self.store.update_request_params(&job.id, &request, Utc::now()) {
                        // The job thread is abandoned, as on timeout.
                        break self.fail(&job.id, &format!("could not record selected controls: {e}"))?;
                    }
                    log::info!(
                        "analysis {} auto-selected {} controls",
                        job.id,
                        request.control_ids.as_ref().map_or(0, BTreeSet::len)
                    );
                }
                Ok(JobMessage::Finished(Ok(result))) => {
                    let summary = result.summary(self.config.estimation.significance_level);
                    match self.store.record_success(&job.id, &summary, &result, Utc::now()) {
                        Ok(()) => break AnalysisStatus::Success,
                        Err(e) => break self.fail(&job.id, &format!("could not store result: {e}"))?,
                    }
                }
                Ok(JobMessage::Finished(Err(e))) => {
                    break self.fail(&job.id, &e.to_string())?;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    // The job thread is abandoned; its late result has no receiver.
                    let e = EngineError::Timeout { seconds: timeout.as_secs() };
                    break self.fail(&job.id, &e.to_string())?;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    log::error!("analysis {} estimation thread panicked", job.id);
                    self.store.record_failure(&job.id, "estimation panicked", Utc::now())?;
                    break AnalysisStatus::Failed;
                }
            }
        };
        log::info!("{} finished analysis {} as {status}", self.id, job.id);
        Ok(Some((job.id, status)))
    }

    /// Terminal failure write for a claimed job.
    fn fail(&self, id: &str, message: &str) -> EngineResult<AnalysisStatus> {
        log::warn!("analysis {id} failed: {message}");
        self.store.record_failure(id, message, Utc::now())?;
        Ok(AnalysisStatus::Failed)
    }
}

// ── Worker pool ──────────────────────────────────────────────────────────────

/// `worker_count` OS threads polling one database file.
pub struct WorkerPool {
    shutdown: Arc<AtomicBool>,
    handles:  Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Migrate, sweep stale jobs, then spawn the workers.
    pub fn start(config: &EngineConfig, db_path: &str, source: Arc<dyn PanelSource>) -> EngineResult<Self> {
        let store = AnalysisStore::open(db_path)?;
        store.migrate()?;
        sweep_stale(&store, config)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(config.workers.worker_count);
        for i in 0..config.workers.worker_count {
            let worker_store = store.reopen()?;
            let source = Arc::clone(&source);
            let config = config.clone();
            let shutdown = Arc::clone(&shutdown);
            let name = format!("worker-{i}");
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    let idle = config.workers.idle_poll();
                    let config_for_sweep = config.clone();
                    let worker = Worker::new(name, &worker_store, source, config);
                    while !shutdown.load(Ordering::SeqCst) {
                        match worker.run_once() {
                            Ok(Some(_)) => {}
                            Ok(None) => {
                                // Picks up jobs whose terminal write never landed.
                                if let Err(e) = sweep_stale(&worker_store, &config_for_sweep) {
                                    log::error!("{}: stale sweep failed: {e}", worker.id);
                                }
                                std::thread::sleep(idle);
                            }
                            Err(e) => {
                                log::error!("{}: {e}", worker.id);
                                std::thread::sleep(idle);
                            }
                        }
                    }
                })
                .map_err(|e| EngineError::Other(anyhow::anyhow!("could not spawn worker: {e}")))?;
            handles.push(handle);
        }
        log::info!("worker pool started with {} workers on {db_path}", handles.len());
        Ok(Self { shutdown, handles })
    }

    /// Stop claiming new jobs and wait for in-flight ones.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles {
            if handle.join().is_err() {
                log::error!("a worker thread panicked");
            }
        }
    }
}
