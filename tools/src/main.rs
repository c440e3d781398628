//! impact-runner: headless driver for the port impact analysis engine.
//!
//! Usage:
//!   impact-runner ingest --db impact.db --tenant acme --panel panel.json
//!   impact-runner demo   --db impact.db --tenant acme --seed 42
//!   impact-runner submit --db impact.db --tenant acme --request did.json [--wait]
//!   impact-runner work   --db impact.db [--workers 4] [--once] [--for-secs 60]
//!   impact-runner status --db impact.db --tenant acme --id <analysis-id>
//!   impact-runner result --db impact.db --tenant acme --id <analysis-id> [--full]
//!   impact-runner list   --db impact.db --tenant acme [--limit 20]
//!   impact-runner match  --db impact.db --tenant acme --request did.json
//!   impact-runner sweep  --db impact.db
//!
//! Every command accepts `--config engine.json`.

use anyhow::{bail, Context, Result};
use port_impact_core::{
    analysis::AnalysisStatus,
    config::EngineConfig,
    matching::MatchingRequest,
    orchestrator::{Orchestrator, WorkerPool},
    panel::Observation,
    poll::{wait_for_terminal, PollSchedule},
    request::{AnalysisRequest, Method, Scope},
    simulate::{simulate, SimulationSpec},
    store::{AnalysisStore, SqlitePanelSource},
    types::UnitId,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;

/// Panel file accepted by `ingest`.
#[derive(serde::Deserialize)]
struct PanelFile {
    #[serde(default)]
    units:        Vec<UnitEntry>,
    observations: Vec<Observation>,
}

#[derive(serde::Deserialize)]
struct UnitEntry {
    unit_id: UnitId,
    scope:   Scope,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let Some(command) = args.get(1).map(String::as_str) else {
        bail!("usage: impact-runner <ingest|demo|submit|work|status|result|list|match|sweep> [options]");
    };
    let db = arg_str(&args, "--db").unwrap_or("impact.db");
    let tenant = arg_str(&args, "--tenant").unwrap_or("default");
    let config = match arg_str(&args, "--config") {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let store = AnalysisStore::open(db)?;
    store.migrate()?;

    match command {
        "ingest" => {
            let path = arg_str(&args, "--panel").context("--panel <json> is required")?;
            let content = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
            let panel: PanelFile = serde_json::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
            let units: Vec<(UnitId, Scope)> =
                panel.units.into_iter().map(|u| (u.unit_id, u.scope)).collect();
            let n = store.ingest_panel(tenant, &units, &panel.observations)?;
            println!("ingested {n} observations for tenant {tenant}");
        }
        "demo" => run_demo(db, tenant, parse_arg(&args, "--seed", 42u64), store, config)?,
        "submit" => {
            let request = read_request(&args)?;
            let orchestrator = orchestrator(db, store, config);
            let id = orchestrator.submit(request, tenant)?;
            println!("{id}");
            if has_flag(&args, "--wait") {
                let schedule = PollSchedule::from_config(&orchestrator.config().polling);
                let max_wait = orchestrator.config().workers.job_timeout() * 2;
                let status = wait_for_terminal(
                    || Ok(orchestrator.get_status(&id, tenant)?.status),
                    &schedule,
                    std::thread::sleep,
                    max_wait,
                )?;
                println!("status: {status}");
                if status == AnalysisStatus::Success {
                    print_json(&orchestrator.get_summary(&id, tenant)?)?;
                }
            }
        }
        "work" => {
            if has_flag(&args, "--once") {
                let ran = orchestrator(db, store, config).run_pending()?;
                println!("ran {ran} analyses");
            } else {
                let mut config = config;
                config.workers.worker_count = parse_arg(&args, "--workers", config.workers.worker_count);
                let source: Arc<dyn port_impact_core::panel::PanelSource> = Arc::new(SqlitePanelSource::new(db));
                let pool = WorkerPool::start(&config, db, source)?;
                let for_secs = parse_arg(&args, "--for-secs", 0u64);
                if for_secs == 0 {
                    loop {
                        std::thread::sleep(Duration::from_secs(60));
                    }
                }
                std::thread::sleep(Duration::from_secs(for_secs));
                pool.shutdown();
            }
        }
        "status" => {
            let id = arg_str(&args, "--id").context("--id is required")?;
            let a = orchestrator(db, store, config).get_status(id, tenant)?;
            println!("=== ANALYSIS ===");
            println!("  id:        {}", a.id);
            println!("  method:    {}", a.method);
            println!("  status:    {}", a.status);
            println!("  created:   {}", a.created_at);
            if let Some(t) = a.started_at {
                println!("  started:   {t}");
            }
            if let Some(t) = a.completed_at {
                println!("  completed: {t}");
            }
            if let Some(e) = &a.error_message {
                println!("  error:     {e}");
            }
            for artifact in &a.artifacts {
                println!("  artifact:  {} {}", artifact.kind, artifact.path);
            }
        }
        "result" => {
            let id = arg_str(&args, "--id").context("--id is required")?;
            let orchestrator = orchestrator(db, store, config);
            if has_flag(&args, "--full") {
                print_json(&orchestrator.get_result(id, tenant)?)?;
            } else {
                print_json(&orchestrator.get_summary(id, tenant)?)?;
            }
        }
        "list" => {
            let limit = parse_arg(&args, "--limit", 20usize);
            for a in orchestrator(db, store, config).list_analyses(tenant, limit)? {
                println!("{}  {:<13} {:<8} {}", a.id, a.method.as_str(), a.status.as_str(), a.created_at);
            }
        }
        "match" => {
            let request = read_request(&args)?;
            let orchestrator = orchestrator(db, store, config);
            let matching = MatchingRequest::for_analysis(
                &request,
                &orchestrator.config().matching.default_features,
                orchestrator.config().matching.default_n_controls,
            );
            print_json(&orchestrator.suggest_controls(tenant, &matching)?)?;
        }
        "sweep" => {
            let swept = orchestrator(db, store, config).sweep_stale()?;
            println!("swept {} stale analyses", swept.len());
        }
        other => bail!("unknown command: {other}"),
    }
    Ok(())
}

fn orchestrator(db: &str, store: AnalysisStore, config: EngineConfig) -> Orchestrator {
    Orchestrator::new(store, Arc::new(SqlitePanelSource::new(db)), config)
}

/// Simulate a port panel, store it, and run every method once.
fn run_demo(db: &str, tenant: &str, seed: u64, store: AnalysisStore, config: EngineConfig) -> Result<()> {
    let spec = SimulationSpec { seed, ..SimulationSpec::default() };
    let panel = simulate(&spec);
    store.ingest_panel(tenant, &panel.units, &panel.observations)?;

    println!("Port impact demo");
    println!("  seed:      {seed}");
    println!("  db:        {db}");
    println!("  treated:   {}", panel.treated_ids.len());
    println!("  controls:  {}", panel.control_ids.len());
    println!("  effect:    {}", spec.effect);
    println!();

    let orchestrator = orchestrator(db, store, config);
    let mut ids = Vec::new();
    for method in [
        Method::Did,
        Method::Iv,
        Method::PanelIv,
        Method::EventStudy,
        Method::Scm,
        Method::AugmentedScm,
        Method::Compare,
    ] {
        ids.push((method, orchestrator.submit(panel.request(method), tenant)?));
    }
    // One auto-matched run: controls left for the matching engine.
    let mut matched = panel.request(Method::Did);
    matched.control_ids = None;
    matched.n_controls = Some(5);
    ids.push((Method::Did, orchestrator.submit(matched, tenant)?));

    orchestrator.run_pending()?;

    println!("=== RESULTS ===");
    for (method, id) in &ids {
        let analysis = orchestrator.get_status(id, tenant)?;
        match analysis.result_summary.as_ref().and_then(|s| s.outcomes.first()) {
            Some(o) => println!(
                "  {:<14} coef: {:>9} | p: {:>7} | n: {:>4} | {}",
                method.label(),
                fmt_opt(o.coef, 4),
                fmt_opt(o.p_value, 4),
                o.n_obs,
                o.warnings.first().map_or("", String::as_str)
            ),
            None => println!(
                "  {:<14} {} {}",
                method.label(),
                analysis.status,
                analysis.error_message.unwrap_or_default()
            ),
        }
    }
    Ok(())
}

fn read_request(args: &[String]) -> Result<AnalysisRequest> {
    let path = arg_str(args, "--request").context("--request <json> is required")?;
    let content = std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
    serde_json::from_str(&content).map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn fmt_opt(v: Option<f64>, digits: usize) -> String {
    v.map_or_else(|| "-".to_string(), |v| format!("{v:.digits$}"))
}

fn arg_str<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
