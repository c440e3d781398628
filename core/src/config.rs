//! Engine configuration. Every statistical threshold is tunable.
//!
//! Defaults follow the usual literature cut-offs (first-stage F < 10,
//! p < 0.05). A JSON file may override any subset of fields; missing
//! fields keep their defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub estimation: EstimationConfig,
    pub matching:   MatchingConfig,
    pub workers:    WorkerConfig,
    pub polling:    PollingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationConfig {
    /// Two-sided test level; also drives confidence interval width.
    pub significance_level: f64,
    /// First-stage F below this attaches a weak-instrument warning.
    pub weak_instrument_f: f64,
    /// Minimum usable observations for any regression-based method.
    pub min_observations: usize,
    /// Fewer clusters than this falls back to HC1 standard errors.
    pub min_clusters_for_cluster_se: usize,
    /// Omitted relative period in the event study.
    pub reference_period: i32,
    pub fe_tolerance: f64,
    pub fe_max_iterations: usize,
    /// Relative singular-value cut-off for X'X.
    pub rank_tolerance: f64,
    pub scm_min_pre_periods: usize,
    pub scm_max_iterations: usize,
    pub scm_tolerance: f64,
    /// Pre-period RMSPE relative to the mean absolute treated outcome
    /// above which the synthetic fit is flagged as poor.
    pub scm_rmspe_tolerance: f64,
    pub scm_placebo_inference: bool,
    pub ascm_ridge_scale: f64,
    /// Relative change in first-stage F that makes fixed effects material.
    pub fe_material_change: f64,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            significance_level:          0.05,
            weak_instrument_f:           10.0,
            min_observations:            4,
            min_clusters_for_cluster_se: 2,
            reference_period:            -1,
            fe_tolerance:                1e-10,
            fe_max_iterations:           10_000,
            rank_tolerance:              1e-10,
            scm_min_pre_periods:         2,
            scm_max_iterations:          100_000,
            scm_tolerance:               1e-10,
            scm_rmspe_tolerance:         0.10,
            scm_placebo_inference:       true,
            ascm_ridge_scale:            1.0,
            fe_material_change:          0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub default_n_controls: usize,
    /// Empty means "match on the request's outcomes".
    pub default_features: Vec<String>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self { default_n_controls: 10, default_features: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_count:     usize,
    pub job_timeout_secs: u64,
    pub idle_poll_ms:     u64,
    /// Running jobs older than this are swept to failed on restart.
    /// `None` reuses the job timeout.
    pub stale_after_secs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count:     2,
            job_timeout_secs: 600,
            idle_poll_ms:     250,
            stale_after_secs: None,
        }
    }
}

impl WorkerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs.unwrap_or(self.job_timeout_secs))
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub queued_delay_ms:  u64,
    pub running_delay_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { queued_delay_ms: 2_000, running_delay_ms: 5_000 }
    }
}

impl EngineConfig {
    /// Load from a JSON file. Fields absent from the file keep defaults.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no estimator can work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let e = &self.estimation;
        if !(e.significance_level > 0.0 && e.significance_level < 1.0) {
            anyhow::bail!("estimation.significance_level must be in (0, 1)");
        }
        if e.weak_instrument_f < 0.0 {
            anyhow::bail!("estimation.weak_instrument_f must be non-negative");
        }
        if e.reference_period >= 0 {
            anyhow::bail!("estimation.reference_period must be a pre-treatment period (< 0)");
        }
        if e.scm_min_pre_periods == 0 {
            anyhow::bail!("estimation.scm_min_pre_periods must be at least 1");
        }
        if self.workers.worker_count == 0 {
            anyhow::bail!("workers.worker_count must be at least 1");
        }
        if self.workers.job_timeout_secs == 0 {
            anyhow::bail!("workers.job_timeout_secs must be at least 1");
        }
        Ok(())
    }
}
