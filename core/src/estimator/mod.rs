//! Causal estimator: six strategies behind one `estimate` contract.
//!
//! Each strategy is an independent function
//! `fn(&Panel, outcome, &EstimationContext) -> Result<MethodEstimate, Indeterminate>`.
//! Dispatch is a plain match on [`Method`]; the strategies share only the
//! helpers in `regression` and the post-processing in this module.
//!
//! RULE: statistical indeterminacy is data, not failure. A strategy that
//! cannot produce an estimate returns `Indeterminate`, which becomes an
//! `OutcomeEstimate` with null coefficient and an explanatory warning.
//! Only structural problems surface as `EngineError`.

pub mod compare;
pub mod did;
pub mod event_study;
pub mod iv;
pub mod regression;
pub mod synthetic;

use crate::{
    config::EstimationConfig,
    error::{EngineError, EngineResult},
    panel::Panel,
    request::{AnalysisRequest, Method, Window},
    types::{UnitId, Year},
};
use serde::{Deserialize, Serialize};

pub use compare::{ComparisonPayload, ComparisonRow, Consistency};
pub use did::DidPayload;
pub use event_study::{EventStudyPayload, EventStudyPoint};
pub use iv::IvPayload;
pub use synthetic::{DonorWeight, GapPoint, ScmPayload};

// ── Indeterminacy ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndeterminacyReason {
    InsufficientData,
    RankDeficient,
    NonConvergence,
}

impl IndeterminacyReason {
    /// Warning prefix; lets readers tell the causes apart.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::InsufficientData => "insufficient data",
            Self::RankDeficient    => "rank-deficient design",
            Self::NonConvergence   => "non-convergence",
        }
    }
}

/// "No effect is estimable here", with the reason why.
#[derive(Debug, Clone, PartialEq)]
pub struct Indeterminate {
    pub reason: IndeterminacyReason,
    pub detail: String,
    /// Diagnostics gathered before the estimate became impossible.
    pub warnings: Vec<String>,
}

impl Indeterminate {
    pub fn new(reason: IndeterminacyReason, detail: impl Into<String>) -> Self {
        Self { reason, detail: detail.into(), warnings: Vec::new() }
    }

    pub fn insufficient(detail: impl Into<String>) -> Self {
        Self::new(IndeterminacyReason::InsufficientData, detail)
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn warning(&self) -> String {
        format!("{}: {}", self.reason.prefix(), self.detail)
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

/// Method-specific raw output kept in `result_full`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MethodPayload {
    Did(DidPayload),
    Iv(IvPayload),
    EventStudy(EventStudyPayload),
    SyntheticControl(ScmPayload),
    Comparison(ComparisonPayload),
}

/// What a strategy produces when an effect is estimable.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodEstimate {
    pub coef:     f64,
    pub std_err:  Option<f64>,
    pub p_value:  Option<f64>,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
    pub n_obs:    usize,
    pub r2:       Option<f64>,
    pub warnings: Vec<String>,
    pub payload:  Option<MethodPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEstimate {
    pub outcome:  String,
    pub method:   Method,
    pub coef:     Option<f64>,
    pub std_err:  Option<f64>,
    pub p_value:  Option<f64>,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
    pub n_obs:    usize,
    pub r2:       Option<f64>,
    pub warnings: Vec<String>,
    #[serde(default)]
    pub payload:  Option<MethodPayload>,
}

impl OutcomeEstimate {
    pub fn is_significant(&self, alpha: f64) -> bool {
        self.p_value.is_some_and(|p| p < alpha)
    }

    fn from_estimate(outcome: &str, method: Method, est: MethodEstimate) -> Self {
        Self {
            outcome:  outcome.to_string(),
            method,
            coef:     Some(est.coef).filter(|c| c.is_finite()),
            std_err:  est.std_err.filter(|v| v.is_finite()),
            p_value:  est.p_value.filter(|v| v.is_finite()),
            ci_lower: est.ci_lower.filter(|v| v.is_finite()),
            ci_upper: est.ci_upper.filter(|v| v.is_finite()),
            n_obs:    est.n_obs,
            r2:       est.r2.filter(|v| v.is_finite()),
            warnings: est.warnings,
            payload:  est.payload,
        }
    }

    fn indeterminate(outcome: &str, method: Method, n_obs: usize, why: Indeterminate) -> Self {
        let mut warnings = why.warnings.clone();
        warnings.insert(0, why.warning());
        Self {
            outcome: outcome.to_string(),
            method,
            coef: None,
            std_err: None,
            p_value: None,
            ci_lower: None,
            ci_upper: None,
            n_obs,
            r2: None,
            warnings,
            payload: None,
        }
    }
}

/// Complete estimator output, stored as `result_full`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationResult {
    pub method:         Method,
    pub treatment_year: Year,
    pub window:         Window,
    pub treated_ids:    Vec<UnitId>,
    pub control_ids:    Vec<UnitId>,
    pub outcomes:       Vec<OutcomeEstimate>,
}

impl EstimationResult {
    pub fn outcome(&self, name: &str) -> Option<&OutcomeEstimate> {
        self.outcomes.iter().find(|o| o.outcome == name)
    }

    /// Scalar-only view stored as `result_summary`.
    pub fn summary(&self, alpha: f64) -> EstimationSummary {
        EstimationSummary {
            method:         self.method,
            treatment_year: self.treatment_year,
            window:         self.window,
            n_treated:      self.treated_ids.len(),
            n_control:      self.control_ids.len(),
            outcomes:       self
                .outcomes
                .iter()
                .map(|o| OutcomeSummary {
                    outcome:     o.outcome.clone(),
                    coef:        o.coef,
                    std_err:     o.std_err,
                    p_value:     o.p_value,
                    ci_lower:    o.ci_lower,
                    ci_upper:    o.ci_upper,
                    n_obs:       o.n_obs,
                    r2:          o.r2,
                    significant: o.is_significant(alpha),
                    warnings:    o.warnings.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationSummary {
    pub method:         Method,
    pub treatment_year: Year,
    pub window:         Window,
    pub n_treated:      usize,
    pub n_control:      usize,
    pub outcomes:       Vec<OutcomeSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub outcome:     String,
    pub coef:        Option<f64>,
    pub std_err:     Option<f64>,
    pub p_value:     Option<f64>,
    pub ci_lower:    Option<f64>,
    pub ci_upper:    Option<f64>,
    pub n_obs:       usize,
    pub r2:          Option<f64>,
    pub significant: bool,
    pub warnings:    Vec<String>,
}

// ── Shared context ───────────────────────────────────────────────────────────

/// Request fields and thresholds every strategy reads.
#[derive(Debug, Clone)]
pub struct EstimationContext<'a> {
    pub config:             &'a EstimationConfig,
    pub covariates:         &'a [String],
    pub instrument:         Option<&'a str>,
    pub treatment_variable: Option<&'a str>,
}

impl<'a> EstimationContext<'a> {
    pub fn new(request: &'a AnalysisRequest, config: &'a EstimationConfig) -> Self {
        Self {
            config,
            covariates: request.covariate_names(),
            instrument: request.instrument.as_deref(),
            treatment_variable: request.treatment_variable.as_deref(),
        }
    }
}

/// Rows where the outcome is observed.
pub(crate) fn observed_rows<'p>(panel: &'p Panel, outcome: &str) -> Vec<&'p crate::panel::PanelRow> {
    panel.rows.iter().filter(|r| r.outcome(outcome).is_some()).collect()
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// Run one strategy on one outcome, converting indeterminacy to a null result.
pub fn estimate_outcome(
    method: Method,
    panel: &Panel,
    outcome: &str,
    ctx: &EstimationContext<'_>,
    compare_methods: &[Method],
) -> OutcomeEstimate {
    let result = match method {
        Method::Did          => did::estimate(panel, outcome, ctx),
        Method::Iv           => iv::estimate(panel, outcome, ctx, false),
        Method::PanelIv      => iv::estimate(panel, outcome, ctx, true),
        Method::EventStudy   => event_study::estimate(panel, outcome, ctx),
        Method::Scm          => synthetic::estimate(panel, outcome, ctx, false),
        Method::AugmentedScm => synthetic::estimate(panel, outcome, ctx, true),
        Method::Compare      => compare::estimate(panel, outcome, ctx, compare_methods),
    };
    let mut estimate = match result {
        Ok(est) => OutcomeEstimate::from_estimate(outcome, method, est),
        Err(why) => {
            log::debug!("{method} on '{outcome}' indeterminate: {}", why.warning());
            let n_obs = observed_rows(panel, outcome).len();
            OutcomeEstimate::indeterminate(outcome, method, n_obs, why)
        }
    };
    if !ctx.covariates.is_empty() && !method.uses_covariates() {
        estimate.warnings.push(format!(
            "covariates ignored: {} does not adjust for {}",
            method.label(),
            ctx.covariates.join(", ")
        ));
    }
    estimate
}

/// One `OutcomeEstimate` per requested outcome.
pub fn estimate(
    panel: &Panel,
    request: &AnalysisRequest,
    config: &EstimationConfig,
) -> EngineResult<EstimationResult> {
    if panel.rows.is_empty() {
        return Err(EngineError::InsufficientData("panel is empty".into()));
    }
    if panel.treated_ids.is_empty() {
        return Err(EngineError::EstimationFailure("panel has no treated units".into()));
    }
    let ctx = EstimationContext::new(request, config);
    let compare_methods = request.strategies();
    let outcomes = request
        .outcomes
        .iter()
        .map(|outcome| estimate_outcome(request.method, panel, outcome, &ctx, &compare_methods))
        .collect();

    Ok(EstimationResult {
        method:         request.method,
        treatment_year: request.treatment_year,
        window:         request.window,
        treated_ids:    panel.treated_ids.iter().cloned().collect(),
        control_ids:    panel.control_ids.iter().cloned().collect(),
        outcomes,
    })
}
