//! Analysis requests: what a client asks the engine to estimate.
//!
//! RULE: a request is validated before it is queued. Anything that
//! reaches a worker is structurally sound; only data problems remain.

use crate::{
    error::{EngineError, EngineResult},
    types::{UnitId, Year},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The six estimation strategies plus the cross-method comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Did,
    Iv,
    PanelIv,
    EventStudy,
    Scm,
    AugmentedScm,
    Compare,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Did          => "did",
            Self::Iv           => "iv",
            Self::PanelIv      => "panel_iv",
            Self::EventStudy   => "event_study",
            Self::Scm          => "scm",
            Self::AugmentedScm => "augmented_scm",
            Self::Compare      => "compare",
        }
    }

    /// Human label used in comparison tables and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Did          => "DiD",
            Self::Iv           => "IV (2SLS)",
            Self::PanelIv      => "Panel IV",
            Self::EventStudy   => "Event Study",
            Self::Scm          => "SCM",
            Self::AugmentedScm => "Augmented SCM",
            Self::Compare      => "Compare",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "did"           => Some(Self::Did),
            "iv"            => Some(Self::Iv),
            "panel_iv"      => Some(Self::PanelIv),
            "event_study"   => Some(Self::EventStudy),
            "scm"           => Some(Self::Scm),
            "augmented_scm" => Some(Self::AugmentedScm),
            "compare"       => Some(Self::Compare),
            _               => None,
        }
    }

    pub fn needs_instrument(&self) -> bool {
        matches!(self, Self::Iv | Self::PanelIv)
    }

    /// Whether the strategy adjusts for request covariates. Compare
    /// defers to its member strategies.
    pub fn uses_covariates(&self) -> bool {
        matches!(self, Self::Iv | Self::PanelIv | Self::Compare)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geographic level of the units in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    State,
    Municipal,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::State     => "state",
            Self::Municipal => "municipal",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "state"     => Some(Self::State),
            "municipal" => Some(Self::Municipal),
            _           => None,
        }
    }
}

/// Inclusive year range `[year_start, year_end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub year_start: Year,
    pub year_end:   Year,
}

impl Window {
    pub fn new(year_start: Year, year_end: Year) -> Self {
        Self { year_start, year_end }
    }

    pub fn years(&self) -> impl Iterator<Item = Year> {
        self.year_start..=self.year_end
    }

    pub fn len(&self) -> usize {
        if self.year_end < self.year_start {
            0
        } else {
            (self.year_end - self.year_start + 1) as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, year: Year) -> bool {
        year >= self.year_start && year <= self.year_end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub method:         Method,
    pub treated_ids:    BTreeSet<UnitId>,
    /// `None` asks the orchestrator to pick controls with the matching engine.
    #[serde(default)]
    pub control_ids:    Option<BTreeSet<UnitId>>,
    pub treatment_year: Year,
    pub scope:          Scope,
    pub outcomes:       Vec<String>,
    #[serde(default)]
    pub controls:       Option<Vec<String>>,
    #[serde(default)]
    pub instrument:     Option<String>,
    /// Continuous treatment intensity column for IV; `None` uses the
    /// binary treatment indicator as the endogenous regressor.
    #[serde(default)]
    pub treatment_variable: Option<String>,
    pub window:         Window,
    #[serde(default)]
    pub compare_methods:   Option<Vec<Method>>,
    #[serde(default)]
    pub matching_features: Option<Vec<String>>,
    #[serde(default)]
    pub n_controls:        Option<usize>,
}

impl AnalysisRequest {
    /// Minimal request; optional fields start empty.
    pub fn new(
        method: Method,
        treated_ids: impl IntoIterator<Item = impl Into<UnitId>>,
        treatment_year: Year,
        outcomes: impl IntoIterator<Item = impl Into<String>>,
        window: Window,
    ) -> Self {
        Self {
            method,
            treated_ids: treated_ids.into_iter().map(Into::into).collect(),
            control_ids: None,
            treatment_year,
            scope: Scope::Municipal,
            outcomes: outcomes.into_iter().map(Into::into).collect(),
            controls: None,
            instrument: None,
            treatment_variable: None,
            window,
            compare_methods: None,
            matching_features: None,
            n_controls: None,
        }
    }

    pub fn with_controls(mut self, ids: impl IntoIterator<Item = impl Into<UnitId>>) -> Self {
        self.control_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_instrument(mut self, instrument: impl Into<String>) -> Self {
        self.instrument = Some(instrument.into());
        self
    }

    pub fn with_covariates(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.controls = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_treatment_variable(mut self, name: impl Into<String>) -> Self {
        self.treatment_variable = Some(name.into());
        self
    }

    pub fn with_compare_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.compare_methods = Some(methods.into_iter().collect());
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Strategies actually executed: the method itself, or the compare set.
    pub fn strategies(&self) -> Vec<Method> {
        if self.method != Method::Compare {
            return vec![self.method];
        }
        match &self.compare_methods {
            Some(methods) => methods.clone(),
            None if self.instrument.is_some() => vec![Method::Did, Method::Iv, Method::PanelIv],
            None => vec![Method::Did, Method::EventStudy, Method::Scm],
        }
    }

    pub fn covariate_names(&self) -> &[String] {
        self.controls.as_deref().unwrap_or(&[])
    }

    /// Every non-outcome column the estimators will read.
    pub fn required_columns(&self) -> Vec<String> {
        let mut cols: Vec<String> = self.covariate_names().to_vec();
        for extra in [&self.instrument, &self.treatment_variable].into_iter().flatten() {
            if !cols.contains(extra) {
                cols.push(extra.clone());
            }
        }
        cols
    }

    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |msg: String| Err(EngineError::Validation(msg));

        if self.treated_ids.is_empty() {
            return invalid("treated_ids must not be empty".into());
        }
        if self.treated_ids.iter().any(|id| id.trim().is_empty()) {
            return invalid("treated_ids must not contain blank ids".into());
        }
        if let Some(controls) = &self.control_ids {
            if controls.is_empty() {
                return invalid("control_ids must be non-empty when provided".into());
            }
            let overlap: Vec<&UnitId> = self.treated_ids.intersection(controls).collect();
            if !overlap.is_empty() {
                return invalid(format!("units are both treated and control: {overlap:?}"));
            }
        }
        if self.outcomes.is_empty() {
            return invalid("outcomes must not be empty".into());
        }
        let mut seen = BTreeSet::new();
        for outcome in &self.outcomes {
            if outcome.trim().is_empty() {
                return invalid("outcome names must not be blank".into());
            }
            if !seen.insert(outcome.as_str()) {
                return invalid(format!("outcome '{outcome}' listed twice"));
            }
        }
        if self.window.year_start > self.window.year_end {
            return invalid(format!(
                "window start {} is after window end {}",
                self.window.year_start, self.window.year_end
            ));
        }
        if self.method != Method::Compare && self.compare_methods.is_some() {
            return invalid("compare_methods is only valid with method 'compare'".into());
        }
        if self.method == Method::Compare {
            let methods = self.strategies();
            if methods.len() < 2 {
                return invalid("compare needs at least two methods".into());
            }
            if methods.contains(&Method::Compare) {
                return invalid("compare cannot include itself".into());
            }
            let distinct: BTreeSet<Method> = methods.iter().copied().collect();
            if distinct.len() != methods.len() {
                return invalid("compare_methods must be distinct".into());
            }
        }

        let needs_instrument = self.strategies().iter().any(Method::needs_instrument);
        match (&self.instrument, needs_instrument) {
            (None, true) => {
                return invalid(format!("method '{}' requires an instrument", self.method));
            }
            (Some(_), false) => {
                return invalid(format!(
                    "instrument is only valid for iv/panel_iv, not '{}'",
                    self.method
                ));
            }
            (Some(name), true) if name.trim().is_empty() => {
                return invalid("instrument name must not be blank".into());
            }
            _ => {}
        }
        if let Some(name) = &self.treatment_variable {
            if name.trim().is_empty() {
                return invalid("treatment_variable must not be blank".into());
            }
        }
        if self.n_controls == Some(0) {
            return invalid("n_controls must be at least 1".into());
        }
        Ok(())
    }
}
