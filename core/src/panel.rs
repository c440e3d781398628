//! Panel builder: rectangular unit × year datasets for the estimators.
//!
//! The core never queries the warehouse itself. Observations arrive
//! through a [`PanelSource`], already extracted and tenant-scoped, and
//! the builder turns them into a complete rectangle:
//!   1. one row per requested unit per window year, sorted (unit, year)
//!   2. missing cells are `None`, never dropped or zero-filled
//!   3. the treatment indicator is derived, so it is monotone in year
//!
//! Method-specific observation thresholds are the estimator's business.

use crate::{
    error::{EngineError, EngineResult},
    request::{Scope, Window},
    types::{TenantId, UnitId, Year},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

// ── Data model ───────────────────────────────────────────────────────────────

/// One raw warehouse observation for a unit-year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub unit_id:        UnitId,
    pub year:           Year,
    /// Outcome and covariate columns by name.
    pub values:         BTreeMap<String, Option<f64>>,
    /// Year the unit's port activity began, when the mart records it.
    #[serde(default)]
    pub treatment_year: Option<Year>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelRow {
    pub unit_id:             UnitId,
    pub year:                Year,
    pub outcome_values:      BTreeMap<String, Option<f64>>,
    pub treatment_indicator: bool,
    pub treatment_year:      Option<Year>,
    pub covariates:          BTreeMap<String, Option<f64>>,
}

impl PanelRow {
    pub fn outcome(&self, name: &str) -> Option<f64> {
        self.outcome_values.get(name).copied().flatten()
    }

    pub fn covariate(&self, name: &str) -> Option<f64> {
        self.covariates.get(name).copied().flatten()
    }

    /// Outcome or covariate, whichever carries `name`.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.outcome(name).or_else(|| self.covariate(name))
    }
}

/// What the builder asks a source for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelQuery {
    pub unit_ids: Vec<UnitId>,
    pub columns:  Vec<String>,
    pub window:   Window,
}

/// Treated set and fallback treatment year for indicator construction.
#[derive(Debug, Clone, PartialEq)]
pub struct TreatmentAssignment {
    pub treated_ids:    BTreeSet<UnitId>,
    pub treatment_year: Year,
}

// ── Collaborator interface ───────────────────────────────────────────────────

/// Supplier of already-extracted warehouse observations.
///
/// Implementations must scope every read to `tenant_id`.
pub trait PanelSource: Send + Sync {
    fn fetch(&self, tenant_id: &str, query: &PanelQuery) -> EngineResult<Vec<Observation>>;

    /// Units of the given level that may serve as matching candidates.
    fn candidate_units(&self, tenant_id: &str, scope: Scope) -> EngineResult<Vec<UnitId>>;
}

/// Panel source held entirely in memory. Used by tests and demo runs.
#[derive(Debug, Default)]
pub struct InMemoryPanelSource {
    tenants: RwLock<BTreeMap<TenantId, TenantPanel>>,
}

#[derive(Debug, Default, Clone)]
struct TenantPanel {
    units:        BTreeMap<UnitId, Scope>,
    observations: Vec<Observation>,
}

impl InMemoryPanelSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_unit(&self, tenant_id: &str, unit_id: &str, scope: Scope) {
        let mut tenants = self.tenants.write().unwrap_or_else(|p| p.into_inner());
        tenants
            .entry(tenant_id.to_string())
            .or_default()
            .units
            .insert(unit_id.to_string(), scope);
    }

    /// Add an observation, registering its unit as municipal if unknown.
    pub fn add_observation(&self, tenant_id: &str, observation: Observation) {
        let mut tenants = self.tenants.write().unwrap_or_else(|p| p.into_inner());
        let panel = tenants.entry(tenant_id.to_string()).or_default();
        panel
            .units
            .entry(observation.unit_id.clone())
            .or_insert(Scope::Municipal);
        panel.observations.push(observation);
    }

    pub fn observation_count(&self, tenant_id: &str) -> usize {
        let tenants = self.tenants.read().unwrap_or_else(|p| p.into_inner());
        tenants.get(tenant_id).map_or(0, |t| t.observations.len())
    }
}

impl PanelSource for InMemoryPanelSource {
    fn fetch(&self, tenant_id: &str, query: &PanelQuery) -> EngineResult<Vec<Observation>> {
        let tenants = self.tenants.read().unwrap_or_else(|p| p.into_inner());
        let Some(panel) = tenants.get(tenant_id) else {
            return Ok(Vec::new());
        };
        let wanted: BTreeSet<&str> = query.unit_ids.iter().map(String::as_str).collect();
        Ok(panel
            .observations
            .iter()
            .filter(|o| wanted.contains(o.unit_id.as_str()) && query.window.contains(o.year))
            .map(|o| Observation {
                unit_id:        o.unit_id.clone(),
                year:           o.year,
                values:         query
                    .columns
                    .iter()
                    .filter_map(|c| o.values.get(c).map(|v| (c.clone(), *v)))
                    .collect(),
                treatment_year: o.treatment_year,
            })
            .collect())
    }

    fn candidate_units(&self, tenant_id: &str, scope: Scope) -> EngineResult<Vec<UnitId>> {
        let tenants = self.tenants.read().unwrap_or_else(|p| p.into_inner());
        Ok(tenants
            .get(tenant_id)
            .map(|t| {
                t.units
                    .iter()
                    .filter(|(_, s)| **s == scope)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

pub struct PanelBuilder<'a> {
    source: &'a dyn PanelSource,
}

impl<'a> PanelBuilder<'a> {
    pub fn new(source: &'a dyn PanelSource) -> Self {
        Self { source }
    }

    /// Assemble the panel for `unit_ids` over `window`.
    ///
    /// Fails with `InsufficientData` only when not a single non-null
    /// value exists; sparser panels are left for the estimators to judge.
    pub fn build(
        &self,
        tenant_id: &str,
        unit_ids: &BTreeSet<UnitId>,
        outcomes: &[String],
        covariates: &[String],
        window: Window,
        assignment: &TreatmentAssignment,
    ) -> EngineResult<Vec<PanelRow>> {
        if window.is_empty() {
            return Err(EngineError::Validation(format!(
                "window [{}, {}] is empty",
                window.year_start, window.year_end
            )));
        }
        if unit_ids.is_empty() {
            return Err(EngineError::InsufficientData("no units requested".into()));
        }

        let mut columns: Vec<String> = outcomes.to_vec();
        for c in covariates {
            if !columns.contains(c) {
                columns.push(c.clone());
            }
        }
        let query = PanelQuery {
            unit_ids: unit_ids.iter().cloned().collect(),
            columns,
            window,
        };
        let observations = self.source.fetch(tenant_id, &query)?;
        log::debug!(
            "panel fetch: tenant={tenant_id} units={} observations={}",
            unit_ids.len(),
            observations.len()
        );

        // (unit, year) -> merged values; later non-null values win.
        let mut cells: BTreeMap<(&str, Year), BTreeMap<String, Option<f64>>> = BTreeMap::new();
        let mut unit_treatment_year: BTreeMap<&str, Year> = BTreeMap::new();
        for obs in &observations {
            if !unit_ids.contains(&obs.unit_id) || !window.contains(obs.year) {
                continue;
            }
            if let Some(ty) = obs.treatment_year {
                unit_treatment_year.entry(obs.unit_id.as_str()).or_insert(ty);
            }
            let cell = cells.entry((obs.unit_id.as_str(), obs.year)).or_default();
            if !cell.is_empty() {
                log::warn!("duplicate observation for {} in {}; merging", obs.unit_id, obs.year);
            }
            for (name, value) in &obs.values {
                match (cell.get(name), value) {
                    (Some(Some(_)), None) => {}
                    _ => {
                        cell.insert(name.clone(), *value);
                    }
                }
            }
        }

        let mut rows = Vec::with_capacity(unit_ids.len() * window.len());
        let mut observed_values = 0usize;
        for unit in unit_ids {
            let treated = assignment.treated_ids.contains(unit);
            let treatment_year = if treated {
                Some(
                    unit_treatment_year
                        .get(unit.as_str())
                        .copied()
                        .unwrap_or(assignment.treatment_year),
                )
            } else {
                None
            };
            for year in window.years() {
                let cell = cells.get(&(unit.as_str(), year));
                let lookup = |name: &String| cell.and_then(|c| c.get(name).copied().flatten());
                let outcome_values: BTreeMap<String, Option<f64>> =
                    outcomes.iter().map(|o| (o.clone(), lookup(o))).collect();
                let covariate_values: BTreeMap<String, Option<f64>> =
                    covariates.iter().map(|c| (c.clone(), lookup(c))).collect();
                observed_values += outcome_values.values().filter(|v| v.is_some()).count();
                observed_values += covariate_values.values().filter(|v| v.is_some()).count();
                rows.push(PanelRow {
                    unit_id: unit.clone(),
                    year,
                    outcome_values,
                    treatment_indicator: treatment_year.is_some_and(|ty| year >= ty),
                    treatment_year,
                    covariates: covariate_values,
                });
            }
        }

        if observed_values == 0 {
            return Err(EngineError::InsufficientData(format!(
                "panel for {} units over [{}, {}] contains no observations",
                unit_ids.len(),
                window.year_start,
                window.year_end
            )));
        }
        Ok(rows)
    }
}

// ── Panel view ───────────────────────────────────────────────────────────────

/// Built panel plus the treated/control split the estimators need.
#[derive(Debug, Clone)]
pub struct Panel {
    pub rows:           Vec<PanelRow>,
    pub treated_ids:    BTreeSet<UnitId>,
    pub control_ids:    BTreeSet<UnitId>,
    pub treatment_year: Year,
    pub window:         Window,
}

impl Panel {
    pub fn new(
        rows: Vec<PanelRow>,
        treated_ids: BTreeSet<UnitId>,
        control_ids: BTreeSet<UnitId>,
        treatment_year: Year,
        window: Window,
    ) -> Self {
        Self { rows, treated_ids, control_ids, treatment_year, window }
    }

    pub fn is_treated(&self, unit_id: &str) -> bool {
        self.treated_ids.contains(unit_id)
    }

    /// Treatment year of a row's unit, falling back to the request's.
    pub fn unit_treatment_year(&self, row: &PanelRow) -> Year {
        row.treatment_year.unwrap_or(self.treatment_year)
    }

    /// Rows of one unit, in year order.
    pub fn unit_rows<'a>(&'a self, unit_id: &'a str) -> impl Iterator<Item = &'a PanelRow> + 'a {
        self.rows.iter().filter(move |r| r.unit_id == unit_id)
    }

    pub fn years(&self) -> Vec<Year> {
        self.window.years().collect()
    }
}
