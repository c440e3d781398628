//! Matching engine: proposes control units for a treated set.
//!
//! Features are pre-treatment means of outcome or covariate columns.
//! Each feature is standardized with candidate-pool statistics only, so
//! treated values never leak into the scale. A candidate's distance is
//! the Euclidean distance to its nearest treated unit; similarity is
//! `1 / (1 + distance)`. The balance table is a diagnostic, never a
//! constraint on the selection.

use crate::{
    error::{EngineError, EngineResult},
    panel::{PanelBuilder, PanelRow, PanelSource, TreatmentAssignment},
    request::{AnalysisRequest, Scope, Window},
    types::{UnitId, Year},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingCandidate {
    pub unit_id:          UnitId,
    /// In `(0, 1]`; `None` when the candidate lacks a feature value.
    pub similarity_score: Option<f64>,
    pub distance:         Option<f64>,
    pub is_treated:       bool,
    pub rank:             usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRow {
    pub feature:       String,
    pub treated_mean:  Option<f64>,
    pub selected_mean: Option<f64>,
    pub pool_mean:     Option<f64>,
    /// (treated − selected) / pool standard deviation.
    pub standardized_diff: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingOutcome {
    pub candidates:    Vec<MatchingCandidate>,
    pub selected:      Vec<UnitId>,
    pub balance_table: Vec<BalanceRow>,
    pub features:      Vec<String>,
    pub warnings:      Vec<String>,
}

/// Inputs of one `suggest_controls` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingRequest {
    pub treated_ids:    BTreeSet<UnitId>,
    pub treatment_year: Year,
    pub window:         Window,
    pub scope:          Scope,
    /// `None` draws the pool from every unit of `scope`.
    pub candidate_pool: Option<BTreeSet<UnitId>>,
    pub features:       Vec<String>,
    pub n_controls:     usize,
}

impl MatchingRequest {
    /// Matching parameters implied by an analysis request.
    pub fn for_analysis(request: &AnalysisRequest, default_features: &[String], default_n: usize) -> Self {
        let features = match &request.matching_features {
            Some(f) if !f.is_empty() => f.clone(),
            _ if !default_features.is_empty() => default_features.to_vec(),
            _ => request.outcomes.clone(),
        };
        Self {
            treated_ids:    request.treated_ids.clone(),
            treatment_year: request.treatment_year,
            window:         request.window,
            scope:          request.scope,
            candidate_pool: None,
            features,
            n_controls:     request.n_controls.unwrap_or(default_n),
        }
    }
}

pub struct MatchingEngine<'a> {
    source: &'a dyn PanelSource,
}

impl<'a> MatchingEngine<'a> {
    pub fn new(source: &'a dyn PanelSource) -> Self {
        Self { source }
    }

    pub fn suggest_controls(&self, tenant_id: &str, req: &MatchingRequest) -> EngineResult<MatchingOutcome> {
        if req.treated_ids.is_empty() {
            return Err(EngineError::Validation("treated_ids must not be empty".into()));
        }
        if req.features.is_empty() {
            return Err(EngineError::Validation("at least one matching feature is required".into()));
        }
        if req.n_controls == 0 {
            return Err(EngineError::Validation("n_controls must be at least 1".into()));
        }
        let pool: BTreeSet<UnitId> = match &req.candidate_pool {
            Some(p) => p.clone(),
            None => self.source.candidate_units(tenant_id, req.scope)?.into_iter().collect(),
        };
        let pool: BTreeSet<UnitId> = pool.difference(&req.treated_ids).cloned().collect();
        if pool.is_empty() {
            return Err(EngineError::InsufficientData("candidate pool is empty".into()));
        }

        // Features never read years outside the requested window.
        let pre_end = (req.treatment_year - 1).min(req.window.year_end);
        let pre_window = Window::new(req.window.year_start, pre_end);
        if pre_window.is_empty() {
            log::warn!("matching for tenant {tenant_id}: no pre-treatment year, selecting the whole pool");
            return Ok(unranked_pool(&pool, req));
        }

        let units: BTreeSet<UnitId> = req.treated_ids.union(&pool).cloned().collect();
        let rows = PanelBuilder::new(self.source).build(
            tenant_id,
            &units,
            &req.features,
            &[],
            pre_window,
            &TreatmentAssignment {
                treated_ids:    req.treated_ids.clone(),
                treatment_year: req.treatment_year,
            },
        )?;
        let means = feature_means(&rows, &req.features);
        let empty = vec![None; req.features.len()];
        let pick = |ids: &BTreeSet<UnitId>| -> BTreeMap<UnitId, Vec<Option<f64>>> {
            ids.iter()
                .map(|id| (id.clone(), means.get(id).cloned().unwrap_or_else(|| empty.clone())))
                .collect()
        };
        let outcome = rank_candidates(&pick(&req.treated_ids), &pick(&pool), &req.features, req.n_controls);
        log::info!(
            "matching for tenant {tenant_id}: {} candidates, {} selected, {} warnings",
            outcome.candidates.len(),
            outcome.selected.len(),
            outcome.warnings.len()
        );
        Ok(outcome)
    }
}

/// Every pool unit selected with null scores, for windows that hold no
/// pre-treatment year to match on.
fn unranked_pool(pool: &BTreeSet<UnitId>, req: &MatchingRequest) -> MatchingOutcome {
    let candidates: Vec<MatchingCandidate> = pool
        .iter()
        .enumerate()
        .map(|(i, id)| MatchingCandidate {
            unit_id:          id.clone(),
            similarity_score: None,
            distance:         None,
            is_treated:       false,
            rank:             i + 1,
        })
        .collect();
    MatchingOutcome {
        selected: pool.iter().cloned().collect(),
        candidates,
        balance_table: Vec::new(),
        features: req.features.clone(),
        warnings: vec![format!(
            "no pre-treatment year in {}..={} before {}; all {} candidate(s) in scope selected unranked",
            req.window.year_start,
            req.window.year_end,
            req.treatment_year,
            pool.len()
        )],
    }
}

/// Per-unit mean of each feature over the given rows, ignoring nulls.
fn feature_means(rows: &[PanelRow], features: &[String]) -> BTreeMap<UnitId, Vec<Option<f64>>> {
    let mut sums: BTreeMap<&str, Vec<(f64, usize)>> = BTreeMap::new();
    for row in rows {
        let acc = sums
            .entry(row.unit_id.as_str())
            .or_insert_with(|| vec![(0.0, 0); features.len()]);
        for (k, name) in features.iter().enumerate() {
            if let Some(v) = row.value(name) {
                acc[k].0 += v;
                acc[k].1 += 1;
            }
        }
    }
    sums.into_iter()
        .map(|(id, acc)| {
            let means = acc.into_iter().map(|(s, n)| (n > 0).then(|| s / n as f64)).collect();
            (id.to_string(), means)
        })
        .collect()
}

fn mean_sd(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let sd = if values.len() > 1 {
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };
    Some((mean, sd))
}

fn column(table: &BTreeMap<UnitId, Vec<Option<f64>>>, k: usize) -> Vec<f64> {
    table.values().filter_map(|v| v[k]).collect()
}

/// Rank `pool` against `treated` on precomputed feature vectors.
///
/// Scored candidates come first by ascending distance (ties by unit id);
/// candidates missing a usable feature follow with null scores.
pub fn rank_candidates(
    treated: &BTreeMap<UnitId, Vec<Option<f64>>>,
    pool: &BTreeMap<UnitId, Vec<Option<f64>>>,
    features: &[String],
    n_controls: usize,
) -> MatchingOutcome {
    let mut warnings = Vec::new();

    // Pool statistics per feature; zero-variance features carry no signal.
    let stats: Vec<Option<(f64, f64)>> = (0..features.len())
        .map(|k| mean_sd(&column(pool, k)))
        .collect();
    let usable: Vec<usize> = (0..features.len())
        .filter(|&k| match stats[k] {
            Some((_, sd)) if sd > 0.0 => true,
            _ => {
                warnings.push(format!(
                    "feature '{}' skipped: no variation in the candidate pool",
                    features[k]
                ));
                false
            }
        })
        .collect();

    let standardize = |v: &[Option<f64>]| -> Option<Vec<f64>> {
        usable
            .iter()
            .map(|&k| {
                let (mean, sd) = stats[k]?;
                v[k].map(|x| (x - mean) / sd)
            })
            .collect()
    };
    let treated_z: Vec<Vec<f64>> = treated.values().filter_map(|v| standardize(v)).collect();
    if usable.is_empty() {
        warnings.push("no usable matching feature; candidates are unranked".to_string());
    } else if treated_z.is_empty() {
        warnings.push("no treated unit has complete matching features".to_string());
    } else if treated_z.len() < treated.len() {
        warnings.push(format!(
            "{} treated unit(s) lack complete matching features and were ignored",
            treated.len() - treated_z.len()
        ));
    }

    let mut scored: Vec<(f64, &UnitId)> = Vec::new();
    let mut unscored: Vec<&UnitId> = Vec::new();
    for (id, v) in pool {
        let distance = if usable.is_empty() || treated_z.is_empty() {
            None
        } else {
            standardize(v).map(|z| {
                treated_z
                    .iter()
                    .map(|t| t.iter().zip(&z).map(|(a, b)| (a - b).powi(2)).sum::<f64>().sqrt())
                    .fold(f64::INFINITY, f64::min)
            })
        };
        match distance {
            Some(d) => scored.push((d, id)),
            None => unscored.push(id),
        }
    }
    if !usable.is_empty() && !treated_z.is_empty() && !unscored.is_empty() {
        warnings.push(format!("{} candidate(s) lack complete features and rank last", unscored.len()));
    }
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));

    let candidates: Vec<MatchingCandidate> = scored
        .iter()
        .map(|&(d, id)| (id, Some(d)))
        .chain(unscored.iter().map(|&id| (id, None)))
        .enumerate()
        .map(|(i, (id, d))| MatchingCandidate {
            unit_id:          id.clone(),
            similarity_score: d.map(|d| 1.0 / (1.0 + d)),
            distance:         d,
            is_treated:       false,
            rank:             i + 1,
        })
        .collect();
    let selected: Vec<UnitId> = candidates.iter().take(n_controls).map(|c| c.unit_id.clone()).collect();
    if selected.len() < n_controls {
        warnings.push(format!(
            "only {} candidate(s) available for {} requested controls",
            selected.len(),
            n_controls
        ));
    }

    let chosen: BTreeMap<UnitId, Vec<Option<f64>>> = selected
        .iter()
        .filter_map(|id| pool.get(id).map(|v| (id.clone(), v.clone())))
        .collect();
    let balance_table = features
        .iter()
        .enumerate()
        .map(|(k, name)| {
            let treated_mean = mean_sd(&column(treated, k)).map(|s| s.0);
            let selected_mean = mean_sd(&column(&chosen, k)).map(|s| s.0);
            let standardized_diff = match (treated_mean, selected_mean, stats[k]) {
                (Some(t), Some(s), Some((_, sd))) if sd > 0.0 => Some((t - s) / sd),
                _ => None,
            };
            BalanceRow {
                feature: name.clone(),
                treated_mean,
                selected_mean,
                pool_mean: stats[k].map(|s| s.0),
                standardized_diff,
            }
        })
        .collect();

    MatchingOutcome {
        candidates,
        selected,
        balance_table,
        features: features.to_vec(),
        warnings,
    }
}
