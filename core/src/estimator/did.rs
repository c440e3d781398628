//! Difference-in-Differences.
//!
//! Saturated 2×2 regression `y = α + β₁·D + β₂·Post + δ·(D×Post) + ε`
//! on every observed unit-year. With the interaction saturated, δ equals
//! `(T̄_post − T̄_pre) − (C̄_post − C̄_pre)` exactly; the regression form
//! supplies cluster-robust inference for it.

use super::{
    observed_rows,
    regression::{fit_ols, t_inference, CovarianceKind, FitOptions},
    EstimationContext, Indeterminate, MethodEstimate, MethodPayload,
};
use crate::panel::Panel;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DidPayload {
    pub treated_pre_mean:  f64,
    pub treated_post_mean: f64,
    pub control_pre_mean:  f64,
    pub control_post_mean: f64,
    pub treated_pre_obs:   usize,
    pub treated_post_obs:  usize,
    pub control_pre_obs:   usize,
    pub control_post_obs:  usize,
    pub covariance:        String,
}

#[derive(Default)]
struct Cell {
    sum: f64,
    n:   usize,
}

impl Cell {
    fn add(&mut self, y: f64) {
        self.sum += y;
        self.n += 1;
    }

    fn mean(&self) -> f64 {
        self.sum / self.n as f64
    }
}

pub fn estimate(
    panel: &Panel,
    outcome: &str,
    ctx: &EstimationContext<'_>,
) -> Result<MethodEstimate, Indeterminate> {
    let cfg = ctx.config;
    let rows = observed_rows(panel, outcome);

    let mut cells: [Cell; 4] = Default::default(); // [treated_pre, treated_post, control_pre, control_post]
    let mut y = Vec::with_capacity(rows.len());
    let mut design = Vec::with_capacity(rows.len() * 4);
    let mut units = Vec::with_capacity(rows.len());
    for row in &rows {
        let value = row.outcome(outcome).unwrap_or_default();
        let treated = panel.is_treated(&row.unit_id);
        let post = row.year >= panel.unit_treatment_year(row);
        let d = if treated { 1.0 } else { 0.0 };
        let p = if post { 1.0 } else { 0.0 };
        cells[(!treated as usize) * 2 + post as usize].add(value);
        y.push(value);
        design.extend_from_slice(&[1.0, d, p, d * p]);
        units.push(row.unit_id.clone());
    }

    let labels = ["treated pre-period", "treated post-period", "control pre-period", "control post-period"];
    let missing: Vec<&str> = cells
        .iter()
        .zip(labels)
        .filter(|(c, _)| c.n == 0)
        .map(|(_, l)| l)
        .collect();
    if !missing.is_empty() {
        return Err(Indeterminate::insufficient(format!(
            "DiD needs at least one pre- and one post-treatment observation per group; missing: {}",
            missing.join(", ")
        )));
    }
    let n = y.len();
    if n < cfg.min_observations.max(5) {
        return Err(Indeterminate::insufficient(format!(
            "{n} observations, at least {} required",
            cfg.min_observations.max(5)
        )));
    }

    let x = DMatrix::from_row_slice(n, 4, &design);
    let y = DVector::from_vec(y);
    let cov = CovarianceKind::by_unit(super::regression::dense_index(&units), cfg.min_clusters_for_cluster_se);
    let fit = fit_ols(
        &x,
        &y,
        &cov,
        FitOptions { rank_tolerance: cfg.rank_tolerance, df_absorbed: 0, centered_r2: true },
    )?;

    let [tp, tq, cp, cq] = &cells;
    let coef = (tq.mean() - tp.mean()) - (cq.mean() - cp.mean());
    let se = fit.se(3);
    let inference = t_inference(coef, se, fit.df, cfg.significance_level);

    Ok(MethodEstimate {
        coef,
        std_err: Some(se),
        p_value: inference.p_value,
        ci_lower: inference.ci_lower,
        ci_upper: inference.ci_upper,
        n_obs: n,
        r2: Some(fit.r2),
        warnings: Vec::new(),
        payload: Some(MethodPayload::Did(DidPayload {
            treated_pre_mean:  tp.mean(),
            treated_post_mean: tq.mean(),
            control_pre_mean:  cp.mean(),
            control_post_mean: cq.mean(),
            treated_pre_obs:   tp.n,
            treated_post_obs:  tq.n,
            control_pre_obs:   cp.n,
            control_post_obs:  cq.n,
            covariance:        cov.describe().to_string(),
        })),
    })
}
