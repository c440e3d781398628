//! Event study: TWFE regression on relative-time dummies.
//!
//! `y_it = α_i + λ_t + Σ_{k≠ref} δ_k · 1{t − t*_i = k} + ε_it`
//!
//! Dummies exist only for treated units; controls identify the year
//! effects. The reference period (default `t = −1`) is omitted and
//! reported with a coefficient of exactly zero. Pre-period coefficients
//! are reported as they come out, never used to reject the design.

use super::{
    observed_rows,
    regression::{dense_index, fit_ols, t_inference, CovarianceKind, FitOptions, FixedEffects},
    EstimationContext, Indeterminate, MethodEstimate, MethodPayload,
};
use crate::panel::Panel;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStudyPoint {
    pub relative_time: i32,
    pub coef:          f64,
    pub std_err:       Option<f64>,
    pub ci_lower:      Option<f64>,
    pub ci_upper:      Option<f64>,
    pub p_value:       Option<f64>,
    pub is_reference:  bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStudyPayload {
    pub reference_period:          i32,
    pub series:                    Vec<EventStudyPoint>,
    /// Pre-period coefficients individually significant at the test level.
    pub significant_pre_periods:   usize,
    pub post_periods:              usize,
    pub covariance:                String,
}

impl EventStudyPayload {
    pub fn point(&self, relative_time: i32) -> Option<&EventStudyPoint> {
        self.series.iter().find(|p| p.relative_time == relative_time)
    }
}

pub fn estimate(
    panel: &Panel,
    outcome: &str,
    ctx: &EstimationContext<'_>,
) -> Result<MethodEstimate, Indeterminate> {
    let cfg = ctx.config;
    let reference = cfg.reference_period;
    let rows = observed_rows(panel, outcome);

    let relative = |row: &crate::panel::PanelRow| -> Option<i32> {
        panel
            .is_treated(&row.unit_id)
            .then(|| row.year - panel.unit_treatment_year(row))
    };
    let observed: BTreeSet<i32> = rows.iter().filter_map(|&r| relative(r)).collect();
    if !observed.contains(&reference) {
        return Err(Indeterminate::insufficient(format!(
            "reference period t={reference} is not observed for any treated unit"
        )));
    }
    let dummies: Vec<i32> = observed.iter().copied().filter(|&k| k != reference).collect();
    if !dummies.iter().any(|&k| k >= 0) {
        return Err(Indeterminate::insufficient("no post-treatment period observed"));
    }

    let n = rows.len();
    let p = dummies.len();
    let mut x = DMatrix::zeros(n, p);
    let mut y = Vec::with_capacity(n);
    let mut units = Vec::with_capacity(n);
    let mut years = Vec::with_capacity(n);
    for (i, row) in rows.iter().enumerate() {
        if let Some(k) = relative(*row) {
            if let Ok(j) = dummies.binary_search(&k) {
                x[(i, j)] = 1.0;
            }
        }
        y.push(row.outcome(outcome).unwrap_or_default());
        units.push(row.unit_id.clone());
        years.push(row.year);
    }
    let unit_idx = dense_index(&units);
    let year_idx = dense_index(&years);
    let fe = FixedEffects::two_way(&unit_idx, &year_idx, cfg.fe_tolerance, cfg.fe_max_iterations);
    if n <= p + fe.df_absorbed() || n < cfg.min_observations {
        return Err(Indeterminate::insufficient(format!(
            "{n} observations for {} dummies and {} absorbed effects",
            p,
            fe.df_absorbed()
        )));
    }

    let y_dm = DVector::from_vec(fe.partial_out(&y)?);
    let x_dm = fe.partial_out_matrix(&x)?;
    let cov = CovarianceKind::by_unit(unit_idx, cfg.min_clusters_for_cluster_se);
    let fit = fit_ols(
        &x_dm,
        &y_dm,
        &cov,
        FitOptions {
            rank_tolerance: cfg.rank_tolerance,
            df_absorbed:    fe.df_absorbed(),
            centered_r2:    false,
        },
    )?;

    let alpha = cfg.significance_level;
    let mut series = Vec::with_capacity(p + 1);
    let mut significant_pre = 0;
    for (j, &k) in dummies.iter().enumerate() {
        let coef = fit.beta[j];
        let se = fit.se(j);
        let inf = t_inference(coef, se, fit.df, alpha);
        if k < 0 && inf.p_value.is_some_and(|pv| pv < alpha) {
            significant_pre += 1;
        }
        series.push(EventStudyPoint {
            relative_time: k,
            coef,
            std_err: Some(se),
            ci_lower: inf.ci_lower,
            ci_upper: inf.ci_upper,
            p_value: inf.p_value,
            is_reference: false,
        });
    }
    series.push(EventStudyPoint {
        relative_time: reference,
        coef:          0.0,
        std_err:       None,
        ci_lower:      None,
        ci_upper:      None,
        p_value:       None,
        is_reference:  true,
    });
    series.sort_by_key(|pt| pt.relative_time);

    // Summary effect: mean of post-period coefficients, var = 1'V1 / k².
    let post: Vec<usize> = (0..p).filter(|&j| dummies[j] >= 0).collect();
    let k = post.len() as f64;
    let coef = post.iter().map(|&j| fit.beta[j]).sum::<f64>() / k;
    let var = post
        .iter()
        .flat_map(|&a| post.iter().map(move |&b| (a, b)))
        .map(|(a, b)| fit.vcov[(a, b)])
        .sum::<f64>()
        / (k * k);
    let se = var.max(0.0).sqrt();
    let inference = t_inference(coef, se, fit.df, alpha);

    let mut warnings = Vec::new();
    if significant_pre > 0 {
        warnings.push(format!(
            "{significant_pre} pre-treatment coefficient(s) significant at {alpha}; inspect pre-trends"
        ));
    }

    Ok(MethodEstimate {
        coef,
        std_err: Some(se),
        p_value: inference.p_value,
        ci_lower: inference.ci_lower,
        ci_upper: inference.ci_upper,
        n_obs: n,
        r2: Some(fit.r2),
        warnings,
        payload: Some(MethodPayload::EventStudy(EventStudyPayload {
            reference_period: reference,
            series,
            significant_pre_periods: significant_pre,
            post_periods: post.len(),
            covariance: cov.describe().to_string(),
        })),
    })
}
