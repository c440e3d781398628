//! Instrumental variables: pooled 2SLS and Panel IV.
//!
//! First stage: endogenous treatment on `[exog | instrument]`.
//! Second stage: outcome on `[exog | fitted treatment]`; residuals use the
//! original treatment. Panel IV absorbs unit and year fixed effects from
//! every variable before both stages and drops the intercept.
//!
//! The first-stage F for the excluded instrument is always reported. A
//! weak instrument is a warning, never a reason to withhold the estimate.

use super::{
    observed_rows,
    regression::{
        dense_index, invert, rss_of, sandwich_fit, t_inference, CovarianceKind, FitOptions,
        FixedEffects,
    },
    EstimationContext, Indeterminate, MethodEstimate, MethodPayload,
};
use crate::panel::{Panel, PanelRow};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvPayload {
    pub endogenous:          String,
    pub instrument:          String,
    pub fixed_effects:       bool,
    /// `None` when the first stage fits perfectly (F is unbounded).
    pub first_stage_f:       Option<f64>,
    pub first_stage_coef:    f64,
    pub first_stage_r2:      f64,
    pub partial_r2:          f64,
    pub weak_instrument:     bool,
    pub covariance:          String,
}

/// Name given to the binary indicator when no intensity column is set.
pub const TREATMENT_INDICATOR: &str = "treatment_indicator";

pub fn estimate(
    panel: &Panel,
    outcome: &str,
    ctx: &EstimationContext<'_>,
    fixed_effects: bool,
) -> Result<MethodEstimate, Indeterminate> {
    let cfg = ctx.config;
    let Some(instrument) = ctx.instrument else {
        return Err(Indeterminate::insufficient("no instrument supplied"));
    };
    let endogenous = ctx.treatment_variable.unwrap_or(TREATMENT_INDICATOR);

    let treatment = |row: &PanelRow| match ctx.treatment_variable {
        Some(name) => row.value(name),
        None => Some(if row.treatment_indicator { 1.0 } else { 0.0 }),
    };

    // Complete cases only.
    let mut y = Vec::new();
    let mut d = Vec::new();
    let mut z = Vec::new();
    let mut w: Vec<Vec<f64>> = Vec::new();
    let mut units = Vec::new();
    let mut years = Vec::new();
    let mut dropped = 0usize;
    for row in observed_rows(panel, outcome) {
        let controls: Option<Vec<f64>> = ctx.covariates.iter().map(|c| row.value(c)).collect();
        match (row.outcome(outcome), treatment(row), row.value(instrument), controls) {
            (Some(yi), Some(di), Some(zi), Some(wi)) => {
                y.push(yi);
                d.push(di);
                z.push(zi);
                w.push(wi);
                units.push(row.unit_id.clone());
                years.push(row.year);
            }
            _ => dropped += 1,
        }
    }

    let mut warnings = Vec::new();
    if dropped > 0 {
        warnings.push(format!(
            "{dropped} rows dropped for missing treatment, instrument or covariates"
        ));
    }

    let n = y.len();
    let k_w = ctx.covariates.len();
    if n < cfg.min_observations {
        return Err(Indeterminate::insufficient(format!(
            "{n} complete observations, at least {} required",
            cfg.min_observations
        ))
        .with_warnings(warnings));
    }
    if years.iter().collect::<BTreeSet<_>>().len() < 2 {
        return Err(Indeterminate::insufficient(
            "all complete observations fall in a single year; no pre/post contrast",
        )
        .with_warnings(warnings));
    }

    let unit_idx = dense_index(&units);
    let year_idx = dense_index(&years);

    // Exogenous block: intercept + covariates, or FE-demeaned covariates.
    let n_exog = if fixed_effects { k_w } else { k_w + 1 };
    let mut exog = DMatrix::zeros(n, n_exog);
    for i in 0..n {
        let offset = if fixed_effects { 0 } else { 1 };
        if !fixed_effects {
            exog[(i, 0)] = 1.0;
        }
        for (j, v) in w[i].iter().enumerate() {
            exog[(i, offset + j)] = *v;
        }
    }
    let mut y = DVector::from_vec(y);
    let mut d = DVector::from_vec(d);
    let mut z = DVector::from_vec(z);

    let mut df_absorbed = 0;
    if fixed_effects {
        let fe = FixedEffects::two_way(&unit_idx, &year_idx, cfg.fe_tolerance, cfg.fe_max_iterations);
        df_absorbed = fe.df_absorbed();
        let absorb = |v: &DVector<f64>| -> Result<DVector<f64>, Indeterminate> {
            Ok(DVector::from_vec(fe.partial_out(v.as_slice())?))
        };
        y = absorb(&y).map_err(|e| e.with_warnings(warnings.clone()))?;
        d = absorb(&d).map_err(|e| e.with_warnings(warnings.clone()))?;
        z = absorb(&z).map_err(|e| e.with_warnings(warnings.clone()))?;
        exog = fe.partial_out_matrix(&exog).map_err(|e| e.with_warnings(warnings.clone()))?;
    }

    // ── First stage ──────────────────────────────────────────────────────────
    let k_z = n_exog + 1;
    if n <= k_z + df_absorbed {
        return Err(Indeterminate::insufficient(format!(
            "{n} observations for {} first-stage parameters",
            k_z + df_absorbed
        ))
        .with_warnings(warnings));
    }
    let mut zfull = DMatrix::zeros(n, k_z);
    zfull.view_mut((0, 0), (n, n_exog)).copy_from(&exog);
    zfull.set_column(n_exog, &z);

    let ztz_inv = invert(&(zfull.transpose() * &zfull), cfg.rank_tolerance, "instrument is collinear with the covariates")
        .map_err(|e| e.with_warnings(warnings.clone()))?;
    let gamma = &ztz_inv * (zfull.transpose() * &d);
    let d_hat = &zfull * &gamma;
    let rss_u: f64 = (&d - &d_hat).iter().map(|r| r * r).sum();
    let rss_r = rss_of(&exog, &d, cfg.rank_tolerance).map_err(|e| e.with_warnings(warnings.clone()))?;
    let tss_d: f64 = if fixed_effects {
        d.iter().map(|v| v * v).sum()
    } else {
        let mean = d.mean();
        d.iter().map(|v| (v - mean).powi(2)).sum()
    };
    let dof_fs = (n - k_z - df_absorbed) as f64;
    let first_stage_f = if rss_u > 0.0 {
        Some(((rss_r - rss_u).max(0.0)) / (rss_u / dof_fs))
    } else {
        None
    };
    let first_stage_r2 = if tss_d > 0.0 { 1.0 - rss_u / tss_d } else { 0.0 };
    let partial_r2 = if rss_r > 0.0 { (rss_r - rss_u) / rss_r } else { 0.0 };
    let weak = first_stage_f.is_some_and(|f| f < cfg.weak_instrument_f);
    if weak {
        warnings.push(format!(
            "weak instrument: first-stage F = {:.2} < {:.1}",
            first_stage_f.unwrap_or_default(),
            cfg.weak_instrument_f
        ));
    }
    log::debug!("first stage for '{outcome}': F={first_stage_f:?} partial_r2={partial_r2:.4}");

    // ── Second stage ─────────────────────────────────────────────────────────
    let k_x = n_exog + 1;
    let mut x_hat = DMatrix::zeros(n, k_x);
    x_hat.view_mut((0, 0), (n, n_exog)).copy_from(&exog);
    x_hat.set_column(n_exog, &d_hat);
    let mut x_orig = x_hat.clone();
    x_orig.set_column(n_exog, &d);

    let bread = invert(
        &(x_hat.transpose() * &x_hat),
        cfg.rank_tolerance,
        "fitted treatment is collinear with the covariates (instrument carries no variation)",
    )
    .map_err(|e| e.with_warnings(warnings.clone()))?;
    let beta = &bread * (x_hat.transpose() * &y);
    let residuals = &y - &x_orig * &beta;

    let cov = CovarianceKind::by_unit(unit_idx, cfg.min_clusters_for_cluster_se);
    let fit = sandwich_fit(
        &x_hat,
        &y,
        beta,
        residuals,
        &bread,
        &cov,
        FitOptions { rank_tolerance: cfg.rank_tolerance, df_absorbed, centered_r2: !fixed_effects },
    )
    .map_err(|e| e.with_warnings(warnings.clone()))?;

    let coef = fit.beta[n_exog];
    let se = fit.se(n_exog);
    let inference = t_inference(coef, se, fit.df, cfg.significance_level);

    Ok(MethodEstimate {
        coef,
        std_err: Some(se),
        p_value: inference.p_value,
        ci_lower: inference.ci_lower,
        ci_upper: inference.ci_upper,
        n_obs: n,
        r2: Some(fit.r2),
        warnings,
        payload: Some(MethodPayload::Iv(IvPayload {
            endogenous: endogenous.to_string(),
            instrument: instrument.to_string(),
            fixed_effects,
            first_stage_f,
            first_stage_coef: gamma[n_exog],
            first_stage_r2,
            partial_r2,
            weak_instrument: weak,
            covariance: cov.describe().to_string(),
        })),
    })
}
