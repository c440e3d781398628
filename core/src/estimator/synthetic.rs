//! Synthetic control and its ridge-augmented variant.
//!
//! The treated trajectory (the mean over treated units when there are
//! several) is matched in the pre-period by a convex combination of donor
//! trajectories: weights are non-negative and sum to one. The effect is
//! the mean post-period gap between treated and synthetic.
//!
//! Augmented SCM keeps the same weights and adds a ridge outcome-model
//! correction `(a − B'w)'β_t` fitted on donor pre-trajectories, which
//! removes the bias left by an imperfect pre-period fit.
//!
//! Inference is placebo-in-space: every donor in turn plays the treated
//! unit against the remaining donors, and the treated post/pre RMSPE
//! ratio is ranked among the placebo ratios.

use super::{
    regression::normal_inference, EstimationContext, IndeterminacyReason, Indeterminate,
    MethodEstimate, MethodPayload,
};
use crate::{
    config::EstimationConfig,
    panel::Panel,
    types::{UnitId, Year},
};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorWeight {
    pub unit_id: UnitId,
    pub weight:  f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapPoint {
    pub year:      Year,
    pub treated:   f64,
    pub synthetic: f64,
    pub gap:       f64,
    pub post:      bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScmPayload {
    pub augmented:       bool,
    pub weights:         Vec<DonorWeight>,
    pub gaps:            Vec<GapPoint>,
    pub pre_rmspe:       f64,
    pub post_rmspe:      f64,
    pub rmspe_ratio:     Option<f64>,
    /// Placebo runs that produced a fit.
    pub placebo_count:   usize,
    pub placebo_effects: Vec<f64>,
    /// Per-year ridge correction added to the synthetic path (ASCM only).
    pub bias_correction: Option<Vec<f64>>,
    pub excluded_donors: Vec<UnitId>,
    pub poor_fit:        bool,
}

/// One fitted synthetic path for a treated trajectory.
#[derive(Debug, Clone)]
struct SyntheticFit {
    weights:    DVector<f64>,
    synthetic:  Vec<f64>,
    correction: Option<Vec<f64>>,
    pre_rmspe:  f64,
    post_rmspe: f64,
    effect:     f64,
    pre_r2:     Option<f64>,
}

impl SyntheticFit {
    fn ratio(&self) -> Option<f64> {
        (self.pre_rmspe > 0.0).then(|| self.post_rmspe / self.pre_rmspe)
    }
}

pub fn estimate(
    panel: &Panel,
    outcome: &str,
    ctx: &EstimationContext<'_>,
    augmented: bool,
) -> Result<MethodEstimate, Indeterminate> {
    let cfg = ctx.config;
    let years = panel.years();
    let n_years = years.len();
    let n_pre = years.iter().filter(|&&y| y < panel.treatment_year).count();
    let n_post = n_years - n_pre;

    if n_pre < cfg.scm_min_pre_periods {
        return Err(Indeterminate::insufficient(format!(
            "{n_pre} pre-treatment periods, at least {} required",
            cfg.scm_min_pre_periods
        )));
    }
    if n_post == 0 {
        return Err(Indeterminate::insufficient("no post-treatment period in the window"));
    }

    // unit -> outcome by year position
    let mut series: BTreeMap<&str, Vec<Option<f64>>> = BTreeMap::new();
    for row in &panel.rows {
        let Some(pos) = years.iter().position(|&y| y == row.year) else { continue };
        let slot = series
            .entry(row.unit_id.as_str())
            .or_insert_with(|| vec![None; n_years]);
        slot[pos] = row.outcome(outcome);
    }

    // Treated trajectory: mean over observed treated units, year by year.
    let mut treated = Vec::with_capacity(n_years);
    let mut treated_obs = 0usize;
    for t in 0..n_years {
        let values: Vec<f64> = panel
            .treated_ids
            .iter()
            .filter_map(|id| series.get(id.as_str()).and_then(|s| s[t]))
            .collect();
        if values.is_empty() {
            return Err(Indeterminate::insufficient(format!(
                "no treated observation in {}",
                years[t]
            )));
        }
        treated_obs += values.len();
        treated.push(values.iter().sum::<f64>() / values.len() as f64);
    }

    let mut warnings = Vec::new();
    let mut donor_ids = Vec::new();
    let mut donors: Vec<Vec<f64>> = Vec::new();
    let mut excluded = Vec::new();
    for id in &panel.control_ids {
        let complete: Option<Vec<f64>> = series
            .get(id.as_str())
            .and_then(|s| s.iter().copied().collect());
        match complete {
            Some(s) => {
                donor_ids.push(id.clone());
                donors.push(s);
            }
            None => excluded.push(id.clone()),
        }
    }
    if !excluded.is_empty() {
        warnings.push(format!(
            "{} donor(s) excluded for incomplete outcome series: {}",
            excluded.len(),
            excluded.join(", ")
        ));
    }
    if donors.is_empty() {
        return Err(Indeterminate::insufficient("no donor unit with a complete outcome series")
            .with_warnings(warnings));
    }

    let fit = fit_synthetic(&treated, &donors, n_pre, cfg, augmented)
        .map_err(|e| e.with_warnings(warnings.clone()))?;

    let pre_scale = treated[..n_pre].iter().map(|v| v.abs()).sum::<f64>() / n_pre as f64;
    let poor_fit = fit.pre_rmspe > cfg.scm_rmspe_tolerance * pre_scale;
    if poor_fit {
        warnings.push(format!(
            "poor pre-treatment fit: RMSPE {:.4} exceeds {:.0}% of the mean treated outcome",
            fit.pre_rmspe,
            cfg.scm_rmspe_tolerance * 100.0
        ));
    }

    // ── Placebo-in-space inference ───────────────────────────────────────────
    let mut placebo_effects = Vec::new();
    let mut placebo_ratios = Vec::new();
    if cfg.scm_placebo_inference && donors.len() >= 2 {
        for j in 0..donors.len() {
            let pool: Vec<Vec<f64>> = donors
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != j)
                .map(|(_, d)| d.clone())
                .collect();
            match fit_synthetic(&donors[j], &pool, n_pre, cfg, augmented) {
                Ok(p) => {
                    placebo_effects.push(p.effect);
                    placebo_ratios.push(p.ratio());
                }
                Err(why) => log::debug!("placebo for {} skipped: {}", donor_ids[j], why.warning()),
            }
        }
    }

    let placebo_count = placebo_effects.len();
    let (std_err, p_value, ci_lower, ci_upper) = if placebo_count >= 2 {
        let mean = placebo_effects.iter().sum::<f64>() / placebo_count as f64;
        let var = placebo_effects.iter().map(|e| (e - mean).powi(2)).sum::<f64>()
            / (placebo_count - 1) as f64;
        let se = var.sqrt();
        // Ranking on the RMSPE ratio; a perfect pre-fit ranks as extreme.
        let ratio = fit.ratio().unwrap_or(f64::INFINITY);
        let at_least = placebo_ratios
            .iter()
            .filter(|r| r.unwrap_or(f64::INFINITY) >= ratio)
            .count();
        let p = (1 + at_least) as f64 / (1 + placebo_count) as f64;
        let normal = normal_inference(fit.effect, se, cfg.significance_level);
        (Some(se), Some(p), normal.ci_lower, normal.ci_upper)
    } else {
        if cfg.scm_placebo_inference {
            warnings.push("fewer than two placebo fits; no inference reported".to_string());
        }
        (None, None, None, None)
    };

    let gaps = years
        .iter()
        .enumerate()
        .map(|(t, &year)| GapPoint {
            year,
            treated: treated[t],
            synthetic: fit.synthetic[t],
            gap: treated[t] - fit.synthetic[t],
            post: t >= n_pre,
        })
        .collect();
    let weights = donor_ids
        .iter()
        .zip(fit.weights.iter())
        .map(|(id, &w)| DonorWeight { unit_id: id.clone(), weight: w })
        .collect();

    Ok(MethodEstimate {
        coef: fit.effect,
        std_err,
        p_value,
        ci_lower,
        ci_upper,
        n_obs: treated_obs + donors.len() * n_years,
        r2: fit.pre_r2,
        warnings,
        payload: Some(MethodPayload::SyntheticControl(ScmPayload {
            augmented,
            weights,
            gaps,
            pre_rmspe: fit.pre_rmspe,
            post_rmspe: fit.post_rmspe,
            rmspe_ratio: fit.ratio(),
            placebo_count,
            placebo_effects,
            bias_correction: fit.correction,
            excluded_donors: excluded,
            poor_fit,
        })),
    })
}

/// Fit weights on the first `n_pre` periods and build the full path.
fn fit_synthetic(
    treated: &[f64],
    donors: &[Vec<f64>],
    n_pre: usize,
    cfg: &EstimationConfig,
    augmented: bool,
) -> Result<SyntheticFit, Indeterminate> {
    let n_years = treated.len();
    let j = donors.len();
    // B: pre-periods × donors
    let b = DMatrix::from_fn(n_pre, j, |t, d| donors[d][t]);
    let a = DVector::from_fn(n_pre, |t, _| treated[t]);
    let weights = simplex_least_squares(&b, &a, cfg.scm_max_iterations, cfg.scm_tolerance)?;

    let mut synthetic: Vec<f64> = (0..n_years)
        .map(|t| (0..j).map(|d| weights[d] * donors[d][t]).sum())
        .collect();

    let correction = if augmented {
        let c = ridge_correction(&a, &b, &weights, donors, cfg.ascm_ridge_scale)?;
        for (s, c) in synthetic.iter_mut().zip(&c) {
            *s += c;
        }
        Some(c)
    } else {
        None
    };

    let gap = |t: usize| treated[t] - synthetic[t];
    let rmspe = |range: std::ops::Range<usize>| {
        let len = range.len() as f64;
        (range.map(|t| gap(t).powi(2)).sum::<f64>() / len).sqrt()
    };
    let pre_rmspe = rmspe(0..n_pre);
    let post_rmspe = rmspe(n_pre..n_years);
    let effect = (n_pre..n_years).map(gap).sum::<f64>() / (n_years - n_pre) as f64;

    let pre_mean = treated[..n_pre].iter().sum::<f64>() / n_pre as f64;
    let sst: f64 = treated[..n_pre].iter().map(|v| (v - pre_mean).powi(2)).sum();
    let sse: f64 = (0..n_pre).map(|t| gap(t).powi(2)).sum();
    let pre_r2 = (sst > 0.0).then(|| 1.0 - sse / sst);

    Ok(SyntheticFit { weights, synthetic, correction, pre_rmspe, post_rmspe, effect, pre_r2 })
}

/// `min ‖a − Bw‖²` subject to `w ≥ 0, Σw = 1`.
///
/// Accelerated projected gradient (FISTA) with gradient-based restart.
/// Step size is `1/L` with `L = 2·λ_max(B'B)`.
pub(crate) fn simplex_least_squares(
    b: &DMatrix<f64>,
    a: &DVector<f64>,
    max_iterations: usize,
    tolerance: f64,
) -> Result<DVector<f64>, Indeterminate> {
    let j = b.ncols();
    if j == 0 {
        return Err(Indeterminate::insufficient("no donors"));
    }
    if j == 1 {
        return Ok(DVector::from_element(1, 1.0));
    }
    let btb = b.transpose() * b;
    let bta = b.transpose() * a;
    let lipschitz = 2.0 * btb.clone().symmetric_eigen().eigenvalues.max();
    if !lipschitz.is_finite() {
        return Err(Indeterminate::new(
            IndeterminacyReason::RankDeficient,
            "donor matrix contains non-finite values",
        ));
    }
    if lipschitz <= 0.0 {
        // All donor pre-trajectories are zero: every weighting fits equally.
        return Ok(DVector::from_element(j, 1.0 / j as f64));
    }

    let mut w = DVector::from_element(j, 1.0 / j as f64);
    let mut y = w.clone();
    let mut t = 1.0_f64;
    for iteration in 0..max_iterations {
        let grad = (&btb * &y - &bta) * 2.0;
        let next = project_simplex(&(&y - grad / lipschitz));
        let step = &next - &w;
        if step.amax() < tolerance {
            log::trace!("simplex solver converged after {iteration} iterations");
            return Ok(normalize(next));
        }
        if (&y - &next).dot(&step) > 0.0 {
            t = 1.0;
            y = next.clone();
        } else {
            let t_next = (1.0 + (1.0 + 4.0 * t * t).sqrt()) / 2.0;
            y = &next + &step * ((t - 1.0) / t_next);
            t = t_next;
        }
        w = next;
    }
    Err(Indeterminate::new(
        IndeterminacyReason::NonConvergence,
        format!("donor weights did not converge within {max_iterations} iterations"),
    ))
}

/// Euclidean projection onto the probability simplex.
fn project_simplex(v: &DVector<f64>) -> DVector<f64> {
    let mut sorted: Vec<f64> = v.iter().copied().collect();
    sorted.sort_by(|x, y| y.total_cmp(x));
    let mut cumulative = 0.0;
    let mut theta = 0.0;
    for (k, &u) in sorted.iter().enumerate() {
        cumulative += u;
        let candidate = (cumulative - 1.0) / (k + 1) as f64;
        if u - candidate > 0.0 {
            theta = candidate;
        }
    }
    v.map(|x| (x - theta).max(0.0))
}

fn normalize(w: DVector<f64>) -> DVector<f64> {
    let total = w.sum();
    if total > 0.0 {
        w / total
    } else {
        let j = w.len();
        DVector::from_element(j, 1.0 / j as f64)
    }
}

/// Ridge outcome model per year on centred donor pre-trajectories.
///
/// Returns the correction `(a − Bw)'β_t` for every period.
fn ridge_correction(
    a: &DVector<f64>,
    b: &DMatrix<f64>,
    weights: &DVector<f64>,
    donors: &[Vec<f64>],
    scale: f64,
) -> Result<Vec<f64>, Indeterminate> {
    let n_pre = b.nrows();
    let j = b.ncols();
    let n_years = donors.first().map_or(0, Vec::len);

    // X: donors × pre-periods, columns centred across donors.
    let mut x = b.transpose();
    for mut col in x.column_iter_mut() {
        let mean = col.mean();
        col.add_scalar_mut(-mean);
    }
    let xtx = x.transpose() * &x;
    let trace = xtx.trace();
    let lambda = if trace > 0.0 { scale * trace / n_pre as f64 } else { scale.max(f64::EPSILON) };
    let penalized = &xtx + DMatrix::identity(n_pre, n_pre) * lambda;
    let Some(inverse) = penalized.try_inverse() else {
        return Err(Indeterminate::new(
            IndeterminacyReason::RankDeficient,
            "ridge system for the bias correction is singular",
        ));
    };
    let imbalance = a - b * weights;
    let projector = &inverse * x.transpose();

    Ok((0..n_years)
        .map(|t| {
            let yt = DVector::from_fn(j, |d, _| donors[d][t]);
            let centred = yt.add_scalar(-yt.mean());
            let beta = &projector * centred;
            imbalance.dot(&beta)
        })
        .collect())
}
