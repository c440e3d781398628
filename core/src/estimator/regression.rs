//! Linear-regression plumbing shared by every strategy.
//!
//! - OLS with a rank check on X'X (singular values, relative tolerance)
//! - HC1 or Liang–Zeger cluster-robust sandwich covariance
//! - two-way fixed-effect absorption by alternating projections
//! - t/normal inference helpers
//!
//! Everything here iterates in a fixed order (BTreeMap, index loops) so
//! that identical inputs give bit-identical outputs.

use super::{Indeterminate, IndeterminacyReason};
use nalgebra::{DMatrix, DVector};
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use std::collections::BTreeMap;

// ── Covariance ───────────────────────────────────────────────────────────────

/// Which sandwich estimator to use for standard errors.
#[derive(Debug, Clone)]
pub enum CovarianceKind {
    /// Heteroskedasticity-robust with the n/(n−k) small-sample factor.
    Hc1,
    /// Cluster-robust; one dense cluster index per observation.
    Cluster(Vec<usize>),
}

impl CovarianceKind {
    /// Cluster by unit when there are enough clusters, else HC1.
    pub fn by_unit(cluster_of: Vec<usize>, min_clusters: usize) -> Self {
        let distinct = cluster_of.iter().copied().collect::<std::collections::BTreeSet<_>>();
        if distinct.len() >= min_clusters.max(2) {
            Self::Cluster(cluster_of)
        } else {
            Self::Hc1
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Hc1        => "HC1",
            Self::Cluster(_) => "cluster-robust (unit)",
        }
    }
}

// ── OLS ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OlsFit {
    pub beta:      DVector<f64>,
    pub residuals: DVector<f64>,
    pub vcov:      DMatrix<f64>,
    pub n_obs:     usize,
    /// Degrees of freedom for the t reference distribution.
    pub df:        f64,
    pub r2:        f64,
}

impl OlsFit {
    pub fn se(&self, j: usize) -> f64 {
        self.vcov[(j, j)].max(0.0).sqrt()
    }
}

/// Settings every regression needs from the estimation config.
#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    pub rank_tolerance: f64,
    /// Parameters already consumed by absorbed fixed effects.
    pub df_absorbed:    usize,
    /// R² against the mean (true) or against zero for demeaned data.
    pub centered_r2:    bool,
}

/// True when X'X is numerically singular.
pub fn is_rank_deficient(xtx: &DMatrix<f64>, tolerance: f64) -> bool {
    if xtx.nrows() == 0 {
        return false;
    }
    let sv = xtx.clone().svd(false, false).singular_values;
    let max = sv.max();
    let min = sv.min();
    !(max > 0.0 && max.is_finite() && min > max * tolerance)
}

pub fn fit_ols(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    cov: &CovarianceKind,
    opts: FitOptions,
) -> Result<OlsFit, Indeterminate> {
    let xtx = x.transpose() * x;
    let xtx_inv = invert(&xtx, opts.rank_tolerance, "regressors are collinear")?;
    let beta = &xtx_inv * (x.transpose() * y);
    let residuals = y - x * &beta;
    sandwich_fit(x, y, beta, residuals, &xtx_inv, cov, opts)
}

/// Invert a Gram matrix, reporting rank deficiency as indeterminate.
pub fn invert(xtx: &DMatrix<f64>, tolerance: f64, what: &str) -> Result<DMatrix<f64>, Indeterminate> {
    if is_rank_deficient(xtx, tolerance) {
        return Err(Indeterminate::new(IndeterminacyReason::RankDeficient, what));
    }
    xtx.clone()
        .try_inverse()
        .ok_or_else(|| Indeterminate::new(IndeterminacyReason::RankDeficient, what))
}

/// Finish a fit given coefficients and residuals.
///
/// `bread` is (X'X)⁻¹ for the design `x` whose rows enter the meat; for
/// 2SLS that is the projected design while residuals use the original one.
pub fn sandwich_fit(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    beta: DVector<f64>,
    residuals: DVector<f64>,
    bread: &DMatrix<f64>,
    cov: &CovarianceKind,
    opts: FitOptions,
) -> Result<OlsFit, Indeterminate> {
    let n = x.nrows();
    let k = x.ncols() + opts.df_absorbed;
    if n <= k {
        return Err(Indeterminate::new(
            IndeterminacyReason::InsufficientData,
            format!("{n} observations for {k} parameters"),
        ));
    }
    let p = x.ncols();
    let n_f = n as f64;
    let k_f = k as f64;

    let (meat, correction, df) = match cov {
        CovarianceKind::Hc1 => {
            let mut meat = DMatrix::zeros(p, p);
            for i in 0..n {
                let e2 = residuals[i] * residuals[i];
                for a in 0..p {
                    for b in 0..p {
                        meat[(a, b)] += x[(i, a)] * x[(i, b)] * e2;
                    }
                }
            }
            (meat, n_f / (n_f - k_f), n_f - k_f)
        }
        CovarianceKind::Cluster(cluster_of) => {
            let mut scores: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
            for i in 0..n {
                let s = scores.entry(cluster_of[i]).or_insert_with(|| vec![0.0; p]);
                for j in 0..p {
                    s[j] += x[(i, j)] * residuals[i];
                }
            }
            let mut meat = DMatrix::zeros(p, p);
            for s in scores.values() {
                for a in 0..p {
                    for b in 0..p {
                        meat[(a, b)] += s[a] * s[b];
                    }
                }
            }
            let g = scores.len() as f64;
            let correction = if g > 1.0 { (g / (g - 1.0)) * ((n_f - 1.0) / (n_f - k_f)) } else { 1.0 };
            (meat, correction, (g - 1.0).max(1.0))
        }
    };
    let vcov = (bread * meat * bread) * correction;

    let rss: f64 = residuals.iter().map(|r| r * r).sum();
    let tss: f64 = if opts.centered_r2 {
        let mean = y.mean();
        y.iter().map(|v| (v - mean).powi(2)).sum()
    } else {
        y.iter().map(|v| v * v).sum()
    };
    let r2 = if tss > 0.0 { 1.0 - rss / tss } else { 0.0 };

    Ok(OlsFit { beta, residuals, vcov, n_obs: n, df, r2 })
}

/// Residual sum of squares from regressing `y` on `x` (plain OLS).
pub fn rss_of(x: &DMatrix<f64>, y: &DVector<f64>, tolerance: f64) -> Result<f64, Indeterminate> {
    if x.ncols() == 0 {
        return Ok(y.iter().map(|v| v * v).sum());
    }
    let xtx = x.transpose() * x;
    let inv = invert(&xtx, tolerance, "first-stage regressors are collinear")?;
    let beta = inv * (x.transpose() * y);
    let resid = y - x * beta;
    Ok(resid.iter().map(|r| r * r).sum())
}

// ── Fixed effects ────────────────────────────────────────────────────────────

/// Two-way (unit, year) fixed-effect absorber.
///
/// One demeaning pass is exact for a single dimension or a balanced
/// panel; unbalanced panels iterate until every group mean is below
/// `tolerance`.
#[derive(Debug, Clone)]
pub struct FixedEffects {
    groups:     Vec<Vec<Vec<usize>>>,
    n:          usize,
    tolerance:  f64,
    max_iter:   usize,
    df_absorbed: usize,
}

impl FixedEffects {
    /// `unit_of[i]` and `year_of[i]` are dense 0-based indices.
    pub fn two_way(unit_of: &[usize], year_of: &[usize], tolerance: f64, max_iter: usize) -> Self {
        let n = unit_of.len();
        let index = |of: &[usize]| {
            let levels = of.iter().copied().max().map_or(0, |m| m + 1);
            let mut idx = vec![Vec::new(); levels];
            for (i, &g) in of.iter().enumerate() {
                idx[g].push(i);
            }
            idx.retain(|g| !g.is_empty());
            idx
        };
        let units = index(unit_of);
        let years = index(year_of);
        let df_absorbed = (units.len() + years.len()).saturating_sub(1);
        Self { groups: vec![units, years], n, tolerance, max_iter, df_absorbed }
    }

    pub fn df_absorbed(&self) -> usize {
        self.df_absorbed
    }

    pub fn partial_out(&self, v: &[f64]) -> Result<Vec<f64>, Indeterminate> {
        debug_assert_eq!(v.len(), self.n);
        let mut resid = v.to_vec();
        let scale = v.iter().fold(0.0_f64, |m, x| m.max(x.abs())).max(1.0);
        for _ in 0..self.max_iter {
            for dim in &self.groups {
                for members in dim {
                    let mean = members.iter().map(|&i| resid[i]).sum::<f64>() / members.len() as f64;
                    for &i in members {
                        resid[i] -= mean;
                    }
                }
            }
            if self.max_group_mean(&resid) <= self.tolerance * scale {
                return Ok(resid);
            }
        }
        Err(Indeterminate::new(
            IndeterminacyReason::NonConvergence,
            format!("fixed-effect absorption did not converge in {} iterations", self.max_iter),
        ))
    }

    /// Absorb fixed effects from every column of `x`.
    pub fn partial_out_matrix(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, Indeterminate> {
        let mut out = DMatrix::zeros(x.nrows(), x.ncols());
        for j in 0..x.ncols() {
            let col: Vec<f64> = x.column(j).iter().copied().collect();
            let dm = self.partial_out(&col)?;
            out.set_column(j, &DVector::from_vec(dm));
        }
        Ok(out)
    }

    fn max_group_mean(&self, v: &[f64]) -> f64 {
        self.groups
            .iter()
            .flatten()
            .map(|members| (members.iter().map(|&i| v[i]).sum::<f64>() / members.len() as f64).abs())
            .fold(0.0, f64::max)
    }
}

// ── Dense indexing ───────────────────────────────────────────────────────────

/// Map arbitrary ordered keys to dense indices in sorted key order.
pub fn dense_index<K: Ord + Clone>(keys: &[K]) -> Vec<usize> {
    let mut levels: BTreeMap<K, usize> = BTreeMap::new();
    for k in keys {
        levels.entry(k.clone()).or_insert(0);
    }
    for (i, v) in levels.values_mut().enumerate() {
        *v = i;
    }
    keys.iter().map(|k| levels[k]).collect()
}

// ── Inference ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Inference {
    pub p_value:  Option<f64>,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
}

/// Two-sided t test and CI for `coef` with standard error `se`.
pub fn t_inference(coef: f64, se: f64, df: f64, alpha: f64) -> Inference {
    if !coef.is_finite() || !se.is_finite() || se < 0.0 {
        return Inference { p_value: None, ci_lower: None, ci_upper: None };
    }
    if se == 0.0 {
        let p = if coef == 0.0 { 1.0 } else { 0.0 };
        return Inference { p_value: Some(p), ci_lower: Some(coef), ci_upper: Some(coef) };
    }
    let dist = match StudentsT::new(0.0, 1.0, df.max(1.0)) {
        Ok(d) => d,
        Err(_) => return normal_inference(coef, se, alpha),
    };
    let t = coef / se;
    let p = (2.0 * dist.sf(t.abs())).clamp(0.0, 1.0);
    let crit = dist.inverse_cdf(1.0 - alpha / 2.0);
    Inference { p_value: Some(p), ci_lower: Some(coef - crit * se), ci_upper: Some(coef + crit * se) }
}

/// Normal-reference CI around `coef`; p-value from the z statistic.
pub fn normal_inference(coef: f64, se: f64, alpha: f64) -> Inference {
    if !coef.is_finite() || !se.is_finite() || se <= 0.0 {
        return Inference { p_value: None, ci_lower: None, ci_upper: None };
    }
    let Ok(normal) = Normal::new(0.0, 1.0) else {
        return Inference { p_value: None, ci_lower: None, ci_upper: None };
    };
    let z = coef / se;
    let p = (2.0 * normal.sf(z.abs())).clamp(0.0, 1.0);
    let crit = normal.inverse_cdf(1.0 - alpha / 2.0);
    Inference { p_value: Some(p), ci_lower: Some(coef - crit * se), ci_upper: Some(coef + crit * se) }
}

/// Critical value of the standard normal at `1 − alpha/2`.
pub fn normal_critical(alpha: f64) -> f64 {
    Normal::new(0.0, 1.0)
        .map(|n| n.inverse_cdf(1.0 - alpha / 2.0))
        .unwrap_or(1.96)
}
