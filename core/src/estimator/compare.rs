//! Compare: several strategies on one outcome, side by side.
//!
//! Produces the comparison table, a sign/significance consistency
//! assessment and a diagnostics-driven recommendation. The outcome's
//! headline numbers are those of the recommended strategy.

use super::{
    estimate_outcome, EstimationContext, IndeterminacyReason, Indeterminate, MethodEstimate,
    MethodPayload, OutcomeEstimate,
};
use crate::{panel::Panel, request::Method};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub method:      Method,
    /// Display label: "DiD", "IV (2SLS)", "Panel IV", ...
    pub label:       String,
    pub estimate:    Option<f64>,
    pub std_err:     Option<f64>,
    pub ci_lower:    Option<f64>,
    pub ci_upper:    Option<f64>,
    pub p_value:     Option<f64>,
    pub significant: bool,
    pub notes:       String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    Consistent,
    PartiallyConsistent,
    Inconsistent,
    NotAssessable,
}

impl Consistency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consistent          => "consistent",
            Self::PartiallyConsistent => "partially consistent",
            Self::Inconsistent        => "inconsistent",
            Self::NotAssessable       => "not assessable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonPayload {
    pub comparison_table:       Vec<ComparisonRow>,
    pub consistency:            Consistency,
    pub consistency_assessment: String,
    pub recommended_method:     Option<Method>,
    pub recommendation:         String,
    /// Full per-strategy results, payloads included.
    pub estimates:              Vec<OutcomeEstimate>,
}

/// Tie-break order when no diagnostic separates the candidates.
const PREFERENCE: [Method; 6] = [
    Method::PanelIv,
    Method::Iv,
    Method::EventStudy,
    Method::Did,
    Method::AugmentedScm,
    Method::Scm,
];

pub fn estimate(
    panel: &Panel,
    outcome: &str,
    ctx: &EstimationContext<'_>,
    methods: &[Method],
) -> Result<MethodEstimate, Indeterminate> {
    let alpha = ctx.config.significance_level;
    let methods: Vec<Method> = methods.iter().copied().filter(|m| *m != Method::Compare).collect();
    if methods.len() < 2 {
        return Err(Indeterminate::insufficient("compare needs at least two strategies"));
    }

    let estimates: Vec<OutcomeEstimate> = methods
        .iter()
        .map(|&m| estimate_outcome(m, panel, outcome, ctx, &[]))
        .collect();

    let comparison_table: Vec<ComparisonRow> = estimates
        .iter()
        .map(|e| ComparisonRow {
            method:      e.method,
            label:       e.method.label().to_string(),
            estimate:    e.coef,
            std_err:     e.std_err,
            ci_lower:    e.ci_lower,
            ci_upper:    e.ci_upper,
            p_value:     e.p_value,
            significant: e.is_significant(alpha),
            notes:       e.warnings.join("; "),
        })
        .collect();

    let (consistency, consistency_assessment) = assess_consistency(&estimates, alpha);
    let (recommended, recommendation) = recommend(&estimates, ctx.config.fe_material_change);
    log::debug!(
        "compare on '{outcome}': {} / recommended {:?}",
        consistency.as_str(),
        recommended
    );

    let mut warnings: Vec<String> = estimates
        .iter()
        .filter(|e| e.coef.is_none())
        .map(|e| format!("{}: {}", e.method.label(), e.warnings.first().map_or("no estimate", String::as_str)))
        .collect();

    let chosen = recommended.and_then(|m| estimates.iter().find(|e| e.method == m));
    let n_obs = estimates.iter().map(|e| e.n_obs).max().unwrap_or(0);
    let payload = ComparisonPayload {
        comparison_table,
        consistency,
        consistency_assessment,
        recommended_method: recommended,
        recommendation,
        estimates: estimates.clone(),
    };

    let Some(chosen) = chosen else {
        // Keep the table; the null headline is carried by a non-finite coef.
        warnings.insert(
            0,
            Indeterminate::new(
                IndeterminacyReason::InsufficientData,
                "no compared strategy produced an estimate",
            )
            .warning(),
        );
        return Ok(MethodEstimate {
            coef: f64::NAN,
            std_err: None,
            p_value: None,
            ci_lower: None,
            ci_upper: None,
            n_obs,
            r2: None,
            warnings,
            payload: Some(MethodPayload::Comparison(payload)),
        });
    };

    Ok(MethodEstimate {
        coef: chosen.coef.unwrap_or(f64::NAN),
        std_err: chosen.std_err,
        p_value: chosen.p_value,
        ci_lower: chosen.ci_lower,
        ci_upper: chosen.ci_upper,
        n_obs,
        r2: chosen.r2,
        warnings,
        payload: Some(MethodPayload::Comparison(payload)),
    })
}

fn assess_consistency(estimates: &[OutcomeEstimate], alpha: f64) -> (Consistency, String) {
    let usable: Vec<&OutcomeEstimate> = estimates.iter().filter(|e| e.coef.is_some()).collect();
    if usable.len() < 2 {
        return (
            Consistency::NotAssessable,
            format!(
                "not assessable: {} of {} strategies produced an estimate",
                usable.len(),
                estimates.len()
            ),
        );
    }
    let positive = usable.iter().filter(|e| e.coef.is_some_and(|c| c > 0.0)).count();
    let negative = usable.iter().filter(|e| e.coef.is_some_and(|c| c < 0.0)).count();
    let significant = usable.iter().filter(|e| e.is_significant(alpha)).count();
    let n = usable.len();

    if positive != n && negative != n {
        let text = format!(
            "inconsistent: signs disagree ({positive} positive, {negative} negative, {} zero)",
            n - positive - negative
        );
        return (Consistency::Inconsistent, text);
    }
    let direction = if positive == n { "positive" } else { "negative" };
    if significant == n || significant == 0 {
        let level = if significant == n { "significant" } else { "not significant" };
        (
            Consistency::Consistent,
            format!("consistent: all {n} estimates are {direction} and {level} at {alpha}"),
        )
    } else {
        (
            Consistency::PartiallyConsistent,
            format!(
                "partially consistent: all {n} estimates are {direction}, {significant} significant at {alpha}"
            ),
        )
    }
}

fn first_stage_f(estimate: &OutcomeEstimate) -> Option<f64> {
    match &estimate.payload {
        Some(MethodPayload::Iv(iv)) => iv.first_stage_f,
        _ => None,
    }
}

/// Reason a strategy is demoted, if any.
fn demotion(estimate: &OutcomeEstimate) -> Option<&'static str> {
    match &estimate.payload {
        Some(MethodPayload::Iv(iv)) if iv.weak_instrument => Some("weak instrument"),
        Some(MethodPayload::SyntheticControl(scm)) if scm.poor_fit => Some("poor pre-treatment fit"),
        Some(MethodPayload::EventStudy(es)) if es.significant_pre_periods > 0 => {
            Some("significant pre-treatment coefficients")
        }
        _ => None,
    }
}

fn recommend(estimates: &[OutcomeEstimate], fe_material_change: f64) -> (Option<Method>, String) {
    let find = |m: Method| estimates.iter().find(|e| e.method == m && e.coef.is_some());

    let mut order: Vec<Method> = PREFERENCE.to_vec();
    let mut notes = Vec::new();
    if let (Some(iv), Some(panel_iv)) = (find(Method::Iv), find(Method::PanelIv)) {
        match (first_stage_f(iv), first_stage_f(panel_iv)) {
            (Some(pooled), Some(fe)) if pooled > 0.0 => {
                let change = (fe - pooled).abs() / pooled;
                if change > fe_material_change {
                    notes.push(format!(
                        "fixed effects change the first-stage F by {:.0}% ({pooled:.2} to {fe:.2}); Panel IV preferred over IV",
                        change * 100.0
                    ));
                } else {
                    notes.push(format!(
                        "fixed effects change the first-stage F by only {:.0}%; pooled IV is adequate",
                        change * 100.0
                    ));
                    order.swap(0, 1);
                }
            }
            _ => {}
        }
    }

    let ranked: Vec<&OutcomeEstimate> = order.iter().filter_map(|&m| find(m)).collect();
    for e in &ranked {
        if let Some(why) = demotion(e) {
            notes.push(format!("{} demoted: {why}", e.method.label()));
        }
    }

    let chosen = ranked
        .iter()
        .find(|e| demotion(e).is_none())
        .or_else(|| ranked.first())
        .map(|e| e.method);
    let text = match chosen {
        Some(m) if ranked.iter().all(|e| demotion(e).is_some()) => {
            notes.push(format!("every strategy carries a diagnostic warning; {} reported with caution", m.label()));
            notes.join("; ")
        }
        Some(m) => {
            notes.push(format!("{} recommended", m.label()));
            notes.join("; ")
        }
        None => "no strategy produced an estimate".to_string(),
    };
    (chosen, text)
}
