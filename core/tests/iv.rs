//! Instrumental-variables tests (pooled 2SLS and Panel IV).
//!
//! Tests cover: first-stage diagnostics, the weak-instrument warning,
//! fixed-effects absorption, intensity treatments and the indeterminate
//! paths (no variation in the instrument, single-year data).

use port_impact_core::{
    config::EngineConfig,
    estimator::{IvPayload, MethodPayload, OutcomeEstimate},
    orchestrator::run_analysis,
    request::{AnalysisRequest, Method, Window},
    simulate::{simulate, SimulatedPanel, SimulationSpec, OUTCOME_GDP, TONNAGE},
};

const TENANT: &str = "acme";

fn strong_panel() -> SimulatedPanel {
    simulate(&SimulationSpec { instrument_strength: 4.0, ..SimulationSpec::default() })
}

fn estimate(sim: SimulatedPanel, request: AnalysisRequest, config: &EngineConfig) -> OutcomeEstimate {
    let source = sim.into_source(TENANT);
    run_analysis(&source, TENANT, request, config, |_| {})
        .expect("run analysis")
        .outcomes
        .remove(0)
}

fn payload(est: &OutcomeEstimate) -> &IvPayload {
    match &est.payload {
        Some(MethodPayload::Iv(p)) => p,
        other => panic!("expected an IV payload, got {other:?}"),
    }
}

/// A strong instrument: F is reported, above the threshold, no warning.
#[test]
fn strong_instrument_reports_first_stage() {
    let sim = strong_panel();
    let request = sim.request(Method::Iv);
    let est = estimate(sim, request, &EngineConfig::default());

    assert!(est.coef.is_some(), "IV should be estimable: {:?}", est.warnings);
    let p = payload(&est);
    let f = p.first_stage_f.expect("first-stage F");
    assert!(f > 10.0, "expected a strong first stage, got F = {f}");
    assert!(!p.weak_instrument);
    assert!(!p.fixed_effects);
    assert!(p.first_stage_coef > 0.0, "instrument raises treatment in the simulation");
    assert!((0.0..=1.0).contains(&p.partial_r2));
    assert!(
        est.warnings.iter().all(|w| !w.starts_with("weak instrument")),
        "warnings: {:?}",
        est.warnings
    );
}

/// Below the configured F threshold the estimate is still reported, with
/// a weak-instrument warning alongside it.
#[test]
fn weak_instrument_warns_but_keeps_estimate() {
    let sim = strong_panel();
    let request = sim.request(Method::Iv);
    let mut config = EngineConfig::default();
    config.estimation.weak_instrument_f = 1e12;
    let est = estimate(sim, request, &config);

    assert!(est.coef.is_some(), "weak instrument must not withhold the estimate");
    assert!(payload(&est).weak_instrument);
    assert!(
        est.warnings.iter().any(|w| w.starts_with("weak instrument")),
        "warnings: {:?}",
        est.warnings
    );
}

/// Panel IV absorbs unit and year effects and recovers the simulated effect.
#[test]
fn panel_iv_absorbs_fixed_effects() {
    let sim = strong_panel();
    let effect = sim.spec.effect;
    let request = sim.request(Method::PanelIv);
    let est = estimate(sim, request, &EngineConfig::default());

    let coef = est.coef.expect("Panel IV estimable");
    assert!((coef - effect).abs() < 0.5, "coef {coef} too far from simulated effect {effect}");
    let p = payload(&est);
    assert!(p.fixed_effects);
    assert!(p.first_stage_f.is_some());
    assert_eq!(p.endogenous, "treatment_indicator");
    assert_eq!(p.covariance, "cluster-robust (unit)");
}

/// An intensity column can stand in for the binary indicator.
#[test]
fn treatment_variable_replaces_indicator() {
    let sim = strong_panel();
    let request = sim.request(Method::Iv).with_treatment_variable(TONNAGE);
    let est = estimate(sim, request, &EngineConfig::default());

    assert!(est.coef.is_some(), "warnings: {:?}", est.warnings);
    assert_eq!(payload(&est).endogenous, TONNAGE);
}

/// A constant instrument carries no variation: rank-deficient, null coef.
#[test]
fn constant_instrument_is_rank_deficient() {
    let mut sim = strong_panel();
    for obs in &mut sim.observations {
        if let Some(v) = obs.values.get_mut("port_capacity_shock") {
            *v = Some(1.0);
        }
    }
    let request = sim.request(Method::Iv);
    let est = estimate(sim, request, &EngineConfig::default());

    assert!(est.coef.is_none());
    assert!(
        est.warnings.first().is_some_and(|w| w.starts_with("rank-deficient design")),
        "warnings: {:?}",
        est.warnings
    );
}

/// Pooled IV on a single year has no pre/post contrast.
#[test]
fn single_year_is_insufficient() {
    let sim = strong_panel();
    let mut request = sim.request(Method::Iv);
    request.window = Window::new(2013, 2013);
    let est = estimate(sim, request, &EngineConfig::default());

    assert!(est.coef.is_none());
    assert!(
        est.warnings.first().is_some_and(|w| w.starts_with("insufficient data")),
        "warnings: {:?}",
        est.warnings
    );
}

/// Requests without an instrument never reach the estimator.
#[test]
fn iv_without_instrument_is_rejected() {
    let sim = strong_panel();
    let mut request = sim.request(Method::Iv);
    request.instrument = None;
    let source = sim.into_source(TENANT);

    let err = run_analysis(&source, TENANT, request, &EngineConfig::default(), |_| {})
        .expect_err("missing instrument");
    assert!(err.to_string().contains("requires an instrument"), "got {err}");
}
