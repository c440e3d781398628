//! Event-study tests.
//!
//! Tests cover: the omitted reference period, the relative-time series,
//! the post-period summary effect and the configurable reference.

use port_impact_core::{
    config::EngineConfig,
    estimator::{EventStudyPayload, MethodPayload, OutcomeEstimate},
    orchestrator::run_analysis,
    request::{Method, Window},
    simulate::{simulate, SimulationSpec},
};

const TENANT: &str = "acme";

fn estimate(config: &EngineConfig, window: Option<Window>) -> OutcomeEstimate {
    let sim = simulate(&SimulationSpec::default());
    let mut request = sim.request(Method::EventStudy);
    if let Some(w) = window {
        request.window = w;
    }
    let source = sim.into_source(TENANT);
    run_analysis(&source, TENANT, request, config, |_| {})
        .expect("run analysis")
        .outcomes
        .remove(0)
}

fn payload(est: &OutcomeEstimate) -> &EventStudyPayload {
    match &est.payload {
        Some(MethodPayload::EventStudy(p)) => p,
        other => panic!("expected an event-study payload, got {other:?}"),
    }
}

/// The reference period is reported with a coefficient of exactly zero
/// and no inference.
#[test]
fn reference_period_is_exactly_zero() {
    let est = estimate(&EngineConfig::default(), None);
    let p = payload(&est);

    assert_eq!(p.reference_period, -1);
    let reference = p.point(-1).expect("reference point in series");
    assert!(reference.is_reference);
    assert_eq!(reference.coef, 0.0);
    assert!(reference.std_err.is_none() && reference.p_value.is_none());
    assert_eq!(p.series.iter().filter(|pt| pt.is_reference).count(), 1);
}

/// 2010..=2015 treated in 2013 spans relative times -3..=2, in order.
#[test]
fn series_covers_relative_times() {
    let est = estimate(&EngineConfig::default(), None);
    let p = payload(&est);

    let times: Vec<i32> = p.series.iter().map(|pt| pt.relative_time).collect();
    assert_eq!(times, vec![-3, -2, -1, 0, 1, 2]);
    assert_eq!(p.post_periods, 3);
    for pt in p.series.iter().filter(|pt| !pt.is_reference) {
        assert!(pt.std_err.is_some(), "t={} lacks a standard error", pt.relative_time);
    }
}

/// Post-period coefficients and the summary effect sit near the
/// simulated effect; the summary is the mean of the post coefficients.
#[test]
fn summary_effect_averages_post_periods() {
    let est = estimate(&EngineConfig::default(), None);
    let p = payload(&est);
    let effect = SimulationSpec::default().effect;

    let coef = est.coef.expect("event study estimable");
    let post: Vec<f64> = p.series.iter().filter(|pt| pt.relative_time >= 0).map(|pt| pt.coef).collect();
    let mean = post.iter().sum::<f64>() / post.len() as f64;
    assert!((coef - mean).abs() < 1e-9, "summary {coef} differs from post mean {mean}");
    assert!((coef - effect).abs() < 0.3, "coef {coef} too far from simulated effect {effect}");
    let p_value = est.p_value.expect("p-value");
    assert!((0.0..=1.0).contains(&p_value));
}

/// The reference period follows configuration.
#[test]
fn reference_period_is_configurable() {
    let mut config = EngineConfig::default();
    config.estimation.reference_period = -2;
    let est = estimate(&config, None);
    let p = payload(&est);

    assert_eq!(p.reference_period, -2);
    assert_eq!(p.point(-2).map(|pt| (pt.coef, pt.is_reference)), Some((0.0, true)));
    assert!(p.point(-1).is_some_and(|pt| !pt.is_reference));
}

/// A window that starts at treatment has no reference period to omit.
#[test]
fn missing_reference_period_gives_null_coefficient() {
    let est = estimate(&EngineConfig::default(), Some(Window::new(2013, 2015)));

    assert!(est.coef.is_none());
    assert!(
        est.warnings.first().is_some_and(|w| w.starts_with("insufficient data") && w.contains("reference period")),
        "warnings: {:?}",
        est.warnings
    );
}
