//! Panel builder tests.
//!
//! Tests cover: rectangular output, null preservation, treatment
//! indicator construction, duplicate merging, tenant scoping and the
//! empty-panel error.

use port_impact_core::{
    error::EngineError,
    panel::{InMemoryPanelSource, Observation, PanelBuilder, TreatmentAssignment},
    request::Window,
};
use std::collections::{BTreeMap, BTreeSet};

const TENANT: &str = "acme";
const GDP: &str = "gdp_per_capita";
const POP: &str = "population";

fn obs(unit: &str, year: i32, gdp: Option<f64>) -> Observation {
    Observation {
        unit_id:        unit.to_string(),
        year,
        values:         BTreeMap::from([(GDP.to_string(), gdp)]),
        treatment_year: None,
    }
}

fn ids(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn assignment(treated: &[&str], year: i32) -> TreatmentAssignment {
    TreatmentAssignment { treated_ids: ids(treated), treatment_year: year }
}

fn outcomes() -> Vec<String> {
    vec![GDP.to_string()]
}

/// Every requested unit gets one row per window year, sorted (unit, year),
/// and cells without data stay `None`.
#[test]
fn panel_is_rectangular_with_nulls() {
    let source = InMemoryPanelSource::new();
    source.add_observation(TENANT, obs("A", 2010, Some(1.0)));
    source.add_observation(TENANT, obs("A", 2012, Some(3.0)));
    source.add_observation(TENANT, obs("B", 2011, None));
    source.add_observation(TENANT, obs("B", 2012, Some(7.0)));
    // Outside the window; must not appear.
    source.add_observation(TENANT, obs("A", 2015, Some(99.0)));

    let rows = PanelBuilder::new(&source)
        .build(TENANT, &ids(&["A", "B"]), &outcomes(), &[], Window::new(2010, 2012), &assignment(&["A"], 2011))
        .expect("build panel");

    assert_eq!(rows.len(), 6, "2 units x 3 years, got {}", rows.len());
    let keys: Vec<(String, i32)> = rows.iter().map(|r| (r.unit_id.clone(), r.year)).collect();
    let expected: Vec<(String, i32)> = [("A", 2010), ("A", 2011), ("A", 2012), ("B", 2010), ("B", 2011), ("B", 2012)]
        .iter()
        .map(|(u, y)| (u.to_string(), *y))
        .collect();
    assert_eq!(keys, expected);

    assert_eq!(rows[0].outcome(GDP), Some(1.0));
    assert_eq!(rows[1].outcome(GDP), None, "missing A/2011 must be null, not zero");
    assert_eq!(rows[4].outcome(GDP), None, "explicit null for B/2011 must stay null");
    assert_eq!(rows[5].outcome(GDP), Some(7.0));
    assert!(rows.iter().all(|r| r.outcome(GDP) != Some(99.0)));
}

/// The indicator is 1 from the treatment year onwards for treated units
/// only, and never switches back off.
#[test]
fn treatment_indicator_is_monotone() {
    let source = InMemoryPanelSource::new();
    for year in 2010..=2015 {
        source.add_observation(TENANT, obs("T", year, Some(1.0)));
        source.add_observation(TENANT, obs("C", year, Some(1.0)));
    }
    let rows = PanelBuilder::new(&source)
        .build(TENANT, &ids(&["T", "C"]), &outcomes(), &[], Window::new(2010, 2015), &assignment(&["T"], 2013))
        .expect("build panel");

    for row in &rows {
        let expected = row.unit_id == "T" && row.year >= 2013;
        assert_eq!(
            row.treatment_indicator, expected,
            "indicator for {}/{} should be {expected}",
            row.unit_id, row.year
        );
    }
    let treated: Vec<bool> = rows.iter().filter(|r| r.unit_id == "T").map(|r| r.treatment_indicator).collect();
    assert!(treated.windows(2).all(|w| w[0] <= w[1]), "indicator must be monotone in year");
    assert!(rows.iter().filter(|r| r.unit_id == "C").all(|r| r.treatment_year.is_none()));
}

/// A unit-specific treatment year carried by the observations overrides
/// the request-level year.
#[test]
fn observed_treatment_year_overrides_request() {
    let source = InMemoryPanelSource::new();
    for year in 2010..=2015 {
        let mut o = obs("T", year, Some(1.0));
        o.treatment_year = Some(2012);
        source.add_observation(TENANT, o);
    }
    let rows = PanelBuilder::new(&source)
        .build(TENANT, &ids(&["T"]), &outcomes(), &[], Window::new(2010, 2015), &assignment(&["T"], 2014))
        .expect("build panel");

    let first_treated = rows.iter().find(|r| r.treatment_indicator).map(|r| r.year);
    assert_eq!(first_treated, Some(2012));
    assert!(rows.iter().all(|r| r.treatment_year == Some(2012)));
}

/// Duplicate unit-years merge: later non-null values win, and a later
/// null never erases an earlier value.
#[test]
fn duplicate_observations_merge() {
    let source = InMemoryPanelSource::new();
    source.add_observation(TENANT, obs("A", 2010, Some(1.0)));
    source.add_observation(TENANT, obs("A", 2010, Some(2.0)));
    source.add_observation(TENANT, obs("A", 2011, Some(5.0)));
    source.add_observation(TENANT, obs("A", 2011, None));

    let rows = PanelBuilder::new(&source)
        .build(TENANT, &ids(&["A"]), &outcomes(), &[], Window::new(2010, 2011), &assignment(&["A"], 2011))
        .expect("build panel");

    assert_eq!(rows.len(), 2, "duplicates must not add rows");
    assert_eq!(rows[0].outcome(GDP), Some(2.0));
    assert_eq!(rows[1].outcome(GDP), Some(5.0));
}

/// Covariates land in their own map; outcomes and covariates are both
/// reachable through `value`.
#[test]
fn covariates_are_carried_separately() {
    let source = InMemoryPanelSource::new();
    source.add_observation(
        TENANT,
        Observation {
            unit_id:        "A".into(),
            year:           2010,
            values:         BTreeMap::from([(GDP.to_string(), Some(4.0)), (POP.to_string(), Some(1_000.0))]),
            treatment_year: None,
        },
    );
    let rows = PanelBuilder::new(&source)
        .build(
            TENANT,
            &ids(&["A"]),
            &outcomes(),
            &[POP.to_string()],
            Window::new(2010, 2010),
            &assignment(&["A"], 2011),
        )
        .expect("build panel");

    assert_eq!(rows[0].covariate(POP), Some(1_000.0));
    assert_eq!(rows[0].outcome(POP), None);
    assert_eq!(rows[0].value(POP), Some(1_000.0));
    assert_eq!(rows[0].value(GDP), Some(4.0));
}

/// A panel without a single non-null value is `InsufficientData`.
#[test]
fn empty_panel_is_insufficient_data() {
    let source = InMemoryPanelSource::new();
    source.add_observation(TENANT, obs("A", 2010, None));

    let err = PanelBuilder::new(&source)
        .build(TENANT, &ids(&["A", "B"]), &outcomes(), &[], Window::new(2010, 2012), &assignment(&["A"], 2011))
        .expect_err("all-null panel must fail");
    assert!(matches!(err, EngineError::InsufficientData(_)), "got {err:?}");
}

/// Data stored under one tenant is invisible to another.
#[test]
fn other_tenant_sees_nothing() {
    let source = InMemoryPanelSource::new();
    source.add_observation(TENANT, obs("A", 2010, Some(1.0)));

    let err = PanelBuilder::new(&source)
        .build("globex", &ids(&["A"]), &outcomes(), &[], Window::new(2010, 2010), &assignment(&["A"], 2011))
        .expect_err("foreign tenant must not see acme data");
    assert!(matches!(err, EngineError::InsufficientData(_)), "got {err:?}");
}

/// An inverted window is a validation error.
#[test]
fn inverted_window_is_rejected() {
    let source = InMemoryPanelSource::new();
    source.add_observation(TENANT, obs("A", 2010, Some(1.0)));

    let err = PanelBuilder::new(&source)
        .build(TENANT, &ids(&["A"]), &outcomes(), &[], Window::new(2012, 2010), &assignment(&["A"], 2011))
        .expect_err("inverted window");
    assert!(matches!(err, EngineError::Validation(_)), "got {err:?}");
}
