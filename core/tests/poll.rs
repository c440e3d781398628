//! Client polling schedule tests.

use port_impact_core::{
    analysis::AnalysisStatus,
    config::PollingConfig,
    error::{EngineError, EngineResult},
    poll::{wait_for_terminal, PollSchedule},
};
use std::time::Duration;

#[test]
fn delays_follow_status() {
    let schedule = PollSchedule::default();
    assert_eq!(schedule.initial_delay(), Duration::ZERO);
    assert_eq!(schedule.next_delay(AnalysisStatus::Queued), Some(Duration::from_secs(2)));
    assert_eq!(schedule.next_delay(AnalysisStatus::Running), Some(Duration::from_secs(5)));
    assert_eq!(schedule.next_delay(AnalysisStatus::Success), None);
    assert_eq!(schedule.next_delay(AnalysisStatus::Failed), None);
}

#[test]
fn schedule_reads_config() {
    let schedule = PollSchedule::from_config(&PollingConfig { queued_delay_ms: 10, running_delay_ms: 30 });
    assert_eq!(schedule.next_delay(AnalysisStatus::Queued), Some(Duration::from_millis(10)));
    assert_eq!(schedule.next_delay(AnalysisStatus::Running), Some(Duration::from_millis(30)));
}

/// Immediate first check, then queued and running delays until terminal.
#[test]
fn waits_until_terminal() {
    let mut statuses = vec![
        AnalysisStatus::Queued,
        AnalysisStatus::Running,
        AnalysisStatus::Running,
        AnalysisStatus::Success,
    ]
    .into_iter();
    let mut slept = Vec::new();

    let status = wait_for_terminal(
        || Ok(statuses.next().unwrap_or(AnalysisStatus::Success)),
        &PollSchedule::default(),
        |d| slept.push(d),
        Duration::from_secs(60),
    )
    .expect("poll");

    assert_eq!(status, AnalysisStatus::Success);
    let secs: Vec<u64> = slept.iter().map(Duration::as_secs).collect();
    assert_eq!(secs, vec![0, 2, 5, 5]);
}

/// Polling stops once the next delay would exceed the budget.
#[test]
fn gives_up_after_max_wait() {
    let mut fetches = 0;
    let mut slept = Duration::ZERO;
    let status = wait_for_terminal(
        || {
            fetches += 1;
            Ok(AnalysisStatus::Running)
        },
        &PollSchedule::default(),
        |d| slept += d,
        Duration::from_secs(12),
    )
    .expect("poll");

    assert_eq!(status, AnalysisStatus::Running);
    assert_eq!(slept, Duration::from_secs(10));
    assert_eq!(fetches, 3);
}

#[test]
fn fetch_errors_propagate() {
    let result: EngineResult<AnalysisStatus> = wait_for_terminal(
        || Err(EngineError::NotFound { analysis_id: "gone".into() }),
        &PollSchedule::default(),
        |_| {},
        Duration::from_secs(60),
    );
    assert!(matches!(result, Err(EngineError::NotFound { .. })));
}
