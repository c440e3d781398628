//! Client-side status polling.
//!
//! The server never pushes; clients poll with a status-dependent backoff:
//! an immediate first check, a short delay while queued, a longer one
//! while running, and nothing once the analysis is terminal.

use crate::{analysis::AnalysisStatus, config::PollingConfig, error::EngineResult};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub queued_delay:  Duration,
    pub running_delay: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::from_config(&PollingConfig::default())
    }
}

impl PollSchedule {
    pub fn from_config(config: &PollingConfig) -> Self {
        Self {
            queued_delay:  Duration::from_millis(config.queued_delay_ms),
            running_delay: Duration::from_millis(config.running_delay_ms),
        }
    }

    /// Delay before the first check.
    pub fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Delay before the next check, or `None` to stop polling.
    pub fn next_delay(&self, status: AnalysisStatus) -> Option<Duration> {
        match status {
            AnalysisStatus::Queued  => Some(self.queued_delay),
            AnalysisStatus::Running => Some(self.running_delay),
            AnalysisStatus::Success | AnalysisStatus::Failed => None,
        }
    }
}

/// Poll `fetch` until it reports a terminal status or `max_wait` of
/// scheduled delay has elapsed. Returns the last status seen.
///
/// `sleep` is injected so callers (and tests) control real time.
pub fn wait_for_terminal<F, S>(
    mut fetch: F,
    schedule: &PollSchedule,
    mut sleep: S,
    max_wait: Duration,
) -> EngineResult<AnalysisStatus>
where
    F: FnMut() -> EngineResult<AnalysisStatus>,
    S: FnMut(Duration),
{
    let mut waited = schedule.initial_delay();
    sleep(waited);
    loop {
        let status = fetch()?;
        let Some(delay) = schedule.next_delay(status) else {
            return Ok(status);
        };
        if waited + delay > max_wait {
            log::debug!("polling gave up after {waited:?} with status {status}");
            return Ok(status);
        }
        sleep(delay);
        waited += delay;
    }
}
