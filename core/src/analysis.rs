//! The persisted job entity and its lifecycle.
//!
//! `queued → running → {success | failed}`. Terminal states are final;
//! resubmission creates a new analysis.

use crate::{
    estimator::{EstimationResult, EstimationSummary},
    request::{AnalysisRequest, Method},
    types::{AnalysisId, TenantId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued  => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed  => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued"  => Some(Self::Queued),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed"  => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn can_transition(&self, to: AnalysisStatus) -> bool {
        matches!(
            (self, to),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Success)
                | (Self::Running, Self::Failed)
        )
    }
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File produced from a finished analysis (report, chart, export).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind:       String,
    pub path:       String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub id:             AnalysisId,
    pub tenant_id:      TenantId,
    pub status:         AnalysisStatus,
    pub method:         Method,
    pub created_at:     DateTime<Utc>,
    pub updated_at:     DateTime<Utc>,
    pub started_at:     Option<DateTime<Utc>>,
    pub completed_at:   Option<DateTime<Utc>>,
    pub request_params: AnalysisRequest,
    pub result_summary: Option<EstimationSummary>,
    pub result_full:    Option<EstimationResult>,
    pub error_message:  Option<String>,
    pub artifacts:      Vec<Artifact>,
}

impl Analysis {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
