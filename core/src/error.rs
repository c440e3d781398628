use thiserror::Error;

use crate::types::AnalysisId;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Estimation failed: {0}")]
    EstimationFailure(String),

    #[error("timeout: analysis exceeded the {seconds}s worker limit")]
    Timeout { seconds: u64 },

    /// Also returned for ids owned by another tenant.
    #[error("Analysis '{analysis_id}' not found")]
    NotFound { analysis_id: AnalysisId },

    #[error("Analysis '{analysis_id}' is not finished (status: {status})")]
    NotReady { analysis_id: AnalysisId, status: String },

    #[error("Analysis '{analysis_id}' failed: {message}")]
    AnalysisFailed { analysis_id: AnalysisId, message: String },

    #[error("Analysis '{analysis_id}' cannot move from {from} to {to}")]
    InvalidTransition { analysis_id: AnalysisId, from: String, to: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
