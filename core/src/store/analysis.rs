//! Analysis job table queries.
//!
//! Every read and write that takes a tenant filters on it; an id owned by
//! another tenant behaves exactly like an id that does not exist.

use super::{format_ts, parse_ts, AnalysisStore};
use crate::{
    analysis::{Analysis, AnalysisStatus, Artifact},
    error::{EngineError, EngineResult},
    estimator::{EstimationResult, EstimationSummary},
    request::{AnalysisRequest, Method},
    types::AnalysisId,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const ANALYSIS_COLUMNS: &str = "id, tenant_id, status, method, request_params, result_summary,
     result_full, error_message, created_at, updated_at, started_at, completed_at";

/// Column values as stored; decoded outside the rusqlite row closure.
struct AnalysisRow {
    id:             String,
    tenant_id:      String,
    status:         String,
    method:         String,
    request_params: String,
    result_summary: Option<String>,
    result_full:    Option<String>,
    error_message:  Option<String>,
    created_at:     String,
    updated_at:     String,
    started_at:     Option<String>,
    completed_at:   Option<String>,
}

impl AnalysisRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id:             r.get(0)?,
            tenant_id:      r.get(1)?,
            status:         r.get(2)?,
            method:         r.get(3)?,
            request_params: r.get(4)?,
            result_summary: r.get(5)?,
            result_full:    r.get(6)?,
            error_message:  r.get(7)?,
            created_at:     r.get(8)?,
            updated_at:     r.get(9)?,
            started_at:     r.get(10)?,
            completed_at:   r.get(11)?,
        })
    }

    fn decode(self, artifacts: Vec<Artifact>) -> EngineResult<Analysis> {
        let status = AnalysisStatus::parse(&self.status).ok_or_else(|| {
            EngineError::Other(anyhow::anyhow!("unknown status '{}' on {}", self.status, self.id))
        })?;
        let method = Method::parse(&self.method).ok_or_else(|| {
            EngineError::Other(anyhow::anyhow!("unknown method '{}' on {}", self.method, self.id))
        })?;
        let request_params: AnalysisRequest = serde_json::from_str(&self.request_params)?;
        let result_summary: Option<EstimationSummary> = self
            .result_summary
            .as_deref()
            .map(serde_json::from_str::<EstimationSummary>)
            .transpose()?;
        let result_full: Option<EstimationResult> = self
            .result_full
            .as_deref()
            .map(serde_json::from_str::<EstimationResult>)
            .transpose()?;
        Ok(Analysis {
            id: self.id,
            tenant_id: self.tenant_id,
            status,
            method,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            request_params,
            result_summary,
            result_full,
            error_message: self.error_message,
            artifacts,
        })
    }
}

impl AnalysisStore {
    // ── Submission ─────────────────────────────────────────────

    pub fn insert_analysis(&self, analysis: &Analysis) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO analysis (id, tenant_id, status, method, request_params,
                                   created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                analysis.id,
                analysis.tenant_id,
                analysis.status.as_str(),
                analysis.method.as_str(),
                serde_json::to_string(&analysis.request_params)?,
                format_ts(analysis.created_at),
                format_ts(analysis.updated_at),
            ],
        )?;
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────

    /// Tenant-scoped lookup. `None` for unknown ids and foreign tenants alike.
    pub fn get_analysis(&self, id: &str, tenant_id: &str) -> EngineResult<Option<Analysis>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {ANALYSIS_COLUMNS} FROM analysis WHERE id=?1 AND tenant_id=?2"),
                params![id, tenant_id],
                AnalysisRow::from_row,
            )
            .optional()?;
        match row {
            Some(row) => {
                let artifacts = self.artifacts(id, tenant_id)?;
                Ok(Some(row.decode(artifacts)?))
            }
            None => Ok(None),
        }
    }

    /// Newest first.
    pub fn list_analyses(&self, tenant_id: &str, limit: usize) -> EngineResult<Vec<Analysis>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ANALYSIS_COLUMNS} FROM analysis WHERE tenant_id=?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![tenant_id, limit as i64], AnalysisRow::from_row)?;
        let mut raw = Vec::new();
        for r in rows {
            raw.push(r?);
        }
        raw.into_iter()
            .map(|row| {
                let artifacts = self.artifacts(&row.id, tenant_id)?;
                row.decode(artifacts)
            })
            .collect()
    }

    pub fn count_by_status(&self, status: AnalysisStatus) -> EngineResult<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM analysis WHERE status=?1",
            params![status.as_str()],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    // ── Worker transitions ─────────────────────────────────────

    /// Atomically move the oldest queued analysis to `running`.
    ///
    /// The status guard in the outer `WHERE` makes concurrent claimers on
    /// separate connections safe: exactly one of them updates the row.
    pub fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> EngineResult<Option<Analysis>> {
        let claimed: Option<(String, String)> = self
            .conn
            .query_row(
                "UPDATE analysis
                 SET status='running', worker_id=?1, started_at=?2, updated_at=?2
                 WHERE id = (SELECT id FROM analysis WHERE status='queued'
                             ORDER BY created_at ASC, rowid ASC LIMIT 1)
                   AND status='queued'
                 RETURNING id, tenant_id",
                params![worker_id, format_ts(now)],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match claimed {
            Some((id, tenant_id)) => self.get_analysis(&id, &tenant_id),
            None => Ok(None),
        }
    }

    /// Persist the request as actually run (e.g. with auto-selected controls).
    pub fn update_request_params(
        &self,
        id: &str,
        request: &AnalysisRequest,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let n = self.conn.execute(
            "UPDATE analysis SET request_params=?1, updated_at=?2
             WHERE id=?3 AND status='running'",
            params![serde_json::to_string(request)?, format_ts(now), id],
        )?;
        self.ensure_transitioned(id, n, AnalysisStatus::Running)
    }

    pub fn record_success(
        &self,
        id: &str,
        summary: &EstimationSummary,
        full: &EstimationResult,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let n = self.conn.execute(
            "UPDATE analysis
             SET status='success', result_summary=?1, result_full=?2,
                 completed_at=?3, updated_at=?3
             WHERE id=?4 AND status='running'",
            params![
                serde_json::to_string(summary)?,
                serde_json::to_string(full)?,
                format_ts(now),
                id
            ],
        )?;
        self.ensure_transitioned(id, n, AnalysisStatus::Success)
    }

    pub fn record_failure(&self, id: &str, message: &str, now: DateTime<Utc>) -> EngineResult<()> {
        let n = self.conn.execute(
            "UPDATE analysis
             SET status='failed', error_message=?1, completed_at=?2, updated_at=?2
             WHERE id=?3 AND status='running'",
            params![message, format_ts(now), id],
        )?;
        self.ensure_transitioned(id, n, AnalysisStatus::Failed)
    }

    /// Restart sweep: fail `running` jobs started before `cutoff`.
    pub fn fail_stale_running(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<AnalysisId>> {
        let mut stmt = self.conn.prepare(
            "UPDATE analysis
             SET status='failed', error_message=?1, completed_at=?2, updated_at=?2
             WHERE status='running' AND started_at < ?3
             RETURNING id",
        )?;
        let rows = stmt.query_map(params![message, format_ts(now), format_ts(cutoff)], |r| r.get(0))?;
        let mut ids = Vec::new();
        for r in rows {
            ids.push(r?);
        }
        Ok(ids)
    }

    fn ensure_transitioned(&self, id: &str, updated: usize, to: AnalysisStatus) -> EngineResult<()> {
        if updated == 1 {
            return Ok(());
        }
        let from: Option<String> = self
            .conn
            .query_row("SELECT status FROM analysis WHERE id=?1", params![id], |r| r.get(0))
            .optional()?;
        match from {
            Some(from) => Err(EngineError::InvalidTransition {
                analysis_id: id.to_string(),
                from,
                to: to.as_str().to_string(),
            }),
            None => Err(EngineError::NotFound { analysis_id: id.to_string() }),
        }
    }

    // ── Artifacts ──────────────────────────────────────────────

    pub fn attach_artifact(
        &self,
        id: &str,
        tenant_id: &str,
        kind: &str,
        path: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let n = self.conn.execute(
            "INSERT INTO analysis_artifact (analysis_id, tenant_id, kind, path, created_at)
             SELECT id, tenant_id, ?3, ?4, ?5 FROM analysis WHERE id=?1 AND tenant_id=?2",
            params![id, tenant_id, kind, path, format_ts(now)],
        )?;
        if n == 0 {
            return Err(EngineError::NotFound { analysis_id: id.to_string() });
        }
        Ok(())
    }

    pub fn artifacts(&self, id: &str, tenant_id: &str) -> EngineResult<Vec<Artifact>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, path, created_at FROM analysis_artifact
             WHERE analysis_id=?1 AND tenant_id=?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![id, tenant_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
        })?;
        let mut result = Vec::new();
        for r in rows {
            let (kind, path, created_at) = r?;
            result.push(Artifact { kind, path, created_at: parse_ts(&created_at)? });
        }
        Ok(result)
    }
}
