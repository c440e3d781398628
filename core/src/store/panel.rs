//! Panel observation tables and the SQLite-backed panel source.

use super::AnalysisStore;
use crate::{
    error::EngineResult,
    panel::{Observation, PanelQuery, PanelSource},
    request::Scope,
    types::{UnitId, Year},
};
use rusqlite::{params, ToSql};
use std::collections::{BTreeMap, BTreeSet};

impl AnalysisStore {
    pub fn upsert_unit(&self, tenant_id: &str, unit_id: &str, scope: Scope) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO panel_unit (tenant_id, unit_id, scope) VALUES (?1, ?2, ?3)
             ON CONFLICT (tenant_id, unit_id) DO UPDATE SET scope=excluded.scope",
            params![tenant_id, unit_id, scope.as_str()],
        )?;
        Ok(())
    }

    /// Store every variable of one observation; unknown units register as municipal.
    pub fn upsert_observation(&self, tenant_id: &str, obs: &Observation) -> EngineResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO panel_unit (tenant_id, unit_id, scope) VALUES (?1, ?2, 'municipal')",
            params![tenant_id, obs.unit_id],
        )?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO panel_observation (tenant_id, unit_id, year, variable, value, treatment_year)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (tenant_id, unit_id, year, variable)
             DO UPDATE SET value=COALESCE(excluded.value, value),
                           treatment_year=COALESCE(excluded.treatment_year, treatment_year)",
        )?;
        for (variable, value) in &obs.values {
            stmt.execute(params![tenant_id, obs.unit_id, obs.year, variable, value, obs.treatment_year])?;
        }
        Ok(())
    }

    /// Bulk load inside one transaction. Returns the number of observations written.
    pub fn ingest_panel(
        &self,
        tenant_id: &str,
        units: &[(UnitId, Scope)],
        observations: &[Observation],
    ) -> EngineResult<usize> {
        let tx = self.conn.unchecked_transaction()?;
        for (unit_id, scope) in units {
            self.upsert_unit(tenant_id, unit_id, *scope)?;
        }
        for obs in observations {
            self.upsert_observation(tenant_id, obs)?;
        }
        tx.commit()?;
        log::info!(
            "ingested {} units and {} observations for tenant {tenant_id}",
            units.len(),
            observations.len()
        );
        Ok(observations.len())
    }

    pub fn units_in_scope(&self, tenant_id: &str, scope: Scope) -> EngineResult<Vec<UnitId>> {
        let mut stmt = self.conn.prepare(
            "SELECT unit_id FROM panel_unit WHERE tenant_id=?1 AND scope=?2 ORDER BY unit_id",
        )?;
        let rows = stmt.query_map(params![tenant_id, scope.as_str()], |r| r.get(0))?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?);
        }
        Ok(result)
    }

    /// Observations for the query's units and columns inside its window.
    pub fn observations(&self, tenant_id: &str, query: &PanelQuery) -> EngineResult<Vec<Observation>> {
        let units: BTreeSet<&str> = query.unit_ids.iter().map(String::as_str).collect();
        let columns: BTreeSet<&str> = query.columns.iter().map(String::as_str).collect();
        if units.is_empty() {
            return Ok(Vec::new());
        }

        // Units bind after the three fixed parameters, so the primary key
        // (tenant_id, unit_id, year, variable) drives the lookup.
        let placeholders: Vec<String> = (0..units.len()).map(|i| format!("?{}", i + 4)).collect();
        let sql = format!(
            "SELECT unit_id, year, variable, value, treatment_year FROM panel_observation
             WHERE tenant_id=?1 AND year BETWEEN ?2 AND ?3 AND unit_id IN ({})
             ORDER BY unit_id, year, variable",
            placeholders.join(", ")
        );
        let mut bound: Vec<&dyn ToSql> = vec![
            &tenant_id as &dyn ToSql,
            &query.window.year_start,
            &query.window.year_end,
        ];
        bound.extend(units.iter().map(|u| u as &dyn ToSql));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            bound.as_slice(),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Year>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<f64>>(3)?,
                    r.get::<_, Option<Year>>(4)?,
                ))
            },
        )?;

        let mut grouped: BTreeMap<(String, Year), Observation> = BTreeMap::new();
        for r in rows {
            let (unit_id, year, variable, value, treatment_year) = r?;
            let obs = grouped
                .entry((unit_id.clone(), year))
                .or_insert_with(|| Observation {
                    unit_id,
                    year,
                    values: BTreeMap::new(),
                    treatment_year: None,
                });
            if obs.treatment_year.is_none() {
                obs.treatment_year = treatment_year;
            }
            if columns.contains(variable.as_str()) {
                obs.values.insert(variable, value);
            }
        }
        Ok(grouped.into_values().collect())
    }
}

/// Panel source over the `panel_observation` tables of a database file.
///
/// Holds only the path; each call opens its own connection, so one source
/// can be shared by every worker thread.
#[derive(Debug, Clone)]
pub struct SqlitePanelSource {
    path: String,
}

impl SqlitePanelSource {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl PanelSource for SqlitePanelSource {
    fn fetch(&self, tenant_id: &str, query: &PanelQuery) -> EngineResult<Vec<Observation>> {
        AnalysisStore::open(&self.path)?.observations(tenant_id, query)
    }

    fn candidate_units(&self, tenant_id: &str, scope: Scope) -> EngineResult<Vec<UnitId>> {
        AnalysisStore::open(&self.path)?.units_in_scope(tenant_id, scope)
    }
}
