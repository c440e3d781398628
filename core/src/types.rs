//! Shared primitive types used across the analysis engine.

/// A calendar year. Panels are annual.
pub type Year = i32;

/// A stable identifier for a geographic unit (municipality or state).
pub type UnitId = String;

/// The tenant that owns an analysis and its panel data.
pub type TenantId = String;

/// The canonical analysis identifier (uuid v4, hyphenated).
pub type AnalysisId = String;
