//! Domain model and pure computations for venture-canvas project evaluation.
//!
//! Everything in this crate is storage- and transport-agnostic:
//! - [`model`] holds the project, canvas, hypothesis and experiment records.
//! - [`money`] parses free-text currency and formats it for display.
//! - [`metrics`] derives risk reduction, innovation risk and budgets per project.
//! - [`portfolio`] aggregates risk/return across projects.
//! - [`snapshot`] decodes and encodes the local-storage backup layout.

pub mod metrics;
pub mod model;
pub mod money;
pub mod portfolio;
pub mod snapshot;

pub use metrics::{
    apply_metrics, clamp_risk_weight, compute_project_metrics, group_experiments_by_hypothesis,
    innovation_risk_level, risk_reduction, risk_weights_valid, round_one_decimal,
    total_risk_weight, validate_risk_weights, HypothesisGroup, ProjectMetrics, REQUIRED_RISK_TOTAL,
};
pub use model::{
    BmcBlock, BmcCanvas, BmcRecord, Decision, Experiment, ExperimentType, Hypothesis,
    HypothesisOrigin, Insight, LearningCard, Project, ProjectIntake, ProjectStatus, TestCard,
};
pub use money::{
    cost_range_upper_bound, expected_return, format_compact_currency, format_money, parse_money,
};
pub use portfolio::{summarize_portfolio, PortfolioRow, PortfolioSummary, ReturnRange};
pub use snapshot::{
    BmcEntry, ExperimentsEntry, HypothesesEntry, LocalStorageBackup, SnapshotWarning,
    StorageSnapshot,
};

use time::{OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CanvasError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("parse error: {0}")]
    Parse(String),
}

/// Parses an RFC3339 timestamp and requires a UTC offset.
///
/// # Errors
/// Returns [`CanvasError::Validation`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CanvasError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CanvasError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CanvasError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CanvasError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CanvasError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| CanvasError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rfc3339_rejects_non_utc_offsets() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00Z").is_ok());
    }

    #[test]
    fn format_rfc3339_normalizes_to_utc() {
        let parsed = match OffsetDateTime::parse(
            "2026-02-07T14:00:00+02:00",
            &time::format_description::well_known::Rfc3339,
        ) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        };
        let formatted = match format_rfc3339(parsed) {
            Ok(value) => value,
            Err(err) => panic!("format failed: {err}"),
        };
        assert_eq!(formatted, "2026-02-07T12:00:00Z");
    }
}
