use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::{Project, ProjectStatus};
use crate::money::{format_compact_currency, parse_money};

/// Risk assumed for projects that were never reviewed.
const UNREVIEWED_RISK: f64 = 100.0;
const MIN_RETURN_TOLERANCE: f64 = 10_000.0;
const RETURN_TOLERANCE_SHARE: f64 = 0.2;
const EMPTY_RETURN_RANGE: ReturnRange = ReturnRange {
    min: 0.0,
    max: 100_000.0,
};

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct ReturnRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PortfolioRow {
    pub project_id: i64,
    pub project_name: String,
    pub sector: String,
    pub status: Option<ProjectStatus>,
    pub innovation_risk: f64,
    pub expected_return_value: f64,
    pub expected_return: String,
    pub progress: Option<String>,
    /// Horizontal chart position: 0 at full risk, 100 at no risk.
    pub chart_x: f64,
    /// Vertical chart position within [`PortfolioSummary::return_range`].
    pub chart_y: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PortfolioSummary {
    pub project_count: usize,
    pub average_innovation_risk: f64,
    pub total_expected_return_value: f64,
    pub total_expected_return: String,
    pub ready_to_invest: usize,
    pub status_counts: BTreeMap<String, usize>,
    pub return_range: ReturnRange,
    pub rows: Vec<PortfolioRow>,
}

/// Aggregates risk and return across every project.
#[must_use]
pub fn summarize_portfolio(projects: &[Project]) -> PortfolioSummary {
    let returns: Vec<f64> = projects
        .iter()
        .map(|p| p.expected_return.as_deref().map_or(0.0, parse_money))
        .collect();
    let return_range = expected_return_range(&returns);

    let rows: Vec<PortfolioRow> = projects
        .iter()
        .zip(&returns)
        .map(|(project, &value)| {
            let risk = effective_risk(project);
            PortfolioRow {
                project_id: project.project_id,
                project_name: project.project_name.clone(),
                sector: project.sector.clone(),
                status: project.status,
                innovation_risk: risk,
                expected_return_value: value,
                expected_return: format_compact_currency(
                    project.expected_return.as_deref().unwrap_or("0"),
                ),
                progress: project.progress.clone(),
                chart_x: 100.0 - risk,
                chart_y: (value - return_range.min) / (return_range.max - return_range.min)
                    * 100.0,
            }
        })
        .collect();

    let (average_innovation_risk, total_value, total_display) = if projects.is_empty() {
        (UNREVIEWED_RISK, 0.0, "$0".to_string())
    } else {
        #[allow(clippy::cast_precision_loss)]
        let count = projects.len() as f64;
        let risk_sum: f64 = rows.iter().map(|row| row.innovation_risk).sum();
        let total = round_half_up(returns.iter().sum());
        (
            round_half_up(risk_sum / count),
            total,
            format_compact_currency(&total.to_string()),
        )
    };

    let mut status_counts: BTreeMap<String, usize> = ProjectStatus::ALL
        .iter()
        .map(|status| (status.as_str().to_string(), 0))
        .collect();
    for project in projects {
        if let Some(status) = project.status {
            *status_counts.entry(status.as_str().to_string()).or_default() += 1;
        }
    }

    PortfolioSummary {
        project_count: projects.len(),
        average_innovation_risk,
        total_expected_return_value: total_value,
        total_expected_return: total_display,
        ready_to_invest: projects
            .iter()
            .filter(|p| p.status == Some(ProjectStatus::Invest))
            .count(),
        status_counts,
        return_range,
        rows,
    }
}

/// Missing or zero risk counts as fully unvalidated.
fn effective_risk(project: &Project) -> f64 {
    match project.innovation_risk {
        Some(risk) if risk != 0.0 && !risk.is_nan() => risk,
        _ => UNREVIEWED_RISK,
    }
}

fn expected_return_range(returns: &[f64]) -> ReturnRange {
    if returns.is_empty() {
        return EMPTY_RETURN_RANGE;
    }
    let min = returns.iter().copied().fold(f64::INFINITY, f64::min);
    let max = returns.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let tolerance = ((max - min) * RETURN_TOLERANCE_SHARE).max(MIN_RETURN_TOLERANCE);
    ReturnRange {
        min: (min - tolerance).max(0.0),
        max: max + tolerance,
    }
}

fn round_half_up(value: f64) -> f64 {
    (value + 0.5).floor()
}
