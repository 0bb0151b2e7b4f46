use serde::Serialize;
use time::OffsetDateTime;

use crate::model::{Experiment, Hypothesis, Insight, LearningCard, Project, ProjectStatus};
use crate::money::{cost_range_upper_bound, expected_return, format_money, parse_money, to_fixed};
use crate::CanvasError;

/// Risk weights across a project's hypotheses must add up to exactly this.
pub const REQUIRED_RISK_TOTAL: u32 = 100;

#[must_use]
pub fn total_risk_weight(hypotheses: &[Hypothesis]) -> u32 {
    hypotheses.iter().map(|h| u32::from(h.risk_weight)).sum()
}

/// Experiment generation is allowed only when this holds.
#[must_use]
pub fn risk_weights_valid(hypotheses: &[Hypothesis]) -> bool {
    total_risk_weight(hypotheses) == REQUIRED_RISK_TOTAL
}

/// # Errors
/// Returns [`CanvasError::Validation`] carrying the actual total when the
/// weights do not add up to 100.
pub fn validate_risk_weights(hypotheses: &[Hypothesis]) -> Result<(), CanvasError> {
    let total = total_risk_weight(hypotheses);
    if total != REQUIRED_RISK_TOTAL {
        return Err(CanvasError::Validation(format!(
            "risk weights MUST total exactly {REQUIRED_RISK_TOTAL}% (current total: {total}%)"
        )));
    }
    Ok(())
}

#[must_use]
pub fn clamp_risk_weight(weight: i64) -> u8 {
    u8::try_from(weight.clamp(0, 100)).unwrap_or(100)
}

/// Share of project risk retired by a learning card:
/// `weight × confidence / 100`, or zero unless the insight supports the
/// hypothesis.
#[must_use]
pub fn risk_reduction(risk_weight: u8, card: Option<&LearningCard>) -> f64 {
    match card {
        Some(card) if card.insight.reduces_risk() => {
            f64::from(risk_weight) * f64::from(card.confidence) / 100.0
        }
        _ => 0.0,
    }
}

/// Remaining unvalidated risk, never below zero.
#[must_use]
pub fn innovation_risk_level<I: IntoIterator<Item = f64>>(reductions: I) -> f64 {
    let total: f64 = reductions.into_iter().sum();
    (100.0 - total).max(0.0)
}

#[must_use]
pub fn round_one_decimal(value: f64) -> f64 {
    to_fixed(value, 1).parse().unwrap_or(value)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HypothesisGroup {
    pub hypothesis: String,
    pub experiments: Vec<Experiment>,
    pub total_cost: u64,
    pub risk_weight: u8,
    pub most_recent_experiment: Option<String>,
    pub latest_insight: Option<Insight>,
    pub latest_confidence: Option<u8>,
    pub risk_reduction: f64,
}

/// Groups experiments by their hypothesis text, in first-seen order.
///
/// Each group's risk weight comes from the hypothesis with identical text
/// (zero when none matches). The most recent experiment is the one whose
/// learning card carries the latest `dateOfLearning`; undated cards are
/// ignored and unparseable dates rank below every parseable one.
#[must_use]
pub fn group_experiments_by_hypothesis(
    experiments: &[Experiment],
    hypotheses: &[Hypothesis],
) -> Vec<HypothesisGroup> {
    let mut groups: Vec<HypothesisGroup> = Vec::new();

    for experiment in experiments {
        let index = match groups
            .iter()
            .position(|group| group.hypothesis == experiment.hypothesis)
        {
            Some(index) => index,
            None => {
                groups.push(HypothesisGroup {
                    hypothesis: experiment.hypothesis.clone(),
                    experiments: Vec::new(),
                    total_cost: 0,
                    risk_weight: risk_weight_for(hypotheses, &experiment.hypothesis),
                    most_recent_experiment: None,
                    latest_insight: None,
                    latest_confidence: None,
                    risk_reduction: 0.0,
                });
                groups.len() - 1
            }
        };

        let group = &mut groups[index];
        group.total_cost = group
            .total_cost
            .saturating_add(cost_range_upper_bound(&experiment.cost_range));
        group.experiments.push(experiment.clone());
    }

    for group in &mut groups {
        let latest = latest_learning(&group.experiments)
            .map(|experiment| (experiment.experiment_name.clone(), experiment.learning_card.clone()));
        if let Some((name, card)) = latest {
            group.risk_reduction = risk_reduction(group.risk_weight, card.as_ref());
            group.latest_insight = card.as_ref().map(|c| c.insight);
            group.latest_confidence = card.as_ref().map(|c| c.confidence);
            group.most_recent_experiment = Some(name);
        }
    }

    groups
}

fn risk_weight_for(hypotheses: &[Hypothesis], text: &str) -> u8 {
    hypotheses
        .iter()
        .find(|h| h.hypothesis == text)
        .map_or(0, |h| h.risk_weight)
}

fn latest_learning(experiments: &[Experiment]) -> Option<&Experiment> {
    let mut best: Option<(&Experiment, Option<OffsetDateTime>)> = None;
    for experiment in experiments {
        let Some(card) = &experiment.learning_card else {
            continue;
        };
        if card.date_of_learning.trim().is_empty() {
            continue;
        }
        let learned_at = card.learned_at();
        // Strictly later wins; ties keep the earlier experiment.
        let replace = match &best {
            None => true,
            Some((_, current)) => learned_at > *current,
        };
        if replace {
            best = Some((experiment, learned_at));
        }
    }
    best.map(|(experiment, _)| experiment)
}

/// Everything the metrics review shows for one project.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProjectMetrics {
    pub project_id: i64,
    pub project_name: String,
    pub status: ProjectStatus,
    pub groups: Vec<HypothesisGroup>,
    pub total_budget: u64,
    pub completed_experiments: usize,
    pub total_experiments: usize,
    pub progress: String,
    pub innovation_risk: f64,
    pub cost_structure: String,
    pub revenue_potential: String,
    pub expected_return_value: f64,
    pub expected_return: String,
}

#[must_use]
pub fn compute_project_metrics(
    project: &Project,
    experiments: &[Experiment],
    hypotheses: &[Hypothesis],
) -> ProjectMetrics {
    let groups = group_experiments_by_hypothesis(experiments, hypotheses);
    let total_budget = groups
        .iter()
        .fold(0_u64, |sum, group| sum.saturating_add(group.total_cost));
    let completed = experiments.iter().filter(|e| e.is_completed()).count();

    let innovation_risk =
        round_one_decimal(innovation_risk_level(groups.iter().map(|g| g.risk_reduction)));

    let return_value = expected_return(&project.cost_structure, &project.revenue_potential);

    ProjectMetrics {
        project_id: project.project_id,
        project_name: project.project_name.clone(),
        status: project.effective_status(),
        total_budget,
        completed_experiments: completed,
        total_experiments: experiments.len(),
        progress: format!("{completed} / {}", experiments.len()),
        innovation_risk,
        cost_structure: display_amount(&project.cost_structure),
        revenue_potential: display_amount(&project.revenue_potential),
        expected_return_value: return_value,
        expected_return: format_money(return_value),
        groups,
    }
}

/// Blank reads as `N/A`; text that does not parse to a positive amount is
/// shown as entered.
fn display_amount(raw: &str) -> String {
    if raw.is_empty() {
        return "N/A".to_string();
    }
    let value = parse_money(raw);
    if value > 0.0 {
        format_money(value)
    } else {
        raw.to_string()
    }
}

/// Writes the reviewed metrics and chosen status back onto the project.
pub fn apply_metrics(
    project: &mut Project,
    metrics: &ProjectMetrics,
    status: ProjectStatus,
    now: OffsetDateTime,
) {
    project.innovation_risk = Some(metrics.innovation_risk);
    project.expected_return = Some(metrics.expected_return.clone());
    project.status = Some(status);
    project.progress = Some(metrics.progress.clone());
    project.last_updated = Some(now);
}
