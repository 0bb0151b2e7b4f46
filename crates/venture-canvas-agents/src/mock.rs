use std::collections::BTreeSet;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use venture_canvas_core::{
    BmcBlock, BmcCanvas, Experiment, ExperimentType, Hypothesis, HypothesisOrigin, Project,
};

use crate::{
    AgentClient, AgentError, UploadFile, ALL_DATA_ENDPOINT, ALL_PROJECT_DATA_ENDPOINT,
    BMC_ENDPOINT, EXPERIMENTS_ENDPOINT, HYPOTHESES_ENDPOINT, UPLOAD_ENDPOINT,
};

const MOCK_VERSION: &str = "mock.v1";

/// Hypotheses drafted for these blocks, with the risk weight each receives.
const HYPOTHESIS_PLAN: [(BmcBlock, u8); 3] = [
    (BmcBlock::CustomerSegments, 40),
    (BmcBlock::ValuePropositions, 35),
    (BmcBlock::RevenueStreams, 25),
];

/// Offline stand-in for the agent service. Output depends only on the input.
#[derive(Debug, Clone, Default)]
pub struct MockAgentClient {
    failing: BTreeSet<String>,
}

impl MockAgentClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock that answers the named endpoints with HTTP 503.
    #[must_use]
    pub fn with_failures<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failing: endpoints.into_iter().map(Into::into).collect(),
        }
    }

    fn guard(&self, endpoint: &str) -> Result<(), AgentError> {
        if self.failing.contains(endpoint) {
            return Err(AgentError::Status {
                endpoint: endpoint.to_string(),
                code: 503,
                body: "mock endpoint configured to fail".to_string(),
            });
        }
        Ok(())
    }

    fn deterministic_token(project: &Project, salt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(project.project_id.to_le_bytes());
        hasher.update(project.project_name.as_bytes());
        hasher.update(project.project_description.as_bytes());
        hasher.update(salt.as_bytes());
        hasher.update(MOCK_VERSION.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl AgentClient for MockAgentClient {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    fn generate_bmc(&self, project: &Project) -> Result<BmcCanvas, AgentError> {
        self.guard(BMC_ENDPOINT)?;
        let token = Self::deterministic_token(project, BMC_ENDPOINT);
        let tag = &token[..8];
        let mut canvas = BmcCanvas::empty();
        for block in BmcBlock::ALL {
            canvas.set_items(
                block,
                vec![
                    format!("{} for {} ({tag})", block.title(), project.project_name),
                    format!("{} in {}", block.title(), sector_or_market(project)),
                ],
            );
        }
        Ok(canvas)
    }

    fn generate_hypotheses(
        &self,
        canvas: &BmcCanvas,
        project: &Project,
    ) -> Result<Vec<Hypothesis>, AgentError> {
        self.guard(HYPOTHESES_ENDPOINT)?;
        Ok(HYPOTHESIS_PLAN
            .iter()
            .enumerate()
            .map(|(index, (block, weight))| {
                let subject = canvas
                    .items(*block)
                    .first()
                    .cloned()
                    .unwrap_or_else(|| block.title().to_string());
                Hypothesis {
                    id: format!("hypothesis-{}-{index}", project.project_id),
                    category: block.title().to_string(),
                    hypothesis: format!("{subject} matters to {}", sector_or_market(project)),
                    risk_weight: *weight,
                    origin: HypothesisOrigin::AiSuggested,
                }
            })
            .collect())
    }

    fn generate_experiments(
        &self,
        hypotheses: &[Hypothesis],
        project: &Project,
    ) -> Result<Vec<Experiment>, AgentError> {
        self.guard(EXPERIMENTS_ENDPOINT)?;
        let token = Self::deterministic_token(project, EXPERIMENTS_ENDPOINT);
        let bytes = token.as_bytes();
        Ok(hypotheses
            .iter()
            .enumerate()
            .map(|(index, hypothesis)| {
                let spread = bytes.get(index).copied().unwrap_or_default() % 50;
                let discovery = hypothesis.risk_weight >= 35;
                Experiment {
                    hypothesis: hypothesis.hypothesis.clone(),
                    experiment_type: if discovery {
                        ExperimentType::Discovery
                    } else {
                        ExperimentType::Validation
                    },
                    ai_confidence: 50 + spread,
                    experiment_name: format!("{} check {}", hypothesis.category, index + 1),
                    testing_statement: format!("whether {}", hypothesis.hypothesis),
                    description: format!(
                        "Run a small {} test for {}.",
                        if discovery { "interview" } else { "landing page" },
                        project.project_name
                    ),
                    cost_range: format!("${}-${}", 100 * (index + 1), 500 * (index + 1)),
                    runtime: "2 weeks".to_string(),
                    success_metric: "at least 30% positive responses".to_string(),
                    priority: if discovery { "High" } else { "Medium" }.to_string(),
                    measurement: "share of positive responses".to_string(),
                    test_card: None,
                    learning_card: None,
                }
            })
            .collect())
    }

    fn upload_files(&self, _project_id: i64, files: &[UploadFile]) -> Result<Vec<String>, AgentError> {
        self.guard(UPLOAD_ENDPOINT)?;
        Ok(files.iter().map(|file| file.file_name.clone()).collect())
    }

    fn fetch_all_project_data(&self) -> Result<Value, AgentError> {
        self.guard(ALL_PROJECT_DATA_ENDPOINT)?;
        Ok(json!({
            "projects_data": [{
                "project-id": "1001",
                "project_name": "Harbor Analytics",
                "project_description": "Berth scheduling for regional ports",
                "sector": "Logistics",
                "funding_stage": "Seed",
                "team_size": "6",
                "project_document": "harbor.pdf",
                "cost_structure": "$400,000",
                "revenue_potential": "$2,000,000"
            }]
        }))
    }

    fn fetch_all_data(&self) -> Result<Value, AgentError> {
        self.guard(ALL_DATA_ENDPOINT)?;
        let hypotheses = json!([
            {"category": "Customer Segments", "hypothesis": "Port operators will pay for scheduling", "risk_weight": 60, "type": "AI Suggested"},
            {"category": "Channels", "hypothesis": "Harbor authorities refer operators", "risk_weight": 40, "type": "AI Suggested"}
        ]);
        let experiments = json!([
            {
                "hypothesis": "Port operators will pay for scheduling",
                "experiment_type": "Discovery",
                "ai_confidence": "80",
                "experiment_name": "Operator interviews",
                "testing_statement": "operators feel berth conflicts weekly",
                "description": "Interview ten operators.",
                "cost_range": "$0-$300",
                "runtime": "2 weeks",
                "success_metric": "7 of 10 report weekly conflicts",
                "priority": "High",
                "measurement": "interview tally"
            }
        ]);
        Ok(json!({
            "bmc_data": [{
                "project-id": "1001",
                "customer-segments": "[\"Regional port operators\"]",
                "value-propositions": "[\"Fewer berth conflicts\"]",
                "channels": "[\"Harbor authority referrals\"]",
                "revenue-streams": "[\"Per-berth subscription\"]"
            }],
            "hypotheses_data": [{"project-id": "1001", "hypotheses": hypotheses.to_string()}],
            "experiments_data": [{"project-id": "1001", "experiments": experiments.to_string()}]
        }))
    }
}

fn sector_or_market(project: &Project) -> &str {
    let sector = project.sector.trim();
    if sector.is_empty() {
        "the target market"
    } else {
        sector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use venture_canvas_core::{total_risk_weight, StorageSnapshot};

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn project() -> Project {
        crate::tests::fixture_project()
    }

    #[test]
    fn mock_output_is_stable_for_same_input() {
        let client = MockAgentClient::new();
        let first = must(client.generate_bmc(&project()));
        let second = must(client.generate_bmc(&project()));
        assert_eq!(first, second);
        assert_eq!(first.total_items(), BmcBlock::ALL.len() * 2);

        let mut renamed = project();
        renamed.project_name = "Other".to_string();
        assert_ne!(must(client.generate_bmc(&renamed)), first);
    }

    #[test]
    fn generated_hypotheses_sum_to_full_weight() {
        let client = MockAgentClient::new();
        let canvas = must(client.generate_bmc(&project()));
        let hypotheses = must(client.generate_hypotheses(&canvas, &project()));
        assert_eq!(hypotheses.len(), 3);
        assert_eq!(total_risk_weight(&hypotheses), 100);
        assert_eq!(hypotheses[0].id, "hypothesis-7-0");

        let experiments = must(client.generate_experiments(&hypotheses, &project()));
        assert_eq!(experiments.len(), hypotheses.len());
        assert_eq!(experiments[0].hypothesis, hypotheses[0].hypothesis);
        assert!(experiments.iter().all(|e| (50..100).contains(&e.ai_confidence)));
        assert!(experiments.iter().all(|e| e.learning_card.is_none()));
    }

    #[test]
    fn configured_failures_surface_as_status_errors() {
        let client = MockAgentClient::with_failures([HYPOTHESES_ENDPOINT]);
        assert!(client.generate_bmc(&project()).is_ok());
        match client.generate_hypotheses(&BmcCanvas::empty(), &project()) {
            Err(AgentError::Status { endpoint, code, .. }) => {
                assert_eq!(endpoint, HYPOTHESES_ENDPOINT);
                assert_eq!(code, 503);
            }
            other => panic!("expected status failure, got {other:?}"),
        }
    }

    #[test]
    fn demo_remote_data_decodes_into_a_snapshot() {
        let client = MockAgentClient::new();
        let (snapshot, warnings) = StorageSnapshot::from_remote(
            &must(client.fetch_all_project_data()),
            &must(client.fetch_all_data()),
        );
        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
        assert_eq!(snapshot.projects.len(), 1);
        assert_eq!(snapshot.projects[0].team_size, 6);
        assert_eq!(snapshot.hypotheses[0].hypotheses.len(), 2);
        assert_eq!(snapshot.experiments[0].experiments[0].ai_confidence, 80);
        assert!(snapshot.has_essential_data());
    }
}
