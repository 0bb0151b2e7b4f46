use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};
use ulid::Ulid;
use venture_canvas_core::{
    model::assign_missing_hypothesis_ids, BmcCanvas, Experiment, Hypothesis, Project,
};

use crate::{
    bmc_request, check_remote_error, decode_member, experiments_request, hypotheses_request,
    uploaded_file_names, AgentClient, AgentConfig, AgentError, UploadFile,
    ALL_DATA_ENDPOINT, ALL_PROJECT_DATA_ENDPOINT, BMC_ENDPOINT, EXPERIMENTS_ENDPOINT,
    HYPOTHESES_ENDPOINT, UPLOAD_ENDPOINT,
};

/// Talks to the agent service over JSON/HTTP.
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    config: AgentConfig,
    agent: ureq::Agent,
    auth_bearer_token: Option<String>,
}

impl HttpAgentClient {
    /// # Errors
    /// Returns [`AgentError::Configuration`] when the config is invalid or the
    /// bearer-token environment variable is missing.
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let auth_bearer_token = match &config.auth_bearer_env {
            Some(env_name) => Some(std::env::var(env_name).map_err(|_| {
                AgentError::Configuration(format!(
                    "missing env var '{env_name}' required by auth_bearer_env"
                ))
            })?),
            None => None,
        };

        let mut builder = ureq::AgentBuilder::new();
        if let Some(timeout_ms) = config.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }

        Ok(Self {
            agent: builder.build(),
            config,
            auth_bearer_token,
        })
    }

    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn request(&self, method: &str, endpoint: &str) -> ureq::Request {
        let mut req = self.agent.request(method, &self.config.endpoint_url(endpoint));
        for (header, value) in &self.config.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &self.auth_bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }
        req
    }

    fn post_json(&self, endpoint: &str, body: &Value) -> Result<Value, AgentError> {
        debug!(endpoint, "posting agent request");
        let req = self
            .request("POST", endpoint)
            .set("content-type", "application/json");
        finish(endpoint, req.send_json(body))
    }

    fn get_json(&self, endpoint: &str) -> Result<Value, AgentError> {
        debug!(endpoint, "fetching agent data");
        finish(endpoint, self.request("GET", endpoint).call())
    }
}

impl AgentClient for HttpAgentClient {
    fn backend_name(&self) -> &'static str {
        "http"
    }

    fn generate_bmc(&self, project: &Project) -> Result<BmcCanvas, AgentError> {
        let body = self.post_json(BMC_ENDPOINT, &bmc_request(project))?;
        BmcCanvas::from_value(&body).map_err(|err| AgentError::Decode {
            endpoint: BMC_ENDPOINT.to_string(),
            message: err.to_string(),
        })
    }

    fn generate_hypotheses(
        &self,
        canvas: &BmcCanvas,
        project: &Project,
    ) -> Result<Vec<Hypothesis>, AgentError> {
        let body = self.post_json(HYPOTHESES_ENDPOINT, &hypotheses_request(canvas, project))?;
        let mut hypotheses: Vec<Hypothesis> =
            decode_member(HYPOTHESES_ENDPOINT, &body, "hypotheses")?;
        assign_missing_hypothesis_ids(project.project_id, &mut hypotheses);
        Ok(hypotheses)
    }

    fn generate_experiments(
        &self,
        hypotheses: &[Hypothesis],
        project: &Project,
    ) -> Result<Vec<Experiment>, AgentError> {
        let body = self.post_json(
            EXPERIMENTS_ENDPOINT,
            &experiments_request(hypotheses, project),
        )?;
        decode_member(EXPERIMENTS_ENDPOINT, &body, "experiments")
    }

    fn upload_files(&self, project_id: i64, files: &[UploadFile]) -> Result<Vec<String>, AgentError> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let boundary = format!("venture-canvas-{}", Ulid::new());
        let body = multipart_body(&boundary, project_id, files);
        debug!(endpoint = UPLOAD_ENDPOINT, files = files.len(), "uploading documents");
        let req = self.request("POST", UPLOAD_ENDPOINT).set(
            "content-type",
            &format!("multipart/form-data; boundary={boundary}"),
        );
        let response = finish(UPLOAD_ENDPOINT, req.send_bytes(&body))?;
        uploaded_file_names(UPLOAD_ENDPOINT, &response)
    }

    fn fetch_all_project_data(&self) -> Result<Value, AgentError> {
        self.get_json(ALL_PROJECT_DATA_ENDPOINT)
    }

    fn fetch_all_data(&self) -> Result<Value, AgentError> {
        self.get_json(ALL_DATA_ENDPOINT)
    }
}

fn finish(
    endpoint: &str,
    outcome: Result<ureq::Response, ureq::Error>,
) -> Result<Value, AgentError> {
    match outcome {
        Ok(response) => {
            let body: Value = response.into_json().map_err(|err| AgentError::Decode {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            })?;
            check_remote_error(endpoint, body)
        }
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_string().unwrap_or_default();
            warn!(endpoint, code, "agent endpoint returned an error status");
            Err(AgentError::Status {
                endpoint: endpoint.to_string(),
                code,
                body,
            })
        }
        Err(ureq::Error::Transport(err)) => {
            warn!(endpoint, error = %err, "agent endpoint unreachable");
            Err(AgentError::Transport {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            })
        }
    }
}

/// Encodes a `project_id` field plus one `files` part per document.
pub(crate) fn multipart_body(boundary: &str, project_id: i64, files: &[UploadFile]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"project_id\"\r\n\r\n{project_id}\r\n"
        )
        .as_bytes(),
    );
    for file in files {
        let name = file.file_name.replace('"', "%22");
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\nContent-Type: {}\r\n\r\n",
                file.content_type
            )
            .as_bytes(),
        );
        body.extend_from_slice(&file.bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AgentBackend;

    #[test]
    fn multipart_body_carries_project_and_every_file() {
        let files = vec![
            UploadFile {
                file_name: "deck.pdf".to_string(),
                content_type: "application/pdf".to_string(),
                bytes: b"%PDF".to_vec(),
            },
            UploadFile {
                file_name: "notes.txt".to_string(),
                content_type: "text/plain".to_string(),
                bytes: b"hello".to_vec(),
            },
        ];
        let body = String::from_utf8_lossy(&multipart_body("b0", 42, &files)).into_owned();

        assert!(body.starts_with("--b0\r\nContent-Disposition: form-data; name=\"project_id\"\r\n\r\n42\r\n"));
        assert_eq!(body.matches("name=\"files\"").count(), 2);
        assert!(body.contains("filename=\"deck.pdf\"\r\nContent-Type: application/pdf\r\n\r\n%PDF\r\n"));
        assert!(body.ends_with("--b0--\r\n"));
    }

    #[test]
    fn missing_bearer_env_is_a_configuration_error() {
        let config = AgentConfig {
            backend: AgentBackend::Http,
            auth_bearer_env: Some("VENTURE_CANVAS_TEST_TOKEN_THAT_IS_NEVER_SET".to_string()),
            ..AgentConfig::default()
        };
        assert!(matches!(
            HttpAgentClient::new(config),
            Err(AgentError::Configuration(_))
        ));
    }

    #[test]
    fn unreachable_service_reports_transport_failure() {
        let config = AgentConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_ms: Some(500),
            ..AgentConfig::default()
        };
        let client = match HttpAgentClient::new(config) {
            Ok(client) => client,
            Err(err) => panic!("client should build: {err}"),
        };
        match client.fetch_all_data() {
            Err(AgentError::Transport { endpoint, .. }) => assert_eq!(endpoint, ALL_DATA_ENDPOINT),
            other => panic!("expected transport failure, got {other:?}"),
        }
    }
}
