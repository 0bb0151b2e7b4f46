#![forbid(unsafe_code)]
//! Clients for the remote generation agents and bulk-data endpoints.

mod http;
mod mock;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use venture_canvas_core::{BmcCanvas, Experiment, Hypothesis, Project};

pub use http::HttpAgentClient;
pub use mock::MockAgentClient;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

pub const BMC_ENDPOINT: &str = "run_bmc_pipeline";
pub const HYPOTHESES_ENDPOINT: &str = "run_hypotheses_agent";
pub const EXPERIMENTS_ENDPOINT: &str = "run_experiments_agent";
pub const UPLOAD_ENDPOINT: &str = "file_upload";
pub const ALL_PROJECT_DATA_ENDPOINT: &str = "get_all_project_data";
pub const ALL_DATA_ENDPOINT: &str = "get_all_data";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("{endpoint} returned http status {code}: {body}")]
    Status {
        endpoint: String,
        code: u16,
        body: String,
    },
    #[error("transport failure calling {endpoint}: {message}")]
    Transport { endpoint: String, message: String },
    #[error("undecodable response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
    #[error("{endpoint} reported an error: {message}")]
    Remote { endpoint: String, message: String },
    #[error("invalid agent configuration: {0}")]
    Configuration(String),
}

impl AgentError {
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::Status { endpoint, .. }
            | Self::Transport { endpoint, .. }
            | Self::Decode { endpoint, .. }
            | Self::Remote { endpoint, .. } => Some(endpoint),
            Self::Configuration(_) => None,
        }
    }
}

/// External collaborators: generation agents plus the bulk-data export.
///
/// Every call is a single blocking request with no retry.
pub trait AgentClient {
    fn backend_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn generate_bmc(&self, project: &Project) -> Result<BmcCanvas, AgentError>;

    #[allow(clippy::missing_errors_doc)]
    fn generate_hypotheses(
        &self,
        canvas: &BmcCanvas,
        project: &Project,
    ) -> Result<Vec<Hypothesis>, AgentError>;

    #[allow(clippy::missing_errors_doc)]
    fn generate_experiments(
        &self,
        hypotheses: &[Hypothesis],
        project: &Project,
    ) -> Result<Vec<Experiment>, AgentError>;

    /// Uploads documents and returns the stored file names.
    #[allow(clippy::missing_errors_doc)]
    fn upload_files(&self, project_id: i64, files: &[UploadFile]) -> Result<Vec<String>, AgentError>;

    #[allow(clippy::missing_errors_doc)]
    fn fetch_all_project_data(&self) -> Result<Value, AgentError>;

    #[allow(clippy::missing_errors_doc)]
    fn fetch_all_data(&self) -> Result<Value, AgentError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    /// Reads a document from disk, guessing its content type from the
    /// extension.
    ///
    /// # Errors
    /// Returns the underlying I/O error when the file cannot be read.
    pub fn read(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned());
        Ok(Self {
            content_type: content_type_for(&file_name).to_string(),
            file_name,
            bytes,
        })
    }
}

fn content_type_for(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "txt" | "md" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "eml" => "message/rfc822",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentBackend {
    #[default]
    Http,
    Mock,
}

impl AgentBackend {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Mock => "mock",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "http" => Some(Self::Http),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }
}

/// Connection settings for the agent endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub backend: AgentBackend,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Request timeout; unset means no client-side timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Name of an environment variable holding a bearer token.
    #[serde(default)]
    pub auth_bearer_env: Option<String>,
    /// Endpoints the mock backend should fail, for exercising error paths.
    #[serde(default)]
    pub mock_fail_endpoints: Vec<String>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend: AgentBackend::Http,
            base_url: default_base_url(),
            timeout_ms: None,
            headers: BTreeMap::new(),
            auth_bearer_env: None,
            mock_fail_endpoints: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// # Errors
    /// Returns [`AgentError::Configuration`] when the document does not decode
    /// or fails validation.
    pub fn from_json(value: &Value) -> Result<Self, AgentError> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|err| AgentError::Configuration(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`AgentError::Configuration`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), AgentError> {
        let base = self.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(AgentError::Configuration(
                "base_url MUST start with http:// or https://".to_string(),
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(AgentError::Configuration(
                "timeout_ms MUST be greater than zero when set".to_string(),
            ));
        }
        for endpoint in &self.mock_fail_endpoints {
            if !KNOWN_ENDPOINTS.contains(&endpoint.as_str()) {
                return Err(AgentError::Configuration(format!(
                    "mock_fail_endpoints contains unknown endpoint '{endpoint}'"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url.trim().trim_end_matches('/'), endpoint)
    }
}

const KNOWN_ENDPOINTS: [&str; 6] = [
    BMC_ENDPOINT,
    HYPOTHESES_ENDPOINT,
    EXPERIMENTS_ENDPOINT,
    UPLOAD_ENDPOINT,
    ALL_PROJECT_DATA_ENDPOINT,
    ALL_DATA_ENDPOINT,
];

/// Builds the configured client.
///
/// # Errors
/// Returns [`AgentError::Configuration`] when the config is invalid.
pub fn build_client(config: &AgentConfig) -> Result<Box<dyn AgentClient>, AgentError> {
    config.validate()?;
    match config.backend {
        AgentBackend::Http => Ok(Box::new(HttpAgentClient::new(config.clone())?)),
        AgentBackend::Mock => Ok(Box::new(MockAgentClient::with_failures(
            config.mock_fail_endpoints.iter().cloned(),
        ))),
    }
}

pub(crate) fn bmc_request(project: &Project) -> Value {
    json!({
        "project_id": project.project_id,
        "project_name": project.project_name,
        "project_description": project.project_description,
        "sector": project.sector,
        "funding_stage": project.funding_stage,
        "team_size": project.team_size,
        "project_document": project.project_document,
        "cost_structure": project.cost_structure,
        "revenue_potential": project.revenue_potential,
        "file_names": project.file_names,
    })
}

/// The endpoint takes a list of canvases; only the current one is sent.
pub(crate) fn hypotheses_request(canvas: &BmcCanvas, project: &Project) -> Value {
    json!({
        "bmc_data": [canvas.to_value()],
        "project_id": project.project_id,
        "project_description": project.project_description,
        "sector": project.sector,
    })
}

pub(crate) fn experiments_request(hypotheses: &[Hypothesis], project: &Project) -> Value {
    let hypotheses: Vec<Value> = hypotheses
        .iter()
        .map(|h| {
            json!({
                "category": h.category,
                "hypothesis": h.hypothesis,
                "risk_weight": h.risk_weight,
                "type": h.origin.as_str(),
            })
        })
        .collect();
    json!({
        "hypotheses": hypotheses,
        "project_id": project.project_id,
        "project_description": project.project_description,
        "sector": project.sector,
    })
}

/// A body with a non-null `error` member is a failure even on HTTP 200.
pub(crate) fn check_remote_error(endpoint: &str, body: Value) -> Result<Value, AgentError> {
    match body.get("error") {
        Some(Value::Null) | None => Ok(body),
        Some(Value::String(message)) => Err(AgentError::Remote {
            endpoint: endpoint.to_string(),
            message: message.clone(),
        }),
        Some(other) => Err(AgentError::Remote {
            endpoint: endpoint.to_string(),
            message: other.to_string(),
        }),
    }
}

pub(crate) fn decode_member<T: serde::de::DeserializeOwned>(
    endpoint: &str,
    body: &Value,
    member: &str,
) -> Result<T, AgentError> {
    let raw = body.get(member).ok_or_else(|| AgentError::Decode {
        endpoint: endpoint.to_string(),
        message: format!("response is missing '{member}'"),
    })?;
    serde_json::from_value(raw.clone()).map_err(|err| AgentError::Decode {
        endpoint: endpoint.to_string(),
        message: format!("invalid '{member}': {err}"),
    })
}

/// `gs://bucket/42/deck.pdf` becomes `deck.pdf`.
pub(crate) fn uploaded_file_names(endpoint: &str, body: &Value) -> Result<Vec<String>, AgentError> {
    let uris: Vec<String> = decode_member(endpoint, body, "uploaded")?;
    Ok(uris
        .iter()
        .filter_map(|uri| uri.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect())
}
