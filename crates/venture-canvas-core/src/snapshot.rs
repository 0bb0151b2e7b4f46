//! Whole-store snapshots in the browser local-storage layout.
//!
//! A backup is a flat map of storage key to JSON text. Each key decodes on
//! its own: a malformed key yields an empty collection plus a warning, never
//! a failed import.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{assign_missing_hypothesis_ids, de_project_id, BmcCanvas, Experiment, Hypothesis, Project};
use crate::CanvasError;

pub const PROJECTS_KEY: &str = "projects";
pub const BMC_KEY: &str = "bmcDataList";
pub const HYPOTHESES_KEY: &str = "hypothesesList";
pub const EXPERIMENTS_KEY: &str = "experimentsList";
pub const IMPORT_FLAG_KEY: &str = "localStorage_imported";

const REMOTE_PROJECT_ID_KEYS: [&str; 3] = ["project-id", "project_id", "projectId"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(from = "BTreeMap<String, Value>", into = "BTreeMap<String, String>")]
pub struct LocalStorageBackup {
    entries: BTreeMap<String, String>,
}

impl LocalStorageBackup {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
    }

    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

impl From<BTreeMap<String, Value>> for LocalStorageBackup {
    fn from(raw: BTreeMap<String, Value>) -> Self {
        let entries = raw
            .into_iter()
            .map(|(key, value)| {
                let text = match value {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                (key, text)
            })
            .collect();
        Self { entries }
    }
}

impl From<LocalStorageBackup> for BTreeMap<String, String> {
    fn from(backup: LocalStorageBackup) -> Self {
        backup.entries
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BmcEntry {
    #[serde(deserialize_with = "de_project_id")]
    pub project_id: i64,
    pub bmc_data: BmcCanvas,
    #[serde(default)]
    pub approved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HypothesesEntry {
    #[serde(deserialize_with = "de_project_id")]
    pub project_id: i64,
    #[serde(default)]
    pub hypotheses: Vec<Hypothesis>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentsEntry {
    #[serde(deserialize_with = "de_project_id")]
    pub project_id: i64,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SnapshotWarning {
    pub key: String,
    pub message: String,
}

impl SnapshotWarning {
    fn new(key: &str, message: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct StorageSnapshot {
    pub projects: Vec<Project>,
    pub bmc: Vec<BmcEntry>,
    pub hypotheses: Vec<HypothesesEntry>,
    pub experiments: Vec<ExperimentsEntry>,
    pub import_completed: bool,
}

impl StorageSnapshot {
    /// Decodes a local-storage backup key by key.
    #[must_use]
    pub fn from_backup(backup: &LocalStorageBackup) -> (Self, Vec<SnapshotWarning>) {
        let mut warnings = Vec::new();
        let projects = decode_key(backup, PROJECTS_KEY, &mut warnings);
        let bmc = decode_key(backup, BMC_KEY, &mut warnings);
        let hypotheses = decode_key(backup, HYPOTHESES_KEY, &mut warnings);
        let experiments = decode_key(backup, EXPERIMENTS_KEY, &mut warnings);
        let mut snapshot = Self {
            projects: keep_first_per_project(projects, PROJECTS_KEY, |p: &Project| p.project_id, &mut warnings),
            bmc: keep_first_per_project(bmc, BMC_KEY, |e: &BmcEntry| e.project_id, &mut warnings),
            hypotheses: keep_first_per_project(
                hypotheses,
                HYPOTHESES_KEY,
                |e: &HypothesesEntry| e.project_id,
                &mut warnings,
            ),
            experiments: keep_first_per_project(
                experiments,
                EXPERIMENTS_KEY,
                |e: &ExperimentsEntry| e.project_id,
                &mut warnings,
            ),
            import_completed: backup.get(IMPORT_FLAG_KEY) == Some("true"),
        };
        snapshot.normalize();
        snapshot.report_unrecognized_decisions(EXPERIMENTS_KEY, &mut warnings);
        (snapshot, warnings)
    }

    /// Encodes the snapshot back into the local-storage layout.
    ///
    /// # Errors
    /// Returns [`CanvasError::Parse`] when a collection cannot be serialized.
    pub fn to_backup(&self) -> Result<LocalStorageBackup, CanvasError> {
        let mut backup = LocalStorageBackup::default();
        backup.insert(PROJECTS_KEY, encode(&self.projects)?);
        backup.insert(BMC_KEY, encode(&self.bmc)?);
        backup.insert(HYPOTHESES_KEY, encode(&self.hypotheses)?);
        backup.insert(EXPERIMENTS_KEY, encode(&self.experiments)?);
        if self.import_completed {
            backup.insert(IMPORT_FLAG_KEY, "true".to_string());
        }
        Ok(backup)
    }

    /// Decodes the remote bulk-data payloads: `{projects_data: [...]}` and
    /// `{bmc_data, hypotheses_data, experiments_data}`.
    ///
    /// Remote rows keep every non-string column as JSON text and carry the
    /// project id under `project-id`. Later rows for the same project win.
    #[must_use]
    pub fn from_remote(projects_data: &Value, all_data: &Value) -> (Self, Vec<SnapshotWarning>) {
        let mut warnings = Vec::new();
        let mut snapshot = Self::default();

        for row in remote_rows(projects_data, "projects_data", &mut warnings) {
            match serde_json::from_value::<Project>(row) {
                Ok(project) => upsert_by(&mut snapshot.projects, project, |p| p.project_id),
                Err(err) => warnings.push(SnapshotWarning::new(
                    "projects_data",
                    format!("skipped project row: {err}"),
                )),
            }
        }

        for row in remote_rows(all_data, "bmc_data", &mut warnings) {
            let Some(project_id) = remote_project_id(&row) else {
                warnings.push(SnapshotWarning::new("bmc_data", "skipped row without project id"));
                continue;
            };
            match BmcCanvas::from_value(&row) {
                Ok(bmc_data) => upsert_by(
                    &mut snapshot.bmc,
                    BmcEntry {
                        project_id,
                        bmc_data,
                        approved: false,
                    },
                    |entry| entry.project_id,
                ),
                Err(err) => warnings.push(SnapshotWarning::new("bmc_data", err.to_string())),
            }
        }

        for row in remote_rows(all_data, "hypotheses_data", &mut warnings) {
            let Some(project_id) = remote_project_id(&row) else {
                warnings.push(SnapshotWarning::new(
                    "hypotheses_data",
                    "skipped row without project id",
                ));
                continue;
            };
            let embedded = embedded_json(row.get("hypotheses").unwrap_or(&Value::Null));
            match serde_json::from_value::<Vec<Hypothesis>>(embedded) {
                Ok(hypotheses) => upsert_by(
                    &mut snapshot.hypotheses,
                    HypothesesEntry {
                        project_id,
                        hypotheses,
                    },
                    |entry| entry.project_id,
                ),
                Err(err) => warnings.push(SnapshotWarning::new(
                    "hypotheses_data",
                    format!("skipped hypotheses for project {project_id}: {err}"),
                )),
            }
        }

        for row in remote_rows(all_data, "experiments_data", &mut warnings) {
            let Some(project_id) = remote_project_id(&row) else {
                warnings.push(SnapshotWarning::new(
                    "experiments_data",
                    "skipped row without project id",
                ));
                continue;
            };
            let embedded = embedded_json(row.get("experiments").unwrap_or(&Value::Null));
            match serde_json::from_value::<Vec<Experiment>>(embedded) {
                Ok(experiments) => upsert_by(
                    &mut snapshot.experiments,
                    ExperimentsEntry {
                        project_id,
                        experiments,
                    },
                    |entry| entry.project_id,
                ),
                Err(err) => warnings.push(SnapshotWarning::new(
                    "experiments_data",
                    format!("skipped experiments for project {project_id}: {err}"),
                )),
            }
        }

        snapshot.normalize();
        snapshot.report_unrecognized_decisions("experiments_data", &mut warnings);
        (snapshot, warnings)
    }

    /// Learning-card decisions outside the known set are kept as written and
    /// reported once per card.
    fn report_unrecognized_decisions(&self, key: &str, warnings: &mut Vec<SnapshotWarning>) {
        for entry in &self.experiments {
            for experiment in &entry.experiments {
                let Some(card) = &experiment.learning_card else {
                    continue;
                };
                if !card.decisions.is_recognized() {
                    warnings.push(SnapshotWarning::new(
                        key,
                        format!(
                            "project {} experiment {:?}: unrecognized decision {:?} kept as written",
                            entry.project_id,
                            experiment.experiment_name,
                            card.decisions.as_str()
                        ),
                    ));
                }
            }
        }
    }

    /// True when there is at least one project, experiment entry or canvas.
    #[must_use]
    pub fn has_essential_data(&self) -> bool {
        !self.projects.is_empty() || !self.experiments.is_empty() || !self.bmc.is_empty()
    }

    /// Fills in missing hypothesis ids so every record is addressable.
    pub fn normalize(&mut self) {
        for entry in &mut self.hypotheses {
            assign_missing_hypothesis_ids(entry.project_id, &mut entry.hypotheses);
        }
    }
}

fn decode_key<T: serde::de::DeserializeOwned>(
    backup: &LocalStorageBackup,
    key: &str,
    warnings: &mut Vec<SnapshotWarning>,
) -> Vec<T> {
    let Some(raw) = backup.get(key) else {
        return Vec::new();
    };
    if raw.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<T>>(raw) {
        Ok(items) => items,
        Err(err) => {
            warnings.push(SnapshotWarning::new(
                key,
                format!("unreadable value, using empty collection: {err}"),
            ));
            Vec::new()
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, CanvasError> {
    serde_json::to_string(value).map_err(|err| CanvasError::Parse(err.to_string()))
}

fn remote_rows(payload: &Value, key: &str, warnings: &mut Vec<SnapshotWarning>) -> Vec<Value> {
    match payload.get(key) {
        Some(Value::Array(rows)) => rows.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(_) => {
            warnings.push(SnapshotWarning::new(key, "expected an array of rows"));
            Vec::new()
        }
    }
}

fn remote_project_id(row: &Value) -> Option<i64> {
    REMOTE_PROJECT_ID_KEYS.iter().find_map(|key| match row.get(*key)? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().trim_matches('"').parse().ok(),
        _ => None,
    })
}

/// Columns stored as JSON text are decoded; anything else passes through.
fn embedded_json(value: &Value) -> Value {
    match value {
        Value::String(text) => serde_json::from_str(text).unwrap_or_else(|_| value.clone()),
        other => other.clone(),
    }
}

/// Readers look entries up by project id and take the first match, so later
/// duplicates are dropped with a warning.
fn keep_first_per_project<T, F: Fn(&T) -> i64>(
    items: Vec<T>,
    key: &str,
    project_id: F,
    warnings: &mut Vec<SnapshotWarning>,
) -> Vec<T> {
    let mut seen = BTreeSet::new();
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        let id = project_id(&item);
        if seen.insert(id) {
            kept.push(item);
        } else {
            warnings.push(SnapshotWarning::new(
                key,
                format!("dropped duplicate entry for project {id}; the first entry is kept"),
            ));
        }
    }
    kept
}

fn upsert_by<T, F: Fn(&T) -> i64>(items: &mut Vec<T>, item: T, key: F) {
    let id = key(&item);
    match items.iter_mut().find(|existing| key(existing) == id) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BmcBlock, Decision};
    use serde_json::json;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn backup_fixture() -> LocalStorageBackup {
        must(serde_json::from_value(json!({
            "projects": "[{\"project_id\": 1, \"project_name\": \"Ledgerly\", \"sector\": \"Fintech\"}]",
            "bmcDataList": "[{\"projectId\": \"1\", \"bmcData\": {\"channels\": [\"Partners\"]}}]",
            "hypothesesList": "[{\"projectId\": 1, \"hypotheses\": [{\"category\": \"Channels\", \"hypothesis\": \"Partners resell\", \"risk_weight\": 100}]}]",
            "experimentsList": "{not json",
            "localStorage_imported": "true"
        })))
    }

    #[test]
    fn malformed_keys_fall_back_to_empty_with_warning() {
        let (snapshot, warnings) = StorageSnapshot::from_backup(&backup_fixture());

        assert_eq!(snapshot.projects.len(), 1);
        assert_eq!(snapshot.bmc[0].project_id, 1);
        assert_eq!(snapshot.bmc[0].bmc_data.items(BmcBlock::Channels), ["Partners"]);
        assert_eq!(snapshot.hypotheses[0].hypotheses[0].id, "hypothesis-1-0");
        assert!(snapshot.experiments.is_empty());
        assert!(snapshot.import_completed);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].key, EXPERIMENTS_KEY);
        assert!(snapshot.has_essential_data());
    }

    #[test]
    fn backup_reencodes_every_key_as_json_text() {
        let (snapshot, _) = StorageSnapshot::from_backup(&backup_fixture());
        let backup = must(snapshot.to_backup());

        assert_eq!(
            backup.keys(),
            [BMC_KEY, EXPERIMENTS_KEY, HYPOTHESES_KEY, IMPORT_FLAG_KEY, PROJECTS_KEY]
        );
        assert_eq!(backup.get(EXPERIMENTS_KEY), Some("[]"));
        let (decoded, warnings) = StorageSnapshot::from_backup(&backup);
        assert!(warnings.is_empty());
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn duplicate_project_entries_keep_the_first() {
        let backup: LocalStorageBackup = must(serde_json::from_value(json!({
            "projects": "[{\"project_id\": 1, \"project_name\": \"Ledgerly\"}]",
            "hypothesesList": "[{\"projectId\": 1, \"hypotheses\": [{\"hypothesis\": \"first\", \"risk_weight\": 100}]}, {\"projectId\": \"1\", \"hypotheses\": [{\"hypothesis\": \"second\", \"risk_weight\": 100}]}]",
            "experimentsList": "[{\"projectId\": 1, \"experiments\": [{\"experiment_name\": \"Pilot\"}]}, {\"projectId\": 1, \"experiments\": []}]"
        })));

        let (snapshot, warnings) = StorageSnapshot::from_backup(&backup);

        assert_eq!(snapshot.hypotheses.len(), 1);
        assert_eq!(snapshot.hypotheses[0].hypotheses[0].hypothesis, "first");
        assert_eq!(snapshot.experiments.len(), 1);
        assert_eq!(snapshot.experiments[0].experiments[0].experiment_name, "Pilot");
        let keys: Vec<&str> = warnings.iter().map(|w| w.key.as_str()).collect();
        assert_eq!(keys, [HYPOTHESES_KEY, EXPERIMENTS_KEY]);
    }

    #[test]
    fn learning_card_decisions_survive_backup_import() {
        let experiments = json!([{
            "projectId": 1,
            "experiments": [
                {"experiment_name": "Interviews", "learningCard": {"decisions": "shelve/kill", "insight": "refute"}},
                {"experiment_name": "Pilot", "learningCard": {"decisions": "test again", "insight": "support"}},
                {"experiment_name": "Survey", "learningCard": {"decisions": "escalate"}}
            ]
        }]);
        let mut backup = LocalStorageBackup::default();
        backup.insert(EXPERIMENTS_KEY, experiments.to_string());

        let (snapshot, warnings) = StorageSnapshot::from_backup(&backup);
        let decisions: Vec<Decision> = snapshot.experiments[0]
            .experiments
            .iter()
            .filter_map(|e| e.learning_card.as_ref().map(|card| card.decisions.clone()))
            .collect();

        assert_eq!(
            decisions,
            [
                Decision::ShelveKill,
                Decision::TestAgain,
                Decision::Unrecognized("escalate".to_string())
            ]
        );
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("escalate"));

        let reencoded = must(snapshot.to_backup());
        let text = reencoded.get(EXPERIMENTS_KEY).unwrap_or_default();
        assert!(text.contains("\"shelve/kill\""));
        assert!(text.contains("\"test again\""));
    }

    #[test]
    fn empty_backup_has_no_essential_data() {
        let (snapshot, warnings) = StorageSnapshot::from_backup(&LocalStorageBackup::default());
        assert!(warnings.is_empty());
        assert!(!snapshot.has_essential_data());
        assert!(!snapshot.import_completed);
    }

    #[test]
    fn remote_rows_decode_embedded_json_columns() {
        let projects = json!({
            "projects_data": [
                {"project-id": "3", "project_name": "Ledgerly", "team_size": "4", "cost_structure": "$10,000"},
                {"project-id": "3", "project_name": "Ledgerly v2", "team_size": "5"}
            ]
        });
        let all = json!({
            "bmc_data": [
                {"project-id": "3", "channels": "[\"Partners\"]", "customer-segments": "[\"SMBs\"]"}
            ],
            "hypotheses_data": [
                {"project-id": "3", "hypotheses": "[{\"category\": \"Channels\", \"hypothesis\": \"Partners resell\", \"risk_weight\": 60}]"}
            ],
            "experiments_data": [
                {"project-id": "3", "experiments": "[{\"hypothesis\": \"Partners resell\", \"experiment_name\": \"Pilot\", \"cost_range\": \"$0-$500\"}]"},
                {"hypotheses": "[]"}
            ]
        });

        let (snapshot, warnings) = StorageSnapshot::from_remote(&projects, &all);

        assert_eq!(snapshot.projects.len(), 1);
        assert_eq!(snapshot.projects[0].project_name, "Ledgerly v2");
        assert_eq!(snapshot.projects[0].team_size, 5);
        assert_eq!(snapshot.bmc[0].bmc_data.items(BmcBlock::CustomerSegments), ["SMBs"]);
        assert_eq!(snapshot.hypotheses[0].hypotheses[0].risk_weight, 60);
        assert_eq!(snapshot.experiments[0].experiments[0].experiment_name, "Pilot");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].key, "experiments_data");
    }
}
