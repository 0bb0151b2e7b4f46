//! Multi-step workflows that combine the store with the agent service.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};
use venture_canvas_agents::{AgentClient, AgentError, UploadFile};
use venture_canvas_core::{
    validate_risk_weights, BmcRecord, Experiment, Hypothesis, LocalStorageBackup, Project,
    ProjectIntake, SnapshotWarning, StorageSnapshot,
};
use venture_canvas_store_sqlite::{ImportReport, SqliteCanvasStore};

#[derive(Debug, Serialize)]
pub struct IntakeOutcome {
    pub project: Project,
    pub bmc: BmcRecord,
}

#[derive(Debug, Serialize)]
pub struct ApprovalOutcome {
    pub project_id: i64,
    pub approved: bool,
    /// False when hypotheses already existed and the agent was not called.
    pub generated: bool,
    pub hypotheses: Vec<Hypothesis>,
}

#[derive(Debug, Serialize)]
pub struct ExperimentsOutcome {
    pub project_id: i64,
    pub generated: bool,
    pub experiments: Vec<Experiment>,
}

#[derive(Debug, Serialize)]
pub struct ImportOutcome {
    pub imported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub report: ImportReport,
    pub warnings: Vec<SnapshotWarning>,
}

/// Registers a project and drafts its canvas.
///
/// Documents are uploaded before the project row exists, so an upload failure
/// leaves nothing behind. A failed canvas generation keeps the project.
pub fn intake_project(
    store: &mut SqliteCanvasStore,
    client: &dyn AgentClient,
    intake: &ProjectIntake,
    documents: &[PathBuf],
) -> Result<IntakeOutcome> {
    intake
        .validate()
        .map_err(|err| anyhow!("project intake rejected: {err}"))?;

    let files = documents
        .iter()
        .map(|path| {
            UploadFile::read(path)
                .with_context(|| format!("failed to read document {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let project_id = store.next_project_id()?;
    let file_names = client
        .upload_files(project_id, &files)
        .context("document upload failed; project was not created")?;

    let project = store.create_project(intake, &file_names)?;
    let canvas = match client.generate_bmc(&project) {
        Ok(canvas) => canvas,
        Err(err) => {
            error!(project_id = project.project_id, error = %err, "business model canvas generation failed");
            return Err(anyhow!(
                "project {} was saved but canvas generation failed: {err}",
                project.project_id
            ));
        }
    };
    store.save_bmc(project.project_id, &canvas)?;
    let bmc = store.require_bmc(project.project_id)?;
    Ok(IntakeOutcome { project, bmc })
}

/// Approves the canvas and, the first time, generates hypotheses from it.
/// A failed generation leaves the canvas unapproved.
pub fn approve_bmc(
    store: &mut SqliteCanvasStore,
    client: &dyn AgentClient,
    project_id: i64,
) -> Result<ApprovalOutcome> {
    let project = store.require_project(project_id)?;
    let record = store.require_bmc(project_id)?;

    if store.has_hypotheses(project_id)? {
        store.set_bmc_approved(project_id, true)?;
        return Ok(ApprovalOutcome {
            project_id,
            approved: true,
            generated: false,
            hypotheses: store.list_hypotheses(project_id)?,
        });
    }

    store.set_bmc_approved(project_id, true)?;
    let generated = client
        .generate_hypotheses(&record.canvas, &project)
        .map_err(|err| anyhow!(err))
        .and_then(|hypotheses| store.replace_hypotheses(project_id, &hypotheses));

    match generated {
        Ok(hypotheses) => {
            info!(project_id, count = hypotheses.len(), "hypotheses generated");
            Ok(ApprovalOutcome {
                project_id,
                approved: true,
                generated: true,
                hypotheses,
            })
        }
        Err(err) => {
            error!(project_id, error = %err, "hypothesis generation failed; approval rolled back");
            store
                .set_bmc_approved(project_id, false)
                .context("failed to roll back canvas approval")?;
            Err(err.context(format!("hypothesis generation failed for project {project_id}")))
        }
    }
}

/// Generates experiments once the risk weights add up. Existing experiments
/// are returned as-is.
pub fn generate_experiments(
    store: &mut SqliteCanvasStore,
    client: &dyn AgentClient,
    project_id: i64,
) -> Result<ExperimentsOutcome> {
    let project = store.require_project(project_id)?;
    let hypotheses = store.list_hypotheses(project_id)?;
    validate_risk_weights(&hypotheses).map_err(|err| anyhow!("{err}"))?;

    if store.has_experiments(project_id)? {
        return Ok(ExperimentsOutcome {
            project_id,
            generated: false,
            experiments: store.list_experiments(project_id)?,
        });
    }

    let experiments = match client.generate_experiments(&hypotheses, &project) {
        Ok(experiments) => experiments,
        Err(err) => {
            error!(project_id, error = %err, "experiment generation failed");
            return Err(anyhow!(err).context(format!(
                "experiment generation failed for project {project_id}"
            )));
        }
    };
    store.replace_experiments(project_id, &experiments)?;
    info!(project_id, count = experiments.len(), "experiments generated");
    Ok(ExperimentsOutcome {
        project_id,
        generated: true,
        experiments: store.list_experiments(project_id)?,
    })
}

/// Pulls the remote export into an empty store. The import flag is set even
/// when the fetch fails so the attempt is not repeated automatically.
pub fn import_remote(
    store: &mut SqliteCanvasStore,
    client: &dyn AgentClient,
    force: bool,
) -> Result<ImportOutcome> {
    if !force {
        let reason = if store.is_import_completed()? {
            Some("import already completed")
        } else if store.has_essential_data()? {
            Some("store already holds project data")
        } else {
            None
        };
        if let Some(reason) = reason {
            info!(reason, "remote import skipped");
            return Ok(ImportOutcome {
                imported: false,
                reason: Some(reason.to_string()),
                report: ImportReport::default(),
                warnings: Vec::new(),
            });
        }
    }

    let outcome = match fetch_remote(client) {
        Ok((projects_data, all_data)) => {
            let (mut snapshot, warnings) = StorageSnapshot::from_remote(&projects_data, &all_data);
            snapshot.normalize();
            log_warnings(&warnings);
            store.import_snapshot(&snapshot).map(|report| ImportOutcome {
                imported: true,
                reason: None,
                report,
                warnings,
            })
        }
        Err(err) => {
            error!(error = %err, "remote import failed");
            Err(anyhow!(err).context("remote import failed"))
        }
    };

    store.mark_import_completed()?;
    outcome
}

/// Merges a local-storage backup file into the store.
pub fn import_backup(store: &mut SqliteCanvasStore, raw: &str) -> Result<ImportOutcome> {
    let backup: LocalStorageBackup =
        serde_json::from_str(raw).context("backup file is not a JSON object")?;
    let (mut snapshot, warnings) = StorageSnapshot::from_backup(&backup);
    snapshot.normalize();
    log_warnings(&warnings);

    let report = store.import_snapshot(&snapshot)?;
    if snapshot.import_completed {
        store.mark_import_completed()?;
    }
    Ok(ImportOutcome {
        imported: true,
        reason: None,
        report,
        warnings,
    })
}

/// Renders the store in the local-storage key layout.
pub fn export_backup(store: &SqliteCanvasStore) -> Result<LocalStorageBackup> {
    store
        .export_snapshot()?
        .to_backup()
        .map_err(|err| anyhow!("failed to encode backup: {err}"))
}

fn fetch_remote(client: &dyn AgentClient) -> Result<(Value, Value), AgentError> {
    Ok((client.fetch_all_project_data()?, client.fetch_all_data()?))
}

fn log_warnings(warnings: &[SnapshotWarning]) {
    for warning in warnings {
        warn!(key = %warning.key, message = %warning.message, "snapshot entry fell back");
    }
}
