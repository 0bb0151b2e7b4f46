#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};
use ulid::Ulid;
use venture_canvas_core::model::assign_missing_hypothesis_ids;
use venture_canvas_core::{
    apply_metrics, clamp_risk_weight, format_rfc3339, now_utc, parse_rfc3339_utc, BmcBlock,
    BmcCanvas, BmcEntry, BmcRecord, Experiment, ExperimentsEntry, Hypothesis, HypothesesEntry,
    HypothesisOrigin, LearningCard, Project, ProjectIntake, ProjectMetrics, ProjectStatus,
    StorageSnapshot, TestCard,
};

const CANVAS_MIGRATION_VERSION: i64 = 1;
const IMPORT_FLAG: &str = "local_storage_imported";

const SCHEMA_CANVAS_V1: &str = r"
CREATE TABLE IF NOT EXISTS projects (
  project_id INTEGER PRIMARY KEY CHECK (project_id >= 1),
  project_name TEXT NOT NULL,
  project_description TEXT NOT NULL,
  sector TEXT NOT NULL,
  funding_stage TEXT NOT NULL,
  team_size INTEGER NOT NULL DEFAULT 0 CHECK (team_size >= 0),
  project_document TEXT NOT NULL DEFAULT '',
  file_names TEXT NOT NULL DEFAULT '',
  cost_structure TEXT NOT NULL,
  revenue_potential TEXT NOT NULL,
  innovation_risk REAL,
  expected_return TEXT,
  status TEXT CHECK (
    status IN ('ideate', 'invest', 'pivot', 'preserve', 'retire', 'spinout', 'transfer')
    OR status IS NULL
  ),
  progress TEXT,
  last_updated TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bmc_state (
  project_id INTEGER PRIMARY KEY,
  approved INTEGER NOT NULL DEFAULT 0 CHECK (approved IN (0, 1)),
  updated_at TEXT NOT NULL,
  FOREIGN KEY (project_id) REFERENCES projects(project_id)
);

CREATE TABLE IF NOT EXISTS bmc_items (
  project_id INTEGER NOT NULL,
  block TEXT NOT NULL CHECK (
    block IN (
      'key-partners',
      'key-activities',
      'key-resources',
      'value-propositions',
      'customer-relationships',
      'channels',
      'customer-segments',
      'cost-structure',
      'revenue-streams'
    )
  ),
  position INTEGER NOT NULL CHECK (position >= 0),
  item TEXT NOT NULL,
  PRIMARY KEY (project_id, block, position),
  FOREIGN KEY (project_id) REFERENCES bmc_state(project_id)
);

CREATE TABLE IF NOT EXISTS hypotheses (
  project_id INTEGER NOT NULL,
  hypothesis_id TEXT NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  category TEXT NOT NULL,
  statement TEXT NOT NULL,
  risk_weight INTEGER NOT NULL CHECK (risk_weight BETWEEN 0 AND 100),
  origin TEXT NOT NULL CHECK (origin IN ('AI Suggested', 'Human Added')),
  PRIMARY KEY (project_id, hypothesis_id),
  FOREIGN KEY (project_id) REFERENCES projects(project_id)
);

CREATE INDEX IF NOT EXISTS idx_hypotheses_project_position
  ON hypotheses(project_id, position);

CREATE TABLE IF NOT EXISTS experiments (
  project_id INTEGER NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  experiment_name TEXT NOT NULL,
  experiment_json TEXT NOT NULL,
  test_card_json TEXT,
  learning_card_json TEXT,
  PRIMARY KEY (project_id, position),
  FOREIGN KEY (project_id) REFERENCES projects(project_id)
);

CREATE INDEX IF NOT EXISTS idx_experiments_project_name
  ON experiments(project_id, experiment_name, position);

CREATE TABLE IF NOT EXISTS store_flags (
  flag TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

const PROJECT_COLUMNS: &str = "project_id, project_name, project_description, sector,
    funding_stage, team_size, project_document, file_names, cost_structure,
    revenue_potential, innovation_risk, expected_return, status, progress, last_updated";

pub struct SqliteCanvasStore {
    conn: Connection,
}

/// Outcome of merging a snapshot into the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ImportReport {
    pub projects: usize,
    pub bmc_entries: usize,
    pub hypothesis_entries: usize,
    pub experiment_entries: usize,
    pub skipped: Vec<String>,
}

impl SqliteCanvasStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_CANVAS_V1)
            .context("failed to apply canvas schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![CANVAS_MIGRATION_VERSION, timestamp_now()?],
            )
            .context("failed to register canvas schema migration")?;

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to query schema version")
    }

    pub fn next_project_id(&self) -> Result<i64> {
        let max = self
            .conn
            .query_row("SELECT MAX(project_id) FROM projects", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to query max project_id")?;
        Ok(max.map_or(1, |value| value.max(0) + 1))
    }

    /// Validates the intake and stores it under the next sequential id.
    pub fn create_project(&self, intake: &ProjectIntake, file_names: &[String]) -> Result<Project> {
        intake
            .validate()
            .map_err(|err| anyhow!("project intake rejected: {err}"))?;

        let project = intake
            .clone()
            .into_project(self.next_project_id()?, file_names);
        write_project(&self.conn, &project)?;
        info!(project_id = project.project_id, "project created");
        Ok(project)
    }

    pub fn upsert_project(&self, project: &Project) -> Result<()> {
        write_project(&self.conn, project)
    }

    pub fn get_project(&self, project_id: i64) -> Result<Option<Project>> {
        read_project(&self.conn, project_id)
    }

    pub fn require_project(&self, project_id: i64) -> Result<Project> {
        self.get_project(project_id)?
            .ok_or_else(|| anyhow!("project {project_id} not found"))
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY project_id ASC"
            ))
            .context("failed to prepare project listing")?;
        let rows = stmt.query_map([], parse_project_row)?;
        collect_rows(rows)
    }

    /// Writes reviewed metrics and the chosen status back onto the project.
    pub fn update_project_metrics(
        &self,
        project_id: i64,
        metrics: &ProjectMetrics,
        status: ProjectStatus,
        now: OffsetDateTime,
    ) -> Result<Project> {
        let mut project = self.require_project(project_id)?;
        apply_metrics(&mut project, metrics, status, now);
        write_project(&self.conn, &project)?;
        info!(project_id, status = status.as_str(), "project metrics saved");
        Ok(project)
    }

    /// Replaces the canvas items for a project. The approval state of an
    /// existing canvas is kept.
    pub fn save_bmc(&mut self, project_id: i64, canvas: &BmcCanvas) -> Result<()> {
        self.require_project(project_id)?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start canvas transaction")?;
        write_canvas(&tx, project_id, canvas, None)?;
        tx.commit().context("failed to commit canvas transaction")?;
        Ok(())
    }

    pub fn get_bmc(&self, project_id: i64) -> Result<Option<BmcRecord>> {
        read_canvas(&self.conn, project_id)
    }

    pub fn require_bmc(&self, project_id: i64) -> Result<BmcRecord> {
        self.get_bmc(project_id)?
            .ok_or_else(|| anyhow!("no business model canvas for project {project_id}"))
    }

    pub fn add_bmc_item(&mut self, project_id: i64, block: BmcBlock, item: &str) -> Result<BmcCanvas> {
        let mut canvas = self
            .get_bmc(project_id)?
            .map_or_else(BmcCanvas::empty, |record| record.canvas);
        canvas
            .add_item(block, item)
            .map_err(|err| anyhow!("cannot add canvas item: {err}"))?;
        self.save_bmc(project_id, &canvas)?;
        Ok(canvas)
    }

    pub fn edit_bmc_item(
        &mut self,
        project_id: i64,
        block: BmcBlock,
        index: usize,
        value: &str,
    ) -> Result<BmcCanvas> {
        let mut canvas = self.require_bmc(project_id)?.canvas;
        canvas
            .edit_item(block, index, value)
            .map_err(|err| anyhow!("cannot edit canvas item: {err}"))?;
        self.save_bmc(project_id, &canvas)?;
        Ok(canvas)
    }

    pub fn remove_bmc_item(&mut self, project_id: i64, block: BmcBlock, index: usize) -> Result<BmcCanvas> {
        let mut canvas = self.require_bmc(project_id)?.canvas;
        canvas
            .remove_item(block, index)
            .map_err(|err| anyhow!("cannot remove canvas item: {err}"))?;
        self.save_bmc(project_id, &canvas)?;
        Ok(canvas)
    }

    pub fn set_bmc_approved(&self, project_id: i64, approved: bool) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE bmc_state SET approved = ?2, updated_at = ?3 WHERE project_id = ?1",
                params![project_id, bool_to_sql(approved), timestamp_now()?],
            )
            .context("failed to update canvas approval")?;
        if updated == 0 {
            return Err(anyhow!(
                "no business model canvas for project {project_id}"
            ));
        }
        Ok(())
    }

    pub fn replace_hypotheses(&mut self, project_id: i64, hypotheses: &[Hypothesis]) -> Result<Vec<Hypothesis>> {
        self.require_project(project_id)?;
        let mut normalized = hypotheses.to_vec();
        assign_missing_hypothesis_ids(project_id, &mut normalized);

        let tx = self
            .conn
            .transaction()
            .context("failed to start hypotheses transaction")?;
        write_hypotheses(&tx, project_id, &normalized)?;
        tx.commit().context("failed to commit hypotheses transaction")?;
        Ok(normalized)
    }

    /// Adds a manually authored hypothesis at the end of the list.
    pub fn add_hypothesis(
        &self,
        project_id: i64,
        category: &str,
        statement: &str,
        risk_weight: i64,
    ) -> Result<Hypothesis> {
        self.require_project(project_id)?;
        if category.trim().is_empty() {
            return Err(anyhow!("hypothesis category MUST be provided"));
        }
        if statement.trim().is_empty() {
            return Err(anyhow!("hypothesis statement MUST be provided"));
        }

        let hypothesis = Hypothesis::human(
            format!("hypothesis-{}", Ulid::new()),
            category,
            statement,
            clamp_risk_weight(risk_weight),
        );
        let position = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM hypotheses WHERE project_id = ?1",
                params![project_id],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to query next hypothesis position")?;
        insert_hypothesis(&self.conn, project_id, position, &hypothesis)?;
        Ok(hypothesis)
    }

    /// Sets a hypothesis risk weight, clamped to 0..=100.
    pub fn set_risk_weight(&self, project_id: i64, hypothesis_id: &str, weight: i64) -> Result<Hypothesis> {
        let clamped = clamp_risk_weight(weight);
        let updated = self
            .conn
            .execute(
                "UPDATE hypotheses SET risk_weight = ?3 WHERE project_id = ?1 AND hypothesis_id = ?2",
                params![project_id, hypothesis_id, i64::from(clamped)],
            )
            .context("failed to update risk weight")?;
        if updated == 0 {
            return Err(anyhow!(
                "hypothesis {hypothesis_id} not found for project {project_id}"
            ));
        }

        self.list_hypotheses(project_id)?
            .into_iter()
            .find(|h| h.id == hypothesis_id)
            .ok_or_else(|| anyhow!("hypothesis {hypothesis_id} not found for project {project_id}"))
    }

    pub fn list_hypotheses(&self, project_id: i64) -> Result<Vec<Hypothesis>> {
        read_hypotheses(&self.conn, project_id)
    }

    pub fn has_hypotheses(&self, project_id: i64) -> Result<bool> {
        count_where(&self.conn, "hypotheses", project_id).map(|count| count > 0)
    }

    pub fn replace_experiments(&mut self, project_id: i64, experiments: &[Experiment]) -> Result<()> {
        self.require_project(project_id)?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start experiments transaction")?;
        write_experiments(&tx, project_id, experiments)?;
        tx.commit().context("failed to commit experiments transaction")?;
        Ok(())
    }

    pub fn list_experiments(&self, project_id: i64) -> Result<Vec<Experiment>> {
        Ok(read_experiments(&self.conn, project_id)?
            .into_iter()
            .map(|(_, experiment)| experiment)
            .collect())
    }

    pub fn has_experiments(&self, project_id: i64) -> Result<bool> {
        count_where(&self.conn, "experiments", project_id).map(|count| count > 0)
    }

    /// First experiment with the given name.
    pub fn get_experiment(&self, project_id: i64, experiment_name: &str) -> Result<Option<Experiment>> {
        Ok(self
            .find_experiment(project_id, experiment_name)?
            .map(|(_, experiment)| experiment))
    }

    /// Saves an edited test card and writes its plain statements back onto
    /// the experiment's own fields.
    pub fn save_test_card(&self, project_id: i64, experiment_name: &str, card: &TestCard) -> Result<Experiment> {
        card.validate()
            .map_err(|err| anyhow!("test card rejected: {err}"))?;
        let (position, mut experiment) = self.require_experiment(project_id, experiment_name)?;
        experiment.apply_test_card(card);
        update_experiment(&self.conn, project_id, position, &experiment)?;
        info!(project_id, experiment = %experiment.experiment_name, "test card saved");
        Ok(experiment)
    }

    pub fn save_learning_card(
        &self,
        project_id: i64,
        experiment_name: &str,
        card: &LearningCard,
    ) -> Result<Experiment> {
        let (position, mut experiment) = self.require_experiment(project_id, experiment_name)?;
        experiment.learning_card = Some(card.clone().normalized());
        update_experiment(&self.conn, project_id, position, &experiment)?;
        info!(project_id, experiment = experiment_name, "learning card saved");
        Ok(experiment)
    }

    fn find_experiment(&self, project_id: i64, experiment_name: &str) -> Result<Option<(i64, Experiment)>> {
        Ok(read_experiments(&self.conn, project_id)?
            .into_iter()
            .find(|(_, experiment)| experiment.experiment_name == experiment_name))
    }

    fn require_experiment(&self, project_id: i64, experiment_name: &str) -> Result<(i64, Experiment)> {
        self.find_experiment(project_id, experiment_name)?
            .ok_or_else(|| {
                anyhow!("experiment {experiment_name:?} not found for project {project_id}")
            })
    }

    pub fn is_import_completed(&self) -> Result<bool> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM store_flags WHERE flag = ?1",
                params![IMPORT_FLAG],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read import flag")?;
        Ok(value.as_deref() == Some("true"))
    }

    pub fn mark_import_completed(&self) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO store_flags(flag, value, updated_at) VALUES (?1, 'true', ?2)
                 ON CONFLICT(flag) DO UPDATE SET value = 'true', updated_at = excluded.updated_at",
                params![IMPORT_FLAG, timestamp_now()?],
            )
            .context("failed to set import flag")?;
        Ok(())
    }

    pub fn reset_import_flag(&self) -> Result<()> {
        self.conn
            .execute("DELETE FROM store_flags WHERE flag = ?1", params![IMPORT_FLAG])
            .context("failed to reset import flag")?;
        Ok(())
    }

    /// True once any project, canvas or experiment list is stored.
    pub fn has_essential_data(&self) -> Result<bool> {
        let count = self
            .conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM projects)
                      + (SELECT COUNT(*) FROM bmc_state)
                      + (SELECT COUNT(*) FROM experiments)",
                [],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count stored records")?;
        Ok(count > 0)
    }

    /// Merges a snapshot in one transaction. Records for a project id present
    /// in the snapshot replace the local ones; entries whose project is
    /// unknown are skipped and reported.
    pub fn import_snapshot(&mut self, snapshot: &StorageSnapshot) -> Result<ImportReport> {
        let mut report = ImportReport::default();
        let tx = self
            .conn
            .transaction()
            .context("failed to start import transaction")?;

        for project in &snapshot.projects {
            if project.project_id < 1 {
                report
                    .skipped
                    .push(format!("project {}: id MUST be positive", project.project_id));
                continue;
            }
            write_project(&tx, project)?;
            report.projects += 1;
        }

        for entry in &snapshot.bmc {
            if read_project(&tx, entry.project_id)?.is_none() {
                report
                    .skipped
                    .push(format!("bmc for unknown project {}", entry.project_id));
                continue;
            }
            write_canvas(&tx, entry.project_id, &entry.bmc_data, Some(entry.approved))?;
            report.bmc_entries += 1;
        }

        for entry in &snapshot.hypotheses {
            if read_project(&tx, entry.project_id)?.is_none() {
                report
                    .skipped
                    .push(format!("hypotheses for unknown project {}", entry.project_id));
                continue;
            }
            let mut hypotheses = entry.hypotheses.clone();
            assign_missing_hypothesis_ids(entry.project_id, &mut hypotheses);
            write_hypotheses(&tx, entry.project_id, &hypotheses)?;
            report.hypothesis_entries += 1;
        }

        for entry in &snapshot.experiments {
            if read_project(&tx, entry.project_id)?.is_none() {
                report
                    .skipped
                    .push(format!("experiments for unknown project {}", entry.project_id));
                continue;
            }
            write_experiments(&tx, entry.project_id, &entry.experiments)?;
            report.experiment_entries += 1;
        }

        tx.commit().context("failed to commit import transaction")?;

        for skipped in &report.skipped {
            warn!(reason = %skipped, "snapshot entry skipped");
        }
        info!(
            projects = report.projects,
            bmc = report.bmc_entries,
            hypotheses = report.hypothesis_entries,
            experiments = report.experiment_entries,
            "snapshot imported"
        );
        Ok(report)
    }

    pub fn export_snapshot(&self) -> Result<StorageSnapshot> {
        let projects = self.list_projects()?;
        let mut snapshot = StorageSnapshot {
            import_completed: self.is_import_completed()?,
            ..StorageSnapshot::default()
        };

        for project in &projects {
            let project_id = project.project_id;
            if let Some(record) = self.get_bmc(project_id)? {
                snapshot.bmc.push(BmcEntry {
                    project_id,
                    bmc_data: record.canvas,
                    approved: record.approved,
                });
            }
            let hypotheses = self.list_hypotheses(project_id)?;
            if !hypotheses.is_empty() {
                snapshot.hypotheses.push(HypothesesEntry {
                    project_id,
                    hypotheses,
                });
            }
            let experiments = self.list_experiments(project_id)?;
            if !experiments.is_empty() {
                snapshot.experiments.push(ExperimentsEntry {
                    project_id,
                    experiments,
                });
            }
        }

        snapshot.projects = projects;
        Ok(snapshot)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn write_project(conn: &Connection, project: &Project) -> Result<()> {
    let last_updated = project
        .last_updated
        .map(format_rfc3339)
        .transpose()
        .map_err(|err| anyhow!(err.to_string()))?;

    conn.execute(
        "INSERT INTO projects(
            project_id, project_name, project_description, sector,
            funding_stage, team_size, project_document, file_names, cost_structure,
            revenue_potential, innovation_risk, expected_return, status, progress,
            last_updated, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT(project_id) DO UPDATE SET
           project_name = excluded.project_name,
           project_description = excluded.project_description,
           sector = excluded.sector,
           funding_stage = excluded.funding_stage,
           team_size = excluded.team_size,
           project_document = excluded.project_document,
           file_names = excluded.file_names,
           cost_structure = excluded.cost_structure,
           revenue_potential = excluded.revenue_potential,
           innovation_risk = excluded.innovation_risk,
           expected_return = excluded.expected_return,
           status = excluded.status,
           progress = excluded.progress,
           last_updated = excluded.last_updated",
        params![
            project.project_id,
            project.project_name,
            project.project_description,
            project.sector,
            project.funding_stage,
            i64::from(project.team_size),
            project.project_document,
            project.file_names,
            project.cost_structure,
            project.revenue_potential,
            project.innovation_risk,
            project.expected_return,
            project.status.map(ProjectStatus::as_str),
            project.progress,
            last_updated,
            timestamp_now()?,
        ],
    )
    .with_context(|| format!("failed to write project {}", project.project_id))?;
    Ok(())
}

fn read_project(conn: &Connection, project_id: i64) -> Result<Option<Project>> {
    conn.query_row(
        &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE project_id = ?1"),
        params![project_id],
        parse_project_row,
    )
    .optional()
    .with_context(|| format!("failed to read project {project_id}"))
}

fn parse_project_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let team_size_i64: i64 = row.get(5)?;
    let status_raw: Option<String> = row.get(12)?;
    let last_updated_raw: Option<String> = row.get(14)?;

    let team_size = u32::try_from(team_size_i64)
        .map_err(|_| conversion_error(5, format!("invalid team_size: {team_size_i64}")))?;
    let status = match status_raw {
        Some(raw) => Some(
            ProjectStatus::parse(&raw)
                .ok_or_else(|| conversion_error(12, format!("invalid status: {raw}")))?,
        ),
        None => None,
    };
    let last_updated = match last_updated_raw {
        Some(raw) => Some(
            parse_rfc3339_utc(&raw).map_err(|err| conversion_error(14, err.to_string()))?,
        ),
        None => None,
    };

    Ok(Project {
        project_id: row.get(0)?,
        project_name: row.get(1)?,
        project_description: row.get(2)?,
        sector: row.get(3)?,
        funding_stage: row.get(4)?,
        team_size,
        project_document: row.get(6)?,
        file_names: row.get(7)?,
        cost_structure: row.get(8)?,
        revenue_potential: row.get(9)?,
        innovation_risk: row.get(10)?,
        expected_return: row.get(11)?,
        status,
        progress: row.get(13)?,
        last_updated,
    })
}

/// Replaces the items of a canvas. `approved = None` keeps the stored state.
fn write_canvas(conn: &Connection, project_id: i64, canvas: &BmcCanvas, approved: Option<bool>) -> Result<()> {
    let now = timestamp_now()?;
    conn.execute(
        "INSERT INTO bmc_state(project_id, approved, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(project_id) DO UPDATE SET
           approved = COALESCE(?4, bmc_state.approved),
           updated_at = excluded.updated_at",
        params![
            project_id,
            bool_to_sql(approved.unwrap_or(false)),
            now,
            approved.map(bool_to_sql),
        ],
    )
    .context("failed to upsert canvas state")?;

    conn.execute("DELETE FROM bmc_items WHERE project_id = ?1", params![project_id])
        .context("failed to clear canvas items")?;

    let mut stmt = conn
        .prepare("INSERT INTO bmc_items(project_id, block, position, item) VALUES (?1, ?2, ?3, ?4)")
        .context("failed to prepare canvas item insert")?;
    for (block, items) in canvas.iter() {
        for (position, item) in items.iter().enumerate() {
            stmt.execute(params![project_id, block.id(), sql_index(position)?, item])
                .context("failed to insert canvas item")?;
        }
    }
    Ok(())
}

fn read_canvas(conn: &Connection, project_id: i64) -> Result<Option<BmcRecord>> {
    let approved = conn
        .query_row(
            "SELECT approved FROM bmc_state WHERE project_id = ?1",
            params![project_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .context("failed to read canvas state")?;
    let Some(approved) = approved else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT block, item FROM bmc_items
             WHERE project_id = ?1
             ORDER BY block ASC, position ASC",
        )
        .context("failed to prepare canvas item query")?;
    let rows = stmt.query_map(params![project_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut canvas = BmcCanvas::empty();
    for (block_raw, item) in collect_rows(rows)? {
        let block = BmcBlock::parse(&block_raw)
            .ok_or_else(|| anyhow!("invalid stored canvas block: {block_raw}"))?;
        let mut items = canvas.items(block).to_vec();
        items.push(item);
        canvas.set_items(block, items);
    }

    Ok(Some(BmcRecord {
        project_id,
        canvas,
        approved: approved != 0,
    }))
}

fn write_hypotheses(conn: &Connection, project_id: i64, hypotheses: &[Hypothesis]) -> Result<()> {
    conn.execute("DELETE FROM hypotheses WHERE project_id = ?1", params![project_id])
        .context("failed to clear hypotheses")?;
    for (position, hypothesis) in hypotheses.iter().enumerate() {
        insert_hypothesis(conn, project_id, sql_index(position)?, hypothesis)?;
    }
    Ok(())
}

fn insert_hypothesis(conn: &Connection, project_id: i64, position: i64, hypothesis: &Hypothesis) -> Result<()> {
    conn.execute(
        "INSERT INTO hypotheses(project_id, hypothesis_id, position, category, statement, risk_weight, origin)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            project_id,
            hypothesis.id,
            position,
            hypothesis.category,
            hypothesis.hypothesis,
            i64::from(hypothesis.risk_weight),
            hypothesis.origin.as_str(),
        ],
    )
    .with_context(|| format!("failed to insert hypothesis {}", hypothesis.id))?;
    Ok(())
}

fn read_hypotheses(conn: &Connection, project_id: i64) -> Result<Vec<Hypothesis>> {
    let mut stmt = conn
        .prepare(
            "SELECT hypothesis_id, category, statement, risk_weight, origin
             FROM hypotheses
             WHERE project_id = ?1
             ORDER BY position ASC",
        )
        .context("failed to prepare hypotheses query")?;
    let rows = stmt.query_map(params![project_id], |row| {
        let weight_i64: i64 = row.get(3)?;
        let origin_raw: String = row.get(4)?;
        Ok(Hypothesis {
            id: row.get(0)?,
            category: row.get(1)?,
            hypothesis: row.get(2)?,
            risk_weight: clamp_risk_weight(weight_i64),
            origin: HypothesisOrigin::parse_lenient(&origin_raw),
        })
    })?;
    collect_rows(rows)
}

fn write_experiments(conn: &Connection, project_id: i64, experiments: &[Experiment]) -> Result<()> {
    conn.execute("DELETE FROM experiments WHERE project_id = ?1", params![project_id])
        .context("failed to clear experiments")?;
    for (position, experiment) in experiments.iter().enumerate() {
        let (record, test_card, learning_card) = experiment_columns(experiment)?;
        conn.execute(
            "INSERT INTO experiments(
                project_id, position, experiment_name, experiment_json,
                test_card_json, learning_card_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                project_id,
                sql_index(position)?,
                experiment.experiment_name,
                record,
                test_card,
                learning_card,
            ],
        )
        .with_context(|| format!("failed to insert experiment {:?}", experiment.experiment_name))?;
    }
    Ok(())
}

fn update_experiment(conn: &Connection, project_id: i64, position: i64, experiment: &Experiment) -> Result<()> {
    let (record, test_card, learning_card) = experiment_columns(experiment)?;
    conn.execute(
        "UPDATE experiments
         SET experiment_name = ?3, experiment_json = ?4, test_card_json = ?5, learning_card_json = ?6
         WHERE project_id = ?1 AND position = ?2",
        params![
            project_id,
            position,
            experiment.experiment_name,
            record,
            test_card,
            learning_card,
        ],
    )
    .with_context(|| format!("failed to update experiment {:?}", experiment.experiment_name))?;
    Ok(())
}

/// Splits an experiment into its record JSON and the two card columns.
fn experiment_columns(experiment: &Experiment) -> Result<(String, Option<String>, Option<String>)> {
    let mut record = experiment.clone();
    let test_card = record.test_card.take();
    let learning_card = record.learning_card.take();

    let record = serde_json::to_string(&record).context("failed to serialize experiment")?;
    let test_card = test_card
        .map(|card| serde_json::to_string(&card))
        .transpose()
        .context("failed to serialize test card")?;
    let learning_card = learning_card
        .map(|card| serde_json::to_string(&card))
        .transpose()
        .context("failed to serialize learning card")?;
    Ok((record, test_card, learning_card))
}

fn read_experiments(conn: &Connection, project_id: i64) -> Result<Vec<(i64, Experiment)>> {
    let mut stmt = conn
        .prepare(
            "SELECT position, experiment_json, test_card_json, learning_card_json
             FROM experiments
             WHERE project_id = ?1
             ORDER BY position ASC",
        )
        .context("failed to prepare experiments query")?;
    let rows = stmt.query_map(params![project_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;

    let mut experiments = Vec::new();
    for (position, record, test_card, learning_card) in collect_rows(rows)? {
        let mut experiment: Experiment =
            serde_json::from_str(&record).context("invalid stored experiment JSON")?;
        experiment.test_card = test_card
            .map(|raw| serde_json::from_str::<TestCard>(&raw))
            .transpose()
            .context("invalid stored test card JSON")?;
        experiment.learning_card = learning_card
            .map(|raw| serde_json::from_str::<LearningCard>(&raw))
            .transpose()
            .context("invalid stored learning card JSON")?;
        experiments.push((position, experiment));
    }
    Ok(experiments)
}

fn count_where(conn: &Connection, table: &str, project_id: i64) -> Result<i64> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {table} WHERE project_id = ?1"),
        params![project_id],
        |row| row.get::<_, i64>(0),
    )
    .with_context(|| format!("failed to count {table} rows"))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn sql_index(index: usize) -> Result<i64> {
    i64::try_from(index).with_context(|| format!("position out of range: {index}"))
}

fn timestamp_now() -> Result<String> {
    format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use venture_canvas_core::{compute_project_metrics, Decision, Insight, LocalStorageBackup};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteCanvasStore {
        let store = must(SqliteCanvasStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_intake(name: &str) -> ProjectIntake {
        ProjectIntake {
            project_name: name.to_string(),
            project_description: "Automated bookkeeping for small businesses".to_string(),
            sector: "Fintech".to_string(),
            funding_stage: "Seed".to_string(),
            team_size: 4,
            project_document: "deck.pdf".to_string(),
            cost_structure: "$250,000".to_string(),
            revenue_potential: "$1,500,000".to_string(),
        }
    }

    fn fixture_hypothesis(id: &str, text: &str, weight: u8) -> Hypothesis {
        Hypothesis {
            id: id.to_string(),
            category: "Value Propositions".to_string(),
            hypothesis: text.to_string(),
            risk_weight: weight,
            origin: HypothesisOrigin::AiSuggested,
        }
    }

    fn fixture_experiments() -> Vec<Experiment> {
        match serde_json::from_value(json!([
            {
                "hypothesis": "Owners will pay monthly",
                "experiment_type": "Validation",
                "ai_confidence": 75,
                "experiment_name": "Pricing page",
                "testing_statement": "run a fake-door pricing page",
                "cost_range": "$200-$800",
                "runtime": "2 weeks",
                "success_metric": "5% click through",
                "priority": "High",
                "measurement": "click-through rate"
            },
            {
                "hypothesis": "Accountants will refer clients",
                "experiment_type": "Discovery",
                "experiment_name": "Accountant interviews",
                "cost_range": "$0-$300"
            }
        ])) {
            Ok(value) => value,
            Err(err) => panic!("invalid experiment fixture: {err}"),
        }
    }

    fn temp_db_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("venture-canvas-store-{}.sqlite3", Ulid::new()))
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        assert_eq!(must(store.schema_version()), Some(CANVAS_MIGRATION_VERSION));
        let tables = must(
            store
                .connection()
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('projects', 'bmc_items', 'hypotheses', 'experiments')",
                    [],
                    |row| row.get::<_, i64>(0),
                )
                .map_err(anyhow::Error::from),
        );
        assert_eq!(tables, 4);
    }

    #[test]
    fn project_ids_are_sequential_from_one() {
        let store = fixture_store();
        let first = must(store.create_project(&fixture_intake("Ledgerly"), &[]));
        let second = must(store.create_project(
            &fixture_intake("Shiftly"),
            &["deck.pdf".to_string(), "model.xlsx".to_string()],
        ));

        assert_eq!(first.project_id, 1);
        assert_eq!(second.project_id, 2);
        assert_eq!(second.file_names, "deck.pdf, model.xlsx");
        assert_eq!(must(store.list_projects()).len(), 2);
        assert_eq!(must(store.require_project(2)).project_name, "Shiftly");
        assert!(must(store.get_project(3)).is_none());
    }

    #[test]
    fn blank_intake_is_rejected_without_side_effects() {
        let store = fixture_store();
        let mut intake = fixture_intake("Ledgerly");
        intake.revenue_potential = "  ".to_string();

        let err = match store.create_project(&intake, &[]) {
            Ok(project) => panic!("expected rejection, got project {}", project.project_id),
            Err(err) => err,
        };
        assert!(err.to_string().contains("revenue_potential"));
        assert!(must(store.list_projects()).is_empty());
    }

    #[test]
    fn bmc_items_survive_reopen() {
        let path = temp_db_path();
        {
            let mut store = must(SqliteCanvasStore::open(&path));
            must(store.migrate());
            let project = must(store.create_project(&fixture_intake("Ledgerly"), &[]));
            must(store.add_bmc_item(project.project_id, BmcBlock::Channels, "Accountant partners"));
            must(store.add_bmc_item(project.project_id, BmcBlock::Channels, "App marketplace"));
            must(store.add_bmc_item(project.project_id, BmcBlock::KeyPartners, "Banks"));
        }

        let store = must(SqliteCanvasStore::open(&path));
        must(store.migrate());
        let record = must(store.require_bmc(1));
        assert_eq!(
            record.canvas.items(BmcBlock::Channels),
            ["Accountant partners", "App marketplace"]
        );
        assert_eq!(record.canvas.items(BmcBlock::KeyPartners), ["Banks"]);
        assert!(!record.approved);

        drop(store);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn saving_canvas_preserves_approval() {
        let mut store = fixture_store();
        let project = must(store.create_project(&fixture_intake("Ledgerly"), &[]));
        let mut canvas = BmcCanvas::empty();
        if let Err(err) = canvas.add_item(BmcBlock::CustomerSegments, "SMBs") {
            panic!("fixture canvas: {err}");
        }

        must(store.save_bmc(project.project_id, &canvas));
        must(store.set_bmc_approved(project.project_id, true));
        must(store.save_bmc(project.project_id, &canvas));
        assert!(must(store.require_bmc(project.project_id)).approved);

        must(store.set_bmc_approved(project.project_id, false));
        assert!(!must(store.require_bmc(project.project_id)).approved);
        assert!(store.set_bmc_approved(99, true).is_err());
    }

    #[test]
    fn canvas_edits_are_index_checked() {
        let mut store = fixture_store();
        let project = must(store.create_project(&fixture_intake("Ledgerly"), &[]));
        let id = project.project_id;

        must(store.add_bmc_item(id, BmcBlock::RevenueStreams, "Subscriptions"));
        assert!(store.add_bmc_item(id, BmcBlock::RevenueStreams, "   ").is_err());
        must(store.edit_bmc_item(id, BmcBlock::RevenueStreams, 0, "Monthly subscriptions"));
        assert!(store.edit_bmc_item(id, BmcBlock::RevenueStreams, 4, "x").is_err());
        assert!(store.remove_bmc_item(id, BmcBlock::RevenueStreams, 1).is_err());

        let canvas = must(store.remove_bmc_item(id, BmcBlock::RevenueStreams, 0));
        assert!(canvas.is_empty());
        assert!(must(store.require_bmc(id)).canvas.is_empty());
    }

    #[test]
    fn hypotheses_replace_add_and_reweight() {
        let mut store = fixture_store();
        let project = must(store.create_project(&fixture_intake("Ledgerly"), &[]));
        let id = project.project_id;

        let stored = must(store.replace_hypotheses(
            id,
            &[
                fixture_hypothesis("", "Owners will pay monthly", 60),
                fixture_hypothesis("h-2", "Accountants will refer clients", 30),
            ],
        ));
        assert_eq!(stored[0].id, "hypothesis-1-0");
        assert!(must(store.has_hypotheses(id)));

        let added = must(store.add_hypothesis(id, "Channels", "Marketplace installs convert", 250));
        assert_eq!(added.origin, HypothesisOrigin::HumanAdded);
        assert_eq!(added.risk_weight, 100);

        let updated = must(store.set_risk_weight(id, &added.id, 10));
        assert_eq!(updated.risk_weight, 10);
        assert!(store.set_risk_weight(id, "missing", 10).is_err());

        let listed = must(store.list_hypotheses(id));
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[2].hypothesis, "Marketplace installs convert");
        assert!(venture_canvas_core::risk_weights_valid(&listed));

        assert!(store.add_hypothesis(id, "Channels", "  ", 10).is_err());
    }

    #[test]
    fn cards_are_saved_against_experiment_name() {
        let mut store = fixture_store();
        let project = must(store.create_project(&fixture_intake("Ledgerly"), &[]));
        let id = project.project_id;
        must(store.replace_experiments(id, &fixture_experiments()));
        assert!(must(store.has_experiments(id)));

        let experiment = match must(store.get_experiment(id, "Pricing page")) {
            Some(value) => value,
            None => panic!("fixture experiment missing"),
        };
        let mut card = TestCard::draft_for(&experiment);
        card.assigned_to = "Dana".to_string();
        card.metric = "And measure paid conversions".to_string();
        let saved = must(store.save_test_card(id, "Pricing page", &card));
        assert_eq!(saved.measurement, "paid conversions");

        let learning = LearningCard {
            insight_name: "Pricing resonates".to_string(),
            date_of_learning: "2025-09-14T10:30:00Z".to_string(),
            person_responsible: "Dana".to_string(),
            hypothesis: saved.hypothesis.clone(),
            observation: "We observed 7% click through".to_string(),
            learnings: "From that we learned that monthly pricing works".to_string(),
            decisions: Decision::Preserve,
            insight: Insight::Support,
            confidence: 80,
        };
        let saved = must(store.save_learning_card(id, "Pricing page", &learning));
        assert_eq!(
            saved.learning_card.as_ref().map(|c| c.observation.as_str()),
            Some("7% click through")
        );

        let listed = must(store.list_experiments(id));
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].test_card.as_ref().map(|c| c.assigned_to.as_str()), Some("Dana"));
        assert!(listed[0].is_completed());
        assert!(!listed[1].is_completed());

        assert!(store.save_learning_card(id, "Unknown", &learning).is_err());
    }

    #[test]
    fn metrics_are_written_back_to_project() {
        let mut store = fixture_store();
        let project = must(store.create_project(&fixture_intake("Ledgerly"), &[]));
        let id = project.project_id;
        must(store.replace_hypotheses(id, &[fixture_hypothesis("h-1", "Owners will pay monthly", 100)]));
        must(store.replace_experiments(id, &fixture_experiments()));

        let metrics = compute_project_metrics(
            &project,
            &must(store.list_experiments(id)),
            &must(store.list_hypotheses(id)),
        );
        let saved = must(store.update_project_metrics(id, &metrics, ProjectStatus::Invest, now_utc()));

        let reloaded = must(store.require_project(id));
        assert_eq!(reloaded.status, Some(ProjectStatus::Invest));
        assert_eq!(reloaded.progress.as_deref(), Some("0 / 2"));
        assert_eq!(reloaded.expected_return.as_deref(), Some("$1,250,000"));
        assert_eq!(reloaded.innovation_risk, Some(100.0));
        assert_eq!(reloaded.last_updated, saved.last_updated);
    }

    #[test]
    fn import_flag_round_trip() {
        let store = fixture_store();
        assert!(!must(store.is_import_completed()));
        must(store.mark_import_completed());
        must(store.mark_import_completed());
        assert!(must(store.is_import_completed()));
        must(store.reset_import_flag());
        assert!(!must(store.is_import_completed()));
    }

    #[test]
    fn import_merges_by_project_and_skips_orphans() {
        let mut store = fixture_store();
        must(store.create_project(&fixture_intake("Local only"), &[]));
        assert!(must(store.has_essential_data()));

        let backup: LocalStorageBackup = match serde_json::from_value(json!({
            "projects": "[{\"project_id\": 2, \"project_name\": \"Imported\", \"cost_structure\": \"$1\", \"revenue_potential\": \"$2\", \"status\": \"pivot\"}]",
            "bmcDataList": "[{\"projectId\": 2, \"bmcData\": {\"channels\": [\"Partners\"]}}, {\"projectId\": 9, \"bmcData\": {}}]",
            "hypothesesList": "[{\"projectId\": 2, \"hypotheses\": [{\"bmcBlock\": \"Channels\", \"statement\": \"Partners resell\", \"riskWeight\": 100}]}]",
            "experimentsList": "[{\"projectId\": 2, \"experiments\": [{\"hypothesis\": \"Partners resell\", \"experiment_name\": \"Pilot\"}]}]"
        })) {
            Ok(value) => value,
            Err(err) => panic!("invalid backup fixture: {err}"),
        };
        let (snapshot, warnings) = StorageSnapshot::from_backup(&backup);
        assert!(warnings.is_empty());

        let report = must(store.import_snapshot(&snapshot));
        assert_eq!(report.projects, 1);
        assert_eq!(report.bmc_entries, 1);
        assert_eq!(report.hypothesis_entries, 1);
        assert_eq!(report.experiment_entries, 1);
        assert_eq!(report.skipped.len(), 1);

        let projects = must(store.list_projects());
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].project_name, "Local only");
        assert_eq!(projects[1].status, Some(ProjectStatus::Pivot));
        assert_eq!(must(store.list_hypotheses(2))[0].id, "hypothesis-2-0");
        assert_eq!(must(store.list_experiments(2))[0].experiment_name, "Pilot");
    }

    #[test]
    fn export_then_import_into_fresh_store_is_lossless() {
        let mut store = fixture_store();
        let project = must(store.create_project(&fixture_intake("Ledgerly"), &[]));
        let id = project.project_id;
        must(store.add_bmc_item(id, BmcBlock::ValuePropositions, "No more spreadsheets"));
        must(store.set_bmc_approved(id, true));
        must(store.replace_hypotheses(id, &[fixture_hypothesis("h-1", "Owners will pay monthly", 100)]));
        must(store.replace_experiments(id, &fixture_experiments()));
        must(store.mark_import_completed());

        let exported = must(store.export_snapshot());
        assert!(exported.import_completed);
        let backup = match exported.to_backup() {
            Ok(value) => value,
            Err(err) => panic!("backup encoding failed: {err}"),
        };
        let (decoded, warnings) = StorageSnapshot::from_backup(&backup);
        assert!(warnings.is_empty());

        let mut fresh = fixture_store();
        let report = must(fresh.import_snapshot(&decoded));
        assert!(report.skipped.is_empty());
        assert_eq!(must(fresh.export_snapshot()).bmc, exported.bmc);
        assert_eq!(must(fresh.list_experiments(id)), must(store.list_experiments(id)));
        assert_eq!(must(fresh.list_hypotheses(id)), must(store.list_hypotheses(id)));
    }

    proptest! {
        #[test]
        fn canvas_items_round_trip(items in proptest::collection::vec("[a-zA-Z][a-zA-Z ]{0,20}", 0..8)) {
            let mut store = fixture_store();
            let project = must(store.create_project(&fixture_intake("Ledgerly"), &[]));
            let mut canvas = BmcCanvas::empty();
            canvas.set_items(BmcBlock::CustomerSegments, items.clone());

            must(store.save_bmc(project.project_id, &canvas));
            let record = must(store.require_bmc(project.project_id));
            prop_assert_eq!(record.canvas.items(BmcBlock::CustomerSegments), items.as_slice());
        }
    }
}
