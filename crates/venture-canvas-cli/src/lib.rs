//! `vc`: command surface for the venture-canvas workflow.
//!
//! Every command prints a pretty JSON document on stdout. Diagnostics go to
//! stderr through `tracing`.

pub mod pipeline;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;
use venture_canvas_agents::{build_client, AgentBackend, AgentClient, AgentConfig};
use venture_canvas_core::{
    compute_project_metrics, format_rfc3339, now_utc, risk_weights_valid, summarize_portfolio,
    total_risk_weight, BmcBlock, Decision, Insight, LearningCard, ProjectIntake, ProjectStatus,
    TestCard,
};
use venture_canvas_store_sqlite::SqliteCanvasStore;

#[derive(Debug, Parser)]
#[command(name = "vc")]
#[command(about = "Venture canvas: business model canvas to portfolio review")]
pub struct Cli {
    #[arg(long, env = "VENTURE_CANVAS_DB", default_value = "./venture_canvas.sqlite3")]
    db: PathBuf,

    /// JSON file with agent connection settings.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, env = "VENTURE_CANVAS_API_URL")]
    api_base_url: Option<String>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long, env = "VENTURE_CANVAS_BACKEND")]
    backend: Option<BackendArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BackendArg {
    Http,
    Mock,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Project {
        #[command(subcommand)]
        command: ProjectCommand,
    },
    Bmc {
        #[command(subcommand)]
        command: BmcCommand,
    },
    Hypotheses {
        #[command(subcommand)]
        command: HypothesesCommand,
    },
    Experiments {
        #[command(subcommand)]
        command: ExperimentsCommand,
    },
    TestCard {
        #[command(subcommand)]
        command: TestCardCommand,
    },
    LearningCard {
        #[command(subcommand)]
        command: LearningCardCommand,
    },
    Metrics {
        #[command(subcommand)]
        command: MetricsCommand,
    },
    Portfolio {
        #[command(subcommand)]
        command: PortfolioCommand,
    },
    Data {
        #[command(subcommand)]
        command: DataCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ProjectCommand {
    Intake(IntakeArgs),
    List,
    Show(ProjectArgs),
}

#[derive(Debug, Args)]
pub struct IntakeArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: String,
    #[arg(long)]
    sector: String,
    #[arg(long)]
    funding_stage: String,
    #[arg(long)]
    team_size: u32,
    /// Defaults to the `--file` names joined with ", ".
    #[arg(long)]
    document: Option<String>,
    #[arg(long)]
    cost_structure: String,
    #[arg(long)]
    revenue_potential: String,
    /// Document to upload; repeatable.
    #[arg(long = "file")]
    files: Vec<PathBuf>,
}

impl IntakeArgs {
    fn project_document(&self) -> String {
        if let Some(document) = &self.document {
            return document.clone();
        }
        self.files
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Args)]
pub struct ProjectArgs {
    #[arg(long)]
    project_id: i64,
}

#[derive(Debug, Subcommand)]
pub enum BmcCommand {
    Show(ProjectArgs),
    Add(BmcAddArgs),
    Edit(BmcEditArgs),
    Remove(BmcRemoveArgs),
    Approve(ProjectArgs),
}

#[derive(Debug, Args)]
pub struct BmcAddArgs {
    #[arg(long)]
    project_id: i64,
    /// Block id (`key-partners`) or title (`Key Partners`).
    #[arg(long)]
    block: String,
    #[arg(long)]
    item: String,
}

#[derive(Debug, Args)]
pub struct BmcEditArgs {
    #[arg(long)]
    project_id: i64,
    #[arg(long)]
    block: String,
    #[arg(long)]
    index: usize,
    #[arg(long)]
    item: String,
}

#[derive(Debug, Args)]
pub struct BmcRemoveArgs {
    #[arg(long)]
    project_id: i64,
    #[arg(long)]
    block: String,
    #[arg(long)]
    index: usize,
}

#[derive(Debug, Subcommand)]
pub enum HypothesesCommand {
    List(ProjectArgs),
    Add(HypothesisAddArgs),
    SetWeight(SetWeightArgs),
    GenerateExperiments(ProjectArgs),
}

#[derive(Debug, Args)]
pub struct HypothesisAddArgs {
    #[arg(long)]
    project_id: i64,
    #[arg(long)]
    category: String,
    #[arg(long)]
    statement: String,
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    risk_weight: i64,
}

#[derive(Debug, Args)]
pub struct SetWeightArgs {
    #[arg(long)]
    project_id: i64,
    #[arg(long)]
    id: String,
    #[arg(long, allow_hyphen_values = true)]
    weight: i64,
}

#[derive(Debug, Subcommand)]
pub enum ExperimentsCommand {
    List(ProjectArgs),
    Show(ExperimentArgs),
}

#[derive(Debug, Args)]
pub struct ExperimentArgs {
    #[arg(long)]
    project_id: i64,
    #[arg(long)]
    experiment: String,
}

#[derive(Debug, Subcommand)]
pub enum TestCardCommand {
    /// Prints the saved card, or a draft framed from the experiment.
    Show(ExperimentArgs),
    Save(TestCardSaveArgs),
}

#[derive(Debug, Args)]
pub struct TestCardSaveArgs {
    #[arg(long)]
    project_id: i64,
    #[arg(long)]
    experiment: String,
    #[arg(long)]
    test_name: Option<String>,
    #[arg(long)]
    deadline: Option<String>,
    #[arg(long)]
    assigned_to: Option<String>,
    #[arg(long)]
    duration: Option<String>,
    #[arg(long)]
    hypothesis: Option<String>,
    #[arg(long)]
    test: Option<String>,
    #[arg(long)]
    metric: Option<String>,
    #[arg(long)]
    criteria: Option<String>,
    #[arg(long)]
    cost_range: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum LearningCardCommand {
    Save(LearningCardSaveArgs),
}

#[derive(Debug, Args)]
pub struct LearningCardSaveArgs {
    #[arg(long)]
    project_id: i64,
    #[arg(long)]
    experiment: String,
    #[arg(long)]
    insight_name: String,
    /// Defaults to the current time.
    #[arg(long)]
    date: Option<String>,
    #[arg(long, default_value = "")]
    person: String,
    /// Defaults to the experiment's hypothesis.
    #[arg(long)]
    hypothesis: Option<String>,
    #[arg(long, default_value = "")]
    observation: String,
    #[arg(long, default_value = "")]
    learnings: String,
    /// pivot, preserve, shelve/kill or test again.
    #[arg(long, default_value = "pivot")]
    decision: String,
    /// support, unclear or refute.
    #[arg(long)]
    insight: String,
    #[arg(long, default_value_t = 0)]
    confidence: u8,
}

#[derive(Debug, Subcommand)]
pub enum MetricsCommand {
    Show(ProjectArgs),
    Save(MetricsSaveArgs),
}

#[derive(Debug, Args)]
pub struct MetricsSaveArgs {
    #[arg(long)]
    project_id: i64,
    #[arg(long)]
    status: String,
}

#[derive(Debug, Subcommand)]
pub enum PortfolioCommand {
    Summary,
}

#[derive(Debug, Subcommand)]
pub enum DataCommand {
    ImportRemote(ImportRemoteArgs),
    ImportBackup(FileArgs),
    ExportBackup(FileArgs),
    ResetImportFlag,
}

#[derive(Debug, Args)]
pub struct ImportRemoteArgs {
    /// Import even when the store already has data or was imported before.
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Args)]
pub struct FileArgs {
    path: PathBuf,
}

/// Installs the stderr log subscriber; `RUST_LOG` overrides the `warn` default.
pub fn init_tracing() {
    let default_level = "warn";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Runs a parsed command line against the configured database.
///
/// # Errors
/// Returns an error when configuration, storage or an agent call fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = agent_config(&cli)?;
    let mut store = SqliteCanvasStore::open(&cli.db)?;
    store.migrate()?;
    run_command(cli.command, &mut store, &config)
}

/// Resolves agent settings: flags and environment over the config file over
/// defaults.
///
/// # Errors
/// Returns an error when the config file cannot be read or is invalid.
pub fn agent_config(cli: &Cli) -> Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            let value: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("config {} is not valid JSON", path.display()))?;
            AgentConfig::from_json(&value)?
        }
        None => AgentConfig::default(),
    };
    if let Some(url) = &cli.api_base_url {
        config.base_url.clone_from(url);
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.timeout_ms = Some(timeout_ms);
    }
    if let Some(backend) = cli.backend {
        config.backend = match backend {
            BackendArg::Http => AgentBackend::Http,
            BackendArg::Mock => AgentBackend::Mock,
        };
    }
    config.validate()?;
    Ok(config)
}

fn run_command(command: Command, store: &mut SqliteCanvasStore, config: &AgentConfig) -> Result<()> {
    match command {
        Command::Project { command } => run_project(command, store, config),
        Command::Bmc { command } => run_bmc(command, store, config),
        Command::Hypotheses { command } => run_hypotheses(command, store, config),
        Command::Experiments { command } => run_experiments(command, store),
        Command::TestCard { command } => run_test_card(command, store),
        Command::LearningCard { command } => run_learning_card(command, store),
        Command::Metrics { command } => run_metrics(command, store),
        Command::Portfolio { command } => match command {
            PortfolioCommand::Summary => print_json(&summarize_portfolio(&store.list_projects()?)),
        },
        Command::Data { command } => run_data(command, store, config),
    }
}

fn client(config: &AgentConfig) -> Result<Box<dyn AgentClient>> {
    Ok(build_client(config)?)
}

fn run_project(command: ProjectCommand, store: &mut SqliteCanvasStore, config: &AgentConfig) -> Result<()> {
    match command {
        ProjectCommand::Intake(args) => {
            let project_document = args.project_document();
            let intake = ProjectIntake {
                project_name: args.name,
                project_description: args.description,
                sector: args.sector,
                funding_stage: args.funding_stage,
                team_size: args.team_size,
                project_document,
                cost_structure: args.cost_structure,
                revenue_potential: args.revenue_potential,
            };
            let client = client(config)?;
            let outcome = pipeline::intake_project(store, client.as_ref(), &intake, &args.files)?;
            print_json(&outcome)
        }
        ProjectCommand::List => print_json(&store.list_projects()?),
        ProjectCommand::Show(args) => {
            let project = store.require_project(args.project_id)?;
            print_json(&json!({
                "project": project,
                "bmc": store.get_bmc(args.project_id)?,
                "hypotheses": store.list_hypotheses(args.project_id)?,
                "experiments": store.list_experiments(args.project_id)?,
            }))
        }
    }
}

fn run_bmc(command: BmcCommand, store: &mut SqliteCanvasStore, config: &AgentConfig) -> Result<()> {
    match command {
        BmcCommand::Show(args) => print_json(&store.require_bmc(args.project_id)?),
        BmcCommand::Add(args) => {
            let block = parse_block(&args.block)?;
            print_json(&store.add_bmc_item(args.project_id, block, &args.item)?)
        }
        BmcCommand::Edit(args) => {
            let block = parse_block(&args.block)?;
            print_json(&store.edit_bmc_item(args.project_id, block, args.index, &args.item)?)
        }
        BmcCommand::Remove(args) => {
            let block = parse_block(&args.block)?;
            print_json(&store.remove_bmc_item(args.project_id, block, args.index)?)
        }
        BmcCommand::Approve(args) => {
            let client = client(config)?;
            print_json(&pipeline::approve_bmc(store, client.as_ref(), args.project_id)?)
        }
    }
}

fn run_hypotheses(
    command: HypothesesCommand,
    store: &mut SqliteCanvasStore,
    config: &AgentConfig,
) -> Result<()> {
    match command {
        HypothesesCommand::List(args) => {
            let hypotheses = store.list_hypotheses(args.project_id)?;
            print_json(&json!({
                "project_id": args.project_id,
                "total_risk_weight": total_risk_weight(&hypotheses),
                "can_generate_experiments": risk_weights_valid(&hypotheses),
                "hypotheses": hypotheses,
            }))
        }
        HypothesesCommand::Add(args) => print_json(&store.add_hypothesis(
            args.project_id,
            &args.category,
            &args.statement,
            args.risk_weight,
        )?),
        HypothesesCommand::SetWeight(args) => {
            print_json(&store.set_risk_weight(args.project_id, &args.id, args.weight)?)
        }
        HypothesesCommand::GenerateExperiments(args) => {
            let client = client(config)?;
            print_json(&pipeline::generate_experiments(
                store,
                client.as_ref(),
                args.project_id,
            )?)
        }
    }
}

fn run_experiments(command: ExperimentsCommand, store: &SqliteCanvasStore) -> Result<()> {
    match command {
        ExperimentsCommand::List(args) => print_json(&store.list_experiments(args.project_id)?),
        ExperimentsCommand::Show(args) => {
            let experiment = store
                .get_experiment(args.project_id, &args.experiment)?
                .ok_or_else(|| anyhow!("experiment {:?} not found", args.experiment))?;
            print_json(&experiment)
        }
    }
}

fn run_test_card(command: TestCardCommand, store: &SqliteCanvasStore) -> Result<()> {
    match command {
        TestCardCommand::Show(args) => {
            let experiment = store
                .get_experiment(args.project_id, &args.experiment)?
                .ok_or_else(|| anyhow!("experiment {:?} not found", args.experiment))?;
            print_json(&TestCard::draft_for(&experiment))
        }
        TestCardCommand::Save(args) => {
            let experiment = store
                .get_experiment(args.project_id, &args.experiment)?
                .ok_or_else(|| anyhow!("experiment {:?} not found", args.experiment))?;
            let mut card = TestCard::draft_for(&experiment);
            override_field(&mut card.test_name, args.test_name);
            override_field(&mut card.deadline, args.deadline);
            override_field(&mut card.assigned_to, args.assigned_to);
            override_field(&mut card.duration, args.duration);
            override_field(&mut card.hypothesis, args.hypothesis);
            override_field(&mut card.test, args.test);
            override_field(&mut card.metric, args.metric);
            override_field(&mut card.criteria, args.criteria);
            override_field(&mut card.cost_range, args.cost_range);
            print_json(&store.save_test_card(args.project_id, &args.experiment, &card)?)
        }
    }
}

fn run_learning_card(command: LearningCardCommand, store: &SqliteCanvasStore) -> Result<()> {
    match command {
        LearningCardCommand::Save(args) => {
            let experiment = store
                .get_experiment(args.project_id, &args.experiment)?
                .ok_or_else(|| anyhow!("experiment {:?} not found", args.experiment))?;
            let insight = Insight::parse(&args.insight)
                .ok_or_else(|| anyhow!("unknown insight {:?}", args.insight))?;
            let decisions = Decision::parse(&args.decision)
                .ok_or_else(|| anyhow!("unknown decision {:?}", args.decision))?;
            let date_of_learning = match args.date {
                Some(date) => date,
                None => format_rfc3339(now_utc())
                    .map_err(|err| anyhow!("{err}"))?,
            };
            let card = LearningCard {
                insight_name: args.insight_name,
                date_of_learning,
                person_responsible: args.person,
                hypothesis: args.hypothesis.unwrap_or(experiment.hypothesis),
                observation: args.observation,
                learnings: args.learnings,
                decisions,
                insight,
                confidence: args.confidence.min(100),
            };
            print_json(&store.save_learning_card(args.project_id, &args.experiment, &card)?)
        }
    }
}

fn run_metrics(command: MetricsCommand, store: &SqliteCanvasStore) -> Result<()> {
    match command {
        MetricsCommand::Show(args) => {
            let project = store.require_project(args.project_id)?;
            let metrics = compute_project_metrics(
                &project,
                &store.list_experiments(args.project_id)?,
                &store.list_hypotheses(args.project_id)?,
            );
            print_json(&metrics)
        }
        MetricsCommand::Save(args) => {
            let status = ProjectStatus::parse(&args.status)
                .ok_or_else(|| anyhow!("unknown status {:?}", args.status))?;
            let project = store.require_project(args.project_id)?;
            let metrics = compute_project_metrics(
                &project,
                &store.list_experiments(args.project_id)?,
                &store.list_hypotheses(args.project_id)?,
            );
            let saved = store.update_project_metrics(args.project_id, &metrics, status, now_utc())?;
            print_json(&json!({"project": saved, "metrics": metrics}))
        }
    }
}

fn run_data(command: DataCommand, store: &mut SqliteCanvasStore, config: &AgentConfig) -> Result<()> {
    match command {
        DataCommand::ImportRemote(args) => {
            let client = client(config)?;
            print_json(&pipeline::import_remote(store, client.as_ref(), args.force)?)
        }
        DataCommand::ImportBackup(args) => {
            let raw = std::fs::read_to_string(&args.path)
                .with_context(|| format!("failed to read backup {}", args.path.display()))?;
            print_json(&pipeline::import_backup(store, &raw)?)
        }
        DataCommand::ExportBackup(args) => {
            let backup = pipeline::export_backup(store)?;
            write_json_file(&args.path, &backup)?;
            print_json(&json!({
                "path": args.path.display().to_string(),
                "keys": backup.keys(),
            }))
        }
        DataCommand::ResetImportFlag => {
            store.reset_import_flag()?;
            print_json(&json!({"import_completed": false}))
        }
    }
}

fn parse_block(raw: &str) -> Result<BmcBlock> {
    BmcBlock::parse(raw).ok_or_else(|| {
        let known: Vec<&str> = BmcBlock::ALL.iter().map(|block| block.id()).collect();
        anyhow!("unknown canvas block {raw:?}; expected one of {}", known.join(", "))
    })
}

fn override_field(target: &mut String, value: Option<String>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let serialized = serde_json::to_string_pretty(value)?;
    std::fs::write(path, serialized)
        .with_context(|| format!("failed to write {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
