use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use governance_center_agents::{AgentBackend, HttpJsonAgentBackend, MockAgentBackend};
use governance_center_domain::{
    now_utc, parse_rfc3339, GovernanceEventType, PipelineId, PriorityLevel, RunId,
    SubmissionContext,
};
use governance_center_orchestrator::{
    bottleneck_stages, escalated_stages, estimated_completion, record_event, PipelineEngine,
    PipelineOptions, SandboxOptions, SandboxOrchestrator, StartApprovalRequest,
};
use governance_center_store_core::GovernanceStore;
use governance_center_store_sqlite::SqliteGovernanceStore;
use governance_center_workflow::{load_config_pack_from_path, resolve_config};
use serde_json::{json, Value};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "governance-center")]
#[command(about = "Approval-chain governance and sandbox agent orchestration with SQLite audit")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Validate(ValidateArgs),
    Resolve(ResolveArgs),
    BuildChain(BuildChainArgs),
    Register(RegisterArgs),
    Start(StartArgs),
    Advance(AdvanceArgs),
    CompleteStage(CompleteStageArgs),
    Block(BlockArgs),
    Unblock(BlockArgs),
    Status(StatusArgs),
    Sandbox(SandboxArgs),
    Pipelines(DbArgs),
    Runs(DbArgs),
    ShowPack(ShowPackArgs),
    SetConfigActive(SetConfigActiveArgs),
    Events(EventsArgs),
    Replay(ReplayArgs),
    Export(ExportArgs),
}

#[derive(Debug, Args)]
struct DbArgs {
    #[arg(long)]
    db: PathBuf,
}

#[derive(Debug, Args)]
struct ShowPackArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    pack_hash: String,
}

#[derive(Debug, Args)]
struct SetConfigActiveArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    config_id: String,
    #[arg(long, action = clap::ArgAction::Set)]
    active: bool,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[arg(long)]
    config_pack: PathBuf,
}

#[derive(Debug, Args)]
struct ResolveArgs {
    #[arg(long)]
    config_pack: PathBuf,
    #[arg(long)]
    agency: String,
    #[arg(long)]
    client: String,
    #[arg(long)]
    brand: Option<String>,
}

#[derive(Debug, Args)]
struct BuildChainArgs {
    #[arg(long)]
    config_pack: PathBuf,
    #[arg(long)]
    agency: String,
    #[arg(long)]
    client: String,
    #[arg(long)]
    brand: Option<String>,
    #[arg(long)]
    risk_score: f64,
    #[arg(long)]
    requestor_role: String,
}

#[derive(Debug, Args)]
struct RegisterArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    config_pack: PathBuf,
}

#[derive(Debug, Args)]
struct StartArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    document: String,
    #[arg(long)]
    agency: String,
    #[arg(long)]
    client: String,
    #[arg(long)]
    brand: Option<String>,
    #[arg(long)]
    enterprise: String,
    #[arg(long)]
    risk_score: f64,
    #[arg(long)]
    requestor_role: String,
    #[arg(long, default_value = "medium")]
    priority: String,
    #[arg(long, default_value_t = 120.0)]
    sla_hours: f64,
}

#[derive(Debug, Args)]
struct AdvanceArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    pipeline_id: String,
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
}

#[derive(Debug, Args)]
struct CompleteStageArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    pipeline_id: String,
    #[arg(long)]
    stage: String,
}

#[derive(Debug, Args)]
struct BlockArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    pipeline_id: String,
    #[arg(long)]
    stage: String,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    pipeline_id: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
struct SandboxArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    policy_id: String,
    #[arg(long)]
    policy_file: Option<PathBuf>,
    #[arg(long)]
    scenario_file: Option<PathBuf>,
    #[arg(long)]
    enterprise: String,
    #[arg(long)]
    workspace: Option<String>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long, default_value = "mock")]
    backend: String,
    #[arg(long)]
    agent_params: Option<String>,
    #[arg(long)]
    run_id: Option<String>,
}

#[derive(Debug, Args)]
struct EventsArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    entity_id: String,
}

#[derive(Debug, Args)]
struct ReplayArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    entity_id: String,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    entity_id: String,
    #[arg(long)]
    out: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate(args) => validate_command(&args),
        Commands::Resolve(args) => resolve_command(&args),
        Commands::BuildChain(args) => build_chain_command(&args),
        Commands::Register(args) => register_command(&args),
        Commands::Start(args) => start_command(args),
        Commands::Advance(args) => advance_command(&args),
        Commands::CompleteStage(args) => complete_stage_command(&args),
        Commands::Block(args) => block_command(&args, true),
        Commands::Unblock(args) => block_command(&args, false),
        Commands::Status(args) => status_command(&args),
        Commands::Sandbox(args) => sandbox_command(&args),
        Commands::Pipelines(args) => pipelines_command(&args),
        Commands::Runs(args) => runs_command(&args),
        Commands::ShowPack(args) => show_pack_command(&args),
        Commands::SetConfigActive(args) => set_config_active_command(&args),
        Commands::Events(args) => events_command(&args),
        Commands::Replay(args) => replay_command(&args),
        Commands::Export(args) => export_command(&args),
    }
}

fn pipelines_command(args: &DbArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    for pipeline in store.list_pipelines()? {
        println!("{}", serde_json::to_string(&pipeline)?);
    }
    Ok(())
}

fn runs_command(args: &DbArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    for run in store.list_runs()? {
        println!("{}", serde_json::to_string(&run)?);
    }
    Ok(())
}

fn show_pack_command(args: &ShowPackArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let snapshot = store
        .get_config_pack_snapshot(&args.pack_hash)?
        .ok_or_else(|| anyhow!("config pack {} not found", args.pack_hash))?;
    println!("{}", serde_json::to_string(&snapshot)?);
    Ok(())
}

fn set_config_active_command(args: &SetConfigActiveArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let config_id = governance_center_domain::ConfigId(
        Ulid::from_str(&args.config_id).map_err(|err| anyhow!("invalid config_id ULID: {err}"))?,
    );
    store.set_config_active(config_id, args.active)?;
    println!("config_id={} active={}", config_id, args.active);
    Ok(())
}

fn validate_command(args: &ValidateArgs) -> Result<()> {
    let envelope = load_config_pack_from_path(&args.config_pack)?;
    let warnings = governance_center_workflow::validate_config_pack(&envelope.pack)?;
    for warning in &warnings {
        eprintln!("warning config_id={} {}", warning.config_id, warning.message);
    }
    println!(
        "pack_hash={} roles={} configs={} warnings={}",
        envelope.normalized_hash,
        envelope.pack.roles.len(),
        envelope.pack.configs.len(),
        warnings.len()
    );
    Ok(())
}

fn resolve_command(args: &ResolveArgs) -> Result<()> {
    let envelope = load_config_pack_from_path(&args.config_pack)?;
    match resolve_config(
        &envelope.pack.configs,
        &args.agency,
        &args.client,
        args.brand.as_deref(),
    ) {
        Some(config) => println!(
            "config_id={} priority={} brand={}",
            config.config_id,
            config.priority,
            config.brand_id.as_deref().unwrap_or("*")
        ),
        None => println!("config_id=none fallback=default_chain"),
    }
    Ok(())
}

fn build_chain_command(args: &BuildChainArgs) -> Result<()> {
    let envelope = load_config_pack_from_path(&args.config_pack)?;
    let config = resolve_config(
        &envelope.pack.configs,
        &args.agency,
        &args.client,
        args.brand.as_deref(),
    )
    .ok_or_else(|| governance_center_domain::GovernanceError::ConfigNotFound {
        agency: args.agency.clone(),
        client: args.client.clone(),
    })?;

    let context = SubmissionContext {
        risk_score: args.risk_score,
        requestor_role: args.requestor_role.clone(),
        attributes: std::collections::BTreeMap::default(),
    };
    let chain = governance_center_rules::build_chain(config, &context);

    println!(
        "steps={} skipped={} added={} auto_approved={}",
        chain.steps.join(","),
        chain.skipped.join(","),
        chain.added.join(","),
        chain.auto_approved
    );
    Ok(())
}

fn register_command(args: &RegisterArgs) -> Result<()> {
    let envelope = load_config_pack_from_path(&args.config_pack)?;
    let warnings = governance_center_workflow::validate_config_pack(&envelope.pack)?;
    let store = open_store(&args.db)?;

    store.upsert_config_pack_snapshot(
        &envelope.normalized_hash,
        &envelope.source_format,
        &envelope.source_yaml_hash,
        &envelope.normalized_json,
    )?;
    for config in &envelope.pack.configs {
        store.upsert_config(&envelope.normalized_hash, config)?;
    }

    record_event(
        &store,
        GovernanceEventType::ConfigPackRegistered,
        &envelope.normalized_hash,
        "platform",
        "human",
        "operator",
        json!({
            "pack_name": envelope.pack.pack_name,
            "pack_version": envelope.pack.pack_version,
            "configs": envelope.pack.configs.len(),
            "warnings": warnings.len(),
        }),
    )?;
    for warning in &warnings {
        record_event(
            &store,
            GovernanceEventType::Warning,
            &envelope.normalized_hash,
            "platform",
            "system",
            "validator",
            json!({
                "config_id": warning.config_id.to_string(),
                "message": warning.message,
            }),
        )?;
    }

    println!(
        "pack_hash={} configs={} warnings={}",
        envelope.normalized_hash,
        envelope.pack.configs.len(),
        warnings.len()
    );
    Ok(())
}

fn start_command(args: StartArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let engine = PipelineEngine::new(&store);

    let priority_level = PriorityLevel::parse(&args.priority)
        .ok_or_else(|| anyhow!("invalid priority '{}'", args.priority))?;

    let outcome = engine.start_approval(&StartApprovalRequest {
        document_id: args.document,
        agency_id: args.agency,
        client_id: args.client,
        brand_id: args.brand,
        enterprise_id: args.enterprise,
        context: SubmissionContext {
            risk_score: args.risk_score,
            requestor_role: args.requestor_role,
            attributes: std::collections::BTreeMap::default(),
        },
        options: PipelineOptions {
            priority_level,
            sla_hours: args.sla_hours,
            ..PipelineOptions::default()
        },
    })?;

    match &outcome.pipeline {
        Some(pipeline) => println!(
            "pipeline_id={} config_source={} steps={} skipped={} added={} progress={}",
            pipeline.pipeline_id,
            outcome.config_source,
            outcome.chain.steps.join(","),
            outcome.chain.skipped.join(","),
            outcome.chain.added.join(","),
            pipeline.progress_percentage
        ),
        None => println!(
            "pipeline_id=none config_source={} auto_approved=true bypassed={}",
            outcome.config_source,
            outcome.chain.skipped.join(",")
        ),
    }
    Ok(())
}

fn advance_command(args: &AdvanceArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let engine = PipelineEngine::new(&store);
    let pipeline_id = parse_pipeline_id(&args.pipeline_id)?;

    let pipeline = engine.advance(pipeline_id, &args.from, &args.to)?;
    println!(
        "pipeline_id={} current_stage={} progress={} status={}",
        pipeline.pipeline_id,
        pipeline.current_stage.as_deref().unwrap_or("-"),
        pipeline.progress_percentage,
        pipeline.status.as_str()
    );
    Ok(())
}

fn complete_stage_command(args: &CompleteStageArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let engine = PipelineEngine::new(&store);
    let pipeline_id = parse_pipeline_id(&args.pipeline_id)?;

    let pipeline = engine.complete_stage(pipeline_id, &args.stage)?;
    println!(
        "pipeline_id={} progress={} status={}",
        pipeline.pipeline_id,
        pipeline.progress_percentage,
        pipeline.status.as_str()
    );
    Ok(())
}

fn block_command(args: &BlockArgs, blocked: bool) -> Result<()> {
    let store = open_store(&args.db)?;
    let engine = PipelineEngine::new(&store);
    let pipeline_id = parse_pipeline_id(&args.pipeline_id)?;

    let pipeline = if blocked {
        engine.block_stage(pipeline_id, &args.stage)?
    } else {
        engine.unblock_stage(pipeline_id, &args.stage)?
    };
    let stage_status = pipeline
        .stages
        .iter()
        .find(|stage| stage.name == args.stage)
        .map(|stage| stage.status.as_str())
        .unwrap_or("-");
    println!(
        "pipeline_id={} stage={} stage_status={}",
        pipeline.pipeline_id, args.stage, stage_status
    );
    Ok(())
}

fn status_command(args: &StatusArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let pipeline_id = parse_pipeline_id(&args.pipeline_id)?;
    let pipeline = store
        .get_pipeline(pipeline_id)?
        .ok_or_else(|| anyhow!("pipeline {pipeline_id} not found"))?;

    let as_of = args
        .as_of
        .as_deref()
        .map(parse_rfc3339)
        .transpose()?
        .unwrap_or_else(now_utc);

    for stage in &pipeline.stages {
        println!(
            "stage={} status={} assignees={} estimated_hours={}",
            stage.name,
            stage.status.as_str(),
            stage.assignees.join(","),
            stage.estimated_duration_hours
        );
    }
    let estimate = estimated_completion(&pipeline, as_of)
        .map(governance_center_domain::format_rfc3339)
        .transpose()?;
    println!(
        "pipeline_id={} progress={} status={} bottlenecks={} escalated={} estimated_completion={}",
        pipeline.pipeline_id,
        pipeline.progress_percentage,
        pipeline.status.as_str(),
        bottleneck_stages(&pipeline, as_of).join(","),
        escalated_stages(&pipeline, as_of).join(","),
        estimate.as_deref().unwrap_or("-")
    );
    Ok(())
}

fn sandbox_command(args: &SandboxArgs) -> Result<()> {
    let store = open_store(&args.db)?;

    let policy = args
        .policy_file
        .as_deref()
        .map(read_json_file)
        .transpose()?
        .unwrap_or_else(|| json!({}));
    let scenario = args
        .scenario_file
        .as_deref()
        .map(read_json_file)
        .transpose()?
        .unwrap_or_else(|| json!({}));

    let agent_params = args
        .agent_params
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|err| anyhow!("invalid --agent-params JSON: {err}"))?
        .unwrap_or_else(|| json!({}));

    let run_id = args.run_id.as_deref().map(parse_run_id).transpose()?;

    let backend: Box<dyn AgentBackend> = match args.backend.as_str() {
        "mock" => Box::new(MockAgentBackend::new()),
        "http_json" => Box::new(HttpJsonAgentBackend::new()),
        other => {
            return Err(anyhow!(
                "unsupported backend '{other}'; supported backends are 'mock' and 'http_json'"
            ))
        }
    };

    let orchestrator = SandboxOrchestrator::new(&store, backend.as_ref());
    let summary = orchestrator.run_sandbox(
        &args.policy_id,
        &policy,
        &scenario,
        &args.enterprise,
        &SandboxOptions {
            run_id,
            agent_params,
            workspace_id: args.workspace.clone(),
            user_id: args.user.clone(),
            ..SandboxOptions::default()
        },
    )?;

    println!(
        "run_id={} status={} steps_completed={} steps_failed={} compliance_score={:.4} overall_confidence={:.4}",
        summary.run_id,
        summary.status.as_str(),
        summary.steps_completed,
        summary.steps_failed,
        summary.compliance_score,
        summary.overall_confidence
    );
    Ok(())
}

fn events_command(args: &EventsArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let events = store.list_events_for_entity(&args.entity_id)?;
    for event in events {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

fn replay_command(args: &ReplayArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let backend = MockAgentBackend::new();
    let orchestrator = SandboxOrchestrator::new(&store, &backend);
    let report = orchestrator.replay_audit(&args.entity_id)?;

    println!(
        "entity_id={} events={} chain_valid={}",
        report.entity_id, report.events, report.chain_valid
    );
    Ok(())
}

fn export_command(args: &ExportArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let events = store.list_events_for_entity(&args.entity_id)?;
    let event_count = events.len();

    let output = File::create(&args.out)?;
    let mut writer = BufWriter::new(output);
    for event in &events {
        writeln!(writer, "{}", serde_json::to_string(&event.event)?)?;
    }
    writer.flush()?;

    println!("exported {} events to {}", event_count, args.out.display());
    Ok(())
}

fn open_store(path: &Path) -> Result<SqliteGovernanceStore> {
    let store = SqliteGovernanceStore::open(path)?;
    store.migrate()?;
    Ok(store)
}

fn read_json_file(path: &Path) -> Result<Value> {
    let body = std::fs::read_to_string(path)
        .map_err(|err| anyhow!("failed to read {}: {err}", path.display()))?;
    serde_json::from_str(&body).map_err(|err| anyhow!("invalid JSON in {}: {err}", path.display()))
}

fn parse_pipeline_id(input: &str) -> Result<PipelineId> {
    let value = Ulid::from_str(input).map_err(|err| anyhow!("invalid pipeline_id ULID: {err}"))?;
    Ok(PipelineId(value))
}

fn parse_run_id(input: &str) -> Result<RunId> {
    let value = Ulid::from_str(input).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
    Ok(RunId(value))
}
