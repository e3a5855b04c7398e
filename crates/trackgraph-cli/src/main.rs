use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use trackgraph_domain::{ErrorDetails, ExecutionId, NodeKind, RecordStatus, TenantContext};
use trackgraph_engine::{
    BatchTrackRequest, ExecutionSelector, StartExecutionRequest, TrackItem, TrackingEngine,
};
use trackgraph_graph::{load_declared_graph_from_path, DeclaredModel};
use trackgraph_store_core::TrackingStore;
use trackgraph_store_sqlite::SqliteTrackingStore;

#[derive(Debug, Parser)]
#[command(name = "trackgraph")]
#[command(about = "Agent execution tracking with an observed SQLite graph")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start an execution explicitly.
    Start(StartArgs),
    /// Ingest one observed step.
    Track(TrackArgs),
    /// Ingest a batch of steps from a JSON file.
    TrackBatch(TrackBatchArgs),
    /// Finalize an execution.
    End(EndArgs),
    /// Seed an agent's graph from a declared YAML description.
    Ingest(IngestArgs),
    /// List agents of a tenant as JSON lines.
    Agents(AgentsArgs),
    /// List executions of an agent as JSON lines.
    Executions(ExecutionsArgs),
    /// List node-execution records of an execution as JSON lines.
    Records(RecordsArgs),
}

#[derive(Debug, Args)]
struct DbArgs {
    #[arg(long)]
    db: PathBuf,
}

#[derive(Debug, Args)]
struct TenantArgs {
    #[arg(long, default_value = "default")]
    tenant: String,
    #[arg(long, default_value = "production")]
    environment: String,
}

impl TenantArgs {
    fn context(&self) -> TenantContext {
        TenantContext {
            tenant_id: self.tenant.clone(),
            environment: self.environment.clone(),
        }
    }
}

#[derive(Debug, Args)]
struct SelectorArgs {
    #[arg(long)]
    execution_id: Option<String>,
    #[arg(long)]
    correlation_id: Option<String>,
    #[arg(long)]
    agent: Option<String>,
}

impl SelectorArgs {
    fn selector(&self) -> Result<ExecutionSelector> {
        Ok(ExecutionSelector {
            execution_id: self
                .execution_id
                .as_deref()
                .map(parse_execution_id)
                .transpose()?,
            external_correlation_id: self.correlation_id.clone(),
            agent_name: self.agent.clone(),
        })
    }
}

#[derive(Debug, Args)]
struct StartArgs {
    #[command(flatten)]
    db: DbArgs,
    #[command(flatten)]
    tenant: TenantArgs,
    #[arg(long)]
    agent: String,
    #[arg(long)]
    description: Option<String>,
    /// Run input as a JSON document.
    #[arg(long, default_value = "null")]
    input: String,
    #[arg(long)]
    correlation_id: Option<String>,
}

#[derive(Debug, Args)]
struct TrackArgs {
    #[command(flatten)]
    db: DbArgs,
    #[command(flatten)]
    tenant: TenantArgs,
    #[command(flatten)]
    selector: SelectorArgs,
    #[arg(long)]
    node_id: Option<String>,
    #[arg(long)]
    node_name: Option<String>,
    #[arg(long, default_value = "tool")]
    kind: String,
    #[arg(long)]
    tool_type: Option<String>,
    #[arg(long)]
    model_provider: Option<String>,
    #[arg(long)]
    model_problem_type: Option<String>,
    #[arg(long, default_value = "success")]
    status: String,
    /// Step payload as a JSON document.
    #[arg(long, default_value = "null")]
    payload: String,
}

#[derive(Debug, Args)]
struct TrackBatchArgs {
    #[command(flatten)]
    db: DbArgs,
    #[command(flatten)]
    tenant: TenantArgs,
    /// JSON file holding the batch request (selector fields plus items).
    #[arg(long)]
    batch: PathBuf,
}

#[derive(Debug, Args)]
struct EndArgs {
    #[command(flatten)]
    db: DbArgs,
    #[command(flatten)]
    tenant: TenantArgs,
    #[command(flatten)]
    selector: SelectorArgs,
    #[arg(long)]
    error_message: Option<String>,
    #[arg(long)]
    error_stack: Option<String>,
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[command(flatten)]
    db: DbArgs,
    #[command(flatten)]
    tenant: TenantArgs,
    #[arg(long)]
    graph: PathBuf,
}

#[derive(Debug, Args)]
struct AgentsArgs {
    #[command(flatten)]
    db: DbArgs,
    #[command(flatten)]
    tenant: TenantArgs,
}

#[derive(Debug, Args)]
struct ExecutionsArgs {
    #[command(flatten)]
    db: DbArgs,
    #[command(flatten)]
    tenant: TenantArgs,
    #[arg(long)]
    agent: String,
}

#[derive(Debug, Args)]
struct RecordsArgs {
    #[command(flatten)]
    db: DbArgs,
    #[arg(long)]
    execution_id: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => start_command(&args),
        Commands::Track(args) => track_command(&args),
        Commands::TrackBatch(args) => track_batch_command(&args),
        Commands::End(args) => end_command(&args),
        Commands::Ingest(args) => ingest_command(&args),
        Commands::Agents(args) => agents_command(&args),
        Commands::Executions(args) => executions_command(&args),
        Commands::Records(args) => records_command(&args),
    }
}

fn open_store(args: &DbArgs) -> Result<SqliteTrackingStore> {
    let store = SqliteTrackingStore::open(&args.db)?;
    store.migrate()?;
    Ok(store)
}

fn start_command(args: &StartArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let engine = TrackingEngine::new(&store);
    let execution = engine.start_execution(
        &args.tenant.context(),
        &StartExecutionRequest {
            agent_name: args.agent.clone(),
            agent_description: args.description.clone(),
            input: parse_json("input", &args.input)?,
            external_correlation_id: args.correlation_id.clone(),
        },
    )?;
    println!(
        "execution_id={} agent_id={} status={}",
        execution.execution_id,
        execution.agent_id,
        execution.status.as_str()
    );
    Ok(())
}

fn track_command(args: &TrackArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let engine = TrackingEngine::new(&store);

    let model = match (&args.model_provider, &args.model_problem_type) {
        (None, None) => None,
        (provider, problem_type) => Some(DeclaredModel {
            provider: provider.clone(),
            problem_type: problem_type.clone(),
            params: serde_json::Value::Null,
        }),
    };
    let item = TrackItem {
        node_id: args.node_id.clone(),
        node_name: args.node_name.clone(),
        kind: NodeKind::parse(&args.kind)?,
        tool_type: args.tool_type.clone(),
        model,
        description: None,
        status: RecordStatus::parse(&args.status)?,
        payload: parse_json("payload", &args.payload)?,
        input_name: None,
        output_name: None,
    };

    let response = engine.track_event(&args.tenant.context(), &args.selector.selector()?, &item)?;
    println!(
        "execution_id={} inferred={} node_id={} node_created={} record_seq={}",
        response.execution_id,
        response.execution_inferred,
        response.node_id,
        response.node_created,
        response.record_seq
    );
    Ok(())
}

fn track_batch_command(args: &TrackBatchArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let engine = TrackingEngine::new(&store);

    let raw = fs::read_to_string(&args.batch)
        .map_err(|err| anyhow!("failed to read {}: {err}", args.batch.display()))?;
    let request: BatchTrackRequest = serde_json::from_str(&raw)
        .map_err(|err| anyhow!("invalid batch request JSON: {err}"))?;

    let response = engine.track_batch(&args.tenant.context(), &request)?;
    for item in &response.items {
        println!("{}", serde_json::to_string(item)?);
    }
    println!(
        "execution_id={} inferred={} items={}",
        response.execution_id,
        response.execution_inferred,
        response.items.len()
    );
    Ok(())
}

fn end_command(args: &EndArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let engine = TrackingEngine::new(&store);

    let error = args.error_message.as_ref().map(|message| ErrorDetails {
        message: message.clone(),
        stack: args.error_stack.clone(),
    });
    let summary = engine.end_execution(&args.tenant.context(), &args.selector.selector()?, error)?;
    println!(
        "execution_id={} status={} duration_ms={}",
        summary.execution_id,
        summary.status.as_str(),
        summary.duration_ms.unwrap_or_default()
    );
    Ok(())
}

fn ingest_command(args: &IngestArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let engine = TrackingEngine::new(&store);

    let graph = load_declared_graph_from_path(&args.graph)?;
    let summary = engine.ingest_declared_graph(&args.tenant.context(), graph)?;
    println!(
        "agent_id={} agent_created={} nodes_created={} edges_created={}",
        summary.agent_id, summary.agent_created, summary.nodes_created, summary.edges_created
    );
    Ok(())
}

fn agents_command(args: &AgentsArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    for agent in store.list_agents(&args.tenant.tenant)? {
        println!("{}", serde_json::to_string(&agent)?);
    }
    Ok(())
}

fn executions_command(args: &ExecutionsArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let candidates = trackgraph_domain::normalize_forms(&args.agent).candidates();
    let agent = store
        .find_agent_by_slug(&args.tenant.tenant, &candidates)?
        .ok_or_else(|| anyhow!("agent not found: {}", args.agent))?;
    for execution in store.list_executions(agent.agent_id)? {
        println!("{}", serde_json::to_string(&execution)?);
    }
    Ok(())
}

fn records_command(args: &RecordsArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let execution_id = parse_execution_id(&args.execution_id)?;
    for row in store.list_records(execution_id)? {
        println!("{}", serde_json::to_string(&row)?);
    }
    Ok(())
}

fn parse_execution_id(value: &str) -> Result<ExecutionId> {
    ExecutionId::from_str(value).map_err(|err| anyhow!("invalid execution_id {value}: {err}"))
}

fn parse_json(field: &str, raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid {field} JSON: {err}"))
}
