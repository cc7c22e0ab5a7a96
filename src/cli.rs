//! Command-line surface: one subcommand per engine operation.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use devflow_config::Config;
use devflow_types::{WorkflowFilter, WorkflowKind, WorkflowSpec, WorkflowState};

use crate::Orchestrator;

#[derive(Parser)]
#[command(name = "devflow", version, about = "Agentic developer workflow orchestrator")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "devflow.toml")]
    pub config: Utf8PathBuf,

    /// Workspace root for state and the event journal.
    #[arg(long, default_value = ".")]
    pub workspace: Utf8PathBuf,

    /// Verbose (structured) log output.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a workflow and print its id.
    Create(CreateArgs),
    /// Start a created workflow.
    Start {
        workflow_id: String,
        /// Block until the workflow reaches a resting state.
        #[arg(long)]
        wait: bool,
    },
    /// Pause a running workflow at its next phase boundary.
    Pause { workflow_id: String },
    /// Resume a paused workflow.
    Resume { workflow_id: String },
    /// Cancel a workflow.
    Cancel {
        workflow_id: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Archive a terminal workflow (deletes its phases and events).
    Archive { workflow_id: String },
    /// Show one workflow as JSON.
    Get { workflow_id: String },
    /// List workflows.
    List {
        /// Filter by state (repeatable).
        #[arg(long = "state")]
        states: Vec<String>,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Stream a workflow's recorded events as JSON lines.
    Events {
        workflow_id: String,
        #[arg(long)]
        since: Option<i64>,
    },
    /// Component health.
    Health,
    /// Metrics snapshot and daily rollups.
    Metrics {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
}

#[derive(Args)]
pub struct CreateArgs {
    #[arg(long)]
    pub name: String,
    #[arg(long, default_value = "standard")]
    pub kind: String,
    /// Task description; taken verbatim into phase prompts.
    #[arg(long)]
    pub task: String,
    #[arg(long = "tag")]
    pub tags: Vec<String>,
    #[arg(long)]
    pub model_set: Option<String>,
    #[arg(long)]
    pub budget_usd: Option<f64>,
    #[arg(long)]
    pub issue_ref: Option<String>,
    /// Immediately start the workflow.
    #[arg(long)]
    pub start: bool,
}

pub async fn run(cli: Cli) -> Result<i32> {
    let config = if cli.config.exists() {
        Config::from_path(&cli.config)
            .with_context(|| format!("loading configuration from {}", cli.config))?
    } else {
        Config::default()
    };
    let orchestrator = Orchestrator::bootstrap(config, &cli.workspace).await?;

    match cli.command {
        Command::Create(args) => {
            let kind = WorkflowKind::parse(&args.kind)
                .with_context(|| format!("unknown workflow kind '{}'", args.kind))?;
            let model_set = match &args.model_set {
                Some(raw) => devflow_types::ModelSet::parse(raw)
                    .with_context(|| format!("unknown model set '{raw}'"))?,
                None => devflow_types::ModelSet::default(),
            };
            let spec = WorkflowSpec {
                name: args.name,
                kind,
                task: args.task,
                tags: args.tags.into_iter().collect::<BTreeSet<_>>(),
                model_set,
                budget_usd: args.budget_usd,
                issue_ref: args.issue_ref,
                ..Default::default()
            };
            let id = orchestrator.create(spec).await?;
            println!("{id}");
            if args.start {
                orchestrator.start(&id)?;
                orchestrator.wait_idle(&id).await;
                let workflow = orchestrator.get(&id)?;
                println!("{}", serde_json::to_string_pretty(&workflow)?);
                return Ok(exit_code_for(workflow.state));
            }
        }
        Command::Start { workflow_id, wait } => {
            orchestrator.start(&workflow_id)?;
            if wait {
                orchestrator.wait_idle(&workflow_id).await;
                let workflow = orchestrator.get(&workflow_id)?;
                println!("{}", serde_json::to_string_pretty(&workflow)?);
                return Ok(exit_code_for(workflow.state));
            }
        }
        Command::Pause { workflow_id } => orchestrator.pause(&workflow_id)?,
        Command::Resume { workflow_id } => orchestrator.resume(&workflow_id)?,
        Command::Cancel {
            workflow_id,
            reason,
        } => orchestrator.cancel(&workflow_id, &reason)?,
        Command::Archive { workflow_id } => {
            let workflow = orchestrator.archive(&workflow_id).await?;
            println!("{}", serde_json::to_string_pretty(&workflow)?);
        }
        Command::Get { workflow_id } => {
            let workflow = orchestrator.get(&workflow_id)?;
            println!("{}", serde_json::to_string_pretty(&workflow)?);
        }
        Command::List { states, limit } => {
            let mut filter = WorkflowFilter {
                limit,
                ..Default::default()
            };
            for raw in &states {
                let state = WorkflowState::parse(raw)
                    .with_context(|| format!("unknown workflow state '{raw}'"))?;
                filter.states.push(state);
            }
            for workflow in orchestrator.list(&filter)? {
                println!(
                    "{}  {:<10}  {:<11}  {}",
                    workflow.id, workflow.kind, workflow.state, workflow.name
                );
            }
        }
        Command::Events {
            workflow_id,
            since,
        } => {
            for event in orchestrator.events(&workflow_id, since)? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Command::Health => {
            let report = orchestrator.health();
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.overall() != devflow_engine::ComponentHealth::Healthy {
                return Ok(1);
            }
        }
        Command::Metrics { days } => {
            let snapshot = orchestrator.metrics()?;
            let daily = orchestrator.daily_metrics(days)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "snapshot": snapshot,
                    "daily": daily,
                }))?
            );
        }
    }
    Ok(0)
}

fn exit_code_for(state: WorkflowState) -> i32 {
    match state {
        WorkflowState::Completed => 0,
        WorkflowState::Cancelled => 130,
        _ => 1,
    }
}
