use std::collections::VecDeque;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Mutex;

use clap::{CommandFactory, Parser, Subcommand};
use futures::future::BoxFuture;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepflow_core::config::AppConfig;
use stepflow_core::error::{Result as StepflowResult, StepflowError};
use stepflow_core::traits::HumanFrontEnd;
use stepflow_core::types::{RequestInfoMessage, RunState};
use stepflow_engine::{
    drive_interactive, open_storage, CheckpointManager, RunOutcome, WorkflowRun, WorkflowRunner,
};
use stepflow_workflows::{Collaborators, WorkflowRegistry};

#[derive(Parser)]
#[command(name = "stepflow", version, about = "Superstep workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow with a text input
    Run {
        /// Workflow name (see `stepflow workflows`)
        workflow: String,
        /// Initial input; read from stdin when empty
        #[arg(trailing_var_arg = true)]
        input: Vec<String>,
        /// Answers for human requests, used in order before prompting
        #[arg(short, long)]
        answer: Vec<String>,
    },
    /// Resume a suspended run from a checkpoint
    Resume {
        /// Workflow the checkpoint belongs to
        workflow: String,
        /// Checkpoint id (see `stepflow checkpoints`)
        checkpoint_id: String,
        /// Answers for human requests, used in order before prompting
        #[arg(short, long)]
        answer: Vec<String>,
    },
    /// List saved checkpoints, newest first
    Checkpoints {
        /// Only show checkpoints of this workflow
        #[arg(short, long)]
        workflow: Option<String>,
    },
    /// Delete a checkpoint
    Delete {
        checkpoint_id: String,
    },
    /// List registered workflows
    Workflows,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Prompts on the terminal, after handing out any answers given on the
/// command line.
struct ConsoleFrontEnd {
    scripted: Mutex<VecDeque<String>>,
}

impl ConsoleFrontEnd {
    fn new(answers: Vec<String>) -> Self {
        Self {
            scripted: Mutex::new(answers.into()),
        }
    }

    fn next_scripted(&self) -> Option<String> {
        self.scripted.lock().ok().and_then(|mut q| q.pop_front())
    }
}

impl HumanFrontEnd for ConsoleFrontEnd {
    fn ask<'a>(&'a self, request: &'a RequestInfoMessage) -> BoxFuture<'a, StepflowResult<String>> {
        Box::pin(async move {
            if let Some(preview) = &request.preview {
                println!("\n{}\n", preview);
            }
            if let Some(answer) = self.next_scripted() {
                println!("{} {}", request.prompt, answer);
                return Ok(answer);
            }

            let prompt = request.prompt.clone();
            tokio::task::spawn_blocking(move || {
                dialoguer::Input::<String>::new()
                    .with_prompt(prompt)
                    .interact_text()
            })
            .await
            .map_err(|e| StepflowError::Collaborator {
                name: "human".to_string(),
                message: e.to_string(),
            })?
            .map_err(|e| StepflowError::Collaborator {
                name: "human".to_string(),
                message: e.to_string(),
            })
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stepflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "stepflow", &mut io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)?;
    info!(config = %cli.config.display(), "Loaded config");

    let registry =
        WorkflowRegistry::with_defaults(&Collaborators::offline(config.engine.collaborator_timeout()));

    match cli.command {
        Commands::Run {
            workflow,
            input,
            answer,
        } => {
            let input = read_input(input)?;
            let runner = runner_for(&config, &registry, &workflow)?;
            let mut run = runner.start(input);
            let outcome = drive(&mut run, &config, answer).await?;
            report(&outcome);
        }
        Commands::Resume {
            workflow,
            checkpoint_id,
            answer,
        } => {
            let runner = runner_for(&config, &registry, &workflow)?;
            let mut run = runner.resume(&checkpoint_id).await?;
            info!(run_id = %run.run_id(), checkpoint_id = %checkpoint_id, "Resumed run");
            let outcome = drive(&mut run, &config, answer).await?;
            report(&outcome);
        }
        Commands::Checkpoints { workflow } => {
            let manager = CheckpointManager::new(open_storage(&config.checkpoint)?);
            let checkpoints = manager.list(workflow.as_deref()).await?;
            if checkpoints.is_empty() {
                println!("No checkpoints.");
            }
            for cp in checkpoints {
                println!(
                    "{}  {}  {}  superstep {}  {}",
                    cp.checkpoint_id,
                    cp.created_at.format("%Y-%m-%d %H:%M:%S"),
                    cp.workflow_id,
                    cp.snapshot.superstep,
                    cp.snapshot.state,
                );
            }
        }
        Commands::Delete { checkpoint_id } => {
            let manager = CheckpointManager::new(open_storage(&config.checkpoint)?);
            if manager.delete(&checkpoint_id).await? {
                println!("Deleted {}", checkpoint_id);
            } else {
                anyhow::bail!("checkpoint not found: {}", checkpoint_id);
            }
        }
        Commands::Workflows => {
            for name in registry.names() {
                println!("{}", name);
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn read_input(words: Vec<String>) -> anyhow::Result<String> {
    let text = words.join(" ");
    if !text.is_empty() {
        return Ok(text);
    }
    let stdin = io::stdin();
    let lines: Vec<String> = stdin.lock().lines().collect::<io::Result<_>>()?;
    Ok(lines.join("\n"))
}

fn runner_for(
    config: &AppConfig,
    registry: &WorkflowRegistry,
    name: &str,
) -> anyhow::Result<WorkflowRunner> {
    let workflow = registry.get(name)?;
    let manager = CheckpointManager::new(open_storage(&config.checkpoint)?);
    Ok(WorkflowRunner::new(workflow)
        .with_config(config)
        .with_checkpointing(manager))
}

/// Run until the run stops waiting on a human. Ctrl-C cancels it.
async fn drive(
    run: &mut WorkflowRun,
    config: &AppConfig,
    answers: Vec<String>,
) -> anyhow::Result<RunOutcome> {
    let cancel = run.cancel_token();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            cancel.cancel();
        }
    });

    let front_end = ConsoleFrontEnd::new(answers);
    let result = drive_interactive(run, &front_end, config.hitl.response_timeout()).await;
    watcher.abort();

    match result {
        Ok(outcome) => Ok(outcome),
        Err(e @ StepflowError::CollaboratorTimeout { .. }) => {
            if let Some(id) = run.last_checkpoint_id() {
                eprintln!("Run left suspended; resume with checkpoint {}", id);
            }
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn report(outcome: &RunOutcome) {
    for output in &outcome.outputs {
        println!("{}", output.to_display_string());
    }
    eprintln!(
        "[{} | {} supersteps | run {}]",
        outcome.state, outcome.supersteps, outcome.run_id
    );
    if let Some(failure) = &outcome.failure {
        eprintln!(
            "Failed at superstep {}{}: {}",
            failure.superstep,
            failure
                .executor_id
                .as_deref()
                .map(|id| format!(" in {}", id))
                .unwrap_or_default(),
            failure.error
        );
    }
    if outcome.state == RunState::Failed {
        std::process::exit(1);
    }
}
