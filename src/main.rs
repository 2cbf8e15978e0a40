//! red64 CLI: a thin reference caller for the orchestration engine.
//!
//! This binary owns no orchestration logic of its own; it parses arguments,
//! wires up stdout-based progress/checkpoint callbacks, and delegates every
//! operation to [`red64::Orchestrator`].

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use red64::task_runner::CheckpointDecision;
use red64::{AgentKind, Config, Mode, Orchestrator, Result, StartFlags};

#[derive(Parser)]
#[command(name = "red64")]
#[command(author, version, about = "Deterministic spec-driven development orchestrator")]
#[command(propagate_version = true)]
struct Cli {
    /// Working directory containing (or to contain) the git repository.
    #[arg(short, long, global = true, default_value = ".")]
    work_dir: PathBuf,

    /// Configuration file path; defaults to `<work-dir>/.red64/settings/config.toml`.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new feature flow, or resume an in-progress one of the same name.
    Start {
        feature: String,
        description: String,
        #[arg(long, value_enum, default_value = "greenfield")]
        mode: ModeArg,
        #[arg(long, value_enum, default_value = "claude")]
        agent: AgentArg,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        skip_permissions: bool,
    },

    /// Approve the current gate phase and continue to the next stage.
    Approve { feature: String },

    /// Reject the current gate phase, regenerating the prior artifact.
    Reject { feature: String },

    /// Run the approved task list to completion (or the next checkpoint).
    Implement {
        feature: String,
        #[arg(long, value_enum, default_value = "claude")]
        agent: AgentArg,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        skip_permissions: bool,
    },

    /// Resume a paused implementation.
    Resume { feature: String },

    /// Push the feature branch and open a pull request.
    Pr {
        feature: String,
        #[arg(long, default_value = "main")]
        base: String,
    },

    /// Merge the feature's pull request (squash, deleting the branch) and complete the flow.
    Merge { feature: String },

    /// Leave the pull request open and complete the flow without merging.
    SkipMerge { feature: String },

    /// Abort a feature: stop work, close the PR, delete the branch and worktree.
    Abort { feature: String, reason: String },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ModeArg {
    Greenfield,
    Brownfield,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Greenfield => Mode::Greenfield,
            ModeArg::Brownfield => Mode::Brownfield,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum AgentArg {
    Claude,
    Gemini,
    Codex,
}

impl From<AgentArg> for AgentKind {
    fn from(a: AgentArg) -> Self {
        match a {
            AgentArg::Claude => AgentKind::Claude,
            AgentArg::Gemini => AgentKind::Gemini,
            AgentArg::Codex => AgentKind::Codex,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load(cli.config.as_deref())?;
    let mut orchestrator = Orchestrator::new(&cli.work_dir, config);

    match cli.command {
        Commands::Start {
            feature,
            description,
            mode,
            agent,
            model,
            skip_permissions,
        } => {
            let flags = StartFlags {
                agent: agent.into(),
                model,
                skip_permissions,
                sandbox: None,
            };
            let state = orchestrator.start(&feature, &description, mode.into(), flags).await?;
            info!(phase = state.phase.type_tag(), "flow advanced");
            println!("{}", serde_json::to_string_pretty(&state)?);
        }

        Commands::Approve { feature } => {
            let mut state = load_required(&mut orchestrator, &feature)?;
            orchestrator.approve(&mut state)?;
            let flags = default_flags();
            orchestrator.resume_driving(&mut state, &flags).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }

        Commands::Reject { feature } => {
            let mut state = load_required(&mut orchestrator, &feature)?;
            orchestrator.reject(&mut state)?;
            let flags = default_flags();
            orchestrator.resume_driving(&mut state, &flags).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }

        Commands::Implement {
            feature,
            agent,
            model,
            skip_permissions,
        } => {
            let mut state = load_required(&mut orchestrator, &feature)?;
            let flags = StartFlags {
                agent: agent.into(),
                model,
                skip_permissions,
                sandbox: None,
            };
            orchestrator
                .run_implementation(
                    &mut state,
                    &flags,
                    Box::new(|done, total, task| {
                        println!("[{done}/{total}] {} {}", task.id, task.title);
                    }),
                    Box::new(|done, total| {
                        println!("checkpoint at {done}/{total}, continuing");
                        CheckpointDecision::Continue
                    }),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }

        Commands::Resume { feature } => {
            let mut state = load_required(&mut orchestrator, &feature)?;
            orchestrator.resume_from_pause(&mut state)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }

        Commands::Pr { feature, base } => {
            let mut state = load_required(&mut orchestrator, &feature)?;
            orchestrator.create_pr(&mut state, &base).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }

        Commands::Merge { feature } => {
            let mut state = load_required(&mut orchestrator, &feature)?;
            orchestrator.merge(&mut state).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }

        Commands::SkipMerge { feature } => {
            let mut state = load_required(&mut orchestrator, &feature)?;
            orchestrator.skip_merge(&mut state)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }

        Commands::Abort { feature, reason } => {
            let mut state = load_required(&mut orchestrator, &feature)?;
            let failures = orchestrator.abort(&mut state, &reason).await?;
            for f in &failures {
                eprintln!("teardown warning: {f}");
            }
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
    }

    Ok(())
}

fn default_flags() -> StartFlags {
    StartFlags {
        agent: AgentKind::Claude,
        model: None,
        skip_permissions: false,
        sandbox: None,
    }
}

fn load_required(orchestrator: &mut Orchestrator, feature: &str) -> Result<red64::FlowState> {
    orchestrator
        .load_state(feature)?
        .ok_or_else(|| red64::Error::validation(format!("no flow state found for feature {feature}")))
}
