use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use conductor::config::{Config, StatePaths};
use conductor::coordinator::{Coordinator, Envelope, SpawnRequest, WORKER_ID_ENV};
use conductor::core::{Role, WorkerId, WorkerStatus};
use conductor::orchestration::{HealthConfig, HealthMonitor, Priority};
use conductor::registry::WorkerFilter;
use conductor::transport::{SessionTransport, TmuxTransport};
use conductor::workflow::{RunId, RunSummary, WorkflowDefinition, WorkflowEngine};
use conductor::{clog, clog_debug, Error, Result};

/// Conductor - hierarchical coordinator for terminal-hosted AI workers
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    \
    CONDUCTOR_STATE_DIR   State directory (default ~/.conductor)\n    \
    CONDUCTOR_WORKER_ID   Caller identity, set inside worker sessions\n    \
    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to <state dir>/conductor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// State directory shared by every coordinator process
    #[arg(long, global = true, env = "CONDUCTOR_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Git repository that isolated worktrees are cut from
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    /// Identity of the calling worker
    #[arg(long = "as", global = true, env = WORKER_ID_ENV, default_value = "root")]
    pub caller: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Create the state directory, default config and root Delegate
    Init {
        /// Root metadata as key=value (value parsed as JSON when possible)
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },

    /// Spawn a worker under a parent
    Spawn {
        /// manager or specialist
        #[arg(long)]
        role: String,
        /// Parent worker (defaults to the caller)
        #[arg(long)]
        parent: Option<String>,
        /// Working directory when no worktree is requested
        #[arg(long)]
        work_dir: Option<PathBuf>,
        /// Context sent to the worker once its session is up
        #[arg(long)]
        context: Option<String>,
        /// Request an isolated worktree for this task
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        base_branch: Option<String>,
        /// low, medium, high or critical
        #[arg(long, default_value = "medium")]
        priority: String,
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },

    /// Send text to a worker's session
    Dispatch { worker: String, text: String },

    /// Show the tail of a worker's session output
    Peek {
        worker: String,
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },

    /// List workers
    Enumerate {
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        parent: Option<String>,
        /// A worker and all of its descendants
        #[arg(long)]
        subtree: Option<String>,
        /// Only spawning, active and blocked workers
        #[arg(long)]
        live: bool,
    },

    /// Terminate a worker (and by default its descendants)
    Terminate {
        worker: String,
        #[arg(long)]
        no_cascade: bool,
    },

    /// Start a workflow run and drive it to the end
    Run {
        /// Workflow definition (.toml or .json)
        workflow: PathBuf,
        /// Worker that receives stage prompts
        #[arg(long)]
        worker: String,
        /// Initial variables as key=value
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },

    /// Resume an interrupted run, or every non-terminal run
    Resume {
        run: Option<String>,
        #[arg(long, conflicts_with = "run")]
        all: bool,
    },

    /// List workflow runs
    Runs,

    /// Probe every active worker once and recover unhealthy ones
    Health,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let envelope = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(run(cli)),
        Err(e) => Envelope::from_result::<()>(Err(Error::Io(e))),
    };

    match serde_json::to_string_pretty(&envelope) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to encode result: {}", e),
    }
    if envelope.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run(cli: Cli) -> Envelope {
    let paths = match &cli.state_dir {
        Some(dir) => StatePaths::new(dir),
        None => match StatePaths::discover() {
            Ok(paths) => paths,
            Err(e) => return Envelope::from_result::<()>(Err(e)),
        },
    };
    let config = match Config::load(&paths) {
        Ok(config) => config,
        Err(e) => return Envelope::from_result::<()>(Err(e)),
    };
    conductor::log::init(&paths.root, config.log_level(), cli.debug);
    clog_debug!("Command {:?} as {}", cli.command, cli.caller);

    match execute(&cli, config, paths).await {
        Ok(data) => Envelope {
            ok: true,
            data: Some(data),
            error: None,
        },
        Err(e) => {
            clog!("Command failed: {}", e);
            Envelope::from_result::<()>(Err(e))
        }
    }
}

fn to_json<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// `key=value` pairs; values that parse as JSON keep their type.
fn parse_pairs(pairs: &[String]) -> Result<BTreeMap<String, Value>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, raw) = pair
                .split_once('=')
                .ok_or_else(|| Error::Validation(format!("expected KEY=VALUE, got {:?}", pair)))?;
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.into()));
            Ok((key.trim().to_string(), value))
        })
        .collect()
}

fn open_coordinator(cli: &Cli, config: Config, paths: StatePaths) -> Result<Arc<Coordinator>> {
    if !TmuxTransport::is_available() {
        return Err(Error::Tmux("tmux is not installed or not on PATH".into()));
    }
    let transport: Arc<dyn SessionTransport> =
        Arc::new(TmuxTransport::new(config.transport.enter_delay()));
    let coordinator = Coordinator::open(config, paths, transport, cli.repo.as_deref())?;
    Ok(Arc::new(coordinator))
}

async fn execute(cli: &Cli, config: Config, paths: StatePaths) -> Result<Value> {
    let caller: WorkerId = cli.caller.parse()?;

    let init = matches!(cli.command, Command::Init { .. });
    if init && !paths.config().exists() {
        config.save(&paths)?;
    }
    let coordinator = open_coordinator(cli, config, paths)?;
    if !init {
        coordinator.rehydrate().await?;
    }

    match &cli.command {
        Command::Init { metadata } => {
            let root = coordinator.init_root(parse_pairs(metadata)?).await?;
            clog!("Initialized state with root {}", root.id);
            to_json(root)
        }
        Command::Spawn {
            role,
            parent,
            work_dir,
            context,
            task,
            base_branch,
            priority,
            metadata,
        } => {
            let role: Role = role.parse()?;
            let parent = match parent {
                Some(p) => p.parse()?,
                None => caller.clone(),
            };
            let mut req = SpawnRequest::new(role, parent);
            req.work_dir = work_dir.clone();
            req.context = context.clone();
            req.task = task.clone();
            req.base_branch = base_branch.clone();
            req.priority = priority.parse::<Priority>()?;
            req.metadata = parse_pairs(metadata)?;
            to_json(coordinator.spawn(&caller, req).await?)
        }
        Command::Dispatch { worker, text } => {
            let worker: WorkerId = worker.parse()?;
            coordinator.dispatch(&caller, &worker, text).await?;
            to_json(serde_json::json!({ "dispatched": worker }))
        }
        Command::Peek { worker, lines } => {
            let worker: WorkerId = worker.parse()?;
            to_json(coordinator.peek(&caller, &worker, *lines).await?)
        }
        Command::Enumerate {
            role,
            status,
            parent,
            subtree,
            live,
        } => {
            let filter = WorkerFilter {
                role: role.as_deref().map(str::parse::<Role>).transpose()?,
                status: status
                    .as_deref()
                    .map(str::parse::<WorkerStatus>)
                    .transpose()?,
                parent: parent.as_deref().map(str::parse::<WorkerId>).transpose()?,
                subtree_of: subtree.as_deref().map(str::parse::<WorkerId>).transpose()?,
                live_only: *live,
            };
            to_json(coordinator.enumerate(&caller, &filter).await?)
        }
        Command::Terminate { worker, no_cascade } => {
            let worker: WorkerId = worker.parse()?;
            to_json(coordinator.terminate(&caller, &worker, !no_cascade).await?)
        }
        Command::Run {
            workflow,
            worker,
            vars,
        } => {
            let definition = WorkflowDefinition::load(workflow)?;
            let engine = WorkflowEngine::new(coordinator.clone());
            let run = engine
                .start(definition, worker.parse()?, caller, parse_pairs(vars)?)
                .await?;
            to_json(run)
        }
        Command::Resume { run, all } => {
            let engine = WorkflowEngine::new(coordinator.clone());
            match (run, all) {
                (Some(id), _) => to_json(engine.resume(&id.parse::<RunId>()?).await?),
                (None, true) => to_json(engine.resume_all().await?),
                (None, false) => Err(Error::Validation("name a run or pass --all".into())),
            }
        }
        Command::Runs => {
            let engine = WorkflowEngine::new(coordinator.clone());
            let listing = engine.list().await?;
            let runs: Vec<RunSummary> = listing.runs.iter().map(RunSummary::from).collect();
            to_json(serde_json::json!({
                "runs": runs,
                "quarantined": listing.quarantined,
            }))
        }
        Command::Health => {
            // Events are also returned by check_all; the channel only needs
            // to stay open for the round.
            let (tx, _rx) = mpsc::channel(64);
            let health = HealthConfig::from(&coordinator.config().health);
            let monitor = HealthMonitor::new(health, coordinator.clone(), tx);
            to_json(monitor.check_all().await)
        }
    }
}
