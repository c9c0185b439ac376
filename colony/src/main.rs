//! Coordinate a colony of coding agents on a shared task graph.
//!
//! State lives under `<root>/.colony/` (one JSON record per task and agent,
//! executor logs, an append-only progress log); settings in `colony.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use colony::exit_codes;
use colony::io::agent_registry::{AgentRegistry, FileAgentRegistry};
use colony::io::config::{ColonyConfig, load_config};
use colony::io::executor::{AGENT_ID_ENV, CommandExecutor, ExecutorKind};
use colony::io::init::{ColonyPaths, InitOptions, init_colony};
use colony::io::task_store::{FileTaskStore, TaskStore};
use colony::logging;
use colony::roles::Services;
use colony::scheduler::{Scheduler, SchedulerConfig};
use colony::status::collect_status;
use colony::task::{NewTask, TaskStatus};

#[derive(Parser)]
#[command(
    name = "colony",
    version,
    about = "File-backed task queue and scheduler for a colony of coding agents"
)]
struct Cli {
    /// Project root holding `colony.toml` and `.colony/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.colony/` and a starter `colony.toml`.
    Init {
        /// Overwrite an existing `colony.toml` (task and agent records are kept).
        #[arg(short, long)]
        force: bool,
        /// Project goal to write into the config.
        #[arg(long)]
        goal: Option<String>,
    },
    /// Run scheduler cycles until the goal is met, the colony is stuck, or the budget runs out.
    Run(RunArgs),
    /// Print task counts, tasks, live agents and invariant violations.
    Status {
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Create or list tasks.
    #[command(subcommand)]
    Task(TaskCommand),
    /// Mark silent agents stale and release the tasks they held.
    Sweep {
        /// Override `scheduler.stale_timeout_secs`.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Agent backend to invoke.
    #[arg(long, value_enum)]
    executor: ExecutorKind,
    /// Concurrent workers per cycle (overrides `scheduler.max_workers`).
    #[arg(long)]
    workers: Option<usize>,
    /// Run the executive every K cycles (overrides `scheduler.exec_interval`).
    #[arg(long)]
    exec_interval: Option<u32>,
    /// Cycle budget (overrides `scheduler.max_cycles`).
    #[arg(long)]
    max_cycles: Option<u32>,
    /// Config file (defaults to `<root>/colony.toml`).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Add a pending task.
    Add {
        id: String,
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Acceptance criterion (repeatable).
        #[arg(long = "criteria")]
        criteria: Vec<String>,
        /// Task id that must complete first (repeatable).
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
        /// Lower is claimed first.
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i64,
        /// Defaults to `tasks.max_attempts_default`.
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Defaults to `task/<id>`.
        #[arg(long)]
        branch: Option<String>,
    },
    /// List tasks, optionally filtered by status.
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
    },
}

fn main() {
    // Usage errors must not collide with the run exit codes.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                exit_codes::INVALID
            } else {
                exit_codes::SUCCESS
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    logging::init();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = resolve_root(&cli.root)?;
    match cli.command {
        Command::Init { force, goal } => cmd_init(&root, force, goal),
        Command::Run(args) => cmd_run(&root, args),
        Command::Status { json } => cmd_status(&root, json),
        Command::Task(TaskCommand::Add {
            id,
            title,
            description,
            criteria,
            depends_on,
            priority,
            max_attempts,
            branch,
        }) => {
            let mut task = NewTask::new(id, title)
                .with_dependencies(depends_on)
                .with_priority(priority);
            task.description = description;
            task.acceptance_criteria = criteria;
            task.branch = branch;
            cmd_task_add(&root, task, max_attempts)
        }
        Command::Task(TaskCommand::List { status }) => cmd_task_list(&root, status),
        Command::Sweep { timeout_secs } => cmd_sweep(&root, timeout_secs),
    }
}

fn resolve_root(root: &Path) -> Result<PathBuf> {
    fs::canonicalize(root).with_context(|| format!("resolve project root {}", root.display()))
}

fn cmd_init(root: &Path, force: bool, goal: Option<String>) -> Result<i32> {
    let paths = init_colony(root, &InitOptions { force, goal })?;
    println!("initialized {}", paths.state_dir.display());
    println!("edit {} to set the project goal", paths.config_path.display());
    Ok(exit_codes::SUCCESS)
}

fn cmd_run(root: &Path, args: RunArgs) -> Result<i32> {
    let paths = ColonyPaths::new(root);
    let config_path = args.config.unwrap_or_else(|| paths.config_path.clone());
    let mut config = load_config(&config_path)?;
    if let Some(workers) = args.workers {
        config.scheduler.max_workers = workers;
    }
    if let Some(interval) = args.exec_interval {
        config.scheduler.exec_interval = interval;
    }
    if let Some(max_cycles) = args.max_cycles {
        config.scheduler.max_cycles = max_cycles;
    }
    config.validate().context("invalid run settings")?;

    let executor = CommandExecutor::from_kind(args.executor, &config.executor.command)?;
    let services = Services::open(&paths, &config, Arc::new(executor))?;
    let outcome = Scheduler::new(services, SchedulerConfig::from_settings(&config.scheduler)).run()?;

    println!(
        "run ended after {} cycles: {:?} ({})",
        outcome.cycles_run, outcome.stop, outcome.tasks
    );
    Ok(outcome.stop.exit_code())
}

fn cmd_status(root: &Path, json: bool) -> Result<i32> {
    let paths = ColonyPaths::new(root);
    let tasks = FileTaskStore::open(&paths.tasks_dir)?;
    let agents = FileAgentRegistry::open(&paths.agents_dir)?;
    let report = collect_status(&tasks, &agents)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize status")?
        );
    } else {
        print!("{report}");
    }
    Ok(exit_codes::SUCCESS)
}

fn cmd_task_add(root: &Path, mut task: NewTask, max_attempts: Option<u32>) -> Result<i32> {
    let paths = ColonyPaths::new(root);
    let config = config_or_default(&paths)?;
    task.max_attempts = max_attempts.unwrap_or(config.tasks.max_attempts_default);
    if let Ok(agent_id) = std::env::var(AGENT_ID_ENV)
        && !agent_id.trim().is_empty()
    {
        task.created_by = agent_id;
    }
    let store = FileTaskStore::open(&paths.tasks_dir)?;
    let created = store.create(task)?;
    println!("{}", created.id);
    Ok(exit_codes::SUCCESS)
}

fn cmd_task_list(root: &Path, status: Option<TaskStatus>) -> Result<i32> {
    let paths = ColonyPaths::new(root);
    let store = FileTaskStore::open(&paths.tasks_dir)?;
    for task in store.list(status)? {
        println!("{}\t{}\t{}", task.id, task.status, task.title);
    }
    Ok(exit_codes::SUCCESS)
}

fn cmd_sweep(root: &Path, timeout_secs: Option<u64>) -> Result<i32> {
    let paths = ColonyPaths::new(root);
    let config = config_or_default(&paths)?;
    let timeout =
        Duration::from_secs(timeout_secs.unwrap_or(config.scheduler.stale_timeout_secs));
    let tasks = FileTaskStore::open(&paths.tasks_dir)?;
    let agents = FileAgentRegistry::open(&paths.agents_dir)?;
    let stale = agents.cleanup(timeout, &tasks)?;
    for agent in &stale {
        println!(
            "{} stale (held {})",
            agent.id,
            agent.current_task.as_deref().unwrap_or("nothing")
        );
    }
    println!("{} agent(s) marked stale", stale.len());
    Ok(exit_codes::SUCCESS)
}

/// Commands that only touch records work without `colony.toml`.
fn config_or_default(paths: &ColonyPaths) -> Result<ColonyConfig> {
    if paths.config_path.exists() {
        return load_config(&paths.config_path);
    }
    debug!(path = %paths.config_path.display(), "no config, using defaults");
    Ok(ColonyConfig::default())
}
