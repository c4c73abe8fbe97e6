//! Iteration loop controller for autonomous coding agents.
//!
//! Drives a stateless agent CLI against a task manifest, one bounded
//! invocation per iteration. Project state lives under the ralph home
//! (`~/.ralph` or `RALPH_HOME`), never inside the target workspace.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::warn;

use ralph::core::types::{HaltReason, LoopKind};
use ralph::exit_codes;
use ralph::io::agent::{CommandAgent, ToolPolicy};
use ralph::io::cancel::CancelToken;
use ralph::io::clock::now_rfc3339;
use ralph::io::config::{RalphConfig, load_config, write_config};
use ralph::io::lock::ProjectLock;
use ralph::io::manifest_store::load_manifest;
use ralph::io::project::{
    InitOptions, RalphHome, delete_project, init_project, list_projects, request_stop,
};
use ralph::io::run_state::{RunState, load_run_state, write_run_state};
use ralph::io::sandbox::RunSandbox;
use ralph::io::state_store::FileStateStore;
use ralph::io::verify::ShellVerifier;
use ralph::logging;
use ralph::looping::run_loop;
use ralph::status::{collect_status, render_status};
use ralph::step::{IterationReport, StepConfig};

#[derive(Parser, Debug)]
#[command(
    name = "ralph",
    version,
    about = "Iteration loop controller for autonomous coding agents"
)]
struct Cli {
    /// State directory (default: ~/.ralph).
    #[arg(long, global = true, env = "RALPH_HOME")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a target workspace as a project.
    Init {
        name: String,
        /// Code workspace the agent works in.
        target: PathBuf,
        /// Import this manifest instead of the starter template.
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Overwrite existing project state.
        #[arg(short, long)]
        force: bool,
    },
    /// Run iterations until complete, GUTTER, the iteration budget, or a stop.
    Run {
        name: String,
        /// Iteration budget for this run (default: the manifest's max_iterations).
        #[arg(short = 'n', long = "iterations", conflicts_with = "once")]
        iterations: Option<u32>,
        /// Run a single iteration.
        #[arg(long)]
        once: bool,
        /// Instruction template family.
        #[arg(long = "type", value_enum, default_value_t = LoopKind::Default)]
        loop_kind: LoopKind,
        /// Run the agent and verification inside a container.
        #[arg(long)]
        sandbox: bool,
        /// Fall back to host execution if the container runtime is unavailable.
        #[arg(long)]
        allow_unsandboxed: bool,
    },
    /// Show task progress, the next task and recent iterations.
    Status {
        name: String,
        /// Number of ledger sections to show.
        #[arg(long, default_value_t = 3)]
        recent: usize,
    },
    /// List registered projects.
    List,
    /// Remove a project's state (the target workspace is left alone).
    Delete { name: String },
    /// Ask a running loop to halt after the current poll.
    Stop { name: String },
    /// Check a project's manifest (or a manifest file) against schema and invariants.
    Validate {
        #[arg(required_unless_present = "file")]
        name: Option<String>,
        #[arg(long, conflicts_with = "name")]
        file: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::ERROR
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let home = RalphHome::resolve(cli.home.as_deref())?;
    match cli.command {
        Command::Init {
            name,
            target,
            manifest,
            force,
        } => cmd_init(&home, &name, target, manifest, force),
        Command::Run {
            name,
            iterations,
            once,
            loop_kind,
            sandbox,
            allow_unsandboxed,
        } => {
            let budget = if once { Some(1) } else { iterations };
            cmd_run(&home, &name, budget, loop_kind, sandbox, allow_unsandboxed)
        }
        Command::Status { name, recent } => cmd_status(&home, &name, recent),
        Command::List => cmd_list(&home),
        Command::Delete { name } => {
            delete_project(&home, &name)?;
            println!("deleted project '{name}'");
            Ok(exit_codes::OK)
        }
        Command::Stop { name } => {
            let path = request_stop(&home, &name)?;
            println!("stop requested ({})", path.display());
            Ok(exit_codes::OK)
        }
        Command::Validate { name, file } => cmd_validate(&home, name, file),
    }
}

fn cmd_init(
    home: &RalphHome,
    name: &str,
    target: PathBuf,
    manifest: Option<PathBuf>,
    force: bool,
) -> Result<i32> {
    let config_path = home.config_path();
    if !config_path.exists() {
        write_config(&config_path, &RalphConfig::default())?;
    }
    let paths = init_project(
        home,
        name,
        &target,
        &InitOptions {
            manifest,
            force,
            now: now_rfc3339(),
        },
    )?;
    println!("initialized project '{name}'");
    println!("manifest: {}", paths.manifest_path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(
    home: &RalphHome,
    name: &str,
    budget: Option<u32>,
    loop_kind: LoopKind,
    sandbox: bool,
    allow_unsandboxed: bool,
) -> Result<i32> {
    let config = load_config(&home.config_path())?;
    config.validate()?;
    let paths = home.project(name)?;
    let info = paths.load_info()?;
    let _lock = ProjectLock::acquire(&paths.lock_path)?;

    if paths.stop_path.exists() {
        warn!(path = %paths.stop_path.display(), "removing stale stop request");
        remove_stop_file(&paths.stop_path)?;
    }

    let manifest = load_manifest(&paths.manifest_path)?;
    let max_iterations = budget.unwrap_or(manifest.max_iterations);
    if max_iterations == 0 {
        return Err(anyhow!("iteration budget must be at least 1"));
    }

    let mut sandbox_config = config.sandbox.clone();
    sandbox_config.allow_unsandboxed_fallback |= allow_unsandboxed;
    let sandbox = RunSandbox::new(
        sandbox || config.sandbox.enabled,
        sandbox_config,
        &info.target,
        name,
    );
    let agent = CommandAgent::new(
        config.agent.clone(),
        ToolPolicy {
            allowed: config.agent.tools.clone(),
            protected_paths: paths.protected_paths(),
        },
    );
    let verifier = ShellVerifier {
        output_limit_bytes: config.verify_output_limit_bytes,
    };
    let step_config = StepConfig::from_config(&config, loop_kind, info.target.clone(), max_iterations);
    let cancel = CancelToken::with_stop_file(&paths.stop_path);

    let started_at = now_rfc3339();
    write_run_state(
        &paths.run_state_path,
        &RunState {
            active: true,
            loop_kind: Some(loop_kind),
            iterations_run: 0,
            last_halt: None,
            started_at: Some(started_at.clone()),
            updated_at: Some(started_at),
        },
    )?;

    let mut store = FileStateStore::new(paths.clone());
    let mut iterations_run = 0u32;
    let result = run_loop(
        &mut store,
        &agent,
        &verifier,
        &sandbox,
        &step_config,
        &cancel,
        |report| {
            iterations_run += 1;
            print_report(report);
        },
    );

    let mut state = load_run_state(&paths.run_state_path)?;
    state.active = false;
    state.iterations_run = iterations_run;
    state.updated_at = Some(now_rfc3339());
    state.last_halt = result.as_ref().ok().map(|outcome| outcome.halt);
    write_run_state(&paths.run_state_path, &state)?;

    let outcome = result.with_context(|| format!("run project '{name}'"))?;
    if outcome.halt == HaltReason::Cancelled && paths.stop_path.exists() {
        remove_stop_file(&paths.stop_path)?;
    }
    println!(
        "halted: {} after {} iteration(s), {}/{} tasks done",
        outcome.halt, outcome.iterations_run, outcome.done, outcome.total
    );
    Ok(exit_codes::for_halt(outcome.halt))
}

fn print_report(report: &IterationReport) {
    println!(
        "iteration {}: task {} -> {} (signal {}, {} file(s) touched)",
        report.iteration,
        report.task_id,
        report.outcome.as_str(),
        report.signal.as_str(),
        report.files_touched.len()
    );
    if let Some(err) = &report.error {
        println!("  error: {err}");
    }
    for alert in &report.alerts {
        println!("  alert: {}", alert.describe());
    }
    for name in &report.guardrails_added {
        println!("  guardrail added: {name}");
    }
    if report.manifest_restored {
        println!("  manifest edited by the agent was restored");
    }
}

fn remove_stop_file(path: &std::path::Path) -> Result<()> {
    fs::remove_file(path).with_context(|| format!("remove {}", path.display()))
}

fn cmd_status(home: &RalphHome, name: &str, recent: usize) -> Result<i32> {
    let paths = home.project(name)?;
    paths.load_info()?;
    let status = collect_status(&paths, recent)?;
    print!("{}", render_status(&status));
    Ok(exit_codes::OK)
}

fn cmd_list(home: &RalphHome) -> Result<i32> {
    let listings = list_projects(home)?;
    if listings.is_empty() {
        println!("no projects (run `ralph init <name> <target>`)");
    }
    for listing in listings {
        let progress = match &listing.progress {
            Ok((done, total)) => format!("{done}/{total} done"),
            Err(err) => format!("manifest error: {err}"),
        };
        println!(
            "{}\t{}\t{}",
            listing.info.name,
            progress,
            listing.info.target.display()
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_validate(home: &RalphHome, name: Option<String>, file: Option<PathBuf>) -> Result<i32> {
    let path = match (file, name) {
        (Some(file), _) => file,
        (None, Some(name)) => {
            let paths = home.project(&name)?;
            paths.load_info()?;
            paths.manifest_path
        }
        (None, None) => return Err(anyhow!("pass a project name or --file")),
    };
    let manifest = load_manifest(&path)?;
    println!(
        "ok: {} ({} tasks, {} done, {} guardrails)",
        path.display(),
        manifest.tasks.len(),
        manifest.done_count(),
        manifest.guardrails.len()
    );
    Ok(exit_codes::OK)
}
