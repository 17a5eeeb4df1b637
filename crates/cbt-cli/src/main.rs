use anyhow::Result;
use cbt_runner::job_file::{build_job_descriptor, dispatch_command};
use cbt_runner::{RunError, RunOutcome, RunPlan};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cbt", version = "0.3.0", about = "Ceph block-storage benchmark orchestrator")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG wins when set.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute every planned run that is not already archived.
    Run {
        config: PathBuf,
        #[arg(long)]
        archive: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Print the planned runs without contacting any host.
    Describe {
        config: PathBuf,
        #[arg(long)]
        archive: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<RunError>()
                    .map(RunError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            archive,
            json,
        } => {
            let file = cbt_runner::load_run_file(&config)?;
            let archive_dir = cbt_runner::resolve_archive_dir(&file, archive.as_deref())?;
            let plans = cbt_runner::plan_runs(&file, &archive_dir)?;
            let collab = cbt_runner::default_collaborators(&file.cluster);
            info!(runs = plans.len(), archive_dir = %archive_dir.display(), "starting");
            let mut runs = Vec::with_capacity(plans.len());
            for plan in plans.iter() {
                let outcome = cbt_runner::run_plan(plan, &file.cluster, &collab)?;
                if json {
                    runs.push(outcome_to_json(plan, &outcome));
                } else {
                    print_outcome(plan, &outcome);
                }
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "archive_dir": archive_dir.display().to_string(),
                    "runs": runs
                })));
            }
        }
        Commands::Describe {
            config,
            archive,
            json,
        } => {
            let file = cbt_runner::load_run_file(&config)?;
            let archive_dir = cbt_runner::resolve_archive_dir(&file, archive.as_deref())?;
            let plans = cbt_runner::plan_runs(&file, &archive_dir)?;
            let recovery_active = file.cluster.recovery_test_configured();
            let described: Vec<Value> = plans
                .iter()
                .map(|plan| plan_to_json(plan, recovery_active))
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "archive_dir": archive_dir.display().to_string(),
                    "clients": file.cluster.clients.target_list(),
                    "runs": described
                })));
            }
            println!("archive_dir: {}", archive_dir.display());
            println!("clients: {}", file.cluster.clients.target_list());
            println!("runs: {}", plans.len());
            for plan in plans.iter() {
                print_plan(plan, recovery_active);
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
    }
}

fn dispatch_commands(plan: &RunPlan) -> Vec<String> {
    (0..plan.config.volumes_per_client)
        .map(|v| dispatch_command(&plan.config, v, &plan.run_dir))
        .collect()
}

fn plan_to_json(plan: &RunPlan, recovery_active: bool) -> Value {
    let descriptor = build_job_descriptor(&plan.config, 0, &plan.run_dir, recovery_active);
    json!({
        "iteration": plan.iteration,
        "identity": plan.identity,
        "run_dir": plan.run_dir.display().to_string(),
        "archive_dir": plan.archive_dir.display().to_string(),
        "archived": plan.archive_dir.exists(),
        "dispatch": dispatch_commands(plan),
        "descriptor": descriptor.file.render(),
        "config": plan.config
    })
}

fn outcome_to_json(plan: &RunPlan, outcome: &RunOutcome) -> Value {
    match outcome {
        RunOutcome::Skipped { archive_dir } => json!({
            "iteration": plan.iteration,
            "status": "skipped",
            "archive_dir": archive_dir.display().to_string()
        }),
        RunOutcome::Completed(report) => json!({
            "iteration": plan.iteration,
            "status": "completed",
            "archive_dir": report.archive_dir.display().to_string(),
            "dispatched": report.dispatched,
            "recovery_test": report.recovery_test,
            "recovery_aborted": report.recovery_aborted,
            "output_files": report.output_files,
            "descriptor_files": report.descriptor_files
        }),
    }
}

fn print_outcome(plan: &RunPlan, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Skipped { archive_dir } => {
            println!("skipped [{}] {}", plan.iteration, archive_dir.display());
        }
        RunOutcome::Completed(report) => {
            println!(
                "completed [{}] {} (dispatched: {}, outputs: {}, descriptors: {}{})",
                plan.iteration,
                report.archive_dir.display(),
                report.dispatched,
                report.output_files,
                report.descriptor_files,
                if report.recovery_aborted {
                    ", aborted by recovery test"
                } else {
                    ""
                }
            );
        }
    }
}

fn print_plan(plan: &RunPlan, recovery_active: bool) {
    println!();
    println!("iteration: {}", plan.iteration);
    println!("run_dir: {}", plan.run_dir.display());
    println!("archive_dir: {}", plan.archive_dir.display());
    println!("archived: {}", plan.archive_dir.exists());
    for command in dispatch_commands(plan) {
        println!("dispatch: {}", command);
    }
    let descriptor = build_job_descriptor(&plan.config, 0, &plan.run_dir, recovery_active);
    println!("descriptor ({}):", cbt_runner::job_file::JobDescriptor::file_name(0));
    print!("{}", descriptor.file.render());
}
