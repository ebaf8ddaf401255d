//! CLI for supervising VASP calculations.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use supervisor::config::load_config;
use supervisor::exit_codes;
use supervisor::handlers::default_handlers;
use supervisor::job::JobDir;
use supervisor::logging;
use supervisor::looping::{run_job, scan_streams};
use supervisor::process::VaspLauncher;

#[derive(Parser)]
#[command(
    name = "supervisor",
    version,
    about = "Supervised runner for VASP calculations"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one job to completion or failure; prints the result as JSON.
    Run {
        /// Job directory containing INCAR, POSCAR, and `supervisor.toml`.
        dir: PathBuf,
        /// Override the configured correction ceiling.
        #[arg(long)]
        max_corrections: Option<u32>,
        /// Override the configured launch command.
        #[arg(long, num_args = 1.., value_name = "ARG")]
        command: Option<Vec<String>>,
    },
    /// Scan an existing output stream and print the first matching handler id.
    Scan {
        /// Job directory with an output stream from a previous run.
        dir: PathBuf,
    },
    /// List the handler registry in scan order.
    Handlers,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            dir,
            max_corrections,
            command,
        } => cmd_run(dir, max_corrections, command),
        Command::Scan { dir } => cmd_scan(dir),
        Command::Handlers => Ok(cmd_handlers()),
    }
}

fn cmd_run(
    dir: PathBuf,
    max_corrections: Option<u32>,
    command: Option<Vec<String>>,
) -> Result<i32> {
    let job = JobDir::new(dir);
    let mut config = load_config(&job.config())?;
    if let Some(ceiling) = max_corrections {
        config.max_corrections = ceiling;
    }
    if let Some(command) = command {
        config.command = command;
    }
    config.validate()?;

    let launcher = VaspLauncher::from_config(&config)?;
    let abort = AtomicBool::new(false);
    let result = run_job(&job, &launcher, &default_handlers(), &config, &abort)?;

    let mut payload = serde_json::to_string_pretty(&result).context("serialize job result")?;
    payload.push('\n');
    print!("{payload}");

    Ok(if result.succeeded() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn cmd_scan(dir: PathBuf) -> Result<i32> {
    let job = JobDir::new(dir);
    let config = load_config(&job.config())?;
    let handlers = default_handlers();
    match scan_streams(&job, &handlers, &config)? {
        Some(idx) => {
            println!("{}", handlers[idx].id());
            Ok(exit_codes::OK)
        }
        None => Ok(exit_codes::NO_MATCH),
    }
}

fn cmd_handlers() -> i32 {
    for handler in default_handlers() {
        let trigger = if handler.is_monitor() {
            "monitor"
        } else {
            "post-mortem"
        };
        println!(
            "{:<14} {:<12} {}",
            handler.id(),
            trigger,
            handler.signatures().join(" | ")
        );
    }
    exit_codes::OK
}
