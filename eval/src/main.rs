mod cli;
mod config;
mod report;
mod results;
mod run;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sopbench::error::{SopError, as_sop_error};
use sopbench::{exit_codes, logging};

use crate::cli::RunRequest;
use crate::config::RunOverrides;

#[derive(Parser)]
#[command(name = "eval", version, about = "Run and score SOP benchmark dialogues")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Simulate and evaluate a domain's tasks.
    Run {
        #[arg(long)]
        domain: String,
        /// Task file produced by `sopbench compile`.
        #[arg(long)]
        tasks: PathBuf,
        #[arg(long, default_value = "sopbench.toml")]
        config: PathBuf,
        #[arg(long, default_value = "results")]
        out_dir: PathBuf,
        /// Restrict to these goals. Repeatable.
        #[arg(long = "goal")]
        goals: Vec<String>,
        /// Sample at most this many tasks.
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[command(flatten)]
        overrides: RunOverrides,
    },
    /// Re-score an existing output file in place.
    Evaluate {
        #[arg(long)]
        domain: String,
        output: PathBuf,
        #[arg(long, default_value = "sopbench.toml")]
        config: PathBuf,
    },
    /// Aggregate statistics over an output file or results directory.
    Report {
        path: PathBuf,
        /// Constraint counts at or above this share one bucket.
        #[arg(long, default_value_t = 5)]
        max_constraints: usize,
    },
}

fn main() {
    logging::init();
    let cancel = Arc::new(AtomicBool::new(false));
    let code = match run(&cancel) {
        Ok(()) => exit_codes::OK,
        Err(err) if matches!(as_sop_error(&err), Some(SopError::Cancelled)) => {
            eprintln!("interrupted; partial results discarded");
            exit_codes::INTERRUPTED
        }
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cancel: &Arc<AtomicBool>) -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            domain,
            tasks,
            config,
            out_dir,
            goals,
            limit,
            seed,
            overrides,
        } => {
            let flag = Arc::clone(cancel);
            ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
                .context("install interrupt handler")?;
            let request = RunRequest {
                domain,
                tasks,
                config,
                out_dir,
                goals,
                limit,
                seed,
                overrides,
            };
            cli::run_domain(&request, cancel).map(|_| ())
        }
        Command::Evaluate {
            domain,
            output,
            config,
        } => cli::evaluate_output(&domain, &output, &config),
        Command::Report {
            path,
            max_constraints,
        } => cli::report_output(&path, max_constraints),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "eval",
            "run",
            "--domain",
            "bank",
            "--tasks",
            "bank_tasks.json",
            "--limit",
            "3",
            "--tool-call-mode",
            "react",
            "--assistant-command",
            "python3",
            "chat.py",
        ]);
        let Command::Run {
            limit,
            seed,
            overrides,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(limit, Some(3));
        assert_eq!(seed, 42);
        assert_eq!(overrides.assistant_command, vec!["python3", "chat.py"]);
    }

    #[test]
    fn parse_report_defaults() {
        let cli = Cli::parse_from(["eval", "report", "results/bank"]);
        let Command::Report { max_constraints, .. } = cli.command else {
            panic!("expected report");
        };
        assert_eq!(max_constraints, 5);
    }
}
