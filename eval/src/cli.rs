//! CLI command implementations.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use sopbench::domain::Registry;
use sopbench::io::config::{HarnessConfig, load_config};
use sopbench::io::prompt::PromptEngine;
use sopbench::io::task_file::{file_digest, load_task_file};
use tracing::{debug, info};

use crate::config::{RunOverrides, apply_overrides};
use crate::report::{OUTPUT_FILE, aggregate, render, summarize_results};
use crate::results::{RunMeta, config_hash, load_output, results_dir, run_id, write_meta, write_output};
use crate::run::{RunContext, reevaluate, run_tasks, select_tasks};

/// What to run and where to put it.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub domain: String,
    pub tasks: PathBuf,
    pub config: PathBuf,
    pub out_dir: PathBuf,
    pub goals: Vec<String>,
    pub limit: Option<usize>,
    pub seed: u64,
    pub overrides: RunOverrides,
}

/// Simulate and evaluate the selected tasks of a domain, writing
/// `output.json` and `meta.json` into a fresh run directory.
pub fn run_domain(request: &RunRequest, cancel: &AtomicBool) -> Result<PathBuf> {
    let cfg = apply_overrides(load_config(&request.config)?, &request.overrides)?;
    let registry = Registry::builtin()?;
    let domain = registry.get(&request.domain)?;
    let file = load_task_file(&request.tasks)?;
    let tasks = select_tasks(&file, &request.goals, request.limit, request.seed);
    debug!(domain = %request.domain, tasks = tasks.len(), "tasks selected");

    let env = cfg.command_env()?;
    let assistant = cfg
        .assistant
        .require("assistant")?
        .chat_client(cfg.cache_dir.clone(), env.clone());
    let user = cfg
        .user
        .require("user")?
        .chat_client(cfg.cache_dir.clone(), env);
    let prompts = PromptEngine::new();
    let ctx = RunContext {
        domain,
        assistant: &assistant,
        user: &user,
        prompts: &prompts,
        cfg: &cfg,
    };

    let start_time = Utc::now();
    let started = Instant::now();
    let results = run_tasks(&ctx, &tasks, cancel)?;
    let end_time = Utc::now();

    let run_id = run_id(start_time);
    let dir = results_dir(&request.out_dir, &request.domain, &run_id);
    write_output(&dir.join(OUTPUT_FILE), &results)?;
    let interactions = results.iter().flat_map(|r| &r.interactions);
    let meta = RunMeta {
        run_id: run_id.clone(),
        domain: request.domain.clone(),
        tasks_path: request.tasks.display().to_string(),
        tasks_hash: file_digest(&request.tasks)?,
        config_hash: config_hash(&cfg)?,
        start_time: start_time.to_rfc3339(),
        end_time: end_time.to_rfc3339(),
        duration_secs: started.elapsed().as_secs_f64(),
        trials: interactions.clone().count(),
        failed_trials: interactions.filter(|i| i.error.is_some()).count(),
    };
    write_meta(&dir.join("meta.json"), &meta)?;
    info!(run_id = %run_id, trials = meta.trials, failed = meta.failed_trials, "run finished");

    println!(
        "run: domain={} eval_run_id={} trials={} failed={} results={}",
        request.domain,
        run_id,
        meta.trials,
        meta.failed_trials,
        dir.display()
    );
    print!("{}", render(&summarize_results(&results, cfg.eval.max_constraints)));
    Ok(dir)
}

/// Re-score the interactions in an existing output file and rewrite it.
pub fn evaluate_output(domain: &str, output: &Path, config: &Path) -> Result<()> {
    let cfg: HarnessConfig = load_config(config)?;
    let registry = Registry::builtin()?;
    let domain_impl = registry.get(domain)?;
    let mut results = load_output(output)?;
    reevaluate(domain_impl, &cfg, &mut results)
        .with_context(|| format!("evaluate {}", output.display()))?;
    write_output(output, &results)?;
    print!("{}", render(&summarize_results(&results, cfg.eval.max_constraints)));
    Ok(())
}

/// Show aggregated statistics for an output file or results directory.
pub fn report_output(path: &Path, max_constraints: usize) -> Result<()> {
    let (summary, warnings) = aggregate(path, max_constraints)?;
    print!("{}", render(&summary));
    for warning in warnings {
        eprintln!("warning: {}", warning);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sopbench::compile::{CompileOptions, TaskCompiler};
    use sopbench::io::task_file::write_task_file;
    use sopbench::test_support::{ScriptedGenerator, bank, bank_world};
    use tempfile::tempdir;

    #[cfg(unix)]
    #[test]
    fn evaluate_rewrites_output_in_place() {
        let temp = tempdir().expect("tempdir");
        let domain = bank();
        let generator = ScriptedGenerator::repeating(bank_world());
        let prompts = PromptEngine::new();
        let compiled = TaskCompiler::new(&domain, &generator, &prompts, CompileOptions::default())
            .compile_domain(Some(&["logout_user".to_string()]))
            .expect("compile");
        let tasks_path = temp.path().join("bank_tasks.json");
        write_task_file(&tasks_path, &compiled.tasks).expect("write tasks");

        // Model commands that exit non-zero fail every trial, which is kept
        // unevaluated.
        let request = RunRequest {
            domain: "bank".to_string(),
            tasks: tasks_path,
            config: temp.path().join("missing.toml"),
            out_dir: temp.path().join("results"),
            goals: Vec::new(),
            limit: Some(1),
            seed: 0,
            overrides: RunOverrides {
                assistant_command: vec!["false".to_string()],
                user_command: vec!["false".to_string()],
                ..RunOverrides::default()
            },
        };
        let dir = run_domain(&request, &AtomicBool::new(false)).expect("run");
        let output = dir.join(OUTPUT_FILE);
        let results = load_output(&output).expect("load");
        assert_eq!(results.len(), 1);
        assert!(results[0].interactions[0].error.is_some());
        assert!(dir.join("meta.json").is_file());

        evaluate_output("bank", &output, &temp.path().join("missing.toml")).expect("evaluate");
        assert_eq!(load_output(&output).expect("reload"), results);
        report_output(&temp.path().join("results"), 5).expect("report");
    }
}
