//! SOP task tooling.
//!
//! Inspects a domain's SOPs (expansion stages, permutation tables, action
//! graphs), compiles task files through a configured generator command and
//! validates existing task files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use sopbench::compile::TaskCompiler;
use sopbench::core::dag::build_action_graph;
use sopbench::core::descriptor::DefaultOption;
use sopbench::core::expand::{ExpansionOptions, LinkScratchpad, expand_sop};
use sopbench::core::permutation::{enumerate_composed, to_columns};
use sopbench::domain::Registry;
use sopbench::exit_codes;
use sopbench::io::config::load_config;
use sopbench::io::prompt::PromptEngine;
use sopbench::io::task_file::{load_task_file, write_intermediate_file, write_task_file};
use sopbench::logging;

#[derive(Parser)]
#[command(name = "sopbench", version, about = "SOP benchmark task tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, Args)]
struct ExpansionArgs {
    /// Which action deps form the default SOP.
    #[arg(long, value_enum, default_value_t = DefaultOption::Required)]
    default_option: DefaultOption,
    /// Skip inserting constraint deps.
    #[arg(long)]
    no_constraint_deps: bool,
}

impl ExpansionArgs {
    fn options(self) -> ExpansionOptions {
        ExpansionOptions {
            default_option: self.default_option,
            add_constraint_deps: !self.no_constraint_deps,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// List built-in domains and their actions.
    Domains,
    /// Print every SOP stage of an action.
    Expand {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        action: String,
        #[command(flatten)]
        expansion: ExpansionArgs,
    },
    /// Print the success and failure rows of an action's SOP.
    Permutations {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        action: String,
        #[command(flatten)]
        expansion: ExpansionArgs,
        /// Cap on simultaneously failing (`and`) or holding (`or`) children.
        #[arg(long, default_value_t = 1)]
        k: usize,
    },
    /// Print the action graph of an action's SOP.
    Dag {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        action: String,
        #[command(flatten)]
        expansion: ExpansionArgs,
    },
    /// Compile the task and intermediate files of a domain.
    Compile {
        #[arg(long)]
        domain: String,
        /// Harness config (TOML). Missing file means defaults.
        #[arg(long, default_value = "sopbench.toml")]
        config: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
        /// Restrict to these goals. Repeatable.
        #[arg(long = "goal")]
        goals: Vec<String>,
    },
    /// Check a task file against the schema and its domain.
    Validate {
        #[arg(long)]
        domain: String,
        tasks: PathBuf,
    },
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::INVALID);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let registry = Registry::builtin()?;
    match cli.command {
        Command::Domains => cmd_domains(&registry),
        Command::Expand {
            domain,
            action,
            expansion,
        } => cmd_expand(&registry, &domain, &action, expansion.options()),
        Command::Permutations {
            domain,
            action,
            expansion,
            k,
        } => cmd_permutations(&registry, &domain, &action, expansion.options(), k),
        Command::Dag {
            domain,
            action,
            expansion,
        } => cmd_dag(&registry, &domain, &action, expansion.options()),
        Command::Compile {
            domain,
            config,
            out_dir,
            goals,
        } => cmd_compile(&registry, &domain, &config, &out_dir, &goals),
        Command::Validate { domain, tasks } => cmd_validate(&registry, &domain, &tasks),
    }
}

fn cmd_domains(registry: &Registry) -> Result<()> {
    let listing: BTreeMap<String, Vec<String>> = registry
        .names()
        .into_iter()
        .map(|name| {
            let actions = registry
                .get(&name)
                .map(|domain| domain.descriptor().list_actions())
                .unwrap_or_default();
            (name, actions)
        })
        .collect();
    print_json(&listing)
}

fn cmd_expand(registry: &Registry, domain: &str, action: &str, options: ExpansionOptions) -> Result<()> {
    let descriptor = registry.get(domain)?.descriptor();
    let sop = expand_sop(action, descriptor, options, &mut LinkScratchpad::new())
        .with_context(|| format!("expand {action}"))?;
    print_json(&sop)
}

fn cmd_permutations(
    registry: &Registry,
    domain: &str,
    action: &str,
    options: ExpansionOptions,
    k: usize,
) -> Result<()> {
    let descriptor = registry.get(domain)?.descriptor();
    let sop = expand_sop(action, descriptor, options, &mut LinkScratchpad::new())
        .with_context(|| format!("expand {action}"))?;
    let perms = enumerate_composed(sop.required.as_ref(), sop.customizable.as_ref(), k);
    print_json(&json!({
        "success": to_columns(&perms.success),
        "failure": to_columns(&perms.failure),
    }))
}

fn cmd_dag(registry: &Registry, domain: &str, action: &str, options: ExpansionOptions) -> Result<()> {
    let descriptor = registry.get(domain)?.descriptor();
    let mut scratchpad = LinkScratchpad::new();
    let sop = expand_sop(action, descriptor, options, &mut scratchpad)
        .with_context(|| format!("expand {action}"))?;
    let graph = build_action_graph(
        action,
        sop.original.as_ref(),
        descriptor,
        options.default_option,
        &mut scratchpad,
    )
    .with_context(|| format!("build action graph of {action}"))?;
    print_json(&json!({
        "graph": graph,
        "oracle_plan": graph.oracle_plan(),
    }))
}

fn cmd_compile(
    registry: &Registry,
    domain: &str,
    config: &Path,
    out_dir: &Path,
    goals: &[String],
) -> Result<()> {
    let cfg = load_config(config)?;
    let domain_impl = registry.get(domain)?;
    let generator = cfg
        .generator
        .require("generator")?
        .task_generator(cfg.command_env()?);
    let prompts = PromptEngine::new();
    let compiler = TaskCompiler::new(domain_impl, &generator, &prompts, cfg.compile.clone());
    let goals = (!goals.is_empty()).then_some(goals);
    let compiled = compiler.compile_domain(goals)?;

    write_task_file(&out_dir.join(format!("{domain}_tasks.json")), &compiled.tasks)?;
    write_intermediate_file(
        &out_dir.join(format!("{domain}_intermediate.json")),
        &compiled.intermediate,
    )?;
    print_json(&json!({
        "domain": domain,
        "tasks": compiled.tasks.values().map(Vec::len).sum::<usize>(),
        "skipped": compiled.skipped,
        "manual_fix": compiled.manual_fix,
    }))
}

fn cmd_validate(registry: &Registry, domain: &str, tasks: &Path) -> Result<()> {
    let descriptor = registry.get(domain)?.descriptor();
    descriptor.validate()?;
    let file = load_task_file(tasks)?;
    let mut problems = Vec::new();
    for (goal, records) in &file {
        if !descriptor.is_action(goal) {
            problems.push(format!("{goal}: not an action of {domain}"));
            continue;
        }
        for (idx, task) in records.iter().enumerate() {
            for problem in task.directed_action_graph.validate() {
                problems.push(format!("{goal}[{idx}]: {problem}"));
            }
        }
    }
    if !problems.is_empty() {
        bail!("task file problems:\n- {}", problems.join("\n- "));
    }
    println!("{} tasks ok", file.values().map(Vec::len).sum::<usize>());
    Ok(())
}

/// Print `value` as pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
