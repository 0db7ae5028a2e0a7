//! Trial execution: simulate each task with model-backed agents and
//! evaluate the trajectory.
//!
//! Trials run on a scoped worker pool sharing the chat clients. Results are
//! put back in submission order so output files do not depend on timing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use sopbench::compile::TaskRecord;
use sopbench::core::dag::DagNode;
use sopbench::core::stats::Statistics;
use sopbench::core::types::Evaluation;
use sopbench::domain::{Domain, DomainInstance};
use sopbench::error::{SopError, as_sop_error};
use sopbench::evaluate::evaluate_trajectory;
use sopbench::io::chat::{ChatClient, ToolCallMode, ToolSpec, domain_tools};
use sopbench::io::config::HarnessConfig;
use sopbench::io::prompt::PromptEngine;
use sopbench::io::task_file::TaskFile;
use sopbench::simulate::{ChatAgent, simulate};
use tracing::{info, instrument, warn};

use crate::results::{Interaction, Setup, TaskResult};

/// A task picked for the run.
#[derive(Debug, Clone, Copy)]
pub struct SelectedTask<'t> {
    pub goal: &'t str,
    pub index: usize,
    pub task: &'t TaskRecord,
}

impl SelectedTask<'_> {
    pub fn task_id(&self) -> String {
        format!("{}-{}", self.goal, self.index)
    }
}

/// Tasks in file order, optionally restricted to `goals` and sampled down
/// to `limit` with a seeded RNG.
pub fn select_tasks<'t>(
    file: &'t TaskFile,
    goals: &[String],
    limit: Option<usize>,
    seed: u64,
) -> Vec<SelectedTask<'t>> {
    let all: Vec<SelectedTask<'t>> = file
        .iter()
        .filter(|(goal, _)| goals.is_empty() || goals.contains(goal))
        .flat_map(|(goal, tasks)| {
            tasks.iter().enumerate().map(move |(index, task)| SelectedTask {
                goal: goal.as_str(),
                index,
                task,
            })
        })
        .collect();
    match limit {
        Some(n) if n < all.len() => {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut picked = rand::seq::index::sample(&mut rng, all.len(), n).into_vec();
            picked.sort_unstable();
            picked.into_iter().map(|idx| all[idx]).collect()
        }
        _ => all,
    }
}

/// Shared inputs of every trial.
pub struct RunContext<'a> {
    pub domain: &'a dyn Domain,
    pub assistant: &'a dyn ChatClient,
    pub user: &'a dyn ChatClient,
    pub prompts: &'a PromptEngine,
    pub cfg: &'a HarnessConfig,
}

/// Actions named by the task's action graph.
fn graph_actions(task: &TaskRecord) -> Vec<String> {
    let mut actions: Vec<String> = task
        .directed_action_graph
        .nodes
        .iter()
        .filter_map(|node| match node {
            DagNode::Action { name, .. } => Some(name.clone()),
            DagNode::Relation(_) => None,
        })
        .collect();
    actions.push(task.goal.clone());
    actions.sort();
    actions.dedup();
    actions
}

/// Simulate one dialogue for `task` and evaluate it.
#[instrument(skip_all, fields(goal = %task.goal))]
pub fn run_trial(
    ctx: &RunContext<'_>,
    task: &TaskRecord,
    cancel: &AtomicBool,
) -> Result<(Interaction, Evaluation)> {
    let cfg = ctx.cfg;
    let descriptor = ctx.domain.descriptor();
    let mut instance = DomainInstance::plain(
        ctx.domain,
        Some(&task.initial_database),
        task.constraint_parameters.clone(),
    )?;

    let mode = cfg.eval.tool_call_mode;
    let mut tools = domain_tools(
        descriptor,
        &instance.helpers(),
        cfg.eval.tool_list,
        &graph_actions(task),
    );
    tools.push(ToolSpec::exit_conversation());
    let assistant_prompt = ctx.prompts.render_assistant_system(descriptor, mode, &tools)?;
    let user_prompt = if task.user_prompt.is_empty() {
        let instruction =
            ctx.prompts
                .render_user_instruction(descriptor, &task.goal, &task.user_known)?;
        ctx.prompts.render_user_system(&instruction)?
    } else {
        task.user_prompt.clone()
    };

    let mut assistant = ChatAgent::new(
        ctx.assistant,
        cfg.assistant.model.clone(),
        assistant_prompt.clone(),
        tools,
        mode,
        cfg.assistant.timeout(),
    );
    let mut user = ChatAgent::new(
        ctx.user,
        cfg.user.model.clone(),
        user_prompt,
        vec![ToolSpec::exit_conversation()],
        ToolCallMode::Fc,
        cfg.user.timeout(),
    );

    let outcome = simulate(&mut user, &mut assistant, &mut instance, &cfg.simulation, cancel)?;
    let evaluation = evaluate_trajectory(
        ctx.domain,
        task,
        &outcome.trajectory,
        cfg.compile.expansion(),
    )
    .context("evaluate trajectory")?;
    Ok((
        Interaction {
            prompt: assistant_prompt,
            interaction: outcome.trajectory,
            database: outcome.database,
            stop: Some(outcome.stop),
            error: None,
        },
        evaluation,
    ))
}

/// Run `work(0..jobs)` on up to `workers` scoped threads and return the
/// results in index order. Jobs not yet started when `cancel` is raised
/// are skipped.
pub fn run_pool<T, F>(jobs: usize, workers: usize, cancel: &AtomicBool, work: F) -> Vec<(usize, T)>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    let next = AtomicUsize::new(0);
    let done = Mutex::new(Vec::with_capacity(jobs));
    std::thread::scope(|s| {
        for _ in 0..workers.clamp(1, jobs.max(1)) {
            s.spawn(|| {
                loop {
                    if cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    if idx >= jobs {
                        break;
                    }
                    let out = work(idx);
                    done.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((idx, out));
                }
            });
        }
    });
    let mut done = done.into_inner().unwrap_or_else(PoisonError::into_inner);
    done.sort_by_key(|(idx, _)| *idx);
    done
}

/// Run every selected task `runs_per_task` times.
///
/// A trial whose dialogue or evaluation fails is kept with its error and
/// left unevaluated. Cancellation discards everything.
#[instrument(skip_all, fields(domain = %ctx.domain.descriptor().name, tasks = tasks.len()))]
pub fn run_tasks(
    ctx: &RunContext<'_>,
    tasks: &[SelectedTask<'_>],
    cancel: &AtomicBool,
) -> Result<Vec<TaskResult>> {
    let runs = ctx.cfg.eval.runs_per_task;
    let jobs = tasks.len() * runs;
    info!(jobs, workers = ctx.cfg.eval.workers, "starting trials");

    let trials = run_pool(jobs, ctx.cfg.eval.workers, cancel, |idx| {
        run_trial(ctx, tasks[idx / runs].task, cancel)
    });
    if cancel.load(Ordering::SeqCst) {
        return Err(SopError::Cancelled.into());
    }

    let setup = Setup::from_config(ctx.cfg);
    let mut results: Vec<TaskResult> = tasks
        .iter()
        .map(|selected| TaskResult {
            domain: ctx.domain.descriptor().name.clone(),
            task_id: selected.task_id(),
            setup: setup.clone(),
            task: selected.task.clone(),
            interactions: Vec::new(),
            evaluations: Vec::new(),
            statistics: Statistics::default(),
        })
        .collect();

    for (idx, trial) in trials {
        let result = &mut results[idx / runs];
        match trial {
            Ok((interaction, evaluation)) => {
                result.statistics.record(&evaluation);
                result.interactions.push(interaction);
                result.evaluations.push(evaluation);
            }
            Err(err) => {
                if matches!(as_sop_error(&err), Some(SopError::Cancelled)) {
                    return Err(err);
                }
                warn!(task = %result.task_id, err = %format!("{err:#}"), "trial failed");
                result.interactions.push(Interaction {
                    prompt: String::new(),
                    interaction: Vec::new(),
                    database: result.task.initial_database.clone(),
                    stop: None,
                    error: Some(format!("{err:#}")),
                });
            }
        }
    }
    Ok(results)
}

/// Re-evaluate stored interactions with the current evaluator.
pub fn reevaluate(domain: &dyn Domain, cfg: &HarnessConfig, results: &mut [TaskResult]) -> Result<()> {
    for result in results {
        let mut evaluations = Vec::new();
        for interaction in result.interactions.iter().filter(|i| i.error.is_none()) {
            let evaluation = evaluate_trajectory(
                domain,
                &result.task,
                &interaction.interaction,
                cfg.compile.expansion(),
            )
            .with_context(|| format!("re-evaluate {}", result.task_id))?;
            evaluations.push(evaluation);
        }
        result.statistics = Statistics::from_evaluations(&evaluations);
        result.evaluations = evaluations;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sopbench::compile::{CompileOptions, TaskCompiler};
    use sopbench::core::types::{Message, Role};
    use sopbench::test_support::{ScriptedChatClient, ScriptedGenerator, bank, bank_world, exit, oracle_calls};

    fn compiled_tasks(goal: &str) -> TaskFile {
        let domain = bank();
        let generator = ScriptedGenerator::repeating(bank_world());
        let prompts = PromptEngine::new();
        let compiler = TaskCompiler::new(&domain, &generator, &prompts, CompileOptions::default());
        compiler
            .compile_domain(Some(&[goal.to_string()]))
            .expect("compile")
            .tasks
    }

    #[test]
    fn pool_returns_results_in_index_order() {
        let cancel = AtomicBool::new(false);
        let out = run_pool(20, 4, &cancel, |idx| idx * 2);
        let indices: Vec<usize> = out.iter().map(|(idx, _)| *idx).collect();
        assert_eq!(indices, (0..20).collect::<Vec<_>>());
        assert!(out.iter().all(|(idx, value)| *value == idx * 2));
    }

    #[test]
    fn pool_skips_work_after_cancel() {
        let cancel = AtomicBool::new(true);
        let out = run_pool(5, 2, &cancel, |idx| idx);
        assert!(out.is_empty());
    }

    #[test]
    fn selection_is_seeded_and_ordered() {
        let file = compiled_tasks("logout_user");
        let all = select_tasks(&file, &[], None, 0);
        assert!(all.len() >= 2);
        let a = select_tasks(&file, &[], Some(1), 7);
        let b = select_tasks(&file, &[], Some(1), 7);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].task_id(), b[0].task_id());
        assert!(select_tasks(&file, &["login_user".to_string()], None, 0).is_empty());
    }

    #[test]
    fn oracle_assistant_passes_success_task() {
        let domain = bank();
        let file = compiled_tasks("logout_user");
        let tasks: Vec<SelectedTask<'_>> = select_tasks(&file, &[], None, 0)
            .into_iter()
            .filter(|t| t.task.action_should_succeed && t.task.manfix_id.is_none())
            .take(1)
            .collect();
        assert_eq!(tasks.len(), 1);

        let mut replies = oracle_calls(&domain, tasks[0].task);
        replies.push(Message::text(Role::Assistant, "All done."));
        let assistant = ScriptedChatClient::new(replies);
        let user = ScriptedChatClient::new(vec![
            Message::text(Role::Assistant, "Please log me out."),
            exit(),
        ]);
        let prompts = PromptEngine::new();
        let cfg = HarnessConfig::default();
        let ctx = RunContext {
            domain: &domain,
            assistant: &assistant,
            user: &user,
            prompts: &prompts,
            cfg: &cfg,
        };
        let results = run_tasks(&ctx, &tasks, &AtomicBool::new(false)).expect("run");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].evaluations.len(), 1);
        let evaluation = &results[0].evaluations[0];
        assert!(evaluation.success, "{evaluation:?}");
        assert_eq!(results[0].statistics.count, 1);

        let mut stored = results.clone();
        reevaluate(&domain, &cfg, &mut stored).expect("re-evaluate");
        assert_eq!(stored, results);
    }

    #[test]
    fn failing_model_is_recorded_not_fatal() {
        let domain = bank();
        let file = compiled_tasks("logout_user");
        let tasks: Vec<SelectedTask<'_>> = select_tasks(&file, &[], Some(1), 0);
        let silent = ScriptedChatClient::new(Vec::new());
        let prompts = PromptEngine::new();
        let cfg = HarnessConfig::default();
        let ctx = RunContext {
            domain: &domain,
            assistant: &silent,
            user: &silent,
            prompts: &prompts,
            cfg: &cfg,
        };
        let results = run_tasks(&ctx, &tasks, &AtomicBool::new(false)).expect("run");
        assert!(results[0].evaluations.is_empty());
        assert!(results[0].interactions[0].error.is_some());
    }
}
