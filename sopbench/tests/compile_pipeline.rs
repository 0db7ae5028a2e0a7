//! Task compilation through a scripted generator, followed by oracle
//! dialogues over the compiled tasks.

use std::sync::atomic::AtomicBool;

use sopbench::compile::{CompileOptions, TaskCompiler, TaskRecord};
use sopbench::core::types::Message;
use sopbench::domain::{Domain, DomainInstance};
use sopbench::evaluate::evaluate_trajectory;
use sopbench::io::prompt::PromptEngine;
use sopbench::io::task_file::{load_intermediate_file, load_task_file, write_intermediate_file, write_task_file};
use sopbench::simulate::{SimulationOptions, simulate};
use sopbench::test_support::{ScriptedAgent, ScriptedGenerator, bank, bank_world, exit, oracle_calls, say};
use tempfile::tempdir;

fn compile_bank(goals: &[&str]) -> sopbench::compile::DomainCompilation {
    let domain = bank();
    let generator = ScriptedGenerator::repeating(bank_world());
    let prompts = PromptEngine::new();
    let goals: Vec<String> = goals.iter().map(|g| g.to_string()).collect();
    TaskCompiler::new(&domain, &generator, &prompts, CompileOptions::default())
        .compile_domain(Some(&goals))
        .expect("compile")
}

fn oracle_trajectory(domain: &dyn Domain, task: &TaskRecord) -> Vec<Message> {
    let mut replies = oracle_calls(domain, task);
    replies.push(say("Finished."));
    let mut assistant = ScriptedAgent::new(replies);
    let mut user = ScriptedAgent::new(vec![say("Hi, I need help."), exit()]);
    let mut instance = DomainInstance::plain(
        domain,
        Some(&task.initial_database),
        task.constraint_parameters.clone(),
    )
    .expect("instance");
    simulate(
        &mut user,
        &mut assistant,
        &mut instance,
        &SimulationOptions {
            max_turns: 40,
            max_actions: 40,
            ..SimulationOptions::default()
        },
        &AtomicBool::new(false),
    )
    .expect("simulate")
    .trajectory
}

#[test]
fn compiled_files_round_trip_through_disk() {
    let compiled = compile_bank(&["logout_user", "transfer_funds"]);
    assert!(compiled.skipped.is_empty(), "{:?}", compiled.skipped);
    for goal in ["logout_user", "transfer_funds"] {
        let tasks = &compiled.tasks[goal];
        assert!(!tasks.is_empty(), "{goal} has no tasks");
        assert_eq!(tasks.len(), compiled.intermediate[goal].len());
        assert!(tasks.iter().all(|t| t.goal == goal));
        assert!(tasks.iter().any(|t| t.action_should_succeed));
    }

    let temp = tempdir().expect("tempdir");
    let tasks_path = temp.path().join("bank_tasks.json");
    let intermediate_path = temp.path().join("bank_intermediate.json");
    write_task_file(&tasks_path, &compiled.tasks).expect("write tasks");
    write_intermediate_file(&intermediate_path, &compiled.intermediate).expect("write intermediate");
    assert_eq!(load_task_file(&tasks_path).expect("load tasks"), compiled.tasks);
    assert_eq!(
        load_intermediate_file(&intermediate_path).expect("load intermediate"),
        compiled.intermediate
    );
}

#[test]
fn generator_sees_constraints_and_retries_are_bounded() {
    let domain = bank();
    let generator = ScriptedGenerator::repeating(bank_world());
    let prompts = PromptEngine::new();
    let options = CompileOptions::default();
    let limit = options.generation_limit as usize;
    let compiled = TaskCompiler::new(&domain, &generator, &prompts, options)
        .compile_domain(Some(&["transfer_funds".to_string()]))
        .expect("compile");

    let asked = generator.prompts();
    assert!(!asked.is_empty());
    assert!(asked[0].contains("transfer_funds"));
    let tasks = compiled.tasks["transfer_funds"].len();
    assert!(asked.len() <= tasks * limit);
    // Tasks the fixed world cannot satisfy are flagged rather than dropped.
    let flagged = compiled.tasks["transfer_funds"]
        .iter()
        .filter(|t| t.manfix_id.is_some())
        .count();
    assert_eq!(flagged, compiled.manual_fix.len());
}

/// Replaying a verified task's action graph reaches the goal exactly when
/// the task expects it to.
#[test]
fn oracle_dialogues_match_expected_outcome() {
    let domain = bank();
    let goals = domain.descriptor().list_actions();
    let goal_refs: Vec<&str> = goals.iter().map(String::as_str).collect();
    let compiled = compile_bank(&goal_refs);

    let mut checked = 0;
    for task in compiled.tasks.values().flatten() {
        if task.manfix_id.is_some() {
            continue;
        }
        let trajectory = oracle_trajectory(&domain, task);
        let evaluation = evaluate_trajectory(
            &domain,
            task,
            &trajectory,
            CompileOptions::default().expansion(),
        )
        .expect("evaluate");
        assert_eq!(
            evaluation.action_successfully_called, task.action_should_succeed,
            "goal {} expected success={}: {evaluation:?}",
            task.goal, task.action_should_succeed
        );
        if task.action_should_succeed {
            assert!(evaluation.success, "goal {}: {evaluation:?}", task.goal);
        }
        checked += 1;
    }
    assert!(checked > 0);
}

#[test]
fn evaluation_is_deterministic() {
    let domain = bank();
    let compiled = compile_bank(&["transfer_funds"]);
    let task = compiled.tasks["transfer_funds"]
        .iter()
        .find(|t| t.manfix_id.is_none())
        .expect("verified task");
    let trajectory = oracle_trajectory(&domain, task);

    let reloaded: TaskRecord =
        serde_json::from_value(serde_json::to_value(task).expect("serialize")).expect("parse");
    let options = CompileOptions::default().expansion();
    let first = evaluate_trajectory(&domain, task, &trajectory, options).expect("evaluate");
    let second = evaluate_trajectory(&domain, &reloaded, &trajectory, options).expect("evaluate");
    assert_eq!(first, second);
}
