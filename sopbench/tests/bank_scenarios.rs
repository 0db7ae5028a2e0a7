//! End-to-end dialogues on the bank domain.
//!
//! Each test scripts both sides of a conversation, runs it through
//! `simulate` against a plain instance and scores the trajectory with
//! `evaluate_trajectory`.

use std::sync::atomic::AtomicBool;

use serde_json::{Map, Value, json};
use sopbench::compile::TaskRecord;
use sopbench::core::dag::build_action_graph;
use sopbench::core::expand::{ExpansionOptions, LinkScratchpad, expand_sop};
use sopbench::core::types::{ErrorCategory, Evaluation, Message};
use sopbench::domain::bank::{BankDatabase, BankDomain};
use sopbench::domain::{Domain, DomainInstance};
use sopbench::evaluate::evaluate_trajectory;
use sopbench::simulate::{SimulationOptions, simulate};
use sopbench::test_support::{ScriptedAgent, bank, call, exit, say};

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Task built straight from the bank descriptor, the way the compiler
/// would for a success row.
fn task(domain: &BankDomain, goal: &str, user_known: Value, should_succeed: bool) -> TaskRecord {
    let descriptor = domain.descriptor();
    let options = ExpansionOptions::default();
    let mut scratchpad = LinkScratchpad::new();
    let sop = expand_sop(goal, descriptor, options, &mut scratchpad).expect("expand");
    let graph = build_action_graph(
        goal,
        sop.original.as_ref(),
        descriptor,
        options.default_option,
        &mut scratchpad,
    )
    .expect("graph");
    TaskRecord {
        goal: goal.to_string(),
        initial_database: serde_json::to_value(BankDatabase::sample()).expect("database"),
        user_known: object(user_known),
        constraint_parameters: Map::new(),
        dependency: sop.dependency,
        dependency_original: sop.original,
        dependency_permutation: sop.expanded,
        action_should_succeed: should_succeed,
        directed_action_graph: graph,
        user_instruction: String::new(),
        user_prompt: String::new(),
        manfix_id: None,
    }
}

fn transfer_task(domain: &BankDomain) -> TaskRecord {
    task(
        domain,
        "transfer_funds",
        json!({
            "username": "alice",
            "identification": "id-a",
            "admin_password": "pw-a",
            "amount": 100,
            "destination_username": "bob",
        }),
        true,
    )
}

fn login() -> Message {
    call(
        "c1",
        "login_user",
        json!({"username": "alice", "identification": "id-a"}),
    )
}

fn authenticate(password: &str) -> Message {
    call(
        "c2",
        "authenticate_admin_password",
        json!({"username": "alice", "admin_password": password}),
    )
}

fn transfer() -> Message {
    call(
        "c3",
        "transfer_funds",
        json!({"username": "alice", "destination_username": "bob", "amount": 100}),
    )
}

/// Play `assistant_turns` against a user who asks once and then leaves.
fn run(domain: &BankDomain, task: &TaskRecord, assistant_turns: Vec<Message>) -> (Evaluation, Value) {
    let mut user = ScriptedAgent::new(vec![say("Please send 100 to bob."), exit()]);
    let mut assistant = ScriptedAgent::new(assistant_turns);
    let mut instance = DomainInstance::plain(
        domain,
        Some(&task.initial_database),
        task.constraint_parameters.clone(),
    )
    .expect("instance");
    let outcome = simulate(
        &mut user,
        &mut assistant,
        &mut instance,
        &SimulationOptions::default(),
        &AtomicBool::new(false),
    )
    .expect("simulate");
    let evaluation = evaluate_trajectory(
        domain,
        task,
        &outcome.trajectory,
        ExpansionOptions::default(),
    )
    .expect("evaluate");
    (evaluation, outcome.database)
}

fn balance(database: &Value, user: &str) -> f64 {
    database["accounts"][user]["balance"]
        .as_f64()
        .expect("balance")
}

#[test]
fn transfer_happy_path_passes_every_check() {
    let domain = bank();
    let task = transfer_task(&domain);
    let (evaluation, database) = run(
        &domain,
        &task,
        vec![login(), authenticate("pw-a"), transfer(), say("Done.")],
    );

    assert!(evaluation.no_tool_call_error);
    assert!(evaluation.constraint_not_violated);
    assert!(evaluation.database_match);
    assert!(evaluation.action_successfully_called);
    assert!(evaluation.action_called_correctly);
    assert!(evaluation.dirgraph_satisfied);
    assert!(evaluation.success);
    assert_eq!(evaluation.error_category, ErrorCategory::None);
    assert_eq!(evaluation.num_function_calls, 3);
    assert_eq!(balance(&database, "alice"), 400.0);
    assert_eq!(balance(&database, "bob"), 100.0);
}

#[test]
fn missing_login_breaks_the_procedure() {
    let domain = bank();
    let task = transfer_task(&domain);
    let (evaluation, database) = run(
        &domain,
        &task,
        vec![authenticate("pw-a"), transfer(), say("Done.")],
    );

    assert!(!evaluation.dirgraph_satisfied);
    assert!(!evaluation.action_successfully_called);
    assert!(!evaluation.success);
    // The plain system let the transfer through; the SOP would not have.
    assert!(!evaluation.database_match);
    assert_eq!(balance(&database, "alice"), 400.0);
}

#[test]
fn wrong_password_refuses_the_transfer() {
    let domain = bank();
    let expecting_success = transfer_task(&domain);
    let trace = vec![login(), authenticate("pw-wrong"), transfer(), say("Sorry.")];

    let (evaluation, database) = run(&domain, &expecting_success, trace.clone());
    assert!(evaluation.database_match);
    assert!(!evaluation.action_successfully_called);
    assert!(!evaluation.action_called_correctly);
    assert!(!evaluation.success);
    assert_eq!(balance(&database, "alice"), 500.0);

    let expecting_failure = TaskRecord {
        action_should_succeed: false,
        ..expecting_success
    };
    let (evaluation, _) = run(&domain, &expecting_failure, trace);
    assert!(evaluation.database_match);
    assert!(evaluation.action_called_correctly);
}

#[test]
fn close_account_graph_shares_one_login() {
    let domain = bank();
    let task = task(&domain, "close_account", json!({"username": "alice"}), true);
    let graph = &task.directed_action_graph;
    assert_eq!(graph.action_nodes("login_user").len(), 1);
    assert_eq!(graph.action_nodes("authenticate_admin_password").len(), 1);
    assert_eq!(graph.action_nodes("verify_security_answer").len(), 1);
    assert!(graph.validate().is_empty(), "{:?}", graph.validate());

    let login_node = graph.action_nodes("login_user")[0];
    let parents = (0..graph.len())
        .filter(|idx| graph.successors(*idx).contains(&login_node))
        .count();
    assert!(parents >= 2, "login_user should be shared, has {parents} parent(s)");
}

#[test]
fn close_account_accepts_either_credential() {
    let domain = bank();
    let task = task(
        &domain,
        "close_account",
        json!({"username": "alice", "identification": "id-a", "security_answer": "blue"}),
        true,
    );
    let (evaluation, database) = run(
        &domain,
        &task,
        vec![
            login(),
            call(
                "c2",
                "verify_security_answer",
                json!({"username": "alice", "security_answer": "blue"}),
            ),
            call("c3", "get_loans", json!({"username": "alice"})),
            call("c4", "close_account", json!({"username": "alice"})),
            say("Closed."),
        ],
    );
    assert!(evaluation.dirgraph_satisfied, "{evaluation:?}");
    assert!(evaluation.success, "{evaluation:?}");
    assert!(database["accounts"].get("alice").is_none());
}
