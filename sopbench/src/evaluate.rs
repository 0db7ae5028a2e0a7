//! Trajectory evaluator.
//!
//! The agent's tool calls are replayed in order against two fresh
//! instances built from the task's initial database: a strict one, which
//! enforces the task's SOP and yields the ground-truth responses, and a
//! plain one, which reproduces what actually happened. The action graph is
//! checked per call against the calls that already succeeded.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::compile::TaskRecord;
use crate::core::constraint::Single;
use crate::core::dag::{ActionGraph, DagNode, GraphRelation};
use crate::core::descriptor::{DomainDescriptor, link_action_args};
use crate::core::expand::ExpansionOptions;
use crate::core::types::{
    ErrorCategory, Evaluation, Message, OutcomeCategory, ToolCallRecord, tool_call_records,
};
use crate::domain::instance::{bind_args, full_dependencies};
use crate::domain::{Domain, DomainInstance, normalize_response, response_succeeded};
use crate::error::SopError;

/// Ground-truth status of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CallStatus {
    /// An action both views expose.
    Valid,
    /// A read-only helper only the plain view exposes.
    PlainOnly,
    /// Unknown tool or malformed arguments.
    Invalid,
}

impl From<CallStatus> for u8 {
    fn from(status: CallStatus) -> u8 {
        match status {
            CallStatus::Valid => 0,
            CallStatus::PlainOnly => 1,
            CallStatus::Invalid => 2,
        }
    }
}

impl TryFrom<u8> for CallStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(CallStatus::Valid),
            1 => Ok(CallStatus::PlainOnly),
            2 => Ok(CallStatus::Invalid),
            other => Err(format!("unknown call status {other}")),
        }
    }
}

/// Calls that succeeded in order, keyed by action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuccessfulCalls {
    calls: BTreeMap<String, Vec<Map<String, Value>>>,
}

impl SuccessfulCalls {
    pub fn record(&mut self, action: &str, args: Map<String, Value>) {
        self.calls.entry(action.to_string()).or_default().push(args);
    }

    /// Whether `action` succeeded with arguments matching `expected`.
    /// Null on either side matches anything.
    pub fn matches(&self, action: &str, expected: &Map<String, Value>) -> bool {
        self.calls.get(action).is_some_and(|calls| {
            calls.iter().any(|recorded| {
                expected.iter().all(|(param, want)| match recorded.get(param) {
                    _ if want.is_null() => true,
                    None | Some(Value::Null) => true,
                    Some(got) => values_equal(want, got),
                })
            })
        })
    }

    pub fn contains(&self, action: &str) -> bool {
        self.calls.contains_key(action)
    }
}

/// Equality that tolerates numbers sent as strings.
fn values_equal(left: &Value, right: &Value) -> bool {
    let as_number = |value: &Value| match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match (left, right) {
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            match (as_number(left), as_number(right)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        _ => left == right,
    }
}

/// Recorded and ground-truth responses agree up to `[true, payload]`
/// wrapping and numeric representation.
pub fn responses_match(recorded: &Value, truth: &Value) -> bool {
    let recorded = normalize_response(recorded);
    let truth = normalize_response(truth);
    match (&recorded, &truth) {
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| responses_match(x, y))
        }
        _ => values_equal(&recorded, &truth),
    }
}

/// Whether the graph's prerequisites of a call to `action` with `args`
/// are met. Actions absent from the graph are unconstrained.
pub fn dag_satisfied(
    graph: &ActionGraph,
    action: &str,
    args: &Map<String, Value>,
    successful: &SuccessfulCalls,
) -> bool {
    let nodes = graph.action_nodes(action);
    if nodes.is_empty() {
        return true;
    }
    nodes.into_iter().any(|idx| {
        let DagNode::Action { args: node_args, .. } = &graph.nodes[idx] else {
            return false;
        };
        let bindings: Map<String, Value> = node_args
            .iter()
            .filter_map(|(param, symbol)| args.get(param).map(|value| (symbol.clone(), value.clone())))
            .collect();
        graph
            .successors(idx)
            .iter()
            .all(|&next| requirement_met(graph, next, &bindings, successful))
    })
}

fn requirement_met(
    graph: &ActionGraph,
    idx: usize,
    bindings: &Map<String, Value>,
    successful: &SuccessfulCalls,
) -> bool {
    match &graph.nodes[idx] {
        DagNode::Relation(GraphRelation::And) => graph
            .successors(idx)
            .iter()
            .all(|&next| requirement_met(graph, next, bindings, successful)),
        DagNode::Relation(GraphRelation::Or) => graph
            .successors(idx)
            .iter()
            .any(|&next| requirement_met(graph, next, bindings, successful)),
        DagNode::Action { name, args } => {
            let expected = bind_args(&Single::new(name.clone(), args.clone()), bindings, &Map::new());
            successful.matches(name, &expected)
        }
    }
}

/// Credit the linked actions implied by a successful call's innate deps.
fn credit_innate(
    descriptor: &DomainDescriptor,
    action: &str,
    args: &Map<String, Value>,
    constraint_parameters: &Map<String, Value>,
    successful: &mut SuccessfulCalls,
    visiting: &mut BTreeSet<String>,
) {
    let Some(innate) = descriptor.innate_deps(action) else {
        return;
    };
    if !visiting.insert(action.to_string()) {
        return;
    }
    let mut implied = Vec::new();
    innate.visit_singles(&mut |single: &Single| {
        if !single.negated
            && let Some(link) = descriptor.link(&single.name)
        {
            let params = descriptor.parameters(&link.action);
            let symbols = link_action_args(link, &single.args, &params);
            let call = bind_args(
                &Single::new(link.action.clone(), symbols),
                args,
                constraint_parameters,
            );
            implied.push((link.action.clone(), call));
        }
    });
    for (linked, call) in implied {
        debug!(action, implied = %linked, "crediting innate call");
        successful.record(&linked, call.clone());
        credit_innate(descriptor, &linked, &call, constraint_parameters, successful, visiting);
    }
    visiting.remove(action);
}

fn call_status(instance: &DomainInstance<'_>, plain: &DomainInstance<'_>, name: &str) -> CallStatus {
    if instance.has_tool(name) && plain.has_tool(name) {
        CallStatus::Valid
    } else if plain.has_tool(name) {
        CallStatus::PlainOnly
    } else {
        CallStatus::Invalid
    }
}

/// Per-call replay result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallVerdict {
    pub name: String,
    pub status: CallStatus,
    pub expected: Option<Value>,
    pub recorded: Option<Value>,
    pub dag_satisfied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replay {
    pub evaluation: Evaluation,
    pub calls: Vec<CallVerdict>,
    pub final_database: Value,
}

/// Score `trajectory` against `task`.
pub fn evaluate_trajectory(
    domain: &dyn Domain,
    task: &TaskRecord,
    trajectory: &[Message],
    options: ExpansionOptions,
) -> Result<Evaluation, SopError> {
    replay_trajectory(domain, task, trajectory, options).map(|replay| replay.evaluation)
}

#[instrument(skip_all, fields(goal = %task.goal, messages = trajectory.len()))]
pub fn replay_trajectory(
    domain: &dyn Domain,
    task: &TaskRecord,
    trajectory: &[Message],
    options: ExpansionOptions,
) -> Result<Replay, SopError> {
    let descriptor = domain.descriptor();
    let full_deps = full_dependencies(descriptor, options, &task.goal, task.dependency.as_ref())?;
    let mut strict = DomainInstance::strict(
        domain,
        Some(&task.initial_database),
        true,
        full_deps,
        task.constraint_parameters.clone(),
    )?;
    let mut plain = DomainInstance::plain(
        domain,
        Some(&task.initial_database),
        task.constraint_parameters.clone(),
    )?;

    let records = tool_call_records(trajectory);
    let graph = &task.directed_action_graph;
    let mut successful = SuccessfulCalls::default();
    let mut verdicts = Vec::with_capacity(records.len());
    let mut no_tool_call_error = true;
    let mut constraint_not_violated = true;
    let mut dirgraph_satisfied = true;
    let mut goal_succeeded = false;

    for ToolCallRecord {
        name,
        arguments,
        response,
    } in &records
    {
        let mut verdict = CallVerdict {
            name: name.clone(),
            status: call_status(&strict, &plain, name),
            expected: None,
            recorded: response.clone(),
            dag_satisfied: true,
        };

        match verdict.status {
            CallStatus::Invalid => no_tool_call_error = false,
            CallStatus::PlainOnly => match plain.call(name, arguments) {
                Ok(truth) => {
                    if let Some(recorded) = response
                        && !responses_match(recorded, &truth)
                    {
                        constraint_not_violated = false;
                    }
                    verdict.expected = Some(truth);
                }
                Err(SopError::ToolCall { .. }) => {
                    verdict.status = CallStatus::Invalid;
                    no_tool_call_error = false;
                }
                Err(err) => return Err(err),
            },
            CallStatus::Valid => {
                let expected = strict.call(name, arguments);
                let actual = plain.call(name, arguments);
                let (expected, actual) = match (expected, actual) {
                    (Ok(expected), Ok(actual)) => (expected, actual),
                    (Err(SopError::ToolCall { .. }), _) | (_, Err(SopError::ToolCall { .. })) => {
                        verdict.status = CallStatus::Invalid;
                        no_tool_call_error = false;
                        verdicts.push(verdict);
                        continue;
                    }
                    (Err(err), _) | (_, Err(err)) => return Err(err),
                };

                let recorded = response.as_ref().unwrap_or(&actual);
                if !responses_match(recorded, &expected) {
                    constraint_not_violated = false;
                }
                let ordered = dag_satisfied(graph, name, arguments, &successful);
                if !ordered {
                    debug!(tool = %name, "call out of graph order");
                    dirgraph_satisfied = false;
                }
                if *name == task.goal && response_succeeded(&expected) {
                    goal_succeeded = true;
                }
                if ordered && response_succeeded(&actual) {
                    successful.record(name, arguments.clone());
                    let mut visiting = BTreeSet::new();
                    credit_innate(
                        descriptor,
                        name,
                        arguments,
                        &task.constraint_parameters,
                        &mut successful,
                        &mut visiting,
                    );
                }
                verdict.expected = Some(expected);
                verdict.dag_satisfied = ordered;
            }
        }
        verdicts.push(verdict);
    }

    let final_database = plain.database();
    let database_match = final_database == strict.database();
    let action_successfully_called = goal_succeeded;
    let action_called_correctly = task.action_should_succeed == action_successfully_called;
    let success = no_tool_call_error
        && constraint_not_violated
        && database_match
        && action_called_correctly
        && dirgraph_satisfied;

    let error_category = if !no_tool_call_error {
        ErrorCategory::ToolCallError
    } else if !constraint_not_violated {
        ErrorCategory::ConstraintViolated
    } else if !database_match {
        ErrorCategory::DatabaseMismatch
    } else if !action_called_correctly {
        ErrorCategory::WrongOutcome
    } else if !dirgraph_satisfied {
        ErrorCategory::DirgraphUnsatisfied
    } else {
        ErrorCategory::None
    };
    let outcome_category = OutcomeCategory::classify(
        no_tool_call_error && constraint_not_violated && dirgraph_satisfied,
        database_match && action_called_correctly,
    );

    let evaluation = Evaluation {
        no_tool_call_error,
        constraint_not_violated,
        database_match,
        action_successfully_called,
        action_called_correctly,
        dirgraph_satisfied,
        success,
        num_messages: trajectory.len(),
        num_function_calls: records.len(),
        num_constraints: task
            .dependency_original
            .as_ref()
            .map_or(0, |tree| tree.count_singles()),
        num_constraints_expanded: task
            .dependency_permutation
            .as_ref()
            .map_or(0, |tree| tree.count_singles()),
        outcome_category,
        error_category,
    };
    Ok(Replay {
        evaluation,
        calls: verdicts,
        final_database,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constraint::Args;
    use crate::domain::bank::BankDomain;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn null_is_a_wildcard_on_both_sides() {
        let mut calls = SuccessfulCalls::default();
        calls.record("login_user", args(json!({"username": "alice", "identification": null})));
        assert!(calls.matches("login_user", &args(json!({"username": "alice", "identification": "x"}))));
        assert!(calls.matches("login_user", &args(json!({"username": "alice"}))));
        assert!(!calls.matches("login_user", &args(json!({"username": "bob"}))));
        assert!(!calls.matches("logout_user", &Map::new()));
    }

    #[test]
    fn numbers_compare_across_representations() {
        assert!(values_equal(&json!(100), &json!("100")));
        assert!(values_equal(&json!(100.0), &json!(100)));
        assert!(!values_equal(&json!(100), &json!("abc")));
        assert!(responses_match(&json!([true, 5]), &json!(5)));
        assert!(!responses_match(&json!(true), &json!(false)));
    }

    #[test]
    fn or_node_needs_one_branch() {
        let ident = |name: &str| DagNode::action(name, Args::from([("u".to_string(), "u".to_string())]));
        let mut graph = ActionGraph::new();
        let goal = graph.add_node(ident("close"));
        let or = graph.add_node(DagNode::Relation(GraphRelation::Or));
        let a = graph.add_node(ident("auth"));
        let b = graph.add_node(ident("verify"));
        graph.connect(goal, or);
        graph.connect(or, a);
        graph.connect(or, b);

        let call = args(json!({"u": "alice"}));
        let mut done = SuccessfulCalls::default();
        assert!(!dag_satisfied(&graph, "close", &call, &done));
        done.record("verify", args(json!({"u": "alice"})));
        assert!(dag_satisfied(&graph, "close", &call, &done));
        assert!(!dag_satisfied(&graph, "close", &args(json!({"u": "bob"})), &done));
        assert!(dag_satisfied(&graph, "unrelated", &call, &done));
    }

    #[test]
    fn transfer_credits_authentication() {
        let domain = BankDomain::new().unwrap();
        let mut done = SuccessfulCalls::default();
        let call = args(json!({"username": "alice", "destination_username": "bob", "amount": 5}));
        credit_innate(
            domain.descriptor(),
            "transfer_funds",
            &call,
            &Map::new(),
            &mut done,
            &mut BTreeSet::new(),
        );
        assert!(done.matches("authenticate_admin_password", &args(json!({"username": "alice"}))));
        assert!(!done.contains("login_user"));
    }

    #[test]
    fn status_codes_serialize_as_numbers() {
        assert_eq!(serde_json::to_value(CallStatus::PlainOnly).unwrap(), json!(1));
        let back: CallStatus = serde_json::from_value(json!(2)).unwrap();
        assert_eq!(back, CallStatus::Invalid);
    }
}
