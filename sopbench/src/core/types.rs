//! Shared deterministic types: conversation messages and evaluation results.
//!
//! These types are the contract between the simulation loop, the evaluator
//! and the statistics layer. They carry no behaviour beyond serialization
//! and small projections.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the tool either agent calls to end the conversation.
pub const EXIT_CONVERSATION: &str = "exit_conversation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// One conversation message. Tool results carry the id of the call they
/// answer and the JSON-encoded response as content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn with_tool_calls(role: Role, content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role,
            content,
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool_result(call: &ToolCall, response: &Value) -> Self {
        Self {
            role: Role::Tool,
            content: Some(response.to_string()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call.id.clone()),
            name: Some(call.name.clone()),
        }
    }

    pub fn calls_exit(&self) -> bool {
        self.tool_calls.iter().any(|call| call.name == EXIT_CONVERSATION)
    }
}

/// A tool call paired with the response the agent saw, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: Map<String, Value>,
    pub response: Option<Value>,
}

/// Assistant tool calls in trajectory order, excluding `exit_conversation`.
pub fn tool_call_records(trajectory: &[Message]) -> Vec<ToolCallRecord> {
    let mut records = Vec::new();
    for (idx, message) in trajectory.iter().enumerate() {
        if message.role != Role::Assistant {
            continue;
        }
        for call in &message.tool_calls {
            if call.name == EXIT_CONVERSATION {
                continue;
            }
            let response = trajectory[idx + 1..]
                .iter()
                .find(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some(call.id.as_str()))
                .and_then(|m| m.content.as_deref())
                .map(|content| {
                    serde_json::from_str(content).unwrap_or_else(|_| Value::String(content.to_string()))
                });
            records.push(ToolCallRecord {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                response,
            });
        }
    }
    records
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeCategory {
    CorrectProcedureCorrectOutcome,
    CorrectProcedureWrongOutcome,
    WrongProcedureCorrectOutcome,
    WrongProcedureWrongOutcome,
}

impl OutcomeCategory {
    pub fn classify(procedure_correct: bool, outcome_correct: bool) -> Self {
        match (procedure_correct, outcome_correct) {
            (true, true) => OutcomeCategory::CorrectProcedureCorrectOutcome,
            (true, false) => OutcomeCategory::CorrectProcedureWrongOutcome,
            (false, true) => OutcomeCategory::WrongProcedureCorrectOutcome,
            (false, false) => OutcomeCategory::WrongProcedureWrongOutcome,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeCategory::CorrectProcedureCorrectOutcome => "correct_procedure_correct_outcome",
            OutcomeCategory::CorrectProcedureWrongOutcome => "correct_procedure_wrong_outcome",
            OutcomeCategory::WrongProcedureCorrectOutcome => "wrong_procedure_correct_outcome",
            OutcomeCategory::WrongProcedureWrongOutcome => "wrong_procedure_wrong_outcome",
        }
    }
}

/// First failing check, in the order a reviewer would triage them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    None,
    ToolCallError,
    ConstraintViolated,
    DatabaseMismatch,
    WrongOutcome,
    DirgraphUnsatisfied,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::None => "none",
            ErrorCategory::ToolCallError => "tool_call_error",
            ErrorCategory::ConstraintViolated => "constraint_violated",
            ErrorCategory::DatabaseMismatch => "database_mismatch",
            ErrorCategory::WrongOutcome => "wrong_outcome",
            ErrorCategory::DirgraphUnsatisfied => "dirgraph_unsatisfied",
        }
    }
}

/// Scores for one trajectory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub no_tool_call_error: bool,
    pub constraint_not_violated: bool,
    pub database_match: bool,
    pub action_successfully_called: bool,
    pub action_called_correctly: bool,
    pub dirgraph_satisfied: bool,
    pub success: bool,
    pub num_messages: usize,
    pub num_function_calls: usize,
    pub num_constraints: usize,
    pub num_constraints_expanded: usize,
    pub outcome_category: OutcomeCategory,
    pub error_category: ErrorCategory,
}

impl Evaluation {
    /// Fields averaged by the statistics layer, booleans as 0/1.
    pub fn numeric_fields(&self) -> [(&'static str, f64); 11] {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        [
            ("no_tool_call_error", flag(self.no_tool_call_error)),
            ("constraint_not_violated", flag(self.constraint_not_violated)),
            ("database_match", flag(self.database_match)),
            ("action_successfully_called", flag(self.action_successfully_called)),
            ("action_called_correctly", flag(self.action_called_correctly)),
            ("dirgraph_satisfied", flag(self.dirgraph_satisfied)),
            ("success", flag(self.success)),
            ("num_messages", self.num_messages as f64),
            ("num_function_calls", self.num_function_calls as f64),
            ("num_constraints", self.num_constraints as f64),
            ("num_constraints_expanded", self.num_constraints_expanded as f64),
        ]
    }

    /// Fields counted into distributions.
    pub fn label_fields(&self) -> [(&'static str, &'static str); 2] {
        [
            ("outcome_category", self.outcome_category.as_str()),
            ("error_category", self.error_category.as_str()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: Map::new(),
        }
    }

    #[test]
    fn records_pair_calls_with_responses() {
        let login = call("c1", "login_user");
        let exit = call("c2", EXIT_CONVERSATION);
        let trajectory = vec![
            Message::text(Role::User, "hi"),
            Message::with_tool_calls(Role::Assistant, None, vec![login.clone()]),
            Message::tool_result(&login, &json!(true)),
            Message::with_tool_calls(Role::Assistant, None, vec![exit]),
        ];
        let records = tool_call_records(&trajectory);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "login_user");
        assert_eq!(records[0].response, Some(json!(true)));
    }

    #[test]
    fn message_omits_empty_fields() {
        let value = serde_json::to_value(Message::text(Role::User, "hi")).unwrap();
        assert_eq!(value, json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn categories_serialize_snake_case() {
        let value = serde_json::to_value(OutcomeCategory::classify(true, false)).unwrap();
        assert_eq!(value, json!("correct_procedure_wrong_outcome"));
        assert_eq!(ErrorCategory::DirgraphUnsatisfied.as_str(), "dirgraph_unsatisfied");
    }
}
