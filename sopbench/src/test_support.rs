//! Test-only agents, chat clients, generators and bank fixtures.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{Result, bail};
use serde_json::{Map, Value, json};

use crate::compile::TaskRecord;
use crate::core::constraint::{literal_to_json, literal_value};
use crate::core::types::{EXIT_CONVERSATION, Message, Role, ToolCall};
use crate::domain::Domain;
use crate::domain::bank::{BankDatabase, BankDomain};
use crate::io::chat::{ChatClient, ChatRequest};
use crate::io::generator::TaskGenerator;
use crate::simulate::Agent;

/// Plain text reply.
pub fn say(text: &str) -> Message {
    Message::text(Role::Assistant, text)
}

/// Reply that ends the conversation.
pub fn exit() -> Message {
    call("exit", EXIT_CONVERSATION, json!({}))
}

/// Reply carrying one tool call. `args` must be a JSON object.
pub fn call(id: &str, name: &str, args: Value) -> Message {
    let arguments = match args {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Message::with_tool_calls(
        Role::Assistant,
        None,
        vec![ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }],
    )
}

/// Agent replaying a fixed script, then replying with empty text.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    replies: VecDeque<Message>,
    /// History passed to each step.
    pub seen: Vec<Vec<Message>>,
}

impl ScriptedAgent {
    pub fn new(replies: Vec<Message>) -> Self {
        Self {
            replies: replies.into(),
            seen: Vec::new(),
        }
    }
}

impl Agent for ScriptedAgent {
    fn step(&mut self, history: &[Message]) -> Result<Message> {
        self.seen.push(history.to_vec());
        Ok(self.replies.pop_front().unwrap_or_else(|| say("")))
    }
}

/// Chat client replaying canned replies and recording requests.
#[derive(Debug, Default)]
pub struct ScriptedChatClient {
    replies: Mutex<VecDeque<Message>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChatClient {
    pub fn new(replies: Vec<Message>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ChatClient for ScriptedChatClient {
    fn chat_completion(&self, request: &ChatRequest) -> Result<Message> {
        self.requests.lock().unwrap().push(request.clone());
        match self.replies.lock().unwrap().pop_front() {
            Some(reply) => Ok(reply),
            None => bail!("scripted chat client has no reply left"),
        }
    }
}

/// Generator replaying canned outputs; the last one repeats forever.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(reply: impl Into<String>) -> Self {
        Self::new(vec![reply.into()])
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl TaskGenerator for ScriptedGenerator {
    fn generate(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut replies = self.replies.lock().unwrap();
        match replies.len() {
            0 => bail!("scripted generator has no reply"),
            1 => Ok(replies[0].clone()),
            _ => Ok(replies.pop_front().unwrap_or_default()),
        }
    }
}

pub fn bank() -> BankDomain {
    BankDomain::new().unwrap()
}

/// Generator output for alice moving 100 to bob on the sample database.
pub fn bank_world() -> String {
    let database = serde_json::to_value(BankDatabase::sample()).unwrap();
    json!({
        "initial_database": database,
        "user_known": {
            "username": "alice",
            "identification": "id-a",
            "admin_password": "pw-a",
            "security_answer": "blue",
            "destination_username": "bob",
            "amount": 100
        },
        "constraint_parameters": {}
    })
    .to_string()
}

/// Assistant tool calls following the task's action graph, leaves first,
/// with arguments filled from what the user knows.
pub fn oracle_calls(domain: &dyn Domain, task: &TaskRecord) -> Vec<Message> {
    let resolve = |symbol: &str| -> Option<Value> {
        match literal_value(symbol) {
            Some(payload) => Some(literal_to_json(payload)),
            None => task
                .user_known
                .get(symbol)
                .or_else(|| task.constraint_parameters.get(symbol))
                .cloned(),
        }
    };
    let mut plan = task.directed_action_graph.oracle_plan();
    let goal_args = domain
        .descriptor()
        .parameters(&task.goal)
        .into_iter()
        .map(|p| (p.clone(), p))
        .collect();
    plan.push((task.goal.clone(), goal_args));

    plan.into_iter()
        .enumerate()
        .map(|(idx, (name, args))| {
            let arguments: Map<String, Value> = args
                .iter()
                .filter_map(|(param, symbol)| resolve(symbol).map(|value| (param.clone(), value)))
                .collect();
            call(&format!("oracle_{idx}"), &name, Value::Object(arguments))
        })
        .collect()
}
