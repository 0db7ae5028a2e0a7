//! Chat-model access: request/response types, tool schemas and a
//! command-backed client.
//!
//! The harness never talks to a provider directly. A configured command
//! receives the request as JSON on stdin and prints the reply on stdout;
//! provider credentials reach it through its environment.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use super::process::run_command_with_timeout;
use crate::core::descriptor::DomainDescriptor;
use crate::core::types::{EXIT_CONVERSATION, Message, Role, ToolCall};
use crate::domain::HelperSpec;

/// How tool calls travel between the assistant and the harness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ToolCallMode {
    /// Native function calling.
    #[default]
    Fc,
    /// Thought / Action / Action Input text.
    React,
    /// Action / Action Input text without a thought.
    ActOnly,
    /// ReAct with an explicit verification thought.
    ReactV,
}

impl ToolCallMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolCallMode::Fc => "fc",
            ToolCallMode::React => "react",
            ToolCallMode::ActOnly => "act-only",
            ToolCallMode::ReactV => "react-v",
        }
    }

    pub fn is_text(self) -> bool {
        self != ToolCallMode::Fc
    }
}

/// Which tools the assistant is offered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ToolList {
    /// Every action and helper of the domain.
    #[default]
    Full,
    /// Only the actions the task's action graph needs, plus helpers.
    Oracle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<String>,
    #[serde(default)]
    pub param_types: BTreeMap<String, String>,
}

impl ToolSpec {
    pub fn exit_conversation() -> Self {
        Self {
            name: EXIT_CONVERSATION.to_string(),
            description: "End the conversation.".to_string(),
            parameters: Vec::new(),
            param_types: BTreeMap::new(),
        }
    }

    /// OpenAI-style function schema.
    pub fn to_function_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .parameters
            .iter()
            .map(|param| {
                let kind = self
                    .param_types
                    .get(param)
                    .map_or("string", String::as_str);
                (param.clone(), json!({ "type": kind }))
            })
            .collect();
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": self.parameters,
                },
            },
        })
    }
}

/// Tool specs for a domain's assistant.
///
/// `required_actions` restricts the action list under [`ToolList::Oracle`].
pub fn domain_tools(
    descriptor: &DomainDescriptor,
    helpers: &[HelperSpec],
    list: ToolList,
    required_actions: &[String],
) -> Vec<ToolSpec> {
    let actions = descriptor
        .list_actions()
        .into_iter()
        .filter(|action| list == ToolList::Full || required_actions.contains(action));
    let mut tools: Vec<ToolSpec> = actions
        .map(|action| {
            let mut description = descriptor.description(&action).unwrap_or_default();
            if let Some(returns) = descriptor.return_description(&action)
                && !returns.is_empty()
            {
                description = format!("{description} Returns: {returns}");
            }
            ToolSpec {
                description,
                parameters: descriptor.parameters(&action),
                param_types: descriptor.param_types(&action),
                name: action,
            }
        })
        .collect();
    tools.extend(helpers.iter().map(|helper| ToolSpec {
        name: helper.name.clone(),
        description: helper.description.clone(),
        parameters: helper.parameters.clone(),
        param_types: BTreeMap::new(),
    }));
    tools
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// Offered natively; empty in text tool-call modes.
    pub tools: Vec<ToolSpec>,
    /// Requests still pending at this instant are abandoned.
    pub deadline: Instant,
}

impl ChatRequest {
    /// Body sent to the model command. The deadline stays local.
    pub fn to_wire(&self) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": self.messages,
        });
        if !self.tools.is_empty() {
            body["tools"] = Value::Array(self.tools.iter().map(ToolSpec::to_function_schema).collect());
        }
        body
    }
}

/// Synchronous model access, shared across worker threads.
pub trait ChatClient: Sync {
    fn chat_completion(&self, request: &ChatRequest) -> Result<Message>;
}

/// Runs a command per request, optionally caching replies by request hash.
#[derive(Debug, Clone)]
pub struct CommandChatClient {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub cache_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ChatClient for CommandChatClient {
    #[instrument(skip_all, fields(model = %request.model, messages = request.messages.len()))]
    fn chat_completion(&self, request: &ChatRequest) -> Result<Message> {
        let body = serde_json::to_vec(&request.to_wire()).context("serialize chat request")?;
        let key = hex::encode(Sha256::digest(&body));
        let cache_path = self.cache_dir.as_ref().map(|dir| dir.join(format!("{key}.json")));

        if let Some(path) = &cache_path
            && path.exists()
        {
            let cached = fs::read(path).with_context(|| format!("read {}", path.display()))?;
            debug!(key = %key, "chat cache hit");
            return parse_chat_response(&cached);
        }

        let remaining = request.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            bail!("chat request deadline passed before dispatch");
        }
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("model command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        for (name, value) in &self.env {
            cmd.env(name, value);
        }

        let output = run_command_with_timeout(
            cmd,
            Some(&body),
            remaining.min(self.timeout),
            self.output_limit_bytes,
        )
        .with_context(|| format!("run model command {program}"))?;
        if output.timed_out {
            bail!("model command {program} timed out");
        }
        if !output.status.success() {
            bail!(
                "model command {program} exited with {:?}: {}{}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim(),
                output.stderr_truncated_notice("model"),
            );
        }

        let message = parse_chat_response(&output.stdout)?;
        if let Some(path) = &cache_path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create cache dir {}", parent.display()))?;
            }
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, &output.stdout).with_context(|| format!("write {}", tmp.display()))?;
            fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
        }
        Ok(message)
    }
}

/// Parse a model reply: either a bare message or an OpenAI-style
/// completion. Tool-call arguments may arrive as a JSON string.
pub fn parse_chat_response(raw: &[u8]) -> Result<Message> {
    let value: Value = serde_json::from_slice(raw).context("model reply is not JSON")?;
    let message = value
        .pointer("/choices/0/message")
        .cloned()
        .unwrap_or(value);

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);
    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for (idx, call) in calls.iter().enumerate() {
            let function = call.get("function").unwrap_or(call);
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("tool call {idx} has no name"))?;
            let arguments = match function.get("arguments") {
                Some(Value::String(text)) if text.trim().is_empty() => Map::new(),
                Some(Value::String(text)) => serde_json::from_str(text)
                    .with_context(|| format!("arguments of tool call {name}"))?,
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            };
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .map_or_else(|| format!("call_{idx}"), str::to_string);
            tool_calls.push(ToolCall {
                id,
                name: name.to_string(),
                arguments,
            });
        }
    }
    Ok(Message::with_tool_calls(Role::Assistant, content, tool_calls))
}

static ACTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)Action:\s*([A-Za-z_][A-Za-z0-9_]*)\s*\n\s*Action Input:\s*(\{.*\})")
        .expect("action regex should be valid")
});

/// Tool call written as `Action:` / `Action Input:` text, if any.
pub fn parse_text_action(content: &str, id: &str) -> Option<ToolCall> {
    let caps = ACTION_RE.captures(content)?;
    let name = caps.get(1)?.as_str();
    let input = caps.get(2)?.as_str();
    match serde_json::from_str::<Map<String, Value>>(input) {
        Ok(arguments) => Some(ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }),
        Err(err) => {
            warn!(tool = name, err = %err, "unparseable action input");
            None
        }
    }
}

/// Rewrite native tool traffic as text for text tool-call modes.
pub fn render_text_history(history: &[Message]) -> Vec<Message> {
    history
        .iter()
        .map(|message| match message.role {
            Role::Tool => Message::text(
                Role::User,
                format!("Observation: {}", message.content.as_deref().unwrap_or("null")),
            ),
            Role::Assistant if !message.tool_calls.is_empty() => {
                let mut text = message.content.clone().unwrap_or_default();
                for call in &message.tool_calls {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(&format!(
                        "Action: {}\nAction Input: {}",
                        call.name,
                        Value::Object(call.arguments.clone())
                    ));
                }
                Message::text(Role::Assistant, text)
            }
            _ => message.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_openai_completion_with_string_arguments() {
        let raw = br#"{"choices":[{"message":{"role":"assistant","content":null,
            "tool_calls":[{"id":"c9","type":"function",
            "function":{"name":"login_user","arguments":"{\"username\":\"alice\"}"}}]}}]}"#;
        let message = parse_chat_response(raw).unwrap();
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].id, "c9");
        assert_eq!(message.tool_calls[0].arguments["username"], json!("alice"));
    }

    #[test]
    fn parses_bare_text_message() {
        let message = parse_chat_response(br#"{"role":"assistant","content":"hello"}"#).unwrap();
        assert_eq!(message.content.as_deref(), Some("hello"));
        assert!(message.tool_calls.is_empty());
    }

    #[test]
    fn text_actions_round_trip() {
        let text = "Thought: need login\nAction: login_user\nAction Input: {\"username\": \"alice\", \"identification\": \"id-a\"}";
        let call = parse_text_action(text, "t1").unwrap();
        assert_eq!(call.name, "login_user");
        assert_eq!(call.arguments["identification"], json!("id-a"));
        assert!(parse_text_action("Just chatting.", "t2").is_none());

        let history = vec![
            Message::with_tool_calls(Role::Assistant, None, vec![call.clone()]),
            Message::tool_result(&call, &json!(true)),
        ];
        let rendered = render_text_history(&history);
        assert_eq!(rendered[1].role, Role::User);
        assert_eq!(rendered[1].content.as_deref(), Some("Observation: true"));
        let reparsed = parse_text_action(rendered[0].content.as_deref().unwrap(), "t1").unwrap();
        assert_eq!(reparsed, call);
    }

    #[test]
    fn function_schema_marks_all_parameters_required() {
        let spec = ToolSpec {
            name: "deposit_funds".to_string(),
            description: "Deposit.".to_string(),
            parameters: vec!["username".to_string(), "amount".to_string()],
            param_types: [("amount".to_string(), "number".to_string())].into_iter().collect(),
        };
        let schema = spec.to_function_schema();
        assert_eq!(schema["function"]["parameters"]["properties"]["amount"]["type"], json!("number"));
        assert_eq!(schema["function"]["parameters"]["required"], json!(["username", "amount"]));
    }

    #[test]
    fn cached_reply_skips_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let client = CommandChatClient {
            command: vec!["/nonexistent/model".to_string()],
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
            cache_dir: Some(dir.path().to_path_buf()),
            env: Vec::new(),
        };
        let request = ChatRequest {
            model: "m".to_string(),
            messages: vec![Message::text(Role::User, "hi")],
            tools: Vec::new(),
            deadline: Instant::now() + Duration::from_secs(5),
        };
        let body = serde_json::to_vec(&request.to_wire()).unwrap();
        let key = hex::encode(Sha256::digest(&body));
        fs::write(dir.path().join(format!("{key}.json")), br#"{"content":"cached"}"#).unwrap();

        let reply = client.chat_completion(&request).unwrap();
        assert_eq!(reply.content.as_deref(), Some("cached"));
    }
}
