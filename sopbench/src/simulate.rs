//! User/assistant dialogue loop over a plain domain instance.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use crate::core::types::{EXIT_CONVERSATION, Message, Role, ToolCall};
use crate::domain::DomainInstance;
use crate::error::SopError;
use crate::io::chat::{
    ChatClient, ChatRequest, ToolCallMode, ToolSpec, parse_text_action, render_text_history,
};

/// A conversation participant. `history` is already presented from this
/// agent's point of view: its own messages carry the assistant role.
pub trait Agent {
    fn step(&mut self, history: &[Message]) -> Result<Message>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationOptions {
    /// Agent steps, user and assistant combined.
    pub max_turns: usize,
    /// Tool calls executed across the whole dialogue.
    pub max_actions: usize,
    pub start_agent: Speaker,
    /// Hand control back to the assistant after tool results instead of the
    /// user.
    pub tool_results_to_assistant: bool,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_actions: 15,
            start_agent: Speaker::User,
            tool_results_to_assistant: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxTurns,
    MaxActions,
    ExitConversation,
}

#[derive(Debug)]
enum State {
    UserTurn,
    AssistantTurn,
    ToolExecution {
        pending: VecDeque<ToolCall>,
        exit_after: bool,
    },
    Done(StopReason),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationOutcome {
    pub trajectory: Vec<Message>,
    pub stop: StopReason,
    pub turns: usize,
    pub actions: usize,
    /// Plain instance database after the dialogue.
    pub database: Value,
}

/// History as the user agent sees it: roles swapped, tool traffic hidden.
pub fn user_view(trajectory: &[Message]) -> Vec<Message> {
    trajectory
        .iter()
        .filter_map(|message| match message.role {
            Role::User => Some(Message::text(
                Role::Assistant,
                message.content.clone().unwrap_or_default(),
            )),
            Role::Assistant => message
                .content
                .as_deref()
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(|text| Message::text(Role::User, text)),
            Role::Tool | Role::System => None,
        })
        .collect()
}

/// Drive one dialogue until a budget runs out or an agent calls
/// `exit_conversation`. Tool calls go to `instance`; a raised `cancel` flag
/// abandons the dialogue with [`SopError::Cancelled`].
#[instrument(skip_all, fields(max_turns = options.max_turns, max_actions = options.max_actions))]
pub fn simulate(
    user: &mut dyn Agent,
    assistant: &mut dyn Agent,
    instance: &mut DomainInstance<'_>,
    options: &SimulationOptions,
    cancel: &AtomicBool,
) -> Result<SimulationOutcome> {
    let mut trajectory: Vec<Message> = Vec::new();
    let mut turns = 0;
    let mut actions = 0;
    let mut state = match options.start_agent {
        Speaker::User => State::UserTurn,
        Speaker::Assistant => State::AssistantTurn,
    };

    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(SopError::Cancelled.into());
        }
        state = match state {
            State::Done(stop) => {
                info!(?stop, turns, actions, "dialogue finished");
                return Ok(SimulationOutcome {
                    trajectory,
                    stop,
                    turns,
                    actions,
                    database: instance.database(),
                });
            }
            State::UserTurn | State::AssistantTurn if turns >= options.max_turns => {
                State::Done(StopReason::MaxTurns)
            }
            State::UserTurn => {
                turns += 1;
                let reply = user
                    .step(&user_view(&trajectory))
                    .with_context(|| format!("user step {turns}"))?;
                let exits = reply.calls_exit();
                trajectory.push(Message::text(Role::User, reply.content.unwrap_or_default()));
                if exits {
                    State::Done(StopReason::ExitConversation)
                } else {
                    State::AssistantTurn
                }
            }
            State::AssistantTurn => {
                turns += 1;
                let mut reply = assistant
                    .step(&trajectory)
                    .with_context(|| format!("assistant step {turns}"))?;
                reply.role = Role::Assistant;
                let exit_after = reply.calls_exit();
                let pending: VecDeque<ToolCall> = reply
                    .tool_calls
                    .iter()
                    .filter(|call| call.name != EXIT_CONVERSATION)
                    .cloned()
                    .collect();
                trajectory.push(reply);
                if !pending.is_empty() {
                    State::ToolExecution { pending, exit_after }
                } else if exit_after {
                    State::Done(StopReason::ExitConversation)
                } else {
                    State::UserTurn
                }
            }
            State::ToolExecution {
                mut pending,
                exit_after,
            } => match pending.pop_front() {
                Some(_) if actions >= options.max_actions => State::Done(StopReason::MaxActions),
                Some(call) => {
                    actions += 1;
                    let response = match instance.call(&call.name, &call.arguments) {
                        Ok(response) => response,
                        Err(SopError::ToolCall { reason, .. }) => {
                            debug!(tool = %call.name, reason = %reason, "tool call rejected");
                            json!({ "error": reason })
                        }
                        Err(err) => return Err(err.into()),
                    };
                    trajectory.push(Message::tool_result(&call, &response));
                    State::ToolExecution { pending, exit_after }
                }
                None if exit_after => State::Done(StopReason::ExitConversation),
                None if options.tool_results_to_assistant => State::AssistantTurn,
                None => State::UserTurn,
            },
        };
    }
}

/// Agent backed by a [`ChatClient`]. Text tool-call modes render tool
/// traffic inline and parse `Action:` blocks out of the reply.
pub struct ChatAgent<'a> {
    client: &'a dyn ChatClient,
    model: String,
    system_prompt: String,
    tools: Vec<ToolSpec>,
    mode: ToolCallMode,
    timeout: Duration,
    text_calls: usize,
}

impl<'a> ChatAgent<'a> {
    pub fn new(
        client: &'a dyn ChatClient,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        tools: Vec<ToolSpec>,
        mode: ToolCallMode,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            system_prompt: system_prompt.into(),
            tools,
            mode,
            timeout,
            text_calls: 0,
        }
    }
}

impl Agent for ChatAgent<'_> {
    fn step(&mut self, history: &[Message]) -> Result<Message> {
        let mut messages = vec![Message::text(Role::System, self.system_prompt.clone())];
        if self.mode.is_text() {
            messages.extend(render_text_history(history));
        } else {
            messages.extend_from_slice(history);
        }
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            tools: if self.mode.is_text() {
                Vec::new()
            } else {
                self.tools.clone()
            },
            deadline: Instant::now() + self.timeout,
        };
        let mut reply = self.client.chat_completion(&request)?;
        if self.mode.is_text()
            && reply.tool_calls.is_empty()
            && let Some(content) = reply.content.as_deref()
        {
            self.text_calls += 1;
            let id = format!("text_call_{}", self.text_calls);
            if let Some(call) = parse_text_action(content, &id) {
                reply.tool_calls.push(call);
            }
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::domain::bank::BankDomain;
    use crate::test_support::{ScriptedAgent, ScriptedChatClient, call, exit, say};
    use serde_json::Map;

    fn plain(domain: &BankDomain) -> DomainInstance<'_> {
        DomainInstance::plain(domain, None, Map::new()).unwrap()
    }

    #[test]
    fn exit_from_user_ends_dialogue() {
        let domain = BankDomain::new().unwrap();
        let mut instance = plain(&domain);
        let mut user = ScriptedAgent::new(vec![say("hi"), exit()]);
        let mut assistant = ScriptedAgent::new(vec![say("hello")]);
        let outcome = simulate(
            &mut user,
            &mut assistant,
            &mut instance,
            &SimulationOptions::default(),
            &AtomicBool::new(false),
        )
        .unwrap();
        assert_eq!(outcome.stop, StopReason::ExitConversation);
        assert_eq!(outcome.turns, 3);
        assert_eq!(outcome.trajectory.len(), 3);
    }

    #[test]
    fn tool_results_return_to_assistant() {
        let domain = BankDomain::new().unwrap();
        let mut instance = plain(&domain);
        let mut user = ScriptedAgent::new(vec![say("log me in"), exit()]);
        let mut assistant = ScriptedAgent::new(vec![
            call(
                "c1",
                "login_user",
                json!({"username": "alice", "identification": "id-a"}),
            ),
            say("done"),
        ]);
        let outcome = simulate(
            &mut user,
            &mut assistant,
            &mut instance,
            &SimulationOptions::default(),
            &AtomicBool::new(false),
        )
        .unwrap();
        let roles: Vec<Role> = outcome.trajectory.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant, Role::User]
        );
        assert_eq!(outcome.trajectory[2].content.as_deref(), Some("true"));
        assert_eq!(outcome.database["logged_in_users"], json!(["alice"]));
    }

    #[test]
    fn action_budget_stops_dialogue() {
        let domain = BankDomain::new().unwrap();
        let mut instance = plain(&domain);
        let login = || {
            call(
                "c",
                "login_user",
                json!({"username": "alice", "identification": "id-a"}),
            )
        };
        let mut user = ScriptedAgent::new(vec![say("go")]);
        let mut assistant = ScriptedAgent::new(vec![login(), login(), login()]);
        let options = SimulationOptions {
            max_actions: 2,
            ..SimulationOptions::default()
        };
        let outcome = simulate(
            &mut user,
            &mut assistant,
            &mut instance,
            &options,
            &AtomicBool::new(false),
        )
        .unwrap();
        assert_eq!(outcome.stop, StopReason::MaxActions);
        assert_eq!(outcome.actions, 2);
    }

    #[test]
    fn turn_budget_stops_dialogue() {
        let domain = BankDomain::new().unwrap();
        let mut instance = plain(&domain);
        let mut user = ScriptedAgent::new(vec![]);
        let mut assistant = ScriptedAgent::new(vec![]);
        let options = SimulationOptions {
            max_turns: 4,
            ..SimulationOptions::default()
        };
        let outcome = simulate(
            &mut user,
            &mut assistant,
            &mut instance,
            &options,
            &AtomicBool::new(false),
        )
        .unwrap();
        assert_eq!(outcome.stop, StopReason::MaxTurns);
        assert_eq!(outcome.turns, 4);
    }

    #[test]
    fn rejected_tool_call_becomes_error_observation() {
        let domain = BankDomain::new().unwrap();
        let mut instance = plain(&domain);
        let mut user = ScriptedAgent::new(vec![say("go"), exit()]);
        let mut assistant = ScriptedAgent::new(vec![call("c1", "no_such_tool", json!({}))]);
        let outcome = simulate(
            &mut user,
            &mut assistant,
            &mut instance,
            &SimulationOptions::default(),
            &AtomicBool::new(false),
        )
        .unwrap();
        let observation = outcome.trajectory[2].content.as_deref().unwrap();
        assert!(observation.contains("error"));
    }

    #[test]
    fn cancellation_aborts() {
        let domain = BankDomain::new().unwrap();
        let mut instance = plain(&domain);
        let mut user = ScriptedAgent::new(vec![say("go")]);
        let mut assistant = ScriptedAgent::new(vec![]);
        let err = simulate(
            &mut user,
            &mut assistant,
            &mut instance,
            &SimulationOptions::default(),
            &AtomicBool::new(true),
        )
        .unwrap_err();
        assert!(matches!(
            crate::error::as_sop_error(&err),
            Some(SopError::Cancelled)
        ));
    }

    #[test]
    fn user_view_swaps_roles_and_hides_tools() {
        let trajectory = vec![
            Message::text(Role::User, "hi"),
            call("c1", "login_user", json!({})),
            Message::text(Role::Tool, "true"),
            Message::text(Role::Assistant, "logged in"),
        ];
        let view = user_view(&trajectory);
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].role, Role::Assistant);
        assert_eq!(view[1].role, Role::User);
        assert_eq!(view[1].content.as_deref(), Some("logged in"));
    }

    #[test]
    fn text_mode_agent_parses_actions() {
        let client = ScriptedChatClient::new(vec![Message::text(
            Role::Assistant,
            "Thought: log in\nAction: login_user\nAction Input: {\"username\": \"alice\"}",
        )]);
        let mut agent = ChatAgent::new(
            &client,
            "m",
            "system",
            vec![ToolSpec::exit_conversation()],
            ToolCallMode::React,
            Duration::from_secs(5),
        );
        let reply = agent.step(&[Message::text(Role::User, "hi")]).unwrap();
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "login_user");
        let sent = client.requests();
        assert!(sent[0].tools.is_empty());
        assert_eq!(sent[0].messages[0].role, Role::System);
    }
}
