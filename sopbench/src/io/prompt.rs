//! Prompt rendering for the task generator and the simulated agents.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::{Map, Value};

use super::chat::{ToolCallMode, ToolSpec};
use crate::core::descriptor::DomainDescriptor;

const GENERATOR_TEMPLATE: &str = include_str!("prompts/generator.md");
const USER_INSTRUCTION_TEMPLATE: &str = include_str!("prompts/user_instruction.md");
const USER_SYSTEM_TEMPLATE: &str = include_str!("prompts/user_system.md");
const ASSISTANT_SYSTEM_TEMPLATE: &str = include_str!("prompts/assistant_system.md");

/// One constraint the generated world must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConstraintItem {
    pub key: String,
    pub text: String,
    /// Earlier attempts that missed this constraint.
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize)]
struct DomainContext<'a> {
    name: &'a str,
    description: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct GoalContext {
    name: String,
    description: String,
    parameters: Vec<String>,
}

/// Inputs of one generation attempt.
#[derive(Debug, Clone)]
pub struct GenerationPrompt<'a> {
    pub descriptor: &'a DomainDescriptor,
    pub goal: &'a str,
    pub constraints: Vec<ConstraintItem>,
    pub unconstrained: Vec<String>,
    pub user_params: &'a [String],
    pub example_database: &'a Value,
    pub feedback: Option<&'a str>,
}

pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("generator", GENERATOR_TEMPLATE)
            .expect("generator template should be valid");
        env.add_template("user_instruction", USER_INSTRUCTION_TEMPLATE)
            .expect("user instruction template should be valid");
        env.add_template("user_system", USER_SYSTEM_TEMPLATE)
            .expect("user system template should be valid");
        env.add_template("assistant_system", ASSISTANT_SYSTEM_TEMPLATE)
            .expect("assistant system template should be valid");
        Self { env }
    }

    pub fn render_generation(&self, prompt: &GenerationPrompt<'_>) -> Result<String> {
        let descriptor = prompt.descriptor;
        let example = serde_json::to_string_pretty(prompt.example_database)?;
        let template = self.env.get_template("generator")?;
        let rendered = template.render(context! {
            domain => domain_context(descriptor),
            goal => goal_context(descriptor, prompt.goal),
            constraints => &prompt.constraints,
            unconstrained => &prompt.unconstrained,
            user_params => prompt.user_params,
            example_database => example,
            feedback => prompt.feedback.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    /// What the simulated user wants and knows.
    pub fn render_user_instruction(
        &self,
        descriptor: &DomainDescriptor,
        goal: &str,
        user_known: &Map<String, Value>,
    ) -> Result<String> {
        let known: Vec<(String, String)> = user_known
            .iter()
            .map(|(key, value)| {
                let shown = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                (key.clone(), shown)
            })
            .collect();
        let template = self.env.get_template("user_instruction")?;
        let rendered = template.render(context! {
            domain => &descriptor.name,
            goal_description => descriptor.description(goal).unwrap_or_else(|| goal.to_string()),
            user_known => known.into_iter().collect::<std::collections::BTreeMap<_, _>>(),
        })?;
        Ok(rendered.trim().to_string())
    }

    pub fn render_user_system(&self, instruction: &str) -> Result<String> {
        let template = self.env.get_template("user_system")?;
        Ok(template.render(context! { instruction => instruction.trim() })?)
    }

    /// Assistant system prompt. Text tool-call modes list the tools and the
    /// reply format inline.
    pub fn render_assistant_system(
        &self,
        descriptor: &DomainDescriptor,
        mode: ToolCallMode,
        tools: &[ToolSpec],
    ) -> Result<String> {
        let template = self.env.get_template("assistant_system")?;
        let rendered = template.render(context! {
            domain => domain_context(descriptor),
            text_tools => mode.is_text(),
            mode => mode.as_str(),
            tools => tools,
        })?;
        Ok(rendered.trim().to_string())
    }
}

fn domain_context(descriptor: &DomainDescriptor) -> DomainContext<'_> {
    DomainContext {
        name: &descriptor.name,
        description: &descriptor.description,
    }
}

fn goal_context(descriptor: &DomainDescriptor, goal: &str) -> GoalContext {
    GoalContext {
        name: goal.to_string(),
        description: descriptor.description(goal).unwrap_or_default(),
        parameters: descriptor.parameters(goal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::domain::bank::BankDomain;
    use serde_json::json;

    #[test]
    fn generation_prompt_flags_weighted_constraints() {
        let domain = BankDomain::new().unwrap();
        let engine = PromptEngine::new();
        let params = vec!["username".to_string(), "identification".to_string()];
        let example = domain.default_database();
        let prompt = GenerationPrompt {
            descriptor: domain.descriptor(),
            goal: "logout_user",
            constraints: vec![
                ConstraintItem {
                    key: "internal_check_username_exist(username=username)".to_string(),
                    text: "the user username has an account".to_string(),
                    weight: 0,
                },
                ConstraintItem {
                    key: "login_user(identification=identification,username=username)".to_string(),
                    text: "calling login_user fails".to_string(),
                    weight: 2,
                },
            ],
            unconstrained: Vec::new(),
            user_params: &params,
            example_database: &example,
            feedback: Some("missing key user_known"),
        };
        let rendered = engine.render_generation(&prompt).unwrap();
        assert!(rendered.contains("`logout_user`"));
        assert!(rendered.contains("missed in 2 earlier attempt(s)"));
        assert!(!rendered.contains("missed in 0"));
        assert!(rendered.contains("<previous_attempt>"));
        assert!(rendered.contains("`identification`"));
    }

    #[test]
    fn user_instruction_lists_known_values() {
        let domain = BankDomain::new().unwrap();
        let engine = PromptEngine::new();
        let known = json!({"username": "alice", "amount": 100});
        let Value::Object(known) = known else { unreachable!() };
        let text = engine
            .render_user_instruction(domain.descriptor(), "transfer_funds", &known)
            .unwrap();
        assert!(text.contains("- username: alice"));
        assert!(text.contains("- amount: 100"));
        let system = engine.render_user_system(&text).unwrap();
        assert!(system.contains("exit_conversation"));
    }

    #[test]
    fn assistant_prompt_lists_tools_only_in_text_modes() {
        let domain = BankDomain::new().unwrap();
        let engine = PromptEngine::new();
        let tools = vec![ToolSpec::exit_conversation()];
        let fc = engine
            .render_assistant_system(domain.descriptor(), ToolCallMode::Fc, &tools)
            .unwrap();
        assert!(!fc.contains("Action Input"));
        let react = engine
            .render_assistant_system(domain.descriptor(), ToolCallMode::ReactV, &tools)
            .unwrap();
        assert!(react.contains("Action Input"));
        assert!(react.contains("Thought"));
        assert!(react.contains("verifies"));
    }
}
