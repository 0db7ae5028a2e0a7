//! Harness configuration merging.
//!
//! Applies command-line overrides on top of the harness config file.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use sopbench::core::descriptor::DefaultOption;
use sopbench::io::chat::{ToolCallMode, ToolList};
use sopbench::io::config::HarnessConfig;

/// Flags that replace the matching config value when given.
#[derive(Debug, Clone, Default, Args)]
pub struct RunOverrides {
    /// Assistant model command and its arguments.
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    pub assistant_command: Vec<String>,
    #[arg(long)]
    pub assistant_model: Option<String>,
    /// Simulated user model command and its arguments.
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    pub user_command: Vec<String>,
    #[arg(long)]
    pub user_model: Option<String>,
    #[arg(long, value_enum)]
    pub tool_call_mode: Option<ToolCallMode>,
    #[arg(long, value_enum)]
    pub default_option: Option<DefaultOption>,
    #[arg(long, value_enum)]
    pub tool_list: Option<ToolList>,
    #[arg(long)]
    pub max_turns: Option<usize>,
    #[arg(long)]
    pub max_actions: Option<usize>,
    #[arg(long)]
    pub runs_per_task: Option<usize>,
    #[arg(long)]
    pub workers: Option<usize>,
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

/// Apply command-line overrides to the base harness config.
pub fn apply_overrides(mut base: HarnessConfig, overrides: &RunOverrides) -> Result<HarnessConfig> {
    if !overrides.assistant_command.is_empty() {
        base.assistant.command = overrides.assistant_command.clone();
    }
    if let Some(model) = &overrides.assistant_model {
        base.assistant.model = model.clone();
    }
    if !overrides.user_command.is_empty() {
        base.user.command = overrides.user_command.clone();
    }
    if let Some(model) = &overrides.user_model {
        base.user.model = model.clone();
    }
    if let Some(mode) = overrides.tool_call_mode {
        base.eval.tool_call_mode = mode;
    }
    if let Some(option) = overrides.default_option {
        base.compile.default_option = option;
    }
    if let Some(list) = overrides.tool_list {
        base.eval.tool_list = list;
    }
    if let Some(max_turns) = overrides.max_turns {
        base.simulation.max_turns = max_turns;
    }
    if let Some(max_actions) = overrides.max_actions {
        base.simulation.max_actions = max_actions;
    }
    if let Some(runs) = overrides.runs_per_task {
        base.eval.runs_per_task = runs;
    }
    if let Some(workers) = overrides.workers {
        base.eval.workers = workers;
    }
    if let Some(dir) = &overrides.cache_dir {
        base.cache_dir = Some(dir.clone());
    }
    base.validate()?;
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_config_when_no_override() {
        let base = HarnessConfig::default();
        let merged = apply_overrides(base.clone(), &RunOverrides::default()).expect("merge");
        assert_eq!(merged, base);
    }

    #[test]
    fn applies_overrides() {
        let overrides = RunOverrides {
            assistant_command: vec!["python3".to_string(), "chat.py".to_string()],
            tool_call_mode: Some(ToolCallMode::React),
            default_option: Some(DefaultOption::Full),
            workers: Some(4),
            ..RunOverrides::default()
        };
        let merged = apply_overrides(HarnessConfig::default(), &overrides).expect("merge");
        assert_eq!(merged.assistant.command, vec!["python3", "chat.py"]);
        assert_eq!(merged.eval.tool_call_mode, ToolCallMode::React);
        assert_eq!(merged.compile.default_option, DefaultOption::Full);
        assert_eq!(merged.eval.workers, 4);
        assert_eq!(merged.user.command, HarnessConfig::default().user.command);
    }

    #[test]
    fn rejects_invalid_override() {
        let overrides = RunOverrides {
            workers: Some(0),
            ..RunOverrides::default()
        };
        assert!(apply_overrides(HarnessConfig::default(), &overrides).is_err());
    }
}
