//! Evaluation output file and run metadata.
//!
//! The output file is a JSON array with one entry per task: the task, every
//! simulated interaction, one evaluation per completed interaction and the
//! task's statistics. `meta.json` next to it records where the run came from.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sopbench::compile::TaskRecord;
use sopbench::core::descriptor::DefaultOption;
use sopbench::core::stats::Statistics;
use sopbench::core::types::{Evaluation, Message};
use sopbench::io::chat::{ToolCallMode, ToolList};
use sopbench::io::config::HarnessConfig;
use sopbench::io::task_file::write_json;
use sopbench::simulate::StopReason;
use tracing::{debug, instrument};

/// Settings a task was run under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setup {
    pub assistant_model: String,
    pub user_model: String,
    pub tool_call_mode: ToolCallMode,
    pub tool_list: ToolList,
    pub default_option: DefaultOption,
    pub add_constraint_deps: bool,
    pub max_turns: usize,
    pub max_actions: usize,
    pub runs_per_task: usize,
}

impl Setup {
    pub fn from_config(cfg: &HarnessConfig) -> Self {
        Self {
            assistant_model: cfg.assistant.model.clone(),
            user_model: cfg.user.model.clone(),
            tool_call_mode: cfg.eval.tool_call_mode,
            tool_list: cfg.eval.tool_list,
            default_option: cfg.compile.default_option,
            add_constraint_deps: cfg.compile.add_constraint_deps,
            max_turns: cfg.simulation.max_turns,
            max_actions: cfg.simulation.max_actions,
            runs_per_task: cfg.eval.runs_per_task,
        }
    }
}

/// One simulated dialogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    /// Assistant system prompt.
    pub prompt: String,
    pub interaction: Vec<Message>,
    /// Plain database after the dialogue.
    pub database: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopReason>,
    /// Why the dialogue could not be completed; such interactions are
    /// not evaluated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub domain: String,
    /// `{goal}-{index}` within the task file.
    pub task_id: String,
    pub setup: Setup,
    pub task: TaskRecord,
    pub interactions: Vec<Interaction>,
    pub evaluations: Vec<Evaluation>,
    pub statistics: Statistics,
}

/// Metadata for an eval run, persisted to `meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub domain: String,
    pub tasks_path: String,
    /// SHA-256 of the task file for reproducibility tracking.
    pub tasks_hash: String,
    /// SHA-256 of the effective config serialized as TOML.
    pub config_hash: String,
    pub start_time: String,
    pub end_time: String,
    pub duration_secs: f64,
    pub trials: usize,
    pub failed_trials: usize,
}

pub fn run_id(now: DateTime<Utc>) -> String {
    format!("eval-{}", now.format("%Y%m%d_%H%M%S"))
}

pub fn results_dir(base_dir: &Path, domain: &str, run_id: &str) -> PathBuf {
    base_dir.join(domain).join(run_id)
}

pub fn config_hash(cfg: &HarnessConfig) -> Result<String> {
    let serialized = toml::to_string(cfg).context("serialize config toml")?;
    Ok(hex::encode(Sha256::digest(serialized.as_bytes())))
}

#[instrument(skip_all, fields(path = %path.display(), tasks = results.len()))]
pub fn write_output(path: &Path, results: &[TaskResult]) -> Result<()> {
    write_json(path, &results)?;
    debug!("output written");
    Ok(())
}

pub fn load_output(path: &Path) -> Result<Vec<TaskResult>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

pub fn write_meta(path: &Path, meta: &RunMeta) -> Result<()> {
    write_json(path, meta)
}
