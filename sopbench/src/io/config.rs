//! Harness configuration stored as TOML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::chat::{CommandChatClient, ToolCallMode, ToolList};
use super::generator::CommandGenerator;
use crate::compile::CompileOptions;
use crate::simulate::SimulationOptions;

/// Environment variable the provider key is forwarded under.
pub const PROVIDER_KEY_VAR: &str = "SOPBENCH_API_KEY";

/// Harness configuration (TOML).
///
/// Missing fields default to values that run the bundled domains with a
/// single worker and no response cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory for chat reply caching, keyed by request hash.
    pub cache_dir: Option<PathBuf>,

    /// Name of the variable holding the provider key. Its value is passed
    /// to every model command as `SOPBENCH_API_KEY`.
    pub provider_key_env: Option<String>,

    pub compile: CompileOptions,
    pub simulation: SimulationOptions,
    pub eval: EvalConfig,
    pub assistant: CommandConfig,
    pub user: CommandConfig,
    pub generator: CommandConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EvalConfig {
    pub runs_per_task: usize,
    pub workers: usize,
    /// Constraint-count bucket that absorbs every larger count.
    pub max_constraints: usize,
    pub tool_call_mode: ToolCallMode,
    pub tool_list: ToolList,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            runs_per_task: 1,
            workers: 1,
            max_constraints: 5,
            tool_call_mode: ToolCallMode::Fc,
            tool_list: ToolList::Full,
        }
    }
}

/// An external command speaking JSON over stdin/stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandConfig {
    pub command: Vec<String>,
    /// Forwarded in the request body; ignored by the generator.
    pub model: String,
    pub timeout_secs: u64,
    /// Truncate command stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            model: "default".to_string(),
            timeout_secs: 120,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl CommandConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(anyhow!("{section}.timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("{section}.output_limit_bytes must be > 0"));
        }
        if self.command.first().is_some_and(|program| program.trim().is_empty()) {
            return Err(anyhow!("{section}.command must start with a program"));
        }
        Ok(())
    }

    /// Fails when the command was never configured.
    pub fn require(&self, section: &str) -> Result<&Self> {
        if self.command.is_empty() {
            return Err(anyhow!("{section}.command is not configured"));
        }
        Ok(self)
    }

    pub fn chat_client(&self, cache_dir: Option<PathBuf>, env: Vec<(String, String)>) -> CommandChatClient {
        CommandChatClient {
            command: self.command.clone(),
            timeout: self.timeout(),
            output_limit_bytes: self.output_limit_bytes,
            cache_dir,
            env,
        }
    }

    pub fn task_generator(&self, env: Vec<(String, String)>) -> CommandGenerator {
        CommandGenerator {
            command: self.command.clone(),
            timeout: self.timeout(),
            output_limit_bytes: self.output_limit_bytes,
            env,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            provider_key_env: None,
            compile: CompileOptions::default(),
            simulation: SimulationOptions::default(),
            eval: EvalConfig::default(),
            assistant: CommandConfig::default(),
            user: CommandConfig::default(),
            generator: CommandConfig::default(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.simulation.max_turns == 0 {
            return Err(anyhow!("simulation.max_turns must be > 0"));
        }
        if self.eval.runs_per_task == 0 {
            return Err(anyhow!("eval.runs_per_task must be > 0"));
        }
        if self.eval.workers == 0 {
            return Err(anyhow!("eval.workers must be > 0"));
        }
        if self.eval.max_constraints == 0 {
            return Err(anyhow!("eval.max_constraints must be > 0"));
        }
        if self.compile.permutation_k == 0 {
            return Err(anyhow!("compile.permutation_k must be > 0"));
        }
        if self.compile.generation_limit == 0 {
            return Err(anyhow!("compile.generation_limit must be > 0"));
        }
        if self
            .provider_key_env
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            return Err(anyhow!("provider_key_env must not be empty"));
        }
        self.assistant.validate("assistant")?;
        self.user.validate("user")?;
        self.generator.validate("generator")?;
        Ok(())
    }

    /// Environment handed to model and generator commands.
    pub fn command_env(&self) -> Result<Vec<(String, String)>> {
        let Some(name) = &self.provider_key_env else {
            return Ok(Vec::new());
        };
        let key = std::env::var(name).with_context(|| format!("read provider key from ${name}"))?;
        Ok(vec![(PROVIDER_KEY_VAR.to_string(), key)])
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()`.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        let cfg = HarnessConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &HarnessConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

/// Write `contents` next to `path` and rename it into place.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path has no file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
