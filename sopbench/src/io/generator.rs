//! Text generator used by the task compiler to fill in concrete task data.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::instrument;

use super::process::run_command_with_timeout;

/// Produces raw text (expected to hold a JSON task object) for a prompt.
pub trait TaskGenerator {
    fn generate(&self, prompt: &str) -> Result<String>;
}

/// Pipes the prompt to a command and returns its stdout.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub env: Vec<(String, String)>,
}

impl TaskGenerator for CommandGenerator {
    #[instrument(skip_all, fields(prompt_bytes = prompt.len()))]
    fn generate(&self, prompt: &str) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("generator command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        for (name, value) in &self.env {
            cmd.env(name, value);
        }
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run generator {program}"))?;
        if output.timed_out {
            bail!("generator {program} timed out");
        }
        if !output.status.success() {
            bail!(
                "generator {program} exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&output.stdout_truncated_notice("generator"));
        Ok(text)
    }
}
