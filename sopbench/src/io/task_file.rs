//! Task and intermediate files: load with schema validation, write atomically.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::config::write_atomic;
use crate::compile::{IntermediateRecord, TaskRecord};

const TASK_FILE_SCHEMA: &str = include_str!("../../schemas/task_file.schema.json");

static TASK_FILE_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(TASK_FILE_SCHEMA).map_err(|err| err.to_string())?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| err.to_string())
});

/// Tasks of one domain keyed by goal action.
pub type TaskFile = BTreeMap<String, Vec<TaskRecord>>;
pub type IntermediateFile = BTreeMap<String, Vec<IntermediateRecord>>;

/// Validate a task file document against the embedded schema.
pub fn validate_task_value(value: &Value) -> Result<()> {
    let validator = TASK_FILE_VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("compile task file schema: {err}"))?;
    let messages: Vec<String> = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Parse a task file, filling each task's goal from its key.
pub fn parse_task_file(raw: &str) -> Result<TaskFile> {
    let value: Value = serde_json::from_str(raw).context("parse task file json")?;
    validate_task_value(&value)?;
    let mut file: TaskFile = serde_json::from_value(value).context("deserialize task file")?;
    for (goal, tasks) in &mut file {
        for task in tasks {
            if task.goal.is_empty() {
                task.goal = goal.clone();
            } else if task.goal != *goal {
                bail!("task for {} stored under {goal}", task.goal);
            }
        }
    }
    Ok(file)
}

pub fn load_task_file(path: &Path) -> Result<TaskFile> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_task_file(&raw).with_context(|| format!("load task file {}", path.display()))
}

pub fn load_intermediate_file(path: &Path) -> Result<IntermediateFile> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

pub fn write_task_file(path: &Path, tasks: &TaskFile) -> Result<()> {
    let value = serde_json::to_value(tasks).context("serialize task file")?;
    validate_task_value(&value)?;
    write_json(path, &value)
}

pub fn write_intermediate_file(path: &Path, records: &IntermediateFile) -> Result<()> {
    write_json(path, records)
}

/// Serialize `value` to pretty-printed JSON with trailing newline.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    write_atomic(path, payload.as_bytes())
}

/// Hex sha256 of a file's bytes, recorded in run metadata.
pub fn file_digest(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
