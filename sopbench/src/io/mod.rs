//! Side-effecting helpers: model and generator commands, prompts, config
//! and task files.

pub mod chat;
pub mod config;
pub mod generator;
pub mod process;
pub mod prompt;
pub mod task_file;
