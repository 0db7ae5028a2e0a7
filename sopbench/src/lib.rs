//! Benchmark harness for agents that must follow standard operating
//! procedures (SOPs) while calling domain tools.
//!
//! The crate is split along the same line throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (constraint trees, expansion,
//!   permutations, action graphs, statistics). No I/O.
//! - **[`domain`]**: Domain descriptors and simulators, in plain and strict
//!   views.
//! - **[`io`]**: Side-effecting operations (model and generator commands,
//!   prompt rendering, config and task files).
//!
//! Orchestration modules ([`compile`], [`simulate`], [`evaluate`]) combine
//! them into the task compiler, the dialogue loop and the trajectory
//! evaluator.

pub mod compile;
pub mod core;
pub mod domain;
pub mod error;
pub mod evaluate;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod simulate;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
