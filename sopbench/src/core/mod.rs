//! Deterministic, pure logic: the constraint algebra, SOP expansion,
//! permutation tables, action graphs and statistics.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! values and return fresh owned results suitable for tests.

pub mod constraint;
pub mod dag;
pub mod descriptor;
pub mod expand;
pub mod permutation;
pub mod prune;
pub mod stats;
pub mod truth;
pub mod types;
