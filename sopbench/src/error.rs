//! Typed failures raised by the harness core.
//!
//! Orchestration code carries these inside `anyhow::Error` and downcasts to
//! decide whether a failure aborts the current task or is retried in place.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SopError {
    /// A tree contains an operator other than single/and/or/chain/gate.
    #[error("invalid constraint option '{0}'")]
    InvalidConstraintOption(String),

    #[error("malformed constraint: {0}")]
    MalformedConstraint(String),

    /// Link, innate or constraint-dep expansion would not terminate.
    #[error("cycle detected while expanding {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    /// The dependency evaluator and the strict domain disagree.
    #[error(
        "verifier discrepancy for {goal}: dependency evaluator says {evaluator}, strict domain says {strict}"
    )]
    VerifierDiscrepancy {
        goal: String,
        evaluator: bool,
        strict: bool,
    },

    #[error("generated task is malformed: {0}")]
    GenerationFormat(String),

    #[error("generated task violates {} constraint(s): {}", unsatisfied.len(), unsatisfied.join(", "))]
    GenerationSemantic { unsatisfied: Vec<String> },

    #[error("tool call {tool} failed: {reason}")]
    ToolCall { tool: String, reason: String },

    #[error("unknown predicate '{0}'")]
    UnknownPredicate(String),

    #[error("unknown domain '{0}'")]
    UnknownDomain(String),

    #[error("invalid domain descriptor {domain}: {reason}")]
    InvalidDescriptor { domain: String, reason: String },

    #[error("simulation cancelled")]
    Cancelled,
}

impl SopError {
    /// Fatal kinds abort the current task; everything else is handled where it occurs.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SopError::InvalidConstraintOption(_)
                | SopError::MalformedConstraint(_)
                | SopError::CycleDetected { .. }
                | SopError::VerifierDiscrepancy { .. }
                | SopError::UnknownPredicate(_)
                | SopError::InvalidDescriptor { .. }
        )
    }

    pub fn tool_call(tool: &str, reason: impl Into<String>) -> Self {
        SopError::ToolCall {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }
}

/// Return the typed error inside an `anyhow` chain, if any.
pub fn as_sop_error(err: &anyhow::Error) -> Option<&SopError> {
    err.chain().find_map(|cause| cause.downcast_ref::<SopError>())
}
