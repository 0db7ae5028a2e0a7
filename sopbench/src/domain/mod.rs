//! Domain simulators behind the descriptor tables.
//!
//! A [`Domain`] pairs an immutable [`DomainDescriptor`] with a factory for
//! mutable [`DomainBackend`] states. Backends know how to perform actions and
//! check predicates; [`instance::DomainInstance`] layers the SOP enforcement
//! (plain or strict) on top of them.

pub mod bank;
pub mod instance;
pub mod registry;

use serde_json::{Map, Value};

use crate::core::descriptor::DomainDescriptor;
use crate::error::SopError;

pub use instance::{DomainInstance, InstanceMode, normalize_response, response_succeeded};
pub use registry::Registry;

/// A read-only `internal_*` lookup offered to agents on plain instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperSpec {
    pub name: String,
    pub parameters: Vec<String>,
    pub description: String,
}

/// Mutable world state of one domain.
pub trait DomainBackend: Send {
    /// Snapshot of the current state, comparable across backends.
    fn database(&self) -> Value;

    /// Truth of predicate `name` under bound `args`.
    fn check_predicate(
        &self,
        name: &str,
        args: &Map<String, Value>,
        constraint_parameters: &Map<String, Value>,
    ) -> Result<bool, SopError>;

    /// Perform `action` unconditionally. Precondition checks are the
    /// instance's job.
    fn perform(&mut self, action: &str, args: &Map<String, Value>) -> Result<Value, SopError>;

    /// Read-only `internal_*` helper, `None` when no helper has that name.
    fn helper(&self, name: &str, args: &Map<String, Value>) -> Option<Result<Value, SopError>>;

    fn helpers(&self) -> Vec<HelperSpec>;

    fn clone_box(&self) -> Box<dyn DomainBackend>;
}

/// A registered domain.
pub trait Domain: Send + Sync {
    fn descriptor(&self) -> &DomainDescriptor;

    /// Fresh backend seeded from `initial_database`, or the domain's sample
    /// state when absent.
    fn backend(&self, initial_database: Option<&Value>) -> Result<Box<dyn DomainBackend>, SopError>;

    fn default_database(&self) -> Value;
}
