//! Plain and strict views of a domain.
//!
//! Both views run the same backend. A plain instance only refuses calls
//! whose innate deps fail, which is what the real system would do. A strict
//! instance additionally refuses any action whose full SOP does not hold,
//! which makes it the ground truth the evaluator replays against.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::debug;

use super::{Domain, DomainBackend, HelperSpec};
use crate::core::constraint::{Constraint, Single, literal_to_json, literal_value};
use crate::core::descriptor::DomainDescriptor;
use crate::core::expand::{ExpansionOptions, insert_constraint_deps};
use crate::core::prune::prune;
use crate::core::truth::evaluate;
use crate::error::SopError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceMode {
    Plain,
    Strict {
        innate: bool,
        full_deps: BTreeMap<String, Constraint>,
    },
}

pub struct DomainInstance<'a> {
    descriptor: &'a DomainDescriptor,
    backend: Box<dyn DomainBackend>,
    mode: InstanceMode,
    constraint_parameters: Map<String, Value>,
}

impl Clone for DomainInstance<'_> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor,
            backend: self.backend.clone_box(),
            mode: self.mode.clone(),
            constraint_parameters: self.constraint_parameters.clone(),
        }
    }
}

impl<'a> DomainInstance<'a> {
    pub fn plain(
        domain: &'a dyn Domain,
        initial_database: Option<&Value>,
        constraint_parameters: Map<String, Value>,
    ) -> Result<Self, SopError> {
        Ok(Self {
            descriptor: domain.descriptor(),
            backend: domain.backend(initial_database)?,
            mode: InstanceMode::Plain,
            constraint_parameters,
        })
    }

    pub fn strict(
        domain: &'a dyn Domain,
        initial_database: Option<&Value>,
        innate: bool,
        full_deps: BTreeMap<String, Constraint>,
        constraint_parameters: Map<String, Value>,
    ) -> Result<Self, SopError> {
        Ok(Self {
            descriptor: domain.descriptor(),
            backend: domain.backend(initial_database)?,
            mode: InstanceMode::Strict { innate, full_deps },
            constraint_parameters,
        })
    }

    pub fn descriptor(&self) -> &'a DomainDescriptor {
        self.descriptor
    }

    pub fn is_strict(&self) -> bool {
        matches!(self.mode, InstanceMode::Strict { .. })
    }

    pub fn database(&self) -> Value {
        self.backend.database()
    }

    pub fn constraint_parameters(&self) -> &Map<String, Value> {
        &self.constraint_parameters
    }

    /// Helpers are only reachable on plain instances.
    pub fn has_tool(&self, name: &str) -> bool {
        self.descriptor.is_action(name)
            || (!self.is_strict() && self.backend.helpers().iter().any(|h| h.name == name))
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names = self.descriptor.list_actions();
        names.extend(self.helpers().into_iter().map(|h| h.name));
        names
    }

    /// Helpers reachable through [`DomainInstance::call`]; none when strict.
    pub fn helpers(&self) -> Vec<HelperSpec> {
        if self.is_strict() {
            Vec::new()
        } else {
            self.backend.helpers()
        }
    }

    /// Call a tool the way an agent would.
    ///
    /// A refused call returns `false`. Unknown tools and malformed
    /// arguments are [`SopError::ToolCall`].
    pub fn call(&mut self, tool: &str, args: &Map<String, Value>) -> Result<Value, SopError> {
        if !self.descriptor.is_action(tool) {
            if !self.is_strict()
                && let Some(result) = self.backend.helper(tool, args)
            {
                return result;
            }
            return Err(SopError::tool_call(tool, "no such tool"));
        }

        let params = self.descriptor.parameters(tool);
        if let Some(missing) = params.iter().find(|p| !args.contains_key(*p)) {
            return Err(SopError::tool_call(tool, format!("missing argument {missing}")));
        }
        if let Some(extra) = args.keys().find(|k| !params.contains(k)) {
            return Err(SopError::tool_call(tool, format!("unexpected argument {extra}")));
        }

        let enforce_innate = match &self.mode {
            InstanceMode::Plain => true,
            InstanceMode::Strict { innate, .. } => *innate,
        };
        if enforce_innate
            && let Some(innate) = self.descriptor.innate_deps(tool)
            && !self.check(&innate, args)?
        {
            debug!(tool, "innate deps fail, refusing call");
            return Ok(Value::Bool(false));
        }
        if let InstanceMode::Strict { full_deps, .. } = &self.mode
            && let Some(sop) = full_deps.get(tool)
            && !self.check(sop, args)?
        {
            debug!(tool, "SOP does not hold, refusing call");
            return Ok(Value::Bool(false));
        }

        self.backend.perform(tool, args)
    }

    /// Evaluate `tree` against the current state with symbols taken from
    /// `bindings`, then from the constraint parameters.
    ///
    /// Action leaves hold when calling the action on a plain copy of the
    /// current state would succeed.
    pub fn check(&self, tree: &Constraint, bindings: &Map<String, Value>) -> Result<bool, SopError> {
        evaluate(tree, &mut |single: &Single| self.leaf_holds(single, bindings))
    }

    pub fn leaf_holds(&self, single: &Single, bindings: &Map<String, Value>) -> Result<bool, SopError> {
        let args = bind_args(single, bindings, &self.constraint_parameters);
        if self.descriptor.is_action(&single.name) {
            let mut probe = DomainInstance {
                descriptor: self.descriptor,
                backend: self.backend.clone_box(),
                mode: InstanceMode::Plain,
                constraint_parameters: self.constraint_parameters.clone(),
            };
            let args = args
                .into_iter()
                .filter(|(_, value)| !value.is_null())
                .collect();
            return Ok(match probe.call(&single.name, &args) {
                Ok(response) => response_succeeded(&response),
                Err(SopError::ToolCall { .. }) => false,
                Err(err) => return Err(err),
            });
        }
        self.backend
            .check_predicate(&single.name, &args, &self.constraint_parameters)
    }
}

/// Concrete arguments of a leaf: literals decode to JSON, symbols resolve
/// through `bindings` then `constraint_parameters`, anything else is null.
pub fn bind_args(
    single: &Single,
    bindings: &Map<String, Value>,
    constraint_parameters: &Map<String, Value>,
) -> Map<String, Value> {
    single
        .args
        .iter()
        .map(|(param, symbol)| {
            let value = match literal_value(symbol) {
                Some(payload) => literal_to_json(payload),
                None => bindings
                    .get(symbol)
                    .or_else(|| constraint_parameters.get(symbol))
                    .cloned()
                    .unwrap_or(Value::Null),
            };
            (param.clone(), value)
        })
        .collect()
}

/// Whether a tool response reports success.
pub fn response_succeeded(response: &Value) -> bool {
    match response {
        Value::Bool(ok) => *ok,
        Value::Null => false,
        Value::Array(items) => match items.first() {
            Some(Value::Bool(ok)) => *ok,
            _ => true,
        },
        Value::Object(map) => !map.contains_key("error"),
        _ => true,
    }
}

/// `[true, payload]` and `payload` are the same response.
pub fn normalize_response(response: &Value) -> Value {
    match response {
        Value::Array(items) if items.len() == 2 && items[0] == Value::Bool(true) => items[1].clone(),
        other => other.clone(),
    }
}

/// SOP a strict instance enforces for every action: the goal gets
/// `goal_dependency`, every other action its default deps with constraint
/// deps inserted.
pub fn full_dependencies(
    descriptor: &DomainDescriptor,
    options: ExpansionOptions,
    goal: &str,
    goal_dependency: Option<&Constraint>,
) -> Result<BTreeMap<String, Constraint>, SopError> {
    let mut deps = BTreeMap::new();
    for action in descriptor.list_actions() {
        let tree = if action == goal {
            goal_dependency.cloned()
        } else {
            match descriptor.default_deps(&action, options.default_option) {
                Some(tree) if options.add_constraint_deps => {
                    prune(&insert_constraint_deps(&tree, descriptor)?)
                }
                Some(tree) => prune(&tree),
                None => None,
            }
        };
        if let Some(tree) = tree {
            deps.insert(action, tree);
        }
    }
    Ok(deps)
}
