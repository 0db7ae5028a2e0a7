//! Immutable per-domain descriptor: actions and the constraint tables over them.
//!
//! Accessors hand out owned trees so callers can transform them freely
//! without touching the shared descriptor.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::constraint::{Args, Constraint, Relation, Single};
use crate::error::SopError;

/// Which action deps make up the default SOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DefaultOption {
    #[default]
    Required,
    /// `and(required, customizable)`.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub parameters: Vec<String>,
    #[serde(default)]
    pub param_types: BTreeMap<String, String>,
    pub description: String,
    #[serde(default)]
    pub return_description: String,
}

/// A predicate that is satisfied by successfully calling an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub action: String,
    /// Action parameter -> predicate parameter. Unmapped action parameters
    /// receive fresh symbols during expansion.
    #[serde(default)]
    pub param_mapping: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    actions: BTreeMap<String, ActionSpec>,
    #[serde(default)]
    innate_deps: BTreeMap<String, Constraint>,
    #[serde(default)]
    required_deps: BTreeMap<String, Constraint>,
    #[serde(default)]
    customizable_deps: BTreeMap<String, Constraint>,
    #[serde(default)]
    constraint_links: BTreeMap<String, Link>,
    #[serde(default)]
    constraint_deps: BTreeMap<String, Constraint>,
    #[serde(default)]
    constraint_processes: BTreeMap<String, Constraint>,
    #[serde(default)]
    positive_descriptions: BTreeMap<String, String>,
    #[serde(default)]
    negative_descriptions: BTreeMap<String, String>,
}

impl DomainDescriptor {
    /// Parse and validate a descriptor.
    pub fn from_json(raw: &str) -> Result<Self, SopError> {
        let descriptor: DomainDescriptor =
            serde_json::from_str(raw).map_err(|err| SopError::InvalidDescriptor {
                domain: "<unparsed>".to_string(),
                reason: err.to_string(),
            })?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn list_actions(&self) -> Vec<String> {
        self.actions.keys().cloned().collect()
    }

    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.get(name)
    }

    pub fn is_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn parameters(&self, action: &str) -> Vec<String> {
        self.actions
            .get(action)
            .map(|spec| spec.parameters.clone())
            .unwrap_or_default()
    }

    pub fn param_types(&self, action: &str) -> BTreeMap<String, String> {
        self.actions
            .get(action)
            .map(|spec| spec.param_types.clone())
            .unwrap_or_default()
    }

    pub fn description(&self, action: &str) -> Option<String> {
        self.actions.get(action).map(|spec| spec.description.clone())
    }

    pub fn return_description(&self, action: &str) -> Option<String> {
        self.actions
            .get(action)
            .map(|spec| spec.return_description.clone())
    }

    pub fn innate_deps(&self, action: &str) -> Option<Constraint> {
        self.innate_deps.get(action).cloned()
    }

    pub fn required_deps(&self, action: &str) -> Option<Constraint> {
        self.required_deps.get(action).cloned()
    }

    pub fn customizable_deps(&self, action: &str) -> Option<Constraint> {
        self.customizable_deps.get(action).cloned()
    }

    /// Default SOP of `action` under `option`.
    pub fn default_deps(&self, action: &str, option: DefaultOption) -> Option<Constraint> {
        let required = self.required_deps(action);
        let customizable = match option {
            DefaultOption::Required => None,
            DefaultOption::Full => self.customizable_deps(action),
        };
        match (required, customizable) {
            (Some(required), Some(customizable)) => {
                Some(Constraint::and(vec![required, customizable]))
            }
            (required, customizable) => required.or(customizable),
        }
    }

    pub fn link(&self, predicate: &str) -> Option<&Link> {
        self.constraint_links.get(predicate)
    }

    pub fn constraint_dep(&self, predicate: &str) -> Option<Constraint> {
        self.constraint_deps.get(predicate).cloned()
    }

    pub fn process(&self, predicate: &str) -> Option<Constraint> {
        self.constraint_processes.get(predicate).cloned()
    }

    /// Predicates that have descriptions, i.e. every predicate a SOP can name.
    pub fn predicates(&self) -> Vec<String> {
        self.positive_descriptions.keys().cloned().collect()
    }

    pub fn positive_constraint_description(&self, single: &Single) -> String {
        describe(self.positive_descriptions.get(&single.name), single)
    }

    pub fn negative_constraint_description(&self, single: &Single) -> String {
        describe(self.negative_descriptions.get(&single.name), single)
    }

    /// Describe a leaf in the polarity it carries.
    pub fn verbalize(&self, single: &Single) -> String {
        if single.negated {
            self.negative_constraint_description(single)
        } else {
            self.positive_constraint_description(single)
        }
    }

    /// Reject descriptors whose expansion would be ill-defined.
    pub fn validate(&self) -> Result<(), SopError> {
        let invalid = |reason: String| SopError::InvalidDescriptor {
            domain: self.name.clone(),
            reason,
        };

        for (predicate, link) in &self.constraint_links {
            let Some(spec) = self.actions.get(&link.action) else {
                return Err(invalid(format!(
                    "link {predicate} targets unknown action {}",
                    link.action
                )));
            };
            for param in link.param_mapping.keys() {
                if !spec.parameters.contains(param) {
                    return Err(invalid(format!(
                        "link {predicate} maps unknown parameter {param} of {}",
                        link.action
                    )));
                }
            }
        }

        for table in [&self.innate_deps, &self.required_deps, &self.customizable_deps] {
            for action in table.keys() {
                if !self.actions.contains_key(action) {
                    return Err(invalid(format!("deps declared for unknown action {action}")));
                }
            }
        }

        self.check_fresh_param_clashes().map_err(invalid)?;
        if let Some(cycle) = self.find_cycle() {
            return Err(SopError::CycleDetected { path: cycle });
        }

        for (action, innate) in &self.innate_deps {
            if innate.relation_counts().contains_key(&Relation::Or) {
                warn!(domain = %self.name, action = %action, "innate deps contain or; implied-call credit treats every branch as taken");
            }
        }
        Ok(())
    }

    /// Two linked actions that both need a fresh parameter with the same name
    /// and type would share one symbol after expansion.
    fn check_fresh_param_clashes(&self) -> Result<(), String> {
        let mut owners: BTreeMap<(String, String), &str> = BTreeMap::new();
        for link in self.constraint_links.values() {
            let Some(spec) = self.actions.get(&link.action) else {
                continue;
            };
            for param in &spec.parameters {
                if link.param_mapping.contains_key(param) {
                    continue;
                }
                let ty = spec.param_types.get(param).cloned().unwrap_or_default();
                match owners.get(&(param.clone(), ty.clone())) {
                    Some(owner) if *owner != link.action => {
                        return Err(format!(
                            "linked actions {owner} and {} both need fresh parameter {param}",
                            link.action
                        ));
                    }
                    _ => {
                        owners.insert((param.clone(), ty), link.action.as_str());
                    }
                }
            }
        }
        Ok(())
    }

    /// Dependency edges between names: a predicate depends on its linked
    /// action, constraint deps and process; an action on its innate and
    /// default deps.
    fn dependency_edges(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let names = |tree: &Constraint| -> BTreeSet<String> {
            tree.gather_singles().into_iter().map(|s| s.name).collect()
        };
        for (predicate, link) in &self.constraint_links {
            edges
                .entry(predicate.clone())
                .or_default()
                .insert(link.action.clone());
        }
        for table in [&self.constraint_deps, &self.constraint_processes] {
            for (predicate, tree) in table {
                edges.entry(predicate.clone()).or_default().extend(names(tree));
            }
        }
        for table in [&self.innate_deps, &self.required_deps, &self.customizable_deps] {
            for (action, tree) in table {
                edges.entry(action.clone()).or_default().extend(names(tree));
            }
        }
        edges
    }

    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Active,
            Done,
        }

        fn visit(
            name: &str,
            edges: &BTreeMap<String, BTreeSet<String>>,
            marks: &mut BTreeMap<String, Mark>,
            path: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            match marks.get(name) {
                Some(Mark::Done) => return None,
                Some(Mark::Active) => {
                    let start = path.iter().position(|n| n == name).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(name.to_string());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(name.to_string(), Mark::Active);
            path.push(name.to_string());
            if let Some(next) = edges.get(name) {
                for target in next {
                    if let Some(cycle) = visit(target, edges, marks, path) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            marks.insert(name.to_string(), Mark::Done);
            None
        }

        let edges = self.dependency_edges();
        let mut marks = BTreeMap::new();
        for name in edges.keys() {
            let mut path = Vec::new();
            if let Some(cycle) = visit(name, &edges, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }
}

/// Fill `{param}` placeholders with the leaf's arguments.
fn describe(template: Option<&String>, single: &Single) -> String {
    let Some(template) = template else {
        return single.positive().to_string();
    };
    single
        .args
        .iter()
        .fold(template.clone(), |text, (param, value)| {
            text.replace(&format!("{{{param}}}"), value)
        })
}

/// Map an action-parameter binding back onto a link's predicate arguments.
pub fn link_action_args(link: &Link, predicate_args: &Args, action_params: &[String]) -> Args {
    action_params
        .iter()
        .filter_map(|param| {
            let predicate_param = link.param_mapping.get(param)?;
            predicate_args
                .get(predicate_param)
                .map(|value| (param.clone(), value.clone()))
        })
        .collect()
}
