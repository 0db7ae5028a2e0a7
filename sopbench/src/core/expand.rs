//! SOP expansion: rewriting a raw SOP until every leaf is a concrete check.
//!
//! Three indirections are resolved at each leaf:
//!
//! - **constraint links**: a predicate satisfied by calling an action is
//!   replaced by that action, preceded by the action's own default deps;
//! - **constraint deps**: a predicate that only makes sense once another
//!   holds is chained after it;
//! - **innate deps**: an action is chained after the checks its
//!   implementation performs anyway.
//!
//! A per-expansion [`LinkScratchpad`] decides the symbols of linked actions'
//! parameters so that the same predicate occurrence always maps to the same
//! action call, and distinct occurrences get distinct fresh symbols.

use std::collections::BTreeMap;

use serde::Serialize;

use super::constraint::{Args, Constraint, LITERAL_PREFIX, Relation, Single};
use super::descriptor::{DefaultOption, DomainDescriptor, Link};
use super::prune::prune;
use crate::error::SopError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionOptions {
    pub default_option: DefaultOption,
    pub add_constraint_deps: bool,
}

impl Default for ExpansionOptions {
    fn default() -> Self {
        Self {
            default_option: DefaultOption::Required,
            add_constraint_deps: true,
        }
    }
}

/// Remembers how each predicate occurrence was mapped onto its linked action.
#[derive(Debug, Clone, Default)]
pub struct LinkScratchpad {
    remaps: BTreeMap<(String, Vec<(String, String)>), Args>,
    variants: BTreeMap<String, usize>,
}

impl LinkScratchpad {
    pub fn new() -> Self {
        Self::default()
    }

    /// Action arguments for a linked predicate occurrence.
    ///
    /// Mapped parameters take the predicate's symbols. Unmapped ones are
    /// fresh: the first variant of a predicate uses the parameter name
    /// itself, the n-th appends `n`.
    pub fn map_link(&mut self, single: &Single, link: &Link, action_params: &[String]) -> Args {
        let key = (
            single.name.clone(),
            single
                .args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>(),
        );
        if let Some(remap) = self.remaps.get(&key) {
            return remap.clone();
        }

        let counter = self.variants.entry(single.name.clone()).or_insert(0);
        let variant = *counter;
        *counter += 1;

        let mapped: Args = action_params
            .iter()
            .map(|param| {
                let bound = link.param_mapping.get(param).and_then(|target| {
                    if target.starts_with(LITERAL_PREFIX) {
                        Some(target.clone())
                    } else {
                        single.args.get(target).cloned()
                    }
                });
                let value = bound.unwrap_or_else(|| fresh_symbol(param, variant));
                (param.clone(), value)
            })
            .collect();
        self.remaps.insert(key, mapped.clone());
        mapped
    }
}

fn fresh_symbol(param: &str, variant: usize) -> String {
    if variant == 0 {
        param.to_string()
    } else {
        format!("{param}{variant}")
    }
}

/// Which indirections an [`Expander`] resolves.
#[derive(Debug, Clone, Copy)]
struct Passes {
    links: bool,
    constraint_deps: bool,
    innate: bool,
}

/// Recursive leaf rewriter shared by every expansion entry point.
struct Expander<'a> {
    domain: &'a DomainDescriptor,
    default_option: DefaultOption,
    passes: Passes,
    scratchpad: &'a mut LinkScratchpad,
    path: Vec<String>,
}

impl<'a> Expander<'a> {
    fn new(
        domain: &'a DomainDescriptor,
        default_option: DefaultOption,
        passes: Passes,
        scratchpad: &'a mut LinkScratchpad,
    ) -> Self {
        Self {
            domain,
            default_option,
            passes,
            scratchpad,
            path: Vec::new(),
        }
    }

    fn expand(&mut self, tree: &Constraint) -> Result<Constraint, SopError> {
        tree.try_map_singles(&mut |single| self.expand_single(single))
    }

    fn enter(&mut self, name: &str) -> Result<(), SopError> {
        if self.path.iter().any(|seen| seen == name) {
            let mut path = self.path.clone();
            path.push(name.to_string());
            return Err(SopError::CycleDetected { path });
        }
        self.path.push(name.to_string());
        Ok(())
    }

    fn expand_single(&mut self, single: &Single) -> Result<Constraint, SopError> {
        let positive = single.positive();
        self.enter(&positive.name)?;

        let mut parts = Vec::new();
        if self.passes.constraint_deps
            && let Some(dep) = self.domain.constraint_dep(&positive.name)
        {
            parts.push(self.expand(&dep.substitute_params(&positive.args))?);
        }

        let link = self.domain.link(&positive.name).cloned();
        match link {
            Some(link) if self.passes.links => {
                let params = self.domain.parameters(&link.action);
                let mapped = self.scratchpad.map_link(&positive, &link, &params);
                if let Some(deps) = self.domain.default_deps(&link.action, self.default_option) {
                    parts.push(self.expand(&deps.substitute_params(&mapped))?);
                }
                parts.push(self.expand_action(Single::new(link.action.clone(), mapped))?);
            }
            _ if self.domain.is_action(&positive.name) => {
                parts.push(self.expand_action(positive)?);
            }
            _ => parts.push(Constraint::Single(positive)),
        }
        self.path.pop();

        let expanded = match Constraint::collapse(Relation::Chain, parts) {
            Some(tree) => tree,
            None => Constraint::Single(single.positive()),
        };
        Ok(if single.negated {
            expanded.invert(true)
        } else {
            expanded
        })
    }

    fn expand_action(&mut self, action: Single) -> Result<Constraint, SopError> {
        if !self.passes.innate {
            return Ok(Constraint::Single(action));
        }
        let Some(innate) = self.domain.innate_deps(&action.name) else {
            return Ok(Constraint::Single(action));
        };
        self.enter(&format!("innate:{}", action.name))?;
        let checks = self.expand(&innate.substitute_params(&action.args))?;
        self.path.pop();
        Ok(Constraint::chain(vec![checks, Constraint::Single(action)]))
    }
}

/// Chain each leaf after its constraint deps. Negated leaves keep their
/// deps and negate only the leaf itself.
pub fn insert_constraint_deps(
    tree: &Constraint,
    domain: &DomainDescriptor,
) -> Result<Constraint, SopError> {
    let mut scratchpad = LinkScratchpad::new();
    let passes = Passes {
        links: false,
        constraint_deps: true,
        innate: false,
    };
    Expander::new(domain, DefaultOption::Required, passes, &mut scratchpad).expand(tree)
}

/// Replace linked predicates by their actions, preceded by the actions'
/// expanded default deps.
pub fn insert_links(
    tree: &Constraint,
    domain: &DomainDescriptor,
    default_option: DefaultOption,
    scratchpad: &mut LinkScratchpad,
) -> Result<Constraint, SopError> {
    let passes = Passes {
        links: true,
        constraint_deps: false,
        innate: false,
    };
    Expander::new(domain, default_option, passes, scratchpad).expand(tree)
}

/// Resolve links, constraint deps (when enabled) and innate deps at every leaf.
pub fn insert_cl_cd_aid(
    tree: &Constraint,
    domain: &DomainDescriptor,
    options: ExpansionOptions,
    scratchpad: &mut LinkScratchpad,
) -> Result<Constraint, SopError> {
    let passes = Passes {
        links: true,
        constraint_deps: options.add_constraint_deps,
        innate: true,
    };
    Expander::new(domain, options.default_option, passes, scratchpad).expand(tree)
}

/// Stages of an action's SOP, each pruned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpandedSop {
    pub goal: String,
    /// The raw SOP as authored.
    pub original: Option<Constraint>,
    /// Raw SOP with constraint deps inserted.
    pub dependency: Option<Constraint>,
    /// Fully resolved SOP.
    pub expanded: Option<Constraint>,
    /// Fully resolved required part, used for composed enumeration.
    pub required: Option<Constraint>,
    /// Fully resolved customizable part (only under `full`).
    pub customizable: Option<Constraint>,
}

/// Expand the default SOP of `goal`.
///
/// One scratchpad is shared across the stages so that a predicate occurrence
/// maps to the same symbols in every stage.
pub fn expand_sop(
    goal: &str,
    domain: &DomainDescriptor,
    options: ExpansionOptions,
    scratchpad: &mut LinkScratchpad,
) -> Result<ExpandedSop, SopError> {
    let original = domain
        .default_deps(goal, options.default_option)
        .and_then(|tree| prune(&tree));
    let dependency = match &original {
        Some(tree) if options.add_constraint_deps => {
            prune(&insert_constraint_deps(tree, domain)?)
        }
        other => other.clone(),
    };

    let resolve = |tree: Option<Constraint>,
                   scratchpad: &mut LinkScratchpad|
     -> Result<Option<Constraint>, SopError> {
        match tree {
            Some(tree) => Ok(prune(&insert_cl_cd_aid(&tree, domain, options, scratchpad)?)),
            None => Ok(None),
        }
    };

    let expanded = resolve(original.clone(), scratchpad)?;
    let required = resolve(
        domain.required_deps(goal).and_then(|tree| prune(&tree)),
        scratchpad,
    )?;
    let customizable = match options.default_option {
        DefaultOption::Full => resolve(
            domain.customizable_deps(goal).and_then(|tree| prune(&tree)),
            scratchpad,
        )?,
        DefaultOption::Required => None,
    };

    Ok(ExpandedSop {
        goal: goal.to_string(),
        original,
        dependency,
        expanded,
        required,
        customizable,
    })
}
