//! Evaluation of constraint trees with skip semantics.

use std::collections::{BTreeMap, BTreeSet};

use super::constraint::{Constraint, Relation, Single};

/// Evaluate `tree`, asking `leaf` for the truth of each positive leaf.
///
/// `and`/`or` ask every child; `chain` stops at the first false child and
/// `gate` at the first true one, so leaves after that point are never asked.
/// Empty conjunctions hold, empty disjunctions do not.
pub fn evaluate<F, E>(tree: &Constraint, leaf: &mut F) -> Result<bool, E>
where
    F: FnMut(&Single) -> Result<bool, E>,
{
    match tree {
        Constraint::Single(single) => {
            let value = leaf(&single.positive())?;
            Ok(value != single.negated)
        }
        Constraint::Op(Relation::And, children) => {
            let mut all = true;
            for child in children {
                all &= evaluate(child, leaf)?;
            }
            Ok(all)
        }
        Constraint::Op(Relation::Or, children) => {
            let mut any = false;
            for child in children {
                any |= evaluate(child, leaf)?;
            }
            Ok(any)
        }
        Constraint::Op(Relation::Chain, children) => {
            for child in children {
                if !evaluate(child, leaf)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Constraint::Op(Relation::Gate, children) => {
            for child in children {
                if evaluate(child, leaf)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

/// Evaluate against a fixed assignment of leaf keys. Missing leaves are false.
pub fn evaluate_assignment(tree: &Constraint, assignments: &BTreeMap<String, bool>) -> bool {
    let result: Result<bool, std::convert::Infallible> = evaluate(tree, &mut |single| {
        Ok(assignments.get(&single.key()).copied().unwrap_or(false))
    });
    match result {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

/// Leaf keys whose value does not influence the outcome under `assignments`.
///
/// These are leaves an ordered operator short-circuited past, plus leaves
/// that were reached but have no assignment (treated as false).
pub fn undetermined_from_results(
    tree: &Constraint,
    assignments: &BTreeMap<String, bool>,
) -> BTreeSet<String> {
    let mut reached = BTreeSet::new();
    let mut unassigned = BTreeSet::new();
    let result: Result<bool, std::convert::Infallible> = evaluate(tree, &mut |single| {
        let key = single.key();
        let value = assignments.get(&key).copied();
        if value.is_none() {
            unassigned.insert(key.clone());
        }
        reached.insert(key);
        Ok(value.unwrap_or(false))
    });
    if let Err(never) = result {
        match never {}
    }

    tree.leaf_keys()
        .into_iter()
        .filter(|key| !reached.contains(key) || unassigned.contains(key))
        .collect()
}
