//! Canonicalization of constraint trees.
//!
//! `prune` rewrites a tree until nothing changes: children of the same
//! operator are spliced into their parent, duplicates are dropped, siblings
//! that are implied by a stricter sibling are removed, and single-child or
//! empty operators collapse.

use std::collections::BTreeSet;

use super::constraint::{Constraint, Relation};

/// Canonical form of `tree`; `None` when every operator emptied out.
pub fn prune(tree: &Constraint) -> Option<Constraint> {
    let mut current = tree.clone();
    loop {
        let next = prune_once(&current)?;
        if next == current {
            return Some(next);
        }
        current = next;
    }
}

/// Prune an optional tree, keeping absence absent.
pub fn prune_opt(tree: Option<&Constraint>) -> Option<Constraint> {
    tree.and_then(prune)
}

fn prune_once(tree: &Constraint) -> Option<Constraint> {
    let Constraint::Op(relation, children) = tree else {
        return Some(tree.clone());
    };
    let relation = *relation;

    let mut flat = Vec::with_capacity(children.len());
    for child in children.iter().filter_map(prune_once) {
        match child {
            Constraint::Op(inner, grandchildren) if inner == relation => flat.extend(grandchildren),
            other => flat.push(other),
        }
    }

    // Ordered operators keep repeats here; a repeated child of a chain or
    // gate is covered by its first occurrence and goes in encapsulation.
    if !relation.is_ordered() {
        let mut seen = BTreeSet::new();
        flat.retain(|child| seen.insert(child.hash()));
    }

    let kept = drop_encapsulated(relation, flat);
    Constraint::collapse(relation, kept)
}

/// Remove children implied by a sibling that is at least as strict and
/// covers every member of the child. When two children cover each other
/// the first one is kept.
fn drop_encapsulated(parent: Relation, children: Vec<Constraint>) -> Vec<Constraint> {
    let shapes: Vec<Option<Shape>> = children.iter().map(|c| Shape::of(c, parent)).collect();
    let mut removed = vec![false; children.len()];

    for x in 0..children.len() {
        let Some(shape_x) = &shapes[x] else { continue };
        for y in 0..children.len() {
            if x == y || removed[y] {
                continue;
            }
            let Some(shape_y) = &shapes[y] else { continue };
            if shape_y.encapsulates(shape_x) {
                if x < y && shape_x.encapsulates(shape_y) {
                    continue;
                }
                removed[x] = true;
                break;
            }
        }
    }

    children
        .into_iter()
        .zip(removed)
        .filter_map(|(child, removed)| (!removed).then_some(child))
        .collect()
}

/// Relation and member hashes of a child, as seen from its parent.
struct Shape {
    relation: Relation,
    members: Vec<String>,
}

impl Shape {
    /// Children of the opposite polarity never take part in encapsulation.
    fn of(child: &Constraint, parent: Relation) -> Option<Self> {
        let (relation, members) = match child {
            Constraint::Single(_) => (parent, vec![child.hash()]),
            Constraint::Op(relation, grandchildren) => (
                *relation,
                grandchildren.iter().map(Constraint::hash).collect(),
            ),
        };
        (relation.is_conjunctive() == parent.is_conjunctive()).then_some(Self { relation, members })
    }

    fn encapsulates(&self, other: &Shape) -> bool {
        if self.relation > other.relation {
            return false;
        }
        if self.relation.is_ordered() && other.relation.is_ordered() {
            is_subsequence(&other.members, &self.members)
        } else {
            let own: BTreeSet<&String> = self.members.iter().collect();
            other.members.iter().all(|m| own.contains(m))
        }
    }
}

fn is_subsequence(needle: &[String], haystack: &[String]) -> bool {
    let mut rest = haystack.iter();
    needle.iter().all(|item| rest.any(|candidate| candidate == item))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str) -> Constraint {
        Constraint::single(name, &[("username", "username")])
    }

    #[test]
    fn splices_same_operator_and_collapses() {
        let tree = Constraint::and(vec![
            Constraint::and(vec![leaf("a"), leaf("b")]),
            Constraint::and(vec![leaf("c")]),
        ]);
        assert_eq!(
            prune(&tree),
            Some(Constraint::and(vec![leaf("a"), leaf("b"), leaf("c")]))
        );
    }

    #[test]
    fn empty_operators_vanish() {
        let tree = Constraint::and(vec![Constraint::or(vec![]), Constraint::chain(vec![])]);
        assert_eq!(prune(&tree), None);
        let tree = Constraint::and(vec![Constraint::or(vec![]), leaf("a")]);
        assert_eq!(prune(&tree), Some(leaf("a")));
    }

    #[test]
    fn dedups_and_keeps_first() {
        let tree = Constraint::or(vec![leaf("a"), leaf("b"), leaf("a")]);
        assert_eq!(prune(&tree), Some(Constraint::or(vec![leaf("a"), leaf("b")])));
    }

    #[test]
    fn chain_repeat_falls_to_encapsulation() {
        let tree = Constraint::chain(vec![leaf("a"), leaf("b"), leaf("a")]);
        assert_eq!(prune(&tree), Some(Constraint::chain(vec![leaf("a"), leaf("b")])));
        // Disjunctions under a chain take no part, so their repeat stays.
        let either = Constraint::or(vec![leaf("b"), leaf("c")]);
        let tree = Constraint::chain(vec![leaf("a"), either.clone(), either]);
        assert_eq!(prune(&tree), Some(tree));
    }

    #[test]
    fn leaf_covered_by_chain_sibling_is_dropped() {
        let tree = Constraint::and(vec![
            leaf("a"),
            Constraint::chain(vec![leaf("a"), leaf("b")]),
            leaf("c"),
        ]);
        assert_eq!(
            prune(&tree),
            Some(Constraint::and(vec![
                Constraint::chain(vec![leaf("a"), leaf("b")]),
                leaf("c")
            ]))
        );
    }

    #[test]
    fn looser_sibling_does_not_cover_stricter_one() {
        let tree = Constraint::chain(vec![Constraint::and(vec![leaf("a"), leaf("b")]), leaf("a")]);
        assert_eq!(prune(&tree), Some(tree));
    }

    #[test]
    fn ordered_siblings_use_subsequence() {
        let covered = Constraint::chain(vec![leaf("a"), leaf("c")]);
        let other = Constraint::chain(vec![leaf("c"), leaf("a")]);
        let cover = Constraint::chain(vec![leaf("a"), leaf("b"), leaf("c")]);
        let tree = Constraint::and(vec![covered, cover.clone()]);
        assert_eq!(prune(&tree), Some(cover.clone()));
        let tree = Constraint::and(vec![other.clone(), cover.clone()]);
        assert_eq!(prune(&tree), Some(Constraint::and(vec![other, cover])));
    }

    #[test]
    fn opposite_polarity_children_are_left_alone() {
        let tree = Constraint::and(vec![leaf("a"), Constraint::or(vec![leaf("a"), leaf("b")])]);
        assert_eq!(prune(&tree), Some(tree));
    }

    #[test]
    fn disjunction_absorbs_covered_leaf() {
        let tree = Constraint::or(vec![leaf("a"), Constraint::gate(vec![leaf("a"), leaf("b")])]);
        assert_eq!(
            prune(&tree),
            Some(Constraint::gate(vec![leaf("a"), leaf("b")]))
        );
    }

    #[test]
    fn prune_is_idempotent() {
        let tree = Constraint::chain(vec![
            Constraint::chain(vec![leaf("a"), leaf("b")]),
            Constraint::and(vec![leaf("c"), Constraint::and(vec![leaf("d"), leaf("c")])]),
            Constraint::or(vec![leaf("e")]),
        ]);
        let once = prune(&tree).unwrap();
        assert_eq!(prune(&once), Some(once.clone()));
    }
}
