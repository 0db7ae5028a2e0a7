//! Truth-table enumeration of constraint trees.
//!
//! Each row assigns a truth value to every leaf it mentions, keyed by the
//! leaf's canonical key. `Skipped` marks leaves an ordered operator never
//! reaches; when rows are merged it acts as a wildcard.
//!
//! Enumeration is capped: for `and` at most `k` children fail at once, for
//! `or` at most `k` succeed. The cap keeps tables small while still covering
//! every child individually.

use std::collections::{BTreeMap, BTreeSet};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::constraint::{Constraint, Relation, Single};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Truth {
    False,
    True,
    Skipped,
}

impl Truth {
    pub fn as_i8(self) -> i8 {
        match self {
            Truth::True => 1,
            Truth::False => 0,
            Truth::Skipped => -1,
        }
    }

    pub fn from_i8(value: i8) -> Option<Self> {
        match value {
            1 => Some(Truth::True),
            0 => Some(Truth::False),
            -1 => Some(Truth::Skipped),
            _ => None,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        if value { Truth::True } else { Truth::False }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Truth::True => Some(true),
            Truth::False => Some(false),
            Truth::Skipped => None,
        }
    }
}

impl Serialize for Truth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i8(self.as_i8())
    }
}

impl<'de> Deserialize<'de> for Truth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i8::deserialize(deserializer)?;
        Truth::from_i8(raw)
            .ok_or_else(|| serde::de::Error::custom(format!("truth value must be 1, 0 or -1, got {raw}")))
    }
}

pub type Row = BTreeMap<String, Truth>;

/// Rows under which a tree holds (`true`) and fails (`false`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permutations {
    #[serde(rename = "true")]
    pub success: Vec<Row>,
    #[serde(rename = "false")]
    pub failure: Vec<Row>,
}

impl Permutations {
    pub fn is_empty(&self) -> bool {
        self.success.is_empty() && self.failure.is_empty()
    }

    pub fn len(&self) -> usize {
        self.success.len() + self.failure.len()
    }

    /// Rows with their expected outcome, successes first.
    pub fn labelled(&self) -> impl Iterator<Item = (&Row, bool)> {
        self.success
            .iter()
            .map(|row| (row, true))
            .chain(self.failure.iter().map(|row| (row, false)))
    }
}

/// Merge two rows. `Skipped` yields to any concrete value; two different
/// concrete values are a contradiction.
pub fn merge_rows(left: &Row, right: &Row) -> Option<Row> {
    let mut merged = left.clone();
    for (key, value) in right {
        match merged.get(key).copied() {
            None | Some(Truth::Skipped) => {
                merged.insert(key.clone(), *value);
            }
            Some(_) if *value == Truth::Skipped => {}
            Some(existing) if existing == *value => {}
            Some(_) => return None,
        }
    }
    Some(merged)
}

/// Cartesian product of row lists, dropping contradictory combinations.
fn product(lists: &[&[Row]]) -> Vec<Row> {
    let mut acc = vec![Row::new()];
    for list in lists {
        let mut next = Vec::new();
        for prefix in &acc {
            for row in *list {
                if let Some(merged) = merge_rows(prefix, row) {
                    next.push(merged);
                }
            }
        }
        acc = next;
        if acc.is_empty() {
            break;
        }
    }
    acc
}

fn dedup(rows: Vec<Row>) -> Vec<Row> {
    let mut seen = BTreeSet::new();
    rows.into_iter().filter(|row| seen.insert(row.clone())).collect()
}

fn skipped_row(children: &[Constraint]) -> Row {
    children
        .iter()
        .flat_map(Constraint::leaf_keys)
        .map(|key| (key, Truth::Skipped))
        .collect()
}

/// All `size`-element index subsets of `0..n` in lexicographic order.
fn combinations(n: usize, size: usize) -> Vec<Vec<usize>> {
    fn walk(start: usize, n: usize, size: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if current.len() == size {
            out.push(current.clone());
            return;
        }
        for idx in start..n {
            current.push(idx);
            walk(idx + 1, n, size, current, out);
            current.pop();
        }
    }
    let mut out = Vec::new();
    walk(0, n, size, &mut Vec::with_capacity(size), &mut out);
    out
}

/// `or` of two `and`s over complementary literal sets: XOR/XNOR shapes,
/// which a capped enumeration cannot cover.
pub fn is_xor_shape(tree: &Constraint) -> bool {
    let Constraint::Op(Relation::Or, branches) = tree else {
        return false;
    };
    let [left, right] = branches.as_slice() else {
        return false;
    };
    let literals = |branch: &Constraint| -> Option<BTreeSet<(String, bool)>> {
        let Constraint::Op(Relation::And, children) = branch else {
            return None;
        };
        children
            .iter()
            .map(|child| match child {
                Constraint::Single(single) => Some((single.key(), single.negated)),
                Constraint::Op(..) => None,
            })
            .collect()
    };
    let (Some(left), Some(right)) = (literals(left), literals(right)) else {
        return false;
    };
    let flipped: BTreeSet<(String, bool)> = left
        .iter()
        .map(|(key, negated)| (key.clone(), !negated))
        .collect();
    !left.is_empty() && flipped == right
}

/// Enumerate success and failure rows of `tree`, capping `and`/`or`
/// combinations at `k` (`None` for no cap).
pub fn enumerate(tree: &Constraint, k: Option<usize>) -> Permutations {
    match tree {
        Constraint::Single(single) => {
            let key = single.key();
            let (holds, fails) = if single.negated {
                (Truth::False, Truth::True)
            } else {
                (Truth::True, Truth::False)
            };
            Permutations {
                success: vec![Row::from([(key.clone(), holds)])],
                failure: vec![Row::from([(key, fails)])],
            }
        }
        Constraint::Op(relation, children) => {
            let cap = if is_xor_shape(tree) { None } else { k };
            let subs: Vec<Permutations> = children.iter().map(|c| enumerate(c, cap)).collect();
            let successes: Vec<&[Row]> = subs.iter().map(|p| p.success.as_slice()).collect();
            let failures: Vec<&[Row]> = subs.iter().map(|p| p.failure.as_slice()).collect();
            let n = children.len();
            let limit = cap.map_or(n, |k| k.min(n));

            let pick = |chosen: &[usize], when_chosen: &[&[Row]], otherwise: &[&[Row]]| {
                let lists: Vec<&[Row]> = (0..n)
                    .map(|idx| {
                        if chosen.contains(&idx) {
                            when_chosen[idx]
                        } else {
                            otherwise[idx]
                        }
                    })
                    .collect();
                product(&lists)
            };

            let (success, failure) = match relation {
                Relation::And => {
                    let success = product(&successes);
                    let failure = (1..=limit)
                        .flat_map(|size| combinations(n, size))
                        .flat_map(|chosen| pick(&chosen, &failures, &successes))
                        .collect();
                    (success, failure)
                }
                Relation::Or => {
                    let failure = product(&failures);
                    let success = (1..=limit)
                        .flat_map(|size| combinations(n, size))
                        .flat_map(|chosen| pick(&chosen, &successes, &failures))
                        .collect();
                    (success, failure)
                }
                Relation::Chain => {
                    let success = product(&successes);
                    let failure = (0..n)
                        .flat_map(|idx| ordered_stop(idx, children, &successes, &failures))
                        .collect();
                    (success, failure)
                }
                Relation::Gate => {
                    let failure = product(&failures);
                    let success = (0..n)
                        .flat_map(|idx| ordered_stop(idx, children, &failures, &successes))
                        .collect();
                    (success, failure)
                }
            };
            Permutations {
                success: dedup(success),
                failure: dedup(failure),
            }
        }
    }
}

/// Rows where children before `idx` pass through, child `idx` decides, and
/// the rest are skipped.
fn ordered_stop(idx: usize, children: &[Constraint], before: &[&[Row]], at: &[&[Row]]) -> Vec<Row> {
    let skipped = [skipped_row(&children[idx + 1..])];
    let mut lists: Vec<&[Row]> = before[..idx].to_vec();
    lists.push(at[idx]);
    lists.push(&skipped);
    product(&lists)
}

/// Enumerate with the cap first and retry uncapped when either side is empty.
pub fn enumerate_with_fallback(tree: &Constraint, k: usize) -> Permutations {
    let capped = enumerate(tree, Some(k));
    if capped.success.is_empty() || capped.failure.is_empty() {
        enumerate(tree, None)
    } else {
        capped
    }
}

/// Combine the tables of the required and customizable parts of a SOP.
///
/// A success needs both parts to hold, so each required success is paired
/// with the first compatible customizable success. Failures come from either
/// part failing while the other is paired with a compatible row.
pub fn compose(required: &Permutations, customizable: &Permutations) -> Permutations {
    let first_compatible = |row: &Row, candidates: &[Row]| {
        candidates.iter().find_map(|candidate| merge_rows(row, candidate))
    };

    let success = required
        .success
        .iter()
        .filter_map(|row| first_compatible(row, &customizable.success))
        .collect();

    let mut failure = Vec::new();
    for row in &required.failure {
        let paired = first_compatible(row, &customizable.success)
            .or_else(|| first_compatible(row, &customizable.failure));
        failure.extend(paired);
    }
    for row in &customizable.failure {
        failure.extend(first_compatible(row, &required.success));
    }

    Permutations {
        success: dedup(success),
        failure: dedup(failure),
    }
}

/// Enumerate a SOP split into required and customizable parts.
pub fn enumerate_composed(
    required: Option<&Constraint>,
    customizable: Option<&Constraint>,
    k: usize,
) -> Permutations {
    match (required, customizable) {
        (Some(required), Some(customizable)) => {
            let capped = compose(
                &enumerate(required, Some(k)),
                &enumerate(customizable, Some(k)),
            );
            if capped.success.is_empty() || capped.failure.is_empty() {
                compose(&enumerate(required, None), &enumerate(customizable, None))
            } else {
                capped
            }
        }
        (Some(tree), None) | (None, Some(tree)) => enumerate_with_fallback(tree, k),
        (None, None) => Permutations {
            success: vec![Row::new()],
            failure: Vec::new(),
        },
    }
}

/// Drop rows that require a `call_*` leaf to fail: those leaves record a
/// call that has already happened by construction.
pub fn drop_failed_calls(perms: Permutations, leaves: &BTreeMap<String, Single>) -> Permutations {
    let possible = |row: &Row| {
        row.iter().all(|(key, value)| {
            *value != Truth::False
                || !leaves
                    .get(key)
                    .is_some_and(|single| single.name.starts_with("call_"))
        })
    };
    Permutations {
        success: perms.success.into_iter().filter(possible).collect(),
        failure: perms.failure.into_iter().filter(possible).collect(),
    }
}

/// Keep at most `n` rows, sampled with a seeded generator. Sampled rows keep
/// their original relative order.
pub fn limit_num_tasks(rows: Vec<Row>, n: usize, seed: u64) -> Vec<Row> {
    if rows.len() <= n {
        return rows;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked = sample(&mut rng, rows.len(), n).into_vec();
    picked.sort_unstable();
    let keep: BTreeSet<usize> = picked.into_iter().collect();
    rows.into_iter()
        .enumerate()
        .filter_map(|(idx, row)| keep.contains(&idx).then_some(row))
        .collect()
}

/// Column view of a row list: leaf key -> one value per row. Leaves a row
/// does not mention are `-1`.
pub fn to_columns(rows: &[Row]) -> BTreeMap<String, Vec<i8>> {
    let keys: BTreeSet<&String> = rows.iter().flat_map(|row| row.keys()).collect();
    keys.into_iter()
        .map(|key| {
            let column = rows
                .iter()
                .map(|row| row.get(key).copied().unwrap_or(Truth::Skipped).as_i8())
                .collect();
            (key.clone(), column)
        })
        .collect()
}
