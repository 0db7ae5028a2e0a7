//! Aggregation of evaluations into run statistics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::constraint::Constraint;
use super::types::Evaluation;

/// Evaluation fields reported as averages.
pub const AVG_PARAMS: &[&str] = &[
    "no_tool_call_error",
    "constraint_not_violated",
    "database_match",
    "action_successfully_called",
    "action_called_correctly",
    "dirgraph_satisfied",
    "success",
    "num_messages",
    "num_function_calls",
    "num_constraints",
    "num_constraints_expanded",
];

/// Totals, averages and label counts over a set of evaluations.
///
/// `combine` is associative with `Statistics::default()` as identity, so
/// per-worker or per-file statistics can be merged in any grouping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub count: u64,
    pub totals: BTreeMap<String, f64>,
    pub averages: BTreeMap<String, f64>,
    pub distributions: BTreeMap<String, BTreeMap<String, u64>>,
}

impl Statistics {
    pub fn from_evaluations<'a>(evaluations: impl IntoIterator<Item = &'a Evaluation>) -> Self {
        let mut stats = Statistics::default();
        for evaluation in evaluations {
            stats.record(evaluation);
        }
        stats
    }

    pub fn record(&mut self, evaluation: &Evaluation) {
        self.count += 1;
        for (field, value) in evaluation.numeric_fields() {
            *self.totals.entry(field.to_string()).or_default() += value;
        }
        for (field, label) in evaluation.label_fields() {
            *self
                .distributions
                .entry(field.to_string())
                .or_default()
                .entry(label.to_string())
                .or_default() += 1;
        }
        self.recompute_averages();
    }

    /// Sum totals and counters, then recompute averages from the merged
    /// totals.
    pub fn combine(&self, other: &Statistics) -> Statistics {
        let mut merged = self.clone();
        merged.count += other.count;
        for (field, value) in &other.totals {
            *merged.totals.entry(field.clone()).or_default() += value;
        }
        for (field, counts) in &other.distributions {
            let target = merged.distributions.entry(field.clone()).or_default();
            for (label, count) in counts {
                *target.entry(label.clone()).or_default() += count;
            }
        }
        merged.recompute_averages();
        merged
    }

    fn recompute_averages(&mut self) {
        self.averages = if self.count == 0 {
            BTreeMap::new()
        } else {
            AVG_PARAMS
                .iter()
                .filter_map(|field| {
                    self.totals
                        .get(*field)
                        .map(|total| (field.to_string(), total / self.count as f64))
                })
                .collect()
        };
    }

    pub fn average(&self, field: &str) -> f64 {
        self.averages.get(field).copied().unwrap_or(0.0)
    }

    pub fn label_count(&self, field: &str, label: &str) -> u64 {
        self.distributions
            .get(field)
            .and_then(|counts| counts.get(label))
            .copied()
            .unwrap_or(0)
    }
}

/// Whether any of the first `k` trials, in run order, succeeded.
pub fn pass_at_k(trials: &[bool], k: usize) -> bool {
    trials.iter().take(k).any(|&ok| ok)
}

/// Bucket label for a constraint count: 0 and 1 share a bucket, counts at
/// or above `max` fold into `max+`.
pub fn constraint_bucket(num_constraints: usize, max: usize) -> String {
    let n = num_constraints.max(1);
    if n >= max {
        format!("{max}+")
    } else {
        n.to_string()
    }
}

/// Operator makeup of a SOP, e.g. `and1-chain1`; `single` for a lone leaf,
/// `none` when there is no SOP.
pub fn relation_shape(tree: Option<&Constraint>) -> String {
    let Some(tree) = tree else {
        return "none".to_string();
    };
    let counts = tree.relation_counts();
    if counts.is_empty() {
        return "single".to_string();
    }
    counts
        .iter()
        .map(|(relation, count)| format!("{relation}{count}"))
        .collect::<Vec<_>>()
        .join("-")
}

/// One evaluated trial and the task attributes statistics are bucketed by.
#[derive(Debug, Clone)]
pub struct Sample<'a> {
    pub task_id: String,
    pub goal: &'a str,
    pub constraints: Option<&'a Constraint>,
    pub evaluation: &'a Evaluation,
}

/// Overall statistics plus the standard breakdowns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    pub overall: Statistics,
    pub by_goal: BTreeMap<String, Statistics>,
    pub by_constraint_count: BTreeMap<String, Statistics>,
    pub by_relation_shape: BTreeMap<String, Statistics>,
    /// k -> share of tasks passing within their first k trials.
    pub pass_at_k: BTreeMap<usize, f64>,
}

pub fn summarize(samples: &[Sample<'_>], max_constraints: usize) -> Breakdown {
    let mut breakdown = Breakdown::default();
    let mut trials: BTreeMap<&str, Vec<bool>> = BTreeMap::new();

    for sample in samples {
        let evaluation = sample.evaluation;
        breakdown.overall.record(evaluation);
        breakdown
            .by_goal
            .entry(sample.goal.to_string())
            .or_default()
            .record(evaluation);
        breakdown
            .by_constraint_count
            .entry(constraint_bucket(evaluation.num_constraints, max_constraints))
            .or_default()
            .record(evaluation);
        breakdown
            .by_relation_shape
            .entry(relation_shape(sample.constraints))
            .or_default()
            .record(evaluation);

        trials
            .entry(sample.task_id.as_str())
            .or_default()
            .push(evaluation.success);
    }

    let max_trials = trials.values().map(Vec::len).max().unwrap_or(0);
    for k in 1..=max_trials {
        let passed = trials.values().filter(|runs| pass_at_k(runs, k)).count();
        breakdown.pass_at_k.insert(k, passed as f64 / trials.len() as f64);
    }
    breakdown
}
