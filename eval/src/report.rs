use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use sopbench::core::stats::{Breakdown, Sample, summarize};
use sopbench::core::types::OutcomeCategory;

use crate::results::{TaskResult, load_output};

pub const OUTPUT_FILE: &str = "output.json";

/// Statistics over one or more output files.
#[derive(Debug, Default, Serialize)]
pub struct ReportSummary {
    pub tasks: usize,
    pub trials: usize,
    /// Trials whose dialogue failed before it could be evaluated.
    pub failed_trials: usize,
    pub breakdown: Breakdown,
    /// Tasks still waiting for a manual fix.
    pub manual_fix: Vec<String>,
}

/// Output files under `path`: the file itself, or `output.json` of every
/// run directory below a results directory.
pub fn load_run_outputs(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut outputs = Vec::new();
    for entry in fs::read_dir(path).with_context(|| format!("read {}", path.display()))? {
        let entry = entry.context("read entry")?;
        let entry_path = entry.path();
        if entry_path.is_dir() {
            let output = entry_path.join(OUTPUT_FILE);
            if output.is_file() {
                outputs.push(output);
            } else {
                outputs.extend(load_run_outputs(&entry_path)?);
            }
        }
    }
    outputs.sort();
    Ok(outputs)
}

/// Aggregate every output under `path`. Unreadable files are skipped with
/// a warning.
pub fn aggregate(path: &Path, max_constraints: usize) -> Result<(ReportSummary, Vec<String>)> {
    let mut results = Vec::new();
    let mut warnings = Vec::new();
    for output in load_run_outputs(path)? {
        match load_output(&output) {
            Ok(loaded) => results.extend(loaded),
            Err(err) => warnings.push(format!("skip {}: {err:#}", output.display())),
        }
    }
    Ok((summarize_results(&results, max_constraints), warnings))
}

pub fn summarize_results(results: &[TaskResult], max_constraints: usize) -> ReportSummary {
    let samples: Vec<Sample<'_>> = results
        .iter()
        .flat_map(|result| {
            let constraints = result
                .task
                .dependency_original
                .as_ref()
                .or(result.task.dependency.as_ref());
            result.evaluations.iter().map(move |evaluation| Sample {
                // Same task from different runs pools into one pass@k entry.
                task_id: format!("{}/{}", result.domain, result.task_id),
                goal: &result.task.goal,
                constraints,
                evaluation,
            })
        })
        .collect();

    let mut manual_fix: Vec<String> = results
        .iter()
        .filter_map(|result| result.task.manfix_id.clone())
        .collect();
    manual_fix.sort();
    manual_fix.dedup();

    ReportSummary {
        tasks: results.len(),
        trials: results.iter().map(|r| r.interactions.len()).sum(),
        failed_trials: results
            .iter()
            .flat_map(|r| &r.interactions)
            .filter(|i| i.error.is_some())
            .count(),
        breakdown: summarize(&samples, max_constraints),
        manual_fix,
    }
}

const HEADLINE_FIELDS: [&str; 7] = [
    "success",
    "no_tool_call_error",
    "constraint_not_violated",
    "database_match",
    "action_successfully_called",
    "action_called_correctly",
    "dirgraph_satisfied",
];

/// Plain-text report, one `report:` line per figure.
pub fn render(summary: &ReportSummary) -> String {
    let mut out = String::new();
    let overall = &summary.breakdown.overall;
    let _ = writeln!(
        out,
        "report: tasks={} trials={} evaluated={} failed={}",
        summary.tasks, summary.trials, overall.count, summary.failed_trials
    );
    for field in HEADLINE_FIELDS {
        let _ = writeln!(out, "report: {field}={:.3}", overall.average(field));
    }
    for (k, rate) in &summary.breakdown.pass_at_k {
        let _ = writeln!(out, "report: pass@{k}={rate:.3}");
    }
    for (goal, stats) in &summary.breakdown.by_goal {
        let _ = writeln!(
            out,
            "report: goal {goal} success={:.3} n={}",
            stats.average("success"),
            stats.count
        );
    }
    for (bucket, stats) in &summary.breakdown.by_constraint_count {
        let _ = writeln!(
            out,
            "report: constraints {bucket} success={:.3} n={}",
            stats.average("success"),
            stats.count
        );
    }
    for (shape, stats) in &summary.breakdown.by_relation_shape {
        let _ = writeln!(
            out,
            "report: shape {shape} success={:.3} n={}",
            stats.average("success"),
            stats.count
        );
    }
    if let Some(errors) = overall.distributions.get("error_category") {
        for (label, count) in errors {
            let _ = writeln!(out, "report: error {label} {count}");
        }
    }
    let outcomes: BTreeMap<&str, u64> = [
        OutcomeCategory::CorrectProcedureCorrectOutcome,
        OutcomeCategory::CorrectProcedureWrongOutcome,
        OutcomeCategory::WrongProcedureCorrectOutcome,
        OutcomeCategory::WrongProcedureWrongOutcome,
    ]
    .into_iter()
    .map(|category| {
        (
            category.as_str(),
            overall.label_count("outcome_category", category.as_str()),
        )
    })
    .collect();
    for (label, count) in outcomes {
        let _ = writeln!(out, "report: outcome {label} {count}");
    }
    for id in &summary.manual_fix {
        let _ = writeln!(out, "report: manual_fix {id}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{Interaction, Setup, write_output};
    use serde_json::json;
    use sopbench::core::dag::ActionGraph;
    use sopbench::core::stats::Statistics;
    use sopbench::core::types::{ErrorCategory, Evaluation};
    use sopbench::compile::TaskRecord;
    use sopbench::io::config::HarnessConfig;
    use tempfile::tempdir;

    fn evaluation(success: bool) -> Evaluation {
        Evaluation {
            no_tool_call_error: true,
            constraint_not_violated: true,
            database_match: success,
            action_successfully_called: success,
            action_called_correctly: true,
            dirgraph_satisfied: true,
            success,
            num_messages: 6,
            num_function_calls: 2,
            num_constraints: 1,
            num_constraints_expanded: 2,
            outcome_category: OutcomeCategory::classify(true, success),
            error_category: if success {
                ErrorCategory::None
            } else {
                ErrorCategory::DatabaseMismatch
            },
        }
    }

    fn result(task_id: &str, successes: &[bool], manfix: Option<&str>) -> TaskResult {
        let evaluations: Vec<Evaluation> = successes.iter().map(|s| evaluation(*s)).collect();
        TaskResult {
            domain: "bank".to_string(),
            task_id: task_id.to_string(),
            setup: Setup::from_config(&HarnessConfig::default()),
            task: TaskRecord {
                goal: "logout_user".to_string(),
                initial_database: json!({}),
                user_known: serde_json::Map::new(),
                constraint_parameters: serde_json::Map::new(),
                dependency: None,
                dependency_original: None,
                dependency_permutation: None,
                action_should_succeed: true,
                directed_action_graph: ActionGraph::new(),
                user_instruction: String::new(),
                user_prompt: String::new(),
                manfix_id: manfix.map(str::to_string),
            },
            interactions: successes
                .iter()
                .map(|_| Interaction {
                    prompt: String::new(),
                    interaction: Vec::new(),
                    database: json!({}),
                    stop: None,
                    error: None,
                })
                .collect(),
            statistics: Statistics::from_evaluations(&evaluations),
            evaluations,
        }
    }

    #[test]
    fn summarizes_results() {
        let results = [
            result("logout_user-0", &[false, true], None),
            result("logout_user-1", &[false, false], Some("logout_user-1")),
        ];
        let summary = summarize_results(&results, 5);
        assert_eq!(summary.tasks, 2);
        assert_eq!(summary.trials, 4);
        assert_eq!(summary.breakdown.overall.count, 4);
        assert_eq!(summary.breakdown.pass_at_k[&1], 0.0);
        assert_eq!(summary.breakdown.pass_at_k[&2], 0.5);
        assert_eq!(summary.manual_fix, vec!["logout_user-1"]);

        let text = render(&summary);
        assert!(text.contains("report: success=0.250"));
        assert!(text.contains("report: pass@2=0.500"));
        assert!(text.contains("report: error database_mismatch 3"));
        assert!(text.contains("report: manual_fix logout_user-1"));
    }

    #[test]
    fn aggregates_run_directories() {
        let temp = tempdir().expect("tempdir");
        let bank = temp.path().join("bank");
        write_output(
            &bank.join("eval-1").join(OUTPUT_FILE),
            &[result("logout_user-0", &[true], None)],
        )
        .expect("write");
        write_output(
            &bank.join("eval-2").join(OUTPUT_FILE),
            &[result("logout_user-0", &[false], None)],
        )
        .expect("write");
        fs::create_dir_all(bank.join("eval-3")).expect("mkdir");
        fs::write(bank.join("eval-3").join(OUTPUT_FILE), "not json").expect("write");

        let (summary, warnings) = aggregate(temp.path(), 5).expect("aggregate");
        assert_eq!(summary.tasks, 2);
        assert_eq!(warnings.len(), 1);
        // Both runs share one task id, so its first trial decides pass@1.
        assert_eq!(summary.breakdown.pass_at_k[&1], 1.0);
        assert_eq!(summary.breakdown.pass_at_k[&2], 1.0);
    }

    #[test]
    fn missing_directory_is_empty() {
        let temp = tempdir().expect("tempdir");
        let (summary, warnings) = aggregate(&temp.path().join("missing"), 5).expect("aggregate");
        assert_eq!(summary.tasks, 0);
        assert!(warnings.is_empty());
    }
}
