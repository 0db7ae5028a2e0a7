//! Task compiler: from a domain's SOPs to concrete, verified tasks.
//!
//! For every goal action the SOP is expanded, its permutation table is
//! enumerated, and each row becomes one task. A [`TaskGenerator`] invents
//! the world (database, user knowledge, constraint parameters) for the row;
//! the verifier checks each leaf against that world and replays the action
//! graph on a strict instance. Failed attempts are retried with the missed
//! constraints weighted up. Tasks that never verify are kept with a
//! `manfix_id` so a human can repair them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::core::constraint::{Constraint, Single, literal_value};
use crate::core::dag::{ActionGraph, DagNode, build_action_graph};
use crate::core::descriptor::{DefaultOption, DomainDescriptor};
use crate::core::expand::{ExpandedSop, ExpansionOptions, LinkScratchpad, expand_sop};
use crate::core::permutation::{Row, Truth, drop_failed_calls, enumerate_composed, limit_num_tasks};
use crate::core::truth::undetermined_from_results;
use crate::domain::instance::{bind_args, full_dependencies};
use crate::domain::{Domain, DomainInstance, response_succeeded};
use crate::error::{SopError, as_sop_error};
use crate::io::generator::TaskGenerator;
use crate::io::prompt::{ConstraintItem, GenerationPrompt, PromptEngine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    pub default_option: DefaultOption,
    pub add_constraint_deps: bool,
    /// Cap on simultaneously failing (`and`) or holding (`or`) children.
    pub permutation_k: usize,
    /// Keep at most this many success and this many failure rows per goal.
    pub max_tasks_per_goal: Option<usize>,
    pub seed: u64,
    pub generation_limit: u32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            default_option: DefaultOption::Required,
            add_constraint_deps: true,
            permutation_k: 1,
            max_tasks_per_goal: None,
            seed: 42,
            generation_limit: 3,
        }
    }
}

impl CompileOptions {
    pub fn expansion(&self) -> ExpansionOptions {
        ExpansionOptions {
            default_option: self.default_option,
            add_constraint_deps: self.add_constraint_deps,
        }
    }
}

/// One task as stored in a task file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Filled from the task file key when absent.
    #[serde(default)]
    pub goal: String,
    pub initial_database: Value,
    pub user_known: Map<String, Value>,
    #[serde(default)]
    pub constraint_parameters: Map<String, Value>,
    /// Raw SOP with constraint deps inserted.
    #[serde(rename = "constraints")]
    pub dependency: Option<Constraint>,
    /// Raw SOP as authored.
    #[serde(rename = "constraints_original")]
    pub dependency_original: Option<Constraint>,
    /// Fully resolved SOP.
    #[serde(default)]
    pub dependency_permutation: Option<Constraint>,
    pub action_should_succeed: bool,
    pub directed_action_graph: ActionGraph,
    #[serde(default)]
    pub user_instruction: String,
    #[serde(default)]
    pub user_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manfix_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvTaskSingle {
    pub must_hold: Vec<String>,
    pub must_fail: Vec<String>,
    pub unconstrained: Vec<String>,
}

impl InvTaskSingle {
    pub fn from_row(row: &Row) -> Self {
        let mut buckets = InvTaskSingle::default();
        for (key, truth) in row {
            let bucket = match truth {
                Truth::True => &mut buckets.must_hold,
                Truth::False => &mut buckets.must_fail,
                Truth::Skipped => &mut buckets.unconstrained,
            };
            bucket.push(key.clone());
        }
        buckets
    }
}

/// Per-task compilation detail, parallel to the task file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntermediateRecord {
    /// The permutation row: leaf key -> 1 / 0 / -1.
    pub dependency_permutation: BTreeMap<String, i8>,
    pub inv_task_single: InvTaskSingle,
    pub user_params: Vec<String>,
    pub actions_required: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedGoal {
    pub goal: String,
    pub reason: String,
}

/// Output of one domain pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainCompilation {
    pub tasks: BTreeMap<String, Vec<TaskRecord>>,
    pub intermediate: BTreeMap<String, Vec<IntermediateRecord>>,
    pub skipped: Vec<SkippedGoal>,
    /// `manfix_id`s of tasks that never verified.
    pub manual_fix: Vec<String>,
}

/// Generator output after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedTask {
    pub initial_database: Value,
    pub user_known: Map<String, Value>,
    pub constraint_parameters: Map<String, Value>,
}

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("fence regex should be valid")
});

/// Parse generator text into a task object, tolerating a code fence.
pub fn parse_generated(raw: &str) -> Result<GeneratedTask, SopError> {
    let body = FENCE_RE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map_or(raw, |m| m.as_str())
        .trim();
    let value: Value = serde_json::from_str(body)
        .map_err(|err| SopError::GenerationFormat(format!("not JSON: {err}")))?;
    let Value::Object(mut object) = value else {
        return Err(SopError::GenerationFormat("expected a JSON object".to_string()));
    };
    let mut take_object = |key: &str| match object.remove(key) {
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(SopError::GenerationFormat(format!("{key} must be an object"))),
        None => Err(SopError::GenerationFormat(format!("missing key {key}"))),
    };
    let initial_database = Value::Object(take_object("initial_database")?);
    let user_known = take_object("user_known")?;
    let constraint_parameters = take_object("constraint_parameters")?;
    Ok(GeneratedTask {
        initial_database,
        user_known,
        constraint_parameters,
    })
}

/// Everything about a goal that does not depend on the permutation row.
struct GoalPlan<'a> {
    domain: &'a dyn Domain,
    goal: &'a str,
    sop: ExpandedSop,
    graph: ActionGraph,
    leaves: BTreeMap<String, Single>,
    full_deps: BTreeMap<String, Constraint>,
    user_params: Vec<String>,
}

impl GoalPlan<'_> {
    fn descriptor(&self) -> &DomainDescriptor {
        self.domain.descriptor()
    }

    fn actions_required(&self) -> Vec<String> {
        let names: BTreeSet<String> = self
            .graph
            .nodes
            .iter()
            .filter_map(|node| match node {
                DagNode::Action { name, .. } => Some(name.clone()),
                DagNode::Relation(_) => None,
            })
            .collect();
        names.into_iter().collect()
    }

    /// Generator-facing description of one leaf in the required polarity.
    fn constraint_text(&self, single: &Single, holds: bool) -> String {
        let descriptor = self.descriptor();
        if descriptor.is_action(&single.name) {
            let verdict = if holds { "succeeds" } else { "fails" };
            return format!("calling {single} {verdict}");
        }
        if holds {
            descriptor.positive_constraint_description(single)
        } else {
            descriptor.negative_constraint_description(single)
        }
    }

    /// Check a generated world against `row`.
    ///
    /// Each constrained leaf is evaluated on the initial state. When all
    /// match, the action graph is replayed on a strict instance and the
    /// goal's outcome must agree with the dependency evaluator.
    fn verify(&self, row: &Row, generated: &GeneratedTask) -> Result<(), SopError> {
        let plain = DomainInstance::plain(
            self.domain,
            Some(&generated.initial_database),
            generated.constraint_parameters.clone(),
        )?;

        let mut actual = BTreeMap::new();
        for (key, single) in &self.leaves {
            actual.insert(key.clone(), plain.leaf_holds(single, &generated.user_known)?);
        }
        // Leaves a chain or gate short-circuits past in this world are not
        // judged; the leaf that diverted evaluation is reported instead.
        let skipped = match &self.sop.expanded {
            Some(tree) => undetermined_from_results(tree, &actual),
            None => BTreeSet::new(),
        };
        let unsatisfied: Vec<String> = row
            .iter()
            .filter_map(|(key, truth)| {
                let expected = truth.as_bool()?;
                let holds = actual.get(key)?;
                (*holds != expected && !skipped.contains(key)).then(|| key.clone())
            })
            .collect();
        if !unsatisfied.is_empty() {
            return Err(SopError::GenerationSemantic { unsatisfied });
        }

        let evaluator = match &self.sop.expanded {
            Some(tree) => plain.check(tree, &generated.user_known)?,
            None => true,
        };

        let mut strict = DomainInstance::strict(
            self.domain,
            Some(&generated.initial_database),
            true,
            self.full_deps.clone(),
            generated.constraint_parameters.clone(),
        )?;
        for (action, args) in self.graph.oracle_plan() {
            let call = bind_args(
                &Single::new(action.clone(), args),
                &generated.user_known,
                &generated.constraint_parameters,
            );
            match strict.call(&action, &call) {
                Ok(response) => debug!(action = %action, %response, "oracle step"),
                Err(SopError::ToolCall { reason, .. }) => {
                    debug!(action = %action, reason = %reason, "oracle step rejected");
                }
                Err(err) => return Err(err),
            }
        }
        let goal_args = bind_args(
            &Single::identity(self.goal, &self.descriptor().parameters(self.goal)),
            &generated.user_known,
            &generated.constraint_parameters,
        );
        let strict_ok = match strict.call(self.goal, &goal_args) {
            Ok(response) => response_succeeded(&response),
            Err(SopError::ToolCall { .. }) => false,
            Err(err) => return Err(err),
        };

        if strict_ok != evaluator {
            if evaluator
                && let Some(innate) = self.descriptor().innate_deps(self.goal)
                && !strict.check(&innate, &goal_args)?
            {
                // The world breaks a check the SOP does not mention.
                return Err(SopError::GenerationSemantic {
                    unsatisfied: vec![format!("innate:{}", self.goal)],
                });
            }
            return Err(SopError::VerifierDiscrepancy {
                goal: self.goal.to_string(),
                evaluator,
                strict: strict_ok,
            });
        }
        Ok(())
    }
}

enum Attempt {
    Verified(GeneratedTask),
    Exhausted(Option<GeneratedTask>),
}

/// Compiles the tasks of one domain.
pub struct TaskCompiler<'a> {
    domain: &'a dyn Domain,
    generator: &'a dyn TaskGenerator,
    prompts: &'a PromptEngine,
    options: CompileOptions,
}

impl<'a> TaskCompiler<'a> {
    pub fn new(
        domain: &'a dyn Domain,
        generator: &'a dyn TaskGenerator,
        prompts: &'a PromptEngine,
        options: CompileOptions,
    ) -> Self {
        Self {
            domain,
            generator,
            prompts,
            options,
        }
    }

    /// Compile `goals` (every action when `None`) in order.
    ///
    /// A goal that hits a fatal error is skipped as a whole and recorded;
    /// other errors abort the pass.
    #[instrument(skip_all, fields(domain = %self.domain.descriptor().name))]
    pub fn compile_domain(&self, goals: Option<&[String]>) -> Result<DomainCompilation> {
        let goals = match goals {
            Some(goals) => goals.to_vec(),
            None => self.domain.descriptor().list_actions(),
        };
        let mut out = DomainCompilation::default();
        let mut seen = BTreeSet::new();
        for goal in &goals {
            match self.compile_goal(goal, &mut seen) {
                Ok((tasks, intermediate)) => {
                    out.manual_fix
                        .extend(tasks.iter().filter_map(|t| t.manfix_id.clone()));
                    info!(goal = %goal, tasks = tasks.len(), "compiled goal");
                    out.tasks.insert(goal.clone(), tasks);
                    out.intermediate.insert(goal.clone(), intermediate);
                }
                Err(err) => {
                    if !as_sop_error(&err).is_some_and(SopError::is_fatal) {
                        return Err(err).with_context(|| format!("compile goal {goal}"));
                    }
                    let reason = format!("{err:#}");
                    warn!(goal = %goal, reason = %reason, "skipping goal");
                    out.skipped.push(SkippedGoal {
                        goal: goal.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Expansion, action graph and strict deps of `goal`.
    fn plan<'g>(&self, goal: &'g str) -> Result<GoalPlan<'g>>
    where
        'a: 'g,
    {
        let descriptor = self.domain.descriptor();
        if !descriptor.is_action(goal) {
            return Err(SopError::InvalidDescriptor {
                domain: descriptor.name.clone(),
                reason: format!("{goal} is not an action"),
            }
            .into());
        }
        let mut scratchpad = LinkScratchpad::new();
        let sop = expand_sop(goal, descriptor, self.options.expansion(), &mut scratchpad)?;
        let graph = build_action_graph(
            goal,
            sop.original.as_ref(),
            descriptor,
            self.options.default_option,
            &mut scratchpad,
        )?;
        let full_deps =
            full_dependencies(descriptor, self.options.expansion(), goal, sop.dependency.as_ref())?;

        let leaves: BTreeMap<String, Single> = sop
            .expanded
            .as_ref()
            .map(|tree| tree.gather_singles())
            .unwrap_or_default()
            .into_iter()
            .map(|single| (single.key(), single))
            .collect();

        let mut user_params: BTreeSet<String> = descriptor.parameters(goal).into_iter().collect();
        for single in leaves.values() {
            user_params.extend(
                single
                    .args
                    .values()
                    .filter(|symbol| literal_value(symbol).is_none())
                    .cloned(),
            );
        }

        Ok(GoalPlan {
            domain: self.domain,
            goal,
            sop,
            graph,
            leaves,
            full_deps,
            user_params: user_params.into_iter().collect(),
        })
    }

    /// Success and failure rows for the goal, capped and sampled.
    pub fn permutation_rows(&self, sop: &ExpandedSop, leaves: &BTreeMap<String, Single>) -> Vec<(Row, bool)> {
        let perms = enumerate_composed(
            sop.required.as_ref(),
            sop.customizable.as_ref(),
            self.options.permutation_k,
        );
        let perms = drop_failed_calls(perms, leaves);
        let limit = |rows: Vec<Row>| match self.options.max_tasks_per_goal {
            Some(n) => limit_num_tasks(rows, n, self.options.seed),
            None => rows,
        };
        let success = limit(perms.success);
        let failure = limit(perms.failure);
        success
            .into_iter()
            .map(|row| (row, true))
            .chain(failure.into_iter().map(|row| (row, false)))
            .collect()
    }

    #[instrument(skip_all, fields(goal = %goal))]
    fn compile_goal(
        &self,
        goal: &str,
        seen: &mut BTreeSet<String>,
    ) -> Result<(Vec<TaskRecord>, Vec<IntermediateRecord>)> {
        let plan = self.plan(goal)?;
        let rows = self.permutation_rows(&plan.sop, &plan.leaves);
        let expanded_hash = plan
            .sop
            .expanded
            .as_ref()
            .map(Constraint::hash)
            .unwrap_or_default();

        let mut tasks = Vec::new();
        let mut intermediate = Vec::new();
        for (row, should_succeed) in rows {
            let key = dedup_key(goal, &expanded_hash, &row);
            if !seen.insert(key) {
                debug!(goal, "permutation already emitted");
                continue;
            }

            let index = tasks.len();
            let (generated, manfix_id) = match self.generate(&plan, &row)? {
                Attempt::Verified(generated) => (generated, None),
                Attempt::Exhausted(last) => {
                    let id = format!("{}-{goal}-{index}", self.domain.descriptor().name);
                    warn!(goal, manfix_id = %id, "generation exhausted, needs manual fix");
                    let generated = last.unwrap_or_else(|| GeneratedTask {
                        initial_database: self.domain.default_database(),
                        user_known: Map::new(),
                        constraint_parameters: Map::new(),
                    });
                    (generated, Some(id))
                }
            };

            let user_instruction = self.prompts.render_user_instruction(
                self.domain.descriptor(),
                goal,
                &generated.user_known,
            )?;
            let user_prompt = self.prompts.render_user_system(&user_instruction)?;

            tasks.push(TaskRecord {
                goal: goal.to_string(),
                initial_database: generated.initial_database,
                user_known: generated.user_known,
                constraint_parameters: generated.constraint_parameters,
                dependency: plan.sop.dependency.clone(),
                dependency_original: plan.sop.original.clone(),
                dependency_permutation: plan.sop.expanded.clone(),
                action_should_succeed: should_succeed,
                directed_action_graph: plan.graph.clone(),
                user_instruction,
                user_prompt,
                manfix_id,
            });
            intermediate.push(IntermediateRecord {
                dependency_permutation: row.iter().map(|(k, v)| (k.clone(), v.as_i8())).collect(),
                inv_task_single: InvTaskSingle::from_row(&row),
                user_params: plan.user_params.clone(),
                actions_required: plan.actions_required(),
            });
        }
        Ok((tasks, intermediate))
    }

    /// Ask the generator for a world matching `row`, retrying with the
    /// missed constraints weighted up.
    fn generate(&self, plan: &GoalPlan<'_>, row: &Row) -> Result<Attempt> {
        let example = self.domain.default_database();
        let mut weights: BTreeMap<String, u32> = BTreeMap::new();
        let mut feedback: Option<String> = None;
        let mut last = None;

        for attempt in 1..=self.options.generation_limit {
            let mut constraints = Vec::new();
            let mut unconstrained = Vec::new();
            for (key, truth) in row {
                let Some(single) = plan.leaves.get(key) else {
                    continue;
                };
                match truth.as_bool() {
                    Some(holds) => constraints.push(ConstraintItem {
                        key: key.clone(),
                        text: plan.constraint_text(single, holds),
                        weight: weights.get(key).copied().unwrap_or(0),
                    }),
                    None => unconstrained.push(plan.constraint_text(single, true)),
                }
            }
            constraints.sort_by(|a, b| b.weight.cmp(&a.weight));

            let prompt = self.prompts.render_generation(&GenerationPrompt {
                descriptor: self.domain.descriptor(),
                goal: plan.goal,
                constraints,
                unconstrained,
                user_params: &plan.user_params,
                example_database: &example,
                feedback: feedback.as_deref(),
            })?;
            let raw = self
                .generator
                .generate(&prompt)
                .with_context(|| format!("generate task for {}", plan.goal))?;

            let generated = match parse_generated(&raw) {
                Ok(generated) => generated,
                Err(err) => {
                    debug!(attempt, err = %err, "generation unparseable");
                    feedback = Some(err.to_string());
                    continue;
                }
            };
            match plan.verify(row, &generated) {
                Ok(()) => return Ok(Attempt::Verified(generated)),
                Err(SopError::GenerationSemantic { unsatisfied }) => {
                    debug!(attempt, missed = unsatisfied.len(), "generation unverified");
                    for key in &unsatisfied {
                        *weights.entry(key.clone()).or_default() += 1;
                    }
                    feedback = Some(
                        SopError::GenerationSemantic {
                            unsatisfied: unsatisfied.clone(),
                        }
                        .to_string(),
                    );
                    last = Some(generated);
                }
                Err(err @ SopError::GenerationFormat(_)) => {
                    debug!(attempt, err = %err, "generated database rejected");
                    feedback = Some(err.to_string());
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(Attempt::Exhausted(last))
    }
}

/// Dedup key of a goal's permutation row.
fn dedup_key(goal: &str, expanded_hash: &str, row: &Row) -> String {
    let mut hasher = Sha256::new();
    hasher.update(goal.as_bytes());
    hasher.update(b"\n");
    hasher.update(expanded_hash.as_bytes());
    for (key, truth) in row {
        hasher.update(format!("\n{key}={}", truth.as_i8()).as_bytes());
    }
    hex::encode(hasher.finalize())
}
