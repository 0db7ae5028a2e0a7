//! Directed action graph: which calls must precede the goal, and in what order.
//!
//! Node 0 is the goal action. `connections[i]` lists the nodes that must be
//! satisfied before node `i`. Relation nodes combine their successors with
//! `and`/`or`; an action node depends on at most one successor. After
//! [`ActionGraph::renumbered`] every edge points from a smaller to a larger
//! index, so executing action nodes from the highest index down replays a
//! valid plan.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::constraint::{Args, Constraint, Relation, Single};
use super::descriptor::{DefaultOption, DomainDescriptor};
use super::expand::LinkScratchpad;
use crate::error::SopError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphRelation {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "NodeRepr", into = "NodeRepr")]
pub enum DagNode {
    Relation(GraphRelation),
    Action { name: String, args: Args },
}

/// Wire form: `"and"`/`"or"` or `[action_name, {param: symbol}]`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum NodeRepr {
    Relation(GraphRelation),
    Action(String, Args),
}

impl From<NodeRepr> for DagNode {
    fn from(repr: NodeRepr) -> Self {
        match repr {
            NodeRepr::Relation(relation) => DagNode::Relation(relation),
            NodeRepr::Action(name, args) => DagNode::Action { name, args },
        }
    }
}

impl From<DagNode> for NodeRepr {
    fn from(node: DagNode) -> Self {
        match node {
            DagNode::Relation(relation) => NodeRepr::Relation(relation),
            DagNode::Action { name, args } => NodeRepr::Action(name, args),
        }
    }
}

impl DagNode {
    pub fn action(name: impl Into<String>, args: Args) -> Self {
        DagNode::Action {
            name: name.into(),
            args,
        }
    }

    pub fn is_action(&self) -> bool {
        matches!(self, DagNode::Action { .. })
    }

    fn label(&self) -> String {
        match self {
            DagNode::Relation(GraphRelation::And) => "and".to_string(),
            DagNode::Relation(GraphRelation::Or) => "or".to_string(),
            DagNode::Action { name, args } => Single::new(name.clone(), args.clone()).key(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionGraph {
    pub nodes: Vec<DagNode>,
    pub connections: Vec<BTreeSet<usize>>,
}

/// Nested form of a graph; shared nodes appear once per parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagTree {
    pub node: DagNode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DagTree>,
}

/// Memo for [`same_and_or_node`], keyed by `(node in a, node in b)`.
pub type SameNodeMemo = BTreeMap<(usize, usize), bool>;

/// Structural equality of node `i` of `a` and node `j` of `b`.
///
/// Actions compare by name and arguments; relations by label and a
/// one-to-one matching of their successors. Relation successors never change
/// once a node exists and action equality ignores successors, so a memo stays
/// valid while `b` grows.
pub fn same_and_or_node(
    a: &ActionGraph,
    i: usize,
    b: &ActionGraph,
    j: usize,
    memo: &mut SameNodeMemo,
) -> bool {
    if let Some(&known) = memo.get(&(i, j)) {
        return known;
    }
    let same = match (&a.nodes[i], &b.nodes[j]) {
        (DagNode::Action { .. }, DagNode::Action { .. }) => a.nodes[i] == b.nodes[j],
        (DagNode::Relation(left), DagNode::Relation(right)) if left == right => {
            same_successors(a, &a.connections[i], b, &b.connections[j], memo)
        }
        _ => false,
    };
    memo.insert((i, j), same);
    same
}

/// One-to-one matching of `left` (nodes of `a`) onto `right` (nodes of `b`).
fn same_successors(
    a: &ActionGraph,
    left: &BTreeSet<usize>,
    b: &ActionGraph,
    right: &BTreeSet<usize>,
    memo: &mut SameNodeMemo,
) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let right: Vec<usize> = right.iter().copied().collect();
    let mut used = vec![false; right.len()];
    left.iter().all(|&l| {
        let found = (0..right.len()).find(|&pos| !used[pos] && same_and_or_node(a, l, b, right[pos], memo));
        match found {
            Some(pos) => {
                used[pos] = true;
                true
            }
            None => false,
        }
    })
}

impl ActionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_node(&mut self, node: DagNode) -> usize {
        self.nodes.push(node);
        self.connections.push(BTreeSet::new());
        self.nodes.len() - 1
    }

    pub fn connect(&mut self, from: usize, to: usize) {
        self.connections[from].insert(to);
    }

    pub fn successors(&self, idx: usize) -> &BTreeSet<usize> {
        &self.connections[idx]
    }

    pub fn is_leaf(&self, idx: usize) -> bool {
        self.connections[idx].is_empty()
    }

    fn find_relation(&self, relation: GraphRelation, children: &BTreeSet<usize>) -> Option<usize> {
        let mut memo = SameNodeMemo::new();
        (0..self.nodes.len()).find(|&idx| {
            self.nodes[idx] == DagNode::Relation(relation)
                && same_successors(self, children, self, &self.connections[idx], &mut memo)
        })
    }

    /// Find or create a relation node over `children`, splicing children that
    /// are themselves relations of the same kind.
    fn add_relation(&mut self, relation: GraphRelation, children: BTreeSet<usize>) -> Option<usize> {
        let mut flat = BTreeSet::new();
        for child in children {
            if self.nodes[child] == DagNode::Relation(relation) {
                flat.extend(self.connections[child].iter().copied());
            } else {
                flat.insert(child);
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.into_iter().next(),
            _ => Some(match self.find_relation(relation, &flat) {
                Some(idx) => idx,
                None => {
                    let idx = self.add_node(DagNode::Relation(relation));
                    self.connections[idx] = flat;
                    idx
                }
            }),
        }
    }

    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(idx) = stack.pop() {
            if idx == to {
                return true;
            }
            if seen.insert(idx) {
                stack.extend(self.connections[idx].iter().copied());
            }
        }
        false
    }

    /// Make action `action` additionally depend on `requirement`. An action
    /// that already depends on something gets an `and` of both.
    fn add_requirement(&mut self, action: usize, requirement: usize) {
        if action == requirement || self.connections[action].contains(&requirement) {
            return;
        }
        if self.reaches(requirement, action) {
            debug!(action, requirement, "requirement would close a cycle, dropped");
            return;
        }
        let current: Vec<usize> = self.connections[action].iter().copied().collect();
        let merged = match current.as_slice() {
            [] => Some(requirement),
            [existing] => {
                self.add_relation(GraphRelation::And, BTreeSet::from([*existing, requirement]))
            }
            many => {
                let mut children: BTreeSet<usize> = many.iter().copied().collect();
                children.insert(requirement);
                self.add_relation(GraphRelation::And, children)
            }
        };
        self.connections[action] = merged.into_iter().collect();
    }

    /// Insert the subgraph of `part` rooted at `root`, reusing structurally
    /// equal nodes. Returns the index of the inserted root, or `None` when the
    /// part reduces to nothing.
    pub fn update_graph(&mut self, part: &ActionGraph, root: usize) -> Option<usize> {
        let mut mapped = BTreeMap::new();
        let mut memo = SameNodeMemo::new();
        self.intern(part, root, &mut mapped, &mut memo)
    }

    fn intern(
        &mut self,
        part: &ActionGraph,
        idx: usize,
        mapped: &mut BTreeMap<usize, Option<usize>>,
        memo: &mut SameNodeMemo,
    ) -> Option<usize> {
        if let Some(known) = mapped.get(&idx) {
            return *known;
        }
        let children: BTreeSet<usize> = part.connections[idx]
            .iter()
            .filter_map(|&child| self.intern(part, child, mapped, memo))
            .collect();

        let result = match &part.nodes[idx] {
            node @ DagNode::Action { .. } => {
                let existing = (0..self.nodes.len()).find(|&j| same_and_or_node(part, idx, self, j, memo));
                let target = match existing {
                    Some(existing) => existing,
                    None => self.add_node(node.clone()),
                };
                for child in children {
                    self.add_requirement(target, child);
                }
                Some(target)
            }
            DagNode::Relation(relation) => {
                match (0..self.nodes.len()).find(|&j| same_and_or_node(part, idx, self, j, memo)) {
                    Some(existing) => Some(existing),
                    None => self.add_relation(*relation, children),
                }
            }
        };
        mapped.insert(idx, result);
        result
    }

    /// Canonical form: single-successor relations bypassed, equal nodes
    /// merged, unreachable nodes dropped, nodes renumbered.
    pub fn prune_ifg(&self) -> ActionGraph {
        if self.is_empty() {
            return ActionGraph::new();
        }
        let mut out = ActionGraph::new();
        match out.update_graph(self, 0) {
            Some(root) => out.renumbered(root),
            None => ActionGraph::new(),
        }
    }

    /// Renumber nodes reachable from `root` so that `root` is 0 and every
    /// edge points to a larger index.
    ///
    /// Order: non-leaves before leaves, then by longest distance from the
    /// root, relations before actions, then by name and arguments.
    pub fn renumbered(&self, root: usize) -> ActionGraph {
        let order = self.topological_from(root);
        let mut distance: BTreeMap<usize, usize> = BTreeMap::from([(root, 0)]);
        for &idx in &order {
            let here = distance.get(&idx).copied().unwrap_or(0);
            for &child in &self.connections[idx] {
                let entry = distance.entry(child).or_insert(0);
                *entry = (*entry).max(here + 1);
            }
        }

        let mut signatures = BTreeMap::new();
        let mut keyed: Vec<(bool, usize, bool, String, usize)> = order
            .iter()
            .map(|&idx| {
                (
                    self.is_leaf(idx) && idx != root,
                    distance.get(&idx).copied().unwrap_or(0),
                    self.nodes[idx].is_action(),
                    self.signature(idx, &mut signatures),
                    idx,
                )
            })
            .collect();
        keyed.sort();

        let new_index: BTreeMap<usize, usize> = keyed
            .iter()
            .enumerate()
            .map(|(new, key)| (key.4, new))
            .collect();
        let mut out = ActionGraph::new();
        for key in &keyed {
            out.add_node(self.nodes[key.4].clone());
        }
        for key in &keyed {
            let from = new_index[&key.4];
            out.connections[from] = self.connections[key.4]
                .iter()
                .filter_map(|child| new_index.get(child).copied())
                .collect();
        }
        out
    }

    /// Reverse post-order from `root`: parents before children.
    fn topological_from(&self, root: usize) -> Vec<usize> {
        fn visit(graph: &ActionGraph, idx: usize, seen: &mut BTreeSet<usize>, out: &mut Vec<usize>) {
            if !seen.insert(idx) {
                return;
            }
            for &child in &graph.connections[idx] {
                visit(graph, child, seen, out);
            }
            out.push(idx);
        }
        let mut out = Vec::new();
        visit(self, root, &mut BTreeSet::new(), &mut out);
        out.reverse();
        out
    }

    /// Structural identity of a node, independent of its index.
    fn signature(&self, idx: usize, memo: &mut BTreeMap<usize, String>) -> String {
        if let Some(known) = memo.get(&idx) {
            return known.clone();
        }
        let label = self.nodes[idx].label();
        let signature = if self.nodes[idx].is_action() {
            label
        } else {
            let mut children: Vec<String> = self.connections[idx]
                .iter()
                .map(|&child| self.signature(child, memo))
                .collect();
            children.sort();
            format!("{label}[{}]", children.join(","))
        };
        memo.insert(idx, signature.clone());
        signature
    }

    /// Structural problems, empty when the graph is well formed.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.connections.len() != self.nodes.len() {
            errors.push(format!(
                "{} nodes but {} connection lists",
                self.nodes.len(),
                self.connections.len()
            ));
            return errors;
        }
        for (idx, children) in self.connections.iter().enumerate() {
            for &child in children {
                if child >= self.nodes.len() {
                    errors.push(format!("node {idx}: successor {child} out of range"));
                } else if child <= idx {
                    errors.push(format!("node {idx}: successor {child} is not numbered after it"));
                }
            }
            match &self.nodes[idx] {
                DagNode::Relation(_) if children.is_empty() => {
                    errors.push(format!("node {idx}: relation without successors"));
                }
                DagNode::Action { name, .. } if children.len() > 1 => {
                    errors.push(format!("node {idx}: action {name} has {} successors", children.len()));
                }
                _ => {}
            }
        }
        if let Some(DagNode::Relation(_)) = self.nodes.first() {
            errors.push("node 0 must be the goal action".to_string());
        }
        if !self.is_empty() && errors.is_empty() {
            let reachable: BTreeSet<usize> = self.topological_from(0).into_iter().collect();
            for idx in 0..self.nodes.len() {
                if !reachable.contains(&idx) {
                    errors.push(format!("node {idx}: unreachable from the goal"));
                }
            }
        }
        errors
    }

    /// Nested view rooted at the goal.
    pub fn to_tree(&self) -> Option<DagTree> {
        fn build(graph: &ActionGraph, idx: usize) -> DagTree {
            DagTree {
                node: graph.nodes[idx].clone(),
                children: graph.connections[idx]
                    .iter()
                    .map(|&child| build(graph, child))
                    .collect(),
            }
        }
        (!self.is_empty()).then(|| build(self, 0))
    }

    /// Rebuild a canonical graph from its nested view.
    pub fn from_tree(tree: &DagTree) -> ActionGraph {
        fn flatten(tree: &DagTree, graph: &mut ActionGraph) -> usize {
            let idx = graph.add_node(tree.node.clone());
            for child in &tree.children {
                let child_idx = flatten(child, graph);
                graph.connect(idx, child_idx);
            }
            idx
        }
        let mut raw = ActionGraph::new();
        flatten(tree, &mut raw);
        raw.prune_ifg()
    }

    /// Action calls that satisfy every prerequisite of the goal, leaves first.
    /// The goal itself is not included.
    pub fn oracle_plan(&self) -> Vec<(String, Args)> {
        (1..self.nodes.len())
            .rev()
            .filter_map(|idx| match &self.nodes[idx] {
                DagNode::Action { name, args } => Some((name.clone(), args.clone())),
                DagNode::Relation(_) => None,
            })
            .collect()
    }

    /// Indices of action nodes calling `name`.
    pub fn action_nodes(&self, name: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(idx, node)| match node {
                DagNode::Action { name: n, .. } if n == name => Some(idx),
                _ => None,
            })
            .collect()
    }
}

struct Part {
    graph: ActionGraph,
    root: usize,
    /// Built from a negated link: the surrounding relation flips.
    inverted: bool,
}

impl Part {
    fn new(graph: ActionGraph, root: usize) -> Self {
        Self {
            graph,
            root,
            inverted: false,
        }
    }
}

/// Builds graphs from raw SOPs, leaves up.
struct DagBuilder<'a> {
    domain: &'a DomainDescriptor,
    default_option: DefaultOption,
    scratchpad: &'a mut LinkScratchpad,
    path: Vec<String>,
}

impl DagBuilder<'_> {
    fn enter(&mut self, name: &str) -> Result<(), SopError> {
        if self.path.iter().any(|seen| seen == name) {
            let mut path = self.path.clone();
            path.push(name.to_string());
            return Err(SopError::CycleDetected { path });
        }
        self.path.push(name.to_string());
        Ok(())
    }

    fn build(&mut self, tree: &Constraint) -> Result<Option<Part>, SopError> {
        match tree {
            Constraint::Single(single) => self.build_single(single),
            Constraint::Op(relation, children) => {
                let mut parts = Vec::with_capacity(children.len());
                for child in children {
                    parts.push(self.build(child)?);
                }
                // The graph only names positive calls, so a negated link
                // shows up as the opposite relation over its action.
                let flipped = parts.iter().flatten().any(|part| part.inverted);
                Ok(match relation {
                    Relation::Chain => parts
                        .into_iter()
                        .flatten()
                        .fold(None, |acc, part| match acc {
                            None => Some(part),
                            Some(prev) => {
                                // Only the last link of a chain carries polarity.
                                let inverted = part.inverted;
                                let mut chained = chain_parts(prev, part);
                                chained.inverted = inverted;
                                Some(chained)
                            }
                        }),
                    Relation::And | Relation::Or | Relation::Gate => {
                        let conjunctive = (*relation == Relation::And) != flipped;
                        if conjunctive || flipped {
                            let kind = if conjunctive {
                                GraphRelation::And
                            } else {
                                GraphRelation::Or
                            };
                            relation_part(kind, parts.into_iter().flatten())
                        } else if parts.iter().any(Option::is_none) {
                            // A branch without calls can hold on its own.
                            None
                        } else {
                            relation_part(GraphRelation::Or, parts.into_iter().flatten())
                        }
                    }
                })
            }
        }
    }

    fn build_single(&mut self, single: &Single) -> Result<Option<Part>, SopError> {
        if let Some(link) = self.domain.link(&single.name).cloned() {
            let params = self.domain.parameters(&link.action);
            let mapped = self.scratchpad.map_link(&single.positive(), &link, &params);
            let mut part = self.action_part(&link.action, mapped)?;
            part.inverted = single.negated;
            return Ok(Some(part));
        }
        if single.negated {
            return Ok(None);
        }
        if let Some(process) = self.domain.process(&single.name) {
            self.enter(&single.name)?;
            let part = self.build(&process.substitute_params(&single.args))?;
            self.path.pop();
            return Ok(part);
        }
        if self.domain.is_action(&single.name) {
            return self.action_part(&single.name, single.args.clone()).map(Some);
        }
        Ok(None)
    }

    fn action_part(&mut self, name: &str, args: Args) -> Result<Part, SopError> {
        self.enter(name)?;
        let mut graph = ActionGraph::new();
        let root = graph.add_node(DagNode::action(name, args.clone()));
        if let Some(deps) = self.domain.default_deps(name, self.default_option)
            && let Some(sub) = self.build(&deps.substitute_params(&args))?
            && let Some(requirement) = graph.update_graph(&sub.graph, sub.root)
        {
            graph.add_requirement(root, requirement);
        }
        self.path.pop();
        Ok(Part::new(graph, root))
    }
}

fn relation_part(relation: GraphRelation, parts: impl Iterator<Item = Part>) -> Option<Part> {
    let mut graph = ActionGraph::new();
    let mut children = BTreeSet::new();
    for part in parts {
        if let Some(idx) = graph.update_graph(&part.graph, part.root) {
            children.insert(idx);
        }
    }
    let root = graph.add_relation(relation, children)?;
    Some(Part::new(graph, root))
}

/// `cur` may only start once `prev` is satisfied.
fn chain_parts(prev: Part, cur: Part) -> Part {
    let Part {
        mut graph, root, ..
    } = cur;
    let Some(requirement) = graph.update_graph(&prev.graph, prev.root) else {
        return Part::new(graph, root);
    };
    if requirement == root {
        return Part::new(graph, root);
    }
    if graph.nodes[root].is_action() {
        graph.add_requirement(root, requirement);
        Part::new(graph, root)
    } else {
        let root = graph
            .add_relation(GraphRelation::And, BTreeSet::from([root, requirement]))
            .unwrap_or(root);
        Part::new(graph, root)
    }
}

/// Build the canonical graph of `goal` under the raw SOP `sop`.
pub fn build_action_graph(
    goal: &str,
    sop: Option<&Constraint>,
    domain: &DomainDescriptor,
    default_option: DefaultOption,
    scratchpad: &mut LinkScratchpad,
) -> Result<ActionGraph, SopError> {
    let params = domain.parameters(goal);
    let goal_args: Args = params.iter().map(|p| (p.clone(), p.clone())).collect();
    let mut graph = ActionGraph::new();
    let root = graph.add_node(DagNode::action(goal, goal_args));

    let mut builder = DagBuilder {
        domain,
        default_option,
        scratchpad,
        path: vec![goal.to_string()],
    };
    if let Some(sop) = sop
        && let Some(part) = builder.build(sop)?
        && let Some(requirement) = graph.update_graph(&part.graph, part.root)
    {
        graph.add_requirement(root, requirement);
    }

    let graph = graph.prune_ifg();
    debug!(goal, nodes = graph.len(), "built action graph");
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn act(name: &str) -> DagNode {
        DagNode::action(name, Args::from([("u".to_string(), "u".to_string())]))
    }

    fn graph(nodes: Vec<DagNode>, edges: &[(usize, usize)]) -> ActionGraph {
        let mut g = ActionGraph::new();
        for node in nodes {
            g.add_node(node);
        }
        for &(from, to) in edges {
            g.connect(from, to);
        }
        g
    }

    #[test]
    fn prune_bypasses_single_successor_relations() {
        let g = graph(
            vec![act("goal"), DagNode::Relation(GraphRelation::And), act("login")],
            &[(0, 1), (1, 2)],
        );
        let pruned = g.prune_ifg();
        assert_eq!(pruned.nodes, vec![act("goal"), act("login")]);
        assert_eq!(pruned.connections[0], BTreeSet::from([1]));
        assert!(pruned.validate().is_empty());
    }

    #[test]
    fn prune_merges_duplicate_actions() {
        let g = graph(
            vec![
                act("goal"),
                DagNode::Relation(GraphRelation::And),
                act("auth"),
                act("login"),
                act("login"),
            ],
            &[(0, 1), (1, 2), (1, 3), (2, 4)],
        );
        let pruned = g.prune_ifg();
        assert_eq!(pruned.action_nodes("login").len(), 1);
        assert!(pruned.validate().is_empty());
        let plan: Vec<String> = pruned.oracle_plan().into_iter().map(|(n, _)| n).collect();
        assert_eq!(plan, vec!["login", "auth"]);
    }

    #[test]
    fn renumbering_puts_relations_first_and_leaves_last() {
        let g = graph(
            vec![
                act("goal"),
                act("zeta"),
                DagNode::Relation(GraphRelation::Or),
                act("alpha"),
                act("beta"),
            ],
            &[(0, 2), (2, 1), (2, 3), (1, 4)],
        );
        let pruned = g.prune_ifg();
        assert_eq!(pruned.nodes[0], act("goal"));
        assert_eq!(pruned.nodes[1], DagNode::Relation(GraphRelation::Or));
        assert_eq!(pruned.nodes[2], act("zeta"));
        assert_eq!(pruned.nodes[3], act("alpha"));
        assert_eq!(pruned.nodes[4], act("beta"));
        assert!(pruned.validate().is_empty());
    }

    #[test]
    fn tree_round_trip_is_identity_on_canonical_graphs() {
        let g = graph(
            vec![
                act("goal"),
                DagNode::Relation(GraphRelation::And),
                act("auth"),
                act("login"),
            ],
            &[(0, 1), (1, 2), (1, 3), (2, 3)],
        )
        .prune_ifg();
        let tree = g.to_tree().unwrap();
        assert_eq!(ActionGraph::from_tree(&tree), g);
    }

    #[test]
    fn same_and_or_node_matches_across_graphs() {
        let a = graph(
            vec![DagNode::Relation(GraphRelation::Or), act("x"), act("y")],
            &[(0, 1), (0, 2)],
        );
        let b = graph(
            vec![act("y"), act("x"), DagNode::Relation(GraphRelation::Or)],
            &[(2, 0), (2, 1)],
        );
        let mut memo = SameNodeMemo::new();
        assert!(same_and_or_node(&a, 0, &b, 2, &mut memo));
        let mut memo = SameNodeMemo::new();
        assert!(!same_and_or_node(&a, 1, &b, 0, &mut memo));
    }

    const LINKED: &str = r#"{
        "name": "linked",
        "actions": {
            "login": {"parameters": ["user"], "description": "log in"},
            "authenticate": {"parameters": ["user"], "description": "authenticate"},
            "pay": {"parameters": ["user"], "description": "pay"}
        },
        "constraint_links": {
            "logged_in": {"action": "login", "param_mapping": {"user": "user"}},
            "authenticated": {"action": "authenticate", "param_mapping": {"user": "user"}}
        }
    }"#;

    fn linked_graph(sop: &Constraint) -> ActionGraph {
        let descriptor = DomainDescriptor::from_json(LINKED).unwrap();
        let mut pad = LinkScratchpad::new();
        build_action_graph("pay", Some(sop), &descriptor, DefaultOption::Required, &mut pad).unwrap()
    }

    #[test]
    fn negated_link_keeps_its_action_and_flips_the_relation() {
        let logged_in = Constraint::single("logged_in", &[("user", "user")]);
        let authenticated = Constraint::single("authenticated", &[("user", "user")]);

        let g = linked_graph(&Constraint::and(vec![logged_in.clone(), authenticated.clone().not()]));
        assert!(g.validate().is_empty(), "{:?}", g.validate());
        assert_eq!(g.action_nodes("login").len(), 1);
        assert_eq!(g.action_nodes("authenticate").len(), 1);
        assert_eq!(g.nodes[1], DagNode::Relation(GraphRelation::Or));
        assert_eq!(g.connections[0], BTreeSet::from([1]));
        assert_eq!(g.connections[1].len(), 2);

        let g = linked_graph(&Constraint::or(vec![logged_in.clone(), authenticated.not()]));
        assert_eq!(g.nodes[1], DagNode::Relation(GraphRelation::And));
        assert_eq!(g.connections[1].len(), 2);

        let plain = linked_graph(&Constraint::and(vec![
            logged_in,
            Constraint::single("authenticated", &[("user", "user")]),
        ]));
        assert_eq!(plain.nodes[1], DagNode::Relation(GraphRelation::And));
    }

    #[test]
    fn update_graph_reuses_structurally_equal_relations() {
        let part = graph(
            vec![DagNode::Relation(GraphRelation::Or), act("y"), act("x")],
            &[(0, 1), (0, 2)],
        );
        let mut g = graph(
            vec![act("x"), act("y"), DagNode::Relation(GraphRelation::Or)],
            &[(2, 0), (2, 1)],
        );
        assert_eq!(g.update_graph(&part, 0), Some(2));
        assert_eq!(g.len(), 3);
        assert_eq!(g.update_graph(&part, 1), Some(1));
    }

    #[test]
    fn validate_reports_problems() {
        let g = graph(
            vec![act("goal"), act("a"), act("b"), DagNode::Relation(GraphRelation::And)],
            &[(0, 1), (0, 2), (2, 1)],
        );
        let errors = g.validate();
        assert!(errors.iter().any(|e| e.contains("has 2 successors")));
        assert!(errors.iter().any(|e| e.contains("not numbered after")));
        assert!(errors.iter().any(|e| e.contains("relation without successors")));
    }

    #[test]
    fn node_wire_format() {
        let g = graph(
            vec![act("goal"), DagNode::Relation(GraphRelation::Or)],
            &[(0, 1)],
        );
        let value = serde_json::to_value(&g).unwrap();
        assert_eq!(value["nodes"][0][0], "goal");
        assert_eq!(value["nodes"][1], "or");
        let back: ActionGraph = serde_json::from_value(value).unwrap();
        assert_eq!(back, g);
    }
}
