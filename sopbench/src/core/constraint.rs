//! Constraint expression trees.
//!
//! A tree is either a leaf (`Single`) or an operator over children. Operators
//! come in four flavours: `and`/`or` evaluate every child, `chain`/`gate`
//! stop at the first child that decides the outcome and leave the rest
//! skipped. Trees are immutable values; every transformation returns a new tree.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::SopError;

/// Arg strings with this prefix are literal values rather than symbols.
pub const LITERAL_PREFIX: &str = "value ";

pub type Args = BTreeMap<String, String>;

/// Operator kind. Declaration order is strictness order: `Chain` is the
/// strictest conjunction, `Or` the loosest disjunction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Chain,
    And,
    Gate,
    Or,
}

impl Relation {
    pub fn as_str(self) -> &'static str {
        match self {
            Relation::Chain => "chain",
            Relation::And => "and",
            Relation::Gate => "gate",
            Relation::Or => "or",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "chain" => Some(Relation::Chain),
            "and" => Some(Relation::And),
            "gate" => Some(Relation::Gate),
            "or" => Some(Relation::Or),
            _ => None,
        }
    }

    /// `chain` and `gate` short-circuit left to right.
    pub fn is_ordered(self) -> bool {
        matches!(self, Relation::Chain | Relation::Gate)
    }

    pub fn is_conjunctive(self) -> bool {
        matches!(self, Relation::Chain | Relation::And)
    }

    fn inverted(self, cl_handle: bool) -> Self {
        match self {
            Relation::And => Relation::Or,
            Relation::Or => Relation::And,
            Relation::Chain if cl_handle => Relation::Chain,
            Relation::Chain => Relation::Gate,
            Relation::Gate if cl_handle => Relation::Gate,
            Relation::Gate => Relation::Chain,
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A leaf: a named predicate or action applied to symbolic arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Single {
    pub name: String,
    pub negated: bool,
    pub args: Args,
}

impl Single {
    pub fn new(name: impl Into<String>, args: Args) -> Self {
        Self {
            name: name.into(),
            negated: false,
            args,
        }
    }

    /// Leaf with each declared parameter bound to a symbol of the same name.
    pub fn identity(name: impl Into<String>, params: &[String]) -> Self {
        let args = params.iter().map(|p| (p.clone(), p.clone())).collect();
        Self::new(name, args)
    }

    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    pub fn positive(&self) -> Single {
        Single {
            name: self.name.clone(),
            negated: false,
            args: self.args.clone(),
        }
    }

    /// Canonical key of the positive leaf. Permutation rows are keyed by it.
    pub fn key(&self) -> String {
        let args = self
            .args
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}({args})", self.name)
    }

    fn hash_string(&self) -> String {
        if self.negated {
            format!("!{}", self.key())
        } else {
            self.key()
        }
    }
}

/// Returns the literal payload when `arg` is a `value ` literal.
pub fn literal_value(arg: &str) -> Option<&str> {
    arg.strip_prefix(LITERAL_PREFIX)
}

/// Parse a literal payload into JSON: numbers, booleans and `null` keep
/// their type, anything else is a string.
pub fn literal_to_json(payload: &str) -> Value {
    match serde_json::from_str::<Value>(payload) {
        Ok(value @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => value,
        _ => Value::String(payload.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    Single(Single),
    Op(Relation, Vec<Constraint>),
}

impl Constraint {
    pub fn single(name: impl Into<String>, args: &[(&str, &str)]) -> Self {
        let args = args
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Constraint::Single(Single::new(name, args))
    }

    pub fn not(self) -> Self {
        match self {
            Constraint::Single(single) => Constraint::Single(single.negate()),
            other => other.invert(false),
        }
    }

    pub fn and(children: Vec<Constraint>) -> Self {
        Constraint::Op(Relation::And, children)
    }

    pub fn or(children: Vec<Constraint>) -> Self {
        Constraint::Op(Relation::Or, children)
    }

    pub fn chain(children: Vec<Constraint>) -> Self {
        Constraint::Op(Relation::Chain, children)
    }

    pub fn gate(children: Vec<Constraint>) -> Self {
        Constraint::Op(Relation::Gate, children)
    }

    /// Build an operator node, collapsing a single child to itself.
    pub fn collapse(relation: Relation, mut children: Vec<Constraint>) -> Option<Self> {
        match children.len() {
            0 => None,
            1 => children.pop(),
            _ => Some(Constraint::Op(relation, children)),
        }
    }

    pub fn relation(&self) -> Option<Relation> {
        match self {
            Constraint::Single(_) => None,
            Constraint::Op(relation, _) => Some(*relation),
        }
    }

    /// Logical negation.
    ///
    /// With `cl_handle=false` an ordered operator swaps with its dual
    /// (`chain` <-> `gate`); with `cl_handle=true` it keeps its kind and only
    /// the last child is inverted. That form negates a prerequisite chain
    /// while keeping the prerequisites themselves intact.
    pub fn invert(&self, cl_handle: bool) -> Constraint {
        match self {
            Constraint::Single(single) => Constraint::Single(single.clone().negate()),
            Constraint::Op(relation, children) if relation.is_ordered() => {
                let mut children = children.clone();
                if let Some(last) = children.last_mut() {
                    *last = last.invert(cl_handle);
                }
                Constraint::Op(relation.inverted(cl_handle), children)
            }
            Constraint::Op(relation, children) => Constraint::Op(
                relation.inverted(cl_handle),
                children.iter().map(|c| c.invert(cl_handle)).collect(),
            ),
        }
    }

    /// Rename symbolic arguments: every arg value that is a key of `mapping`
    /// is replaced by the mapped value. Literals are left untouched.
    pub fn substitute_params(&self, mapping: &Args) -> Constraint {
        self.map_singles(&mut |single| {
            let mut single = single.clone();
            for value in single.args.values_mut() {
                if literal_value(value).is_none()
                    && let Some(mapped) = mapping.get(value.as_str())
                {
                    *value = mapped.clone();
                }
            }
            Constraint::Single(single)
        })
    }

    /// Rebuild the tree with every leaf replaced by `f(leaf)`.
    pub fn map_singles<F>(&self, f: &mut F) -> Constraint
    where
        F: FnMut(&Single) -> Constraint,
    {
        match self {
            Constraint::Single(single) => f(single),
            Constraint::Op(relation, children) => Constraint::Op(
                *relation,
                children.iter().map(|c| c.map_singles(f)).collect(),
            ),
        }
    }

    pub fn try_map_singles<F, E>(&self, f: &mut F) -> Result<Constraint, E>
    where
        F: FnMut(&Single) -> Result<Constraint, E>,
    {
        match self {
            Constraint::Single(single) => f(single),
            Constraint::Op(relation, children) => {
                let mapped = children
                    .iter()
                    .map(|c| c.try_map_singles(f))
                    .collect::<Result<Vec<_>, E>>()?;
                Ok(Constraint::Op(*relation, mapped))
            }
        }
    }

    /// Canonical string: `and`/`or` children are sorted by their own hash,
    /// ordered operators keep child order.
    pub fn hash(&self) -> String {
        match self {
            Constraint::Single(single) => single.hash_string(),
            Constraint::Op(relation, children) => {
                let mut parts: Vec<String> = children.iter().map(Constraint::hash).collect();
                if !relation.is_ordered() {
                    parts.sort();
                }
                format!("{relation}[{}]", parts.join(","))
            }
        }
    }

    /// SHA-256 hex digest of the canonical string.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.hash().as_bytes()))
    }

    /// Leaves in first-occurrence order, negation stripped, deduplicated.
    pub fn gather_singles(&self) -> Vec<Single> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        self.visit_singles(&mut |single| {
            let positive = single.positive();
            if seen.insert(positive.key()) {
                out.push(positive);
            }
        });
        out
    }

    /// Leaf keys in first-occurrence order, deduplicated.
    pub fn leaf_keys(&self) -> Vec<String> {
        self.gather_singles().iter().map(Single::key).collect()
    }

    pub fn visit_singles<F>(&self, f: &mut F)
    where
        F: FnMut(&Single),
    {
        match self {
            Constraint::Single(single) => f(single),
            Constraint::Op(_, children) => {
                for child in children {
                    child.visit_singles(f);
                }
            }
        }
    }

    /// Number of leaf occurrences.
    pub fn count_singles(&self) -> usize {
        match self {
            Constraint::Single(_) => 1,
            Constraint::Op(_, children) => children.iter().map(Constraint::count_singles).sum(),
        }
    }

    /// Number of operator nodes of each kind.
    pub fn relation_counts(&self) -> BTreeMap<Relation, usize> {
        fn walk(c: &Constraint, counts: &mut BTreeMap<Relation, usize>) {
            if let Constraint::Op(relation, children) = c {
                *counts.entry(*relation).or_default() += 1;
                for child in children {
                    walk(child, counts);
                }
            }
        }
        let mut counts = BTreeMap::new();
        walk(self, &mut counts);
        counts
    }

    pub fn to_value(&self) -> Value {
        match self {
            Constraint::Single(single) => {
                let args: Map<String, Value> = single
                    .args
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                let leaf = Value::Array(vec![
                    Value::String("single".to_string()),
                    Value::String(single.name.clone()),
                    Value::Object(args),
                ]);
                if single.negated {
                    Value::Array(vec![Value::String("not".to_string()), leaf])
                } else {
                    leaf
                }
            }
            Constraint::Op(relation, children) => Value::Array(vec![
                Value::String(relation.as_str().to_string()),
                Value::Array(children.iter().map(Constraint::to_value).collect()),
            ]),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, SopError> {
        let items = value
            .as_array()
            .ok_or_else(|| SopError::MalformedConstraint(format!("expected array, got {value}")))?;
        let tag = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| SopError::MalformedConstraint(format!("missing operator tag in {value}")))?;

        match tag {
            "single" => {
                let name = items.get(1).and_then(Value::as_str).ok_or_else(|| {
                    SopError::MalformedConstraint(format!("single without name: {value}"))
                })?;
                let args = match items.get(2) {
                    None | Some(Value::Null) => Args::new(),
                    Some(Value::Object(map)) => map
                        .iter()
                        .map(|(k, v)| {
                            let v = match v {
                                Value::String(s) => s.clone(),
                                other => format!("{LITERAL_PREFIX}{other}"),
                            };
                            (k.clone(), v)
                        })
                        .collect(),
                    Some(other) => {
                        return Err(SopError::MalformedConstraint(format!(
                            "args of {name} must be an object, got {other}"
                        )));
                    }
                };
                Ok(Constraint::Single(Single::new(name, args)))
            }
            "not" => {
                let inner = items.get(1).ok_or_else(|| {
                    SopError::MalformedConstraint(format!("not without operand: {value}"))
                })?;
                match Constraint::from_value(inner)? {
                    Constraint::Single(single) => Ok(Constraint::Single(single.negate())),
                    _ => Err(SopError::MalformedConstraint(format!(
                        "not applies to a single leaf only: {value}"
                    ))),
                }
            }
            other => {
                let relation = Relation::from_tag(other)
                    .ok_or_else(|| SopError::InvalidConstraintOption(other.to_string()))?;
                let children = items
                    .get(1)
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        SopError::MalformedConstraint(format!("{other} without child list: {value}"))
                    })?
                    .iter()
                    .map(Constraint::from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Constraint::Op(relation, children))
            }
        }
    }
}

impl Serialize for Constraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Constraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Constraint::from_value(&value).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Single {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            f.write_str("not ")?;
        }
        let args = self
            .args
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{}({args})", self.name)
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Single(single) => single.fmt(f),
            Constraint::Op(relation, children) => {
                write!(f, "{relation}(")?;
                for (idx, child) in children.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    child.fmt(f)?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leaf(name: &str) -> Constraint {
        Constraint::single(name, &[("username", "username")])
    }

    #[test]
    fn json_round_trip_keeps_structure_and_negation() {
        let tree = Constraint::chain(vec![
            leaf("logged_in_user"),
            Constraint::or(vec![leaf("authenticated_admin_password"), leaf("x").not()]),
        ]);
        let value = serde_json::to_value(&tree).unwrap();
        assert_eq!(value[0], "chain");
        assert_eq!(value[1][1][1][1][0], "not");
        let back: Constraint = serde_json::from_value(value).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = Constraint::from_value(&json!(["xor", [["single", "a", {}]]])).unwrap_err();
        assert_eq!(err, SopError::InvalidConstraintOption("xor".to_string()));
    }

    #[test]
    fn non_string_args_become_literals() {
        let tree = Constraint::from_value(&json!(["single", "amount_positive", {"amount": 5}]))
            .unwrap();
        let Constraint::Single(single) = tree else {
            panic!("expected single");
        };
        assert_eq!(single.args["amount"], "value 5");
        assert_eq!(literal_to_json("5"), json!(5));
        assert_eq!(literal_to_json("alice"), json!("alice"));
    }

    #[test]
    fn hash_ignores_order_of_unordered_children_only() {
        let a = leaf("a");
        let b = leaf("b");
        assert_eq!(
            Constraint::and(vec![a.clone(), b.clone()]).hash(),
            Constraint::and(vec![b.clone(), a.clone()]).hash()
        );
        assert_ne!(
            Constraint::chain(vec![a.clone(), b.clone()]).hash(),
            Constraint::chain(vec![b, a]).hash()
        );
    }

    #[test]
    fn invert_chain_flips_last_child_only() {
        let tree = Constraint::chain(vec![leaf("a"), leaf("b")]);
        assert_eq!(
            tree.invert(true),
            Constraint::chain(vec![leaf("a"), leaf("b").not()])
        );
        assert_eq!(
            tree.invert(false),
            Constraint::gate(vec![leaf("a"), leaf("b").not()])
        );
    }

    #[test]
    fn invert_is_an_involution() {
        let tree = Constraint::and(vec![
            Constraint::chain(vec![leaf("a"), Constraint::or(vec![leaf("b"), leaf("c")])]),
            Constraint::gate(vec![leaf("d"), leaf("e").not()]),
        ]);
        for cl_handle in [true, false] {
            assert_eq!(tree.invert(cl_handle).invert(cl_handle), tree);
        }
    }

    #[test]
    fn substitute_params_renames_symbols_not_literals() {
        let tree = Constraint::single(
            "sufficient_account_balance",
            &[("username", "username"), ("amount", "value 10")],
        );
        let mapping: Args = [
            ("username".to_string(), "destination_username".to_string()),
            ("value 10".to_string(), "oops".to_string()),
        ]
        .into_iter()
        .collect();
        let Constraint::Single(single) = tree.substitute_params(&mapping) else {
            panic!("expected single");
        };
        assert_eq!(single.args["username"], "destination_username");
        assert_eq!(single.args["amount"], "value 10");
    }

    #[test]
    fn gather_singles_dedups_and_strips_negation() {
        let tree = Constraint::and(vec![leaf("a").not(), leaf("b"), leaf("a")]);
        let names: Vec<String> = tree.gather_singles().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(tree.count_singles(), 3);
        assert_eq!(tree.relation_counts()[&Relation::And], 1);
    }

    #[test]
    fn display_is_readable() {
        let tree = Constraint::and(vec![leaf("a"), leaf("b").not()]);
        assert_eq!(tree.to_string(), "and(a(username=username), not b(username=username))");
    }
}
