//! Subscription filters: a small predicate tree over signal fields.
//!
//! Documents are JSON objects, compiled once into a [`Filter`]:
//!
//! ```json
//! {
//!   "event_type": {"$wildcard": "signal.input.*"},
//!   "priority": {"$gte": 150},
//!   "$or": [{"is_novel": true}, {"vector.0": {"$lt": 0.5}}]
//! }
//! ```
//!
//! Sibling clauses are AND-ed. A bare scalar means equality. `$wildcard`
//! patterns are dotted segments where `*` stands for one or more whole
//! segments at any position.

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::signal::SignalEvent;

#[derive(Clone, Debug, PartialEq)]
enum Field {
    EventType,
    Priority,
    Timestamp,
    TokenId,
    IsNovel,
    FastPath,
    Vector(usize),
}

impl Field {
    fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "event_type" => Self::EventType,
            "priority" => Self::Priority,
            "timestamp" => Self::Timestamp,
            "token_id" => Self::TokenId,
            "is_novel" => Self::IsNovel,
            "fast_path" => Self::FastPath,
            other => match other.strip_prefix("vector.").map(str::parse::<usize>) {
                Some(Ok(i)) => Self::Vector(i),
                _ => return Err(Error::InvalidFilter(format!("unknown field '{other}'"))),
            },
        })
    }

    fn read<'a>(&self, event: &SignalEvent<'a>) -> Option<FieldValue<'a>> {
        Some(match self {
            Self::EventType => FieldValue::Str(event.event_type),
            Self::Priority => FieldValue::Num(event.priority as f64),
            Self::Timestamp => FieldValue::Num(event.timestamp_ms as f64),
            Self::TokenId => FieldValue::Num(event.token_id as f64),
            Self::IsNovel => FieldValue::Bool(event.is_novel),
            Self::FastPath => FieldValue::Bool(event.fast_path),
            Self::Vector(i) => FieldValue::Num(*event.vector.get(*i)? as f64),
        })
    }
}

/// A field as read off an event, borrowed.
#[derive(Clone, Copy, Debug)]
enum FieldValue<'a> {
    Str(&'a str),
    Num(f64),
    Bool(bool),
}

impl FieldValue<'_> {
    fn as_num(self) -> Option<f64> {
        match self {
            Self::Num(n) => Some(n),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Scalar {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl Scalar {
    fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(Self::Str(s.clone())),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Number(n) => n
                .as_f64()
                .map(Self::Num)
                .ok_or_else(|| Error::InvalidFilter(format!("unrepresentable number {n}"))),
            other => Err(Error::InvalidFilter(format!("expected a scalar, got {other}"))),
        }
    }

    fn matches(&self, value: FieldValue<'_>) -> bool {
        match (self, value) {
            (Self::Str(a), FieldValue::Str(b)) => a == b,
            (Self::Num(a), FieldValue::Num(b)) => *a == b,
            (Self::Bool(a), FieldValue::Bool(b)) => *a == b,
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
enum Cond {
    Eq(Scalar),
    Ne(Scalar),
    Gt(f64),
    Gte(f64),
    Lt(f64),
    Lte(f64),
    In(Vec<Scalar>),
    Wildcard(Pattern),
}

impl Cond {
    /// `value` is `None` when the field does not exist on the event.
    fn test(&self, value: Option<FieldValue<'_>>) -> bool {
        let Some(value) = value else {
            return matches!(self, Self::Ne(_));
        };
        match self {
            Self::Eq(expected) => expected.matches(value),
            Self::Ne(expected) => !expected.matches(value),
            Self::Gt(t) => value.as_num().is_some_and(|v| v > *t),
            Self::Gte(t) => value.as_num().is_some_and(|v| v >= *t),
            Self::Lt(t) => value.as_num().is_some_and(|v| v < *t),
            Self::Lte(t) => value.as_num().is_some_and(|v| v <= *t),
            Self::In(options) => options.iter().any(|o| o.matches(value)),
            Self::Wildcard(pattern) => match value {
                FieldValue::Str(s) => pattern.matches(s),
                _ => false,
            },
        }
    }
}

#[derive(Clone, Debug)]
enum Node {
    All(Vec<Node>),
    Any(Vec<Node>),
    Not(Box<Node>),
    Field(Field, Vec<Cond>),
}

impl Node {
    fn eval(&self, event: &SignalEvent<'_>) -> bool {
        match self {
            Self::All(nodes) => nodes.iter().all(|n| n.eval(event)),
            Self::Any(nodes) => nodes.iter().any(|n| n.eval(event)),
            Self::Not(node) => !node.eval(event),
            Self::Field(field, conds) => {
                let value = field.read(event);
                conds.iter().all(|c| c.test(value))
            }
        }
    }
}

/// A compiled subscription filter.
#[derive(Clone, Debug)]
pub struct Filter {
    root: Node,
}

impl Filter {
    /// The filter that matches every event.
    pub fn any() -> Self {
        Self {
            root: Node::All(Vec::new()),
        }
    }

    /// Compile a JSON filter document. `reserved` lists segments that `*`
    /// never expands over.
    pub fn compile(doc: &Value, reserved: &[String]) -> Result<Self> {
        let object = doc
            .as_object()
            .ok_or_else(|| Error::InvalidFilter("filter must be an object".into()))?;
        Ok(Self {
            root: compile_object(object, reserved)?,
        })
    }

    pub fn matches(&self, event: &SignalEvent<'_>) -> bool {
        self.root.eval(event)
    }
}

fn compile_object(object: &Map<String, Value>, reserved: &[String]) -> Result<Node> {
    let mut clauses = Vec::with_capacity(object.len());
    for (key, value) in object {
        let node = match key.as_str() {
            "$and" => Node::All(compile_list(key, value, reserved)?),
            "$or" => Node::Any(compile_list(key, value, reserved)?),
            "$not" => {
                let inner = value
                    .as_object()
                    .ok_or_else(|| Error::InvalidFilter("$not expects an object".into()))?;
                Node::Not(Box::new(compile_object(inner, reserved)?))
            }
            op if op.starts_with('$') => {
                return Err(Error::InvalidFilter(format!("unknown operator '{op}'")));
            }
            field => Node::Field(Field::parse(field)?, compile_conditions(value, reserved)?),
        };
        clauses.push(node);
    }
    Ok(Node::All(clauses))
}

fn compile_list(op: &str, value: &Value, reserved: &[String]) -> Result<Vec<Node>> {
    let items = value
        .as_array()
        .ok_or_else(|| Error::InvalidFilter(format!("{op} expects an array")))?;
    items
        .iter()
        .map(|item| {
            item.as_object()
                .ok_or_else(|| Error::InvalidFilter(format!("{op} items must be objects")))
                .and_then(|o| compile_object(o, reserved))
        })
        .collect()
}

fn compile_conditions(value: &Value, reserved: &[String]) -> Result<Vec<Cond>> {
    let Some(ops) = value.as_object() else {
        return Ok(vec![Cond::Eq(Scalar::from_json(value)?)]);
    };
    if ops.is_empty() {
        return Err(Error::InvalidFilter("empty operator object".into()));
    }
    ops.iter()
        .map(|(op, arg)| {
            Ok(match op.as_str() {
                "$eq" => Cond::Eq(Scalar::from_json(arg)?),
                "$ne" => Cond::Ne(Scalar::from_json(arg)?),
                "$gt" => Cond::Gt(number(op, arg)?),
                "$gte" => Cond::Gte(number(op, arg)?),
                "$lt" => Cond::Lt(number(op, arg)?),
                "$lte" => Cond::Lte(number(op, arg)?),
                "$in" => Cond::In(
                    arg.as_array()
                        .ok_or_else(|| Error::InvalidFilter("$in expects an array".into()))?
                        .iter()
                        .map(Scalar::from_json)
                        .collect::<Result<_>>()?,
                ),
                "$wildcard" => {
                    let pattern = arg
                        .as_str()
                        .ok_or_else(|| Error::InvalidFilter("$wildcard expects a string".into()))?;
                    Cond::Wildcard(Pattern::compile(pattern, reserved)?)
                }
                other => return Err(Error::InvalidFilter(format!("unknown operator '{other}'"))),
            })
        })
        .collect()
}

fn number(op: &str, arg: &Value) -> Result<f64> {
    arg.as_f64()
        .ok_or_else(|| Error::InvalidFilter(format!("{op} expects a number, got {arg}")))
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Literal(String),
    Any,
}

/// Segment-wise glob over dotted names.
#[derive(Clone, Debug, PartialEq)]
pub struct Pattern {
    segments: Vec<Segment>,
    reserved: Vec<String>,
}

impl Pattern {
    pub fn compile(pattern: &str, reserved: &[String]) -> Result<Self> {
        let pattern = pattern.trim().to_ascii_lowercase();
        let segments = pattern
            .split('.')
            .map(|seg| match seg {
                "" => Err(Error::InvalidFilter(format!("empty segment in pattern '{pattern}'"))),
                "*" => Ok(Segment::Any),
                s if s.contains('*') => Err(Error::InvalidFilter(format!(
                    "'*' must be a whole segment in pattern '{pattern}'"
                ))),
                s => Ok(Segment::Literal(s.to_string())),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            segments,
            reserved: reserved.to_vec(),
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.match_from(0, Some(name))
    }

    /// `rest` is the unmatched tail of the name, `None` once it is used up.
    fn match_from(&self, at: usize, rest: Option<&str>) -> bool {
        match self.segments.get(at) {
            None => rest.is_none(),
            Some(Segment::Literal(lit)) => {
                let Some(rest) = rest else { return false };
                let (head, tail) = split_head(rest);
                head == lit.as_str() && self.match_from(at + 1, tail)
            }
            Some(Segment::Any) => {
                let mut rest = rest;
                while let Some(r) = rest {
                    let (head, tail) = split_head(r);
                    if self.reserved.iter().any(|x| x == head) {
                        return false;
                    }
                    if self.match_from(at + 1, tail) {
                        return true;
                    }
                    rest = tail;
                }
                false
            }
        }
    }
}

fn split_head(name: &str) -> (&str, Option<&str>) {
    match name.split_once('.') {
        Some((head, tail)) => (head, Some(tail)),
        None => (name, None),
    }
}
