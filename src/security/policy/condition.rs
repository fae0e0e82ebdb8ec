//! Boolean condition trees stored as JSON alongside each policy rule.
//!
//! Evaluation is total: unknown attributes resolve to `null`, every
//! comparison involving `null` is false, and type mismatches are false.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

const MAX_DEPTH: usize = 32;
const MAX_NODES: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    True,
    False,
    Eq { attr: String, value: Value },
    Ne { attr: String, value: Value },
    Lt { attr: String, value: Value },
    Le { attr: String, value: Value },
    Gt { attr: String, value: Value },
    Ge { attr: String, value: Value },
    In { attr: String, values: Vec<Value> },
    StartsWith { attr: String, value: String },
    Contains { attr: String, value: Value },
    And { args: Vec<Condition> },
    Or { args: Vec<Condition> },
    Not { arg: Box<Condition> },
}

impl Default for Condition {
    fn default() -> Self {
        Self::True
    }
}

impl Condition {
    pub fn eq(attr: &str, value: impl Into<Value>) -> Self {
        Self::Eq {
            attr: attr.to_string(),
            value: value.into(),
        }
    }

    pub fn ne(attr: &str, value: impl Into<Value>) -> Self {
        Self::Ne {
            attr: attr.to_string(),
            value: value.into(),
        }
    }

    pub fn lt(attr: &str, value: impl Into<Value>) -> Self {
        Self::Lt {
            attr: attr.to_string(),
            value: value.into(),
        }
    }

    pub fn le(attr: &str, value: impl Into<Value>) -> Self {
        Self::Le {
            attr: attr.to_string(),
            value: value.into(),
        }
    }

    pub fn gt(attr: &str, value: impl Into<Value>) -> Self {
        Self::Gt {
            attr: attr.to_string(),
            value: value.into(),
        }
    }

    pub fn ge(attr: &str, value: impl Into<Value>) -> Self {
        Self::Ge {
            attr: attr.to_string(),
            value: value.into(),
        }
    }

    pub fn is_in(attr: &str, values: Vec<Value>) -> Self {
        Self::In {
            attr: attr.to_string(),
            values,
        }
    }

    pub fn starts_with(attr: &str, prefix: &str) -> Self {
        Self::StartsWith {
            attr: attr.to_string(),
            value: prefix.to_string(),
        }
    }

    pub fn contains(attr: &str, value: impl Into<Value>) -> Self {
        Self::Contains {
            attr: attr.to_string(),
            value: value.into(),
        }
    }

    pub fn and(args: Vec<Condition>) -> Self {
        Self::And { args }
    }

    pub fn or(args: Vec<Condition>) -> Self {
        Self::Or { args }
    }

    pub fn negate(arg: Condition) -> Self {
        Self::Not { arg: Box::new(arg) }
    }

    pub fn evaluate(&self, bag: &Map<String, Value>) -> bool {
        match self {
            Self::True => true,
            Self::False => false,
            Self::Eq { attr, value } => {
                let Some(left) = present(bag, attr) else {
                    return false;
                };
                !value.is_null() && values_equal(left, value)
            }
            Self::Ne { attr, value } => {
                let Some(left) = present(bag, attr) else {
                    return false;
                };
                !value.is_null() && !values_equal(left, value)
            }
            Self::Lt { attr, value } => compare(lookup(bag, attr), value) == Some(Ordering::Less),
            Self::Le { attr, value } => matches!(
                compare(lookup(bag, attr), value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::Gt { attr, value } => {
                compare(lookup(bag, attr), value) == Some(Ordering::Greater)
            }
            Self::Ge { attr, value } => matches!(
                compare(lookup(bag, attr), value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::In { attr, values } => {
                let Some(left) = present(bag, attr) else {
                    return false;
                };
                values.iter().any(|v| !v.is_null() && values_equal(left, v))
            }
            Self::StartsWith { attr, value } => match lookup(bag, attr) {
                Some(Value::String(s)) => s.starts_with(value.as_str()),
                _ => false,
            },
            Self::Contains { attr, value } => match (lookup(bag, attr), value) {
                (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) if !needle.is_null() => {
                    items.iter().any(|item| values_equal(item, needle))
                }
                _ => false,
            },
            Self::And { args } => args.iter().all(|c| c.evaluate(bag)),
            Self::Or { args } => args.iter().any(|c| c.evaluate(bag)),
            Self::Not { arg } => !arg.evaluate(bag),
        }
    }

    /// Structural checks applied before a rule is persisted.
    pub fn validate(&self) -> Result<(), String> {
        let mut nodes = 0usize;
        self.validate_at(1, &mut nodes)
    }

    fn validate_at(&self, depth: usize, nodes: &mut usize) -> Result<(), String> {
        *nodes += 1;
        if depth > MAX_DEPTH {
            return Err(format!("condition nested deeper than {MAX_DEPTH}"));
        }
        if *nodes > MAX_NODES {
            return Err(format!("condition has more than {MAX_NODES} nodes"));
        }
        match self {
            Self::True | Self::False => Ok(()),
            Self::Eq { attr, .. }
            | Self::Ne { attr, .. }
            | Self::Lt { attr, .. }
            | Self::Le { attr, .. }
            | Self::Gt { attr, .. }
            | Self::Ge { attr, .. }
            | Self::In { attr, .. }
            | Self::StartsWith { attr, .. }
            | Self::Contains { attr, .. } => validate_attr(attr),
            Self::And { args } | Self::Or { args } => {
                if args.is_empty() {
                    return Err("logical operator with no operands".into());
                }
                args.iter().try_for_each(|c| c.validate_at(depth + 1, nodes))
            }
            Self::Not { arg } => arg.validate_at(depth + 1, nodes),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "true"),
            Self::False => write!(f, "false"),
            Self::Eq { attr, value } => write!(f, "{attr} = {value}"),
            Self::Ne { attr, value } => write!(f, "{attr} != {value}"),
            Self::Lt { attr, value } => write!(f, "{attr} < {value}"),
            Self::Le { attr, value } => write!(f, "{attr} <= {value}"),
            Self::Gt { attr, value } => write!(f, "{attr} > {value}"),
            Self::Ge { attr, value } => write!(f, "{attr} >= {value}"),
            Self::In { attr, values } => write!(f, "{attr} in {}", Value::Array(values.clone())),
            Self::StartsWith { attr, value } => write!(f, "starts_with({attr}, {value:?})"),
            Self::Contains { attr, value } => write!(f, "contains({attr}, {value})"),
            Self::And { args } => write_joined(f, args, " and "),
            Self::Or { args } => write_joined(f, args, " or "),
            Self::Not { arg } => write!(f, "not ({arg})"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, args: &[Condition], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{arg}")?;
    }
    write!(f, ")")
}

fn validate_attr(attr: &str) -> Result<(), String> {
    let valid = !attr.is_empty()
        && attr
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if valid {
        Ok(())
    } else {
        Err(format!("invalid attribute name '{attr}'"))
    }
}

/// Resolves `attr` against the bag: an exact key first, then a dotted path.
fn lookup<'a>(bag: &'a Map<String, Value>, attr: &str) -> Option<&'a Value> {
    if let Some(v) = bag.get(attr) {
        return Some(v);
    }
    let mut segments = attr.split('.');
    let mut current = bag.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// The attribute's value, unless it is missing or null.
fn present<'a>(bag: &'a Map<String, Value>, attr: &str) -> Option<&'a Value> {
    lookup(bag, attr).filter(|v| !v.is_null())
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => left == right,
    }
}

fn compare(left: Option<&Value>, right: &Value) -> Option<Ordering> {
    match (left?, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
