//! Typed value model shared by features and outputs.
//!
//! A [`TypedValue`] is a closed tagged union. Every operation (distance,
//! equality, clamping, mutation) is defined per tag, and comparing values of
//! different tags is a [`ValueError::TypeMismatch`].

use crate::error::ValueError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// The declared tag of a typed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Numeric,
    Integer,
    Categorical,
    Boolean,
    Text,
    Composite,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Numeric => "numeric",
            ValueKind::Integer => "integer",
            ValueKind::Categorical => "categorical",
            ValueKind::Boolean => "boolean",
            ValueKind::Text => "text",
            ValueKind::Composite => "composite",
        };
        f.write_str(name)
    }
}

/// A categorical label: either a string or a numeric code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Category {
    Code(i64),
    Label(String),
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Code(code) => write!(f, "{code}"),
            Category::Label(label) => f.write_str(label),
        }
    }
}

impl From<&str> for Category {
    fn from(label: &str) -> Self {
        Category::Label(label.to_string())
    }
}

impl From<i64> for Category {
    fn from(code: i64) -> Self {
        Category::Code(code)
    }
}

/// A single typed value of a feature or an output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TypedValue {
    Numeric(f64),
    Integer(i64),
    Categorical(Category),
    Boolean(bool),
    Text(String),
    /// Ordered sequence of values, used for structured or time-series fields.
    Composite(Vec<TypedValue>),
}

impl TypedValue {
    /// Build a finite numeric value.
    pub fn numeric(value: f64) -> Result<Self, ValueError> {
        if value.is_finite() {
            Ok(TypedValue::Numeric(value))
        } else {
            Err(ValueError::invalid("numeric", format!("{value} is not finite")))
        }
    }

    pub fn categorical(category: impl Into<Category>) -> Self {
        TypedValue::Categorical(category.into())
    }

    pub fn text(value: impl Into<String>) -> Self {
        TypedValue::Text(value.into())
    }

    /// Construct a value of the declared `kind` from a concrete JSON value.
    ///
    /// Fails with [`ValueError::InvalidValue`] when the JSON value cannot
    /// carry the declared tag.
    pub fn from_json(kind: ValueKind, value: &Value) -> Result<Self, ValueError> {
        let invalid = || ValueError::invalid(kind.to_string(), format!("cannot hold {value}"));
        match kind {
            ValueKind::Numeric => value
                .as_f64()
                .ok_or_else(invalid)
                .and_then(TypedValue::numeric),
            ValueKind::Integer => match value.as_i64() {
                Some(i) => Ok(TypedValue::Integer(i)),
                None => match value.as_f64() {
                    Some(f) if f.is_finite() && f.fract() == 0.0 => {
                        Ok(TypedValue::Integer(f as i64))
                    }
                    _ => Err(invalid()),
                },
            },
            ValueKind::Categorical => match value {
                Value::String(s) => Ok(TypedValue::Categorical(Category::Label(s.clone()))),
                Value::Number(n) => n
                    .as_i64()
                    .map(|code| TypedValue::Categorical(Category::Code(code)))
                    .ok_or_else(invalid),
                _ => Err(invalid()),
            },
            ValueKind::Boolean => value.as_bool().map(TypedValue::Boolean).ok_or_else(invalid),
            ValueKind::Text => value
                .as_str()
                .map(|s| TypedValue::Text(s.to_string()))
                .ok_or_else(invalid),
            ValueKind::Composite => match value {
                Value::Array(items) => items
                    .iter()
                    .map(TypedValue::infer)
                    .collect::<Result<Vec<_>, _>>()
                    .map(TypedValue::Composite),
                _ => Err(invalid()),
            },
        }
    }

    /// Infer the tag of a JSON value: integers become `Integer`, other
    /// numbers `Numeric`, strings `Text`, arrays `Composite`.
    pub fn infer(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::Bool(b) => Ok(TypedValue::Boolean(*b)),
            Value::Number(n) if n.is_i64() => Ok(TypedValue::Integer(n.as_i64().unwrap_or(0))),
            Value::Number(_) => TypedValue::from_json(ValueKind::Numeric, value),
            Value::String(s) => Ok(TypedValue::Text(s.clone())),
            Value::Array(_) => TypedValue::from_json(ValueKind::Composite, value),
            other => Err(ValueError::invalid("untyped", format!("cannot infer type of {other}"))),
        }
    }

    /// Convert back into a plain JSON value (the tag is dropped).
    pub fn to_json(&self) -> Value {
        match self {
            TypedValue::Numeric(v) => serde_json::json!(v),
            TypedValue::Integer(v) => serde_json::json!(v),
            TypedValue::Categorical(Category::Code(code)) => serde_json::json!(code),
            TypedValue::Categorical(Category::Label(label)) => serde_json::json!(label),
            TypedValue::Boolean(v) => serde_json::json!(v),
            TypedValue::Text(v) => serde_json::json!(v),
            TypedValue::Composite(items) => {
                Value::Array(items.iter().map(TypedValue::to_json).collect())
            }
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            TypedValue::Numeric(_) => ValueKind::Numeric,
            TypedValue::Integer(_) => ValueKind::Integer,
            TypedValue::Categorical(_) => ValueKind::Categorical,
            TypedValue::Boolean(_) => ValueKind::Boolean,
            TypedValue::Text(_) => ValueKind::Text,
            TypedValue::Composite(_) => ValueKind::Composite,
        }
    }

    /// Numeric view of `Numeric` and `Integer` values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TypedValue::Numeric(v) => Some(*v),
            TypedValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TypedValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Ensure `other` carries the same tag as `self`.
    pub fn check_same_kind(&self, other: &TypedValue) -> Result<(), ValueError> {
        if self.kind() == other.kind() {
            Ok(())
        } else {
            Err(ValueError::mismatch(self.kind(), other.kind()))
        }
    }

    /// Distance between two values of the same tag.
    ///
    /// `scale` normalizes numeric differences (domain range or observed
    /// spread); a non-positive or non-finite scale falls back to `1.0`.
    /// The result is non-negative, symmetric and zero iff the values are
    /// equal.
    pub fn distance(&self, other: &TypedValue, scale: f64) -> Result<f64, ValueError> {
        self.check_same_kind(other)?;
        let scale = if scale.is_finite() && scale > 0.0 {
            scale
        } else {
            1.0
        };
        let d = match (self, other) {
            (TypedValue::Numeric(a), TypedValue::Numeric(b)) => (a - b).abs() / scale,
            (TypedValue::Integer(a), TypedValue::Integer(b)) => {
                (*a as f64 - *b as f64).abs() / scale
            }
            (TypedValue::Categorical(a), TypedValue::Categorical(b)) => indicator(a == b),
            (TypedValue::Boolean(a), TypedValue::Boolean(b)) => indicator(a == b),
            (TypedValue::Text(a), TypedValue::Text(b)) => normalized_edit_distance(a, b),
            (TypedValue::Composite(a), TypedValue::Composite(b)) => {
                composite_distance(a, b, scale)?
            }
            _ => return Err(ValueError::mismatch(self.kind(), other.kind())),
        };
        Ok(d)
    }
}

fn indicator(equal: bool) -> f64 {
    if equal { 0.0 } else { 1.0 }
}

/// Uniformly weighted element-wise distance. Elements present in only one
/// sequence contribute the maximal per-element distance of `1.0`.
fn composite_distance(a: &[TypedValue], b: &[TypedValue], scale: f64) -> Result<f64, ValueError> {
    let len = a.len().max(b.len());
    if len == 0 {
        return Ok(0.0);
    }
    let weight = 1.0 / len as f64;
    let mut total = 0.0;
    for i in 0..len {
        total += match (a.get(i), b.get(i)) {
            (Some(x), Some(y)) => x.distance(y, scale)?,
            _ => 1.0,
        };
    }
    Ok(total * weight)
}

/// Levenshtein distance over chars divided by the longer length.
pub fn normalized_edit_distance(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 0.0;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()] as f64 / longest as f64
}

// Equality is bitwise on floats (with -0.0 == 0.0 and NaN == NaN) so that
// values can key hash maps when deduplicating candidates.
impl PartialEq for TypedValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TypedValue::Numeric(a), TypedValue::Numeric(b)) => {
                canonical_bits(*a) == canonical_bits(*b)
            }
            (TypedValue::Integer(a), TypedValue::Integer(b)) => a == b,
            (TypedValue::Categorical(a), TypedValue::Categorical(b)) => a == b,
            (TypedValue::Boolean(a), TypedValue::Boolean(b)) => a == b,
            (TypedValue::Text(a), TypedValue::Text(b)) => a == b,
            (TypedValue::Composite(a), TypedValue::Composite(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for TypedValue {}

impl Hash for TypedValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        match self {
            TypedValue::Numeric(v) => canonical_bits(*v).hash(state),
            TypedValue::Integer(v) => v.hash(state),
            TypedValue::Categorical(c) => c.hash(state),
            TypedValue::Boolean(b) => b.hash(state),
            TypedValue::Text(s) => s.hash(state),
            TypedValue::Composite(items) => items.hash(state),
        }
    }
}

fn canonical_bits(v: f64) -> u64 {
    if v == 0.0 {
        0.0f64.to_bits()
    } else if v.is_nan() {
        f64::NAN.to_bits()
    } else {
        v.to_bits()
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Numeric(v) => write!(f, "{v}"),
            TypedValue::Integer(v) => write!(f, "{v}"),
            TypedValue::Categorical(c) => write!(f, "{c}"),
            TypedValue::Boolean(b) => write!(f, "{b}"),
            TypedValue::Text(s) => f.write_str(s),
            TypedValue::Composite(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for TypedValue {
    fn from(value: bool) -> Self {
        TypedValue::Boolean(value)
    }
}

impl From<i64> for TypedValue {
    fn from(value: i64) -> Self {
        TypedValue::Integer(value)
    }
}
