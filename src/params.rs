use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

const FLOAT_TOLERANCE: f64 = 1e-9;

/// A single concrete value for a request parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(value) => Some(*value as f64),
            ParamValue::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Bool(value) => Value::Bool(*value),
            ParamValue::Int(value) => Value::from(*value),
            ParamValue::Float(value) => serde_json::Number::from_f64(*value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ParamValue::Text(value) => Value::String(value.clone()),
        }
    }
}

impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ParamValue::Bool(a), ParamValue::Bool(b)) => a == b,
            (ParamValue::Text(a), ParamValue::Text(b)) => a == b,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => (a - b).abs() <= FLOAT_TOLERANCE,
                _ => false,
            },
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(value) => write!(f, "{value}"),
            ParamValue::Int(value) => write!(f, "{value}"),
            ParamValue::Float(value) => write!(f, "{}", trim_float(*value)),
            ParamValue::Text(value) => f.write_str(value),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

fn trim_float(value: f64) -> String {
    let text = format!("{value:.6}");
    let text = text.trim_end_matches('0');
    text.strip_suffix('.').map(|s| format!("{s}.0")).unwrap_or_else(|| text.to_string())
}

/// Concrete request parameters handed to the invocation adapter.
///
/// Generated combos are `RequestParams` too; their identity is [`RequestParams::key`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestParams {
    values: BTreeMap<String, ParamValue>,
}

pub type Combo = RequestParams;

impl RequestParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ParamValue> {
        self.values.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Parameters layered over `self`; values in `overrides` win.
    pub fn merged(&self, overrides: &RequestParams) -> RequestParams {
        let mut merged = self.clone();
        for (name, value) in overrides.iter() {
            merged.values.insert(name.clone(), value.clone());
        }
        merged
    }

    /// Stable identity string, e.g. `temperature=0.5,tool_choice=auto`.
    pub fn key(&self) -> String {
        self.values
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for RequestParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.values.is_empty() {
            return f.write_str("{}");
        }
        write!(f, "{{{}}}", self.key())
    }
}

impl FromIterator<(String, ParamValue)> for RequestParams {
    fn from_iter<T: IntoIterator<Item = (String, ParamValue)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ParamValue, RequestParams};

    #[test]
    fn key_is_independent_of_insertion_order() {
        let a = RequestParams::new().with("tool_choice", "auto").with("temperature", 0.5);
        let b = RequestParams::new().with("temperature", 0.5).with("tool_choice", "auto");
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key(), "temperature=0.5,tool_choice=auto");
    }

    #[test]
    fn ints_and_floats_compare_numerically() {
        assert_eq!(ParamValue::Int(1), ParamValue::Float(1.0));
        assert_ne!(ParamValue::Text("1".into()), ParamValue::Int(1));
    }

    #[test]
    fn untagged_deserialization_prefers_integers() {
        let value: ParamValue = serde_json::from_str("3").unwrap();
        assert!(matches!(value, ParamValue::Int(3)));
        let value: ParamValue = serde_json::from_str("0.7").unwrap();
        assert!(matches!(value, ParamValue::Float(_)));
    }
}
