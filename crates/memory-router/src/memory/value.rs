//! Typed values for system memory and the per-memory-type value schemas that
//! validate them.

use crate::error::{MemoryError, MemoryResult};
use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// JSON value without `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MemoryValue {
    String(String),
    Number(Number),
    Bool(bool),
    Array(Vec<MemoryValue>),
    Object(BTreeMap<String, MemoryValue>),
}

impl MemoryValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            MemoryValue::String(_) => "string",
            MemoryValue::Number(_) => "number",
            MemoryValue::Bool(_) => "bool",
            MemoryValue::Array(_) => "array",
            MemoryValue::Object(_) => "object",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MemoryValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, MemoryValue>> {
        match self {
            MemoryValue::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&MemoryValue> {
        self.as_object().and_then(|map| map.get(field))
    }

    pub fn to_json(&self) -> Value {
        match self {
            MemoryValue::String(s) => Value::String(s.clone()),
            MemoryValue::Number(n) => Value::Number(n.clone()),
            MemoryValue::Bool(b) => Value::Bool(*b),
            MemoryValue::Array(items) => Value::Array(items.iter().map(MemoryValue::to_json).collect()),
            MemoryValue::Object(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json());
                }
                Value::Object(out)
            }
        }
    }
}

impl TryFrom<Value> for MemoryValue {
    type Error = MemoryError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Err(MemoryError::validation("null is not a storable value")),
            Value::Bool(b) => Ok(MemoryValue::Bool(b)),
            Value::Number(n) => Ok(MemoryValue::Number(n)),
            Value::String(s) => Ok(MemoryValue::String(s)),
            Value::Array(items) => items
                .into_iter()
                .map(MemoryValue::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(MemoryValue::Array),
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| MemoryValue::try_from(v).map(|v| (k, v)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(MemoryValue::Object),
        }
    }
}

impl<'de> Deserialize<'de> for MemoryValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        MemoryValue::try_from(raw).map_err(serde::de::Error::custom)
    }
}

impl From<&str> for MemoryValue {
    fn from(s: &str) -> Self {
        MemoryValue::String(s.to_string())
    }
}

impl From<String> for MemoryValue {
    fn from(s: String) -> Self {
        MemoryValue::String(s)
    }
}

impl From<i64> for MemoryValue {
    fn from(n: i64) -> Self {
        MemoryValue::Number(n.into())
    }
}

impl From<bool> for MemoryValue {
    fn from(b: bool) -> Self {
        MemoryValue::Bool(b)
    }
}

/// Shape constraint registered for a memory type.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueSchema {
    Any,
    String,
    Number,
    Bool,
    Array,
    Object { required: Vec<(String, ValueSchema)> },
}

impl ValueSchema {
    pub fn object(required: &[(&str, ValueSchema)]) -> Self {
        ValueSchema::Object {
            required: required.iter().map(|(k, s)| (k.to_string(), s.clone())).collect(),
        }
    }

    pub fn check(&self, value: &MemoryValue) -> MemoryResult<()> {
        self.check_at(value, "value")
    }

    fn check_at(&self, value: &MemoryValue, path: &str) -> MemoryResult<()> {
        let ok = match (self, value) {
            (ValueSchema::Any, _) => true,
            (ValueSchema::String, MemoryValue::String(_)) => true,
            (ValueSchema::Number, MemoryValue::Number(_)) => true,
            (ValueSchema::Bool, MemoryValue::Bool(_)) => true,
            (ValueSchema::Array, MemoryValue::Array(_)) => true,
            (ValueSchema::Object { required }, MemoryValue::Object(map)) => {
                for (field, schema) in required {
                    let field_path = format!("{}.{}", path, field);
                    match map.get(field) {
                        Some(inner) => schema.check_at(inner, &field_path)?,
                        None => {
                            return Err(MemoryError::validation(format!(
                                "missing required field {}",
                                field_path
                            )))
                        }
                    }
                }
                true
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(MemoryError::validation(format!(
                "{} must be {}, got {}",
                path,
                self.describe(),
                value.type_name()
            )))
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            ValueSchema::Any => "any value",
            ValueSchema::String => "a string",
            ValueSchema::Number => "a number",
            ValueSchema::Bool => "a bool",
            ValueSchema::Array => "an array",
            ValueSchema::Object { .. } => "an object",
        }
    }
}

pub const SYSTEM_PROMPT_TYPE: &str = "system_prompt";
pub const DEFAULT_MEMORY_TYPE: &str = "system_facts";

/// Value schemas keyed by memory type. Types without a registration accept any value.
pub struct ValueSchemaRegistry {
    schemas: DashMap<String, ValueSchema>,
}

impl ValueSchemaRegistry {
    pub fn new() -> Self {
        Self {
            schemas: DashMap::new(),
        }
    }

    pub fn register(&self, memory_type: impl Into<String>, schema: ValueSchema) {
        self.schemas.insert(memory_type.into(), schema);
    }

    pub fn schema_for(&self, memory_type: &str) -> ValueSchema {
        self.schemas
            .get(memory_type)
            .map(|s| s.clone())
            .unwrap_or(ValueSchema::Any)
    }

    pub fn validate(&self, memory_type: &str, value: &MemoryValue) -> MemoryResult<()> {
        self.schema_for(memory_type).check(value)
    }
}

impl Default for ValueSchemaRegistry {
    fn default() -> Self {
        let registry = Self::new();
        registry.register(
            SYSTEM_PROMPT_TYPE,
            ValueSchema::object(&[("content", ValueSchema::String)]),
        );
        registry.register("preferences", ValueSchema::object(&[]));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_is_rejected() {
        assert!(MemoryValue::try_from(json!(null)).is_err());
        assert!(MemoryValue::try_from(json!({"a": [1, null]})).is_err());
        assert!(serde_json::from_value::<MemoryValue>(json!(null)).is_err());
    }

    #[test]
    fn test_json_conversion_preserves_shape() {
        let raw = json!({"limits": {"max_tokens": 4096}, "models": ["a", "b"], "on": true});
        let value = MemoryValue::try_from(raw.clone()).unwrap();
        assert_eq!(value.type_name(), "object");
        assert_eq!(value.to_json(), raw);
    }

    #[test]
    fn test_default_registry_requires_prompt_content() {
        let registry = ValueSchemaRegistry::default();
        let good = MemoryValue::try_from(json!({"content": "Be brief."})).unwrap();
        let missing = MemoryValue::try_from(json!({"title": "x"})).unwrap();
        let wrong = MemoryValue::try_from(json!({"content": 5})).unwrap();

        assert!(registry.validate(SYSTEM_PROMPT_TYPE, &good).is_ok());
        assert!(registry.validate(SYSTEM_PROMPT_TYPE, &missing).is_err());
        assert!(registry.validate(SYSTEM_PROMPT_TYPE, &wrong).is_err());
        assert!(registry.validate(SYSTEM_PROMPT_TYPE, &MemoryValue::from("text")).is_err());
    }

    #[test]
    fn test_unregistered_type_accepts_anything() {
        let registry = ValueSchemaRegistry::default();
        assert!(registry.validate("knowledge", &MemoryValue::from(4096)).is_ok());
        registry.register("counters", ValueSchema::Number);
        assert!(registry.validate("counters", &MemoryValue::from("x")).is_err());
    }
}
