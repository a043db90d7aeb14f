//! Schema validation gate
//!
//! Replicant schemas arrive from the server as JSON-Schema-style
//! documents. A schema is compiled once into a [`CompiledSchema`] and
//! every local mutation is validated against it before being proposed.
//! Validation collects every violation rather than stopping at the
//! first, so a failure enumerates all offending fields with their
//! values, actual types, and expected types or constraints.
//!
//! Supported keywords: `type`, `properties`, `required`,
//! `additionalProperties`, `items`, `enum`, `minimum`, `maximum`,
//! `minLength`, `maxLength`, `minItems`, `maxItems`.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ReplicantError;
use crate::path;

/// One schema violation at a specific path inside the value tree.
#[derive(Clone, Debug)]
pub struct SchemaViolation {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: expected {}, got {}", self.path, self.expected, self.actual)
    }
}

/// The full set of violations from one validation run.
#[derive(Clone, Debug, Default)]
pub struct ValidationFailure {
    pub violations: Vec<SchemaViolation>,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} violation(s)", self.violations.len())?;
        for v in &self.violations {
            write!(f, "; {}", v)?;
        }
        Ok(())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn describe(value: &Value) -> String {
    let rendered = value.to_string();
    if rendered.chars().count() > 48 {
        let head: String = rendered.chars().take(48).collect();
        format!("{} {}...", type_name(value), head)
    } else {
        format!("{} {}", type_name(value), rendered)
    }
}

/// Hex-encoded SHA-256 of the canonical schema JSON. Stable across key
/// ordering of the source document.
pub fn schema_sum(schema: &Value) -> String {
    let canonical = canonicalize(schema).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[derive(Clone, Debug, Default)]
struct SchemaNode {
    types: Vec<String>,
    properties: BTreeMap<String, SchemaNode>,
    required: Vec<String>,
    additional_properties: bool,
    items: Option<Box<SchemaNode>>,
    enum_values: Option<Vec<Value>>,
    minimum: Option<f64>,
    maximum: Option<f64>,
    min_length: Option<u64>,
    max_length: Option<u64>,
    min_items: Option<u64>,
    max_items: Option<u64>,
}

/// A schema compiled from its JSON document, ready to validate values.
#[derive(Clone, Debug)]
pub struct CompiledSchema {
    root: SchemaNode,
    raw: Value,
    sum: String,
}

impl CompiledSchema {
    /// Compile a JSON-Schema-style document. Fails on a malformed
    /// document (a protocol-level condition, since schemas come from the
    /// server).
    pub fn compile(schema: &Value) -> Result<Self, ReplicantError> {
        let root = compile_node(schema)?;
        Ok(Self {
            root,
            raw: schema.clone(),
            sum: schema_sum(schema),
        })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn sum(&self) -> &str {
        &self.sum
    }

    /// Validate a whole value tree, collecting every violation.
    pub fn validate(&self, value: &Value) -> Result<(), ValidationFailure> {
        let mut violations = Vec::new();
        validate_node(&self.root, value, "/", &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationFailure { violations })
        }
    }
}

fn compile_node(schema: &Value) -> Result<SchemaNode, ReplicantError> {
    let obj = schema
        .as_object()
        .ok_or_else(|| ReplicantError::Protocol(format!("schema is not an object: {}", schema)))?;

    let mut node = SchemaNode {
        additional_properties: true,
        ..SchemaNode::default()
    };

    match obj.get("type") {
        None => {}
        Some(Value::String(t)) => node.types.push(t.clone()),
        Some(Value::Array(ts)) => {
            for t in ts {
                let t = t.as_str().ok_or_else(|| {
                    ReplicantError::Protocol(format!("schema type entry is not a string: {}", t))
                })?;
                node.types.push(t.to_string());
            }
        }
        Some(other) => {
            return Err(ReplicantError::Protocol(format!(
                "schema \"type\" must be a string or array: {}",
                other
            )))
        }
    }

    if let Some(props) = obj.get("properties") {
        let props = props.as_object().ok_or_else(|| {
            ReplicantError::Protocol("schema \"properties\" must be an object".into())
        })?;
        for (name, sub) in props {
            node.properties.insert(name.clone(), compile_node(sub)?);
        }
    }

    if let Some(required) = obj.get("required") {
        let required = required.as_array().ok_or_else(|| {
            ReplicantError::Protocol("schema \"required\" must be an array".into())
        })?;
        for entry in required {
            let entry = entry.as_str().ok_or_else(|| {
                ReplicantError::Protocol("schema \"required\" entries must be strings".into())
            })?;
            node.required.push(entry.to_string());
        }
    }

    if let Some(Value::Bool(allowed)) = obj.get("additionalProperties") {
        node.additional_properties = *allowed;
    }

    if let Some(items) = obj.get("items") {
        node.items = Some(Box::new(compile_node(items)?));
    }

    if let Some(Value::Array(options)) = obj.get("enum") {
        node.enum_values = Some(options.clone());
    }

    node.minimum = obj.get("minimum").and_then(Value::as_f64);
    node.maximum = obj.get("maximum").and_then(Value::as_f64);
    node.min_length = obj.get("minLength").and_then(Value::as_u64);
    node.max_length = obj.get("maxLength").and_then(Value::as_u64);
    node.min_items = obj.get("minItems").and_then(Value::as_u64);
    node.max_items = obj.get("maxItems").and_then(Value::as_u64);

    Ok(node)
}

fn matches_type(name: &str, value: &Value) -> bool {
    match name {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "string" => value.is_string(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => false,
    }
}

fn validate_node(node: &SchemaNode, value: &Value, at: &str, out: &mut Vec<SchemaViolation>) {
    if !node.types.is_empty() && !node.types.iter().any(|t| matches_type(t, value)) {
        out.push(SchemaViolation {
            path: at.to_string(),
            expected: node.types.join(" or "),
            actual: describe(value),
        });
        // Structural checks below would only cascade noise.
        return;
    }

    if let Some(options) = &node.enum_values {
        if !options.contains(value) {
            out.push(SchemaViolation {
                path: at.to_string(),
                expected: format!("one of {}", Value::Array(options.clone())),
                actual: describe(value),
            });
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = node.minimum {
            if n < min {
                out.push(SchemaViolation {
                    path: at.to_string(),
                    expected: format!("minimum {}", min),
                    actual: describe(value),
                });
            }
        }
        if let Some(max) = node.maximum {
            if n > max {
                out.push(SchemaViolation {
                    path: at.to_string(),
                    expected: format!("maximum {}", max),
                    actual: describe(value),
                });
            }
        }
    }

    if let Some(s) = value.as_str() {
        let len = s.chars().count() as u64;
        if let Some(min) = node.min_length {
            if len < min {
                out.push(SchemaViolation {
                    path: at.to_string(),
                    expected: format!("minLength {}", min),
                    actual: describe(value),
                });
            }
        }
        if let Some(max) = node.max_length {
            if len > max {
                out.push(SchemaViolation {
                    path: at.to_string(),
                    expected: format!("maxLength {}", max),
                    actual: describe(value),
                });
            }
        }
    }

    if let Some(items) = value.as_array() {
        let len = items.len() as u64;
        if let Some(min) = node.min_items {
            if len < min {
                out.push(SchemaViolation {
                    path: at.to_string(),
                    expected: format!("minItems {}", min),
                    actual: describe(value),
                });
            }
        }
        if let Some(max) = node.max_items {
            if len > max {
                out.push(SchemaViolation {
                    path: at.to_string(),
                    expected: format!("maxItems {}", max),
                    actual: describe(value),
                });
            }
        }
        if let Some(item_schema) = &node.items {
            for (i, item) in items.iter().enumerate() {
                validate_node(item_schema, item, &path::join(at, &i.to_string()), out);
            }
        }
    }

    if let Some(map) = value.as_object() {
        for name in &node.required {
            if !map.contains_key(name) {
                out.push(SchemaViolation {
                    path: path::join(at, name),
                    expected: "required field".to_string(),
                    actual: "missing".to_string(),
                });
            }
        }
        for (name, member) in map {
            match node.properties.get(name) {
                Some(sub) => validate_node(sub, member, &path::join(at, name), out),
                None if !node.additional_properties => out.push(SchemaViolation {
                    path: path::join(at, name),
                    expected: "no additional properties".to_string(),
                    actual: describe(member),
                }),
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counted_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "count": { "type": "number", "minimum": 0 },
                "label": { "type": "string", "maxLength": 8 },
            },
            "required": ["count"],
        })
    }

    #[test]
    fn test_valid_value_passes() {
        let schema = CompiledSchema::compile(&counted_schema()).unwrap();
        assert!(schema.validate(&json!({ "count": 3, "label": "ok" })).is_ok());
    }

    #[test]
    fn test_type_violation_names_field() {
        let schema = CompiledSchema::compile(&counted_schema()).unwrap();
        let failure = schema.validate(&json!({ "count": "x" })).unwrap_err();
        assert_eq!(failure.violations.len(), 1);
        let v = &failure.violations[0];
        assert_eq!(v.path, "/count");
        assert_eq!(v.expected, "number");
        assert!(v.actual.contains("string"));
    }

    #[test]
    fn test_all_violations_collected() {
        let schema = CompiledSchema::compile(&counted_schema()).unwrap();
        let failure = schema
            .validate(&json!({ "count": -1, "label": "far too long" }))
            .unwrap_err();
        let paths: Vec<&str> = failure.violations.iter().map(|v| v.path.as_str()).collect();
        assert!(paths.contains(&"/count"));
        assert!(paths.contains(&"/label"));
    }

    #[test]
    fn test_missing_required_field() {
        let schema = CompiledSchema::compile(&counted_schema()).unwrap();
        let failure = schema.validate(&json!({})).unwrap_err();
        assert_eq!(failure.violations[0].path, "/count");
        assert_eq!(failure.violations[0].actual, "missing");
    }

    #[test]
    fn test_items_and_enum() {
        let schema = CompiledSchema::compile(&json!({
            "type": "array",
            "items": { "type": "string", "enum": ["red", "green"] },
            "minItems": 1,
        }))
        .unwrap();
        assert!(schema.validate(&json!(["red"])).is_ok());
        let failure = schema.validate(&json!(["blue"])).unwrap_err();
        assert_eq!(failure.violations[0].path, "/0");
    }

    #[test]
    fn test_schema_sum_stable_across_key_order() {
        let a = json!({ "type": "object", "properties": { "a": {}, "b": {} } });
        let b: Value =
            serde_json::from_str(r#"{"properties":{"b":{},"a":{}},"type":"object"}"#).unwrap();
        assert_eq!(schema_sum(&a), schema_sum(&b));
    }

    #[test]
    fn test_malformed_schema_is_protocol_error() {
        assert!(CompiledSchema::compile(&json!([1, 2])).is_err());
        assert!(CompiledSchema::compile(&json!({ "type": 7 })).is_err());
    }
}
