/// Component instances and the immutable definitions they are
/// validated against.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::{ComponentId, Position};

pub type Props = Map<String, Value>;

/// A placed component on a page. Mutated only through registry calls,
/// which stamp `last_modified_by`/`last_modified_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentInstance {
    pub id: ComponentId,
    pub component_type: String,
    pub position: Position,
    #[serde(default)]
    pub props: Props,
    pub version: u64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub last_modified_by: String,
    pub last_modified_at: DateTime<Utc>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Immutable schema for a component type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentDefinition {
    pub component_type: String,
    pub category: String,
    #[serde(default)]
    pub default_props: Props,
    #[serde(default)]
    pub prop_schema: HashMap<String, PropSchema>,
}

impl ComponentDefinition {
    pub fn new(component_type: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            component_type: component_type.into(),
            category: category.into(),
            default_props: Props::new(),
            prop_schema: HashMap::new(),
        }
    }

    pub fn with_default(mut self, key: impl Into<String>, value: Value) -> Self {
        self.default_props.insert(key.into(), value);
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, schema: PropSchema) -> Self {
        self.prop_schema.insert(key.into(), schema);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropSchema {
    pub kind: PropKind,
    #[serde(default)]
    pub required: bool,
    /// Enum constraint: the sanitized value must be one of these.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
}

impl PropSchema {
    pub fn new(kind: PropKind) -> Self {
        Self {
            kind,
            required: false,
            allowed: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn one_of(mut self, allowed: Vec<Value>) -> Self {
        self.allowed = Some(allowed);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PropKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

/// Outcome of validating props against a definition. Unknown props and
/// safe coercions are warnings; missing required props and structural
/// mismatches are errors.
#[derive(Debug, Clone, Default)]
pub struct PropValidation {
    pub sanitized: Props,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl PropValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn validate_props(definition: &ComponentDefinition, props: &Props) -> PropValidation {
    let mut report = PropValidation::default();

    for (key, schema) in &definition.prop_schema {
        let value = match props.get(key) {
            Some(value) => value,
            None => {
                if schema.required {
                    report.errors.push(format!("missing required prop '{key}'"));
                }
                continue;
            }
        };

        let sanitized = match coerce_value(schema.kind, value) {
            Coercion::Kept(v) => v,
            Coercion::Converted(v, note) => {
                report.warnings.push(format!("prop '{key}': {note}"));
                v
            }
            Coercion::Rejected(reason) => {
                report.errors.push(format!("prop '{key}': {reason}"));
                continue;
            }
        };

        if let Some(allowed) = &schema.allowed {
            if !allowed.contains(&sanitized) {
                report
                    .errors
                    .push(format!("prop '{key}': value not in allowed set"));
                continue;
            }
        }

        report.sanitized.insert(key.clone(), sanitized);
    }

    for key in props.keys() {
        if !definition.prop_schema.contains_key(key) {
            report.warnings.push(format!("unknown prop '{key}'"));
            report.sanitized.insert(key.clone(), props[key].clone());
        }
    }

    report
}

enum Coercion {
    Kept(Value),
    Converted(Value, String),
    Rejected(String),
}

/// Scalar mismatches are coerced where safely convertible; container
/// mismatches are hard errors.
fn coerce_value(kind: PropKind, value: &Value) -> Coercion {
    match kind {
        PropKind::String => match value {
            Value::String(_) => Coercion::Kept(value.clone()),
            Value::Number(n) => {
                Coercion::Converted(Value::String(n.to_string()), "number coerced to string".into())
            }
            Value::Bool(b) => {
                Coercion::Converted(Value::String(b.to_string()), "boolean coerced to string".into())
            }
            _ => Coercion::Rejected("expected a string".into()),
        },
        PropKind::Number => match value {
            Value::Number(_) => Coercion::Kept(value.clone()),
            Value::String(s) => match s.trim().parse::<f64>() {
                Ok(parsed) => match serde_json::Number::from_f64(parsed) {
                    Some(n) => Coercion::Converted(
                        Value::Number(n),
                        "string coerced to number".into(),
                    ),
                    None => Coercion::Rejected("expected a finite number".into()),
                },
                Err(_) => Coercion::Rejected("expected a number".into()),
            },
            Value::Bool(b) => {
                let n: i64 = if *b { 1 } else { 0 };
                Coercion::Converted(Value::Number(n.into()), "boolean coerced to number".into())
            }
            _ => Coercion::Rejected("expected a number".into()),
        },
        PropKind::Boolean => match value {
            Value::Bool(_) => Coercion::Kept(value.clone()),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => {
                    Coercion::Converted(Value::Bool(true), "string coerced to boolean".into())
                }
                "false" | "0" => {
                    Coercion::Converted(Value::Bool(false), "string coerced to boolean".into())
                }
                _ => Coercion::Rejected("expected a boolean".into()),
            },
            Value::Number(n) => match n.as_f64() {
                Some(f) if f == 0.0 => {
                    Coercion::Converted(Value::Bool(false), "number coerced to boolean".into())
                }
                Some(f) if f == 1.0 => {
                    Coercion::Converted(Value::Bool(true), "number coerced to boolean".into())
                }
                _ => Coercion::Rejected("expected a boolean".into()),
            },
            _ => Coercion::Rejected("expected a boolean".into()),
        },
        PropKind::Array => match value {
            Value::Array(_) => Coercion::Kept(value.clone()),
            _ => Coercion::Rejected("expected an array".into()),
        },
        PropKind::Object => match value {
            Value::Object(_) => Coercion::Kept(value.clone()),
            _ => Coercion::Rejected("expected an object".into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn button_definition() -> ComponentDefinition {
        ComponentDefinition::new("button", "interactive")
            .with_default("label", json!("Click me"))
            .with_prop("label", PropSchema::new(PropKind::String).required())
            .with_prop("width", PropSchema::new(PropKind::Number))
            .with_prop("disabled", PropSchema::new(PropKind::Boolean))
            .with_prop("tags", PropSchema::new(PropKind::Array))
            .with_prop(
                "variant",
                PropSchema::new(PropKind::String).one_of(vec![json!("primary"), json!("ghost")]),
            )
    }

    #[test]
    fn missing_required_prop_is_an_error() {
        let def = button_definition();
        let report = validate_props(&def, &Props::new());

        assert!(!report.is_valid());
        assert!(report.errors[0].contains("label"));
    }

    #[test]
    fn unknown_prop_is_a_warning_and_passes_through() {
        let def = button_definition();
        let mut props = Props::new();
        props.insert("label".into(), json!("Go"));
        props.insert("analytics_id".into(), json!("btn-7"));

        let report = validate_props(&def, &props);

        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.sanitized["analytics_id"], json!("btn-7"));
    }

    #[test]
    fn scalar_mismatches_are_coerced_with_warnings() {
        let def = button_definition();
        let mut props = Props::new();
        props.insert("label".into(), json!(42));
        props.insert("width".into(), json!("120"));
        props.insert("disabled".into(), json!("true"));

        let report = validate_props(&def, &props);

        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 3);
        assert_eq!(report.sanitized["label"], json!("42"));
        assert_eq!(report.sanitized["width"], json!(120.0));
        assert_eq!(report.sanitized["disabled"], json!(true));
    }

    #[test]
    fn structural_mismatch_is_a_hard_error() {
        let def = button_definition();
        let mut props = Props::new();
        props.insert("label".into(), json!("Go"));
        props.insert("tags".into(), json!("not-an-array"));

        let report = validate_props(&def, &props);

        assert!(!report.is_valid());
        assert!(report.errors[0].contains("array"));
    }

    #[test]
    fn enum_constraint_rejects_values_outside_allowed_set() {
        let def = button_definition();
        let mut props = Props::new();
        props.insert("label".into(), json!("Go"));
        props.insert("variant".into(), json!("loud"));

        let report = validate_props(&def, &props);

        assert!(!report.is_valid());
        assert!(report.errors[0].contains("allowed"));
    }
}
