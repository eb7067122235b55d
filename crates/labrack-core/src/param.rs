//! Parameter cells: declared kinds, validators, and the typed get/set cell
//! instruments are built from.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{LabrackError, Result};

/// Declared value kind of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Integer,
    Float,
    Bool,
    String,
    Enum,
    Json,
}

impl ParamKind {
    /// Whether a JSON value is of this kind. `Enum` and `Json` accept any
    /// shape; the validator narrows them.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Float => value.is_number(),
            ParamKind::Bool => value.is_boolean(),
            ParamKind::String => value.is_string(),
            ParamKind::Enum | ParamKind::Json => true,
        }
    }

    /// Infer a kind from a value, for parameters declared at runtime.
    pub fn from_value(value: &Value) -> ParamKind {
        match value {
            Value::Bool(_) => ParamKind::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => ParamKind::Integer,
            Value::Number(_) => ParamKind::Float,
            Value::String(_) => ParamKind::String,
            _ => ParamKind::Json,
        }
    }
}

/// Validator descriptor. Kept as tagged data rather than closures so
/// blueprints and profiles stay fully serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Validator {
    Anything,
    Numbers {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Ints {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    Enumeration {
        allowed: Vec<Value>,
    },
    /// Named predicate, resolved against the built-in predicate table.
    Predicate {
        id: String,
    },
}

impl Validator {
    /// Check a candidate value, returning a `Validation` error on rejection.
    pub fn check(&self, value: &Value) -> Result<()> {
        match self {
            Validator::Anything => Ok(()),
            Validator::Numbers { min, max } => {
                let n = value.as_f64().ok_or_else(|| {
                    LabrackError::Validation(format!("{} is not numeric", value))
                })?;
                if min.map(|m| n < m).unwrap_or(false) || max.map(|m| n > m).unwrap_or(false) {
                    return Err(LabrackError::Validation(format!(
                        "{} outside range [{:?}, {:?}]",
                        n, min, max
                    )));
                }
                Ok(())
            }
            Validator::Ints { min, max } => {
                let n = value.as_i64().ok_or_else(|| {
                    LabrackError::Validation(format!("{} is not an integer", value))
                })?;
                if min.map(|m| n < m).unwrap_or(false) || max.map(|m| n > m).unwrap_or(false) {
                    return Err(LabrackError::Validation(format!(
                        "{} outside range [{:?}, {:?}]",
                        n, min, max
                    )));
                }
                Ok(())
            }
            Validator::Enumeration { allowed } => {
                // Numeric equality across int/float encodings, exact equality
                // for everything else.
                let matches = allowed.iter().any(|a| {
                    if let (Some(x), Some(y)) = (a.as_f64(), value.as_f64()) {
                        x == y
                    } else {
                        a == value
                    }
                });
                if matches {
                    Ok(())
                } else {
                    Err(LabrackError::Validation(format!(
                        "{} not in allowed set {:?}",
                        value, allowed
                    )))
                }
            }
            Validator::Predicate { id } => match id.as_str() {
                "non_empty_string" => {
                    if value.as_str().map(|s| !s.is_empty()).unwrap_or(false) {
                        Ok(())
                    } else {
                        Err(LabrackError::Validation(format!(
                            "{} is not a non-empty string",
                            value
                        )))
                    }
                }
                "finite_number" => {
                    if value.as_f64().map(f64::is_finite).unwrap_or(false) {
                        Ok(())
                    } else {
                        Err(LabrackError::Validation(format!(
                            "{} is not a finite number",
                            value
                        )))
                    }
                }
                "positive_number" => {
                    if value.as_f64().map(|n| n > 0.0).unwrap_or(false) {
                        Ok(())
                    } else {
                        Err(LabrackError::Validation(format!(
                            "{} is not a positive number",
                            value
                        )))
                    }
                }
                other => Err(LabrackError::Validation(format!(
                    "unknown predicate '{}'",
                    other
                ))),
            },
        }
    }
}

/// A typed, validated get/set cell on an instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterCell {
    pub name: String,
    pub kind: ParamKind,
    pub unit: String,
    pub validator: Validator,
    pub gettable: bool,
    pub settable: bool,
    pub value: Value,
}

impl ParameterCell {
    pub fn new(name: impl Into<String>, kind: ParamKind, value: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            unit: String::new(),
            validator: Validator::Anything,
            gettable: true,
            settable: true,
            value,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.settable = false;
        self
    }

    /// Validate a candidate value against the declared kind and validator.
    pub fn validate(&self, value: &Value) -> Result<()> {
        if !self.kind.accepts(value) {
            return Err(LabrackError::Validation(format!(
                "{} is not a valid {:?} for '{}'",
                value, self.kind, self.name
            )));
        }
        self.validator.check(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numbers_validator_bounds() {
        let v = Validator::Numbers {
            min: Some(0.0),
            max: Some(10.0),
        };
        assert!(v.check(&json!(5.5)).is_ok());
        assert!(v.check(&json!(0.0)).is_ok());
        assert!(v.check(&json!(-0.1)).is_err());
        assert!(v.check(&json!(10.1)).is_err());
        assert!(v.check(&json!("five")).is_err());
    }

    #[test]
    fn test_ints_validator_rejects_floats() {
        let v = Validator::Ints {
            min: None,
            max: Some(100),
        };
        assert!(v.check(&json!(42)).is_ok());
        assert!(v.check(&json!(42.5)).is_err());
        assert!(v.check(&json!(101)).is_err());
    }

    #[test]
    fn test_enumeration_matches_numerically() {
        let v = Validator::Enumeration {
            allowed: vec![json!(0.1), json!(1), json!(10), json!(100)],
        };
        assert!(v.check(&json!(1.0)).is_ok());
        assert!(v.check(&json!(10)).is_ok());
        assert!(v.check(&json!(5)).is_err());
    }

    #[test]
    fn test_predicate_validator() {
        let v = Validator::Predicate {
            id: "non_empty_string".into(),
        };
        assert!(v.check(&json!("hello")).is_ok());
        assert!(v.check(&json!("")).is_err());

        let unknown = Validator::Predicate { id: "bogus".into() };
        assert!(unknown.check(&json!(1)).is_err());
    }

    #[test]
    fn test_kind_inference() {
        assert_eq!(ParamKind::from_value(&json!(40)), ParamKind::Integer);
        assert_eq!(ParamKind::from_value(&json!(1.25)), ParamKind::Float);
        assert_eq!(ParamKind::from_value(&json!(true)), ParamKind::Bool);
        assert_eq!(ParamKind::from_value(&json!("ns")), ParamKind::String);
        assert_eq!(ParamKind::from_value(&json!([1, 2])), ParamKind::Json);
    }

    #[test]
    fn test_cell_validate_checks_kind_first() {
        let cell = ParameterCell::new("voltage", ParamKind::Float, json!(0.0))
            .with_unit("V")
            .with_validator(Validator::Numbers {
                min: Some(-10.0),
                max: Some(10.0),
            });
        assert!(cell.validate(&json!(1.25)).is_ok());
        assert!(cell.validate(&json!("high")).is_err());
        assert!(cell.validate(&json!(12.0)).is_err());
    }

    #[test]
    fn test_validator_serialization_is_tagged() {
        let v = Validator::Enumeration {
            allowed: vec![json!(1)],
        };
        let text = serde_json::to_string(&v).unwrap();
        assert!(text.contains("\"kind\":\"enumeration\""));
        let back: Validator = serde_json::from_str(&text).unwrap();
        assert_eq!(back, v);
    }
}
