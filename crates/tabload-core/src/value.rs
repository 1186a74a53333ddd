//! Typed cell values and coercion from raw file cells.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::schema::FieldType;

/// A typed record cell after validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Decimal(Decimal),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

impl Value {
    /// Canonical string form used by the row fingerprint.
    ///
    /// Must be identical across runs, hosts, and locales: `Null` renders as
    /// the empty string, dates as `%Y-%m-%d`, datetimes as RFC 3339 in UTC,
    /// everything else through its default display form.
    pub fn canonical_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Str(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::DateTime(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// A failed coercion: the machine-readable kind plus a human message.
#[derive(Debug, Clone)]
pub struct CoercionError {
    pub error_type: &'static str,
    pub message: String,
}

impl CoercionError {
    fn new(error_type: &'static str, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }
}

impl FieldType {
    /// Coerce a raw file cell into a typed [`Value`].
    ///
    /// Raw cells arrive as JSON values regardless of the file format: CSV
    /// cells are strings, JSON and Parquet cells keep their native types.
    /// Nulls are handled by the caller (optionality check), so `raw` is
    /// never `Null` here.
    pub fn coerce(&self, raw: &serde_json::Value) -> Result<Value, CoercionError> {
        use serde_json::Value as Raw;
        match self {
            FieldType::String { max_length } => {
                let s = match raw {
                    Raw::String(s) => s.clone(),
                    other => {
                        return Err(CoercionError::new(
                            "string_type",
                            format!("input should be a valid string, got {other}"),
                        ))
                    }
                };
                if let Some(max) = max_length {
                    if s.chars().count() > *max as usize {
                        return Err(CoercionError::new(
                            "string_too_long",
                            format!("string should have at most {max} characters"),
                        ));
                    }
                }
                Ok(Value::Str(s))
            }
            FieldType::Int => match raw {
                Raw::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Value::Int(i))
                    } else {
                        Err(CoercionError::new(
                            "int_parsing",
                            format!("input should be a valid integer, got {n}"),
                        ))
                    }
                }
                Raw::String(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    CoercionError::new(
                        "int_parsing",
                        format!("input should be a valid integer, unable to parse '{s}'"),
                    )
                }),
                other => Err(CoercionError::new(
                    "int_parsing",
                    format!("input should be a valid integer, got {other}"),
                )),
            },
            FieldType::Float => match raw {
                Raw::Number(n) => Ok(Value::Float(n.as_f64().unwrap_or(f64::NAN))),
                Raw::String(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                    CoercionError::new(
                        "float_parsing",
                        format!("input should be a valid number, unable to parse '{s}'"),
                    )
                }),
                other => Err(CoercionError::new(
                    "float_parsing",
                    format!("input should be a valid number, got {other}"),
                )),
            },
            FieldType::Bool => match raw {
                Raw::Bool(b) => Ok(Value::Bool(*b)),
                Raw::Number(n) => match n.as_i64() {
                    Some(0) => Ok(Value::Bool(false)),
                    Some(1) => Ok(Value::Bool(true)),
                    _ => Err(CoercionError::new(
                        "bool_parsing",
                        format!("input should be a valid boolean, got {n}"),
                    )),
                },
                Raw::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "yes" | "on" | "1" => Ok(Value::Bool(true)),
                    "false" | "f" | "no" | "off" | "0" => Ok(Value::Bool(false)),
                    _ => Err(CoercionError::new(
                        "bool_parsing",
                        format!("input should be a valid boolean, unable to parse '{s}'"),
                    )),
                },
                other => Err(CoercionError::new(
                    "bool_parsing",
                    format!("input should be a valid boolean, got {other}"),
                )),
            },
            FieldType::Decimal => match raw {
                Raw::Number(n) => Decimal::from_str(&n.to_string())
                    .map(Value::Decimal)
                    .map_err(|_| {
                        CoercionError::new(
                            "decimal_parsing",
                            format!("input should be a valid decimal, got {n}"),
                        )
                    }),
                Raw::String(s) => Decimal::from_str(s.trim()).map(Value::Decimal).map_err(|_| {
                    CoercionError::new(
                        "decimal_parsing",
                        format!("input should be a valid decimal, unable to parse '{s}'"),
                    )
                }),
                other => Err(CoercionError::new(
                    "decimal_parsing",
                    format!("input should be a valid decimal, got {other}"),
                )),
            },
            FieldType::Date => match raw {
                Raw::String(s) => parse_date(s.trim()).ok_or_else(|| {
                    CoercionError::new(
                        "date_parsing",
                        format!("input should be a valid date, unable to parse '{s}'"),
                    )
                }),
                other => Err(CoercionError::new(
                    "date_parsing",
                    format!("input should be a valid date, got {other}"),
                )),
            },
            FieldType::Datetime => match raw {
                Raw::String(s) => parse_datetime(s.trim()).ok_or_else(|| {
                    CoercionError::new(
                        "datetime_parsing",
                        format!("input should be a valid datetime, unable to parse '{s}'"),
                    )
                }),
                other => Err(CoercionError::new(
                    "datetime_parsing",
                    format!("input should be a valid datetime, got {other}"),
                )),
            },
            FieldType::Email => match raw {
                Raw::String(s) => {
                    if validator::validate_email(s) {
                        Ok(Value::Str(s.clone()))
                    } else {
                        Err(CoercionError::new(
                            "email_parsing",
                            format!("input is not a valid email address: '{s}'"),
                        ))
                    }
                }
                other => Err(CoercionError::new(
                    "email_parsing",
                    format!("input should be a valid email address, got {other}"),
                )),
            },
        }
    }
}

fn parse_date(s: &str) -> Option<Value> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(Value::Date)
}

fn parse_datetime(s: &str) -> Option<Value> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(Value::DateTime(dt.with_timezone(&Utc)));
    }
    // Offset-carrying forms some columnar decoders render.
    for fmt in ["%Y-%m-%d %H:%M:%S%.f %:z", "%Y-%m-%d %H:%M:%S%.f %z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(Value::DateTime(dt.with_timezone(&Utc)));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Value::DateTime(naive.and_utc()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerces_ints_from_strings_and_numbers() {
        assert_eq!(FieldType::Int.coerce(&json!(" 42 ")).unwrap(), Value::Int(42));
        assert_eq!(FieldType::Int.coerce(&json!(42)).unwrap(), Value::Int(42));
        assert_eq!(
            FieldType::Int.coerce(&json!("not_a_number")).unwrap_err().error_type,
            "int_parsing"
        );
        assert_eq!(
            FieldType::Int.coerce(&json!(1.5)).unwrap_err().error_type,
            "int_parsing"
        );
    }

    #[test]
    fn string_max_length_is_enforced() {
        let ty = FieldType::String { max_length: Some(3) };
        assert_eq!(ty.coerce(&json!("abc")).unwrap(), Value::Str("abc".into()));
        assert_eq!(ty.coerce(&json!("abcd")).unwrap_err().error_type, "string_too_long");
        assert_eq!(ty.coerce(&json!(5)).unwrap_err().error_type, "string_type");
    }

    #[test]
    fn parses_temporal_values() {
        assert_eq!(
            FieldType::Date.coerce(&json!("2024-01-15")).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap())
        );
        let dt = FieldType::Datetime
            .coerce(&json!("2024-01-15T10:30:00Z"))
            .unwrap();
        assert_eq!(dt.canonical_string(), "2024-01-15T10:30:00Z");
        let dt = FieldType::Datetime
            .coerce(&json!("2024-01-15 10:30:00.250"))
            .unwrap();
        assert!(matches!(dt, Value::DateTime(_)));
    }

    #[test]
    fn canonical_strings_are_stable() {
        assert_eq!(Value::Null.canonical_string(), "");
        assert_eq!(Value::Bool(true).canonical_string(), "true");
        assert_eq!(
            Value::Decimal(Decimal::from_str("19.990").unwrap()).canonical_string(),
            "19.990"
        );
        assert_eq!(Value::Float(3.5).canonical_string(), "3.5");
    }

    #[test]
    fn email_validation() {
        assert!(FieldType::Email.coerce(&json!("a@example.com")).is_ok());
        assert_eq!(
            FieldType::Email.coerce(&json!("nope")).unwrap_err().error_type,
            "email_parsing"
        );
    }
}
