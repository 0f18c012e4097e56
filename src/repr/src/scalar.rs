// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The largest integer magnitude representable losslessly on the JSON wire,
/// i.e. `2^53 - 1`.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// A literal value.
///
/// Datums have a total order so that they can serve as index keys: values of
/// different types order by type rank, values of the same type order
/// naturally. Doubles use the IEEE 754 total order, so `NaN` is ordered (and
/// equal to itself) rather than poisoning comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    /// The null value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// A 64-bit float.
    Double(f64),
    /// A string.
    String(String),
    /// A byte array.
    Bytes(Vec<u8>),
    /// A list of datums. Never stored in the replica; produced by `array`
    /// aggregation and by set-valued query literals.
    Array(Vec<Datum>),
}

impl Datum {
    /// Reports whether this datum is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// The scalar type this datum inhabits, if it is not null.
    pub fn scalar_type(&self) -> Option<ScalarType> {
        match self {
            Datum::Null => None,
            Datum::Bool(_) => Some(ScalarType::Bool),
            Datum::Int(_) => Some(ScalarType::Int8),
            Datum::Double(_) => Some(ScalarType::Float8),
            Datum::String(_) => Some(ScalarType::Text),
            Datum::Bytes(_) => Some(ScalarType::Bytea),
            Datum::Array(_) => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Int(_) => 2,
            Datum::Double(_) => 3,
            Datum::String(_) => 4,
            Datum::Bytes(_) => 5,
            Datum::Array(_) => 6,
        }
    }

    /// Converts this datum to its client wire representation.
    ///
    /// Integers beyond the JSON safe range and non-finite doubles have no
    /// faithful wire encoding and produce an [`UnrepresentableError`]; the
    /// stored data is valid, it merely cannot be sent.
    pub fn to_wire(&self) -> Result<serde_json::Value, UnrepresentableError> {
        match self {
            Datum::Null => Ok(serde_json::Value::Null),
            Datum::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Datum::Int(i) => {
                if i.unsigned_abs() > MAX_SAFE_INTEGER.unsigned_abs() {
                    Err(UnrepresentableError::UnsafeInteger(*i))
                } else {
                    Ok(serde_json::Value::from(*i))
                }
            }
            Datum::Double(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .ok_or(UnrepresentableError::NonFiniteDouble(*d)),
            Datum::String(s) => Ok(serde_json::Value::from(s.as_str())),
            Datum::Bytes(b) => {
                // Byte arrays travel as lowercase hex. Clients that query
                // bytea columns decode on their side.
                let mut s = String::with_capacity(b.len() * 2);
                for byte in b {
                    s.push_str(&format!("{byte:02x}"));
                }
                Ok(serde_json::Value::from(s))
            }
            Datum::Array(items) => {
                let items: Result<Vec<_>, _> = items.iter().map(Datum::to_wire).collect();
                Ok(serde_json::Value::Array(items?))
            }
        }
    }

    /// Converts a client-supplied JSON literal into a datum.
    ///
    /// Whole numbers become integers, everything else maps onto the obvious
    /// variant. Arrays and objects are not scalar literals and are rejected.
    pub fn from_wire(value: &serde_json::Value) -> Result<Datum, UnrepresentableError> {
        match value {
            serde_json::Value::Null => Ok(Datum::Null),
            serde_json::Value::Bool(b) => Ok(Datum::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Datum::Int(i))
                } else if let Some(d) = n.as_f64() {
                    Ok(Datum::Double(d))
                } else {
                    Err(UnrepresentableError::UnsafeLiteral(value.clone()))
                }
            }
            serde_json::Value::String(s) => Ok(Datum::String(s.clone())),
            serde_json::Value::Array(items) => {
                let items: Result<Vec<_>, _> = items.iter().map(Datum::from_wire).collect();
                Ok(Datum::Array(items?))
            }
            serde_json::Value::Object(_) => {
                Err(UnrepresentableError::UnsafeLiteral(value.clone()))
            }
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
            (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
            (Datum::Double(a), Datum::Double(b)) => a.total_cmp(b),
            // Mixed numeric comparisons order by value so that an integer
            // column filtered with a double literal behaves sensibly.
            (Datum::Int(a), Datum::Double(b)) => (*a as f64).total_cmp(b),
            (Datum::Double(a), Datum::Int(b)) => a.total_cmp(&(*b as f64)),
            (Datum::String(a), Datum::String(b)) => a.cmp(b),
            (Datum::Bytes(a), Datum::Bytes(b)) => a.cmp(b),
            (Datum::Array(a), Datum::Array(b)) => a.cmp(b),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => f.write_str("null"),
            Datum::Bool(b) => write!(f, "{b}"),
            Datum::Int(i) => write!(f, "{i}"),
            Datum::Double(d) => write!(f, "{d}"),
            Datum::String(s) => write!(f, "{s:?}"),
            Datum::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Datum::Array(items) => {
                f.write_str("[")?;
                for (i, d) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{d}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for Datum {
    fn from(b: bool) -> Datum {
        Datum::Bool(b)
    }
}

impl From<i64> for Datum {
    fn from(i: i64) -> Datum {
        Datum::Int(i)
    }
}

impl From<i32> for Datum {
    fn from(i: i32) -> Datum {
        Datum::Int(i64::from(i))
    }
}

impl From<f64> for Datum {
    fn from(d: f64) -> Datum {
        Datum::Double(d)
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Datum {
        Datum::String(s.to_owned())
    }
}

impl From<String> for Datum {
    fn from(s: String) -> Datum {
        Datum::String(s)
    }
}

impl<T: Into<Datum>> From<Option<T>> for Datum {
    fn from(v: Option<T>) -> Datum {
        match v {
            Some(v) => v.into(),
            None => Datum::Null,
        }
    }
}

/// The type of a [`Datum`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    /// A boolean.
    Bool,
    /// A 64-bit signed integer.
    Int8,
    /// A 64-bit float.
    Float8,
    /// A string.
    Text,
    /// A byte array.
    Bytea,
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScalarType::Bool => "bool",
            ScalarType::Int8 => "int8",
            ScalarType::Float8 => "float8",
            ScalarType::Text => "text",
            ScalarType::Bytea => "bytea",
        };
        f.write_str(s)
    }
}

/// A value that cannot be represented on the client wire.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UnrepresentableError {
    /// An integer beyond `±(2^53 - 1)`.
    #[error("integer {0} is outside the safe JSON range")]
    UnsafeInteger(i64),
    /// A NaN or infinite double.
    #[error("double {0} has no JSON representation")]
    NonFiniteDouble(f64),
    /// A JSON literal that does not denote a scalar.
    #[error("literal {0} does not denote a scalar value")]
    UnsafeLiteral(serde_json::Value),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_order_across_types() {
        let datums = [
            Datum::Null,
            Datum::Bool(false),
            Datum::Bool(true),
            Datum::Int(-1),
            Datum::Int(7),
            Datum::String("a".into()),
            Datum::Bytes(vec![1]),
        ];
        for w in datums.windows(2) {
            assert!(w[0] < w[1], "{} should sort before {}", w[0], w[1]);
        }
    }

    #[test]
    fn mixed_numerics_compare_by_value() {
        assert_eq!(Datum::Int(2), Datum::Double(2.0));
        assert!(Datum::Int(2) < Datum::Double(2.5));
        assert!(Datum::Double(1.5) < Datum::Int(2));
    }

    #[test]
    fn nan_is_self_equal() {
        let nan = Datum::Double(f64::NAN);
        assert_eq!(nan, nan.clone());
    }

    #[test]
    fn wire_rejects_unsafe_integers() {
        assert!(Datum::Int(MAX_SAFE_INTEGER).to_wire().is_ok());
        assert_eq!(
            Datum::Int(MAX_SAFE_INTEGER + 1).to_wire(),
            Err(UnrepresentableError::UnsafeInteger(MAX_SAFE_INTEGER + 1))
        );
        assert!(Datum::Int(-MAX_SAFE_INTEGER).to_wire().is_ok());
        assert!(Datum::Int(i64::MIN).to_wire().is_err());
    }

    #[test]
    fn wire_rejects_non_finite_doubles() {
        assert!(Datum::Double(1.5).to_wire().is_ok());
        assert!(Datum::Double(f64::NAN).to_wire().is_err());
        assert!(Datum::Double(f64::INFINITY).to_wire().is_err());
    }

    #[test]
    fn wire_round_trip() {
        for d in [
            Datum::Null,
            Datum::Bool(true),
            Datum::Int(42),
            Datum::Double(2.5),
            Datum::String("hi".into()),
        ] {
            let v = d.to_wire().unwrap();
            assert_eq!(Datum::from_wire(&v).unwrap(), d);
        }
    }

    #[test]
    fn from_wire_arrays_and_objects() {
        assert_eq!(
            Datum::from_wire(&serde_json::json!([1, "a"])).unwrap(),
            Datum::Array(vec![Datum::Int(1), Datum::String("a".into())])
        );
        assert!(Datum::from_wire(&serde_json::json!({"a": 1})).is_err());
    }
}
