//! Tagged Values
//!
//! Values are opaque strings on the wire; internally numeric payloads are
//! kept as int64/float64 variants so INCR/DECR operate without re-parsing.

use std::fmt;

use crate::error::Error;

/// A stored value. Lifting from the wire only tags a payload as numeric
/// when re-rendering it reproduces the original bytes, so `GET` always
/// returns exactly what was `PUT`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
}

impl Value {
    /// Lift a wire payload into its tagged form.
    pub fn lift(raw: &str) -> Self {
        if let Ok(i) = raw.parse::<i64>() {
            if i.to_string() == raw {
                return Value::Int(i);
            }
        }
        if let Ok(f) = raw.parse::<f64>() {
            if f.is_finite() && format_float(f) == raw {
                return Value::Float(f);
            }
        }
        Value::Str(raw.to_string())
    }

    /// Numeric view of the value, parsing string payloads with the same
    /// int64-else-float64 rule applied to operands.
    pub fn as_number(&self) -> Result<Number, Error> {
        match self {
            Value::Int(i) => Ok(Number::Int(*i)),
            Value::Float(f) => Ok(Number::Float(*f)),
            Value::Str(s) => Number::parse(s),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => f.write_str(&format_float(*x)),
        }
    }
}

/// A parsed numeric operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    /// Parse as int64, falling back to float64.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if let Ok(i) = raw.parse::<i64>() {
            return Ok(Number::Int(i));
        }
        match raw.parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(Number::Float(f)),
            _ => Err(Error::InvalidValue),
        }
    }

    /// Add another number, promoting to float on mixed types.
    pub fn add(self, other: Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => Number::Int(a.wrapping_add(b)),
            (a, b) => Number::Float(a.as_f64() + b.as_f64()),
        }
    }

    /// Subtract another number, promoting to float on mixed types.
    pub fn sub(self, other: Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => Number::Int(a.wrapping_sub(b)),
            (a, b) => Number::Float(a.as_f64() - b.as_f64()),
        }
    }

    pub fn is_negative(&self) -> bool {
        match self {
            Number::Int(i) => *i < 0,
            Number::Float(f) => *f < 0.0,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        match n {
            Number::Int(i) => Value::Int(i),
            Number::Float(f) => Value::Float(f),
        }
    }
}

/// Decimal rendering with minimal precision (no trailing zeros).
fn format_float(f: f64) -> String {
    format!("{}", f)
}
