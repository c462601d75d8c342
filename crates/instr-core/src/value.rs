//! Dynamic value model shared by features, actions and caches.
//!
//! Instrument attributes are dynamically typed at the engine level: a driver
//! declares the expected kind and the engine moves [`Value`]s between the
//! caller, the cache and the wire. [`Value::Quantity`] attaches a unit tag to
//! a magnitude; [`Value::Empty`] models device "no value" sentinels (e.g. an
//! ANC300 answering `?` for a capacitance that was never measured).
//!
//! Unit handling here is deliberately minimal: a tag, plus conversion between
//! SI-prefixed spellings of the same base unit. Anything richer belongs to an
//! external unit library.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{InstrError, Result};

/// A magnitude with a unit tag, e.g. `12.5 mV`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub magnitude: f64,
    pub unit: String,
}

impl Quantity {
    pub fn new(magnitude: f64, unit: impl Into<String>) -> Self {
        Self {
            magnitude,
            unit: unit.into(),
        }
    }

    /// Express this quantity in `target` units.
    ///
    /// Only SI-prefix rescaling within the same base unit is supported
    /// (`mV` -> `V`, `muF` -> `F`). A different base unit is a
    /// [`InstrError::UnitMismatch`].
    pub fn to_unit(&self, target: &str) -> Result<f64> {
        if self.unit == target {
            return Ok(self.magnitude);
        }
        let (from_scale, from_base) = split_prefix(&self.unit);
        let (to_scale, to_base) = split_prefix(target);
        if from_base != to_base {
            return Err(InstrError::UnitMismatch {
                from: self.unit.clone(),
                to: target.to_string(),
            });
        }
        Ok(self.magnitude * from_scale / to_scale)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.magnitude, self.unit)
    }
}

/// Split an SI prefix off a unit spelling, returning (scale, base unit).
///
/// Accepts `mu` and `u` for micro. Single-letter units ("V", "A", "s") are
/// never themselves treated as a prefix.
fn split_prefix(unit: &str) -> (f64, &str) {
    const PREFIXES: &[(&str, f64)] = &[
        ("mu", 1e-6),
        ("G", 1e9),
        ("M", 1e6),
        ("k", 1e3),
        ("m", 1e-3),
        ("u", 1e-6),
        ("n", 1e-9),
        ("p", 1e-12),
    ];
    for (prefix, scale) in PREFIXES {
        if let Some(base) = unit.strip_prefix(prefix) {
            if !base.is_empty() {
                return (*scale, base);
            }
        }
    }
    (1.0, unit)
}

/// Dynamically typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Quantity(Quantity),
    /// The instrument reported "no value available".
    Empty,
}

impl Value {
    pub fn quantity(magnitude: f64, unit: impl Into<String>) -> Self {
        Value::Quantity(Quantity::new(magnitude, unit))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Numeric magnitude, dropping any unit tag.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Quantity(q) => Some(q.magnitude),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_quantity(&self) -> Option<&Quantity> {
        match self {
            Value::Quantity(q) => Some(q),
            _ => None,
        }
    }

    /// Loose equality used for mapping-domain lookups: floats compare within
    /// relative tolerance, ints and floats compare numerically, quantities by
    /// magnitude.
    pub fn loosely_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Empty, Value::Empty) => true,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => approx_eq(a, b),
                _ => false,
            },
        }
    }
}

/// Relative float comparison used for mapping lookups and step validation.
pub(crate) fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", if *b { "1" } else { "0" }),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
            Value::Quantity(q) => write!(f, "{}", q.magnitude),
            Value::Empty => Ok(()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Quantity> for Value {
    fn from(v: Quantity) -> Self {
        Value::Quantity(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_conversion() {
        let q = Quantity::new(1500.0, "mV");
        assert_eq!(q.to_unit("V").unwrap(), 1.5);
        let q = Quantity::new(2.2, "muF");
        assert!((q.to_unit("F").unwrap() - 2.2e-6).abs() < 1e-18);
        let q = Quantity::new(0.01, "V");
        assert_eq!(q.to_unit("mV").unwrap(), 10.0);
    }

    #[test]
    fn mismatched_base_unit_is_rejected() {
        let q = Quantity::new(1.0, "V");
        assert!(matches!(
            q.to_unit("A"),
            Err(InstrError::UnitMismatch { .. })
        ));
    }

    #[test]
    fn single_letter_units_are_not_prefixes() {
        // "m" alone is metres, not the milli prefix.
        assert_eq!(split_prefix("m"), (1.0, "m"));
        assert_eq!(split_prefix("mV"), (1e-3, "V"));
        assert_eq!(split_prefix("Hz"), (1.0, "Hz"));
        assert_eq!(split_prefix("kHz"), (1e3, "Hz"));
    }

    #[test]
    fn loose_equality_across_numeric_kinds() {
        assert!(Value::Float(2.0).loosely_eq(&Value::Int(2)));
        assert!(Value::quantity(1.2, "V").loosely_eq(&Value::Float(1.2)));
        assert!(!Value::Float(2.0).loosely_eq(&Value::Str("2".into())));
        assert!(Value::Float(10e-3).loosely_eq(&Value::Float(0.010)));
    }
}
