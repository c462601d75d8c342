//! Range/step/enum validation for feature values.
//!
//! A [`Limits`] validator is either declared statically on a feature or
//! rebuilt on demand by a named resolver reading sibling state (e.g. voltage
//! bounds recomputed from the selected range). Resolved validators are
//! cached per container instance and dropped by `discard limits` edges.
//!
//! Validation is idempotent: a valid value comes back unchanged. Values at
//! exactly `low` or `high` pass; a step grid is checked within floating
//! tolerance. Clamping, when a feature opts in, snaps numeric values to the
//! nearest bound and grid point; discrete sets never clamp.

use std::fmt;

use crate::error::{InstrError, Result};
use crate::value::{approx_eq, Quantity, Value};

/// Relative tolerance for step-grid membership.
const STEP_TOLERANCE: f64 = 1e-6;

/// A range/step/enum validator.
#[derive(Debug, Clone, PartialEq)]
pub enum Limits {
    Float {
        low: f64,
        high: f64,
        step: Option<f64>,
        unit: Option<String>,
    },
    Int {
        low: i64,
        high: i64,
        step: Option<i64>,
    },
    Discrete(Vec<Value>),
}

impl Limits {
    pub fn float(low: f64, high: f64) -> Self {
        Limits::Float {
            low,
            high,
            step: None,
            unit: None,
        }
    }

    pub fn float_step(low: f64, high: f64, step: f64) -> Self {
        Limits::Float {
            low,
            high,
            step: Some(step),
            unit: None,
        }
    }

    pub fn int(low: i64, high: i64) -> Self {
        Limits::Int {
            low,
            high,
            step: None,
        }
    }

    pub fn discrete(values: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        Limits::Discrete(values.into_iter().map(Into::into).collect())
    }

    /// Tag a numeric validator with a unit (documentation only; values are
    /// normalized before validation).
    pub fn unit(mut self, tag: impl Into<String>) -> Self {
        if let Limits::Float { unit, .. } = &mut self {
            *unit = Some(tag.into());
        }
        self
    }

    /// Declaration sanity, checked once at schema build time.
    pub fn well_formed(&self) -> Result<()> {
        match self {
            Limits::Float { low, high, step, .. } => {
                if low > high {
                    return Err(InstrError::config(format!(
                        "limits low {} > high {}",
                        low, high
                    )));
                }
                if let Some(step) = step {
                    if *step <= 0.0 {
                        return Err(InstrError::config(format!("limits step {} <= 0", step)));
                    }
                }
                Ok(())
            }
            Limits::Int { low, high, step } => {
                if low > high {
                    return Err(InstrError::config(format!(
                        "limits low {} > high {}",
                        low, high
                    )));
                }
                if matches!(step, Some(s) if *s <= 0) {
                    return Err(InstrError::config("limits step <= 0"));
                }
                Ok(())
            }
            Limits::Discrete(values) => {
                if values.is_empty() {
                    return Err(InstrError::config("empty discrete limits"));
                }
                Ok(())
            }
        }
    }

    /// Check `value` against the validator. Valid values are returned
    /// unchanged; with `clamp` numeric values snap to the nearest bound and
    /// step grid instead of failing.
    pub fn validate(&self, feature: &str, value: &Value, clamp: bool) -> Result<Value> {
        match self {
            Limits::Float {
                low, high, step, ..
            } => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| self.rejection(feature, value))?;
                let in_range = (v >= *low || approx_eq(v, *low)) && (v <= *high || approx_eq(v, *high));
                let on_grid = match step {
                    Some(step) => {
                        let offset = (v - low) / step;
                        (offset - offset.round()).abs() <= STEP_TOLERANCE
                    }
                    None => true,
                };
                if in_range && on_grid {
                    return Ok(value.clone());
                }
                if !clamp {
                    return Err(self.rejection(feature, value));
                }
                let mut clamped = v.clamp(*low, *high);
                if let Some(step) = step {
                    let k = ((clamped - low) / step).round();
                    clamped = (low + k * step).clamp(*low, *high);
                }
                Ok(renumber(value, clamped))
            }
            Limits::Int { low, high, step } => {
                let v = value
                    .as_i64()
                    .ok_or_else(|| self.rejection(feature, value))?;
                let on_grid = step.map_or(true, |s| (v - low) % s == 0);
                if v >= *low && v <= *high && on_grid {
                    return Ok(value.clone());
                }
                if !clamp {
                    return Err(self.rejection(feature, value));
                }
                let mut clamped = v.clamp(*low, *high);
                if let Some(s) = step {
                    clamped = low + ((clamped - low) / s) * s;
                }
                Ok(Value::Int(clamped))
            }
            Limits::Discrete(values) => {
                if values.iter().any(|allowed| allowed.loosely_eq(value)) {
                    Ok(value.clone())
                } else {
                    Err(self.rejection(feature, value))
                }
            }
        }
    }

    fn rejection(&self, feature: &str, value: &Value) -> InstrError {
        InstrError::OutOfRange {
            feature: feature.to_string(),
            value: value.to_string(),
            limits: self.to_string(),
        }
    }
}

/// Keep the caller's value form (quantity stays a quantity) when clamping.
fn renumber(original: &Value, magnitude: f64) -> Value {
    match original {
        Value::Quantity(q) => Value::Quantity(Quantity::new(magnitude, q.unit.clone())),
        _ => Value::Float(magnitude),
    }
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limits::Float {
                low,
                high,
                step,
                unit,
            } => {
                write!(f, "[{}, {}]", low, high)?;
                if let Some(step) = step {
                    write!(f, " step {}", step)?;
                }
                if let Some(unit) = unit {
                    write!(f, " {}", unit)?;
                }
                Ok(())
            }
            Limits::Int { low, high, step } => {
                write!(f, "[{}, {}]", low, high)?;
                if let Some(step) = step {
                    write!(f, " step {}", step)?;
                }
                Ok(())
            }
            Limits::Discrete(values) => {
                let names: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "one of {{{}}}", names.join(", "))
            }
        }
    }
}
