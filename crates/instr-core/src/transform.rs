//! Bidirectional conversion between user-facing values and wire text.
//!
//! A [`Transform`] is attached to every feature declaration. On the way out
//! it normalizes the caller's value (alias spellings, quantity rescaling)
//! and produces the wire-ready token; on the way in it extracts the relevant
//! field from the response, resolves mapping tokens back to user values and
//! parses plain text by the declared kind.
//!
//! Round-trip law: for every value `v` in a mapping's domain,
//! `decode(encode(v)) == v`.

use crate::error::{InstrError, Result};
use crate::template;
use crate::value::{Quantity, Value};

/// Expected value kind of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Bool,
    Int,
    Float,
    Str,
}

/// Value transform bound to one feature declaration.
#[derive(Debug, Clone)]
pub struct Transform {
    kind: Kind,
    /// Ordered user value -> wire token pairs.
    mapping: Vec<(Value, String)>,
    /// Extra accepted user spellings, normalized before anything else.
    aliases: Vec<(String, Value)>,
    /// Unit tag attached to decoded floats and stripped from quantities.
    unit: Option<String>,
    /// Extraction pattern applied to the raw response; field 0 is the value.
    extract: Option<String>,
    /// Wire text meaning "no value available".
    empty_token: Option<String>,
}

impl Transform {
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            mapping: Vec::new(),
            aliases: Vec::new(),
            unit: None,
            extract: None,
            empty_token: None,
        }
    }

    pub fn with_mapping<V, T>(mut self, pairs: impl IntoIterator<Item = (V, T)>) -> Self
    where
        V: Into<Value>,
        T: Into<String>,
    {
        self.mapping = pairs
            .into_iter()
            .map(|(v, t)| (v.into(), t.into()))
            .collect();
        self
    }

    pub fn with_aliases<V: Into<Value>>(
        mut self,
        pairs: impl IntoIterator<Item = (&'static str, V)>,
    ) -> Self {
        self.aliases = pairs
            .into_iter()
            .map(|(s, v)| (s.to_string(), v.into()))
            .collect();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_extract(mut self, pattern: impl Into<String>) -> Self {
        self.extract = Some(pattern.into());
        self
    }

    pub fn with_empty_token(mut self, token: impl Into<String>) -> Self {
        self.empty_token = Some(token.into());
        self
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn mapping(&self) -> &[(Value, String)] {
        &self.mapping
    }

    /// Bring a caller-supplied value into canonical form: resolve alias
    /// spellings, rescale quantities to the declared unit, coerce 0/1 to
    /// booleans for boolean features.
    pub fn normalize(&self, value: &Value) -> Result<Value> {
        if let Value::Str(s) = value {
            if let Some((_, canonical)) = self.aliases.iter().find(|(spelling, _)| spelling == s) {
                return Ok(canonical.clone());
            }
        }
        match (&self.unit, value) {
            (Some(unit), Value::Quantity(q)) => {
                Ok(Value::Quantity(Quantity::new(q.to_unit(unit)?, unit)))
            }
            (Some(unit), Value::Float(f)) if self.mapping.is_empty() && self.kind == Kind::Float => {
                Ok(Value::Quantity(Quantity::new(*f, unit)))
            }
            (Some(unit), Value::Int(i)) if self.mapping.is_empty() && self.kind == Kind::Float => {
                Ok(Value::Quantity(Quantity::new(*i as f64, unit)))
            }
            _ => {
                if self.kind == Kind::Bool {
                    if let Value::Int(i) = value {
                        return Ok(Value::Bool(*i != 0));
                    }
                }
                Ok(value.clone())
            }
        }
    }

    /// Produce the wire-ready value for a normalized user value. Mapping
    /// features emit their token; unmapped features strip units and spell
    /// booleans as `1`/`0`.
    pub fn encode(&self, feature: &str, value: &Value) -> Result<Value> {
        if !self.mapping.is_empty() {
            return self
                .mapping
                .iter()
                .find(|(user, _)| user.loosely_eq(value))
                .map(|(_, token)| Value::Str(token.clone()))
                .ok_or_else(|| InstrError::OutOfRange {
                    feature: feature.to_string(),
                    value: value.to_string(),
                    limits: format!("one of {}", self.domain_description()),
                });
        }
        Ok(match value {
            Value::Bool(b) => Value::Str(if *b { "1" } else { "0" }.to_string()),
            Value::Quantity(q) => Value::Float(q.magnitude),
            other => other.clone(),
        })
    }

    /// Decode a raw response into a user value.
    pub fn decode(&self, feature: &str, raw: &str) -> Result<Value> {
        let field;
        let mut text = raw;
        if let Some(pattern) = &self.extract {
            match template::extract(pattern, raw.trim())? {
                Some(fields) if !fields.is_empty() => {
                    field = fields.into_iter().next().unwrap_or_default();
                    text = &field;
                }
                _ => return Err(self.protocol_error(feature, raw)),
            }
        }
        let text = text.trim();

        if self.empty_token.as_deref() == Some(text) {
            return Ok(Value::Empty);
        }

        if !self.mapping.is_empty() {
            return self
                .mapping
                .iter()
                .find(|(_, token)| token == text)
                .map(|(user, _)| user.clone())
                .ok_or_else(|| self.protocol_error(feature, raw));
        }

        match self.kind {
            Kind::Str => Ok(Value::Str(text.to_string())),
            Kind::Bool => match text.to_ascii_lowercase().as_str() {
                "1" | "on" | "true" => Ok(Value::Bool(true)),
                "0" | "off" | "false" => Ok(Value::Bool(false)),
                _ => Err(self.protocol_error(feature, raw)),
            },
            Kind::Int => text
                .parse::<i64>()
                .ok()
                .or_else(|| {
                    text.parse::<f64>()
                        .ok()
                        .filter(|f| f.fract() == 0.0)
                        .map(|f| f as i64)
                })
                .map(Value::Int)
                .ok_or_else(|| self.protocol_error(feature, raw)),
            Kind::Float => {
                let f: f64 = text
                    .parse()
                    .map_err(|_| self.protocol_error(feature, raw))?;
                Ok(match &self.unit {
                    Some(unit) => Value::Quantity(Quantity::new(f, unit)),
                    None => Value::Float(f),
                })
            }
        }
    }

    fn protocol_error(&self, feature: &str, raw: &str) -> InstrError {
        InstrError::Protocol {
            feature: feature.to_string(),
            raw: raw.to_string(),
        }
    }

    fn domain_description(&self) -> String {
        let names: Vec<String> = self.mapping.iter().map(|(v, _)| v.to_string()).collect();
        format!("{{{}}}", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_round_trip_law() {
        let t = Transform::new(Kind::Str).with_mapping([("Ground", "gnd"), ("Step", "stp")]);
        for v in [Value::Str("Ground".into()), Value::Str("Step".into())] {
            let wire = t.encode("mode", &v).unwrap();
            let back = t.decode("mode", &wire.to_string()).unwrap();
            assert_eq!(back, v);
        }
    }

    #[test]
    fn float_mapping_round_trip() {
        let t = Transform::new(Kind::Float).with_mapping([
            (10e-3, "2"),
            (100e-3, "3"),
            (1.0, "4"),
            (10.0, "5"),
            (30.0, "6"),
        ]);
        assert_eq!(t.decode("voltage_range", "4").unwrap(), Value::Float(1.0));
        assert_eq!(
            t.encode("voltage_range", &Value::Float(10e-3)).unwrap(),
            Value::Str("2".into())
        );
        for (user, _) in t.mapping().iter() {
            let wire = t.encode("voltage_range", user).unwrap();
            assert_eq!(&t.decode("voltage_range", &wire.to_string()).unwrap(), user);
        }
    }

    #[test]
    fn mapping_miss_is_out_of_range() {
        let t = Transform::new(Kind::Str).with_mapping([("Ground", "gnd")]);
        let err = t.encode("mode", &Value::Str("Fly".into())).unwrap_err();
        assert!(matches!(err, InstrError::OutOfRange { .. }));
    }

    #[test]
    fn unknown_wire_token_is_protocol_error() {
        let t = Transform::new(Kind::Str).with_mapping([("Ground", "gnd")]);
        let err = t.decode("mode", "xyz").unwrap_err();
        assert!(matches!(err, InstrError::Protocol { .. }));
    }

    #[test]
    fn unit_attach_and_strip() {
        let t = Transform::new(Kind::Float).with_unit("V");
        let decoded = t.decode("voltage", "1.5E0").unwrap();
        assert_eq!(decoded, Value::quantity(1.5, "V"));

        let normalized = t.normalize(&Value::quantity(200.0, "mV")).unwrap();
        assert_eq!(normalized, Value::quantity(0.2, "V"));
        assert_eq!(t.encode("voltage", &normalized).unwrap(), Value::Float(0.2));
    }

    #[test]
    fn aliases_normalize_to_canonical() {
        let t = Transform::new(Kind::Bool)
            .with_mapping([(true, "1"), (false, "0")])
            .with_aliases([("On", true), ("ON", true), ("Off", false), ("OFF", false)]);
        assert_eq!(
            t.normalize(&Value::Str("ON".into())).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            t.encode("output", &Value::Bool(true)).unwrap(),
            Value::Str("1".into())
        );
    }

    #[test]
    fn empty_token_decodes_to_empty() {
        let t = Transform::new(Kind::Float).with_unit("muF").with_empty_token("?");
        assert_eq!(t.decode("saved_capacitance", "?").unwrap(), Value::Empty);
        assert_eq!(
            t.decode("saved_capacitance", "12.5").unwrap(),
            Value::quantity(12.5, "muF")
        );
    }

    #[test]
    fn extraction_keeps_first_field() {
        let t = Transform::new(Kind::Float).with_extract("{},{_}");
        assert_eq!(t.decode("voltage_range", "1.2,0").unwrap(), Value::Float(1.2));
        assert!(t.decode("voltage_range", "nonsense").is_err());
    }

    #[test]
    fn bool_without_mapping_uses_conventional_spellings() {
        let t = Transform::new(Kind::Bool);
        assert_eq!(t.decode("output", "ON").unwrap(), Value::Bool(true));
        assert_eq!(t.decode("output", "0").unwrap(), Value::Bool(false));
        assert_eq!(
            t.encode("output", &Value::Bool(false)).unwrap(),
            Value::Str("0".into())
        );
    }
}
