//! Yokogawa 7651 programmable DC source.
//!
//! An older GPIB instrument speaking program messages rather than SCPI:
//! ranges are selected by code (`R2`..`R6`), the output level is programmed
//! with `S<level>`, the output relay with `O1`/`O0`, and the present value
//! is read back with `OD`, answering a header-prefixed line such as
//! `NDCV+1.00000E+00`.
//!
//! Range codes map to full-scale values; like the GS200, every range but
//! the top one may be overdriven by 20%, so the 1 V range programs
//! -1.2 V..1.2 V in 1 mV steps.

use std::sync::Arc;

use instr_core::{Backend, Discard, Feature, InstrError, Limits, Node, Result, Schema};

/// Full-scale value per range, with the wire code used to select it.
const RANGES: [(f64, &str); 5] = [
    (10e-3, "2"),
    (100e-3, "3"),
    (1.0, "4"),
    (10.0, "5"),
    (30.0, "6"),
];

/// Programming resolution per range.
const RESOLUTION: [(f64, f64); 5] = [
    (10e-3, 1e-5),
    (100e-3, 1e-4),
    (1.0, 1e-3),
    (10.0, 1e-2),
    (30.0, 1e-1),
];

/// Open a driver on an already-connected backend.
pub fn open(backend: Arc<Backend>) -> Result<Arc<Node>> {
    Ok(Node::root(schema()?, backend))
}

/// Full instrument schema.
pub fn schema() -> Result<Arc<Schema>> {
    Schema::builder("yokogawa7651")
        .feature(
            Feature::text("function")
                .set("{value}")
                .mapping([("Voltage", "F1"), ("Current", "F5")]),
        )
        .feature(
            Feature::bool("output")
                .set("{value}")
                .mapping([(true, "O1"), (false, "O0")]),
        )
        .feature(
            Feature::float("voltage")
                .get("OD")
                .extract("NDCV{}")
                .set("S{value:E}")
                .unit("V")
                .limits_resolver("voltage")
                .check("function is Voltage", |node, _value| {
                    Box::pin(async move {
                        Ok(node.get("function").await?
                            == instr_core::Value::Str("Voltage".to_string()))
                    })
                }),
        )
        .feature(
            Feature::float("voltage_range")
                .get("R?")
                .set("R{value}")
                .mapping(RANGES)
                .discard([Discard::limits("voltage")]),
        )
        .limits_resolver("voltage", |node| {
            Box::pin(async move {
                let range = node.get_f64("voltage_range").await?;
                let resolution = RESOLUTION
                    .iter()
                    .find(|(r, _)| (r - range).abs() <= 1e-9 * r.abs().max(1.0))
                    .map(|(_, res)| *res)
                    .ok_or_else(|| {
                        InstrError::config(format!("unsupported voltage range {}", range))
                    })?;
                let span = if (range - 30.0).abs() < 1e-9 {
                    range
                } else {
                    range * 1.2
                };
                Ok(Limits::float_step(-span, span, resolution).unit("V"))
            })
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_builds() {
        let schema = schema().unwrap();
        for name in ["function", "output", "voltage", "voltage_range"] {
            assert!(schema.feature(name).is_some(), "missing feature {}", name);
        }
    }

    #[test]
    fn range_codes_cover_every_resolution_entry() {
        for (range, _) in RANGES {
            assert!(RESOLUTION.iter().any(|(r, _)| *r == range));
        }
    }
}
