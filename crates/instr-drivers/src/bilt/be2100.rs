//! Bilt BE2100 card: high-stability DC voltage source.
//!
//! Cards answer ordinary SCPI once selected; the schema's command prefix
//! (`I{ch_id};`) does the selection on every exchange. The voltage range
//! can only change while the output is off, and switching it invalidates
//! the voltage validator, which is rebuilt from the range on demand.

use std::sync::Arc;

use instr_core::{Discard, Feature, Limits, Result, Schema};

/// Model ids of the BE2100 family (suffix after the `BE` prefix).
pub const MODEL_IDS: &[&str] = &["2101", "2102", "2103"];

/// Output resolution per range.
fn resolution(range: f64) -> f64 {
    if range > 2.0 {
        1e-5
    } else {
        1e-6
    }
}

/// Schema of one card.
pub fn schema() -> Result<Arc<Schema>> {
    Schema::builder("be2100")
        .command_prefix("I{ch_id};")
        .feature(
            Feature::bool("output")
                .get("OUT?")
                .set("OUT {value}")
                .mapping([(true, "1"), (false, "0")]),
        )
        .feature(
            Feature::float("voltage")
                .get("VOLT?")
                .set("VOLT {value:E}")
                .unit("V")
                .limits_resolver("voltage"),
        )
        .feature(
            Feature::float("voltage_range")
                .get("VOLT:RANG?")
                .set("VOLT:RANG {value}")
                .extract("{},{_}")
                .limits(Limits::discrete([1.2, 12.0]))
                .check("output disabled", |node, _value| {
                    Box::pin(async move { Ok(!node.get_bool("output").await?) })
                })
                .discard([Discard::limits("voltage")]),
        )
        .limits_resolver("voltage", |node| {
            Box::pin(async move {
                let range = node.get_f64("voltage_range").await?;
                Ok(Limits::float_step(-range, range, resolution(range)).unit("V"))
            })
        })
        .build()
}
