//! Yokogawa GS200 DC power source.
//!
//! A single-channel source/measure unit sourcing either voltage or current
//! (`function`). Level bounds depend on the selected range: every range
//! except the top one may be overdriven by 20%, and the programming
//! resolution shrinks with the range, so the level validators are rebuilt
//! from the live range whenever a range change drops them.
//!
//! Sets are verified through the status byte: an error summary bit set
//! after a command means it was rejected, and the error queue text is
//! reported verbatim.

use std::sync::Arc;

use instr_core::{
    Action, Backend, Discard, Feature, InstrError, Limits, Node, Result, Schema, Value,
};

use crate::base::identity;
use crate::common::ieee488;

/// Programming resolution per voltage range.
const VOLTAGE_RESOLUTION: [(f64, f64); 5] = [
    (10e-3, 1e-7),
    (100e-3, 1e-6),
    (1.0, 1e-5),
    (10.0, 1e-4),
    (30.0, 1e-3),
];

/// Programming resolution per current range.
const CURRENT_RESOLUTION: [(f64, f64); 4] = [
    (1e-3, 1e-8),
    (10e-3, 1e-7),
    (100e-3, 1e-6),
    (200e-3, 1e-6),
];

/// Error summary bit in the status byte.
const STB_ERROR_BIT: i64 = 1 << 2;

fn lookup(table: &[(f64, f64)], range: f64) -> Option<f64> {
    table
        .iter()
        .find(|(r, _)| (r - range).abs() <= 1e-9 * r.abs().max(1.0))
        .map(|(_, res)| *res)
}

/// Open a driver on an already-connected backend.
pub fn open(backend: Arc<Backend>) -> Result<Arc<Node>> {
    Ok(Node::root(schema()?, backend))
}

/// Full instrument schema.
pub fn schema() -> Result<Arc<Schema>> {
    Schema::builder("gs200")
        .include(ieee488::status_reporting())
        .include(ieee488::internal_operations())
        .include(ieee488::synchronisation())
        .include(ieee488::options_identification())
        .subsystem("identity", identity::subsystem_schema()?)
        .feature(
            Feature::text("function")
                .get(":SOUR:FUNC?")
                .set(":SOUR:FUNC {value}")
                .mapping([("Voltage", "VOLT"), ("Current", "CURR")]),
        )
        .feature(
            Feature::bool("output")
                .get("OUTP:STAT?")
                .set("OUTP:STAT {value}")
                .mapping([(true, "1"), (false, "0")]),
        )
        .feature(
            Feature::float("voltage")
                .get(":SOUR:LEV?")
                .set(":SOUR:LEV {value:E}")
                .unit("V")
                .limits_resolver("voltage")
                .check("function is Voltage", check_function("Voltage")),
        )
        .feature(
            Feature::float("voltage_range")
                .get(":SOUR:RANG?")
                .set(":SOUR:RANG {value:E}")
                .unit("V")
                .limits(Limits::discrete([10e-3, 100e-3, 1.0, 10.0, 30.0]))
                .discard([Discard::limits("voltage")])
                .check("function is Voltage", check_function("Voltage")),
        )
        .feature(
            Feature::float("current")
                .get(":SOURce:LEVel?")
                .set(":SOURce:LEVel {value:E}")
                .unit("A")
                .limits_resolver("current")
                .check("function is Current", check_function("Current")),
        )
        .feature(
            Feature::float("current_range")
                .get(":SOURce:RANGe?")
                .set(":SOURce:RANGe {value:E}")
                .unit("A")
                .limits(Limits::discrete([1e-3, 10e-3, 100e-3, 200e-3]))
                .discard([Discard::limits("current")])
                .check("function is Current", check_function("Current")),
        )
        .feature(
            Feature::float("current_limit")
                .get(":SOUR:PROT:CURR?")
                .set(":SOUR:PROT:CURR {value}")
                .unit("A")
                .limits(Limits::float_step(1e-3, 200e-3, 1e-3).unit("A"))
                // On the low voltage ranges the compliance circuit is fixed
                // at its maximum.
                .check("voltage range above 100 mV or limit at maximum", |node, value| {
                    Box::pin(async move {
                        let range = node.get_f64("voltage_range").await?;
                        let low_range = lookup(&VOLTAGE_RESOLUTION[..2], range).is_some();
                        let at_max = value
                            .as_f64()
                            .map(|v| (v - 200e-3).abs() < 1e-9)
                            .unwrap_or(false);
                        Ok(!low_range || at_max)
                    })
                }),
        )
        .feature(
            Feature::float("voltage_limit")
                .get(":SOUR:PROT:VOLT?")
                .set(":SOUR:PROT:VOLT {value}")
                .unit("V")
                .limits(Limits::float_step(1.0, 30.0, 1.0).unit("V")),
        )
        .limits_resolver("voltage", |node| {
            Box::pin(async move {
                let range = node.get_f64("voltage_range").await?;
                let resolution = lookup(&VOLTAGE_RESOLUTION, range).ok_or_else(|| {
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
        .limits_resolver("current", |node| {
            Box::pin(async move {
                let range = node.get_f64("current_range").await?;
                let resolution = lookup(&CURRENT_RESOLUTION, range).ok_or_else(|| {
                    InstrError::config(format!("unsupported current range {}", range))
                })?;
                let span = if (range - 200e-3).abs() < 1e-12 {
                    range
                } else {
                    range * 1.2
                };
                Ok(Limits::float_step(-span, span, resolution).unit("A"))
            })
        })
        .action(Action::new("read_errors", |node, _args| {
            Box::pin(async move {
                let reply = node.backend().query(":SYST:ERR?").await?;
                Ok(Value::Str(reply))
            })
        }))
        .operation_check(|node, _outcome| {
            Box::pin(async move {
                let status = node.get("status_byte").await?;
                let mask = status.as_i64().unwrap_or(0);
                if mask & STB_ERROR_BIT != 0 {
                    let message = node.backend().query(":SYST:ERR?").await?;
                    Ok(Some(message))
                } else {
                    Ok(None)
                }
            })
        })
        .build()
}

fn check_function(
    expected: &'static str,
) -> impl Fn(Arc<Node>, Value) -> futures::future::BoxFuture<'static, Result<bool>>
       + Send
       + Sync
       + 'static {
    move |node, _value| {
        Box::pin(async move {
            Ok(node.get("function").await? == Value::Str(expected.to_string()))
        })
    }
}
