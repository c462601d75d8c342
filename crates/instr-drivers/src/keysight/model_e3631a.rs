//! Keysight E3631A triple-output DC power source.
//!
//! Three fixed outputs (`P6V`, `P25V`, `N25V`) share one command set; the
//! active output is selected with `INST:SEL` on every exchange, which the
//! channel schema declares as its command prefix. Output enablement is
//! global — the per-channel `enabled` feature delegates to the root's
//! `outputs_enabled`.
//!
//! Level commands depend on the trigger subsystem: with triggering enabled
//! the instrument programs `VOLT:TRIG`/`CURR:TRIG` instead of the immediate
//! forms, so the voltage/current templates are resolved against the trigger
//! mode at call time. This firmware revision never reports a triggered
//! mode, hence the constant `disabled`.

use std::sync::Arc;

use futures::future::BoxFuture;
use instr_core::{
    Backend, ChannelIds, Feature, InstrError, Limits, Node, Quantity, Result, Schema, Value,
};

use crate::base::identity;
use crate::common::{ieee488, scpi};

/// Voltage full scale per output id.
const VOLTAGE_RANGES: [(&str, f64); 3] = [("P6V", 6.0), ("P25V", 25.0), ("N25V", -25.0)];

/// Current full scale per output id.
const CURRENT_RANGES: [(&str, f64); 3] = [("P6V", 5.0), ("P25V", 1.0), ("N25V", 1.0)];

/// Open a driver on an already-connected backend.
pub fn open(backend: Arc<Backend>) -> Result<Arc<Node>> {
    Ok(Node::root(schema()?, backend))
}

/// Full instrument schema.
pub fn schema() -> Result<Arc<Schema>> {
    Schema::builder("e3631a")
        .include(ieee488::status_reporting())
        .include(ieee488::internal_operations())
        .include(ieee488::synchronisation())
        .include(ieee488::options_identification())
        .include(ieee488::stored_settings())
        .include(ieee488::power_on())
        .include(ieee488::trigger())
        .include(scpi::error_reading())
        .subsystem("identity", identity::subsystem_schema()?)
        .feature(
            Feature::bool("outputs_enabled")
                .get("OUTP?")
                .set("OUTP {value}")
                .mapping([(true, "1"), (false, "0")])
                .aliases([
                    ("On", true),
                    ("ON", true),
                    ("on", true),
                    ("Off", false),
                    ("OFF", false),
                    ("off", false),
                ]),
        )
        .feature(
            Feature::bool("outputs_tracking")
                .get("OUTP:TRAC?")
                .set("OUTP:TRAC {value}")
                .mapping([(true, "1"), (false, "0")]),
        )
        .channel(
            "output",
            ChannelIds::list(["P6V", "P25V", "N25V"]),
            output_schema()?,
        )
        .operation_check(scpi::operation_check)
        .build()
}

/// Schema of one output.
fn output_schema() -> Result<Arc<Schema>> {
    Schema::builder("output")
        .command_prefix("INST:SEL {ch_id};")
        .feature(Feature::bool("enabled").computed("outputs_enabled").no_cache())
        .feature(
            Feature::float("voltage")
                .get_conditional("voltage_get")
                .set_conditional("voltage_set")
                .unit("V")
                .limits_resolver("voltage"),
        )
        .feature(Feature::float("voltage_range").unit("V").computed("voltage_range"))
        .feature(
            Feature::float("current")
                .get_conditional("current_get")
                .set_conditional("current_set")
                .unit("A")
                .limits_resolver("current"),
        )
        .feature(Feature::float("current_range").unit("A").computed("current_range"))
        .subsystem("trigger", trigger_schema()?)
        .value_resolver("outputs_enabled", |node| {
            Box::pin(async move {
                let root = node
                    .parent()
                    .ok_or_else(|| InstrError::config("output channel detached from its driver"))?;
                root.get("outputs_enabled").await
            })
        })
        .value_resolver("voltage_range", range_resolver(&VOLTAGE_RANGES, "V"))
        .value_resolver("current_range", range_resolver(&CURRENT_RANGES, "A"))
        .template_resolver("voltage_get", level_template("VOLT?", "VOLT:TRIG?"))
        .template_resolver("voltage_set", level_template("VOLT {value}", "VOLT:TRIG {value}"))
        .template_resolver("current_get", level_template("CURR?", "CURR:TRIG?"))
        .template_resolver("current_set", level_template("CURR {value}", "CURR:TRIG {value}"))
        .limits_resolver("voltage", |node| {
            Box::pin(async move {
                Ok(match node.ch_id() {
                    Some("P6V") => Limits::float_step(0.0, 6.18, 1e-3).unit("V"),
                    Some("P25V") => Limits::float_step(0.0, 25.75, 1e-2).unit("V"),
                    Some("N25V") => Limits::float_step(-25.75, 0.0, 1e-2).unit("V"),
                    other => {
                        return Err(InstrError::config(format!(
                            "unknown output id {:?}",
                            other
                        )))
                    }
                })
            })
        })
        .limits_resolver("current", |node| {
            Box::pin(async move {
                Ok(match node.ch_id() {
                    Some("P6V") => Limits::float_step(0.0, 5.15, 1e-3).unit("A"),
                    Some("P25V") | Some("N25V") => Limits::float_step(0.0, 1.03, 1e-3).unit("A"),
                    other => {
                        return Err(InstrError::config(format!(
                            "unknown output id {:?}",
                            other
                        )))
                    }
                })
            })
        })
        .operation_check(scpi::operation_check)
        .build()
}

/// Trigger subsystem of one output.
///
/// The mode getter is a constant: this revision only does immediate
/// programming, and there is no way to switch it remotely.
fn trigger_schema() -> Result<Arc<Schema>> {
    Schema::builder("trigger")
        .command_prefix("INST:SEL {ch_id};")
        .feature(Feature::text("mode").constant("disabled"))
        .feature(
            Feature::text("source")
                .get("TRIG:SOUR?")
                .set("TRIG:SOUR {value}")
                .mapping([("immediate", "IMM"), ("bus", "BUS")]),
        )
        .feature(
            Feature::float("delay")
                .get("TRIG:DEL?")
                .set("TRIG:DEL {value}")
                .unit("s")
                .limits(Limits::float_step(1.0, 3600.0, 1.0).unit("s")),
        )
        .build()
}

/// Immediate or triggered command, depending on the trigger mode.
fn level_template(
    immediate: &'static str,
    triggered: &'static str,
) -> impl Fn(Arc<Node>) -> BoxFuture<'static, Result<String>> + Send + Sync + 'static {
    move |node| {
        Box::pin(async move {
            let trigger = node.subsystem("trigger")?;
            let mode = trigger.get("mode").await?;
            Ok(if mode == Value::Str("enabled".to_string()) {
                triggered.to_string()
            } else {
                immediate.to_string()
            })
        })
    }
}

/// Per-output constant full-scale value.
fn range_resolver(
    table: &'static [(&'static str, f64)],
    unit: &'static str,
) -> impl Fn(Arc<Node>) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static {
    move |node| {
        Box::pin(async move {
            let id = node
                .ch_id()
                .ok_or_else(|| InstrError::config("output channel has no id"))?;
            let range = table
                .iter()
                .find(|(name, _)| *name == id)
                .map(|(_, range)| *range)
                .ok_or_else(|| InstrError::config(format!("unknown output id {:?}", id)))?;
            Ok(Value::Quantity(Quantity::new(range, unit)))
        })
    }
}
