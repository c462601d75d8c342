//! Attocube ANC300 open-loop positioner controller.
//!
//! The ANC300 speaks a line protocol over a TCP socket (port 7230) with
//! `\r\n` termination. Every reply is one or more body lines closed by an
//! `OK` or `ERROR` sentinel; `ERROR` bodies carry the complaint text.
//! Modules sit in rack slots 1..=7 and are addressed by slot number in
//! every command.
//!
//! The `anm150` channel exposes the stepper modules found by probing
//! `getser` on each slot. Capacitance measurement is asynchronous on the
//! instrument: `measure_capacitance` starts it and optionally blocks on the
//! `capw` wait command, riding out read timeouts until the sentinel
//! arrives or the caller's deadline expires. A capacitance that was never
//! measured reads back as `?`, decoded as [`Value::Empty`].

use std::sync::Arc;
use std::time::Duration;

use instr_core::{
    Action, Backend, ChannelIds, Discard, Feature, InstrError, Limits, Node, ProtocolConfig,
    Result, Schema, Session, Value,
};

const OK: &str = "OK";
const ERROR: &str = "ERROR";

/// Rack slots that can hold a module.
const SLOTS: std::ops::RangeInclusive<u8> = 1..=7;

/// Default deadline for the asynchronous capacitance measurement.
const CAPACITANCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Framing used by the controller.
pub fn protocol_config() -> ProtocolConfig {
    ProtocolConfig::default().with_termination("\r\n")
}

/// Open a driver on an already-connected backend.
pub fn open(backend: Arc<Backend>) -> Result<Arc<Node>> {
    Ok(Node::root(schema()?, backend))
}

/// Authenticate and silence command echo. Must run once after connecting.
///
/// The console greets with a banner (the first line is not even ASCII),
/// echoes the authentification request, then reports the outcome.
pub async fn initialize(node: &Arc<Node>, password: &str) -> Result<()> {
    let mut session = node.backend().session().await;
    session.write(password).await?;
    let mut status = String::new();
    for _ in 0..4 {
        status = session.read().await?;
        if status.contains("Authentification") && !status.contains(password) {
            break;
        }
    }
    if status != "Authentification success" {
        return Err(InstrError::Device {
            target: "anc300.initialize".to_string(),
            message: status,
        });
    }
    let (terminator, body) = session.query_until("echo off", &[OK, ERROR]).await?;
    if terminator == ERROR {
        return Err(InstrError::Device {
            target: "anc300.initialize".to_string(),
            message: body,
        });
    }
    tracing::info!("ANC300 console authenticated, echo disabled");
    Ok(())
}

/// Root schema: controller-level features plus the stepper channel.
pub fn schema() -> Result<Arc<Schema>> {
    Schema::builder("anc300")
        .feature(Feature::text("version").get("ver").sentinel(OK, ERROR))
        .channel(
            "anm150",
            ChannelIds::resolver("list_anm150"),
            stepper_schema()?,
        )
        .discovery_resolver("list_anm150", |node| {
            Box::pin(async move {
                let mut found = Vec::new();
                for slot in SLOTS {
                    let command = format!("getser {}", slot);
                    let (terminator, body) =
                        node.backend().query_until(&command, &[OK, ERROR]).await?;
                    if terminator == OK && body.starts_with("ANM150") {
                        found.push(slot.to_string());
                    }
                }
                Ok(found)
            })
        })
        .build()
}

/// Schema of one ANM150 stepper module.
fn stepper_schema() -> Result<Arc<Schema>> {
    Schema::builder("anm150")
        .feature(
            Feature::text("serial_number")
                .get("getser {ch_id}")
                .sentinel(OK, ERROR),
        )
        .feature(
            Feature::text("mode")
                .get("getm {ch_id}")
                .set("setm {ch_id} {value}")
                .mapping([("Ground", "gnd"), ("Step", "stp")])
                .sentinel(OK, ERROR),
        )
        .feature(
            Feature::float("frequency")
                .get("getf {ch_id}")
                .set("setf {ch_id} {value}")
                .unit("Hz")
                .limits_resolver("frequency")
                .sentinel(OK, ERROR),
        )
        .feature(
            Feature::float("amplitude")
                .get("getv {ch_id}")
                .set("setv {ch_id} {value}")
                .unit("V")
                .limits(Limits::float_step(0.0, 150.0, 1e-3).unit("V"))
                .discard([Discard::limits("frequency")])
                .sentinel(OK, ERROR),
        )
        .feature(
            Feature::int("up_trigger")
                .get("gettu {ch_id}")
                .set("settu {ch_id} {value:d}")
                .limits(Limits::int(1, 7))
                .sentinel(OK, ERROR),
        )
        .feature(
            Feature::int("down_trigger")
                .get("gettd {ch_id}")
                .set("settd {ch_id} {value:d}")
                .limits(Limits::int(1, 7))
                .sentinel(OK, ERROR),
        )
        .feature(
            Feature::float("saved_capacitance")
                .get("getc {ch_id}")
                .unit("muF")
                .empty_token("?")
                .sentinel(OK, ERROR),
        )
        // The controller drives steppers at 1 Hz to 10 kHz regardless of
        // load; amplitude changes drop the resolved validator anyway so a
        // finer model can slot in here.
        .limits_resolver("frequency", |_node| {
            Box::pin(async move { Ok(Limits::float_step(1.0, 10_000.0, 1.0).unit("Hz")) })
        })
        .action(Action::new("stop_motion", |node, _args| {
            Box::pin(async move {
                let command = format!("stop {}", module_slot(&node)?);
                let mut session = node.backend().session().await;
                anc_exchange(&mut session, &node, &command).await?;
                Ok(Value::Empty)
            })
        }))
        .action(
            Action::new("read_output_voltage", |node, _args| {
                Box::pin(async move {
                    let command = format!("geto {}", module_slot(&node)?);
                    let mut session = node.backend().session().await;
                    let body = anc_exchange(&mut session, &node, &command).await?;
                    parse_first_float(&node, "read_output_voltage", &body)
                })
            })
            .ret_unit("V"),
        )
        .action(
            Action::new("read_saved_capacitance", |node, _args| {
                Box::pin(async move {
                    let command = format!("getc {}", module_slot(&node)?);
                    let mut session = node.backend().session().await;
                    let body = anc_exchange(&mut session, &node, &command).await?;
                    parse_capacitance(&node, &body)
                })
            })
            .ret_unit("muF"),
        )
        .action(
            Action::new("measure_capacitance", |node, args| {
                Box::pin(async move {
                    let block = args.first().and_then(Value::as_bool).unwrap_or(false);
                    let timeout = args
                        .get(1)
                        .and_then(Value::as_f64)
                        .map(Duration::from_secs_f64)
                        .unwrap_or(CAPACITANCE_TIMEOUT);
                    let slot = module_slot(&node)?;

                    // Both caches are stale the moment the measurement
                    // starts: the module switches itself to cap mode.
                    node.clear_cache_of(&["saved_capacitance", "mode"]);

                    let mut session = node.backend().session().await;
                    anc_exchange(&mut session, &node, &format!("setm {} cap", slot)).await?;
                    if !block {
                        return Ok(Value::Empty);
                    }
                    session.write(&format!("capw {}", slot)).await?;
                    session
                        .wait_until(timeout, |line| line == OK || line == ERROR)
                        .await?;
                    let body =
                        anc_exchange(&mut session, &node, &format!("getc {}", slot)).await?;
                    parse_capacitance(&node, &body)
                })
            })
            .ret_unit("muF"),
        )
        .action(Action::new("wait_for_capacitance_measure", |node, args| {
            Box::pin(async move {
                let timeout = args
                    .first()
                    .and_then(Value::as_f64)
                    .map(Duration::from_secs_f64)
                    .unwrap_or(CAPACITANCE_TIMEOUT);
                let command = format!("capw {}", module_slot(&node)?);
                let done = node
                    .backend()
                    .wait_for(&command, timeout, |line| line == OK || line == ERROR)
                    .await?;
                Ok(Value::Bool(done))
            })
        }))
        .action(
            Action::new("step", |node, args| {
                Box::pin(async move {
                    let direction = args
                        .first()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_default();
                    let steps = args.get(1).and_then(Value::as_i64).unwrap_or(1);
                    // Fewer than one step means a continuous sweep.
                    let count = if steps < 1 {
                        "c".to_string()
                    } else {
                        steps.to_string()
                    };
                    let verb = if direction == "Up" { "stepu" } else { "stepd" };
                    let command = format!("{} {} {}", verb, module_slot(&node)?, count);
                    let mut session = node.backend().session().await;
                    anc_exchange(&mut session, &node, &command).await?;
                    Ok(Value::Empty)
                })
            })
            .check("mode is Step", |node, _args| {
                Box::pin(async move {
                    Ok(node.get("mode").await? == Value::Str("Step".to_string()))
                })
            })
            .check("direction is Up or Down", |_node, args| {
                Box::pin(async move {
                    Ok(matches!(
                        args.first().and_then(Value::as_str),
                        Some("Up") | Some("Down")
                    ))
                })
            }),
        )
        .action(Action::new("wait_for_stepping_end", |node, args| {
            Box::pin(async move {
                let timeout = args
                    .first()
                    .and_then(Value::as_f64)
                    .map(Duration::from_secs_f64)
                    .unwrap_or(CAPACITANCE_TIMEOUT);
                let command = format!("setpw {}", module_slot(&node)?);
                let done = node
                    .backend()
                    .wait_for(&command, timeout, |line| line == OK || line == ERROR)
                    .await?;
                Ok(Value::Bool(done))
            })
        }))
        .build()
}

/// Slot number of the module this node addresses.
fn module_slot(node: &Arc<Node>) -> Result<String> {
    node.ch_id()
        .map(str::to_string)
        .ok_or_else(|| InstrError::config("ANC300 module actions need a channel address"))
}

/// One command/response exchange on an open session; `ERROR` sentinels
/// carry the instrument's complaint.
async fn anc_exchange(
    session: &mut Session<'_>,
    node: &Arc<Node>,
    command: &str,
) -> Result<String> {
    let (terminator, body) = session.query_until(command, &[OK, ERROR]).await?;
    if terminator == ERROR {
        return Err(InstrError::Device {
            target: format!("anm150[{}]", node.ch_id().unwrap_or("?")),
            message: body,
        });
    }
    Ok(body)
}

fn parse_first_float(node: &Arc<Node>, action: &str, body: &str) -> Result<Value> {
    let line = body.lines().next().unwrap_or_default().trim();
    line.parse::<f64>()
        .map(Value::Float)
        .map_err(|_| InstrError::Protocol {
            feature: format!("anm150[{}].{}", node.ch_id().unwrap_or("?"), action),
            raw: body.to_string(),
        })
}

/// `?` means the capacitance was never measured.
fn parse_capacitance(node: &Arc<Node>, body: &str) -> Result<Value> {
    let line = body.lines().next().unwrap_or_default().trim();
    if line == "?" {
        return Ok(Value::Empty);
    }
    parse_first_float(node, "read_saved_capacitance", body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schemas_build() {
        let root = schema().unwrap();
        assert!(root.feature("version").is_some());
        let stepper = stepper_schema().unwrap();
        for name in [
            "serial_number",
            "mode",
            "frequency",
            "amplitude",
            "up_trigger",
            "down_trigger",
            "saved_capacitance",
        ] {
            assert!(stepper.feature(name).is_some(), "missing feature {}", name);
        }
    }

    #[test]
    fn framing_uses_crlf() {
        let config = protocol_config();
        assert_eq!(config.write_termination, "\r\n");
        assert_eq!(config.read_termination, "\r\n");
    }
}
