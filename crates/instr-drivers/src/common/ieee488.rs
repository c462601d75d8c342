//! IEEE 488.2 common command bundles.
//!
//! The standard's command groups are modeled as independent capability
//! bundles so a driver declares exactly what its firmware implements:
//!
//! - [`status_reporting`] — `*ESE`/`*ESE?`, `*SRE`/`*SRE?`, `*ESR?`, `*STB?`
//! - [`internal_operations`] — `*RST`, `*TST?`
//! - [`synchronisation`] — `*OPC`, `*OPC?`, `*WAI`
//! - [`power_on`] — `*PSC`/`*PSC?`
//! - [`options_identification`] — `*OPT?`
//! - [`stored_settings`] — `*SAV`, `*RCL`
//! - [`trigger`] — `*TRG`
//!
//! The standard specifies that implementing one command of a group implies
//! the whole group; real firmware is not that disciplined, hence the finer
//! subdivision.

use std::time::Duration;

use instr_core::{Action, Bundle, Feature, InstrError, Limits, Value};

/// Settling time after `*RST` before the instrument accepts commands again.
const RESET_WAIT: Duration = Duration::from_secs(1);

/// Meaning of the standard event status register bits, LSB first.
pub const EVENT_STATUS_REGISTER: [&str; 8] = [
    "operation complete",
    "request control",
    "query error",
    "device dependent error",
    "execution error",
    "command error",
    "user request",
    "power on",
];

/// Names of the bits set in `mask`, LSB first.
pub fn decode_register(mask: i64, names: &[&str]) -> Vec<String> {
    names
        .iter()
        .enumerate()
        .filter(|(bit, _)| mask & (1 << bit) != 0)
        .map(|(_, name)| name.to_string())
        .collect()
}

/// Status reporting commands: enable registers plus the event and status
/// byte queries. The status byte is never cached, it changes under the
/// instrument's feet.
pub fn status_reporting() -> Bundle {
    Bundle::new()
        .feature(
            Feature::int("service_request_enabled")
                .get("*SRE?")
                .set("*SRE {value:d}")
                .limits(Limits::int(0, 255)),
        )
        .feature(
            Feature::int("event_status_enabled")
                .get("*ESE?")
                .set("*ESE {value:d}")
                .limits(Limits::int(0, 255)),
        )
        .feature(Feature::int("status_byte").get("*STB?").no_cache())
        .action(Action::new("read_event_status_register", |node, _args| {
            Box::pin(async move {
                let raw = node.backend().query("*ESR?").await?;
                let mask = raw
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| InstrError::Protocol {
                        feature: "read_event_status_register".to_string(),
                        raw,
                    })?;
                Ok(Value::Int(mask))
            })
        }))
}

/// `*RST` and `*TST?`. Reset drops every cached value on the node since the
/// instrument just forgot all of its settings.
pub fn internal_operations() -> Bundle {
    Bundle::new()
        .action(Action::new("reset", |node, _args| {
            Box::pin(async move {
                node.backend().write("*RST").await?;
                node.clear_cache_deep();
                tokio::time::sleep(RESET_WAIT).await;
                Ok(Value::Empty)
            })
        }))
        .action(Action::new("perform_self_test", |node, _args| {
            Box::pin(async move {
                let raw = node.backend().query("*TST?").await?;
                let verdict = match raw.trim().parse::<i64>() {
                    Ok(0) => "Normal completion".to_string(),
                    Ok(code) => format!("Self-test failed with code {}", code),
                    Err(_) => {
                        return Err(InstrError::Protocol {
                            feature: "perform_self_test".to_string(),
                            raw,
                        })
                    }
                };
                Ok(Value::Str(verdict))
            })
        }))
}

/// Operation-complete handshake commands.
pub fn synchronisation() -> Bundle {
    Bundle::new()
        .action(Action::new("complete_operation", |node, _args| {
            Box::pin(async move {
                node.backend().write("*OPC").await?;
                Ok(Value::Empty)
            })
        }))
        .action(Action::new("is_operation_completed", |node, _args| {
            Box::pin(async move {
                let raw = node.backend().query("*OPC?").await?;
                Ok(Value::Bool(raw.trim() == "1"))
            })
        }))
        .action(Action::new("wait_to_continue", |node, _args| {
            Box::pin(async move {
                node.backend().write("*WAI").await?;
                Ok(Value::Empty)
            })
        }))
}

/// Power-on status clear flag.
pub fn power_on() -> Bundle {
    Bundle::new().feature(
        Feature::bool("poweron_status_clear")
            .get("*PSC?")
            .set("*PSC {value}")
            .mapping([(true, "1"), (false, "0")]),
    )
}

/// Installed-options query.
pub fn options_identification() -> Bundle {
    Bundle::new().feature(Feature::text("instr_options").get("*OPT?"))
}

/// Local-memory settings slots. Recalling a stored setup invalidates every
/// cached value.
pub fn stored_settings() -> Bundle {
    Bundle::new()
        .action(Action::new("save", |node, args| {
            Box::pin(async move {
                let slot = slot_index(&args)?;
                node.backend().write(&format!("*SAV {}", slot)).await?;
                Ok(Value::Empty)
            })
        }))
        .action(Action::new("recall", |node, args| {
            Box::pin(async move {
                let slot = slot_index(&args)?;
                node.backend().write(&format!("*RCL {}", slot)).await?;
                node.clear_cache_deep();
                Ok(Value::Empty)
            })
        }))
}

/// Bus trigger event.
pub fn trigger() -> Bundle {
    Bundle::new().action(Action::new("trigger", |node, _args| {
        Box::pin(async move {
            node.backend().write("*TRG").await?;
            Ok(Value::Empty)
        })
    }))
}

fn slot_index(args: &[Value]) -> instr_core::Result<i64> {
    args.first()
        .and_then(Value::as_i64)
        .ok_or_else(|| InstrError::config("stored-settings commands need a memory slot index"))
}
