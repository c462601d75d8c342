//! SCPI error-queue reporting.
//!
//! Instruments implementing `SYST:ERR?` get two things: a `read_error`
//! action returning the oldest queued error, and [`operation_check`], an
//! engine hook polling the queue after every set so a rejected command
//! surfaces as a `DeviceError` instead of silently leaving the instrument
//! in a different state than the cache.

use futures::future::BoxFuture;
use std::sync::Arc;

use instr_core::{Action, Bundle, InstrError, Node, OpOutcome, Result, Value};

/// `read_error` action: the raw `code,"message"` line from the queue.
///
/// If an unhandled error occurs the queue should be polled until empty.
pub fn error_reading() -> Bundle {
    Bundle::new().action(Action::new("read_error", |node, _args| {
        Box::pin(async move {
            let reply = node.backend().query("SYST:ERR?").await?;
            Ok(Value::Str(reply))
        })
    }))
}

/// Split a `code,"message"` error-queue reply.
pub fn parse_error_reply(reply: &str) -> Result<(i64, String)> {
    let (code, message) = reply.split_once(',').unwrap_or((reply, ""));
    let code = code
        .trim()
        .parse::<i64>()
        .map_err(|_| InstrError::Protocol {
            feature: "read_error".to_string(),
            raw: reply.to_string(),
        })?;
    Ok((code, message.trim().to_string()))
}

/// Post-set operation check: a non-zero error code in the queue means the
/// set did not take effect; the raw device message is reported verbatim.
pub fn operation_check(node: Arc<Node>, _outcome: OpOutcome) -> BoxFuture<'static, Result<Option<String>>> {
    Box::pin(async move {
        let reply = node.backend().query("SYST:ERR?").await?;
        let (code, _message) = parse_error_reply(&reply)?;
        if code != 0 {
            Ok(Some(reply))
        } else {
            Ok(None)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_reply_parsing() {
        let (code, message) = parse_error_reply("0,\"No error\"").unwrap();
        assert_eq!(code, 0);
        assert_eq!(message, "\"No error\"");

        let (code, _) = parse_error_reply("-222,\"Data out of range\"").unwrap();
        assert_eq!(code, -222);

        assert!(parse_error_reply("garbage").is_err());
    }
}
