//! Bilt BN100 chassis.
//!
//! The chassis multiplexes up to twelve cards behind one SCPI link; a card
//! is addressed by prepending `I<slot>;` to its commands (the card schemas
//! declare that prefix). `I:L?` lists the fitted cards as
//! `slot,model,flag` groups separated by `;`.

use std::sync::Arc;

use instr_core::{Backend, ChannelIds, Node, Result, Schema, Value};

use super::be2100;

/// Open a driver on an already-connected backend.
pub fn open(backend: Arc<Backend>) -> Result<Arc<Node>> {
    Ok(Node::root(schema()?, backend))
}

/// Quiet down chassis verbosity. Run once after connecting.
pub async fn initialize(node: &Arc<Node>) -> Result<()> {
    node.backend().write("SYST:VERB 0").await?;
    tracing::info!("BN100 chassis set to terse responses");
    Ok(())
}

/// Root schema: error reporting plus the BE2100 card channel.
pub fn schema() -> Result<Arc<Schema>> {
    Schema::builder("bn100")
        .include(crate::common::scpi::error_reading())
        .channel(
            "be2100",
            ChannelIds::resolver("list_be2100"),
            be2100::schema()?,
        )
        .discovery_resolver("list_be2100", |node| {
            Box::pin(async move {
                let listing = node.backend().query("I:L?").await?;
                Ok(filter_cards(&listing, be2100::MODEL_IDS))
            })
        })
        .build()
}

/// Slots of the fitted cards whose model matches one of `models`.
fn filter_cards(listing: &str, models: &[&str]) -> Vec<String> {
    let mut slots = Vec::new();
    for group in listing.split(';') {
        let mut fields = group.split(',').map(str::trim);
        let (Some(slot), Some(model)) = (fields.next(), fields.next()) else {
            continue;
        };
        if models.iter().any(|m| model.ends_with(m)) {
            slots.push(slot.to_string());
        }
    }
    slots
}

/// Read the first queued chassis error.
pub async fn read_error(node: &Arc<Node>) -> Result<String> {
    match node.invoke("read_error", Vec::new()).await? {
        Value::Str(reply) => Ok(reply),
        other => Ok(other.to_string()),
    }
}
