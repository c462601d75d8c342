//! Descriptor engine for message-based laboratory instrument drivers.
//!
//! Drivers in this workspace are configuration expressed as code: tables of
//! [`Feature`] and [`Action`] declarations attached to container
//! [`Schema`]s, interpreted by a generic engine. The engine exposes
//! instrument state as typed, cached, validated attributes; groups them
//! into repeatable [`channels`](Node::channel) and static
//! [`subsystems`](Node::subsystem); guards imperative operations with
//! pre-condition checks; and maintains a declared invalidation graph so
//! that changing one value drops cached knowledge of the others.
//!
//! A typical flow: a caller reads an attribute on a [`Node`] → the cache is
//! consulted → on a miss the feature's template is rendered with the
//! container's address, exchanged through the shared [`Backend`] (one lock,
//! held exactly for the write+read span), decoded by the [`Transform`],
//! checked against [`Limits`], cached and returned.
//!
//! ```rust,ignore
//! let backend = Arc::new(Backend::open(&spec, ProtocolConfig::default()).await?);
//! let anc = instr_drivers::attocube::anc300::open(backend)?;
//! let axis = anc.channel("anm150", 1).await?;
//! axis.set("mode", "Step").await?;
//! axis.invoke("step", vec!["Up".into(), 100.into()]).await?;
//! ```

pub mod action;
pub mod backend;
pub mod cache;
pub mod error;
pub mod feature;
pub mod limits;
pub mod node;
pub mod template;
pub mod transform;
pub mod value;

pub use action::Action;
pub use backend::{Backend, ConnectionSpec, DynTransport, ProtocolConfig, Session, TransportIO};
pub use cache::Discard;
pub use error::{InstrError, Result};
pub use feature::{Check, Feature, ResponseMode};
pub use limits::Limits;
pub use node::{Bundle, ChannelIds, Node, OpOutcome, Schema, SchemaBuilder};
pub use transform::{Kind, Transform};
pub use value::{Quantity, Value};
