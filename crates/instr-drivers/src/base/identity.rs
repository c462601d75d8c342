//! Standard identity subsystem.
//!
//! Instruments answering `*IDN?` expose a nested `identity` container with
//! manufacturer, model, serial and firmware fields. All four come from one
//! exchange: whichever field is read first primes the other three, so
//! repeated access costs a single query per container lifetime.
//!
//! Fields the instrument does not report decode as empty strings.

use std::sync::Arc;

use futures::future::BoxFuture;
use instr_core::{Feature, Node, Result, Schema, Value};

const FIELDS: [&str; 4] = ["manufacturer", "model", "serial", "firmware"];

/// Schema of the identity subsystem, fed by `*IDN?`.
pub fn subsystem_schema() -> Result<Arc<Schema>> {
    let mut builder = Schema::builder("identity");
    for (index, field) in FIELDS.iter().enumerate() {
        builder = builder
            .feature(Feature::text(*field).computed(*field))
            .value_resolver(*field, idn_field(index));
    }
    builder.build()
}

fn idn_field(
    index: usize,
) -> impl Fn(Arc<Node>) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static {
    move |node| {
        Box::pin(async move {
            let idn = node.backend().query("*IDN?").await?;
            let fields: Vec<&str> = idn.split(',').map(str::trim).collect();
            for (i, name) in FIELDS.iter().enumerate() {
                let value = fields.get(i).copied().unwrap_or_default();
                node.prime_cache(name, Value::Str(value.to_string()));
            }
            Ok(Value::Str(
                fields.get(index).copied().unwrap_or_default().to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_builds() {
        let schema = subsystem_schema().unwrap();
        for field in FIELDS {
            assert!(schema.feature(field).is_some());
        }
    }
}
