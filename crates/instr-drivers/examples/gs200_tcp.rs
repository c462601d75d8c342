//! Read the identity and programmed level of a Yokogawa GS200 over TCP.
//!
//! ```bash
//! cargo run --example gs200_tcp -- $'transport: tcp\nhost: 192.168.1.20\nport: 7655'
//! ```

use std::sync::Arc;

use instr_core::{Backend, ConnectionSpec, ProtocolConfig};
use instr_drivers::yokogawa::model_gs200;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "instr_core=debug".into()),
        )
        .init();

    let spec_yaml = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "transport: tcp\nhost: 127.0.0.1\nport: 7655".to_string());
    let spec: ConnectionSpec = serde_yaml::from_str(&spec_yaml)?;

    let backend = Arc::new(Backend::open(&spec, ProtocolConfig::default()).await?);
    let source = model_gs200::open(backend)?;

    let identity = source.subsystem("identity")?;
    println!(
        "{} {} (serial {}, firmware {})",
        identity.get_string("manufacturer").await?,
        identity.get_string("model").await?,
        identity.get_string("serial").await?,
        identity.get_string("firmware").await?,
    );

    let function = source.get_string("function").await?;
    println!("source function: {}", function);
    match function.as_str() {
        "Voltage" => println!("level: {} V", source.get_f64("voltage").await?),
        "Current" => println!("level: {} A", source.get_f64("current").await?),
        other => println!("unexpected function {:?}", other),
    }

    Ok(())
}
