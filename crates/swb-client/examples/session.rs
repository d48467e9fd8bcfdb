//! Client Session Example
//!
//! Starts an in-process server on simulated hardware, then drives it through
//! a `ClientSession`: pick a protocol, answer an argument challenge, wait for
//! the hardware result.
//!
//! Run with: cargo run -p swb-client --example session

use std::sync::Arc;
use std::time::Duration;

use swb_client::ClientSession;
use swb_core::{Payload, ROUTER_KEY};
use swb_devices::{default_registry, DeviceConfig, Hardware, SwitchConfig, RF_SWITCH_KEY};
use swb_transport::{ConnectionServer, ServerConfig};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("Switchboard Session Example\n");

    let mut config = DeviceConfig::default();
    config.rf.switches.push(SwitchConfig::new("lamp", 4433, 4434));
    let hardware = Hardware::simulated(&config);
    let registry = Arc::new(default_registry(&config, &hardware));

    let server_config = ServerConfig {
        bind: "127.0.0.1:0".parse()?,
        ..ServerConfig::default()
    };
    let server = Arc::new(ConnectionServer::bind(server_config, registry).await?);
    let runner = server.clone();
    tokio::spawn(async move { runner.run().await });

    let session = ClientSession::new();
    let mut updates = session.subscribe_all();

    // Queued until the connection opens
    session.send(Payload::ping());
    session.connect(&server.local_addr().to_string()).await?;
    show(&mut updates).await;

    session.request("RfSwitch");
    show(&mut updates).await;

    // No arguments yet: the server answers with a CommandInfo challenge
    session.request("SwitchOn");
    show(&mut updates).await;

    if let Some(schema) = session.command_info(RF_SWITCH_KEY) {
        println!("   needs: {}", schema.syntax);
        session.answer_command_info(RF_SWITCH_KEY, &[("switch", "lamp")]);
    }
    // Acknowledgement, then the result from the radio
    show(&mut updates).await;
    show(&mut updates).await;

    session.request("Reset");
    show(&mut updates).await;
    println!("\nChooser history: {} payload(s)", session.history(ROUTER_KEY).len());

    session.disconnect();
    server.shutdown();
    Ok(())
}

async fn show(updates: &mut mpsc::UnboundedReceiver<Payload>) {
    match tokio::time::timeout(Duration::from_secs(2), updates.recv()).await {
        Ok(Some(payload)) => {
            println!("<- [{}] {}", payload.key(), payload.response().unwrap_or_default());
            println!("   commands: {}", payload.commands().join(", "));
        }
        _ => println!("<- (nothing)"),
    }
}
