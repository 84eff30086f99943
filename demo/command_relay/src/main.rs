use busline_core::{BuslineConfig, BusError, HandlerError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Deserialize, Serialize)]
struct Greeting {
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Pick up BUSLINE_* and RUST_LOG from a local .env when present
    let _ = dotenvy::dotenv();

    busline_core::telemetry::init_tracing("info,busline=info,command_relay=info")
        .map_err(|e| e as Box<dyn std::error::Error>)?;

    // Defaults + env + optional TOML overlay
    let cfg = BuslineConfig::load();
    info!(
        target: "command_relay",
        transport = cfg.transport.type_name(),
        capacity = cfg.channel_capacity,
        timeout_ms = ?cfg.execute_timeout_ms,
        "Starting command relay"
    );

    let bus = cfg.build_bus()?;
    if let Err(e) = bus.ready().await {
        error!(target: "command_relay", error = %e, "Transport did not connect");
        return Err(e.into());
    }

    // Surface transport faults in the log
    let mut faults = bus.errors();
    tokio::spawn(async move {
        while let Some(fault) = faults.next().await {
            warn!(target: "command_relay", kind = ?fault.kind, message = %fault.message, "Transport fault");
        }
    });

    bus.on("ping", |_: Value| async { Ok::<_, HandlerError>("pong") });
    bus.on("echo", |payload: Value| async move { Ok::<_, HandlerError>(payload) });
    bus.on("greet", |g: Greeting| async move {
        if g.name.trim().is_empty() {
            return Err(HandlerError::status(422, "name must not be empty"));
        }
        Ok(format!("Hello, {}!", g.name))
    });
    bus.on("audit.greeted", |payload: Value| async move {
        info!(target: "command_relay", payload = %payload, "Audit event");
        Ok::<_, HandlerError>(())
    });

    let pong: String = bus.execute("ping", json!({})).await?;
    info!(target: "command_relay", reply = %pong, "ping");

    let echoed: Value = bus.execute("echo", json!({"id": 1, "text": "relay"})).await?;
    info!(target: "command_relay", reply = %echoed, "echo");

    let greeting: String = bus
        .execute("greet", Greeting { name: "Ada".into() })
        .await?;
    info!(target: "command_relay", reply = %greeting, "greet");
    bus.emit("audit.greeted", json!({"name": "Ada"}))?;

    match bus
        .execute::<_, String>("greet", Greeting { name: " ".into() })
        .await
    {
        Err(BusError::Handler(e)) => {
            info!(target: "command_relay", status = ?e.status_code(), message = %e.message(), "greet rejected")
        }
        other => warn!(target: "command_relay", result = ?other, "Unexpected greet outcome"),
    }

    info!(target: "command_relay", stats = ?bus.stats(), "Relay running; press Ctrl+C to exit");
    signal::ctrl_c().await?;

    bus.shutdown().await;
    info!(target: "command_relay", "Command relay stopped");
    Ok(())
}
