//! Fleet node agent.
//!
//! Runs the reference agent with an echo handler: every message is answered
//! with a reply of the same type carrying the received payload unchanged.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use fleet_node_agent::{Agent, Config, FleetClient, MessageHandler, Payload, Reply};
use fleet_proto::Message;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, message: &Message, payload: &Payload) -> Result<Option<Reply>> {
        info!(
            message_id = %message.message_id,
            message_type = %message.message_type,
            objects = payload.object_count(),
            "Echoing message"
        );
        Ok(Some(Reply::new(message.message_type.clone(), payload.clone())))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        coordinator_url = %config.coordinator_url,
        heartbeat_interval_secs = config.heartbeat_interval.as_secs_f64(),
        "Starting fleet node agent"
    );

    let client = FleetClient::new(&config)?;
    let agent = Agent::new(config, client, Arc::new(EchoHandler));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut agent_handle = tokio::spawn(async move { agent.run(shutdown_rx).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut agent_handle => {
            match result {
                Ok(Ok(())) => info!("Agent exited"),
                Ok(Err(e)) => error!(error = %e, "Agent failed"),
                Err(e) => error!(error = %e, "Agent task panicked"),
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);

    // Let the agent delete its registration.
    match tokio::time::timeout(std::time::Duration::from_secs(10), agent_handle).await {
        Ok(Ok(Err(e))) => error!(error = %e, "Agent failed during shutdown"),
        Ok(Err(e)) => error!(error = %e, "Agent task panicked"),
        Ok(Ok(Ok(()))) => {}
        Err(_) => error!("Agent did not stop in time"),
    }

    info!("Node agent shutdown complete");
    Ok(())
}
