//! Reference edge node for the fleet coordinator.
//!
//! The agent registers with the coordinator, keeps its registration alive
//! with heartbeats, and polls for messages addressed to it. Each message's
//! payload is downloaded and handed to a [`MessageHandler`]; any reply is
//! pushed back to the sender together with the objects it references.
//!
//! ## Modules
//!
//! - `client`: typed HTTP client for the fleet API
//! - `retry`: exponential backoff for transient failures
//! - `payload`: payload trees and chunked object transfer
//! - `heartbeat`: registration keep-alive
//! - `agent`: the poll loop

pub mod agent;
pub mod client;
pub mod config;
pub mod heartbeat;
pub mod payload;
pub mod retry;

pub use agent::{Agent, MessageHandler, PollReport, Reply};
pub use client::{ClientError, FleetClient};
pub use config::Config;
pub use payload::{Payload, PayloadBuilder};
pub use retry::RetryPolicy;
