//! Fleet coordinator library.
//!
//! This crate primarily ships a `fleet-coordinator` binary, but we expose the
//! library surface to enable integration testing and reuse.

pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod fleet;
pub mod objects;
pub mod queue;
pub mod registry;
pub mod runs;
pub mod state;
pub mod sweep;
