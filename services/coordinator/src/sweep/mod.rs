//! Background maintenance of the coordinator store.

mod worker;

pub use worker::{SweepWorker, SweepWorkerConfig};
