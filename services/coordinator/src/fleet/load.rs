//! In-flight request accounting for load shedding.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use fleet_proto::Reconnect;

/// Counts in-flight fleet requests and turns overload into a reconnect hint.
#[derive(Debug)]
pub struct LoadMonitor {
    in_flight: AtomicUsize,
    threshold: usize,
    backoff: Duration,
}

impl LoadMonitor {
    pub fn new(threshold: usize, backoff: Duration) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            threshold,
            backoff,
        }
    }

    /// Marks a request as in flight until the guard is dropped.
    pub fn enter(&self) -> LoadGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        LoadGuard { monitor: self }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Returns a reconnect advisory while the coordinator is overloaded.
    pub fn advisory(&self) -> Option<Reconnect> {
        (self.in_flight() > self.threshold).then(|| Reconnect {
            reconnect_after_secs: self.backoff.as_secs_f64(),
        })
    }
}

#[must_use = "the request stops counting as soon as the guard is dropped"]
pub struct LoadGuard<'a> {
    monitor: &'a LoadMonitor,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.monitor.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
