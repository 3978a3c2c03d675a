//! Application state shared across request handlers.

use std::sync::Arc;

use crate::config::Config;
use crate::fleet::Coordinator;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    coordinator: Coordinator,
    config: Config,
}

impl AppState {
    pub fn new(coordinator: Coordinator, config: Config) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                coordinator,
                config,
            }),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.inner.coordinator
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}
