//! HTTP handler definitions for the sample server.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for building the router.

pub mod error;
pub mod health;
pub mod widget;

pub use error::ApiError;
pub use health::{health_handler, liveness_handler, metrics_handler, readiness_handler};
pub use widget::{count_widgets_handler, create_widget_handler, get_widget_handler};

use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;

use super::{NetworkConfig, ShutdownController};
use crate::domain::WidgetIndex;
use crate::service::Dispatcher;

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Layered dispatch into the broker.
    pub dispatcher: Arc<Dispatcher>,
    /// Read side of the widget domain, reported by `/health`.
    pub index: Arc<WidgetIndex>,
    /// Graceful shutdown controller with health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
    /// Present when a Prometheus recorder was installed.
    pub metrics: Option<PrometheusHandle>,
}

/// Ready-to-use state over a freshly built widget runtime.
#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    use crate::service::DispatchConfig;

    let runtime = crate::domain::build_runtime(&commandquery_core::CommandQueryOptions::default())
        .unwrap();
    AppState {
        dispatcher: Arc::new(Dispatcher::new(
            runtime.broker,
            DispatchConfig {
                max_concurrent_dispatches: 8,
                ..DispatchConfig::default()
            },
        )),
        index: runtime.index,
        shutdown: Arc::new(ShutdownController::new()),
        config: Arc::new(NetworkConfig::default()),
        start_time: Instant::now(),
        metrics: None,
    }
}
