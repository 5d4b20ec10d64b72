//! Network module with deferred startup lifecycle.
//!
//! `new()` allocates shared state, `start()` binds the TCP listener, and
//! `serve()` accepts connections until shutdown. The bound port is known
//! between `start()` and `serve()`, which lets callers log or publish it.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    count_widgets_handler, create_widget_handler, get_widget_handler, health_handler,
    liveness_handler, metrics_handler, readiness_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::domain::WidgetIndex;
use crate::service::Dispatcher;

/// Manages the HTTP server lifecycle around a [`Dispatcher`].
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    dispatcher: Arc<Dispatcher>,
    index: Arc<WidgetIndex>,
    shutdown: Arc<ShutdownController>,
    metrics: Option<PrometheusHandle>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, dispatcher: Arc<Dispatcher>, index: Arc<WidgetIndex>) -> Self {
        Self {
            config,
            listener: None,
            dispatcher,
            index,
            shutdown: Arc::new(ShutdownController::new()),
            metrics: None,
        }
    }

    /// Exposes `handle` on `GET /metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `POST /widget` -- create a widget
    /// - `GET /widget/{id}` -- fetch a widget
    /// - `GET /widgets/count` -- number of indexed widgets
    /// - `GET /health`, `/health/live`, `/health/ready` -- probes
    /// - `GET /metrics` -- Prometheus exposition
    pub fn build_router(&self) -> Router {
        let state = AppState {
            dispatcher: Arc::clone(&self.dispatcher),
            index: Arc::clone(&self.index),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            start_time: Instant::now(),
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/widget", post(create_widget_handler))
            .route("/widget/{id}", get(get_widget_handler))
            .route("/widgets/count", get(count_widgets_handler))
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the TCP listener and returns the bound port (OS-assigned when
    /// the configured port is 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "TCP listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight dispatches
    /// for at most `drain_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server hits
    /// a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .context("start() must be called before serve()")?;
        let router = self.build_router();
        let controller = Arc::clone(&self.shutdown);

        controller.set_ready();
        info!("serving HTTP");

        let draining = Arc::clone(&controller);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                draining.trigger_shutdown();
            })
            .await?;

        controller.trigger_shutdown();
        if controller.wait_for_drain(self.config.drain_timeout).await {
            info!("all in-flight dispatches drained");
        } else {
            warn!(
                in_flight = controller.in_flight_count(),
                "drain timeout expired with dispatches remaining"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::network::handlers::test_state;
    use crate::network::HealthState;

    fn module() -> NetworkModule {
        let state = test_state();
        NetworkModule::new(NetworkConfig::default(), state.dispatcher, state.index)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_widget(body: &str) -> Request<Body> {
        Request::post("/widget")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn post_then_get_widget_over_http() {
        let module = module();
        module.shutdown_controller().set_ready();
        let router = module.build_router();

        let response = router
            .clone()
            .oneshot(post_widget(r#"{"name":"foo"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        let response = router
            .clone()
            .oneshot(Request::get(format!("/widget/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let widget = body_json(response).await;
        assert_eq!(widget["id"], id.as_str());
        assert_eq!(widget["name"], "foo");

        let response = router
            .oneshot(Request::get("/widgets/count").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["total"], 1);
    }

    #[tokio::test]
    async fn post_with_blank_name_is_400_with_message() {
        let module = module();
        module.shutdown_controller().set_ready();

        let response = module
            .build_router()
            .oneshot(post_widget(r#"{"name":""}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["message"], "name must not be empty.");
    }

    #[tokio::test]
    async fn widget_routes_refuse_before_ready() {
        let response = module()
            .build_router()
            .oneshot(post_widget(r#"{"name":"foo"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = NetworkModule::new(
            NetworkConfig {
                host: "127.0.0.1".to_string(),
                ..NetworkConfig::default()
            },
            module().dispatcher,
            Arc::new(WidgetIndex::new()),
        );
        let port = module.start().await.unwrap();
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let err = module()
            .serve(std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("start() must be called"));
    }

    #[tokio::test]
    async fn serve_drains_and_stops_on_shutdown() {
        let mut module = NetworkModule::new(
            NetworkConfig {
                host: "127.0.0.1".to_string(),
                ..NetworkConfig::default()
            },
            module().dispatcher,
            Arc::new(WidgetIndex::new()),
        );
        module.start().await.unwrap();
        let controller = module.shutdown_controller();

        module.serve(async {}).await.unwrap();
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }
}
