//! `commandquery-server`: serves the widget sample over HTTP until ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use commandquery_core::CommandQueryOptions;
use commandquery_server::domain::build_runtime;
use commandquery_server::network::{NetworkConfig, NetworkModule};
use commandquery_server::service::{DispatchConfig, Dispatcher};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "commandquery_server=info,commandquery_core=info,tower_http=info";

/// Command-line and environment configuration.
#[derive(Debug, Parser)]
#[command(name = "commandquery-server", version, about)]
struct ServerConfig {
    #[arg(long, env = "CQ_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "CQ_PORT", default_value_t = 8080)]
    port: u16,

    /// Emit logs as JSON lines.
    #[arg(long, env = "CQ_LOG_JSON")]
    log_json: bool,

    /// Per-dispatch timeout; also bounds the whole HTTP request.
    #[arg(long, env = "CQ_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    request_timeout_ms: u64,

    #[arg(long, env = "CQ_MAX_CONCURRENT_DISPATCHES", default_value_t = 1000)]
    max_concurrent_dispatches: u32,

    /// Log every scanned registration at startup.
    #[arg(long, env = "CQ_LOG_REGISTRATIONS")]
    log_registrations: bool,

    /// Fail startup when a scanned component did not register.
    #[arg(long, env = "CQ_VALIDATE_REGISTRATIONS")]
    validate_registrations: bool,

    /// Allowed CORS origins (comma separated).
    #[arg(long, env = "CQ_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,
}

impl ServerConfig {
    fn network(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            cors_origins: self.cors_origins.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            ..NetworkConfig::default()
        }
    }

    fn dispatch(&self) -> DispatchConfig {
        DispatchConfig {
            default_timeout_ms: self.request_timeout_ms,
            max_concurrent_dispatches: self.max_concurrent_dispatches,
        }
    }

    fn options(&self) -> CommandQueryOptions {
        CommandQueryOptions {
            log_registrations: self.log_registrations,
            validate_registrations: self.validate_registrations,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    init_tracing(config.log_json);

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let runtime = build_runtime(&config.options()).context("failed to assemble widget runtime")?;
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&runtime.broker), config.dispatch()));

    let mut network = NetworkModule::new(config.network(), dispatcher, Arc::clone(&runtime.index))
        .with_metrics(metrics);
    let port = network.start().await?;
    info!(host = %config.host, port, "commandquery-server listening");

    network.serve(shutdown_signal()).await
}
