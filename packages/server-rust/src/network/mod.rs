//! HTTP surface: configuration, transport middleware, handlers, shutdown
//! control, and the server lifecycle.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::NetworkConfig;
pub use handlers::{ApiError, AppState};
pub use middleware::build_http_layers;
pub use module::NetworkModule;
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
