//! Tower middleware layers for the dispatch pipeline.
//!
//! - [`timeout`]: Per-dispatch timeout enforcement with cooperative cancellation
//! - [`metrics`]: Dispatch timing and counting via `tracing` spans and `metrics`
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::build_dispatch_pipeline;
pub use timeout::TimeoutLayer;
