//! Dispatch framework between the HTTP surface and the broker.
//!
//! 1. **Envelope** (`dispatch`): `Dispatch<Req>` carries a call id, timeout,
//!    and cancellation token alongside the typed request
//! 2. **Middleware** (`middleware`): Tower layers (load-shedding, timeout, metrics)
//! 3. **Dispatcher** (`dispatch`): assigns call ids and drives the layered
//!    pipeline into `Broker::dispatch_async_with_cancellation`

pub mod config;
pub mod dispatch;
pub mod middleware;

pub use config::DispatchConfig;
pub use dispatch::{Dispatch, DispatchContext, DispatchError, DispatchService, Dispatcher};
