//! Timeout middleware for dispatches.
//!
//! Rejects dispatches that exceed their `timeout_ms` with
//! `DispatchError::Timeout`, cancelling the dispatch's token first so any work
//! the handler handed off observes the expiry.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tower::{Layer, Service};
use tracing::warn;

use crate::service::dispatch::{Dispatch, DispatchError};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps services with per-dispatch timeout enforcement.
///
/// The timeout is read from each dispatch's `ctx.timeout_ms` field,
/// allowing different requests to have different timeouts.
#[derive(Debug, Clone)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

/// Service wrapper that enforces per-dispatch timeouts.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S, Req, Resp> Service<Dispatch<Req>> for TimeoutService<S>
where
    S: Service<Dispatch<Req>, Response = Resp, Error = DispatchError> + Send,
    S::Future: Send + 'static,
    Resp: Send + 'static,
{
    type Response = Resp;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Resp, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, dispatch: Dispatch<Req>) -> Self::Future {
        let timeout_ms = dispatch.ctx().timeout_ms;
        let request_type = dispatch.ctx().request_type;
        let cancellation = dispatch.ctx().cancellation.clone();
        let fut = self.inner.call(dispatch);
        Box::pin(async move {
            let duration = Duration::from_millis(timeout_ms);
            match tokio::time::timeout(duration, fut).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    cancellation.cancel();
                    warn!(request = request_type, timeout_ms, "dispatch timed out");
                    Err(DispatchError::Timeout { timeout_ms })
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
