//! Load-shedding middleware for dispatches.
//!
//! Rejects dispatches when the server is overloaded (concurrent count exceeds
//! `max_concurrent_dispatches`) with `DispatchError::Overloaded`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::Semaphore;
use tower::{Layer, Service};
use tracing::warn;

use crate::service::dispatch::{Dispatch, DispatchError};

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits concurrent dispatches via a semaphore.
///
/// When all permits are taken, incoming dispatches are rejected immediately
/// with `DispatchError::Overloaded` rather than queued. Clones share the
/// same permit pool.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    /// Create a new `LoadShedLayer` with the given concurrency limit.
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }

    /// Permits currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: self.semaphore.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

/// Service wrapper that enforces a concurrency limit via semaphore-based backpressure.
#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S, Req, Resp> Service<Dispatch<Req>> for LoadShedService<S>
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
        // Try to acquire a permit without waiting. If none available, reject.
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            warn!(request = dispatch.ctx().request_type, "dispatch shed: overloaded");
            return Box::pin(async { Err(DispatchError::Overloaded) });
        };

        let fut = self.inner.call(dispatch);
        Box::pin(async move {
            // Hold the permit for the duration of the dispatch.
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use commandquery_core::Message;
    use tower::ServiceExt;

    use super::*;

    struct Ping;

    impl Message for Ping {}

    /// Service that holds for a configurable duration.
    struct SlowService {
        delay_ms: u64,
    }

    impl Service<Dispatch<Ping>> for SlowService {
        type Response = u64;
        type Error = DispatchError;
        type Future = Pin<Box<dyn Future<Output = Result<u64, DispatchError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, dispatch: Dispatch<Ping>) -> Self::Future {
            let delay = self.delay_ms;
            let call_id = dispatch.ctx().call_id;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(call_id)
            })
        }
    }

    fn make_dispatch(call_id: u64) -> Dispatch<Ping> {
        Dispatch::new(call_id, Ping, 5000)
    }

    #[tokio::test]
    async fn allows_dispatches_under_limit() {
        let layer = LoadShedLayer::new(10);
        let svc = layer.layer(SlowService { delay_ms: 1 });
        let resp = svc.oneshot(make_dispatch(4)).await.unwrap();
        assert_eq!(resp, 4);
        assert_eq!(layer.available(), 10);
    }

    #[tokio::test]
    async fn rejects_when_overloaded() {
        let layer = LoadShedLayer::new(1);
        let mut svc = layer.layer(SlowService { delay_ms: 500 });

        // First dispatch acquires the single permit.
        let _ = ServiceExt::ready(&mut svc).await.unwrap();
        let _in_flight = tokio::spawn({
            let fut = svc.call(make_dispatch(1));
            async move { fut.await }
        });

        // Give the spawned task time to acquire the permit.
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Second dispatch should be rejected immediately.
        let err = svc.call(make_dispatch(2)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Overloaded));
    }

    #[tokio::test]
    async fn clones_share_one_permit_pool() {
        let layer = LoadShedLayer::new(1);
        let mut first = layer.layer(SlowService { delay_ms: 500 });
        let mut second = layer.clone().layer(SlowService { delay_ms: 1 });

        let _in_flight = tokio::spawn({
            let fut = first.call(make_dispatch(1));
            async move { fut.await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = second.call(make_dispatch(2)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Overloaded));
    }
}
