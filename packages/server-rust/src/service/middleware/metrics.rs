//! Metrics middleware for dispatches.
//!
//! Records dispatch duration and outcome on a `tracing` span and through the
//! `metrics` facade (a no-op until a recorder is installed).

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::dispatch::{Dispatch, DispatchError};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments dispatches with timing and counting.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records dispatch duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

fn outcome_of<T>(result: &Result<T, DispatchError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(DispatchError::Timeout { .. }) => "timeout",
        Err(DispatchError::Overloaded) => "overloaded",
        Err(DispatchError::Broker(_)) => "error",
    }
}

impl<S, Req, Resp> Service<Dispatch<Req>> for MetricsService<S>
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
        let request_type = dispatch.ctx().request_type;
        let call_id = dispatch.ctx().call_id;

        let span = info_span!(
            "dispatch_call",
            request = request_type,
            call_id = call_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(dispatch);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let outcome = outcome_of(&result);

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                ::metrics::counter!(
                    "commandquery_dispatch_total",
                    "request" => request_type,
                    "outcome" => outcome
                )
                .increment(1);
                ::metrics::histogram!(
                    "commandquery_dispatch_duration_seconds",
                    "request" => request_type
                )
                .record(elapsed.as_secs_f64());

                tracing::info!(
                    request = request_type,
                    call_id = call_id,
                    duration_ms = duration_ms,
                    outcome = outcome,
                    "dispatch complete"
                );

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use commandquery_core::Message;
    use tower::ServiceExt;

    use super::*;

    struct Ping;

    impl Message for Ping {}

    /// Immediately-completing service for metrics testing.
    struct ImmediateService;

    impl Service<Dispatch<Ping>> for ImmediateService {
        type Response = u64;
        type Error = DispatchError;
        type Future = Pin<Box<dyn Future<Output = Result<u64, DispatchError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, dispatch: Dispatch<Ping>) -> Self::Future {
            let call_id = dispatch.ctx().call_id;
            Box::pin(async move { Ok(call_id) })
        }
    }

    #[tokio::test]
    async fn metrics_layer_passes_through_response() {
        let svc = MetricsLayer.layer(ImmediateService);
        let resp = svc.oneshot(Dispatch::new(42, Ping, 5000)).await.unwrap();
        assert_eq!(resp, 42);
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome_of::<()>(&Ok(())), "ok");
        assert_eq!(outcome_of::<()>(&Err(DispatchError::Overloaded)), "overloaded");
        assert_eq!(
            outcome_of::<()>(&Err(DispatchError::Timeout { timeout_ms: 1 })),
            "timeout"
        );
    }
}
