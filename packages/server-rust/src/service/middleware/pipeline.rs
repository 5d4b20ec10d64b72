//! Pipeline composition: combines all middleware layers into a single service stack.

use std::sync::Arc;

use commandquery_core::{Broker, Message};
use tower::ServiceBuilder;

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::service::dispatch::{Dispatch, DispatchError, DispatchService};

/// Build the dispatch pipeline for one `Req -> Resp` pair by wrapping a
/// `DispatchService` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded (fail fast before doing any work)
/// 2. `TimeoutLayer` -- enforce per-dispatch timeouts, cancelling on expiry
/// 3. `MetricsLayer` -- record timing and outcome (closest to the broker)
///
/// `load_shed` is passed in so every pipeline draws from the same permit pool.
/// The returned service and its futures are `Send`, so axum handlers can
/// await them.
#[must_use]
pub fn build_dispatch_pipeline<Req, Resp>(
    broker: Arc<Broker>,
    load_shed: &LoadShedLayer,
) -> impl tower::Service<Dispatch<Req>, Response = Resp, Error = DispatchError, Future: Send> + Send
where
    Req: Message,
    Resp: Send + 'static,
{
    ServiceBuilder::new()
        .layer(load_shed.clone())
        .layer(TimeoutLayer)
        .layer(MetricsLayer)
        .service(DispatchService::<Req, Resp>::new(broker))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use commandquery_core::{Handler, RegistryBuilder};
    use tower::ServiceExt;

    use super::*;

    struct Double(u32);

    impl Message for Double {}

    struct Doubler;

    impl Handler<Double, u32> for Doubler {
        fn execute(&self, request: &Double) -> anyhow::Result<u32> {
            Ok(request.0 * 2)
        }
    }

    #[tokio::test]
    async fn pipeline_routes_through_all_layers() {
        let mut builder = RegistryBuilder::new();
        builder.register_singleton::<Double, u32, _>(Doubler);
        let broker = Arc::new(Broker::new(Arc::new(builder.build().unwrap())));

        let svc = build_dispatch_pipeline::<Double, u32>(broker, &LoadShedLayer::new(100));
        let resp = svc.oneshot(Dispatch::new(42, Double(21), 5000)).await.unwrap();
        assert_eq!(resp, 42);
    }

    #[tokio::test]
    async fn exhausted_pool_sheds_before_the_broker() {
        let mut builder = RegistryBuilder::new();
        builder.register_singleton::<Double, u32, _>(Doubler);
        let broker = Arc::new(Broker::new(Arc::new(builder.build().unwrap())));

        let svc = build_dispatch_pipeline::<Double, u32>(broker, &LoadShedLayer::new(0));
        let err = svc.oneshot(Dispatch::new(1, Double(1), 5000)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Overloaded));
    }
}
