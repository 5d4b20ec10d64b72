//! Typed dispatch envelope and the tower service that forwards it to the broker.

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use commandquery_core::{Broker, BrokerError, Message};
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};

use super::config::DispatchConfig;
use super::middleware::{build_dispatch_pipeline, LoadShedLayer};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Context carried with every dispatch through the tower layers.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub call_id: u64,
    pub request_type: &'static str,
    pub timeout_ms: u64,
    /// Handed to the broker; the timeout layer cancels it on expiry.
    pub cancellation: CancellationToken,
}

/// A request on its way to the broker.
#[derive(Debug)]
pub struct Dispatch<Req> {
    ctx: DispatchContext,
    request: Req,
}

impl<Req: Message> Dispatch<Req> {
    #[must_use]
    pub fn new(call_id: u64, request: Req, timeout_ms: u64) -> Self {
        Self {
            ctx: DispatchContext {
                call_id,
                request_type: type_name::<Req>(),
                timeout_ms,
                cancellation: CancellationToken::new(),
            },
            request,
        }
    }
}

impl<Req> Dispatch<Req> {
    #[must_use]
    pub fn ctx(&self) -> &DispatchContext {
        &self.ctx
    }

    #[must_use]
    pub fn request(&self) -> &Req {
        &self.request
    }

    #[must_use]
    pub fn into_parts(self) -> (DispatchContext, Req) {
        (self.ctx, self.request)
    }
}

/// Errors returned by the dispatch pipeline.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("server overloaded, try again later")]
    Overloaded,
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

// ---------------------------------------------------------------------------
// DispatchService
// ---------------------------------------------------------------------------

/// Innermost service: hands one `Req -> Resp` dispatch to the broker.
pub struct DispatchService<Req, Resp> {
    broker: Arc<Broker>,
    _pair: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> DispatchService<Req, Resp> {
    #[must_use]
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            _pair: PhantomData,
        }
    }
}

impl<Req, Resp> Clone for DispatchService<Req, Resp> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.broker))
    }
}

impl<Req, Resp> fmt::Debug for DispatchService<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchService")
            .field("request", &type_name::<Req>())
            .field("response", &type_name::<Resp>())
            .finish_non_exhaustive()
    }
}

impl<Req, Resp> Service<Dispatch<Req>> for DispatchService<Req, Resp>
where
    Req: Message,
    Resp: Send + 'static,
{
    type Response = Resp;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Resp, DispatchError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dispatch: Dispatch<Req>) -> Self::Future {
        let broker = Arc::clone(&self.broker);
        let (ctx, request) = dispatch.into_parts();
        Box::pin(async move {
            broker
                .dispatch_async_with_cancellation::<Req, Resp>(request, ctx.cancellation)
                .await
                .map_err(DispatchError::from)
        })
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Sends requests through the layered dispatch pipeline.
///
/// The load-shed permit pool is shared by every request type, so the
/// concurrency limit applies to the server as a whole.
#[derive(Debug)]
pub struct Dispatcher {
    broker: Arc<Broker>,
    load_shed: LoadShedLayer,
    config: DispatchConfig,
    next_call_id: AtomicU64,
}

impl Dispatcher {
    #[must_use]
    pub fn new(broker: Arc<Broker>, config: DispatchConfig) -> Self {
        Self {
            broker,
            load_shed: LoadShedLayer::new(config.max_concurrent_dispatches),
            config,
            next_call_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Dispatch slots not currently held by an in-flight request.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.load_shed.available()
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Dispatches `request` with the configured default timeout.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Overloaded`] when the concurrency limit is reached,
    /// [`DispatchError::Timeout`] when the dispatch outlives its timeout, or
    /// the broker's own error.
    pub async fn send<Req, Resp>(&self, request: Req) -> Result<Resp, DispatchError>
    where
        Req: Message,
        Resp: Send + 'static,
    {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let dispatch = Dispatch::new(call_id, request, self.config.default_timeout_ms);
        build_dispatch_pipeline::<Req, Resp>(Arc::clone(&self.broker), &self.load_shed)
            .oneshot(dispatch)
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use commandquery_core::{AsyncHandler, Cancelled, RegistryBuilder};

    use super::*;

    #[derive(Debug)]
    struct Echo(String);

    impl Message for Echo {}

    #[derive(Debug)]
    struct Sleep(u64);

    impl Message for Sleep {}

    struct EchoHandler;

    #[async_trait]
    impl AsyncHandler<Echo, String> for EchoHandler {
        async fn execute(&self, request: &Echo, _c: &CancellationToken) -> anyhow::Result<String> {
            Ok(request.0.to_uppercase())
        }
    }

    struct SleepHandler;

    #[async_trait]
    impl AsyncHandler<Sleep, u64> for SleepHandler {
        async fn execute(&self, request: &Sleep, cancellation: &CancellationToken) -> anyhow::Result<u64> {
            tokio::select! {
                () = cancellation.cancelled() => Err(Cancelled.into()),
                () = tokio::time::sleep(Duration::from_millis(request.0)) => Ok(request.0),
            }
        }
    }

    fn broker() -> Arc<Broker> {
        let mut builder = RegistryBuilder::new();
        builder
            .register_async_singleton::<Echo, String, _>(EchoHandler)
            .register_async_singleton::<Sleep, u64, _>(SleepHandler);
        Arc::new(Broker::new(Arc::new(builder.build().unwrap())))
    }

    #[tokio::test]
    async fn dispatch_service_forwards_to_the_broker() {
        let svc = DispatchService::<Echo, String>::new(broker());
        let resp = svc
            .oneshot(Dispatch::new(7, Echo("hi".to_string()), 1000))
            .await
            .unwrap();
        assert_eq!(resp, "HI");
    }

    #[tokio::test]
    async fn unregistered_pair_surfaces_broker_error() {
        let svc = DispatchService::<Echo, u64>::new(broker());
        let err = svc
            .oneshot(Dispatch::new(1, Echo("hi".to_string()), 1000))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Broker(BrokerError::HandlerNotFound { .. })
        ));
    }

    #[test]
    fn envelope_records_request_type() {
        let dispatch = Dispatch::new(3, Echo("x".to_string()), 250);
        assert_eq!(dispatch.ctx().call_id, 3);
        assert_eq!(dispatch.ctx().timeout_ms, 250);
        assert!(dispatch.ctx().request_type.ends_with("Echo"));
        assert_eq!(dispatch.request().0, "x");
    }

    fn call_id_of<Req>(dispatch: &Dispatch<Req>) -> u64 {
        dispatch.ctx().call_id
    }

    fn require_send<F: std::future::Future + Send>(fut: F) -> F {
        fut
    }

    #[test]
    fn accessors_need_no_message_bound() {
        let dispatch = Dispatch::new(9, Echo("x".to_string()), 10);
        assert_eq!(call_id_of(&dispatch), 9);
    }

    #[tokio::test]
    async fn dispatcher_send_future_is_send() {
        let dispatcher = Dispatcher::new(broker(), DispatchConfig::default());
        let resp: String = require_send(dispatcher.send(Echo("ok".to_string())))
            .await
            .unwrap();
        assert_eq!(resp, "OK");
    }

    #[tokio::test]
    async fn dispatcher_assigns_increasing_call_ids() {
        let dispatcher = Dispatcher::new(broker(), DispatchConfig::default());
        let first: String = dispatcher.send(Echo("a".to_string())).await.unwrap();
        let second: String = dispatcher.send(Echo("b".to_string())).await.unwrap();
        assert_eq!((first.as_str(), second.as_str()), ("A", "B"));
        assert_eq!(dispatcher.next_call_id.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn dispatcher_times_out_slow_handlers() {
        let dispatcher = Dispatcher::new(
            broker(),
            DispatchConfig {
                default_timeout_ms: 20,
                ..DispatchConfig::default()
            },
        );
        let err = dispatcher.send::<Sleep, u64>(Sleep(5_000)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { timeout_ms: 20 }));
    }
}
