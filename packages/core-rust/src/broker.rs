//! Request/response dispatch.
//!
//! The [`Broker`] resolves the single handler registered for a request and
//! response type pair, runs it (through the pipeline pre-built for that pair,
//! if any), and turns the final context into a typed result.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::context::HandlerContext;
use crate::error::{BrokerError, Cancelled, ConfigError, Fault};
use crate::handler::Handler;
use crate::message::Message;
use crate::pipeline::{
    AsyncPipeline, AsyncTerminal, MiddlewareCatalog, PipelineBuilder, PipelineDiagnostics,
    SyncPipeline, SyncPipelineBuilder, Terminal,
};
use crate::registry::{HandlerKey, HandlerSlot, Registry, Resolver};

type PipelineMap = HashMap<HandlerKey, Arc<dyn Any + Send + Sync>>;

type Configure = Box<
    dyn FnOnce(
        &mut Broker,
        &MiddlewareCatalog,
        Option<&Arc<dyn PipelineDiagnostics>>,
    ) -> Result<(), ConfigError>,
>;

// ---------------------------------------------------------------------------
// Terminals
// ---------------------------------------------------------------------------

/// Stores the handler's result on the context. A failure is recorded before
/// it is handed back to the enclosing middleware.
fn settle<Req, Resp>(
    ctx: &mut HandlerContext<Req, Resp>,
    result: anyhow::Result<Resp>,
) -> anyhow::Result<()> {
    match result {
        Ok(response) => {
            ctx.response = Some(response);
            Ok(())
        }
        Err(err) => {
            let fault = Fault::new(err);
            ctx.record_fault(fault.clone());
            Err(fault.into())
        }
    }
}

struct SyncHandlerTerminal<Req, Resp> {
    resolver: Resolver<dyn Handler<Req, Resp>>,
}

impl<Req: 'static, Resp: 'static> Terminal<HandlerContext<Req, Resp>>
    for SyncHandlerTerminal<Req, Resp>
{
    fn run(&self, ctx: &mut HandlerContext<Req, Resp>) -> anyhow::Result<()> {
        let result = self.resolver.resolve().execute(&ctx.request);
        settle(ctx, result)
    }
}

/// Runs either handler flavor from a suspending call path.
struct HandlerTerminal<Req, Resp> {
    slot: HandlerSlot<Req, Resp>,
}

#[async_trait]
impl<Req, Resp> AsyncTerminal<HandlerContext<Req, Resp>> for HandlerTerminal<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
{
    async fn run(&self, ctx: &mut HandlerContext<Req, Resp>) -> anyhow::Result<()> {
        if ctx.cancellation.is_cancelled() {
            return Err(Cancelled.into());
        }
        let result = match &self.slot {
            HandlerSlot::Sync(resolver) => resolver.resolve().execute(&ctx.request),
            HandlerSlot::Async(resolver) => {
                let handler = resolver.resolve();
                handler.execute(&ctx.request, &ctx.cancellation).await
            }
        };
        settle(ctx, result)
    }
}

// ---------------------------------------------------------------------------
// BrokerBuilder
// ---------------------------------------------------------------------------

/// Configures per-pair pipelines; [`build`](Self::build) validates and
/// composes them against the registry.
pub struct BrokerBuilder {
    registry: Arc<Registry>,
    catalog: MiddlewareCatalog,
    diagnostics: Option<Arc<dyn PipelineDiagnostics>>,
    pending: Vec<Configure>,
}

impl BrokerBuilder {
    /// Named middleware available to `with_named` stages.
    #[must_use]
    pub fn catalog(mut self, catalog: MiddlewareCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Diagnostics applied to every pipeline that does not set its own.
    #[must_use]
    pub fn diagnostics(mut self, diagnostics: Arc<dyn PipelineDiagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Configures the blocking pipeline for `Req -> Resp`. [`Broker::dispatch`]
    /// always uses it; the async entry points fall back to it when the pair
    /// has no async pipeline.
    #[must_use]
    pub fn pipeline<Req, Resp, F>(mut self, configure: F) -> Self
    where
        Req: Message,
        Resp: Send + 'static,
        F: FnOnce(&mut SyncPipelineBuilder<HandlerContext<Req, Resp>>),
    {
        let key = HandlerKey::of::<Req, Resp>();
        let mut builder = SyncPipelineBuilder::new(key.to_string());
        configure(&mut builder);

        self.pending.push(Box::new(
            move |broker: &mut Broker,
                  catalog: &MiddlewareCatalog,
                  diagnostics: Option<&Arc<dyn PipelineDiagnostics>>|
             -> Result<(), ConfigError> {
                let Some(HandlerSlot::Sync(resolver)) = broker.registry.handler_slot::<Req, Resp>().cloned()
                else {
                    return Err(ConfigError::PipelineWithoutHandler {
                        capability: "Handler",
                        request: key.request.name(),
                        response: key.response.name(),
                    });
                };
                if let Some(diagnostics) = diagnostics {
                    builder.diagnostics_if_unset(diagnostics);
                }
                let pipeline = builder.build(catalog, Arc::new(SyncHandlerTerminal { resolver }))?;
                if broker.sync_pipelines.insert(key, Arc::new(pipeline)).is_some() {
                    return Err(ConfigError::DuplicatePipeline {
                        flavor: "sync",
                        request: key.request.name(),
                        response: key.response.name(),
                    });
                }
                Ok(())
            },
        ));
        self
    }

    /// Configures the suspending pipeline used by [`Broker::dispatch_async`]
    /// for `Req -> Resp`. Either handler flavor may back it.
    #[must_use]
    pub fn async_pipeline<Req, Resp, F>(mut self, configure: F) -> Self
    where
        Req: Message,
        Resp: Send + 'static,
        F: FnOnce(&mut PipelineBuilder<HandlerContext<Req, Resp>>),
    {
        let key = HandlerKey::of::<Req, Resp>();
        let mut builder = PipelineBuilder::new(key.to_string());
        configure(&mut builder);

        self.pending.push(Box::new(
            move |broker: &mut Broker,
                  catalog: &MiddlewareCatalog,
                  diagnostics: Option<&Arc<dyn PipelineDiagnostics>>|
             -> Result<(), ConfigError> {
                let Some(slot) = broker.registry.handler_slot::<Req, Resp>().cloned() else {
                    return Err(ConfigError::PipelineWithoutHandler {
                        capability: "AsyncHandler",
                        request: key.request.name(),
                        response: key.response.name(),
                    });
                };
                if let Some(diagnostics) = diagnostics {
                    builder.diagnostics_if_unset(diagnostics);
                }
                let pipeline = builder.build(catalog, Arc::new(HandlerTerminal { slot }))?;
                if broker.async_pipelines.insert(key, Arc::new(pipeline)).is_some() {
                    return Err(ConfigError::DuplicatePipeline {
                        flavor: "async",
                        request: key.request.name(),
                        response: key.response.name(),
                    });
                }
                Ok(())
            },
        ));
        self
    }

    /// Composes every configured pipeline.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] hit: a pipeline for a pair with no
    /// matching handler, an unresolvable named middleware, or a pair
    /// configured twice for the same flavor.
    pub fn build(self) -> Result<Broker, ConfigError> {
        let mut broker = Broker::new(self.registry);
        for configure in self.pending {
            configure(&mut broker, &self.catalog, self.diagnostics.as_ref())?;
        }
        debug!(
            sync_pipelines = broker.sync_pipelines.len(),
            async_pipelines = broker.async_pipelines.len(),
            "broker built"
        );
        Ok(broker)
    }
}

impl fmt::Debug for BrokerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerBuilder")
            .field("catalog", &self.catalog)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Dispatches requests to their registered handler. Stateless per call; safe
/// to share across tasks.
pub struct Broker {
    registry: Arc<Registry>,
    sync_pipelines: PipelineMap,
    async_pipelines: PipelineMap,
}

impl Broker {
    /// A broker without pipelines: every dispatch calls the handler directly.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            sync_pipelines: HashMap::new(),
            async_pipelines: HashMap::new(),
        }
    }

    #[must_use]
    pub fn builder(registry: Arc<Registry>) -> BrokerBuilder {
        BrokerBuilder {
            registry,
            catalog: MiddlewareCatalog::new(),
            diagnostics: None,
            pending: Vec::new(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Dispatches `request` to its blocking handler on the calling thread.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::HandlerNotFound`] if no blocking handler is registered
    ///   for `Req -> Resp`
    /// - [`BrokerError::Failed`] if the handler or a middleware failed
    /// - [`BrokerError::ShortCircuited`] if the pipeline stopped without a response
    pub fn dispatch<Req, Resp>(&self, request: Req) -> Result<Resp, BrokerError>
    where
        Req: Message,
        Resp: Send + 'static,
    {
        let span = dispatch_span::<Req, Resp>();
        let _guard = span.enter();

        let Some(HandlerSlot::Sync(resolver)) = self.registry.handler_slot::<Req, Resp>() else {
            return Err(not_found::<Req, Resp>("Handler"));
        };

        debug!("dispatch started");
        let mut ctx = HandlerContext::new(request, CancellationToken::new());
        let result = match self.sync_pipeline::<Req, Resp>() {
            Some(pipeline) => pipeline.run(&mut ctx),
            None => SyncHandlerTerminal {
                resolver: resolver.clone(),
            }
            .run(&mut ctx),
        };
        finish(ctx, result)
    }

    /// Like [`dispatch`](Self::dispatch), for a request that may be absent.
    ///
    /// # Errors
    ///
    /// [`BrokerError::InvalidArgument`] when `request` is `None`; nothing runs.
    /// Otherwise as [`dispatch`](Self::dispatch).
    pub fn dispatch_option<Req, Resp>(&self, request: Option<Req>) -> Result<Resp, BrokerError>
    where
        Req: Message,
        Resp: Send + 'static,
    {
        let request = request.ok_or(BrokerError::InvalidArgument {
            type_name: type_name::<Req>(),
        })?;
        self.dispatch(request)
    }

    /// Dispatches `request` to its handler, suspending while it runs.
    ///
    /// # Errors
    ///
    /// As [`dispatch_async_with_cancellation`](Self::dispatch_async_with_cancellation).
    pub async fn dispatch_async<Req, Resp>(&self, request: Req) -> Result<Resp, BrokerError>
    where
        Req: Message,
        Resp: Send + 'static,
    {
        self.dispatch_async_with_cancellation(request, CancellationToken::new())
            .await
    }

    /// Dispatches `request` to its handler (either flavor) with a cooperative
    /// cancellation signal. The broker checks the signal before the handler
    /// runs; after that, honoring it is up to middleware and the handler.
    ///
    /// The async pipeline for the pair runs when one is configured. Otherwise
    /// a blocking handler runs through its sync pipeline, if it has one.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::HandlerNotFound`] if no handler is registered
    /// - [`BrokerError::Cancelled`] if cancellation was observed
    /// - [`BrokerError::Failed`] if the handler or a middleware failed
    /// - [`BrokerError::ShortCircuited`] if the pipeline stopped without a response
    pub async fn dispatch_async_with_cancellation<Req, Resp>(
        &self,
        request: Req,
        cancellation: CancellationToken,
    ) -> Result<Resp, BrokerError>
    where
        Req: Message,
        Resp: Send + 'static,
    {
        let span = dispatch_span::<Req, Resp>();
        async move {
            let Some(slot) = self.registry.handler_slot::<Req, Resp>() else {
                return Err(not_found::<Req, Resp>("AsyncHandler"));
            };

            debug!("dispatch started");
            let mut ctx = HandlerContext::new(request, cancellation);
            let result = if let Some(pipeline) = self.async_pipeline::<Req, Resp>() {
                pipeline.run(&mut ctx).await
            } else if let Some(pipeline) = self.sync_pipeline::<Req, Resp>() {
                // A blocking handler keeps its blocking pipeline on this path.
                if ctx.cancellation.is_cancelled() {
                    Err(Cancelled.into())
                } else {
                    pipeline.run(&mut ctx)
                }
            } else {
                HandlerTerminal { slot: slot.clone() }.run(&mut ctx).await
            };
            finish(ctx, result)
        }
        .instrument(span)
        .await
    }

    /// Like [`dispatch_async_with_cancellation`](Self::dispatch_async_with_cancellation),
    /// for a request that may be absent.
    ///
    /// # Errors
    ///
    /// [`BrokerError::InvalidArgument`] when `request` is `None`; nothing runs.
    pub async fn dispatch_async_option<Req, Resp>(
        &self,
        request: Option<Req>,
        cancellation: CancellationToken,
    ) -> Result<Resp, BrokerError>
    where
        Req: Message,
        Resp: Send + 'static,
    {
        let request = request.ok_or(BrokerError::InvalidArgument {
            type_name: type_name::<Req>(),
        })?;
        self.dispatch_async_with_cancellation(request, cancellation)
            .await
    }

    fn sync_pipeline<Req: 'static, Resp: 'static>(
        &self,
    ) -> Option<&SyncPipeline<HandlerContext<Req, Resp>>> {
        self.sync_pipelines
            .get(&HandlerKey::of::<Req, Resp>())?
            .downcast_ref()
    }

    fn async_pipeline<Req: 'static, Resp: 'static>(
        &self,
    ) -> Option<&AsyncPipeline<HandlerContext<Req, Resp>>> {
        self.async_pipelines
            .get(&HandlerKey::of::<Req, Resp>())?
            .downcast_ref()
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("registry", &self.registry)
            .field("sync_pipelines", &self.sync_pipelines.keys().collect::<Vec<_>>())
            .field("async_pipelines", &self.async_pipelines.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn dispatch_span<Req, Resp>() -> tracing::Span {
    info_span!(
        "dispatch",
        request = type_name::<Req>(),
        response = type_name::<Resp>(),
        duration_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    )
}

fn not_found<Req, Resp>(capability: &'static str) -> BrokerError {
    let err = BrokerError::HandlerNotFound {
        capability,
        request: type_name::<Req>(),
        response: type_name::<Resp>(),
    };
    error!(error = %err, "dispatch failed");
    err
}

/// Turns the post-pipeline context into the caller's result.
fn finish<Req, Resp>(
    mut ctx: HandlerContext<Req, Resp>,
    result: anyhow::Result<()>,
) -> Result<Resp, BrokerError> {
    let request = type_name::<Req>();
    let response = type_name::<Resp>();

    let failure = match result {
        Err(err) => Some(Fault::new(err)),
        // A middleware that swallowed a fault without substituting a response
        // still fails the call.
        Ok(()) if ctx.response.is_none() => ctx.fault.clone(),
        Ok(()) => None,
    };

    if let Some(fault) = failure {
        if ctx.fault.is_none() {
            ctx.record_fault(fault.clone());
        }
        if fault.is_cancellation() {
            warn!("dispatch cancelled");
            return Err(BrokerError::Cancelled { request });
        }
        let message = ctx
            .error_message
            .take()
            .unwrap_or_else(|| fault.to_string());
        error!(error = %message, fault = ?fault, "dispatch failed");
        return Err(BrokerError::Failed {
            request,
            response,
            message,
            fault,
        });
    }

    match ctx.response.take() {
        Some(value) => {
            debug!(short_circuited = !ctx.should_continue, "dispatch complete");
            Ok(value)
        }
        None => {
            debug!(reason = ?ctx.error_message, "dispatch short-circuited without a response");
            Err(BrokerError::ShortCircuited {
                request,
                response,
                reason: ctx.error_message.take(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
