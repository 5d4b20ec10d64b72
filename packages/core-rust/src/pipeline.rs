//! Middleware pipelines: an ordered chain of stages wrapped around a terminal.
//!
//! Stages are composed as an onion. The first registered middleware is the
//! outermost: it runs first on the way in and last on the way out. A stage
//! that does not call `next` (or clears the context's continuation flag)
//! stops every inner stage and the terminal, while stages already entered
//! still finish their "after" logic.
//!
//! The sync and async flavors are structurally identical; only the
//! suspension mechanism differs.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::context::PipelineContext;
use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Sync flavor
// ---------------------------------------------------------------------------

/// A blocking pipeline stage.
pub trait Middleware<C>: Send + Sync {
    /// Observe or modify `ctx`, then call `next.run(ctx)` to continue inward.
    fn invoke(&self, ctx: &mut C, next: Next<'_, C>) -> anyhow::Result<()>;
}

/// The innermost action of a blocking pipeline.
pub trait Terminal<C>: Send + Sync {
    fn run(&self, ctx: &mut C) -> anyhow::Result<()>;
}

impl<C, F> Terminal<C> for F
where
    F: Fn(&mut C) -> anyhow::Result<()> + Send + Sync,
{
    fn run(&self, ctx: &mut C) -> anyhow::Result<()> {
        self(ctx)
    }
}

/// Remaining stages of a blocking pipeline.
pub struct Next<'a, C> {
    chain: &'a [Arc<dyn Middleware<C>>],
    terminal: &'a dyn Terminal<C>,
}

impl<C: PipelineContext> Next<'_, C> {
    /// Runs the next stage, or the terminal once the chain is exhausted.
    ///
    /// Does nothing when the context has already been short-circuited.
    pub fn run(self, ctx: &mut C) -> anyhow::Result<()> {
        if !ctx.should_continue() {
            return Ok(());
        }
        match self.chain.split_first() {
            Some((head, rest)) => head.invoke(
                ctx,
                Next {
                    chain: rest,
                    terminal: self.terminal,
                },
            ),
            None => self.terminal.run(ctx),
        }
    }
}

/// A built blocking pipeline.
pub struct SyncPipeline<C> {
    name: String,
    middleware: Vec<Arc<dyn Middleware<C>>>,
    terminal: Arc<dyn Terminal<C>>,
    diagnostics: Option<Arc<dyn PipelineDiagnostics>>,
}

impl<C: PipelineContext> SyncPipeline<C> {
    /// Runs every stage and the terminal against `ctx`.
    pub fn run(&self, ctx: &mut C) -> anyhow::Result<()> {
        let next = Next {
            chain: &self.middleware,
            terminal: self.terminal.as_ref(),
        };
        let Some(diagnostics) = &self.diagnostics else {
            return next.run(ctx);
        };

        diagnostics.on_start(&self.name);
        let start = Instant::now();
        let result = next.run(ctx);
        diagnostics.on_complete(&self.name, start.elapsed(), PipelineOutcome::of(&result, ctx));
        result
    }
}

impl<C> SyncPipeline<C> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of middleware stages, excluding the terminal.
    #[must_use]
    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }
}

impl<C> fmt::Debug for SyncPipeline<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPipeline")
            .field("name", &self.name)
            .field("stages", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Async flavor
// ---------------------------------------------------------------------------

/// A suspending pipeline stage.
#[async_trait]
pub trait AsyncMiddleware<C>: Send + Sync {
    /// Observe or modify `ctx`, then `next.run(ctx).await` to continue inward.
    async fn invoke(&self, ctx: &mut C, next: AsyncNext<'_, C>) -> anyhow::Result<()>;
}

/// The innermost action of a suspending pipeline.
#[async_trait]
pub trait AsyncTerminal<C>: Send + Sync {
    async fn run(&self, ctx: &mut C) -> anyhow::Result<()>;
}

/// Terminal that does nothing. Used by pipelines that only wrap side effects,
/// such as the before/after stages of a domain-event publish.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTerminal;

impl<C> Terminal<C> for NoopTerminal {
    fn run(&self, _ctx: &mut C) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<C: Send> AsyncTerminal<C> for NoopTerminal {
    async fn run(&self, _ctx: &mut C) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Remaining stages of a suspending pipeline.
pub struct AsyncNext<'a, C> {
    chain: &'a [Arc<dyn AsyncMiddleware<C>>],
    terminal: &'a dyn AsyncTerminal<C>,
}

impl<C: PipelineContext> AsyncNext<'_, C> {
    /// Runs the next stage, or the terminal once the chain is exhausted.
    ///
    /// Does nothing when the context has already been short-circuited.
    pub async fn run(self, ctx: &mut C) -> anyhow::Result<()> {
        if !ctx.should_continue() {
            return Ok(());
        }
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.invoke(
                    ctx,
                    AsyncNext {
                        chain: rest,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => self.terminal.run(ctx).await,
        }
    }
}

/// A built suspending pipeline.
pub struct AsyncPipeline<C> {
    name: String,
    middleware: Vec<Arc<dyn AsyncMiddleware<C>>>,
    terminal: Arc<dyn AsyncTerminal<C>>,
    diagnostics: Option<Arc<dyn PipelineDiagnostics>>,
}

impl<C: PipelineContext> AsyncPipeline<C> {
    /// Runs every stage and the terminal against `ctx`.
    pub async fn run(&self, ctx: &mut C) -> anyhow::Result<()> {
        let next = AsyncNext {
            chain: &self.middleware,
            terminal: self.terminal.as_ref(),
        };
        let Some(diagnostics) = &self.diagnostics else {
            return next.run(ctx).await;
        };

        diagnostics.on_start(&self.name);
        let start = Instant::now();
        let result = next.run(ctx).await;
        diagnostics.on_complete(&self.name, start.elapsed(), PipelineOutcome::of(&result, ctx));
        result
    }
}

impl<C> AsyncPipeline<C> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }
}

impl<C> fmt::Debug for AsyncPipeline<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncPipeline")
            .field("name", &self.name)
            .field("stages", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    ShortCircuited,
    Failed,
}

impl PipelineOutcome {
    fn of<C: PipelineContext>(result: &anyhow::Result<()>, ctx: &C) -> Self {
        if result.is_err() || !ctx.success() {
            Self::Failed
        } else if ctx.should_continue() {
            Self::Completed
        } else {
            Self::ShortCircuited
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ShortCircuited => "short_circuited",
            Self::Failed => "failed",
        }
    }
}

/// Instrumentation hook wrapped around a built pipeline. Never alters its result.
pub trait PipelineDiagnostics: Send + Sync {
    fn on_start(&self, _pipeline: &str) {}

    fn on_complete(&self, pipeline: &str, elapsed: Duration, outcome: PipelineOutcome);
}

/// Emits pipeline timing and outcome as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl PipelineDiagnostics for TracingDiagnostics {
    fn on_start(&self, pipeline: &str) {
        debug!(pipeline, "pipeline started");
    }

    fn on_complete(&self, pipeline: &str, elapsed: Duration, outcome: PipelineOutcome) {
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = elapsed.as_millis() as u64;
        tracing::Span::current().record("duration_ms", duration_ms);
        tracing::Span::current().record("outcome", outcome.as_str());
        info!(
            pipeline,
            duration_ms,
            outcome = outcome.as_str(),
            "pipeline complete"
        );
    }
}

// ---------------------------------------------------------------------------
// MiddlewareCatalog
// ---------------------------------------------------------------------------

/// Named middleware instances that pipeline builders resolve by id.
///
/// One id may be registered for several context types; resolution picks the
/// entry matching the pipeline's context type and flavor.
#[derive(Default, Clone)]
pub struct MiddlewareCatalog {
    entries: HashMap<String, Vec<Arc<dyn Any + Send + Sync>>>,
}

impl MiddlewareCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers blocking middleware for context `C` under `id`.
    pub fn register<C, M>(&mut self, id: impl Into<String>, middleware: M) -> &mut Self
    where
        C: 'static,
        M: Middleware<C> + 'static,
    {
        let shared: Arc<dyn Middleware<C>> = Arc::new(middleware);
        self.insert(id.into(), Arc::new(shared));
        self
    }

    /// Registers suspending middleware for context `C` under `id`.
    pub fn register_async<C, M>(&mut self, id: impl Into<String>, middleware: M) -> &mut Self
    where
        C: Send + 'static,
        M: AsyncMiddleware<C> + 'static,
    {
        let shared: Arc<dyn AsyncMiddleware<C>> = Arc::new(middleware);
        self.insert(id.into(), Arc::new(shared));
        self
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    fn insert(&mut self, id: String, entry: Arc<dyn Any + Send + Sync>) {
        let slot = self.entries.entry(id).or_default();
        // Re-registering the same id and flavor for a context replaces it.
        let type_id = (*entry).type_id();
        slot.retain(|existing| (**existing).type_id() != type_id);
        slot.push(entry);
    }

    fn resolve<T: Clone + 'static>(&self, id: &str) -> Result<T, ConfigError> {
        let candidates = self
            .entries
            .get(id)
            .ok_or_else(|| ConfigError::UnresolvedMiddleware {
                id: id.to_string(),
                reason: "no middleware is registered under this id",
            })?;
        candidates
            .iter()
            .find_map(|entry| entry.downcast_ref::<T>().cloned())
            .ok_or_else(|| ConfigError::UnresolvedMiddleware {
                id: id.to_string(),
                reason: "registered middleware does not accept this pipeline's context",
            })
    }
}

impl fmt::Debug for MiddlewareCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

enum Stage<M> {
    Instance(M),
    Named(String),
}

/// Collects an ordered list of blocking stages; [`build`](Self::build)
/// resolves named stages and composes the pipeline.
pub struct SyncPipelineBuilder<C> {
    name: String,
    stages: Vec<Stage<Arc<dyn Middleware<C>>>>,
    diagnostics: Option<Arc<dyn PipelineDiagnostics>>,
}

impl<C: 'static> SyncPipelineBuilder<C> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            diagnostics: None,
        }
    }

    /// Appends a middleware instance. Earlier stages wrap later ones.
    pub fn with<M: Middleware<C> + 'static>(&mut self, middleware: M) -> &mut Self {
        self.stages.push(Stage::Instance(Arc::new(middleware)));
        self
    }

    pub fn with_shared(&mut self, middleware: Arc<dyn Middleware<C>>) -> &mut Self {
        self.stages.push(Stage::Instance(middleware));
        self
    }

    /// Appends a stage resolved from the catalog at build time.
    pub fn with_named(&mut self, id: impl Into<String>) -> &mut Self {
        self.stages.push(Stage::Named(id.into()));
        self
    }

    pub fn diagnostics(&mut self, diagnostics: Arc<dyn PipelineDiagnostics>) -> &mut Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub(crate) fn diagnostics_if_unset(&mut self, diagnostics: &Arc<dyn PipelineDiagnostics>) {
        if self.diagnostics.is_none() {
            self.diagnostics = Some(Arc::clone(diagnostics));
        }
    }

    /// Composes the pipeline around `terminal`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnresolvedMiddleware`] if a named stage is not
    /// in `catalog`.
    pub fn build(
        &self,
        catalog: &MiddlewareCatalog,
        terminal: Arc<dyn Terminal<C>>,
    ) -> Result<SyncPipeline<C>, ConfigError> {
        let middleware = self
            .stages
            .iter()
            .map(|stage| match stage {
                Stage::Instance(m) => Ok(Arc::clone(m)),
                Stage::Named(id) => catalog.resolve::<Arc<dyn Middleware<C>>>(id),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SyncPipeline {
            name: self.name.clone(),
            middleware,
            terminal,
            diagnostics: self.diagnostics.clone(),
        })
    }
}

/// Collects an ordered list of suspending stages; [`build`](Self::build)
/// resolves named stages and composes the pipeline.
pub struct PipelineBuilder<C> {
    name: String,
    stages: Vec<Stage<Arc<dyn AsyncMiddleware<C>>>>,
    diagnostics: Option<Arc<dyn PipelineDiagnostics>>,
}

impl<C: Send + 'static> PipelineBuilder<C> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            diagnostics: None,
        }
    }

    /// Appends a middleware instance. Earlier stages wrap later ones.
    pub fn with<M: AsyncMiddleware<C> + 'static>(&mut self, middleware: M) -> &mut Self {
        self.stages.push(Stage::Instance(Arc::new(middleware)));
        self
    }

    pub fn with_shared(&mut self, middleware: Arc<dyn AsyncMiddleware<C>>) -> &mut Self {
        self.stages.push(Stage::Instance(middleware));
        self
    }

    /// Appends a stage resolved from the catalog at build time.
    pub fn with_named(&mut self, id: impl Into<String>) -> &mut Self {
        self.stages.push(Stage::Named(id.into()));
        self
    }

    pub fn diagnostics(&mut self, diagnostics: Arc<dyn PipelineDiagnostics>) -> &mut Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub(crate) fn diagnostics_if_unset(&mut self, diagnostics: &Arc<dyn PipelineDiagnostics>) {
        if self.diagnostics.is_none() {
            self.diagnostics = Some(Arc::clone(diagnostics));
        }
    }

    /// Composes the pipeline around `terminal`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnresolvedMiddleware`] if a named stage is not
    /// in `catalog`.
    pub fn build(
        &self,
        catalog: &MiddlewareCatalog,
        terminal: Arc<dyn AsyncTerminal<C>>,
    ) -> Result<AsyncPipeline<C>, ConfigError> {
        let middleware = self
            .stages
            .iter()
            .map(|stage| match stage {
                Stage::Instance(m) => Ok(Arc::clone(m)),
                Stage::Named(id) => catalog.resolve::<Arc<dyn AsyncMiddleware<C>>>(id),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AsyncPipeline {
            name: self.name.clone(),
            middleware,
            terminal,
            diagnostics: self.diagnostics.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
