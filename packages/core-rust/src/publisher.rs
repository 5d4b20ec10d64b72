//! Domain-event fan-out.
//!
//! [`DomainEventPublisher::publish`] invokes every listener registered for a
//! message type, sequentially and in registration order, optionally wrapped
//! by a before-pipeline (which may short-circuit the whole publish) and an
//! after-pipeline. The first listener fault stops the fan-out and is
//! propagated to the caller.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::context::DomainEventContext;
use crate::error::{Cancelled, Fault, PublishError};
use crate::pipeline::AsyncPipeline;
use crate::registry::{Registry, TypeKey};

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Raised just before a listener is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotice {
    pub message_type: &'static str,
    pub listener: &'static str,
    pub index: usize,
}

/// Raised once a listener has completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerResult {
    pub message_type: &'static str,
    pub listener: &'static str,
    pub index: usize,
    pub success: bool,
    pub message: String,
}

/// Receives per-listener notifications as a publish progresses.
pub trait PublishObserver: Send + Sync {
    fn on_sent(&self, _notice: &SentNotice) {}

    fn on_result(&self, _result: &ListenerResult) {}
}

/// Aggregated outcome of one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub message_type: &'static str,
    /// Listeners invoked.
    pub sent: usize,
    /// One entry per completed listener, in invocation order.
    pub results: Vec<ListenerResult>,
    /// `true` when the before-pipeline stopped the publish.
    pub short_circuited: bool,
}

impl PublishReport {
    fn new(message_type: &'static str) -> Self {
        Self {
            message_type,
            sent: 0,
            results: Vec::new(),
            short_circuited: false,
        }
    }

    /// Whether every invoked listener reported success.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }
}

// ---------------------------------------------------------------------------
// DomainEventPublisher
// ---------------------------------------------------------------------------

struct EventPipelines<T> {
    before: Option<AsyncPipeline<DomainEventContext<T>>>,
    after: Option<AsyncPipeline<DomainEventContext<T>>>,
}

/// Publishes messages to every listener registered for their type.
pub struct DomainEventPublisher {
    registry: Arc<Registry>,
    pipelines: HashMap<TypeKey, Arc<dyn Any + Send + Sync>>,
    observers: Vec<Arc<dyn PublishObserver>>,
}

impl DomainEventPublisher {
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            pipelines: HashMap::new(),
            observers: Vec::new(),
        }
    }

    /// Wraps every publish of `T`. `before` runs once ahead of the fan-out and
    /// may short-circuit it; `after` runs once after a completed fan-out.
    /// Either may be omitted. Replaces any earlier configuration for `T`.
    #[must_use]
    pub fn with_pipeline<T: Send + Sync + 'static>(
        mut self,
        before: Option<AsyncPipeline<DomainEventContext<T>>>,
        after: Option<AsyncPipeline<DomainEventContext<T>>>,
    ) -> Self {
        self.pipelines
            .insert(TypeKey::of::<T>(), Arc::new(EventPipelines { before, after }));
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn PublishObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Publishes `message` and waits for every listener.
    ///
    /// # Errors
    ///
    /// As [`publish_with_cancellation`](Self::publish_with_cancellation).
    pub async fn publish<T: Send + Sync + 'static>(
        &self,
        message: T,
    ) -> Result<PublishReport, PublishError> {
        self.publish_with_cancellation(message, CancellationToken::new())
            .await
    }

    /// Publishes `message`, checking `cancellation` before each listener.
    ///
    /// Zero registered listeners is a successful no-op.
    ///
    /// # Errors
    ///
    /// - [`PublishError::ListenerFailed`] for the first listener that faulted;
    ///   later listeners are not invoked
    /// - [`PublishError::PipelineFailed`] if the before- or after-pipeline failed
    /// - [`PublishError::Cancelled`] if cancellation was observed
    pub async fn publish_with_cancellation<T: Send + Sync + 'static>(
        &self,
        message: T,
        cancellation: CancellationToken,
    ) -> Result<PublishReport, PublishError> {
        let message_type = type_name::<T>();
        let span = info_span!("publish", message_type);
        async move {
            let mut ctx = DomainEventContext::new(message, cancellation);
            let pipelines = self.pipelines::<T>();
            let mut report = PublishReport::new(message_type);

            if let Some(before) = pipelines.and_then(|p| p.before.as_ref()) {
                if let Err(err) = before.run(&mut ctx).await {
                    return Err(pipeline_failed(&mut ctx, "before", err));
                }
                if !ctx.should_continue {
                    debug!("publish short-circuited before fan-out");
                    report.short_circuited = true;
                    return Ok(report);
                }
            }

            for (index, entry) in self.registry.listeners::<T>().into_iter().enumerate() {
                if ctx.cancellation.is_cancelled() {
                    ctx.record_fault(Fault::new(Cancelled.into()));
                    warn!(index, "publish cancelled");
                    return Err(PublishError::Cancelled { message_type });
                }

                let notice = SentNotice {
                    message_type,
                    listener: entry.implementation,
                    index,
                };
                debug!(listener = notice.listener, index, "message sent");
                for observer in &self.observers {
                    observer.on_sent(&notice);
                }
                report.sent += 1;

                match entry.listener.execute(&ctx.message, &ctx.cancellation).await {
                    Ok(outcome) => {
                        if !outcome.success {
                            ctx.success = false;
                        }
                        let result = ListenerResult {
                            message_type,
                            listener: entry.implementation,
                            index,
                            success: outcome.success,
                            message: outcome.message,
                        };
                        debug!(
                            listener = result.listener,
                            index,
                            success = result.success,
                            message = %result.message,
                            "message result"
                        );
                        for observer in &self.observers {
                            observer.on_result(&result);
                        }
                        report.results.push(result);
                    }
                    Err(err) => {
                        let fault = Fault::new(err);
                        ctx.record_fault(fault.clone());
                        if fault.is_cancellation() {
                            warn!(listener = entry.implementation, index, "publish cancelled");
                            return Err(PublishError::Cancelled { message_type });
                        }
                        error!(
                            listener = entry.implementation,
                            index,
                            error = %fault,
                            "listener failed"
                        );
                        return Err(PublishError::ListenerFailed {
                            message_type,
                            listener: entry.implementation,
                            index,
                            message: fault.to_string(),
                            fault,
                        });
                    }
                }
            }

            if let Some(after) = pipelines.and_then(|p| p.after.as_ref()) {
                if let Err(err) = after.run(&mut ctx).await {
                    return Err(pipeline_failed(&mut ctx, "after", err));
                }
            }

            debug!(sent = report.sent, success = ctx.success, "publish complete");
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Publishes on a spawned task and returns immediately. Opt-in: the caller
    /// no longer observes ordering relative to its own work, only the handle.
    pub fn publish_detached<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        message: T,
    ) -> JoinHandle<Result<PublishReport, PublishError>> {
        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            let result = publisher.publish(message).await;
            if let Err(err) = &result {
                warn!(error = %err, "detached publish failed");
            }
            result
        })
    }

    fn pipelines<T: 'static>(&self) -> Option<&EventPipelines<T>> {
        self.pipelines.get(&TypeKey::of::<T>())?.downcast_ref()
    }
}

impl fmt::Debug for DomainEventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainEventPublisher")
            .field("registry", &self.registry)
            .field("pipelines", &self.pipelines.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}

fn pipeline_failed<T>(
    ctx: &mut DomainEventContext<T>,
    stage: &'static str,
    err: anyhow::Error,
) -> PublishError {
    let message_type = type_name::<T>();
    let fault = Fault::new(err);
    if ctx.fault.is_none() {
        ctx.record_fault(fault.clone());
    }
    if fault.is_cancellation() {
        warn!(stage, "publish cancelled");
        return PublishError::Cancelled { message_type };
    }
    error!(stage, error = %fault, "publish pipeline failed");
    PublishError::PipelineFailed {
        message_type,
        stage,
        message: fault.to_string(),
        fault,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::handler::{DomainEvent, ListenerOutcome};
    use crate::pipeline::{AsyncMiddleware, AsyncNext, MiddlewareCatalog, NoopTerminal, PipelineBuilder};
    use crate::registry::RegistryBuilder;

    type Log = Arc<Mutex<Vec<String>>>;
    type Ctx = DomainEventContext<WidgetCreated>;

    #[derive(Debug, Clone)]
    struct WidgetCreated {
        id: String,
    }

    enum Behavior {
        Succeed,
        Report,
        Fail,
    }

    struct Recording {
        name: &'static str,
        log: Log,
        behavior: Behavior,
    }

    #[async_trait]
    impl DomainEvent<WidgetCreated> for Recording {
        async fn execute(
            &self,
            message: &WidgetCreated,
            _cancellation: &CancellationToken,
        ) -> anyhow::Result<ListenerOutcome> {
            self.log.lock().push(format!("{}:{}", self.name, message.id));
            match self.behavior {
                Behavior::Succeed => Ok(ListenerOutcome::completed(format!("{} done", self.name))),
                Behavior::Report => Ok(ListenerOutcome::unsuccessful("mailbox full")),
                Behavior::Fail => anyhow::bail!("{} crashed", self.name),
            }
        }
    }

    #[derive(Default)]
    struct Counting {
        sent: AtomicU32,
        results: AtomicU32,
    }

    impl PublishObserver for Counting {
        fn on_sent(&self, _notice: &SentNotice) {
            self.sent.fetch_add(1, Ordering::Relaxed);
        }

        fn on_result(&self, _result: &ListenerResult) {
            self.results.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct Stage {
        name: &'static str,
        log: Log,
        stop: bool,
    }

    #[async_trait]
    impl AsyncMiddleware<Ctx> for Stage {
        async fn invoke(&self, ctx: &mut Ctx, next: AsyncNext<'_, Ctx>) -> anyhow::Result<()> {
            self.log.lock().push(self.name.to_string());
            if self.stop {
                ctx.short_circuit();
                return Ok(());
            }
            next.run(ctx).await
        }
    }

    fn registry(log: &Log, behaviors: Vec<(&'static str, Behavior)>) -> Arc<Registry> {
        let mut builder = RegistryBuilder::new();
        for (name, behavior) in behaviors {
            builder.register_listener::<WidgetCreated, _>(Recording {
                name,
                log: Arc::clone(log),
                behavior,
            });
        }
        Arc::new(builder.build().unwrap())
    }

    fn stage(name: &'static str, log: &Log, stop: bool) -> AsyncPipeline<Ctx> {
        let mut builder = PipelineBuilder::<Ctx>::new(name);
        builder.with(Stage {
            name,
            log: Arc::clone(log),
            stop,
        });
        builder
            .build(&MiddlewareCatalog::new(), Arc::new(NoopTerminal))
            .unwrap()
    }

    fn created(id: &str) -> WidgetCreated {
        WidgetCreated { id: id.to_string() }
    }

    #[tokio::test]
    async fn every_listener_is_notified_in_order() {
        let log: Log = Arc::default();
        let observer = Arc::new(Counting::default());
        let publisher = DomainEventPublisher::new(registry(
            &log,
            vec![("first", Behavior::Succeed), ("second", Behavior::Succeed)],
        ))
        .with_observer(Arc::clone(&observer) as Arc<dyn PublishObserver>);

        let report = publisher.publish(created("w1")).await.unwrap();

        assert_eq!(report.sent, 2);
        assert_eq!(report.results.len(), 2);
        assert!(report.all_succeeded());
        assert_eq!(observer.sent.load(Ordering::Relaxed), 2);
        assert_eq!(observer.results.load(Ordering::Relaxed), 2);
        assert_eq!(*log.lock(), vec!["first:w1", "second:w1"]);
        assert_eq!(report.results[1].message, "second done");
    }

    #[tokio::test]
    async fn no_listeners_is_a_no_op() {
        let publisher = DomainEventPublisher::new(Arc::new(RegistryBuilder::new().build().unwrap()));
        let report = publisher.publish(created("w1")).await.unwrap();
        assert_eq!(report.sent, 0);
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn listener_fault_stops_the_fan_out() {
        let log: Log = Arc::default();
        let observer = Arc::new(Counting::default());
        let publisher = DomainEventPublisher::new(registry(
            &log,
            vec![
                ("first", Behavior::Succeed),
                ("second", Behavior::Fail),
                ("third", Behavior::Succeed),
            ],
        ))
        .with_observer(Arc::clone(&observer) as Arc<dyn PublishObserver>);

        let err = publisher.publish(created("w1")).await.unwrap_err();

        let PublishError::ListenerFailed { index, message, .. } = &err else {
            panic!("expected ListenerFailed, got {err:?}");
        };
        assert_eq!(*index, 1);
        assert_eq!(message, "second crashed");
        assert_eq!(*log.lock(), vec!["first:w1", "second:w1"]);
        assert_eq!(observer.sent.load(Ordering::Relaxed), 2);
        assert_eq!(observer.results.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unsuccessful_outcome_does_not_stop_the_fan_out() {
        let log: Log = Arc::default();
        let publisher = DomainEventPublisher::new(registry(
            &log,
            vec![("first", Behavior::Report), ("second", Behavior::Succeed)],
        ));

        let report = publisher.publish(created("w1")).await.unwrap();
        assert_eq!(report.sent, 2);
        assert!(!report.all_succeeded());
        assert_eq!(report.results[0].message, "mailbox full");
    }

    #[tokio::test]
    async fn before_pipeline_can_short_circuit_the_publish() {
        let log: Log = Arc::default();
        let publisher = DomainEventPublisher::new(registry(&log, vec![("first", Behavior::Succeed)]))
            .with_pipeline(Some(stage("before", &log, true)), Some(stage("after", &log, false)));

        let report = publisher.publish(created("w1")).await.unwrap();
        assert!(report.short_circuited);
        assert_eq!(report.sent, 0);
        assert_eq!(*log.lock(), vec!["before"]);
    }

    #[tokio::test]
    async fn pipelines_wrap_the_fan_out() {
        let log: Log = Arc::default();
        let publisher = DomainEventPublisher::new(registry(&log, vec![("first", Behavior::Succeed)]))
            .with_pipeline(Some(stage("before", &log, false)), Some(stage("after", &log, false)));

        publisher.publish(created("w1")).await.unwrap();
        assert_eq!(*log.lock(), vec!["before", "first:w1", "after"]);
    }

    #[tokio::test]
    async fn after_pipeline_runs_without_before_pipeline() {
        let log: Log = Arc::default();
        let publisher = DomainEventPublisher::new(registry(&log, vec![("first", Behavior::Succeed)]))
            .with_pipeline(None, Some(stage("after", &log, false)));

        publisher.publish(created("w1")).await.unwrap();
        assert_eq!(*log.lock(), vec!["first:w1", "after"]);
    }

    #[tokio::test]
    async fn cancelled_publish_invokes_no_listener() {
        let log: Log = Arc::default();
        let publisher = DomainEventPublisher::new(registry(&log, vec![("first", Behavior::Succeed)]));
        let token = CancellationToken::new();
        token.cancel();

        let err = publisher
            .publish_with_cancellation(created("w1"), token)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Cancelled { .. }));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn detached_publish_reports_through_its_handle() {
        let log: Log = Arc::default();
        let publisher = Arc::new(DomainEventPublisher::new(registry(
            &log,
            vec![("first", Behavior::Succeed), ("second", Behavior::Succeed)],
        )));

        let report = publisher
            .publish_detached(created("w2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(*log.lock(), vec!["first:w2", "second:w2"]);
    }
}
