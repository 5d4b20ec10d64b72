//! The widget domain: messages, handlers, listeners, middleware, and the
//! wiring that assembles them into a broker and a domain-event publisher.
//!
//! `CreateWidget` publishes through the publisher, so wiring happens in two
//! steps: listeners are scanned into their own registry first, the publisher
//! is built over it, and only then is the handler manifest (which captures
//! the publisher) scanned into the broker's registry.

pub mod handlers;
pub mod listeners;
pub mod messages;
pub mod middleware;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use commandquery_core::{
    register_scanned, Broker, CommandQueryOptions, CommandResponse, Component, ConfigError,
    DomainEventContext, DomainEventPublisher, HandlerContext, Manifest, MiddlewareCatalog,
    NoopTerminal, PipelineBuilder, RegistrationInfo, RegistryBuilder, Scanner, TracingDiagnostics,
    DOMAIN_EVENT_SHAPES, HANDLER_SHAPES,
};
use tracing::info;

pub use handlers::{CountWidgetsQuery, CreateWidget, GetWidgetQuery};
pub use listeners::{WidgetAuditListener, WidgetCreatedHandler, WidgetIndex};
pub use messages::{CountWidgets, CreateWidgetMessage, GetWidget, Widget, WidgetCount, WidgetCreated};
pub use middleware::{
    AsyncHandlerLoggingMiddleware, AsyncHandlerValidationMiddleware, DomainEventLoggingMiddleware,
    DomainEventValidationMiddleware, HandlerLoggingMiddleware, HandlerValidationMiddleware,
    Rejection, Validate,
};

/// Catalog id of the logging middleware.
pub const LOGGING: &str = "logging";
/// Catalog id of the validation middleware.
pub const VALIDATION: &str = "validation";

// ---------------------------------------------------------------------------
// Manifests
// ---------------------------------------------------------------------------

/// Listener components only.
#[must_use]
pub fn listener_manifest(index: &Arc<WidgetIndex>, audited: &Arc<AtomicU64>) -> Manifest {
    Manifest::new("widget-listeners")
        .with(
            Component::singleton(WidgetCreatedHandler::new(Arc::clone(index)))
                .listens::<WidgetCreated>()
                .build(),
        )
        .with(
            Component::singleton(WidgetAuditListener::new(Arc::clone(audited)))
                .listens::<WidgetCreated>()
                .build(),
        )
}

/// Every sample component: the three handlers plus the listeners.
#[must_use]
pub fn manifest(
    publisher: &Arc<DomainEventPublisher>,
    index: &Arc<WidgetIndex>,
    audited: &Arc<AtomicU64>,
) -> Manifest {
    let publisher = Arc::clone(publisher);
    let mut manifest = Manifest::new("widget")
        .with(
            Component::transient(move || CreateWidget::new(Arc::clone(&publisher)))
                .handles_async::<CreateWidgetMessage, CommandResponse<String>>()
                .build(),
        )
        .with(
            Component::singleton(GetWidgetQuery::new(Arc::clone(index)))
                .handles_async::<GetWidget, Widget>()
                .build(),
        )
        .with(
            Component::singleton(CountWidgetsQuery::new(Arc::clone(index)))
                .handles::<CountWidgets, WidgetCount>()
                .build(),
        );
    for component in listener_manifest(index, audited).components() {
        manifest.push(component.clone());
    }
    manifest
}

/// Logging and validation middleware registered for every pipeline context
/// the domain configures.
#[must_use]
pub fn middleware_catalog() -> MiddlewareCatalog {
    type CountCtx = HandlerContext<CountWidgets, WidgetCount>;
    type CreateCtx = HandlerContext<CreateWidgetMessage, CommandResponse<String>>;
    type GetCtx = HandlerContext<GetWidget, Widget>;
    type CreatedCtx = DomainEventContext<WidgetCreated>;

    let mut catalog = MiddlewareCatalog::new();
    catalog
        .register::<CountCtx, _>(LOGGING, HandlerLoggingMiddleware)
        .register::<CountCtx, _>(VALIDATION, HandlerValidationMiddleware)
        .register_async::<CreateCtx, _>(LOGGING, AsyncHandlerLoggingMiddleware)
        .register_async::<CreateCtx, _>(VALIDATION, AsyncHandlerValidationMiddleware)
        .register_async::<GetCtx, _>(LOGGING, AsyncHandlerLoggingMiddleware)
        .register_async::<GetCtx, _>(VALIDATION, AsyncHandlerValidationMiddleware)
        .register_async::<CreatedCtx, _>(LOGGING, DomainEventLoggingMiddleware)
        .register_async::<CreatedCtx, _>(VALIDATION, DomainEventValidationMiddleware);
    catalog
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// The assembled domain: what the HTTP layer dispatches into.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub broker: Arc<Broker>,
    pub publisher: Arc<DomainEventPublisher>,
    pub index: Arc<WidgetIndex>,
    audited: Arc<AtomicU64>,
    /// What the handler scan registered.
    pub registrations: RegistrationInfo,
}

impl Runtime {
    /// `WidgetCreated` events the audit listener has seen.
    #[must_use]
    pub fn audited(&self) -> u64 {
        self.audited.load(Ordering::Relaxed)
    }
}

/// Scans the sample manifests and builds the broker and publisher with
/// logging and validation pipelines on every pair.
///
/// # Errors
///
/// Any [`ConfigError`] from registration, validation, or pipeline building.
pub fn build_runtime(options: &CommandQueryOptions) -> Result<Runtime, ConfigError> {
    let index = Arc::new(WidgetIndex::new());
    let audited = Arc::new(AtomicU64::new(0));
    let catalog = middleware_catalog();
    let scanner = Scanner::new();

    let mut listeners = RegistryBuilder::new();
    register_scanned(
        &mut listeners,
        &scanner,
        &[&listener_manifest(&index, &audited)],
        &DOMAIN_EVENT_SHAPES,
        options,
    )?;

    let mut before = PipelineBuilder::<DomainEventContext<WidgetCreated>>::new("WidgetCreated.before");
    before
        .with_named(LOGGING)
        .with_named(VALIDATION)
        .diagnostics(Arc::new(TracingDiagnostics));
    let before = before.build(&catalog, Arc::new(NoopTerminal))?;
    let publisher = Arc::new(
        DomainEventPublisher::new(Arc::new(listeners.build()?)).with_pipeline(Some(before), None),
    );

    let mut handlers = RegistryBuilder::new();
    let registrations = register_scanned(
        &mut handlers,
        &scanner,
        &[&manifest(&publisher, &index, &audited)],
        &HANDLER_SHAPES,
        options,
    )?;

    let broker = Broker::builder(Arc::new(handlers.build()?))
        .catalog(catalog)
        .diagnostics(Arc::new(TracingDiagnostics))
        .pipeline::<CountWidgets, WidgetCount, _>(|p| {
            p.with_named(LOGGING).with_named(VALIDATION);
        })
        .async_pipeline::<CreateWidgetMessage, CommandResponse<String>, _>(|p| {
            p.with_named(LOGGING).with_named(VALIDATION);
        })
        .async_pipeline::<GetWidget, Widget, _>(|p| {
            p.with_named(LOGGING).with_named(VALIDATION);
        })
        .build()?;

    info!(
        handlers = registrations.implementation_types.len(),
        "widget runtime assembled"
    );

    Ok(Runtime {
        broker: Arc::new(broker),
        publisher,
        index,
        audited,
        registrations,
    })
}

#[cfg(test)]
mod tests {
    use std::any::type_name;

    use commandquery_core::BrokerError;

    use super::*;

    fn runtime() -> Runtime {
        build_runtime(&CommandQueryOptions {
            log_registrations: true,
            validate_registrations: true,
        })
        .unwrap()
    }

    #[test]
    fn runtime_registers_every_handler() {
        let runtime = runtime();
        assert_eq!(
            runtime.registrations.implementation_types,
            vec![
                type_name::<CreateWidget>(),
                type_name::<GetWidgetQuery>(),
                type_name::<CountWidgetsQuery>(),
            ]
        );
        assert!(runtime.broker.registry().contains::<GetWidget, Widget>());
        assert_eq!(runtime.publisher.registry().listeners::<WidgetCreated>().len(), 2);
    }

    #[test]
    fn full_manifest_lists_handlers_and_listeners() {
        let runtime = runtime();
        let manifest = manifest(&runtime.publisher, &runtime.index, &Arc::default());
        assert_eq!(manifest.len(), 5);
    }

    #[tokio::test]
    async fn create_then_get_round_trips_through_the_broker() {
        let runtime = runtime();

        let created: CommandResponse<String> = runtime
            .broker
            .dispatch_async(CreateWidgetMessage {
                name: "foo".to_string(),
            })
            .await
            .unwrap();
        assert!(created.success);
        let id = created.data.unwrap();
        assert!(!id.is_empty());
        assert_eq!(runtime.audited(), 1);

        let widget: Widget = runtime
            .broker
            .dispatch_async(GetWidget { id: id.clone() })
            .await
            .unwrap();
        assert_eq!(widget.id, id);
        assert_eq!(widget.name.as_deref(), Some("foo"));

        let count: WidgetCount = runtime.broker.dispatch(CountWidgets).unwrap();
        assert_eq!(count.total, 1);
    }

    #[tokio::test]
    async fn get_unknown_widget_echoes_the_id() {
        let runtime = runtime();
        let widget: Widget = runtime
            .broker
            .dispatch_async(GetWidget {
                id: "abc".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(widget.id, "abc");
        assert!(widget.name.is_none());
    }

    #[tokio::test]
    async fn blank_name_is_rejected_before_the_handler() {
        let runtime = runtime();
        let response: CommandResponse<String> = runtime
            .broker
            .dispatch_async(CreateWidgetMessage {
                name: " ".to_string(),
            })
            .await
            .unwrap();
        assert!(!response.success);
        assert!(runtime.index.is_empty());
        assert_eq!(runtime.audited(), 0);
    }

    #[tokio::test]
    async fn missing_request_is_an_invalid_argument() {
        let runtime = runtime();
        let err = runtime
            .broker
            .dispatch_async_option::<CreateWidgetMessage, CommandResponse<String>>(
                None,
                tokio_util::sync::CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument { .. }));
    }
}
