//! `CommandQuery` Core: handler registry, middleware pipelines, request broker,
//! and domain-event publishing.

pub mod broker;
pub mod context;
pub mod error;
pub mod handler;
pub mod message;
pub mod options;
pub mod pipeline;
pub mod publisher;
pub mod registration;
pub mod registry;
pub mod response;
pub mod scan;

pub use broker::{Broker, BrokerBuilder};
pub use context::{DomainEventContext, HandlerContext, Items, PipelineContext};
pub use error::{BrokerError, Cancelled, ConfigError, Fault, PublishError};
pub use handler::{listener_fn, AsyncHandler, DomainEvent, FnListener, Handler, ListenerOutcome};
pub use message::Message;
pub use options::CommandQueryOptions;
pub use pipeline::{
    AsyncMiddleware, AsyncNext, AsyncPipeline, AsyncTerminal, Middleware, MiddlewareCatalog, Next,
    NoopTerminal, PipelineBuilder, PipelineDiagnostics, PipelineOutcome, SyncPipeline,
    SyncPipelineBuilder, Terminal, TracingDiagnostics,
};
pub use publisher::{DomainEventPublisher, ListenerResult, PublishObserver, PublishReport, SentNotice};
pub use registration::{register_scanned, RegistrationInfo, DOMAIN_EVENT_SHAPES, HANDLER_SHAPES};
pub use registry::{HandlerKey, Lifetime, Registration, Registry, RegistryBuilder, Resolver, Shape, TypeKey};
pub use response::CommandResponse;
pub use scan::{Component, ComponentSource, Manifest, ScanOutcome, Scanner, SourceLoadError};
