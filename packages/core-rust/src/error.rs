//! Error taxonomy for registration, dispatch, and publishing.
//!
//! - [`ConfigError`]: build-time configuration problems (registry, pipelines, scans)
//! - [`BrokerError`]: failures surfaced by a single dispatch call
//! - [`PublishError`]: failures surfaced by a single domain-event publish
//! - [`Fault`]: a shareable captured failure, stored on a context and propagated

use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Fault
// ---------------------------------------------------------------------------

/// A captured handler, listener, or middleware failure.
///
/// Wraps the original `anyhow::Error` in an `Arc` so the same fault can be
/// recorded on an execution context and returned to the caller.
#[derive(Clone)]
pub struct Fault(Arc<anyhow::Error>);

impl Fault {
    /// Captures an error. An error that already carries a `Fault` is unwrapped
    /// instead of being nested a second time.
    #[must_use]
    pub fn new(err: anyhow::Error) -> Self {
        match err.downcast::<Fault>() {
            Ok(fault) => fault,
            Err(err) => Self(Arc::new(err)),
        }
    }

    /// The underlying error.
    #[must_use]
    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }

    /// Attempts to view the underlying error as a concrete type.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Whether this fault was caused by cooperative cancellation.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        self.0.chain().any(|cause| cause.is::<Cancelled>())
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for Fault {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err)
    }
}

/// Returned (or wrapped) by handlers and listeners that observe a cancelled token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation was cancelled")]
pub struct Cancelled;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Configuration errors raised while building a registry, pipeline, or broker.
///
/// These are never retried: they indicate the process was wired incorrectly.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate handler registrations: {}", .pairs.join("; "))]
    DuplicateHandler { pairs: Vec<String> },
    #[error("middleware `{id}` could not be resolved: {reason}")]
    UnresolvedMiddleware { id: String, reason: &'static str },
    #[error("pipeline configured for {request} -> {response} but no {capability} is registered")]
    PipelineWithoutHandler {
        capability: &'static str,
        request: &'static str,
        response: &'static str,
    },
    #[error("{flavor} pipeline for {request} -> {response} is configured more than once")]
    DuplicatePipeline {
        flavor: &'static str,
        request: &'static str,
        response: &'static str,
    },
    #[error(
        "validation failed: {} handler(s) were not registered. Types: {}",
        .types.len(),
        .types.join(", ")
    )]
    UnregisteredHandlers { types: Vec<String> },
}

// ---------------------------------------------------------------------------
// BrokerError
// ---------------------------------------------------------------------------

/// Errors returned by `Broker` dispatch calls.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("message of type {type_name} must not be empty")]
    InvalidArgument { type_name: &'static str },
    #[error("no {capability}<{request}, {response}> is registered")]
    HandlerNotFound {
        capability: &'static str,
        request: &'static str,
        response: &'static str,
    },
    #[error("pipeline for {request} -> {response} stopped without producing a response")]
    ShortCircuited {
        request: &'static str,
        response: &'static str,
        reason: Option<String>,
    },
    #[error("{request} -> {response} failed: {message}")]
    Failed {
        request: &'static str,
        response: &'static str,
        message: String,
        #[source]
        fault: Fault,
    },
    #[error("dispatch of {request} was cancelled")]
    Cancelled { request: &'static str },
}

impl BrokerError {
    /// The captured fault, when the dispatch failed inside a handler or middleware.
    #[must_use]
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Self::Failed { fault, .. } => Some(fault),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// PublishError
// ---------------------------------------------------------------------------

/// Errors returned by `DomainEventPublisher::publish`.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("listener #{index} ({listener}) for {message_type} failed: {message}")]
    ListenerFailed {
        message_type: &'static str,
        listener: &'static str,
        index: usize,
        message: String,
        #[source]
        fault: Fault,
    },
    #[error("{stage} pipeline for {message_type} failed: {message}")]
    PipelineFailed {
        message_type: &'static str,
        stage: &'static str,
        message: String,
        #[source]
        fault: Fault,
    },
    #[error("publish of {message_type} was cancelled")]
    Cancelled { message_type: &'static str },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
