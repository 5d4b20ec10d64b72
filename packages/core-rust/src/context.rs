//! Per-call execution contexts threaded through middleware pipelines.
//!
//! A context is created fresh for every dispatch or publish, is owned
//! exclusively by that call, and is dropped when the call returns.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::error::Fault;

/// State every pipeline context exposes to the pipeline runner and diagnostics.
pub trait PipelineContext: Send {
    /// `false` once a middleware short-circuited the call.
    fn should_continue(&self) -> bool;
    /// `false` once a failure was recorded.
    fn success(&self) -> bool;
    /// Cooperative cancellation signal for this call.
    fn cancellation(&self) -> &CancellationToken;
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// String-keyed bag for passing data between middleware of the same call.
#[derive(Default)]
pub struct Items {
    entries: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Items {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, returning `true` if a previous value was replaced.
    pub fn insert<V: Any + Send + Sync>(&mut self, key: impl Into<String>, value: V) -> bool {
        self.entries.insert(key.into(), Box::new(value)).is_some()
    }

    /// Returns the value under `key` if present and of type `V`.
    #[must_use]
    pub fn get<V: Any>(&self, key: &str) -> Option<&V> {
        self.entries.get(key).and_then(|v| v.downcast_ref::<V>())
    }

    pub fn get_mut<V: Any>(&mut self, key: &str) -> Option<&mut V> {
        self.entries.get_mut(key).and_then(|v| v.downcast_mut::<V>())
    }

    /// Removes and returns the value under `key`.
    ///
    /// A value of a different type is left in place and `None` is returned.
    pub fn remove<V: Any>(&mut self, key: &str) -> Option<V> {
        if !self.entries.get(key)?.is::<V>() {
            return None;
        }
        self.entries
            .remove(key)
            .and_then(|v| v.downcast::<V>().ok())
            .map(|v| *v)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Items {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

// ---------------------------------------------------------------------------
// HandlerContext
// ---------------------------------------------------------------------------

/// Execution state for one request/response dispatch.
///
/// Middleware may read or replace the request, set a substitute response,
/// stop the pipeline by clearing `should_continue`, or stash data in `items`.
#[derive(Debug)]
pub struct HandlerContext<Req, Resp> {
    pub request: Req,
    /// Empty until the handler (or a short-circuiting middleware) sets it.
    pub response: Option<Resp>,
    pub should_continue: bool,
    pub success: bool,
    pub error_message: Option<String>,
    pub fault: Option<Fault>,
    pub cancellation: CancellationToken,
    pub items: Items,
}

impl<Req, Resp> HandlerContext<Req, Resp> {
    #[must_use]
    pub fn new(request: Req, cancellation: CancellationToken) -> Self {
        Self {
            request,
            response: None,
            should_continue: true,
            success: true,
            error_message: None,
            fault: None,
            cancellation,
            items: Items::new(),
        }
    }

    /// Stops the pipeline; the handler and inner middleware will not run.
    pub fn short_circuit(&mut self) {
        self.should_continue = false;
    }

    /// Stops the pipeline and sets the response returned to the caller.
    pub fn short_circuit_with(&mut self, response: Resp) {
        self.should_continue = false;
        self.response = Some(response);
    }

    /// Marks the call as failed without a fault (e.g. validation).
    pub fn fail(&mut self, message: impl Into<String>) {
        self.success = false;
        self.error_message = Some(message.into());
    }

    /// Records a fault: `success` becomes false and the message is taken from
    /// the fault unless one was already set.
    pub fn record_fault(&mut self, fault: Fault) {
        self.success = false;
        if self.error_message.is_none() {
            self.error_message = Some(fault.to_string());
        }
        self.fault = Some(fault);
    }
}

impl<Req: Send, Resp: Send> PipelineContext for HandlerContext<Req, Resp> {
    fn should_continue(&self) -> bool {
        self.should_continue
    }

    fn success(&self) -> bool {
        self.success
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

// ---------------------------------------------------------------------------
// DomainEventContext
// ---------------------------------------------------------------------------

/// Execution state for one domain-event publish.
#[derive(Debug)]
pub struct DomainEventContext<T> {
    pub message: T,
    pub should_continue: bool,
    pub success: bool,
    pub error_message: Option<String>,
    pub fault: Option<Fault>,
    pub cancellation: CancellationToken,
    pub items: Items,
}

impl<T> DomainEventContext<T> {
    #[must_use]
    pub fn new(message: T, cancellation: CancellationToken) -> Self {
        Self {
            message,
            should_continue: true,
            success: true,
            error_message: None,
            fault: None,
            cancellation,
            items: Items::new(),
        }
    }

    /// Stops the publish; no listener will run.
    pub fn short_circuit(&mut self) {
        self.should_continue = false;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.success = false;
        self.error_message = Some(message.into());
    }

    pub fn record_fault(&mut self, fault: Fault) {
        self.success = false;
        if self.error_message.is_none() {
            self.error_message = Some(fault.to_string());
        }
        self.fault = Some(fault);
    }
}

impl<T: Send> PipelineContext for DomainEventContext<T> {
    fn should_continue(&self) -> bool {
        self.should_continue
    }

    fn success(&self) -> bool {
        self.success
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}
