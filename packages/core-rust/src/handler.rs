//! Handler and listener capabilities.
//!
//! A handler consumes one request type and produces one response type. Exactly
//! one handler (sync or async) may be registered per request/response pair.
//! Domain-event listeners are the one-to-many counterpart: every listener
//! registered for a message type is invoked on publish.

use std::marker::PhantomData;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Synchronous request handler. Runs on the caller's thread.
pub trait Handler<Req, Resp>: Send + Sync {
    /// Produce a response for `request`.
    fn execute(&self, request: &Req) -> anyhow::Result<Resp>;
}

/// Asynchronous request handler.
///
/// Implementations should observe `cancellation` at their own suspension
/// points; the broker never interrupts a running handler.
#[async_trait]
pub trait AsyncHandler<Req, Resp>: Send + Sync {
    /// Produce a response for `request`.
    async fn execute(&self, request: &Req, cancellation: &CancellationToken)
        -> anyhow::Result<Resp>;
}

// ---------------------------------------------------------------------------
// Domain events
// ---------------------------------------------------------------------------

/// Completion signal returned by a listener for one published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerOutcome {
    pub success: bool,
    pub message: String,
}

impl ListenerOutcome {
    #[must_use]
    pub fn completed(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn unsuccessful(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Listener invoked for every published message of type `T`.
///
/// Returning `Err` is a fault: the publisher stops the fan-out and propagates
/// it. Returning `Ok` with an unsuccessful outcome is reported but does not
/// stop the remaining listeners.
#[async_trait]
pub trait DomainEvent<T>: Send + Sync {
    async fn execute(
        &self,
        message: &T,
        cancellation: &CancellationToken,
    ) -> anyhow::Result<ListenerOutcome>;
}

/// Adapts a synchronous closure into a [`DomainEvent`] listener.
pub struct FnListener<T, F> {
    f: F,
    _message: PhantomData<fn(&T)>,
}

/// Builds a listener from a synchronous closure.
pub fn listener_fn<T, F>(f: F) -> FnListener<T, F>
where
    F: Fn(&T) -> anyhow::Result<ListenerOutcome> + Send + Sync,
{
    FnListener {
        f,
        _message: PhantomData,
    }
}

#[async_trait]
impl<T, F> DomainEvent<T> for FnListener<T, F>
where
    T: Sync,
    F: Fn(&T) -> anyhow::Result<ListenerOutcome> + Send + Sync,
{
    async fn execute(
        &self,
        message: &T,
        _cancellation: &CancellationToken,
    ) -> anyhow::Result<ListenerOutcome> {
        (self.f)(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Double;

    impl Handler<u32, u64> for Double {
        fn execute(&self, request: &u32) -> anyhow::Result<u64> {
            Ok(u64::from(*request) * 2)
        }
    }

    #[test]
    fn sync_handler_is_object_safe() {
        let handler: Box<dyn Handler<u32, u64>> = Box::new(Double);
        assert_eq!(handler.execute(&21).unwrap(), 42);
    }

    #[tokio::test]
    async fn listener_fn_reports_outcome() {
        let listener = listener_fn(|name: &String| {
            Ok(ListenerOutcome::completed(format!("saw {name}")))
        });
        let outcome = listener
            .execute(&"widget".to_string(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.message, "saw widget");
    }

    #[tokio::test]
    async fn listener_fn_propagates_errors() {
        let listener = listener_fn(|_: &u8| anyhow::bail!("listener exploded"));
        let err = listener
            .execute(&1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "listener exploded");
    }
}
