//! Logging and validation middleware for handler and domain-event pipelines.
//!
//! Each middleware is generic over the request/response (or message) types,
//! so one instance can be registered in the catalog for every pair it wraps.

use std::any::type_name;

use async_trait::async_trait;
use commandquery_core::{
    AsyncMiddleware, AsyncNext, CommandResponse, DomainEventContext, HandlerContext, Middleware,
    Next,
};
use tracing::{error, info, warn};

use super::messages::{CountWidgets, CreateWidgetMessage, GetWidget, Widget, WidgetCount, WidgetCreated};

/// Longest accepted widget name, in characters.
pub const MAX_NAME_LEN: usize = 100;

// ---------------------------------------------------------------------------
// Validation contracts
// ---------------------------------------------------------------------------

/// Messages that can check themselves before dispatch.
pub trait Validate {
    /// Every problem found; empty when the message is valid.
    fn problems(&self) -> Vec<String>;
}

/// Responses that can stand in for a handler result when validation fails.
pub trait Rejection: Sized {
    /// `None` leaves the response empty; the caller then sees a short-circuit error.
    fn rejection(_problems: &[String]) -> Option<Self> {
        None
    }
}

impl<T> Rejection for CommandResponse<T> {
    fn rejection(problems: &[String]) -> Option<Self> {
        Some(CommandResponse::failed_many(problems))
    }
}

impl Rejection for Widget {}

impl Rejection for WidgetCount {}

impl Validate for CreateWidgetMessage {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("name must not be empty.".to_string());
        }
        if self.name.chars().count() > MAX_NAME_LEN {
            problems.push(format!("name must be at most {MAX_NAME_LEN} characters."));
        }
        problems
    }
}

impl Validate for GetWidget {
    fn problems(&self) -> Vec<String> {
        if self.id.trim().is_empty() {
            vec!["id must not be empty.".to_string()]
        } else {
            Vec::new()
        }
    }
}

impl Validate for CountWidgets {
    fn problems(&self) -> Vec<String> {
        Vec::new()
    }
}

impl Validate for WidgetCreated {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.id.is_empty() {
            problems.push("id must not be empty.".to_string());
        }
        if self.name.trim().is_empty() {
            problems.push("name must not be empty.".to_string());
        }
        problems
    }
}

fn reject<Req, Resp: Rejection>(ctx: &mut HandlerContext<Req, Resp>, problems: &[String]) {
    let message = problems.join(" ");
    warn!(request = type_name::<Req>(), %message, "request rejected");
    ctx.fail(message);
    match Resp::rejection(problems) {
        Some(response) => ctx.short_circuit_with(response),
        None => ctx.short_circuit(),
    }
}

// ---------------------------------------------------------------------------
// Handler logging
// ---------------------------------------------------------------------------

/// Logs before and after a blocking handler runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerLoggingMiddleware;

impl<Req: Send, Resp: Send> Middleware<HandlerContext<Req, Resp>> for HandlerLoggingMiddleware {
    fn invoke(
        &self,
        ctx: &mut HandlerContext<Req, Resp>,
        next: Next<'_, HandlerContext<Req, Resp>>,
    ) -> anyhow::Result<()> {
        let request = type_name::<Req>();
        let response = type_name::<Resp>();
        info!(request, response, "before sync handler execution");

        match next.run(ctx) {
            Ok(()) => {
                info!(request, response, success = ctx.success, "after sync handler execution");
                Ok(())
            }
            Err(err) => {
                error!(request, response, error = %err, "error in sync handler");
                Err(err)
            }
        }
    }
}

/// Logs before and after a suspending handler runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncHandlerLoggingMiddleware;

#[async_trait]
impl<Req, Resp> AsyncMiddleware<HandlerContext<Req, Resp>> for AsyncHandlerLoggingMiddleware
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
{
    async fn invoke(
        &self,
        ctx: &mut HandlerContext<Req, Resp>,
        next: AsyncNext<'_, HandlerContext<Req, Resp>>,
    ) -> anyhow::Result<()> {
        let request = type_name::<Req>();
        let response = type_name::<Resp>();
        info!(request, response, "before async handler execution");

        match next.run(ctx).await {
            Ok(()) => {
                info!(request, response, success = ctx.success, "after async handler execution");
                Ok(())
            }
            Err(err) => {
                error!(request, response, error = %err, "error in async handler");
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handler validation
// ---------------------------------------------------------------------------

/// Short-circuits a blocking dispatch whose request fails [`Validate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerValidationMiddleware;

impl<Req, Resp> Middleware<HandlerContext<Req, Resp>> for HandlerValidationMiddleware
where
    Req: Validate + Send,
    Resp: Rejection + Send,
{
    fn invoke(
        &self,
        ctx: &mut HandlerContext<Req, Resp>,
        next: Next<'_, HandlerContext<Req, Resp>>,
    ) -> anyhow::Result<()> {
        let problems = ctx.request.problems();
        if !problems.is_empty() {
            reject(ctx, &problems);
            return Ok(());
        }
        next.run(ctx)
    }
}

/// Short-circuits a suspending dispatch whose request fails [`Validate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncHandlerValidationMiddleware;

#[async_trait]
impl<Req, Resp> AsyncMiddleware<HandlerContext<Req, Resp>> for AsyncHandlerValidationMiddleware
where
    Req: Validate + Send + Sync + 'static,
    Resp: Rejection + Send + 'static,
{
    async fn invoke(
        &self,
        ctx: &mut HandlerContext<Req, Resp>,
        next: AsyncNext<'_, HandlerContext<Req, Resp>>,
    ) -> anyhow::Result<()> {
        let problems = ctx.request.problems();
        if !problems.is_empty() {
            reject(ctx, &problems);
            return Ok(());
        }
        next.run(ctx).await
    }
}

// ---------------------------------------------------------------------------
// Domain events
// ---------------------------------------------------------------------------

/// Logs around the listener fan-out of a publish.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainEventLoggingMiddleware;

#[async_trait]
impl<T: Send + Sync + 'static> AsyncMiddleware<DomainEventContext<T>> for DomainEventLoggingMiddleware {
    async fn invoke(
        &self,
        ctx: &mut DomainEventContext<T>,
        next: AsyncNext<'_, DomainEventContext<T>>,
    ) -> anyhow::Result<()> {
        let message_type = type_name::<T>();
        info!(message_type, "before processing domain event");

        match next.run(ctx).await {
            Ok(()) => {
                info!(message_type, success = ctx.success, "after processing domain event");
                Ok(())
            }
            Err(err) => {
                error!(message_type, error = %err, "error processing domain event");
                Err(err)
            }
        }
    }
}

/// Stops a publish whose message fails [`Validate`]; no listener runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainEventValidationMiddleware;

#[async_trait]
impl<T> AsyncMiddleware<DomainEventContext<T>> for DomainEventValidationMiddleware
where
    T: Validate + Send + Sync + 'static,
{
    async fn invoke(
        &self,
        ctx: &mut DomainEventContext<T>,
        next: AsyncNext<'_, DomainEventContext<T>>,
    ) -> anyhow::Result<()> {
        let problems = ctx.message.problems();
        if !problems.is_empty() {
            let message = problems.join(" ");
            warn!(message_type = type_name::<T>(), %message, "domain event rejected");
            ctx.fail(message);
            ctx.short_circuit();
            return Ok(());
        }
        next.run(ctx).await
    }
}
