//! Command and query handlers of the widget domain.

use std::sync::Arc;

use async_trait::async_trait;
use commandquery_core::{AsyncHandler, Cancelled, CommandResponse, DomainEventPublisher, Handler, PublishError};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::listeners::WidgetIndex;
use super::messages::{CountWidgets, CreateWidgetMessage, GetWidget, Widget, WidgetCount, WidgetCreated};

// ---------------------------------------------------------------------------
// CreateWidget
// ---------------------------------------------------------------------------

/// Creates a widget: assigns a fresh id and publishes [`WidgetCreated`].
///
/// The response data is the new id; the message summarizes the fan-out.
#[derive(Debug, Clone)]
pub struct CreateWidget {
    publisher: Arc<DomainEventPublisher>,
}

impl CreateWidget {
    #[must_use]
    pub fn new(publisher: Arc<DomainEventPublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl AsyncHandler<CreateWidgetMessage, CommandResponse<String>> for CreateWidget {
    async fn execute(
        &self,
        request: &CreateWidgetMessage,
        cancellation: &CancellationToken,
    ) -> anyhow::Result<CommandResponse<String>> {
        let id = Uuid::new_v4().to_string();
        let event = WidgetCreated {
            id: id.clone(),
            name: request.name.clone(),
        };

        let report = self
            .publisher
            .publish_with_cancellation(event, cancellation.clone())
            .await
            .map_err(|err| match err {
                PublishError::Cancelled { .. } => anyhow::Error::from(Cancelled),
                other => other.into(),
            })?;

        if report.short_circuited {
            return Ok(CommandResponse::failed(format!(
                "widget {} was rejected by the event pipeline",
                request.name
            )));
        }

        debug!(%id, sent = report.sent, "widget created");
        let mut response = CommandResponse::ok(id);
        response.message = Some(format!(
            "{} was sent to {} listeners, success={}",
            request.name,
            report.sent,
            report.all_succeeded()
        ));
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// GetWidgetQuery
// ---------------------------------------------------------------------------

/// Looks a widget up by id. Unknown ids still yield a widget, without a name.
#[derive(Debug, Clone)]
pub struct GetWidgetQuery {
    index: Arc<WidgetIndex>,
}

impl GetWidgetQuery {
    #[must_use]
    pub fn new(index: Arc<WidgetIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl AsyncHandler<GetWidget, Widget> for GetWidgetQuery {
    async fn execute(
        &self,
        request: &GetWidget,
        _cancellation: &CancellationToken,
    ) -> anyhow::Result<Widget> {
        Ok(Widget {
            id: request.id.clone(),
            name: self.index.name_of(&request.id),
        })
    }
}

// ---------------------------------------------------------------------------
// CountWidgetsQuery
// ---------------------------------------------------------------------------

/// Blocking query over the widget index.
#[derive(Debug, Clone)]
pub struct CountWidgetsQuery {
    index: Arc<WidgetIndex>,
}

impl CountWidgetsQuery {
    #[must_use]
    pub fn new(index: Arc<WidgetIndex>) -> Self {
        Self { index }
    }
}

impl Handler<CountWidgets, WidgetCount> for CountWidgetsQuery {
    fn execute(&self, _request: &CountWidgets) -> anyhow::Result<WidgetCount> {
        Ok(WidgetCount {
            total: self.index.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use commandquery_core::RegistryBuilder;

    use super::*;
    use crate::domain::listeners::WidgetCreatedHandler;

    fn publisher(index: &Arc<WidgetIndex>) -> Arc<DomainEventPublisher> {
        let mut builder = RegistryBuilder::new();
        builder.register_listener::<WidgetCreated, _>(WidgetCreatedHandler::new(Arc::clone(index)));
        Arc::new(DomainEventPublisher::new(Arc::new(builder.build().unwrap())))
    }

    #[tokio::test]
    async fn create_widget_returns_a_fresh_id() {
        let index = Arc::new(WidgetIndex::new());
        let handler = CreateWidget::new(publisher(&index));

        let response = handler
            .execute(
                &CreateWidgetMessage {
                    name: "foo".to_string(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(response.success);
        let id = response.data.unwrap();
        assert!(!id.is_empty());
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(index.name_of(&id).as_deref(), Some("foo"));
        assert_eq!(
            response.message.as_deref(),
            Some("foo was sent to 1 listeners, success=true")
        );
    }

    #[tokio::test]
    async fn create_widget_surfaces_cancellation() {
        let index = Arc::new(WidgetIndex::new());
        let handler = CreateWidget::new(publisher(&index));
        let token = CancellationToken::new();
        token.cancel();

        let err = handler
            .execute(
                &CreateWidgetMessage {
                    name: "foo".to_string(),
                },
                &token,
            )
            .await
            .unwrap_err();

        assert!(err.is::<Cancelled>());
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn get_widget_echoes_the_id() {
        let index = Arc::new(WidgetIndex::new());
        let query = GetWidgetQuery::new(Arc::clone(&index));

        let widget = query
            .execute(
                &GetWidget {
                    id: "abc".to_string(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(widget.id, "abc");
        assert!(widget.name.is_none());
    }

    #[test]
    fn count_reflects_the_index() {
        let index = Arc::new(WidgetIndex::new());
        index.insert("a", "one");
        index.insert("b", "two");

        let count = CountWidgetsQuery::new(index).execute(&CountWidgets).unwrap();
        assert_eq!(count, WidgetCount { total: 2 });
    }
}
