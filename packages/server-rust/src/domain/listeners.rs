//! Domain-event listeners for `WidgetCreated`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use commandquery_core::{DomainEvent, ListenerOutcome};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::messages::WidgetCreated;

// ---------------------------------------------------------------------------
// WidgetIndex
// ---------------------------------------------------------------------------

/// In-memory index of created widgets, id to name.
#[derive(Debug, Default)]
pub struct WidgetIndex {
    names: RwLock<HashMap<String, String>>,
}

impl WidgetIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, name: impl Into<String>) {
        self.names.write().insert(id.into(), name.into());
    }

    #[must_use]
    pub fn name_of(&self, id: &str) -> Option<String> {
        self.names.read().get(id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Adds every created widget to the shared [`WidgetIndex`].
#[derive(Debug, Clone)]
pub struct WidgetCreatedHandler {
    index: Arc<WidgetIndex>,
}

impl WidgetCreatedHandler {
    #[must_use]
    pub fn new(index: Arc<WidgetIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl DomainEvent<WidgetCreated> for WidgetCreatedHandler {
    async fn execute(
        &self,
        message: &WidgetCreated,
        _cancellation: &CancellationToken,
    ) -> anyhow::Result<ListenerOutcome> {
        self.index.insert(message.id.clone(), message.name.clone());
        debug!(id = %message.id, "widget indexed");
        Ok(ListenerOutcome::completed(format!("indexed {}", message.id)))
    }
}

/// Writes an audit line per created widget and counts them.
#[derive(Debug, Clone, Default)]
pub struct WidgetAuditListener {
    audited: Arc<AtomicU64>,
}

impl WidgetAuditListener {
    #[must_use]
    pub fn new(audited: Arc<AtomicU64>) -> Self {
        Self { audited }
    }

    #[must_use]
    pub fn audited(&self) -> u64 {
        self.audited.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DomainEvent<WidgetCreated> for WidgetAuditListener {
    async fn execute(
        &self,
        message: &WidgetCreated,
        _cancellation: &CancellationToken,
    ) -> anyhow::Result<ListenerOutcome> {
        let seq = self.audited.fetch_add(1, Ordering::Relaxed) + 1;
        info!(target: "audit", seq, id = %message.id, name = %message.name, "widget created");
        Ok(ListenerOutcome::completed(format!("audit entry {seq}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(id: &str, name: &str) -> WidgetCreated {
        WidgetCreated {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn created_handler_indexes_the_widget() {
        let index = Arc::new(WidgetIndex::new());
        let listener = WidgetCreatedHandler::new(Arc::clone(&index));

        let outcome = listener
            .execute(&created("w-1", "sprocket"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(index.name_of("w-1").as_deref(), Some("sprocket"));
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn audit_listener_counts_every_event() {
        let listener = WidgetAuditListener::default();
        let token = CancellationToken::new();

        listener.execute(&created("a", "one"), &token).await.unwrap();
        let outcome = listener.execute(&created("b", "two"), &token).await.unwrap();

        assert_eq!(listener.audited(), 2);
        assert_eq!(outcome.message, "audit entry 2");
    }

    #[test]
    fn index_starts_empty() {
        let index = WidgetIndex::new();
        assert!(index.is_empty());
        assert!(index.name_of("missing").is_none());
    }
}
