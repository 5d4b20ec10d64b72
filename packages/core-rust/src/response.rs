//! Success/failure envelope returned by command handlers.

use serde::{Deserialize, Serialize};

use crate::error::Fault;

/// Result envelope for commands: a success flag, optional data, and an
/// optional human-readable message.
///
/// Validation middleware uses the `failed*` constructors to populate a
/// substitute response when it short-circuits a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Never serialized; kept for in-process observers.
    #[serde(skip)]
    pub fault: Option<Fault>,
}

impl<T> CommandResponse<T> {
    /// A successful response carrying `data`.
    #[must_use]
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            fault: None,
        }
    }

    /// A successful response without data.
    #[must_use]
    pub fn ok_empty() -> Self {
        Self {
            success: true,
            data: None,
            message: None,
            fault: None,
        }
    }

    /// A failed response with a single message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
            fault: None,
        }
    }

    /// A failed response whose message joins all `messages` with a space.
    #[must_use]
    pub fn failed_many<I, S>(messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = messages
            .into_iter()
            .map(|m| m.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        Self::failed(joined)
    }

    /// A failed response built from a captured fault.
    #[must_use]
    pub fn from_fault(fault: Fault) -> Self {
        let message = fault.to_string();
        Self {
            success: false,
            data: None,
            message: Some(if message.is_empty() {
                "An error occurred".to_string()
            } else {
                message
            }),
            fault: Some(fault),
        }
    }

    /// Attaches a fault to an existing response.
    #[must_use]
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }
}

impl<T> Default for CommandResponse<T> {
    fn default() -> Self {
        Self {
            success: false,
            data: None,
            message: None,
            fault: None,
        }
    }
}
