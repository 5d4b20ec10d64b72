//! Mapping from dispatch failures to HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use commandquery_core::BrokerError;
use serde_json::json;
use tracing::error;

use crate::service::DispatchError;

/// Error returned by the widget handlers.
///
/// The body is always `{"message": ...}` so clients see one shape for a
/// rejected command and for a server-side failure.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// A command came back with `success == false`, or validation stopped it.
    #[error("{message}")]
    BadRequest { message: String },
    /// The server is not `Ready` (starting up or draining).
    #[error("server is not accepting requests")]
    Unavailable,
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. }
            | Self::Dispatch(DispatchError::Broker(
                BrokerError::InvalidArgument { .. } | BrokerError::ShortCircuited { .. },
            )) => StatusCode::BAD_REQUEST,
            Self::Unavailable
            | Self::Dispatch(
                DispatchError::Overloaded | DispatchError::Broker(BrokerError::Cancelled { .. }),
            ) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Dispatch(DispatchError::Timeout { .. }) => StatusCode::REQUEST_TIMEOUT,
            Self::Dispatch(DispatchError::Broker(
                BrokerError::HandlerNotFound { .. } | BrokerError::Failed { .. },
            )) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Dispatch(DispatchError::Broker(BrokerError::ShortCircuited {
                reason: Some(reason),
                ..
            })) => reason.clone(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(error = %self, "dispatch failed");
        }
        (status, Json(json!({ "message": self.message() }))).into_response()
    }
}
