//! Widget endpoints: thin translation between HTTP and broker dispatches.

use axum::extract::{Path, State};
use axum::Json;
use commandquery_core::CommandResponse;
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState};
use crate::domain::{CountWidgets, CreateWidgetMessage, GetWidget, Widget, WidgetCount};

/// Body of a successful `POST /widget`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedWidget {
    pub id: String,
}

/// `POST /widget {name}`: 200 `{id}` on success, 400 `{message}` when the
/// command reports failure.
///
/// # Errors
///
/// [`ApiError`] when the server is not ready, the command is rejected, or
/// the dispatch fails.
pub async fn create_widget_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateWidgetMessage>,
) -> Result<Json<CreatedWidget>, ApiError> {
    let _guard = state.shutdown.admit().ok_or(ApiError::Unavailable)?;

    let response: CommandResponse<String> = state.dispatcher.send(body).await?;
    if response.success {
        Ok(Json(CreatedWidget {
            id: response.data.unwrap_or_default(),
        }))
    } else {
        Err(ApiError::BadRequest {
            message: response.message.unwrap_or_default(),
        })
    }
}

/// `GET /widget/{id}`.
///
/// # Errors
///
/// [`ApiError`] when the server is not ready or the dispatch fails.
pub async fn get_widget_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Widget>, ApiError> {
    let _guard = state.shutdown.admit().ok_or(ApiError::Unavailable)?;
    let widget: Widget = state.dispatcher.send(GetWidget { id }).await?;
    Ok(Json(widget))
}

/// `GET /widgets/count`.
///
/// # Errors
///
/// [`ApiError`] when the server is not ready or the dispatch fails.
pub async fn count_widgets_handler(
    State(state): State<AppState>,
) -> Result<Json<WidgetCount>, ApiError> {
    let _guard = state.shutdown.admit().ok_or(ApiError::Unavailable)?;
    let count: WidgetCount = state.dispatcher.send(CountWidgets).await?;
    Ok(Json(count))
}
