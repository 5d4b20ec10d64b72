//! Request, response, and event types of the widget domain.

use commandquery_core::Message;
use serde::{Deserialize, Serialize};

/// Command: create a widget with the given name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateWidgetMessage {
    pub name: String,
}

impl Message for CreateWidgetMessage {}

/// Query: fetch a widget by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetWidget {
    pub id: String,
}

impl Message for GetWidget {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Widget {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Query: how many widgets have been indexed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountWidgets;

impl Message for CountWidgets {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetCount {
    pub total: usize,
}

/// Published after a widget has been created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetCreated {
    pub id: String,
    pub name: String,
}

impl Message for WidgetCreated {}
