use serde::{Deserialize, Serialize};

/// Options for the scan-registration step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommandQueryOptions {
    /// Log a summary of every capability → implementation registration.
    pub log_registrations: bool,
    /// Fail registration if a handler-shaped component in the scanned sources
    /// ended up unregistered.
    pub validate_registrations: bool,
}
