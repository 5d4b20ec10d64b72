/// Dispatch-level configuration for the tower layers around the broker.
///
/// Controls per-dispatch timeouts and the concurrency limit.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Timeout applied to every dispatch, in milliseconds.
    pub default_timeout_ms: u64,
    /// Maximum number of concurrent dispatches before load shedding.
    pub max_concurrent_dispatches: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_concurrent_dispatches: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_config_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.default_timeout_ms, 30_000);
        assert_eq!(config.max_concurrent_dispatches, 1000);
    }
}
