//! Scan-driven registration: apply every matching component to a
//! [`RegistryBuilder`], log the result, and optionally verify that nothing
//! handler-shaped was left out.

use std::collections::{BTreeMap, HashSet};

use tracing::{error, info};

use crate::error::ConfigError;
use crate::options::CommandQueryOptions;
use crate::registry::{RegistryBuilder, Shape};
use crate::scan::{Component, ComponentSource, Scanner};

/// Shapes a handler scan targets.
pub const HANDLER_SHAPES: [Shape; 2] = [Shape::Handler, Shape::AsyncHandler];

/// Shapes a domain-event scan targets.
pub const DOMAIN_EVENT_SHAPES: [Shape; 1] = [Shape::DomainEvent];

/// What one scan-registration call added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationInfo {
    /// Concrete types registered, in scan order.
    pub implementation_types: Vec<&'static str>,
    /// `(capability, implementation)` pairs, in scan order.
    pub registrations: Vec<(String, &'static str)>,
}

impl RegistrationInfo {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.implementation_types.is_empty()
    }
}

/// Registers every component in `sources` that `scanner` matches for `shapes`.
///
/// # Errors
///
/// With `validate_registrations` on, returns
/// [`ConfigError::UnregisteredHandlers`] naming every handler-shaped concrete
/// type in `sources` that the builder does not hold after this call.
pub fn register_scanned(
    builder: &mut RegistryBuilder,
    scanner: &Scanner,
    sources: &[&dyn ComponentSource],
    shapes: &[Shape],
    options: &CommandQueryOptions,
) -> Result<RegistrationInfo, ConfigError> {
    let outcome = scanner.find_matching(sources, shapes);

    let mut info = RegistrationInfo::default();
    for component in &outcome.matches {
        component.register(builder);
        info.implementation_types.push(component.type_name());
        for capability in component.capabilities() {
            info.registrations
                .push((capability.service.clone(), component.type_name()));
        }
    }

    if options.log_registrations {
        log_summary(sources, &outcome.matches);
    }

    if options.validate_registrations {
        validate(builder, sources)?;
    }

    Ok(info)
}

fn log_summary(sources: &[&dyn ComponentSource], matches: &[Component]) {
    let mut by_shape: BTreeMap<Shape, Vec<(&str, &str)>> = BTreeMap::new();
    for component in matches {
        for capability in component.capabilities() {
            by_shape
                .entry(capability.shape)
                .or_default()
                .push((component.type_name(), capability.service.as_str()));
        }
    }

    let source_names: Vec<&str> = sources.iter().map(|s| s.name()).collect();
    info!(
        sources = ?source_names,
        components = matches.len(),
        "registered scanned components"
    );
    for (shape, entries) in by_shape {
        info!(shape = shape.as_str(), count = entries.len(), "capability group");
        for (implementation, service) in entries {
            info!(shape = shape.as_str(), implementation, service, "registration");
        }
    }
}

fn validate(builder: &RegistryBuilder, sources: &[&dyn ComponentSource]) -> Result<(), ConfigError> {
    let registered: HashSet<&str> = builder
        .registrations()
        .iter()
        .map(|r| r.implementation)
        .collect();

    // A fresh scanner: excluded handlers count as unregistered.
    let discovered = Scanner::default().find_matching(sources, &HANDLER_SHAPES);
    let missing: Vec<String> = discovered
        .matches
        .iter()
        .map(Component::type_name)
        .filter(|name| !registered.contains(name))
        .map(ToString::to_string)
        .collect();

    if missing.is_empty() {
        return Ok(());
    }
    for name in &missing {
        error!(implementation = %name, "handler was not registered");
    }
    Err(ConfigError::UnregisteredHandlers { types: missing })
}

#[cfg(test)]
mod tests {
    use std::any::type_name;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::handler::{AsyncHandler, DomainEvent, Handler, ListenerOutcome};
    use crate::scan::Manifest;

    struct Ping;
    struct Pong;
    struct Pinged;

    struct PingHandler;

    impl Handler<Ping, Pong> for PingHandler {
        fn execute(&self, _request: &Ping) -> anyhow::Result<Pong> {
            Ok(Pong)
        }
    }

    struct SlowPingHandler;

    #[async_trait]
    impl AsyncHandler<Pinged, Pong> for SlowPingHandler {
        async fn execute(
            &self,
            _request: &Pinged,
            _cancellation: &CancellationToken,
        ) -> anyhow::Result<Pong> {
            Ok(Pong)
        }
    }

    struct PingedListener;

    #[async_trait]
    impl DomainEvent<Pinged> for PingedListener {
        async fn execute(
            &self,
            _message: &Pinged,
            _cancellation: &CancellationToken,
        ) -> anyhow::Result<ListenerOutcome> {
            Ok(ListenerOutcome::completed("ok"))
        }
    }

    fn manifest() -> Manifest {
        Manifest::new("app")
            .with(Component::singleton(PingHandler).handles::<Ping, Pong>().build())
            .with(
                Component::transient(|| SlowPingHandler)
                    .handles_async::<Pinged, Pong>()
                    .build(),
            )
            .with(Component::singleton(PingedListener).listens::<Pinged>().build())
    }

    #[test]
    fn handler_scan_registers_handlers_only() {
        let manifest = manifest();
        let mut builder = RegistryBuilder::new();
        let info = register_scanned(
            &mut builder,
            &Scanner::new(),
            &[&manifest],
            &HANDLER_SHAPES,
            &CommandQueryOptions {
                log_registrations: true,
                validate_registrations: true,
            },
        )
        .unwrap();

        assert_eq!(
            info.implementation_types,
            vec![type_name::<PingHandler>(), type_name::<SlowPingHandler>()]
        );
        assert_eq!(info.registrations.len(), 2);
        assert!(info.registrations[0].0.starts_with("Handler<"));

        let registry = builder.build().unwrap();
        assert!(registry.handler::<Ping, Pong>().is_some());
        assert!(registry.async_handler::<Pinged, Pong>().is_some());
        assert!(registry.listeners::<Pinged>().is_empty());
        assert!(registry.resolve::<SlowPingHandler>().is_some());
    }

    #[test]
    fn domain_event_scan_registers_listeners() {
        let manifest = manifest();
        let mut builder = RegistryBuilder::new();
        let info = register_scanned(
            &mut builder,
            &Scanner::new(),
            &[&manifest],
            &DOMAIN_EVENT_SHAPES,
            &CommandQueryOptions::default(),
        )
        .unwrap();

        assert_eq!(info.implementation_types, vec![type_name::<PingedListener>()]);
        let registry = builder.build().unwrap();
        assert_eq!(registry.listeners::<Pinged>().len(), 1);
    }

    #[test]
    fn validation_reports_every_unregistered_handler() {
        let manifest = manifest();
        let mut builder = RegistryBuilder::new();
        let err = register_scanned(
            &mut builder,
            &Scanner::new().exclude::<PingHandler>(),
            &[&manifest],
            &HANDLER_SHAPES,
            &CommandQueryOptions {
                log_registrations: false,
                validate_registrations: true,
            },
        )
        .unwrap_err();

        let ConfigError::UnregisteredHandlers { types } = err else {
            panic!("expected UnregisteredHandlers");
        };
        assert_eq!(types, vec![type_name::<PingHandler>().to_string()]);
    }

    #[test]
    fn validation_accepts_handlers_registered_by_hand() {
        let manifest = manifest();
        let mut builder = RegistryBuilder::new();
        builder.register_singleton::<Ping, Pong, _>(PingHandler);

        let result = register_scanned(
            &mut builder,
            &Scanner::new().exclude::<PingHandler>(),
            &[&manifest],
            &HANDLER_SHAPES,
            &CommandQueryOptions {
                log_registrations: false,
                validate_registrations: true,
            },
        );
        assert!(result.is_ok());
    }
}
