//! Component discovery.
//!
//! Rust has no runtime type scanning, so candidates are declared up front as
//! [`Component`] values (a concrete type, the capabilities it implements, and
//! the thunks that register it) and grouped into [`ComponentSource`]s such as
//! a [`Manifest`]. [`Scanner::find_matching`] is the reusable primitive that
//! filters those candidates by capability shape; the handler scan and the
//! domain-event scan call it with different shape sets and exclusions.

use std::any::{type_name, TypeId};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::handler::{AsyncHandler, DomainEvent, Handler};
use crate::registry::{RegistryBuilder, Resolver, Shape};

type Registrar = Arc<dyn Fn(&mut RegistryBuilder) + Send + Sync>;

/// Infrastructure namespaces skipped by blind scans.
pub const INFRASTRUCTURE_PREFIXES: [&str; 4] = ["std::", "core::", "alloc::", "commandquery_core::"];

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// One capability instantiation a component implements.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Capability {
    pub shape: Shape,
    /// e.g. `Handler<app::GetWidget, app::Widget>`.
    pub service: String,
}

/// A candidate implementation type together with its capabilities.
#[derive(Clone)]
pub struct Component {
    type_name: &'static str,
    type_id: TypeId,
    is_abstract: bool,
    capabilities: Vec<Capability>,
    registrations: Vec<Registrar>,
}

impl Component {
    /// A component backed by one shared instance.
    pub fn singleton<H: Send + Sync + 'static>(instance: H) -> ComponentBuilder<H> {
        ComponentBuilder::new(Some(Resolver::singleton(Arc::new(instance))))
    }

    /// A component constructed on every resolution.
    pub fn transient<H, F>(factory: F) -> ComponentBuilder<H>
    where
        H: Send + Sync + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        ComponentBuilder::new(Some(Resolver::transient(move || Arc::new(factory()))))
    }

    /// A type that declares capabilities but is never instantiated. Scans skip it.
    #[must_use]
    pub fn abstract_type<H: Send + Sync + 'static>() -> ComponentBuilder<H> {
        ComponentBuilder::new(None)
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    #[must_use]
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Whether the component implements at least one instantiation of `shape`.
    #[must_use]
    pub fn exposes(&self, shape: Shape) -> bool {
        self.capabilities.iter().any(|c| c.shape == shape)
    }

    /// Registers every capability plus the self-registration into `builder`.
    pub fn register(&self, builder: &mut RegistryBuilder) {
        for registrar in &self.registrations {
            registrar(builder);
        }
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("type_name", &self.type_name)
            .field("is_abstract", &self.is_abstract)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Declares the capabilities of a [`Component`].
pub struct ComponentBuilder<H> {
    resolver: Option<Resolver<H>>,
    capabilities: Vec<Capability>,
    registrations: Vec<Registrar>,
}

impl<H: Send + Sync + 'static> ComponentBuilder<H> {
    fn new(resolver: Option<Resolver<H>>) -> Self {
        let mut registrations: Vec<Registrar> = Vec::new();
        if let Some(resolver) = &resolver {
            let resolver = resolver.clone();
            registrations.push(Arc::new(move |builder: &mut RegistryBuilder| {
                builder.register_self(resolver.clone());
            }));
        }
        Self {
            resolver,
            capabilities: Vec::new(),
            registrations,
        }
    }

    /// Declares `H: Handler<Req, Resp>`.
    #[must_use]
    pub fn handles<Req: 'static, Resp: 'static>(mut self) -> Self
    where
        H: Handler<Req, Resp>,
    {
        self.capabilities.push(Capability {
            shape: Shape::Handler,
            service: format!("Handler<{}, {}>", type_name::<Req>(), type_name::<Resp>()),
        });
        if let Some(resolver) = &self.resolver {
            let resolver = resolver.map(|h| h as Arc<dyn Handler<Req, Resp>>);
            self.registrations.push(Arc::new(move |builder: &mut RegistryBuilder| {
                builder.register_handler(type_name::<H>(), resolver.clone());
            }));
        }
        self
    }

    /// Declares `H: AsyncHandler<Req, Resp>`.
    #[must_use]
    pub fn handles_async<Req: 'static, Resp: 'static>(mut self) -> Self
    where
        H: AsyncHandler<Req, Resp>,
    {
        self.capabilities.push(Capability {
            shape: Shape::AsyncHandler,
            service: format!(
                "AsyncHandler<{}, {}>",
                type_name::<Req>(),
                type_name::<Resp>()
            ),
        });
        if let Some(resolver) = &self.resolver {
            let resolver = resolver.map(|h| h as Arc<dyn AsyncHandler<Req, Resp>>);
            self.registrations.push(Arc::new(move |builder: &mut RegistryBuilder| {
                builder.register_async_handler(type_name::<H>(), resolver.clone());
            }));
        }
        self
    }

    /// Declares `H: DomainEvent<T>`.
    #[must_use]
    pub fn listens<T: 'static>(mut self) -> Self
    where
        H: DomainEvent<T>,
    {
        self.capabilities.push(Capability {
            shape: Shape::DomainEvent,
            service: format!("DomainEvent<{}>", type_name::<T>()),
        });
        if let Some(resolver) = &self.resolver {
            let resolver = resolver.map(|h| h as Arc<dyn DomainEvent<T>>);
            self.registrations.push(Arc::new(move |builder: &mut RegistryBuilder| {
                builder.register_event_listener(type_name::<H>(), resolver.clone());
            }));
        }
        self
    }

    #[must_use]
    pub fn build(self) -> Component {
        Component {
            type_name: type_name::<H>(),
            type_id: TypeId::of::<H>(),
            is_abstract: self.resolver.is_none(),
            capabilities: self.capabilities,
            registrations: self.registrations,
        }
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// A source that failed to load completely.
///
/// `partial` carries whatever was loaded before the failure; scans use it.
#[derive(Debug, thiserror::Error)]
#[error("failed to load components from {source_name}: {reason}")]
pub struct SourceLoadError {
    pub source_name: String,
    pub reason: String,
    pub partial: Vec<Component>,
}

/// A named group of candidate components (the unit a scan iterates over).
pub trait ComponentSource: Send + Sync {
    fn name(&self) -> &str;

    /// Loads the candidates.
    ///
    /// # Errors
    ///
    /// Returns [`SourceLoadError`] carrying any partially loaded components.
    fn load(&self) -> Result<Vec<Component>, SourceLoadError>;
}

/// In-memory component source.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    name: String,
    components: Vec<Component>,
}

impl Manifest {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: Vec::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, component: Component) -> Self {
        self.components.push(component);
        self
    }

    pub fn push(&mut self, component: Component) {
        self.components.push(component);
    }

    #[must_use]
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl ComponentSource for Manifest {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<Vec<Component>, SourceLoadError> {
        Ok(self.components.clone())
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// A source whose load failed; its partial list was used instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSource {
    pub source_name: String,
    pub reason: String,
    /// Components recovered from the partial load.
    pub recovered: usize,
}

/// Result of [`Scanner::find_matching`].
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub matches: Vec<Component>,
    pub skipped: Vec<SkippedSource>,
}

/// Finds concrete components matching a set of capability shapes.
#[derive(Debug, Clone)]
pub struct Scanner {
    infrastructure_prefixes: Vec<String>,
    excluded: HashSet<TypeId>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self {
            infrastructure_prefixes: INFRASTRUCTURE_PREFIXES
                .iter()
                .map(ToString::to_string)
                .collect(),
            excluded: HashSet::new(),
        }
    }
}

impl Scanner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A scanner whose blind scans skip exactly `prefixes`, replacing the
    /// default infrastructure list.
    #[must_use]
    pub fn with_prefixes<I, P>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            infrastructure_prefixes: prefixes.into_iter().map(Into::into).collect(),
            excluded: HashSet::new(),
        }
    }

    /// Never match `T`, in targeted and blind scans alike.
    #[must_use]
    pub fn exclude<T: 'static>(mut self) -> Self {
        self.excluded.insert(TypeId::of::<T>());
        self
    }

    /// Adds a namespace prefix skipped by blind scans.
    #[must_use]
    pub fn exclude_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.infrastructure_prefixes.push(prefix.into());
        self
    }

    /// Collects every non-abstract component from `sources` that exposes one
    /// of `shapes`. With no shapes (a blind scan) every concrete component
    /// outside the infrastructure prefixes matches.
    ///
    /// A source that fails to load does not abort the scan: the failure is
    /// logged and the components it did load are used.
    #[must_use]
    pub fn find_matching(&self, sources: &[&dyn ComponentSource], shapes: &[Shape]) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        let mut seen = HashSet::new();

        for source in sources {
            let components = match source.load() {
                Ok(components) => components,
                Err(err) => {
                    warn!(
                        source = %err.source_name,
                        reason = %err.reason,
                        recovered = err.partial.len(),
                        "component source failed to load; using partial results"
                    );
                    outcome.skipped.push(SkippedSource {
                        source_name: err.source_name,
                        reason: err.reason,
                        recovered: err.partial.len(),
                    });
                    err.partial
                }
            };

            for component in components {
                if !self.accepts(&component, shapes) {
                    continue;
                }
                if !seen.insert(component.type_id) {
                    debug!(
                        component = component.type_name,
                        source = source.name(),
                        "component already matched by an earlier source"
                    );
                    continue;
                }
                outcome.matches.push(component);
            }
        }

        outcome
    }

    fn accepts(&self, component: &Component, shapes: &[Shape]) -> bool {
        if component.is_abstract || self.excluded.contains(&component.type_id) {
            return false;
        }
        if shapes.is_empty() {
            return !self
                .infrastructure_prefixes
                .iter()
                .any(|prefix| component.type_name.starts_with(prefix.as_str()));
        }
        shapes.iter().any(|shape| component.exposes(*shape))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::handler::ListenerOutcome;

    struct Ping;
    struct Pong;

    struct PingHandler;

    impl Handler<Ping, Pong> for PingHandler {
        fn execute(&self, _request: &Ping) -> anyhow::Result<Pong> {
            Ok(Pong)
        }
    }

    struct PingBase;

    impl Handler<Ping, Pong> for PingBase {
        fn execute(&self, _request: &Ping) -> anyhow::Result<Pong> {
            anyhow::bail!("base type is never resolved")
        }
    }

    struct PingAudit;

    #[async_trait]
    impl DomainEvent<Ping> for PingAudit {
        async fn execute(
            &self,
            _message: &Ping,
            _cancellation: &CancellationToken,
        ) -> anyhow::Result<ListenerOutcome> {
            Ok(ListenerOutcome::completed("audited"))
        }
    }

    struct Plain;

    struct Flaky;

    impl ComponentSource for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn load(&self) -> Result<Vec<Component>, SourceLoadError> {
            Err(SourceLoadError {
                source_name: "flaky".to_string(),
                reason: "missing dependency".to_string(),
                partial: vec![Component::singleton(PingAudit).listens::<Ping>().build()],
            })
        }
    }

    fn manifest() -> Manifest {
        Manifest::new("app")
            .with(Component::singleton(PingHandler).handles::<Ping, Pong>().build())
            .with(Component::abstract_type::<PingBase>().handles::<Ping, Pong>().build())
            .with(Component::singleton(PingAudit).listens::<Ping>().build())
            .with(Component::singleton(Plain).build())
    }

    fn names(outcome: &ScanOutcome) -> Vec<&'static str> {
        outcome.matches.iter().map(Component::type_name).collect()
    }

    #[test]
    fn targeted_scan_keeps_concrete_components_of_requested_shape() {
        let manifest = manifest();
        let outcome = Scanner::new().find_matching(&[&manifest], &[Shape::Handler]);
        assert_eq!(names(&outcome), vec![type_name::<PingHandler>()]);
        assert!(outcome.skipped.is_empty());
    }

    #[test]
    fn blind_scan_keeps_concrete_types_outside_the_prefixes() {
        let manifest = manifest().with(Component::singleton(String::new()).build());
        let outcome = Scanner::with_prefixes(["std::", "core::", "alloc::"])
            .find_matching(&[&manifest], &[]);
        assert_eq!(
            names(&outcome),
            vec![
                type_name::<PingHandler>(),
                type_name::<PingAudit>(),
                type_name::<Plain>()
            ]
        );
    }

    #[test]
    fn default_blind_scan_drops_library_types() {
        // Fixtures here live under `commandquery_core::`, so none survive.
        let manifest = manifest().with(Component::singleton(String::new()).build());
        let outcome = Scanner::new().find_matching(&[&manifest], &[]);
        assert!(outcome.matches.is_empty());
    }

    #[test]
    fn exclude_prefix_extends_a_custom_list() {
        let manifest = manifest();
        let outcome = Scanner::with_prefixes(Vec::<String>::new())
            .exclude_prefix(type_name::<Plain>())
            .find_matching(&[&manifest], &[]);
        assert_eq!(
            names(&outcome),
            vec![type_name::<PingHandler>(), type_name::<PingAudit>()]
        );
    }

    #[test]
    fn exclusions_apply_to_targeted_scans() {
        let manifest = manifest();
        let outcome = Scanner::new()
            .exclude::<PingAudit>()
            .find_matching(&[&manifest], &[Shape::Handler, Shape::DomainEvent]);
        assert_eq!(names(&outcome), vec![type_name::<PingHandler>()]);
    }

    #[test]
    fn failing_source_degrades_to_partial_results() {
        let manifest = Manifest::new("app")
            .with(Component::singleton(PingHandler).handles::<Ping, Pong>().build());
        let outcome = Scanner::new().find_matching(
            &[&Flaky, &manifest],
            &[Shape::Handler, Shape::DomainEvent],
        );

        assert_eq!(
            names(&outcome),
            vec![type_name::<PingAudit>(), type_name::<PingHandler>()]
        );
        assert_eq!(
            outcome.skipped,
            vec![SkippedSource {
                source_name: "flaky".to_string(),
                reason: "missing dependency".to_string(),
                recovered: 1,
            }]
        );
    }

    #[test]
    fn duplicate_components_across_sources_match_once() {
        let first = manifest();
        let second = manifest();
        let outcome = Scanner::new().find_matching(&[&first, &second], &[Shape::Handler]);
        assert_eq!(outcome.matches.len(), 1);
    }

    #[test]
    fn registering_a_component_adds_capabilities_and_self() {
        let component = Component::singleton(PingHandler).handles::<Ping, Pong>().build();
        let mut builder = RegistryBuilder::new();
        component.register(&mut builder);
        let registry = builder.build().unwrap();

        assert!(registry.handler::<Ping, Pong>().is_some());
        assert!(registry.resolve::<PingHandler>().is_some());
        assert_eq!(
            registry.capabilities()[0].service,
            component.capabilities()[0].service
        );
    }
}
