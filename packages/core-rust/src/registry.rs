//! Immutable capability registry.
//!
//! Maps a (request type, response type) pair to exactly one handler resolver,
//! a message type to its ordered listeners, and a concrete type to its own
//! resolver. Built once at startup by [`RegistryBuilder`] and shared behind an
//! `Arc`; lookups never lock.

use std::any::{type_name, Any, TypeId};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::ConfigError;
use crate::handler::{AsyncHandler, DomainEvent, Handler};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Capability shapes a component may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Shape {
    Handler,
    AsyncHandler,
    DomainEvent,
}

impl Shape {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handler => "Handler",
            Self::AsyncHandler => "AsyncHandler",
            Self::DomainEvent => "DomainEvent",
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier of a Rust type, paired with its name for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl std::hash::Hash for TypeKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Registry key of a request/response handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub request: TypeKey,
    pub response: TypeKey,
}

impl HandlerKey {
    #[must_use]
    pub fn of<Req: 'static, Resp: 'static>() -> Self {
        Self {
            request: TypeKey::of::<Req>(),
            response: TypeKey::of::<Resp>(),
        }
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.request.name, self.response.name)
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// How often a resolver constructs its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// One shared instance for the whole process.
    Singleton,
    /// A new instance per resolution.
    Transient,
}

impl Lifetime {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Singleton => "singleton",
            Self::Transient => "transient",
        }
    }
}

/// Produces instances of `T` according to a [`Lifetime`].
pub struct Resolver<T: ?Sized> {
    lifetime: Lifetime,
    factory: Arc<dyn Fn() -> Arc<T> + Send + Sync>,
}

impl<T: ?Sized + Send + Sync + 'static> Resolver<T> {
    #[must_use]
    pub fn singleton(instance: Arc<T>) -> Self {
        Self {
            lifetime: Lifetime::Singleton,
            factory: Arc::new(move || Arc::clone(&instance)),
        }
    }

    pub fn transient<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<T> + Send + Sync + 'static,
    {
        Self {
            lifetime: Lifetime::Transient,
            factory: Arc::new(factory),
        }
    }

    /// Returns an instance: the shared one for singletons, a fresh one otherwise.
    #[must_use]
    pub fn resolve(&self) -> Arc<T> {
        (self.factory)()
    }

    #[must_use]
    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    /// Converts every resolved instance, keeping the lifetime. A mapped
    /// singleton still hands out the same underlying instance.
    pub fn map<U, F>(&self, convert: F) -> Resolver<U>
    where
        U: ?Sized + 'static,
        F: Fn(Arc<T>) -> Arc<U> + Send + Sync + 'static,
    {
        let inner = Arc::clone(&self.factory);
        Resolver {
            lifetime: self.lifetime,
            factory: Arc::new(move || convert(inner())),
        }
    }
}

impl<T: ?Sized> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            lifetime: self.lifetime,
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

/// The single handler registered for a request/response pair.
pub(crate) enum HandlerSlot<Req, Resp> {
    Sync(Resolver<dyn Handler<Req, Resp>>),
    Async(Resolver<dyn AsyncHandler<Req, Resp>>),
}

impl<Req, Resp> Clone for HandlerSlot<Req, Resp> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(resolver) => Self::Sync(resolver.clone()),
            Self::Async(resolver) => Self::Async(resolver.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Registration records
// ---------------------------------------------------------------------------

/// One capability → implementation mapping held by a [`Registry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub shape: Shape,
    /// Capability instantiation, e.g. `Handler<app::GetWidget, app::Widget>`.
    pub service: String,
    pub implementation: &'static str,
    pub lifetime: Lifetime,
}

/// A resolved listener together with the name of its implementation.
pub struct RegisteredListener<T> {
    pub implementation: &'static str,
    pub listener: Arc<dyn DomainEvent<T>>,
}

struct HandlerEntry {
    implementation: &'static str,
    slot: Arc<dyn Any + Send + Sync>,
}

struct ListenerEntry {
    implementation: &'static str,
    resolver: Arc<dyn Any + Send + Sync>,
}

// ---------------------------------------------------------------------------
// RegistryBuilder
// ---------------------------------------------------------------------------

/// Collects registrations; [`build`](Self::build) validates and freezes them.
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: Vec<(HandlerKey, HandlerEntry)>,
    listeners: Vec<(TypeKey, ListenerEntry)>,
    components: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    registrations: Vec<Registration>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one shared instance of a blocking handler.
    pub fn register_singleton<Req, Resp, H>(&mut self, handler: H) -> &mut Self
    where
        Req: 'static,
        Resp: 'static,
        H: Handler<Req, Resp> + 'static,
    {
        let shared: Arc<dyn Handler<Req, Resp>> = Arc::new(handler);
        self.register_handler(type_name::<H>(), Resolver::singleton(shared))
    }

    /// Registers a blocking handler constructed on every resolution.
    pub fn register_transient<Req, Resp, H, F>(&mut self, factory: F) -> &mut Self
    where
        Req: 'static,
        Resp: 'static,
        H: Handler<Req, Resp> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let resolver = Resolver::transient(move || Arc::new(factory()) as Arc<dyn Handler<Req, Resp>>);
        self.register_handler(type_name::<H>(), resolver)
    }

    /// Registers one shared instance of a suspending handler.
    pub fn register_async_singleton<Req, Resp, H>(&mut self, handler: H) -> &mut Self
    where
        Req: 'static,
        Resp: 'static,
        H: AsyncHandler<Req, Resp> + 'static,
    {
        let shared: Arc<dyn AsyncHandler<Req, Resp>> = Arc::new(handler);
        self.register_async_handler(type_name::<H>(), Resolver::singleton(shared))
    }

    /// Registers a suspending handler constructed on every resolution.
    pub fn register_async_transient<Req, Resp, H, F>(&mut self, factory: F) -> &mut Self
    where
        Req: 'static,
        Resp: 'static,
        H: AsyncHandler<Req, Resp> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let resolver =
            Resolver::transient(move || Arc::new(factory()) as Arc<dyn AsyncHandler<Req, Resp>>);
        self.register_async_handler(type_name::<H>(), resolver)
    }

    /// Registers one shared listener for messages of type `T`.
    pub fn register_listener<T, L>(&mut self, listener: L) -> &mut Self
    where
        T: 'static,
        L: DomainEvent<T> + 'static,
    {
        let shared: Arc<dyn DomainEvent<T>> = Arc::new(listener);
        self.register_event_listener(type_name::<L>(), Resolver::singleton(shared))
    }

    /// Registers a listener constructed on every publish.
    pub fn register_transient_listener<T, L, F>(&mut self, factory: F) -> &mut Self
    where
        T: 'static,
        L: DomainEvent<T> + 'static,
        F: Fn() -> L + Send + Sync + 'static,
    {
        let resolver = Resolver::transient(move || Arc::new(factory()) as Arc<dyn DomainEvent<T>>);
        self.register_event_listener(type_name::<L>(), resolver)
    }

    /// Registers a blocking handler resolver under an explicit implementation name.
    pub fn register_handler<Req: 'static, Resp: 'static>(
        &mut self,
        implementation: &'static str,
        resolver: Resolver<dyn Handler<Req, Resp>>,
    ) -> &mut Self {
        self.push_handler(
            Shape::Handler,
            implementation,
            resolver.lifetime(),
            Arc::new(HandlerSlot::Sync(resolver)),
        )
    }

    /// Registers a suspending handler resolver under an explicit implementation name.
    pub fn register_async_handler<Req: 'static, Resp: 'static>(
        &mut self,
        implementation: &'static str,
        resolver: Resolver<dyn AsyncHandler<Req, Resp>>,
    ) -> &mut Self {
        self.push_handler(
            Shape::AsyncHandler,
            implementation,
            resolver.lifetime(),
            Arc::new(HandlerSlot::Async(resolver)),
        )
    }

    /// Registers a listener resolver under an explicit implementation name.
    pub fn register_event_listener<T: 'static>(
        &mut self,
        implementation: &'static str,
        resolver: Resolver<dyn DomainEvent<T>>,
    ) -> &mut Self {
        let key = TypeKey::of::<T>();
        self.registrations.push(Registration {
            shape: Shape::DomainEvent,
            service: format!("DomainEvent<{}>", key.name),
            implementation,
            lifetime: resolver.lifetime(),
        });
        self.listeners.push((
            key,
            ListenerEntry {
                implementation,
                resolver: Arc::new(resolver),
            },
        ));
        self
    }

    /// Makes a concrete type resolvable by itself through [`Registry::resolve`].
    /// A later registration of the same type replaces an earlier one.
    pub fn register_self<H: Send + Sync + 'static>(&mut self, resolver: Resolver<H>) -> &mut Self {
        self.components.insert(TypeId::of::<H>(), Arc::new(resolver));
        self
    }

    /// Capability registrations collected so far, in registration order.
    #[must_use]
    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    fn push_handler<Req: 'static, Resp: 'static>(
        &mut self,
        shape: Shape,
        implementation: &'static str,
        lifetime: Lifetime,
        slot: Arc<HandlerSlot<Req, Resp>>,
    ) -> &mut Self {
        let key = HandlerKey::of::<Req, Resp>();
        self.registrations.push(Registration {
            shape,
            service: format!("{shape}<{}, {}>", key.request.name, key.response.name),
            implementation,
            lifetime,
        });
        self.handlers.push((
            key,
            HandlerEntry {
                implementation,
                slot,
            },
        ));
        self
    }

    /// Freezes the registrations into an immutable [`Registry`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateHandler`] listing every request/response
    /// pair registered more than once. A blocking and a suspending handler for
    /// the same pair count as duplicates.
    pub fn build(self) -> Result<Registry, ConfigError> {
        let mut handlers: HashMap<HandlerKey, HandlerEntry> = HashMap::new();
        let mut duplicates = Vec::new();
        for (key, entry) in self.handlers {
            match handlers.entry(key) {
                Entry::Occupied(existing) => duplicates.push(format!(
                    "{key} ({} and {})",
                    existing.get().implementation,
                    entry.implementation
                )),
                Entry::Vacant(slot) => {
                    slot.insert(entry);
                }
            }
        }
        if !duplicates.is_empty() {
            return Err(ConfigError::DuplicateHandler { pairs: duplicates });
        }

        let mut listeners: HashMap<TypeKey, Vec<ListenerEntry>> = HashMap::new();
        for (key, entry) in self.listeners {
            listeners.entry(key).or_default().push(entry);
        }

        debug!(
            handlers = handlers.len(),
            listener_types = listeners.len(),
            components = self.components.len(),
            "registry built"
        );

        Ok(Registry {
            handlers,
            listeners,
            components: self.components,
            registrations: self.registrations,
        })
    }
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("registrations", &self.registrations)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Read-only capability map shared by brokers and publishers.
pub struct Registry {
    handlers: HashMap<HandlerKey, HandlerEntry>,
    listeners: HashMap<TypeKey, Vec<ListenerEntry>>,
    components: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    registrations: Vec<Registration>,
}

impl Registry {
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub(crate) fn handler_slot<Req: 'static, Resp: 'static>(
        &self,
    ) -> Option<&HandlerSlot<Req, Resp>> {
        self.handlers
            .get(&HandlerKey::of::<Req, Resp>())
            .and_then(|entry| entry.slot.downcast_ref::<HandlerSlot<Req, Resp>>())
    }

    /// Resolves the blocking handler for `Req -> Resp`, if one is registered.
    #[must_use]
    pub fn handler<Req: 'static, Resp: 'static>(&self) -> Option<Arc<dyn Handler<Req, Resp>>> {
        match self.handler_slot::<Req, Resp>()? {
            HandlerSlot::Sync(resolver) => Some(resolver.resolve()),
            HandlerSlot::Async(_) => None,
        }
    }

    /// Resolves the suspending handler for `Req -> Resp`, if one is registered.
    #[must_use]
    pub fn async_handler<Req: 'static, Resp: 'static>(
        &self,
    ) -> Option<Arc<dyn AsyncHandler<Req, Resp>>> {
        match self.handler_slot::<Req, Resp>()? {
            HandlerSlot::Async(resolver) => Some(resolver.resolve()),
            HandlerSlot::Sync(_) => None,
        }
    }

    /// Resolves every listener for `T`, in registration order.
    #[must_use]
    pub fn listeners<T: 'static>(&self) -> Vec<RegisteredListener<T>> {
        self.listeners
            .get(&TypeKey::of::<T>())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let resolver = entry.resolver.downcast_ref::<Resolver<dyn DomainEvent<T>>>()?;
                        Some(RegisteredListener {
                            implementation: entry.implementation,
                            listener: resolver.resolve(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolves a concrete component by its own type.
    #[must_use]
    pub fn resolve<H: Send + Sync + 'static>(&self) -> Option<Arc<H>> {
        self.components
            .get(&TypeId::of::<H>())
            .and_then(|entry| entry.downcast_ref::<Resolver<H>>())
            .map(Resolver::resolve)
    }

    /// Whether any handler (blocking or suspending) is registered for `Req -> Resp`.
    #[must_use]
    pub fn contains<Req: 'static, Resp: 'static>(&self) -> bool {
        self.handlers.contains_key(&HandlerKey::of::<Req, Resp>())
    }

    /// Every capability registration, in registration order.
    #[must_use]
    pub fn capabilities(&self) -> &[Registration] {
        &self.registrations
    }

    /// Number of registered request/response handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("listener_types", &self.listeners.len())
            .field("components", &self.components.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
