//! Service registry for cross-plugin dependency injection.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Identifies the typed contract a service satisfies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceId {
    type_id: TypeId,
    type_name: &'static str,
}

impl InterfaceId {
    /// Interface identifier for `I`, usually a `dyn Trait`.
    pub fn of<I: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<I>(),
            type_name: std::any::type_name::<I>(),
        }
    }

    /// Type name of the interface.
    pub fn name(&self) -> &'static str {
        self.type_name
    }
}

/// One registered service.
struct ServiceEntry {
    /// Boxed `Arc<T>` so that both sized types and trait objects can be stored.
    instance: Box<dyn Any + Send + Sync>,
    interface: Option<InterfaceId>,
    owner: Option<String>,
}

/// Description of a registered service, without the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service name.
    pub name: String,
    /// Interface the service was registered under.
    pub interface: Option<&'static str>,
    /// Plugin that registered the service.
    pub owner: Option<String>,
}

/// Named lookup table of shared service instances.
///
/// Registering an existing name replaces the previous entry.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, ServiceEntry>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service by name.
    pub fn register<T>(&self, name: impl Into<String>, instance: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.insert(name.into(), Box::new(instance), None, None);
    }

    /// Register a service that satisfies interface `I`.
    ///
    /// The service is then reachable by name through `get::<I>` and by
    /// interface through [`get_by_interface`](Self::get_by_interface).
    pub fn register_interface<I>(&self, name: impl Into<String>, instance: Arc<I>)
    where
        I: ?Sized + Send + Sync + 'static,
    {
        self.insert(
            name.into(),
            Box::new(instance),
            Some(InterfaceId::of::<I>()),
            None,
        );
    }

    pub(crate) fn register_owned<T>(
        &self,
        owner: &str,
        name: impl Into<String>,
        instance: Arc<T>,
        with_interface: bool,
    ) where
        T: ?Sized + Send + Sync + 'static,
    {
        let interface = with_interface.then(InterfaceId::of::<T>);
        self.insert(name.into(), Box::new(instance), interface, Some(owner.to_string()));
    }

    fn insert(
        &self,
        name: String,
        instance: Box<dyn Any + Send + Sync>,
        interface: Option<InterfaceId>,
        owner: Option<String>,
    ) {
        let entry = ServiceEntry {
            instance,
            interface,
            owner,
        };

        if self.services.write().insert(name.clone(), entry).is_some() {
            tracing::debug!(service = %name, "replaced existing service");
        } else {
            tracing::debug!(service = %name, "registered service");
        }
    }

    /// Look up a service by name; `None` if missing or of a different type.
    pub fn get<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.services
            .read()
            .get(name)
            .and_then(|entry| entry.instance.downcast_ref::<Arc<T>>())
            .cloned()
    }

    /// All services registered under interface `I`, ordered by name.
    pub fn get_by_interface<I>(&self) -> Vec<Arc<I>>
    where
        I: ?Sized + Send + Sync + 'static,
    {
        let wanted = InterfaceId::of::<I>();
        let services = self.services.read();

        let mut matches: Vec<(&String, Arc<I>)> = services
            .iter()
            .filter(|(_, entry)| entry.interface == Some(wanted))
            .filter_map(|(name, entry)| {
                entry
                    .instance
                    .downcast_ref::<Arc<I>>()
                    .map(|instance| (name, instance.clone()))
            })
            .collect();

        matches.sort_by(|a, b| a.0.cmp(b.0));
        matches.into_iter().map(|(_, instance)| instance).collect()
    }

    /// Check if a service name is registered.
    pub fn has(&self, name: &str) -> bool {
        self.services.read().contains_key(name)
    }

    /// All registered service names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Describe every registered service, sorted by name.
    pub fn info(&self) -> Vec<ServiceInfo> {
        let mut info: Vec<ServiceInfo> = self
            .services
            .read()
            .iter()
            .map(|(name, entry)| ServiceInfo {
                name: name.clone(),
                interface: entry.interface.map(|i| i.name()),
                owner: entry.owner.clone(),
            })
            .collect();
        info.sort_by(|a, b| a.name.cmp(&b.name));
        info
    }

    /// Remove a service. Returns true if it existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.services.write().remove(name).is_some()
    }

    /// Remove every service registered by `owner`. Returns the removed names.
    pub fn unregister_owned_by(&self, owner: &str) -> Vec<String> {
        let mut services = self.services.write();
        let names: Vec<String> = services
            .iter()
            .filter(|(_, entry)| entry.owner.as_deref() == Some(owner))
            .map(|(name, _)| name.clone())
            .collect();

        for name in &names {
            services.remove(name);
        }
        names
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    /// Check if no services are registered.
    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.list())
            .finish()
    }
}
