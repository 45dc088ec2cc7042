//! Plugin trait, factories, and the context handed to plugins at initialization.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::events::{Event, EventBus, EventHandler, EventPriority, SubscriptionId};
use crate::manifest::PluginManifest;
use crate::router::{HttpMethod, RouteHandler};
use crate::services::ServiceRegistry;
use crate::store::NamespacedStore;

/// Behavior every plugin provides.
///
/// Hooks are async; a plugin with nothing to await simply returns.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Called once after dependencies are resolved.
    async fn initialize(&mut self, ctx: &PluginContext) -> Result<()>;

    /// Called before the plugin is removed. Errors are logged, not propagated.
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    /// Operations exposed on the host router while enabled.
    fn operations(&self) -> Vec<Operation> {
        Vec::new()
    }

    /// Description of the data the plugin owns.
    fn data_schema(&self) -> Option<Value> {
        None
    }
}

/// An operation a plugin exposes through the router.
#[derive(Clone)]
pub struct Operation {
    /// HTTP method.
    pub method: HttpMethod,
    /// Path relative to the plugin's route prefix.
    pub path: String,
    /// Request handler.
    pub handler: Arc<dyn RouteHandler>,
    /// Short description.
    pub summary: Option<String>,
    /// Documentation tags.
    pub tags: Vec<String>,
}

impl Operation {
    /// Create an operation.
    pub fn new(method: HttpMethod, path: impl Into<String>, handler: Arc<dyn RouteHandler>) -> Self {
        Self {
            method,
            path: path.into(),
            handler,
            summary: None,
            tags: Vec::new(),
        }
    }

    /// Create a GET operation.
    pub fn get(path: impl Into<String>, handler: Arc<dyn RouteHandler>) -> Self {
        Self::new(HttpMethod::Get, path, handler)
    }

    /// Create a POST operation.
    pub fn post(path: impl Into<String>, handler: Arc<dyn RouteHandler>) -> Self {
        Self::new(HttpMethod::Post, path, handler)
    }

    /// Create a DELETE operation.
    pub fn delete(path: impl Into<String>, handler: Arc<dyn RouteHandler>) -> Self {
        Self::new(HttpMethod::Delete, path, handler)
    }

    /// Set the summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("summary", &self.summary)
            .field("tags", &self.tags)
            .finish()
    }
}

/// Creates plugin instances for one compiled-in plugin.
pub trait PluginFactory: Send + Sync {
    /// Manifest declared by the plugin package.
    fn manifest(&self) -> PluginManifest;

    /// Create a fresh, uninitialized instance.
    fn create(&self) -> Box<dyn Plugin>;
}

struct FnFactory<F> {
    manifest: PluginManifest,
    create: F,
}

impl<F> PluginFactory for FnFactory<F>
where
    F: Fn() -> Box<dyn Plugin> + Send + Sync,
{
    fn manifest(&self) -> PluginManifest {
        self.manifest.clone()
    }

    fn create(&self) -> Box<dyn Plugin> {
        (self.create)()
    }
}

/// Compiled-in plugin factories, keyed by plugin name.
#[derive(Default)]
pub struct PluginCatalog {
    factories: DashMap<String, Arc<dyn PluginFactory>>,
}

impl PluginCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its manifest name, replacing any previous one.
    pub fn register(&self, factory: Arc<dyn PluginFactory>) {
        let name = factory.manifest().name;
        if self.factories.insert(name.clone(), factory).is_some() {
            tracing::debug!(plugin = %name, "replaced plugin factory");
        }
    }

    /// Register a closure that builds instances for `manifest`.
    pub fn register_fn<F>(&self, manifest: PluginManifest, create: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnFactory { manifest, create }));
    }

    /// Get a factory.
    pub fn get(&self, name: &str) -> Option<Arc<dyn PluginFactory>> {
        self.factories.get(name).map(|f| f.value().clone())
    }

    /// Manifest declared by a registered factory.
    pub fn manifest(&self, name: &str) -> Option<PluginManifest> {
        self.factories.get(name).map(|f| f.manifest())
    }

    /// Check if a factory is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Remove a factory.
    pub fn unregister(&self, name: &str) -> bool {
        self.factories.remove(name).is_some()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered factories.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("plugins", &self.names())
            .finish()
    }
}

/// Host facilities available to a plugin during initialization.
#[derive(Clone)]
pub struct PluginContext {
    plugin_name: String,
    config: Value,
    services: Arc<ServiceRegistry>,
    events: EventBus,
    store: NamespacedStore,
}

impl PluginContext {
    /// Create a context for `plugin_name`.
    pub fn new(
        plugin_name: impl Into<String>,
        config: Value,
        services: Arc<ServiceRegistry>,
        events: EventBus,
        store: NamespacedStore,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            config,
            services,
            events,
            store,
        }
    }

    /// Name of the plugin this context belongs to.
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Validated configuration, with schema defaults applied.
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// One configuration value.
    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    /// Shared service registry.
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// Shared event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Key-value storage scoped to this plugin.
    pub fn store(&self) -> &NamespacedStore {
        &self.store
    }

    /// Register a service owned by this plugin; it is removed when the plugin unloads.
    pub fn register_service<T>(&self, name: impl Into<String>, instance: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.services
            .register_owned(&self.plugin_name, name, instance, false);
    }

    /// Register an owned service that is also discoverable by interface.
    pub fn provide<I>(&self, name: impl Into<String>, instance: Arc<I>)
    where
        I: ?Sized + Send + Sync + 'static,
    {
        self.services
            .register_owned(&self.plugin_name, name, instance, true);
    }

    /// Look up a service by name.
    pub fn service<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.services.get(name)
    }

    /// Publish an event with this plugin as its source.
    pub fn publish(
        &self,
        event_name: impl Into<String>,
        data: Map<String, Value>,
        priority: EventPriority,
    ) -> Result<()> {
        self.events.publish_event(
            Event::new(event_name, data)
                .with_priority(priority)
                .with_source(self.plugin_name.clone()),
        )
    }

    /// Subscribe to an event.
    pub fn subscribe(&self, event_name: impl Into<String>, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        self.events.subscribe(event_name, handler)
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_name", &self.plugin_name)
            .field("config", &self.config)
            .field("store", &self.store)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestBuilder;
    use crate::router::handler_fn;
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Ping;

    #[async_trait]
    impl Plugin for Ping {
        async fn initialize(&mut self, ctx: &PluginContext) -> Result<()> {
            ctx.register_service("ping.greeting", Arc::new(String::from("pong")));
            Ok(())
        }

        fn operations(&self) -> Vec<Operation> {
            vec![Operation::get("/ping", handler_fn(|_| async { Ok(json!("pong")) }))
                .with_summary("Ping")
                .with_tag("ping")]
        }
    }

    fn context(name: &str) -> PluginContext {
        PluginContext::new(
            name,
            json!({ "greeting": "hi" }),
            Arc::new(ServiceRegistry::new()),
            EventBus::default_config(),
            NamespacedStore::new(name, Arc::new(MemoryStore::new())),
        )
    }

    #[test]
    fn test_catalog_registration() {
        let catalog = PluginCatalog::new();
        let manifest = ManifestBuilder::new("ping", "1.0.0")
            .author("host")
            .category("utility")
            .build_unchecked();
        catalog.register_fn(manifest, || Box::new(Ping));

        assert!(catalog.contains("ping"));
        assert_eq!(catalog.names(), vec!["ping"]);
        assert_eq!(catalog.manifest("ping").unwrap().version, "1.0.0");
        assert_eq!(catalog.get("ping").unwrap().create().operations().len(), 1);

        assert!(catalog.unregister("ping"));
        assert!(catalog.is_empty());
    }

    #[tokio::test]
    async fn test_context_registers_owned_services() {
        let ctx = context("ping");
        let mut plugin = Ping;
        plugin.initialize(&ctx).await.unwrap();

        let greeting: Arc<String> = ctx.service("ping.greeting").unwrap();
        assert_eq!(greeting.as_str(), "pong");

        let info = ctx.services().info();
        assert_eq!(info[0].owner.as_deref(), Some("ping"));
        assert_eq!(ctx.config_value("greeting"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn test_context_publish_sets_source() {
        let ctx = context("ping");
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        ctx.events().subscribe_fn("ping.sent", move |event: &Event| -> Result<()> {
            sink.lock().push(event.source.clone());
            Ok(())
        });

        ctx.publish("ping.sent", Map::new(), EventPriority::Normal)
            .unwrap();
        ctx.events().run_until_idle().await;

        assert_eq!(*seen.lock(), vec![Some("ping".to_string())]);
    }
}
