//! Plugin host: wires discovery, the manager, the event bus, and the router together.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::admin::{AdminCommand, AdminOutput};
use crate::discovery::{DiscoveryConfig, DEFAULT_MANIFEST_FILES};
use crate::error::{Error, Result};
use crate::events::{BusConfig, EventBus, SubscriptionId};
use crate::hot_reload::{AttachConfig, RouteAttachment, DEFAULT_ROUTE_PREFIX};
use crate::lifecycle::PluginStatus;
use crate::manager::{ManagerConfig, PluginManager, ReconcileReport};
use crate::manifest::ALLOWED_CATEGORIES;
use crate::plugin::PluginCatalog;
use crate::router::{HttpMethod, InMemoryRouter};
use crate::services::ServiceRegistry;
use crate::store::{EnablementStore, FileStore, KeyValueStore, MemoryStore};

/// Event announcing that files under the plugin root changed.
pub const FILES_CHANGED_EVENT: &str = "plugin.files.changed";

/// Host configuration, usually read from a TOML file.
///
/// Durations are given in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Root of the `<category>/<plugin>` tree.
    pub plugin_root: PathBuf,
    /// Permissions granted to plugins.
    pub granted_permissions: BTreeSet<String>,
    /// Upper bound for plugin hooks.
    pub hook_timeout_ms: u64,
    /// Bounded wait for the event bus to drain at shutdown.
    pub drain_timeout_ms: u64,
    /// Upper bound for a single event handler.
    pub handler_timeout_ms: u64,
    /// Prefix for plugin routes.
    pub route_prefix: String,
    /// Title of the generated API schema.
    pub api_title: String,
    /// JSON file for enablement and plugin data; in-memory when absent.
    pub state_file: Option<PathBuf>,
    /// Manifest file names looked for in each plugin directory.
    pub manifest_files: Vec<String>,
    /// Categories accepted by this host.
    pub allowed_categories: Vec<String>,
    /// Per-plugin configuration.
    pub plugins: HashMap<String, Value>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            plugin_root: PathBuf::from("plugins"),
            granted_permissions: BTreeSet::new(),
            hook_timeout_ms: 30_000,
            drain_timeout_ms: 5_000,
            handler_timeout_ms: 30_000,
            route_prefix: DEFAULT_ROUTE_PREFIX.to_string(),
            api_title: "plugin-host".to_string(),
            state_file: None,
            manifest_files: DEFAULT_MANIFEST_FILES.iter().map(|s| s.to_string()).collect(),
            allowed_categories: ALLOWED_CATEGORIES.iter().map(|s| s.to_string()).collect(),
            plugins: HashMap::new(),
        }
    }
}

impl HostConfig {
    /// Create a new host configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Read a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Set the plugin root.
    pub fn with_plugin_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.plugin_root = root.into();
        self
    }

    /// Grant a permission.
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.granted_permissions.insert(permission.into());
        self
    }

    /// Persist state to a JSON file.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// Set the hook timeout.
    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set one plugin's configuration.
    pub fn with_plugin_config(mut self, plugin: impl Into<String>, config: Value) -> Self {
        self.plugins.insert(plugin.into(), config);
        self
    }

    /// Manager settings derived from this configuration.
    pub fn manager_config(&self) -> ManagerConfig {
        let mut config = ManagerConfig::new()
            .with_plugin_root(self.plugin_root.clone())
            .with_permissions(self.granted_permissions.iter().cloned())
            .with_hook_timeout(Duration::from_millis(self.hook_timeout_ms))
            .with_discovery(self.discovery_config());
        config.plugin_config = self.plugins.clone();
        config
    }

    /// Event bus settings derived from this configuration.
    pub fn bus_config(&self) -> BusConfig {
        BusConfig::new()
            .with_drain_timeout(Duration::from_millis(self.drain_timeout_ms))
            .with_handler_timeout(Duration::from_millis(self.handler_timeout_ms))
    }

    /// Route attachment settings derived from this configuration.
    pub fn attach_config(&self) -> AttachConfig {
        AttachConfig::new().with_prefix(self.route_prefix.clone())
    }

    /// Discovery settings derived from this configuration.
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig::new()
            .with_manifest_files(self.manifest_files.iter().cloned())
            .with_allowed_categories(self.allowed_categories.iter().cloned())
    }
}

/// A running plugin host.
pub struct PluginHost {
    config: HostConfig,
    router: Arc<InMemoryRouter>,
    manager: Arc<PluginManager>,
    bus_task: Mutex<Option<JoinHandle<Result<()>>>>,
    subscriptions: Mutex<Vec<(&'static str, SubscriptionId)>>,
}

impl PluginHost {
    /// Build a host for the plugins in `catalog`.
    ///
    /// Opens the state file when one is configured.
    pub async fn new(config: HostConfig, catalog: Arc<PluginCatalog>) -> Result<Self> {
        let (enablement, storage) = match config.state_file {
            Some(ref path) => {
                let store = Arc::new(FileStore::open(path).await?);
                let enablement: Arc<dyn EnablementStore> = store.clone();
                let storage: Arc<dyn KeyValueStore> = store;
                (enablement, storage)
            }
            None => {
                let store = Arc::new(MemoryStore::new());
                let enablement: Arc<dyn EnablementStore> = store.clone();
                let storage: Arc<dyn KeyValueStore> = store;
                (enablement, storage)
            }
        };

        Ok(Self::with_stores(config, catalog, enablement, storage))
    }

    /// Build a host over caller-provided stores.
    pub fn with_stores(
        config: HostConfig,
        catalog: Arc<PluginCatalog>,
        enablement: Arc<dyn EnablementStore>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Self {
        let router = Arc::new(InMemoryRouter::new(config.api_title.clone()));
        let attachment = Arc::new(RouteAttachment::new(config.attach_config(), router.clone()));
        let manager = PluginManager::new(config.manager_config(), catalog, attachment)
            .with_event_bus(EventBus::new(config.bus_config()))
            .with_enablement_store(enablement)
            .with_storage(storage);

        Self {
            config,
            router,
            manager: Arc::new(manager),
            bus_task: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Get the host configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Get the live router.
    pub fn router(&self) -> &Arc<InMemoryRouter> {
        &self.router
    }

    /// Get the plugin manager.
    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    /// Get the event bus.
    pub fn events(&self) -> &EventBus {
        self.manager.events()
    }

    /// Get the service registry.
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        self.manager.services()
    }

    /// Spawn the event bus loop and re-enable plugins recorded in the store.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(&self) -> Result<ReconcileReport> {
        {
            let mut task = self.bus_task.lock();
            if task.is_some() {
                return Err(Error::EventBusRunning);
            }
            let bus = self.events().clone();
            *task = Some(tokio::spawn(async move { bus.run().await }));
        }

        let manager = Arc::downgrade(&self.manager);
        let id = self.events().subscribe_fn(FILES_CHANGED_EVENT, move |event| -> Result<()> {
            if let Some(manager) = manager.upgrade() {
                let added = manager.rediscover();
                tracing::debug!(
                    path = event.get_str("path").unwrap_or_default(),
                    added = added.len(),
                    "rediscovered after file change"
                );
            }
            Ok(())
        });
        let cascade = self.manager.detach_dependents_on_unload();
        self.subscriptions
            .lock()
            .extend([(FILES_CHANGED_EVENT, id), ("plugin.unloaded", cascade)]);

        let report = self.manager.reconcile_enabled_from_store().await?;
        tracing::info!(
            plugins = self.manager.names().len(),
            enabled = report.enabled.len(),
            routes = self.router.len(),
            "plugin host started"
        );
        Ok(report)
    }

    /// Serve a request against the live routes.
    pub async fn dispatch(&self, method: HttpMethod, path: &str, body: Value) -> Result<Value> {
        self.router.dispatch(method, path, body).await
    }

    /// Parse and run an admin command line.
    pub async fn admin(&self, line: &str) -> Result<AdminOutput> {
        let command: AdminCommand = line.parse()?;
        command.execute(&self.manager).await
    }

    /// Unload every plugin, dependents first, then drain and stop the event bus.
    ///
    /// Persisted enablement is kept so the next start re-enables the same plugins.
    pub async fn shutdown(&self) {
        let names = self.manager.names();
        let mut order = self.manager.load_order(&names).unwrap_or(names);
        order.reverse();

        for name in order {
            if self.manager.status(&name) == Some(PluginStatus::Enabled) {
                if let Err(e) = self.manager.deactivate_plugin(&name).await {
                    tracing::warn!(plugin = %name, error = %e, "failed to detach plugin at shutdown");
                }
            }
            if self.manager.status(&name).map_or(false, |s| s.can_unload()) {
                if let Err(e) = self.manager.unload_plugin(&name).await {
                    tracing::warn!(plugin = %name, error = %e, "failed to unload plugin at shutdown");
                }
            }
        }

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for (event_name, id) in subscriptions {
            self.events().unsubscribe(event_name, id);
        }

        self.events().shutdown().await;

        let task = self.bus_task.lock().take();
        if let Some(task) = task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "event bus loop failed"),
                Err(e) => tracing::warn!(error = %e, "event bus task aborted"),
            }
        }

        tracing::info!("plugin host stopped");
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("config", &self.config)
            .field("manager", &self.manager)
            .field("routes", &self.router.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_config_from_toml() {
        let config = HostConfig::from_toml(
            r#"
            plugin_root = "/srv/plugins"
            granted_permissions = ["db:read", "events:publish"]
            hook_timeout_ms = 250
            route_prefix = "/ext"

            [plugins.tasks]
            limit = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.plugin_root, PathBuf::from("/srv/plugins"));
        assert_eq!(config.drain_timeout_ms, 5_000);
        assert!(config.granted_permissions.contains("db:read"));
        assert_eq!(config.plugins["tasks"]["limit"], serde_json::json!(5));

        let manager = config.manager_config();
        assert_eq!(manager.hook_timeout, Duration::from_millis(250));
        assert_eq!(manager.plugin_config.len(), 1);
        assert_eq!(config.attach_config().prefix, "/ext");
    }

    #[test]
    fn test_host_config_rejects_bad_toml() {
        let err = HostConfig::from_toml("hook_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_start_and_shutdown_empty_host() {
        let host = PluginHost::new(HostConfig::new().with_plugin_root("/nonexistent"), Arc::new(PluginCatalog::new()))
            .await
            .unwrap();

        let report = host.start().await.unwrap();
        assert!(report.enabled.is_empty());
        assert!(matches!(host.start().await, Err(Error::EventBusRunning)));

        host.shutdown().await;
        assert!(host.events().is_closed());
        assert!(!host.events().is_running());
    }
}
