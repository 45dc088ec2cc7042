//! Plugin manager: lifecycle orchestration, dependency gating, and enablement reconciliation.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::discovery::{Discovery, DiscoveryConfig};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, SubscriptionId};
use crate::hot_reload::{RouteAttachment, RouteHandle};
use crate::lifecycle::{LifecycleEvent, PluginStatus};
use crate::manifest::{parse_version, PluginManifest};
use crate::plugin::{Plugin, PluginCatalog, PluginContext};
use crate::services::ServiceRegistry;
use crate::store::{EnablementStore, KeyValueStore, MemoryStore, NamespacedStore};

#[cfg(feature = "metrics-prometheus")]
use crate::metrics::{PluginMetrics, Transition};

/// Configuration for the plugin manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root of the `<category>/<plugin>` tree.
    pub plugin_root: PathBuf,
    /// Permissions the host grants to plugins.
    pub granted_permissions: BTreeSet<String>,
    /// Upper bound for each `initialize`/`shutdown` hook.
    pub hook_timeout: Duration,
    /// Per-plugin configuration, validated against the manifest schema.
    pub plugin_config: HashMap<String, Value>,
    /// Discovery settings.
    pub discovery: DiscoveryConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            plugin_root: PathBuf::from("plugins"),
            granted_permissions: BTreeSet::new(),
            hook_timeout: Duration::from_secs(30),
            plugin_config: HashMap::new(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Create a new manager configuration.
    pub fn new() -> Self {
        Self::default()
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

    /// Grant several permissions.
    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.granted_permissions
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    /// Set the hook timeout.
    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }

    /// Set one plugin's configuration.
    pub fn with_plugin_config(mut self, plugin: impl Into<String>, config: Value) -> Self {
        self.plugin_config.insert(plugin.into(), config);
        self
    }

    /// Set the discovery configuration.
    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }
}

/// Point-in-time description of a managed plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Plugin category.
    pub category: String,
    /// Lifecycle status.
    pub status: PluginStatus,
    /// Declared dependencies.
    pub dependencies: Vec<String>,
    /// Requested permissions.
    pub permissions: Vec<String>,
    /// Number of attached routes.
    pub routes: usize,
    /// Plugin directory, when discovered from disk.
    pub dir: Option<PathBuf>,
    /// When the plugin was last loaded.
    pub loaded_at: Option<DateTime<Utc>>,
    /// When the plugin was last enabled.
    pub enabled_at: Option<DateTime<Utc>>,
    /// Error recorded by the last failed step.
    pub last_error: Option<String>,
}

/// Plugin counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Plugins known to the manager.
    pub total: usize,
    /// Plugins discovered but not loaded.
    pub unloaded: usize,
    /// Plugins loaded and not enabled.
    pub loaded: usize,
    /// Plugins serving routes.
    pub enabled: usize,
    /// Plugins disabled.
    pub disabled: usize,
    /// Plugins in error.
    pub error: usize,
}

/// Outcome of [`PluginManager::reconcile_enabled_from_store`].
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Plugins enabled from the store.
    pub enabled: Vec<String>,
    /// Plugins that could not be loaded or enabled.
    pub failed: Vec<(String, Error)>,
    /// Stale identifiers removed from the store.
    pub pruned: usize,
}

#[derive(Debug, Clone)]
struct SlotState {
    status: PluginStatus,
    loaded_at: Option<DateTime<Utc>>,
    enabled_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Mutable part of a plugin record, guarded by the per-plugin transition lock.
struct PluginRecord {
    instance: Option<Box<dyn Plugin>>,
    route_handles: Vec<RouteHandle>,
    removed: bool,
}

struct PluginSlot {
    manifest: PluginManifest,
    dir: Option<PathBuf>,
    /// Readable without waiting on a transition; written only under `record`.
    state: RwLock<SlotState>,
    record: tokio::sync::Mutex<PluginRecord>,
}

impl PluginSlot {
    fn new(manifest: PluginManifest, dir: Option<PathBuf>) -> Self {
        Self {
            manifest,
            dir,
            state: RwLock::new(SlotState {
                status: PluginStatus::Unloaded,
                loaded_at: None,
                enabled_at: None,
                last_error: None,
            }),
            record: tokio::sync::Mutex::new(PluginRecord {
                instance: None,
                route_handles: Vec::new(),
                removed: false,
            }),
        }
    }

    fn status(&self) -> PluginStatus {
        self.state.read().status
    }

    fn set_status(&self, status: PluginStatus) {
        self.state.write().status = status;
    }
}

/// Owns plugin records and drives every lifecycle transition.
///
/// Transitions for one plugin are serialized; different plugins proceed
/// independently.
pub struct PluginManager {
    config: ManagerConfig,
    catalog: Arc<PluginCatalog>,
    services: Arc<ServiceRegistry>,
    bus: EventBus,
    attachment: Arc<RouteAttachment>,
    enablement: Arc<dyn EnablementStore>,
    storage: Arc<dyn KeyValueStore>,
    slots: DashMap<String, Arc<PluginSlot>>,
    #[cfg(feature = "metrics-prometheus")]
    metrics: Option<Arc<PluginMetrics>>,
}

impl PluginManager {
    /// Create a manager with in-memory stores, a fresh service registry, and event bus.
    pub fn new(
        config: ManagerConfig,
        catalog: Arc<PluginCatalog>,
        attachment: Arc<RouteAttachment>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            config,
            catalog,
            services: Arc::new(ServiceRegistry::new()),
            bus: EventBus::default_config(),
            attachment,
            enablement: store.clone(),
            storage: store,
            slots: DashMap::new(),
            #[cfg(feature = "metrics-prometheus")]
            metrics: None,
        }
    }

    /// Use a shared service registry.
    pub fn with_services(mut self, services: Arc<ServiceRegistry>) -> Self {
        self.services = services;
        self
    }

    /// Use a shared event bus.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    /// Use an external enablement store.
    pub fn with_enablement_store(mut self, store: Arc<dyn EnablementStore>) -> Self {
        self.enablement = store;
        self
    }

    /// Use an external key-value store for plugin data.
    pub fn with_storage(mut self, storage: Arc<dyn KeyValueStore>) -> Self {
        self.storage = storage;
        self
    }

    /// Record lifecycle metrics.
    #[cfg(feature = "metrics-prometheus")]
    pub fn with_metrics(mut self, metrics: Arc<PluginMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Get the manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Get the plugin catalog.
    pub fn catalog(&self) -> &Arc<PluginCatalog> {
        &self.catalog
    }

    /// Get the service registry.
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// Get the event bus.
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Get the route attachment manager.
    pub fn attachment(&self) -> &Arc<RouteAttachment> {
        &self.attachment
    }

    /// Key-value storage scoped to one plugin.
    pub fn namespaced_store(&self, plugin_name: &str) -> NamespacedStore {
        NamespacedStore::new(plugin_name, self.storage.clone())
    }

    /// Discover plugins under `root` and track the ones not already known.
    ///
    /// Returns the newly tracked manifests.
    pub fn discover_plugins(&self, root: impl AsRef<Path>) -> Vec<PluginManifest> {
        let discovery =
            Discovery::new(self.config.discovery.clone()).with_catalog(self.catalog.clone());

        let mut added = Vec::new();
        for found in discovery.scan(root.as_ref()) {
            if self.track(found.manifest.clone(), Some(found.dir)) {
                added.push(found.manifest);
            }
        }
        added
    }

    /// Discover plugins under the configured root.
    pub fn rediscover(&self) -> Vec<PluginManifest> {
        let root = self.config.plugin_root.clone();
        self.discover_plugins(root)
    }

    /// Track a manifest declared in code. Returns false if the name is already known.
    pub fn register_manifest(&self, manifest: PluginManifest) -> Result<bool> {
        manifest.validate()?;
        self.config.discovery.check_category(&manifest)?;
        Ok(self.track(manifest, None))
    }

    fn track(&self, manifest: PluginManifest, dir: Option<PathBuf>) -> bool {
        let name = manifest.name.clone();
        let version = manifest.version.clone();

        match self.slots.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(PluginSlot::new(manifest, dir)));
            }
        }

        tracing::info!(plugin = %name, version = %version, "plugin discovered");
        self.emit(LifecycleEvent::Discovered { name, version });
        true
    }

    /// Resolve dependencies and initialize a plugin.
    ///
    /// Allowed from `Unloaded` and `Error`. A missing dependency or a failing
    /// initialization moves the plugin to `Error`.
    pub async fn load_plugin(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        let mut record = slot.record.lock().await;
        ensure_present(&record, name)?;

        let status = slot.status();
        if !status.can_load() {
            return Err(Error::invalid_state("unloaded or error", status.as_str()));
        }

        slot.set_status(PluginStatus::Loading);
        tracing::debug!(plugin = %name, "loading plugin");

        if let Err(e) = self.check_dependencies(&slot.manifest) {
            return Err(self.fail(&slot, "load", e));
        }

        match self.instantiate(&slot.manifest).await {
            Ok(instance) => {
                record.instance = Some(instance);
                let mut state = slot.state.write();
                state.status = PluginStatus::Loaded;
                state.loaded_at = Some(Utc::now());
                state.last_error = None;
            }
            Err(e) => {
                self.services.unregister_owned_by(name);
                return Err(self.fail(&slot, "load", e));
            }
        }

        tracing::info!(plugin = %name, version = %slot.manifest.version, "plugin loaded");
        self.count_transition("load");
        self.emit(LifecycleEvent::Loaded {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn instantiate(&self, manifest: &PluginManifest) -> Result<Box<dyn Plugin>> {
        let name = manifest.name.as_str();

        let raw = self
            .config
            .plugin_config
            .get(name)
            .cloned()
            .unwrap_or(Value::Null);
        let config = manifest
            .config_schema
            .apply(&raw)
            .map_err(|e| Error::init_failed(name, e.to_string()))?;

        let factory = self
            .catalog
            .get(name)
            .ok_or_else(|| Error::init_failed(name, "no plugin factory registered"))?;

        let mut instance = factory.create();
        let ctx = PluginContext::new(
            name,
            config,
            self.services.clone(),
            self.bus.clone(),
            self.namespaced_store(name),
        );

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.hook_timeout,
            AssertUnwindSafe(instance.initialize(&ctx)).catch_unwind(),
        )
        .await;
        self.observe_hook("initialize", started);

        match outcome {
            Ok(Ok(Ok(()))) => Ok(instance),
            Ok(Ok(Err(e))) => Err(Error::init_failed(name, e.to_string())),
            Ok(Err(_)) => Err(Error::init_failed(name, "initialize panicked")),
            Err(_) => Err(Error::init_failed(
                name,
                format!(
                    "initialize timed out after {}ms",
                    self.config.hook_timeout.as_millis()
                ),
            )),
        }
    }

    /// Attach a loaded plugin's operations and persist its enablement.
    ///
    /// Enabling an enabled plugin succeeds without attaching anything again.
    /// Permission, dependency, attachment, and persistence failures leave the
    /// status unchanged and no routes attached.
    pub async fn enable_plugin(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        let mut record = slot.record.lock().await;
        ensure_present(&record, name)?;

        let status = slot.status();
        if status == PluginStatus::Enabled {
            tracing::debug!(plugin = %name, "plugin already enabled");
            return Ok(());
        }
        if !status.can_enable() {
            return Err(Error::invalid_state("loaded or disabled", status.as_str()));
        }

        let gate = self
            .check_permissions(&slot.manifest)
            .and_then(|()| self.check_dependencies(&slot.manifest));
        if let Err(e) = gate {
            tracing::warn!(plugin = %name, error = %e, "plugin cannot be enabled");
            self.count_transition("failure");
            return Err(e);
        }

        let operations = record
            .instance
            .as_ref()
            .map(|p| p.operations())
            .unwrap_or_default();

        let handles = match self.attachment.attach(name, &operations) {
            Ok(handles) => handles,
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "route attachment failed, plugin not enabled");
                self.count_transition("failure");
                self.emit(LifecycleEvent::Failed {
                    name: name.to_string(),
                    stage: "enable".to_string(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        if let Err(e) = self.enablement.set_enabled(name).await {
            let e = match e {
                Error::Store(_) => e,
                other => Error::store(other.to_string()),
            };
            if let Err(detach) = self.attachment.detach(name) {
                tracing::error!(plugin = %name, error = %detach, "failed to roll back routes");
            }
            tracing::warn!(plugin = %name, error = %e, "enablement not persisted, plugin not enabled");
            self.count_transition("failure");
            self.emit(LifecycleEvent::Failed {
                name: name.to_string(),
                stage: "enable".to_string(),
                message: e.to_string(),
            });
            return Err(e);
        }

        let routes = handles.len();
        record.route_handles = handles;
        {
            let mut state = slot.state.write();
            state.status = PluginStatus::Enabled;
            state.enabled_at = Some(Utc::now());
            state.last_error = None;
        }

        tracing::info!(plugin = %name, routes, "plugin enabled");
        self.count_transition("enable");
        self.emit(LifecycleEvent::Enabled {
            name: name.to_string(),
            routes,
        });
        Ok(())
    }

    /// Detach an enabled plugin's routes and clear its persisted enablement.
    pub async fn disable_plugin(&self, name: &str) -> Result<()> {
        self.disable(name, true).await
    }

    /// Detach an enabled plugin's routes but keep its persisted enablement.
    ///
    /// Used when the host stops, so the plugin is re-enabled on the next start.
    pub async fn deactivate_plugin(&self, name: &str) -> Result<()> {
        self.disable(name, false).await
    }

    async fn disable(&self, name: &str, persist: bool) -> Result<()> {
        let slot = self.slot(name)?;
        let mut record = slot.record.lock().await;
        ensure_present(&record, name)?;

        let status = slot.status();
        if !status.can_disable() {
            return Err(Error::invalid_state("enabled", status.as_str()));
        }

        if let Err(e) = self.attachment.detach(name) {
            record.route_handles.clear();
            return Err(self.fail(&slot, "disable", e));
        }

        record.route_handles.clear();
        {
            let mut state = slot.state.write();
            state.status = PluginStatus::Disabled;
            state.enabled_at = None;
        }

        if persist {
            if let Err(e) = self.enablement.clear_enabled(name).await {
                tracing::warn!(plugin = %name, error = %e, "failed to persist disablement");
            }
        }

        tracing::info!(plugin = %name, "plugin disabled");
        self.count_transition("disable");
        self.emit(LifecycleEvent::Disabled {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Run the shutdown hook and forget the plugin.
    ///
    /// Shutdown failures are logged. Services the plugin registered are removed.
    pub async fn unload_plugin(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        let mut record = slot.record.lock().await;
        ensure_present(&record, name)?;

        let status = slot.status();
        if !status.can_unload() {
            return Err(Error::invalid_state("loaded, disabled or error", status.as_str()));
        }

        let dependents = self.dependents(name);
        if !dependents.is_empty() {
            tracing::warn!(plugin = %name, ?dependents, "unloading a plugin other plugins depend on");
        }

        if let Some(mut instance) = record.instance.take() {
            let started = Instant::now();
            let outcome = tokio::time::timeout(
                self.config.hook_timeout,
                AssertUnwindSafe(instance.shutdown()).catch_unwind(),
            )
            .await;
            self.observe_hook("shutdown", started);

            match outcome {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    tracing::warn!(plugin = %name, error = %e, "plugin shutdown hook failed");
                }
                Ok(Err(_)) => {
                    tracing::warn!(plugin = %name, "plugin shutdown hook panicked");
                }
                Err(_) => {
                    tracing::warn!(plugin = %name, "plugin shutdown hook timed out");
                }
            }
        }

        let removed_services = self.services.unregister_owned_by(name);
        if !removed_services.is_empty() {
            tracing::debug!(plugin = %name, services = ?removed_services, "removed plugin services");
        }

        record.removed = true;
        record.route_handles.clear();
        slot.set_status(PluginStatus::Unloaded);
        self.slots.remove(name);

        tracing::info!(plugin = %name, "plugin unloaded");
        self.count_transition("unload");
        self.emit(LifecycleEvent::Unloaded {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Load and enable every plugin the enablement store lists.
    ///
    /// Identifiers that are no longer discoverable are pruned from the store.
    /// Individual failures are collected in the report, not returned.
    pub async fn reconcile_enabled_from_store(&self) -> Result<ReconcileReport> {
        let stored = self.enablement.get_enabled_plugin_ids().await?;
        self.rediscover();

        let mut report = ReconcileReport::default();
        let (known, stale): (Vec<String>, Vec<String>) = stored
            .into_iter()
            .partition(|id| self.slots.contains_key(id));

        for id in stale {
            match self.enablement.clear_enabled(&id).await {
                Ok(()) => {
                    tracing::info!(plugin = %id, "pruned stale enablement entry");
                    report.pruned += 1;
                }
                Err(e) => {
                    tracing::warn!(plugin = %id, error = %e, "failed to prune stale enablement entry");
                }
            }
        }

        let order = match self.load_order(&known) {
            Ok(order) => order,
            Err(e) => {
                tracing::warn!(error = %e, "cannot order plugins, loading as stored");
                known.clone()
            }
        };

        let wanted: HashSet<&str> = known.iter().map(String::as_str).collect();
        for name in &order {
            let can_load = self.status(name).map_or(false, |s| s.can_load());
            if can_load {
                if let Err(e) = self.load_plugin(name).await {
                    if wanted.contains(name.as_str()) {
                        report.failed.push((name.clone(), e));
                    } else {
                        tracing::warn!(plugin = %name, error = %e, "dependency failed to load");
                    }
                }
            }
        }

        for name in order.iter().filter(|n| wanted.contains(n.as_str())) {
            if report.failed.iter().any(|(failed, _)| failed == name) {
                continue;
            }
            match self.enable_plugin(name).await {
                Ok(()) => report.enabled.push(name.clone()),
                Err(e) => report.failed.push((name.clone(), e)),
            }
        }

        tracing::info!(
            enabled = report.enabled.len(),
            failed = report.failed.len(),
            pruned = report.pruned,
            "reconciled plugin enablement"
        );
        Ok(report)
    }

    /// Order `names` and their known dependencies so dependencies come first.
    pub fn load_order(&self, names: &[String]) -> Result<Vec<String>> {
        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut path = Vec::new();

        for name in names {
            self.visit(name, &mut path, &mut done, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        name: &str,
        path: &mut Vec<String>,
        done: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(pos) = path.iter().position(|p| p == name) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(name.to_string());
            return Err(Error::DependencyCycle(cycle.join(" -> ")));
        }

        let Some(deps) = self
            .slots
            .get(name)
            .map(|s| s.manifest.dependencies.iter().map(|d| d.name.clone()).collect::<Vec<_>>())
        else {
            return Ok(());
        };

        path.push(name.to_string());
        for dep in deps {
            self.visit(&dep, path, done, order)?;
        }
        path.pop();

        done.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }

    /// Load every known plugin that is unloaded or in error, dependencies first.
    pub async fn load_all(&self) -> Result<Vec<(String, Result<()>)>> {
        let order = self.load_order(&self.names())?;

        let mut results = Vec::new();
        for name in order {
            if self.status(&name).map_or(false, |s| s.can_load()) {
                let result = self.load_plugin(&name).await;
                results.push((name, result));
            }
        }
        Ok(results)
    }

    /// Current status of a plugin.
    pub fn status(&self, name: &str) -> Option<PluginStatus> {
        self.slots.get(name).map(|s| s.status())
    }

    /// Snapshot of one plugin.
    pub fn info(&self, name: &str) -> Option<PluginInfo> {
        let slot = self.slots.get(name)?.value().clone();
        Some(self.describe(&slot))
    }

    /// Snapshots of every known plugin, sorted by name.
    pub fn list(&self) -> Vec<PluginInfo> {
        let slots: Vec<Arc<PluginSlot>> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut infos: Vec<PluginInfo> = slots.iter().map(|s| self.describe(s)).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Known plugin names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Plugins in a given status, sorted.
    pub fn by_status(&self, status: PluginStatus) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .iter()
            .filter(|e| e.status() == status)
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Available plugins that declare a dependency on `name`, sorted.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .iter()
            .filter(|e| e.status().is_available())
            .filter(|e| e.manifest.dependencies.iter().any(|d| d.name == name))
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Detach enabled dependents whenever a plugin is unloaded.
    ///
    /// Dependents keep their persisted enablement and their instance; only
    /// their routes go. The handler holds a weak reference to the manager.
    pub fn detach_dependents_on_unload(self: &Arc<Self>) -> SubscriptionId {
        let manager = Arc::downgrade(self);
        self.bus.subscribe_async("plugin.unloaded", move |event: Event| {
            let manager = manager.clone();
            async move {
                let Some(manager) = manager.upgrade() else {
                    return Ok(());
                };
                let Some(LifecycleEvent::Unloaded { name }) = LifecycleEvent::from_event(&event) else {
                    return Ok(());
                };

                for dependent in manager.dependents(&name) {
                    if manager.status(&dependent) != Some(PluginStatus::Enabled) {
                        continue;
                    }
                    tracing::warn!(plugin = %dependent, dependency = %name, "dependency unloaded, detaching routes");
                    if let Err(e) = manager.deactivate_plugin(&dependent).await {
                        tracing::warn!(plugin = %dependent, error = %e, "failed to detach dependent");
                    }
                }
                Ok(())
            }
        })
    }

    /// Data schema a loaded plugin describes.
    pub async fn data_schema(&self, name: &str) -> Result<Option<Value>> {
        let slot = self.slot(name)?;
        let record = slot.record.lock().await;
        ensure_present(&record, name)?;
        Ok(record.instance.as_ref().and_then(|p| p.data_schema()))
    }

    /// Plugin counts by status.
    pub fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats::default();
        for entry in self.slots.iter() {
            stats.total += 1;
            match entry.status() {
                PluginStatus::Unloaded | PluginStatus::Loading => stats.unloaded += 1,
                PluginStatus::Loaded => stats.loaded += 1,
                PluginStatus::Enabled => stats.enabled += 1,
                PluginStatus::Disabled => stats.disabled += 1,
                PluginStatus::Error => stats.error += 1,
            }
        }
        stats
    }

    fn slot(&self, name: &str) -> Result<Arc<PluginSlot>> {
        self.slots
            .get(name)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::plugin_not_found(name))
    }

    fn describe(&self, slot: &PluginSlot) -> PluginInfo {
        let state = slot.state.read().clone();
        let manifest = &slot.manifest;
        PluginInfo {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            category: manifest.category.clone(),
            status: state.status,
            dependencies: manifest.dependencies.iter().map(|d| d.name.clone()).collect(),
            permissions: manifest.permissions.iter().cloned().collect(),
            routes: self.attachment.list_handles(&manifest.name).len(),
            dir: slot.dir.clone(),
            loaded_at: state.loaded_at,
            enabled_at: state.enabled_at,
            last_error: state.last_error,
        }
    }

    fn check_permissions(&self, manifest: &PluginManifest) -> Result<()> {
        match manifest
            .permissions
            .iter()
            .find(|p| !self.config.granted_permissions.contains(*p))
        {
            Some(denied) => Err(Error::permission_denied(&manifest.name, denied)),
            None => Ok(()),
        }
    }

    /// Every required dependency must be loaded or enabled at a matching version.
    fn check_dependencies(&self, manifest: &PluginManifest) -> Result<()> {
        for dep in &manifest.dependencies {
            let requirement = dep.requirement()?;
            let available = self.slots.get(&dep.name).map_or(false, |slot| {
                slot.status().is_available()
                    && parse_version(&slot.manifest.version)
                        .map_or(false, |v| requirement.matches(&v))
            });

            if available {
                continue;
            }
            if dep.optional {
                tracing::debug!(plugin = %manifest.name, dependency = %dep.name, "optional dependency unavailable");
                continue;
            }
            return Err(Error::dependency_missing(&manifest.name, &dep.name, &dep.version));
        }
        Ok(())
    }

    fn fail(&self, slot: &PluginSlot, stage: &str, error: Error) -> Error {
        let name = slot.manifest.name.clone();
        {
            let mut state = slot.state.write();
            state.status = PluginStatus::Error;
            state.last_error = Some(error.to_string());
        }

        tracing::error!(plugin = %name, stage, error = %error, "plugin lifecycle step failed");
        self.count_transition("failure");
        self.emit(LifecycleEvent::Failed {
            name,
            stage: stage.to_string(),
            message: error.to_string(),
        });
        error
    }

    fn emit(&self, event: LifecycleEvent) {
        if let Err(e) = self.bus.publish_event(event.to_event()) {
            tracing::debug!(error = %e, "lifecycle event not published");
        }
    }

    #[cfg(feature = "metrics-prometheus")]
    fn count_transition(&self, kind: &str) {
        let Some(ref metrics) = self.metrics else {
            return;
        };
        let transition = match kind {
            "load" => Transition::Load,
            "enable" => Transition::Enable,
            "disable" => Transition::Disable,
            "unload" => Transition::Unload,
            _ => Transition::Failure,
        };
        metrics.record(transition);
        metrics.record_bus_stats(&self.bus.stats());
    }

    #[cfg(not(feature = "metrics-prometheus"))]
    fn count_transition(&self, _kind: &str) {}

    #[cfg(feature = "metrics-prometheus")]
    fn observe_hook(&self, hook: &str, started: Instant) {
        if let Some(ref metrics) = self.metrics {
            metrics.observe_hook(hook, started.elapsed().as_secs_f64());
        }
    }

    #[cfg(not(feature = "metrics-prometheus"))]
    fn observe_hook(&self, hook: &str, started: Instant) {
        tracing::trace!(hook, elapsed_ms = started.elapsed().as_millis() as u64, "plugin hook finished");
    }
}

fn ensure_present(record: &PluginRecord, name: &str) -> Result<()> {
    if record.removed {
        return Err(Error::plugin_not_found(name));
    }
    Ok(())
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("config", &self.config)
            .field("plugins", &self.names())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hot_reload::AttachConfig;
    use crate::manifest::{Dependency, ManifestBuilder};
    use crate::plugin::Operation;
    use crate::router::{handler_fn, InMemoryRouter};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Pinger {
        fail_init: bool,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Plugin for Pinger {
        async fn initialize(&mut self, ctx: &PluginContext) -> Result<()> {
            if self.fail_init {
                return Err(Error::Handler("pinger refused to start".into()));
            }
            ctx.register_service(format!("{}.ping", ctx.plugin_name()), Arc::new(1u32));
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn operations(&self) -> Vec<Operation> {
            vec![Operation::get("/ping", handler_fn(|_| async { Ok(json!("pong")) }))]
        }

        fn data_schema(&self) -> Option<Value> {
            Some(json!({ "type": "object" }))
        }
    }

    fn manifest(name: &str) -> ManifestBuilder {
        ManifestBuilder::new(name, "1.0.0").author("tests").category("utility")
    }

    fn manager_with(config: ManagerConfig, manifests: Vec<(PluginManifest, bool)>) -> (PluginManager, Arc<AtomicUsize>) {
        let catalog = Arc::new(PluginCatalog::new());
        let shutdowns = Arc::new(AtomicUsize::new(0));
        for (m, fail_init) in manifests {
            let counter = shutdowns.clone();
            catalog.register_fn(m, move || {
                Box::new(Pinger {
                    fail_init,
                    shutdowns: counter.clone(),
                })
            });
        }

        (manager_from(config, catalog), shutdowns)
    }

    fn manager_from(config: ManagerConfig, catalog: Arc<PluginCatalog>) -> PluginManager {
        let router = Arc::new(InMemoryRouter::default());
        let attachment = Arc::new(RouteAttachment::new(AttachConfig::default(), router));
        let manager = PluginManager::new(config, catalog.clone(), attachment);
        for name in catalog.names() {
            if let Some(m) = catalog.manifest(&name) {
                manager.register_manifest(m).unwrap();
            }
        }
        manager
    }

    struct Sleeper {
        delay: Duration,
    }

    #[async_trait]
    impl Plugin for Sleeper {
        async fn initialize(&mut self, _ctx: &PluginContext) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    struct ReadOnlyStore;

    #[async_trait]
    impl EnablementStore for ReadOnlyStore {
        async fn get_enabled_plugin_ids(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn set_enabled(&self, _id: &str) -> Result<()> {
            Err(Error::store("disk full"))
        }

        async fn clear_enabled(&self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (manager, shutdowns) = manager_with(
            ManagerConfig::default(),
            vec![(manifest("echo").build_unchecked(), false)],
        );
        assert_eq!(manager.status("echo"), Some(PluginStatus::Unloaded));

        manager.load_plugin("echo").await.unwrap();
        assert_eq!(manager.status("echo"), Some(PluginStatus::Loaded));
        assert!(manager.services().has("echo.ping"));
        assert!(manager.data_schema("echo").await.unwrap().is_some());

        manager.enable_plugin("echo").await.unwrap();
        let info = manager.info("echo").unwrap();
        assert_eq!(info.status, PluginStatus::Enabled);
        assert_eq!(info.routes, 1);
        assert!(info.enabled_at.is_some());

        let err = manager.unload_plugin("echo").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        manager.disable_plugin("echo").await.unwrap();
        assert_eq!(manager.info("echo").unwrap().routes, 0);

        manager.unload_plugin("echo").await.unwrap();
        assert_eq!(manager.status("echo"), None);
        assert!(!manager.services().has("echo.ping"));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_init_failure_moves_to_error_and_retries() {
        let (manager, _) = manager_with(
            ManagerConfig::default(),
            vec![(manifest("flaky").build_unchecked(), true)],
        );

        let err = manager.load_plugin("flaky").await.unwrap_err();
        assert!(matches!(err, Error::PluginInitialization { .. }));
        let info = manager.info("flaky").unwrap();
        assert_eq!(info.status, PluginStatus::Error);
        assert!(info.last_error.unwrap().contains("refused"));

        // Error is a valid starting point for another attempt.
        let err = manager.load_plugin("flaky").await.unwrap_err();
        assert!(matches!(err, Error::PluginInitialization { .. }));
        manager.unload_plugin("flaky").await.unwrap();
    }

    #[tokio::test]
    async fn test_permission_denied_keeps_status() {
        let (manager, _) = manager_with(
            ManagerConfig::default().with_permission("db:read"),
            vec![(
                manifest("admin")
                    .permission("db:read")
                    .permission("db:write")
                    .build_unchecked(),
                false,
            )],
        );

        manager.load_plugin("admin").await.unwrap();
        let err = manager.enable_plugin("admin").await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { ref permission, .. } if permission == "db:write"));
        assert!(err.leaves_state_unchanged());
        assert_eq!(manager.status("admin"), Some(PluginStatus::Loaded));
        assert!(!manager.attachment().is_attached("admin"));
    }

    #[tokio::test]
    async fn test_dependency_version_mismatch() {
        let (manager, _) = manager_with(
            ManagerConfig::default(),
            vec![
                (manifest("ledger").build_unchecked(), false),
                (
                    manifest("billing")
                        .dependency(Dependency::required("ledger", "^2.0"))
                        .build_unchecked(),
                    false,
                ),
            ],
        );

        manager.load_plugin("ledger").await.unwrap();
        let err = manager.load_plugin("billing").await.unwrap_err();
        assert!(matches!(err, Error::DependencyMissing { ref requirement, .. } if requirement == "^2.0"));
        assert_eq!(manager.status("billing"), Some(PluginStatus::Error));
    }

    #[tokio::test]
    async fn test_optional_dependency_is_skipped() {
        let (manager, _) = manager_with(
            ManagerConfig::default(),
            vec![(
                manifest("chat")
                    .dependency(Dependency::optional("emoji", "*"))
                    .build_unchecked(),
                false,
            )],
        );

        manager.load_plugin("chat").await.unwrap();
        assert_eq!(manager.status("chat"), Some(PluginStatus::Loaded));
    }

    #[tokio::test]
    async fn test_load_order_and_cycles() {
        let (manager, _) = manager_with(
            ManagerConfig::default(),
            vec![
                (
                    manifest("app")
                        .dependency(Dependency::required("auth", "*"))
                        .dependency(Dependency::required("storage", "*"))
                        .build_unchecked(),
                    false,
                ),
                (
                    manifest("auth")
                        .dependency(Dependency::required("storage", "*"))
                        .build_unchecked(),
                    false,
                ),
                (manifest("storage").build_unchecked(), false),
            ],
        );

        let order = manager.load_order(&["app".to_string()]).unwrap();
        assert_eq!(order, vec!["storage", "auth", "app"]);

        let results = manager.load_all().await.unwrap();
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(manager.stats().loaded, 3);

        let (cyclic, _) = manager_with(
            ManagerConfig::default(),
            vec![
                (
                    manifest("a").dependency(Dependency::required("b", "*")).build_unchecked(),
                    false,
                ),
                (
                    manifest("b").dependency(Dependency::required("a", "*")).build_unchecked(),
                    false,
                ),
            ],
        );
        let err = cyclic.load_order(&["a".to_string()]).unwrap_err();
        assert!(matches!(err, Error::DependencyCycle(ref path) if path == "a -> b -> a"));
    }

    #[tokio::test]
    async fn test_config_schema_is_applied() {
        use crate::manifest::{ConfigField, FieldType};

        let field = ConfigField {
            field_type: FieldType::Integer,
            required: true,
            default: None,
            description: None,
        };
        let m = manifest("quota").config_field("limit", field).build_unchecked();

        let (missing, _) = manager_with(ManagerConfig::default(), vec![(m.clone(), false)]);
        assert!(missing.load_plugin("quota").await.is_err());
        assert_eq!(missing.status("quota"), Some(PluginStatus::Error));

        let (configured, _) = manager_with(
            ManagerConfig::default().with_plugin_config("quota", json!({ "limit": 5 })),
            vec![(m, false)],
        );
        configured.load_plugin("quota").await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_published() {
        let (manager, _) = manager_with(
            ManagerConfig::default(),
            vec![(manifest("echo").build_unchecked(), false)],
        );
        manager.load_plugin("echo").await.unwrap();
        manager.enable_plugin("echo").await.unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for name in ["plugin.discovered", "plugin.loaded", "plugin.enabled"] {
            let sink = seen.clone();
            manager.events().subscribe_fn(name, move |e| -> Result<()> {
                sink.lock().push(LifecycleEvent::from_event(e));
                Ok(())
            });
        }
        manager.events().run_until_idle().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen.contains(&Some(LifecycleEvent::Enabled {
            name: "echo".into(),
            routes: 1
        })));
    }

    #[tokio::test]
    async fn test_unknown_plugin() {
        let (manager, _) = manager_with(ManagerConfig::default(), vec![]);
        let err = manager.enable_plugin("nope").await.unwrap_err();
        assert!(matches!(err, Error::PluginNotFound(_)));
        assert!(manager.info("nope").is_none());
    }

    #[tokio::test]
    async fn test_failed_persistence_rolls_back_enable() {
        use crate::router::RouteTable;

        let (manager, _) = manager_with(
            ManagerConfig::default(),
            vec![(manifest("echo").build_unchecked(), false)],
        );
        let manager = manager.with_enablement_store(Arc::new(ReadOnlyStore));

        manager.load_plugin("echo").await.unwrap();
        let err = manager.enable_plugin("echo").await.unwrap_err();

        assert!(matches!(err, Error::Store(ref msg) if msg.contains("disk full")));
        assert!(err.leaves_state_unchanged());
        assert_eq!(manager.status("echo"), Some(PluginStatus::Loaded));
        assert!(!manager.attachment().is_attached("echo"));
        assert!(manager.attachment().router().routes().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_timeout_moves_to_error() {
        let catalog = Arc::new(PluginCatalog::new());
        catalog.register_fn(manifest("stuck").build_unchecked(), || {
            Box::new(Sleeper {
                delay: Duration::from_secs(30),
            })
        });
        let manager = manager_from(
            ManagerConfig::default().with_hook_timeout(Duration::from_millis(50)),
            catalog,
        );

        let started = Instant::now();
        let err = manager.load_plugin("stuck").await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, Error::PluginInitialization { ref reason, .. } if reason.contains("timed out")));
        assert_eq!(manager.status("stuck"), Some(PluginStatus::Error));
    }

    #[tokio::test]
    async fn test_concurrent_enables_attach_once() {
        let (manager, _) = manager_with(
            ManagerConfig::default(),
            vec![(manifest("echo").build_unchecked(), false)],
        );
        manager.load_plugin("echo").await.unwrap();

        let (first, second) = tokio::join!(
            manager.enable_plugin("echo"),
            manager.enable_plugin("echo")
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(manager.attachment().list_handles("echo").len(), 1);
        assert_eq!(manager.info("echo").unwrap().routes, 1);
    }

    #[tokio::test]
    async fn test_slow_plugin_does_not_block_others() {
        let catalog = Arc::new(PluginCatalog::new());
        catalog.register_fn(manifest("slow").build_unchecked(), || {
            Box::new(Sleeper {
                delay: Duration::from_millis(300),
            })
        });
        catalog.register_fn(manifest("fast").build_unchecked(), || {
            Box::new(Sleeper {
                delay: Duration::ZERO,
            })
        });
        let manager = manager_from(ManagerConfig::default(), catalog);

        let (slow, (fast, elapsed, slow_status)) = tokio::join!(manager.load_plugin("slow"), async {
            let started = Instant::now();
            let result = manager.load_plugin("fast").await;
            (result, started.elapsed(), manager.status("slow"))
        });

        fast.unwrap();
        assert!(elapsed < Duration::from_millis(200));
        assert_eq!(slow_status, Some(PluginStatus::Loading));
        slow.unwrap();
        assert_eq!(manager.status("slow"), Some(PluginStatus::Loaded));
    }

    #[tokio::test]
    async fn test_unloading_dependency_detaches_dependents() {
        let (manager, _) = manager_with(
            ManagerConfig::default(),
            vec![
                (manifest("ledger").build_unchecked(), false),
                (
                    manifest("billing")
                        .dependency(Dependency::required("ledger", "^1.0"))
                        .build_unchecked(),
                    false,
                ),
            ],
        );
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(manager.with_enablement_store(store.clone()));
        manager.detach_dependents_on_unload();

        for name in ["ledger", "billing"] {
            manager.load_plugin(name).await.unwrap();
        }
        manager.enable_plugin("billing").await.unwrap();
        manager.events().run_until_idle().await;

        manager.unload_plugin("ledger").await.unwrap();
        manager.events().run_until_idle().await;

        assert_eq!(manager.status("billing"), Some(PluginStatus::Disabled));
        assert!(!manager.attachment().is_attached("billing"));
        assert_eq!(store.get_enabled_plugin_ids().await.unwrap(), vec!["billing".to_string()]);
    }
}
