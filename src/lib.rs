//! # plugin-host
//!
//! Plugin host runtime: manifest discovery, dependency-aware lifecycle
//! management, a priority event bus, a service registry, and hot
//! attachment of plugin routes to a running router.
//!
//! This crate provides:
//! - **Discovery** - Scan `<root>/<category>/<plugin>/` for `plugin.toml` or `plugin.json`
//! - **Lifecycle** - Load, enable, disable, and unload plugins with dependency and permission checks
//! - **Event Bus** - Priority-ordered asynchronous publish/subscribe
//! - **Services** - Typed service registry with interface lookup
//! - **Route Attachment** - Mount and unmount plugin routes without a restart
//! - **Persistence** - Enabled plugins survive restarts via an enablement store
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use plugin_host::{HostConfig, HttpMethod, PluginCatalog, PluginHost};
//! use serde_json::Value;
//! use std::sync::Arc;
//!
//! # async fn run() -> plugin_host::Result<()> {
//! let catalog = Arc::new(PluginCatalog::new());
//! // catalog.register_fn(manifest, || Box::new(MyPlugin::default()));
//!
//! let host = PluginHost::new(HostConfig::from_file("host.toml")?, catalog).await?;
//! let report = host.start().await?;
//! println!("enabled: {:?}", report.enabled);
//!
//! let response = host.dispatch(HttpMethod::Get, "/api/plugins/tasks/list", Value::Null).await?;
//! println!("{}", response);
//! host.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `watch`: Forward plugin tree changes to the event bus and rediscover
//! - `metrics-prometheus`: Prometheus metrics for lifecycle transitions and hooks

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod admin;
mod discovery;
mod error;
mod events;
mod hot_reload;
mod lifecycle;
mod manager;
mod manifest;
mod plugin;
mod router;
mod runtime;
mod services;
mod store;

#[cfg(feature = "watch")]
mod watcher;

#[cfg(feature = "metrics-prometheus")]
mod metrics;

pub use admin::{AdminCommand, AdminOutput};
pub use discovery::{
    discover, DiscoveredPlugin, Discovery, DiscoveryConfig, ManifestSource, DEFAULT_MANIFEST_FILES,
};
pub use error::{Error, Result};
pub use events::{
    event_data, BusConfig, BusStats, Event, EventBus, EventHandler, EventPriority, SubscriptionId,
};
pub use hot_reload::{AttachConfig, RouteAttachment, RouteHandle, DEFAULT_ROUTE_PREFIX};
pub use lifecycle::{LifecycleEvent, PluginStatus, LIFECYCLE_SOURCE};
pub use manager::{ManagerConfig, ManagerStats, PluginInfo, PluginManager, ReconcileReport};
pub use manifest::{
    parse_requirement, parse_version, ConfigField, ConfigSchema, Dependency, FieldType,
    ManifestBuilder, PluginManifest, Version, VersionReq, ALLOWED_CATEGORIES,
};
pub use plugin::{Operation, Plugin, PluginCatalog, PluginContext, PluginFactory};
pub use router::{
    handler_fn, HttpMethod, InMemoryRouter, RouteHandler, RouteId, RouteInfo, RouteMetadata,
    RouteRequest, RouteTable,
};
pub use runtime::{HostConfig, PluginHost, FILES_CHANGED_EVENT};
pub use services::{InterfaceId, ServiceInfo, ServiceRegistry};
pub use store::{EnablementStore, FileStore, KeyValueStore, MemoryStore, NamespacedStore};

#[cfg(feature = "watch")]
pub use watcher::{PluginWatcher, WatchConfig, WatchEvent};

#[cfg(feature = "metrics-prometheus")]
pub use metrics::{MetricsConfig, PluginMetrics, Transition};

/// Crate version for compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
