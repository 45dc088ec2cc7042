//! Plugin lifecycle states and the events emitted on transitions.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::events::{Event, EventPriority};

/// Source identifier set on lifecycle events.
pub const LIFECYCLE_SOURCE: &str = "plugin-manager";

/// Plugin lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    /// Discovered but not instantiated.
    Unloaded,
    /// Dependencies are being resolved and the plugin initialized.
    Loading,
    /// Initialized, with no routes attached.
    Loaded,
    /// Routes attached and serving.
    Enabled,
    /// Routes detached after having been enabled.
    Disabled,
    /// A lifecycle step failed; see the recorded error.
    Error,
}

impl PluginStatus {
    /// Check if `load_plugin` may start from this status.
    pub fn can_load(&self) -> bool {
        matches!(self, Self::Unloaded | Self::Error)
    }

    /// Check if `enable_plugin` may start from this status.
    pub fn can_enable(&self) -> bool {
        matches!(self, Self::Loaded | Self::Disabled)
    }

    /// Check if `disable_plugin` may start from this status.
    pub fn can_disable(&self) -> bool {
        matches!(self, Self::Enabled)
    }

    /// Check if `unload_plugin` may start from this status.
    pub fn can_unload(&self) -> bool {
        matches!(self, Self::Loaded | Self::Disabled | Self::Error)
    }

    /// Check if the plugin is instantiated and can satisfy dependencies.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Loaded | Self::Enabled)
    }

    /// Lower-case status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle transition, published on the event bus by the plugin manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Manifest was discovered.
    Discovered {
        /// Plugin name.
        name: String,
        /// Plugin version.
        version: String,
    },
    /// Plugin was initialized.
    Loaded {
        /// Plugin name.
        name: String,
    },
    /// Plugin routes were attached.
    Enabled {
        /// Plugin name.
        name: String,
        /// Number of attached routes.
        routes: usize,
    },
    /// Plugin routes were detached.
    Disabled {
        /// Plugin name.
        name: String,
    },
    /// Plugin was removed.
    Unloaded {
        /// Plugin name.
        name: String,
    },
    /// A lifecycle step failed.
    Failed {
        /// Plugin name.
        name: String,
        /// Operation that failed.
        stage: String,
        /// Error message.
        message: String,
    },
}

impl LifecycleEvent {
    /// Get the plugin name.
    pub fn plugin_name(&self) -> &str {
        match self {
            Self::Discovered { name, .. }
            | Self::Loaded { name }
            | Self::Enabled { name, .. }
            | Self::Disabled { name }
            | Self::Unloaded { name }
            | Self::Failed { name, .. } => name,
        }
    }

    /// Bus event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Discovered { .. } => "plugin.discovered",
            Self::Loaded { .. } => "plugin.loaded",
            Self::Enabled { .. } => "plugin.enabled",
            Self::Disabled { .. } => "plugin.disabled",
            Self::Unloaded { .. } => "plugin.unloaded",
            Self::Failed { .. } => "plugin.failed",
        }
    }

    /// Convert into a bus event.
    pub fn to_event(&self) -> Event {
        let mut data = Map::new();
        data.insert("plugin".into(), json!(self.plugin_name()));

        let priority = match self {
            Self::Discovered { version, .. } => {
                data.insert("version".into(), json!(version));
                EventPriority::Low
            }
            Self::Enabled { routes, .. } => {
                data.insert("routes".into(), json!(routes));
                EventPriority::Normal
            }
            Self::Failed { stage, message, .. } => {
                data.insert("stage".into(), json!(stage));
                data.insert("message".into(), json!(message));
                EventPriority::High
            }
            _ => EventPriority::Normal,
        };

        Event::new(self.event_name(), data)
            .with_priority(priority)
            .with_source(LIFECYCLE_SOURCE)
    }

    /// Recover a lifecycle event from a bus event.
    pub fn from_event(event: &Event) -> Option<Self> {
        let name = event.get_str("plugin")?.to_string();
        let text = |key: &str| event.get_str(key).unwrap_or_default().to_string();

        Some(match event.name.as_str() {
            "plugin.discovered" => Self::Discovered {
                name,
                version: text("version"),
            },
            "plugin.loaded" => Self::Loaded { name },
            "plugin.enabled" => Self::Enabled {
                name,
                routes: event.get("routes").and_then(Value::as_u64).unwrap_or(0) as usize,
            },
            "plugin.disabled" => Self::Disabled { name },
            "plugin.unloaded" => Self::Unloaded { name },
            "plugin.failed" => Self::Failed {
                name,
                stage: text("stage"),
                message: text("message"),
            },
            _ => return None,
        })
    }
}
