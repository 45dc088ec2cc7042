//! Error types for plugin host operations.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while discovering, loading, or running plugins.
#[derive(Error, Debug)]
pub enum Error {
    /// Manifest is malformed or incomplete.
    #[error("invalid manifest: {0}")]
    ManifestValidation(String),

    /// Manifest could not be parsed.
    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    /// A required dependency is absent, not loaded, or at the wrong version.
    #[error("plugin {plugin} requires {dependency} ({requirement}), which is not available")]
    DependencyMissing {
        /// Plugin that declared the dependency.
        plugin: String,
        /// Dependency name.
        dependency: String,
        /// Version constraint.
        requirement: String,
    },

    /// Plugins depend on each other in a loop.
    #[error("dependency cycle detected involving: {0}")]
    DependencyCycle(String),

    /// Plugin requests a capability the host has not granted.
    #[error("plugin {plugin} requests permission {permission}, which is not granted")]
    PermissionDenied {
        /// Plugin requesting the permission.
        plugin: String,
        /// Permission that was denied.
        permission: String,
    },

    /// Plugin's own initialization failed.
    #[error("plugin {plugin} failed to initialize: {reason}")]
    PluginInitialization {
        /// Plugin name.
        plugin: String,
        /// Failure reason.
        reason: String,
    },

    /// Attaching routes failed; everything inserted was rolled back.
    #[error("route registration failed for {plugin}: {reason}")]
    RouteRegistration {
        /// Plugin name.
        plugin: String,
        /// Failure reason.
        reason: String,
    },

    /// Plugin not found.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// No live route matches the request.
    #[error("no route for {method} {path}")]
    RouteNotFound {
        /// Request method.
        method: String,
        /// Request path.
        path: String,
    },

    /// A route handler failed while serving a request.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Plugin is in the wrong state for the requested transition.
    #[error("invalid plugin state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state(s).
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// Event bus no longer accepts events.
    #[error("event bus is shut down, rejected event: {0}")]
    EventBusClosed(String),

    /// Event bus loop is already running.
    #[error("event bus is already running")]
    EventBusRunning,

    /// Enablement or key-value store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Host configuration could not be read.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unknown admin command.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Watch error.
    #[cfg(feature = "watch")]
    #[error("watch error: {0}")]
    Watch(String),

    /// Metrics registration error.
    #[cfg(feature = "metrics-prometheus")]
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl Error {
    /// Create a manifest validation error.
    pub fn invalid_manifest(msg: impl Into<String>) -> Self {
        Self::ManifestValidation(msg.into())
    }

    /// Create a missing manifest field error.
    pub fn missing_field(field: &str) -> Self {
        Self::ManifestValidation(format!("missing required field: {}", field))
    }

    /// Create a plugin not found error.
    pub fn plugin_not_found(name: impl Into<String>) -> Self {
        Self::PluginNotFound(name.into())
    }

    /// Create a dependency missing error.
    pub fn dependency_missing(
        plugin: impl Into<String>,
        dependency: impl Into<String>,
        requirement: impl Into<String>,
    ) -> Self {
        Self::DependencyMissing {
            plugin: plugin.into(),
            dependency: dependency.into(),
            requirement: requirement.into(),
        }
    }

    /// Create a permission denied error.
    pub fn permission_denied(plugin: impl Into<String>, permission: impl Into<String>) -> Self {
        Self::PermissionDenied {
            plugin: plugin.into(),
            permission: permission.into(),
        }
    }

    /// Create an initialization failed error.
    pub fn init_failed(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PluginInitialization {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Create a route registration error.
    pub fn route_registration(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RouteRegistration {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a store error.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Returns true if retrying later may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DependencyMissing { .. }
                | Self::InvalidState { .. }
                | Self::Store(_)
        )
    }

    /// Returns true if the failed operation left the plugin in its prior state.
    pub fn leaves_state_unchanged(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. }
                | Self::RouteRegistration { .. }
                | Self::InvalidState { .. }
                | Self::PluginNotFound(_)
                | Self::Store(_)
        )
    }
}
