//! File system watcher that announces plugin tree changes on the event bus.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde_json::json;

use crate::error::{Error, Result};
use crate::events::{self, EventBus, EventPriority};
use crate::runtime::FILES_CHANGED_EVENT;

/// Configuration for the plugin watcher.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Minimum interval between two notifications for the same path.
    pub debounce: Duration,
    /// Whether to watch recursively.
    pub recursive: bool,
    /// File extensions that trigger a notification.
    pub extensions: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            recursive: true,
            extensions: vec!["toml".to_string(), "json".to_string()],
        }
    }
}

impl WatchConfig {
    /// Create a new watch configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the debounce duration.
    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Set recursive watching.
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Set file extensions to watch.
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }
}

/// A change to a watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file was created.
    Created {
        /// Path to the created file.
        path: PathBuf,
    },
    /// A file was modified.
    Modified {
        /// Path to the modified file.
        path: PathBuf,
    },
    /// A file was removed.
    Removed {
        /// Path to the removed file.
        path: PathBuf,
    },
    /// A file was renamed.
    Renamed {
        /// Old path.
        from: PathBuf,
        /// New path.
        to: PathBuf,
    },
}

impl WatchEvent {
    /// Get the primary path for this event.
    pub fn path(&self) -> &Path {
        match self {
            Self::Created { path } | Self::Modified { path } | Self::Removed { path } => path,
            Self::Renamed { to, .. } => to,
        }
    }

    /// Short name of the change.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Modified { .. } => "modified",
            Self::Removed { .. } => "removed",
            Self::Renamed { .. } => "renamed",
        }
    }

    /// Check if this event affects a file with one of the given extensions.
    pub fn matches_extension(&self, extensions: &[String]) -> bool {
        self.path()
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |ext| extensions.iter().any(|e| e == ext))
    }

    /// Bus event announcing this change.
    pub fn to_event(&self) -> events::Event {
        let data = events::event_data([
            ("kind", json!(self.kind())),
            ("path", json!(self.path().display().to_string())),
        ]);
        events::Event::new(FILES_CHANGED_EVENT, data)
            .with_priority(EventPriority::Low)
            .with_source("plugin-watcher")
    }

    fn from_notify(event: &Event) -> Option<Self> {
        let first = event.paths.first()?.clone();
        match event.kind {
            EventKind::Create(_) => Some(Self::Created { path: first }),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let to = event.paths.get(1)?.clone();
                Some(Self::Renamed { from: first, to })
            }
            EventKind::Modify(_) => Some(Self::Modified { path: first }),
            EventKind::Remove(_) => Some(Self::Removed { path: first }),
            _ => None,
        }
    }
}

type ChangeHandler = Box<dyn Fn(&WatchEvent) + Send + Sync>;

struct WatchState {
    last_events: HashMap<PathBuf, Instant>,
    handlers: Vec<ChangeHandler>,
}

/// Watches plugin directories and forwards manifest changes.
pub struct PluginWatcher {
    config: WatchConfig,
    watcher: Mutex<Option<RecommendedWatcher>>,
    watched_paths: RwLock<Vec<PathBuf>>,
    state: Arc<RwLock<WatchState>>,
    running: Arc<AtomicBool>,
}

impl PluginWatcher {
    /// Create a new plugin watcher.
    pub fn new(config: WatchConfig) -> Self {
        Self {
            config,
            watcher: Mutex::new(None),
            watched_paths: RwLock::new(Vec::new()),
            state: Arc::new(RwLock::new(WatchState {
                last_events: HashMap::new(),
                handlers: Vec::new(),
            })),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create with default configuration.
    pub fn default_config() -> Self {
        Self::new(WatchConfig::default())
    }

    /// Get the watcher configuration.
    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Check if the watcher is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Add a change handler.
    pub fn on_change<F>(&self, handler: F)
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        self.state.write().handlers.push(Box::new(handler));
    }

    /// Publish every change on `bus` as a `plugin.files.changed` event.
    pub fn forward_to(&self, bus: EventBus) {
        self.on_change(move |change| {
            if let Err(e) = bus.publish_event(change.to_event()) {
                tracing::debug!(error = %e, "file change not forwarded");
            }
        });
    }

    /// Start watching every registered path.
    pub fn start(&self) -> Result<()> {
        if self.running.load(Ordering::Relaxed) {
            return Ok(());
        }

        let state = self.state.clone();
        let config = self.config.clone();
        let running = self.running.clone();

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                match res {
                    Ok(event) => Self::handle_event(&state, &config, &event),
                    Err(e) => tracing::warn!(error = %e, "watch error"),
                }
            },
            Config::default(),
        )
        .map_err(|e| Error::Watch(e.to_string()))?;

        *self.watcher.lock() = Some(watcher);
        self.running.store(true, Ordering::Relaxed);

        for path in self.watched_paths.read().iter() {
            self.watch_path_internal(path)?;
        }

        tracing::info!("plugin watcher started");
        Ok(())
    }

    /// Stop watching.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if self.watcher.lock().take().is_some() {
            tracing::info!("plugin watcher stopped");
        }
    }

    /// Watch a path.
    pub fn watch(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();

        {
            let mut paths = self.watched_paths.write();
            if !paths.contains(&path) {
                paths.push(path.clone());
            }
        }

        if self.is_running() {
            self.watch_path_internal(&path)?;
        }
        Ok(())
    }

    /// Stop watching a path.
    pub fn unwatch(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.watched_paths.write().retain(|p| p != path);

        if let Some(ref mut watcher) = *self.watcher.lock() {
            watcher
                .unwatch(path)
                .map_err(|e| Error::Watch(e.to_string()))?;
        }
        Ok(())
    }

    /// Get watched paths.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.watched_paths.read().clone()
    }

    fn watch_path_internal(&self, path: &Path) -> Result<()> {
        let mode = if self.config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        if let Some(ref mut watcher) = *self.watcher.lock() {
            watcher
                .watch(path, mode)
                .map_err(|e| Error::Watch(format!("{}: {}", path.display(), e)))?;
            tracing::debug!(path = %path.display(), "watching path");
        }
        Ok(())
    }

    fn handle_event(state: &RwLock<WatchState>, config: &WatchConfig, event: &Event) {
        let Some(change) = WatchEvent::from_notify(event) else {
            return;
        };
        if !change.matches_extension(&config.extensions) {
            return;
        }

        let path = change.path().to_path_buf();
        let mut state = state.write();
        let now = Instant::now();

        if let Some(last) = state.last_events.get(&path) {
            if now.duration_since(*last) < config.debounce {
                return;
            }
        }
        state.last_events.insert(path, now);

        for handler in &state.handlers {
            handler(&change);
        }
    }
}

impl std::fmt::Debug for PluginWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginWatcher")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("watched_paths", &self.watched_paths.read().len())
            .finish()
    }
}

impl Drop for PluginWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
