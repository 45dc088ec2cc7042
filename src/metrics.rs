//! Prometheus metrics for plugin lifecycle and event bus activity.

use prometheus::{Counter, HistogramOpts, HistogramVec, IntGauge, Registry};

use crate::error::{Error, Result};
use crate::events::BusStats;

/// Configuration for plugin metrics collection.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric prefix for all plugin metrics.
    pub prefix: String,
    /// Histogram buckets for hook durations, in seconds.
    pub hook_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "plugin_host".to_string(),
            hook_buckets: vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0],
        }
    }
}

impl MetricsConfig {
    /// Create a new metrics configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metric prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the hook duration buckets.
    pub fn with_hook_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.hook_buckets = buckets;
        self
    }
}

/// Lifecycle transition counted by [`PluginMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Plugin loaded.
    Load,
    /// Plugin enabled.
    Enable,
    /// Plugin disabled.
    Disable,
    /// Plugin unloaded.
    Unload,
    /// A lifecycle step failed.
    Failure,
}

/// Plugin metrics collector.
pub struct PluginMetrics {
    config: MetricsConfig,
    registry: Registry,
    loads: Counter,
    enables: Counter,
    disables: Counter,
    unloads: Counter,
    failures: Counter,
    hook_duration: HistogramVec,
    bus_published: IntGauge,
    bus_handler_failures: IntGauge,
    bus_rejected: IntGauge,
}

fn metric_err(e: prometheus::Error) -> Error {
    Error::Metrics(e.to_string())
}

impl PluginMetrics {
    /// Create a collector and register every metric in a fresh registry.
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> Result<Counter> {
            let c = Counter::new(format!("{}_{}", config.prefix, name), help).map_err(metric_err)?;
            registry.register(Box::new(c.clone())).map_err(metric_err)?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let g = IntGauge::new(format!("{}_{}", config.prefix, name), help).map_err(metric_err)?;
            registry.register(Box::new(g.clone())).map_err(metric_err)?;
            Ok(g)
        };

        let loads = counter("loads_total", "Plugins loaded")?;
        let enables = counter("enables_total", "Plugins enabled")?;
        let disables = counter("disables_total", "Plugins disabled")?;
        let unloads = counter("unloads_total", "Plugins unloaded")?;
        let failures = counter("failures_total", "Failed lifecycle operations")?;
        let bus_published = gauge("bus_published", "Events accepted by the event bus")?;
        let bus_handler_failures = gauge("bus_handler_failures", "Event handler failures")?;
        let bus_rejected = gauge("bus_rejected", "Events rejected after shutdown")?;

        let hook_duration = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_hook_duration_seconds", config.prefix),
                "Plugin hook duration in seconds",
            )
            .buckets(config.hook_buckets.clone()),
            &["hook"],
        )
        .map_err(metric_err)?;
        registry
            .register(Box::new(hook_duration.clone()))
            .map_err(metric_err)?;

        Ok(Self {
            config,
            registry,
            loads,
            enables,
            disables,
            unloads,
            failures,
            hook_duration,
            bus_published,
            bus_handler_failures,
            bus_rejected,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Get the Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Count a lifecycle transition.
    pub fn record(&self, transition: Transition) {
        match transition {
            Transition::Load => self.loads.inc(),
            Transition::Enable => self.enables.inc(),
            Transition::Disable => self.disables.inc(),
            Transition::Unload => self.unloads.inc(),
            Transition::Failure => self.failures.inc(),
        }
    }

    /// Record how long a plugin hook took.
    pub fn observe_hook(&self, hook: &str, duration_secs: f64) {
        self.hook_duration
            .with_label_values(&[hook])
            .observe(duration_secs);
    }

    /// Mirror event bus counters.
    pub fn record_bus_stats(&self, stats: &BusStats) {
        self.bus_published.set(stats.published as i64);
        self.bus_handler_failures.set(stats.handler_failures as i64);
        self.bus_rejected.set(stats.rejected as i64);
    }

    /// Total for one transition.
    pub fn total(&self, transition: Transition) -> u64 {
        let counter = match transition {
            Transition::Load => &self.loads,
            Transition::Enable => &self.enables,
            Transition::Disable => &self.disables,
            Transition::Unload => &self.unloads,
            Transition::Failure => &self.failures,
        };
        counter.get() as u64
    }
}

impl std::fmt::Debug for PluginMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginMetrics")
            .field("config", &self.config)
            .field("loads", &self.total(Transition::Load))
            .field("enables", &self.total(Transition::Enable))
            .field("failures", &self.total(Transition::Failure))
            .finish()
    }
}
