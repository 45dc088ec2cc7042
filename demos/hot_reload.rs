//! Watches a plugin tree and picks up new manifests without a restart.
//!
//! Run with: cargo run --example hot_reload --features watch
//!
//! Then drop a manifest into `./plugins/<category>/<name>/plugin.toml`.

use std::sync::Arc;
use std::time::Duration;

use plugin_host::{
    HostConfig, LifecycleEvent, PluginCatalog, PluginHost, PluginWatcher, WatchConfig,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = HostConfig::new().with_plugin_root("./plugins");
    std::fs::create_dir_all(&config.plugin_root)?;

    let host = PluginHost::new(config, Arc::new(PluginCatalog::new())).await?;
    host.events().subscribe_fn("plugin.discovered", |event| {
        if let Some(LifecycleEvent::Discovered { name, version }) = LifecycleEvent::from_event(event) {
            info!("new plugin {} {}", name, version);
        }
        Ok(())
    });

    let watcher = PluginWatcher::new(
        WatchConfig::new()
            .with_debounce(Duration::from_millis(500))
            .with_recursive(true),
    );
    watcher.forward_to(host.events().clone());
    watcher.watch(&host.config().plugin_root)?;
    watcher.start()?;

    host.start().await?;
    info!("watching {:?} for 60 seconds", host.config().plugin_root);

    for _ in 0..12 {
        tokio::time::sleep(Duration::from_secs(5)).await;
        print!("{}", host.admin("list").await?);
    }

    watcher.stop();
    host.shutdown().await;
    Ok(())
}
