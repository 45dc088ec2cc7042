//! Runs a host with one in-process plugin and drives it through the admin surface.
//!
//! Run with: cargo run --example plugin_host

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use plugin_host::{
    event_data, handler_fn, EventPriority, HostConfig, HttpMethod, ManifestBuilder, Operation,
    Plugin, PluginCatalog, PluginContext, PluginHost,
};

#[derive(Default)]
struct Tasks {
    items: Arc<Mutex<Vec<String>>>,
    ctx: Option<PluginContext>,
}

#[async_trait]
impl Plugin for Tasks {
    async fn initialize(&mut self, ctx: &PluginContext) -> plugin_host::Result<()> {
        if let Some(saved) = ctx.store().get_as::<Vec<String>>("items").await? {
            *self.items.lock() = saved;
        }
        ctx.publish("tasks.ready", event_data([("count", json!(self.items.lock().len()))]), EventPriority::Normal)?;
        self.ctx = Some(ctx.clone());
        Ok(())
    }

    async fn shutdown(&mut self) -> plugin_host::Result<()> {
        if let Some(ctx) = self.ctx.take() {
            let items = self.items.lock().clone();
            ctx.store().set("items", json!(items)).await?;
        }
        Ok(())
    }

    fn operations(&self) -> Vec<Operation> {
        let list = self.items.clone();
        let add = self.items.clone();
        vec![
            Operation::get(
                "/items",
                handler_fn(move |_| {
                    let items = list.lock().clone();
                    async move { Ok(json!(items)) }
                }),
            )
            .with_summary("List tasks"),
            Operation::post(
                "/items",
                handler_fn(move |req| {
                    let title = req.body["title"].as_str().unwrap_or("untitled").to_string();
                    add.lock().push(title.clone());
                    async move { Ok(json!({ "added": title })) }
                }),
            )
            .with_summary("Add a task"),
        ]
    }
}

#[tokio::main]
async fn main() -> plugin_host::Result<()> {
    tracing_subscriber::fmt::init();

    let manifest = ManifestBuilder::new("tasks", "1.0.0")
        .description("Simple task list")
        .author("demo")
        .category("productivity")
        .permission("storage")
        .build()?;

    let catalog = Arc::new(PluginCatalog::new());
    catalog.register_fn(manifest.clone(), || Box::new(Tasks::default()));

    let host = PluginHost::new(HostConfig::new().with_permission("storage"), catalog).await?;
    host.manager().register_manifest(manifest)?;
    host.events().subscribe_fn("tasks.ready", |event| {
        println!("tasks ready with {} item(s)", event.get("count").unwrap_or(&Value::Null));
        Ok(())
    });
    host.start().await?;

    print!("{}", host.admin("enable tasks").await?);

    host.dispatch(HttpMethod::Post, "/api/plugins/tasks/items", json!({ "title": "write docs" }))
        .await?;
    let items = host
        .dispatch(HttpMethod::Get, "/api/plugins/tasks/items", Value::Null)
        .await?;
    println!("items: {}", items);

    print!("{}", host.admin("list").await?);
    println!("{}", serde_json::to_string_pretty(&*host.router().api_schema()).unwrap_or_default());

    print!("{}", host.admin("disable tasks").await?);
    host.shutdown().await;
    Ok(())
}
