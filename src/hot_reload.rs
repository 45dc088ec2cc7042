//! Hot attachment of plugin operations into the live route table.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::plugin::Operation;
use crate::router::{HttpMethod, RouteHandler, RouteId, RouteMetadata, RouteTable};

/// Prefix under which every plugin's routes are namespaced.
pub const DEFAULT_ROUTE_PREFIX: &str = "/api/plugins";

/// Configuration for route attachment.
#[derive(Debug, Clone)]
pub struct AttachConfig {
    /// Route prefix; a plugin's routes live under `<prefix>/<plugin>`.
    pub prefix: String,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_ROUTE_PREFIX.to_string(),
        }
    }
}

impl AttachConfig {
    /// Create a new attachment configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the route prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// One attached operation, used to reverse the attachment precisely.
#[derive(Clone)]
pub struct RouteHandle {
    /// Owning plugin.
    pub plugin_name: String,
    /// Full route path.
    pub path: String,
    /// Method.
    pub method: HttpMethod,
    /// Handler that was inserted.
    pub handler: Arc<dyn RouteHandler>,
    /// Documentation.
    pub metadata: RouteMetadata,
    /// Identifier assigned by the route table.
    pub route_id: RouteId,
}

impl std::fmt::Debug for RouteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteHandle")
            .field("plugin_name", &self.plugin_name)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("route_id", &self.route_id)
            .finish()
    }
}

/// Attaches and detaches plugin operations on a shared route table.
///
/// This is the only component that mutates the table. Attach and detach
/// calls are serialized with each other.
pub struct RouteAttachment {
    config: AttachConfig,
    router: Arc<dyn RouteTable>,
    handles: DashMap<String, Vec<RouteHandle>>,
    lock: Mutex<()>,
}

impl RouteAttachment {
    /// Create an attachment manager over `router`.
    pub fn new(config: AttachConfig, router: Arc<dyn RouteTable>) -> Self {
        Self {
            config,
            router,
            handles: DashMap::new(),
            lock: Mutex::new(()),
        }
    }

    /// Get the route table.
    pub fn router(&self) -> &Arc<dyn RouteTable> {
        &self.router
    }

    /// Full path for an operation path declared by `plugin_name`.
    ///
    /// Paths that already carry the plugin's namespace, or start with the
    /// plugin name itself, are not prefixed twice.
    pub fn route_path(&self, plugin_name: &str, operation_path: &str) -> String {
        let base = format!("{}/{}", self.config.prefix.trim_end_matches('/'), plugin_name);
        let path = normalize(operation_path);

        if path == base || path.starts_with(&format!("{}/", base)) {
            return path;
        }

        let own = format!("/{}", plugin_name);
        let rest = if path == own {
            ""
        } else if let Some(rest) = path.strip_prefix(&format!("{}/", own)) {
            return format!("{}/{}", base, rest);
        } else if path == "/" {
            ""
        } else {
            path.as_str()
        };

        format!("{}{}", base, rest)
    }

    /// Insert every operation of a plugin, or none of them.
    ///
    /// Attaching an already attached plugin returns its existing handles.
    pub fn attach(&self, plugin_name: &str, operations: &[Operation]) -> Result<Vec<RouteHandle>> {
        let _guard = self.lock.lock();

        if let Some(existing) = self.handles.get(plugin_name) {
            tracing::debug!(plugin = %plugin_name, "routes already attached");
            return Ok(existing.clone());
        }

        let mut inserted: Vec<RouteHandle> = Vec::with_capacity(operations.len());
        for op in operations {
            let path = self.route_path(plugin_name, &op.path);
            let metadata = RouteMetadata {
                summary: op.summary.clone(),
                tags: op.tags.clone(),
                plugin: Some(plugin_name.to_string()),
            };

            match self
                .router
                .insert_route(op.method, &path, op.handler.clone(), metadata.clone())
            {
                Ok(route_id) => inserted.push(RouteHandle {
                    plugin_name: plugin_name.to_string(),
                    path,
                    method: op.method,
                    handler: op.handler.clone(),
                    metadata,
                    route_id,
                }),
                Err(e) => {
                    let reason = match e {
                        Error::RouteRegistration { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    tracing::warn!(
                        plugin = %plugin_name,
                        method = %op.method,
                        path = %path,
                        rolled_back = inserted.len(),
                        "route attachment failed"
                    );
                    self.remove_all(&inserted);
                    return Err(Error::route_registration(plugin_name, reason));
                }
            }
        }

        self.router.invalidate_schema_cache();
        self.handles.insert(plugin_name.to_string(), inserted.clone());
        tracing::info!(plugin = %plugin_name, routes = inserted.len(), "attached plugin routes");
        Ok(inserted)
    }

    /// Remove exactly the routes recorded for a plugin.
    ///
    /// Returns false if nothing was attached.
    pub fn detach(&self, plugin_name: &str) -> Result<bool> {
        let _guard = self.lock.lock();

        let Some((_, handles)) = self.handles.remove(plugin_name) else {
            return Ok(false);
        };

        let before = self.router.routes();
        self.remove_all(&handles);
        let after = self.router.routes();

        let removed: HashSet<RouteId> = handles.iter().map(|h| h.route_id).collect();
        let expected: Vec<RouteId> = before
            .iter()
            .map(|r| r.id)
            .filter(|id| !removed.contains(id))
            .collect();
        let actual: Vec<RouteId> = after.iter().map(|r| r.id).collect();

        if actual != expected {
            tracing::error!(
                plugin = %plugin_name,
                expected = expected.len(),
                actual = actual.len(),
                "detach changed routes it did not own"
            );
        }
        debug_assert_eq!(actual, expected, "detach changed routes it did not own");

        self.router.invalidate_schema_cache();
        tracing::info!(plugin = %plugin_name, routes = handles.len(), "detached plugin routes");
        Ok(true)
    }

    /// Check if a plugin has routes attached.
    pub fn is_attached(&self, plugin_name: &str) -> bool {
        self.handles.contains_key(plugin_name)
    }

    /// Handles recorded for a plugin.
    pub fn list_handles(&self, plugin_name: &str) -> Vec<RouteHandle> {
        self.handles
            .get(plugin_name)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    /// Plugins with routes attached, sorted.
    pub fn attached_plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn remove_all(&self, handles: &[RouteHandle]) {
        for handle in handles.iter().rev() {
            if let Err(e) = self.router.remove_route(handle.route_id) {
                tracing::warn!(
                    plugin = %handle.plugin_name,
                    path = %handle.path,
                    error = %e,
                    "route already removed"
                );
            }
        }
    }
}

impl std::fmt::Debug for RouteAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteAttachment")
            .field("config", &self.config)
            .field("attached", &self.attached_plugins())
            .finish()
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{handler_fn, InMemoryRouter, RouteInfo};
    use serde_json::{json, Value};

    fn echo(tag: &'static str) -> Arc<dyn RouteHandler> {
        handler_fn(move |_| async move { Ok(json!(tag)) })
    }

    fn setup() -> (Arc<InMemoryRouter>, RouteAttachment) {
        let router = Arc::new(InMemoryRouter::default());
        let attachment = RouteAttachment::new(AttachConfig::default(), router.clone());
        (router, attachment)
    }

    fn route_set(routes: Vec<RouteInfo>) -> HashSet<(RouteId, String)> {
        routes.into_iter().map(|r| (r.id, r.path)).collect()
    }

    #[test]
    fn test_route_path_collapses_prefixes() {
        let (_, attachment) = setup();
        assert_eq!(attachment.route_path("tasks", "/list"), "/api/plugins/tasks/list");
        assert_eq!(attachment.route_path("tasks", "list/"), "/api/plugins/tasks/list");
        assert_eq!(attachment.route_path("tasks", "/"), "/api/plugins/tasks");
        assert_eq!(
            attachment.route_path("tasks", "/api/plugins/tasks/list"),
            "/api/plugins/tasks/list"
        );
        assert_eq!(attachment.route_path("tasks", "/tasks/{id}"), "/api/plugins/tasks/{id}");
        assert_eq!(attachment.route_path("tasks", "/tasks"), "/api/plugins/tasks");
        assert_eq!(
            attachment.route_path("tasks", "/tasksets"),
            "/api/plugins/tasks/tasksets"
        );
    }

    #[tokio::test]
    async fn test_attach_and_dispatch() {
        let (router, attachment) = setup();
        let ops = vec![
            Operation::get("/list", echo("list")),
            Operation::post("/create", echo("create")).with_summary("Create"),
        ];

        let handles = attachment.attach("tasks", &ops).unwrap();
        assert_eq!(handles.len(), 2);
        assert!(attachment.is_attached("tasks"));

        let reply = router
            .dispatch(HttpMethod::Get, "/api/plugins/tasks/list", Value::Null)
            .await
            .unwrap();
        assert_eq!(reply, json!("list"));
    }

    #[test]
    fn test_attach_is_idempotent() {
        let (router, attachment) = setup();
        let ops = vec![Operation::get("/list", echo("list"))];

        let first = attachment.attach("tasks", &ops).unwrap();
        let second = attachment.attach("tasks", &ops).unwrap();
        assert_eq!(first[0].route_id, second[0].route_id);
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_attach_rolls_back_on_conflict() {
        let (router, attachment) = setup();
        router
            .insert_route(
                HttpMethod::Post,
                "/api/plugins/tasks/create",
                echo("squatter"),
                RouteMetadata::default(),
            )
            .unwrap();
        let before = route_set(router.routes());

        let ops = vec![
            Operation::get("/list", echo("list")),
            Operation::post("/create", echo("create")),
        ];
        let err = attachment.attach("tasks", &ops).unwrap_err();

        assert!(matches!(err, Error::RouteRegistration { .. }));
        assert!(!attachment.is_attached("tasks"));
        assert_eq!(route_set(router.routes()), before);
    }

    #[test]
    fn test_detach_leaves_other_plugins() {
        let (router, attachment) = setup();
        attachment
            .attach("chat", &[Operation::get("/rooms", echo("rooms"))])
            .unwrap();
        let before = route_set(router.routes());

        attachment
            .attach(
                "tasks",
                &[
                    Operation::get("/list", echo("list")),
                    Operation::delete("/{id}", echo("delete")),
                ],
            )
            .unwrap();
        assert_eq!(router.len(), 3);

        assert!(attachment.detach("tasks").unwrap());
        assert_eq!(route_set(router.routes()), before);
        assert!(attachment.list_handles("tasks").is_empty());
        assert!(!attachment.detach("tasks").unwrap());
        assert_eq!(attachment.attached_plugins(), vec!["chat"]);
    }

    #[test]
    fn test_schema_regenerates_after_changes() {
        let (router, attachment) = setup();
        let empty = router.api_schema();
        assert!(empty["paths"].as_object().unwrap().is_empty());
        router.api_schema();
        assert_eq!(router.schema_builds(), 1);

        attachment
            .attach("tasks", &[Operation::get("/list", echo("list")).with_tag("tasks")])
            .unwrap();
        let schema = router.api_schema();
        assert_eq!(router.schema_builds(), 2);
        assert_eq!(
            schema["paths"]["/api/plugins/tasks/list"]["get"]["x-plugin"],
            json!("tasks")
        );

        attachment.detach("tasks").unwrap();
        assert!(router.api_schema()["paths"].as_object().unwrap().is_empty());
        assert_eq!(router.schema_builds(), 3);
    }
}
