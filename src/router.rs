//! Host routing table that plugins attach their operations to.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// HTTP method of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

impl HttpMethod {
    /// Upper-case method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(Error::InvalidCommand(format!("unknown HTTP method: {}", other))),
        }
    }
}

/// A request routed to a plugin operation.
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    /// Path parameters captured from `{name}` segments.
    pub params: HashMap<String, String>,
    /// Request body.
    pub body: Value,
}

impl RouteRequest {
    /// Create a request with a body.
    pub fn with_body(body: Value) -> Self {
        Self {
            params: HashMap::new(),
            body,
        }
    }

    /// Get a captured path parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Handles requests for one route.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    /// Serve a request.
    async fn call(&self, request: RouteRequest) -> Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RouteHandler for FnHandler<F>
where
    F: Fn(RouteRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, request: RouteRequest) -> Result<Value> {
        (self.0)(request).await
    }
}

/// Wrap an async closure as a route handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RouteHandler>
where
    F: Fn(RouteRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Documentation attached to a route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteMetadata {
    /// Short summary.
    pub summary: Option<String>,
    /// Grouping tags.
    pub tags: Vec<String>,
    /// Plugin that owns the route, if any.
    pub plugin: Option<String>,
}

/// Identifier of an inserted route, returned by [`RouteTable::insert_route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(u64);

impl RouteId {
    /// Numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// A live route as seen from outside the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    /// Route identifier.
    pub id: RouteId,
    /// Method.
    pub method: HttpMethod,
    /// Path pattern.
    pub path: String,
    /// Documentation.
    pub metadata: RouteMetadata,
}

/// Routing collaborator that route attachment mutates.
pub trait RouteTable: Send + Sync {
    /// Insert a route; fails if `(method, path)` is already taken.
    fn insert_route(
        &self,
        method: HttpMethod,
        path: &str,
        handler: Arc<dyn RouteHandler>,
        metadata: RouteMetadata,
    ) -> Result<RouteId>;

    /// Remove a route by id.
    fn remove_route(&self, id: RouteId) -> Result<()>;

    /// Drop any cached API schema so it is regenerated on next access.
    fn invalidate_schema_cache(&self);

    /// Snapshot of the live table, in insertion order.
    fn routes(&self) -> Vec<RouteInfo>;
}

struct RouteEntry {
    info: RouteInfo,
    segments: Vec<Segment>,
    handler: Arc<dyn RouteHandler>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn parse_segments(path: &str) -> Vec<Segment> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(s.to_string()),
        })
        .collect()
}

fn match_segments(pattern: &[Segment], path: &str) -> Option<HashMap<String, String>> {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if parts.len() != pattern.len() {
        return None;
    }

    let mut params = HashMap::new();
    for (segment, part) in pattern.iter().zip(parts) {
        match segment {
            Segment::Literal(lit) if lit == part => {}
            Segment::Literal(_) => return None,
            Segment::Param(name) => {
                params.insert(name.clone(), part.to_string());
            }
        }
    }
    Some(params)
}

/// In-process live route table with a lazily generated API schema.
pub struct InMemoryRouter {
    title: String,
    routes: RwLock<Vec<RouteEntry>>,
    next_id: AtomicU64,
    schema_cache: RwLock<Option<Arc<Value>>>,
    schema_builds: AtomicU64,
}

impl InMemoryRouter {
    /// Create an empty router; `title` appears in the generated schema.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            routes: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            schema_cache: RwLock::new(None),
            schema_builds: AtomicU64::new(0),
        }
    }

    /// Serve a request against the live table.
    pub async fn dispatch(&self, method: HttpMethod, path: &str, body: Value) -> Result<Value> {
        let matched = {
            let routes = self.routes.read();
            routes.iter().find_map(|entry| {
                if entry.info.method != method {
                    return None;
                }
                match_segments(&entry.segments, path).map(|params| (entry.handler.clone(), params))
            })
        };

        let (handler, params) = matched.ok_or_else(|| Error::RouteNotFound {
            method: method.to_string(),
            path: path.to_string(),
        })?;

        handler.call(RouteRequest { params, body }).await
    }

    /// OpenAPI-style description of the live routes, cached until invalidated.
    pub fn api_schema(&self) -> Arc<Value> {
        if let Some(schema) = self.schema_cache.read().as_ref() {
            return schema.clone();
        }

        let mut paths = serde_json::Map::new();
        for entry in self.routes.read().iter() {
            let info = &entry.info;
            let item = paths
                .entry(info.path.clone())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Value::Object(ops) = item {
                ops.insert(
                    info.method.as_str().to_ascii_lowercase(),
                    json!({
                        "summary": info.metadata.summary,
                        "tags": info.metadata.tags,
                        "x-plugin": info.metadata.plugin,
                    }),
                );
            }
        }

        let schema = Arc::new(json!({
            "openapi": "3.0.3",
            "info": { "title": self.title, "version": crate::VERSION },
            "paths": paths,
        }));

        self.schema_builds.fetch_add(1, Ordering::Relaxed);
        *self.schema_cache.write() = Some(schema.clone());
        schema
    }

    /// Number of times the schema has been regenerated.
    pub fn schema_builds(&self) -> u64 {
        self.schema_builds.load(Ordering::Relaxed)
    }

    /// Number of live routes.
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

impl Default for InMemoryRouter {
    fn default() -> Self {
        Self::new("plugin-host")
    }
}

impl RouteTable for InMemoryRouter {
    fn insert_route(
        &self,
        method: HttpMethod,
        path: &str,
        handler: Arc<dyn RouteHandler>,
        metadata: RouteMetadata,
    ) -> Result<RouteId> {
        let segments = parse_segments(path);
        let mut routes = self.routes.write();

        if routes
            .iter()
            .any(|r| r.info.method == method && r.segments == segments)
        {
            return Err(Error::route_registration(
                metadata.plugin.clone().unwrap_or_default(),
                format!("route already exists: {} {}", method, path),
            ));
        }

        let id = RouteId(self.next_id.fetch_add(1, Ordering::Relaxed));
        routes.push(RouteEntry {
            info: RouteInfo {
                id,
                method,
                path: path.to_string(),
                metadata,
            },
            segments,
            handler,
        });

        tracing::debug!(%method, path, route = id.0, "inserted route");
        Ok(id)
    }

    fn remove_route(&self, id: RouteId) -> Result<()> {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|r| r.info.id != id);

        if routes.len() == before {
            return Err(Error::RouteNotFound {
                method: "*".to_string(),
                path: format!("route #{}", id.0),
            });
        }
        Ok(())
    }

    fn invalidate_schema_cache(&self) {
        *self.schema_cache.write() = None;
    }

    fn routes(&self) -> Vec<RouteInfo> {
        self.routes.read().iter().map(|r| r.info.clone()).collect()
    }
}

impl std::fmt::Debug for InMemoryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRouter")
            .field("title", &self.title)
            .field("routes", &self.len())
            .finish()
    }
}
