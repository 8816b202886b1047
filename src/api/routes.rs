/// Dynamic route registrar
///
/// Compiles enabled endpoint definitions into an immutable `RouteTable` and
/// publishes it through `ArcSwap`. A reload builds the complete new table first
/// and swaps the pointer once, so concurrent requests see either the old table
/// or the new one, never a mix. In-flight requests keep the `Arc` they loaded.

use crate::{
    api::AppState,
    definition::{DefinitionStore, EndpointDefinition},
    error::AppError,
    runtime::context::{RawRequest, RequestContext},
};
use anyhow::Result;
use arc_swap::ArcSwap;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde_json::json;
use std::{collections::HashMap, collections::HashSet, future::Future, sync::Arc};

/// One compiled path segment
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `{name}` or `:name`
    Param(String),
    /// `{*name}`, matches the remaining path
    CatchAll(String),
}

impl Segment {
    /// Lower ranks win when several routes match
    fn rank(&self) -> u8 {
        match self {
            Segment::Literal(_) => 0,
            Segment::Param(_) => 1,
            Segment::CatchAll(_) => 2,
        }
    }

    /// Shape used to detect duplicate routes regardless of parameter names
    fn shape(&self) -> &str {
        match self {
            Segment::Literal(s) => s,
            Segment::Param(_) => "{}",
            Segment::CatchAll(_) => "{*}",
        }
    }
}

/// An endpoint bound to a method and compiled path
#[derive(Debug, Clone)]
pub struct BoundRoute {
    pub method: Method,
    pub path: String,
    pub endpoint: Arc<EndpointDefinition>,
    segments: Vec<Segment>,
}

impl BoundRoute {
    /// Compile an endpoint definition; `None` when the method or path is unusable
    fn compile(endpoint: EndpointDefinition) -> Option<Self> {
        let method = match Method::from_bytes(endpoint.method.trim().to_ascii_uppercase().as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                tracing::warn!("⚠️ Endpoint '{}' has invalid method '{}', skipped", endpoint.name, endpoint.method);
                return None;
            }
        };

        let Some(segments) = compile_path(&endpoint.path) else {
            tracing::warn!("⚠️ Endpoint '{}' has invalid path '{}', skipped", endpoint.name, endpoint.path);
            return None;
        };

        Some(Self {
            method,
            path: endpoint.path.clone(),
            endpoint: Arc::new(endpoint),
            segments,
        })
    }

    fn shape(&self) -> String {
        let parts: Vec<&str> = self.segments.iter().map(Segment::shape).collect();
        format!("{} /{}", self.method, parts.join("/"))
    }

    /// Match request path segments, returning captured parameters
    fn matches(&self, parts: &[&str]) -> Option<HashMap<String, String>> {
        let mut params = HashMap::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::CatchAll(name) => {
                    params.insert(name.clone(), parts.get(i..).unwrap_or_default().join("/"));
                    return Some(params);
                }
                Segment::Literal(literal) => {
                    if parts.get(i) != Some(&literal.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let value = parts.get(i).filter(|value| !value.is_empty())?;
                    params.insert(name.clone(), value.to_string());
                }
            }
        }

        (parts.len() == self.segments.len()).then_some(params)
    }

    fn ranks(&self) -> Vec<u8> {
        self.segments.iter().map(Segment::rank).collect()
    }
}

fn split_path(path: &str) -> Vec<&str> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Compile `/items/{id}` or `/items/:id` into segments
fn compile_path(path: &str) -> Option<Vec<Segment>> {
    if !path.starts_with('/') {
        return None;
    }

    let parts = split_path(path);
    let mut segments = Vec::with_capacity(parts.len());
    for (i, part) in parts.iter().enumerate() {
        let segment = if let Some(inner) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
            match inner.strip_prefix('*') {
                Some(name) if i + 1 == parts.len() && valid_name(name) => Segment::CatchAll(name.to_string()),
                Some(_) => return None,
                None if valid_name(inner) => Segment::Param(inner.to_string()),
                None => return None,
            }
        } else if let Some(name) = part.strip_prefix(':') {
            if !valid_name(name) {
                return None;
            }
            Segment::Param(name.to_string())
        } else if part.is_empty() || part.contains('{') || part.contains('}') {
            return None;
        } else {
            Segment::Literal(part.to_string())
        };
        segments.push(segment);
    }

    Some(segments)
}

/// Immutable snapshot of every bound route
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<BoundRoute>,
}

impl RouteTable {
    /// Compile endpoints in order; the first of any duplicate `(method, path)` wins
    pub fn build(endpoints: Vec<EndpointDefinition>) -> Self {
        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints.into_iter().filter(|e| e.enabled) {
            let Some(route) = BoundRoute::compile(endpoint) else {
                continue;
            };
            if !seen.insert(route.shape()) {
                tracing::warn!(
                    "⚠️ Duplicate route {} {} from endpoint '{}' ignored",
                    route.method,
                    route.path,
                    route.endpoint.name
                );
                continue;
            }
            tracing::debug!("🔗 Bound {} {} -> '{}'", route.method, route.path, route.endpoint.name);
            routes.push(route);
        }

        Self { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Most specific route for a request; literal segments beat parameters
    pub fn find(&self, method: &Method, path: &str) -> Option<(&BoundRoute, HashMap<String, String>)> {
        let parts = split_path(path);

        self.routes
            .iter()
            .filter(|route| route.method == *method)
            .filter_map(|route| route.matches(&parts).map(|params| (route, params)))
            .min_by(|(a, _), (b, _)| a.ranks().cmp(&b.ranks()))
    }
}

/// Owns the published route table
pub struct RouteRegistrar {
    definitions: Arc<dyn DefinitionStore>,
    table: ArcSwap<RouteTable>,
}

impl RouteRegistrar {
    pub fn new(definitions: Arc<dyn DefinitionStore>) -> Self {
        Self {
            definitions,
            table: ArcSwap::new(Arc::new(RouteTable::default())),
        }
    }

    /// Read enabled endpoints, publish a fresh table and return its routes
    pub async fn load_all(&self) -> Result<Vec<BoundRoute>> {
        let endpoints = self.definitions.list_enabled_endpoints().await?;
        let table = RouteTable::build(endpoints);
        let routes = table.routes.clone();

        if table.is_empty() {
            tracing::warn!("⚠️ No enabled endpoints; only fixed routes will answer");
        } else {
            tracing::info!("📡 Route table published with {} route(s)", table.len());
        }

        // Atomic swap of the entire table
        self.table.store(Arc::new(table));
        Ok(routes)
    }

    /// Rebuild the table from storage; returns the new route count
    pub async fn reload(&self) -> Result<usize> {
        Ok(self.load_all().await?.len())
    }

    /// Current table (lock-free read)
    pub fn table(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }
}

/// Routes for managing the dynamic route table
pub fn create_route_admin_routes() -> Router<AppState> {
    Router::new().route("/api/routes/reload", post(reload_routes))
}

/// POST /api/routes/reload
async fn reload_routes(State(state): State<AppState>) -> Response {
    match state.registrar.reload().await {
        Ok(count) => {
            tracing::info!("🔥 Routes reloaded: {}", count);
            Json(json!({ "routes": count })).into_response()
        }
        Err(e) => {
            tracing::error!("❌ Failed to reload routes: {:#}", e);
            AppError::from(e).into_response()
        }
    }
}

/// Run request work on its own task so a panic becomes a 500 response
pub(crate) async fn isolated<F>(work: F) -> Response
where
    F: Future<Output = Response> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("❌ Request handler task failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error_kind": "InternalError",
                    "message": "request handler failed unexpectedly",
                })),
            )
                .into_response()
        }
    }
}

/// Fallback handler serving every configuration-defined endpoint
pub async fn dispatch_dynamic(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let table = state.registrar.table();
    let Some((route, path_params)) = table.find(&method, uri.path()) else {
        tracing::debug!("🔍 No endpoint for {} {}", method, uri.path());
        return AppError::NotFound(format!("no endpoint for {} {}", method, uri.path())).into_response();
    };

    tracing::info!("📥 {} {} -> endpoint '{}'", method, uri.path(), route.endpoint.name);

    let context = RequestContext::build(RawRequest {
        method,
        path: uri.path().to_string(),
        path_params,
        query: uri.query().map(str::to_string),
        headers,
        body: body.to_vec(),
    });
    let endpoint = Arc::clone(&route.endpoint);
    let dispatcher = state.dispatcher.clone();

    isolated(async move { dispatcher.dispatch(&endpoint, &context).await.into_response() }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{LogicType, MemoryDefinitionStore};

    fn endpoint(id: i64, method: &str, path: &str) -> EndpointDefinition {
        EndpointDefinition {
            id,
            name: format!("ep-{}", id),
            path: path.to_string(),
            method: method.to_string(),
            logic_type: LogicType::Simple,
            enabled: true,
            code: None,
            response_template: None,
            model_id: None,
            workflow_id: None,
            description: None,
        }
    }

    #[test]
    fn test_param_styles_and_capture() {
        let table = RouteTable::build(vec![
            endpoint(1, "get", "/items/{id}"),
            endpoint(2, "GET", "/users/:user/posts/{post}"),
        ]);

        let (route, params) = table.find(&Method::GET, "/items/42").unwrap();
        assert_eq!(route.endpoint.id, 1);
        assert_eq!(params["id"], "42");

        let (route, params) = table.find(&Method::GET, "/users/ann/posts/7/").unwrap();
        assert_eq!(route.endpoint.id, 2);
        assert_eq!(params["user"], "ann");
        assert_eq!(params["post"], "7");

        assert!(table.find(&Method::POST, "/items/42").is_none());
        assert!(table.find(&Method::GET, "/items").is_none());
        assert!(table.find(&Method::GET, "/items/42/extra").is_none());
    }

    #[test]
    fn test_literal_wins_over_param() {
        let table = RouteTable::build(vec![
            endpoint(1, "GET", "/items/{id}"),
            endpoint(2, "GET", "/items/latest"),
            endpoint(3, "GET", "/files/{*rest}"),
        ]);

        assert_eq!(table.find(&Method::GET, "/items/latest").unwrap().0.endpoint.id, 2);
        assert_eq!(table.find(&Method::GET, "/items/9").unwrap().0.endpoint.id, 1);

        let (_, params) = table.find(&Method::GET, "/files/a/b/c.txt").unwrap();
        assert_eq!(params["rest"], "a/b/c.txt");
    }

    #[test]
    fn test_duplicates_keep_first_and_invalid_paths_are_skipped() {
        let table = RouteTable::build(vec![
            endpoint(1, "GET", "/items/{id}"),
            endpoint(2, "GET", "/items/:other"),
            endpoint(3, "GET", "no-leading-slash"),
            endpoint(4, "GET", "/bad/{}"),
            endpoint(5, "NOT A METHOD", "/x"),
            endpoint(6, "POST", "/items/{id}"),
        ]);

        assert_eq!(table.len(), 2);
        assert!(!table.is_empty());
        assert!(RouteTable::default().is_empty());
        assert_eq!(table.find(&Method::GET, "/items/1").unwrap().0.endpoint.id, 1);
        assert_eq!(table.find(&Method::POST, "/items/1").unwrap().0.endpoint.id, 6);
    }

    #[tokio::test]
    async fn test_reload_swaps_table_without_touching_old_snapshots() {
        let store = Arc::new(MemoryDefinitionStore::new());
        store.put_endpoint(endpoint(1, "GET", "/a")).await;
        let registrar = RouteRegistrar::new(store.clone());

        let routes = registrar.load_all().await.unwrap();
        assert_eq!(routes.len(), 1);
        let before = registrar.table();

        store.put_endpoint(endpoint(2, "GET", "/b")).await;
        store.remove_endpoint(1).await;
        assert_eq!(registrar.reload().await.unwrap(), 1);

        // The old snapshot is unchanged; the published one reflects storage
        assert!(before.find(&Method::GET, "/a").is_some());
        assert!(registrar.table().find(&Method::GET, "/a").is_none());
        assert!(registrar.table().find(&Method::GET, "/b").is_some());
    }
}
