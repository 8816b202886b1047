/// HTTP API Layer
///
/// Fixed routes plus the dynamic fallback that serves configuration-defined
/// endpoints:
/// - Unified workflow invocation at /workflow/api
/// - Route table reload at /api/routes/reload
/// - Every other method/path resolved against the published route table

use crate::runtime::dispatcher::LogicDispatcher;
use std::sync::Arc;

// Dynamic route table, reload endpoint and fallback dispatch
pub mod routes;

// Workflow invocation by name
pub mod invoke;

// Re-export router builders
pub use invoke::create_invoke_routes;
pub use routes::{create_route_admin_routes, dispatch_dynamic, BoundRoute, RouteRegistrar, RouteTable};

/// Application state shared by all handlers
#[derive(Clone)]
pub struct AppState {
    /// Strategy router for endpoint execution
    pub dispatcher: LogicDispatcher,
    /// Published route table for dynamic endpoints
    pub registrar: Arc<RouteRegistrar>,
}
