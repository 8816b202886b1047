/// flowgate: configuration-defined HTTP endpoints
///
/// Main entry point. Reads configuration from FLOWGATE_* environment variables
/// and starts the HTTP server.

use flowgate::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Configuration-defined endpoints on any other path
/// - Workflow invocation at POST /workflow/api
/// - Route table reload at POST /api/routes/reload
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
