/// convoflow server entry point
///
/// Serves:
/// - Flow publishing at /api/flows/*
/// - Event intake at /api/events/* and /api/conversations/{id}/close
/// - Instance inspection at /api/instances/{id}
/// - Health check at /healthz

use convoflow::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Environment-driven configuration (defaults to 0.0.0.0:3004, ./data)
    let config = Config::default();

    start_server(config).await
}
