// =============================================================================
// Multi-tenant autonomous trading orchestrator — entry point
// =============================================================================
//
// Loads configuration, constructs a Supervisor, loads every configured
// user's traders, and runs until a stop signal. No CLI and no REST façade
// ship in this core — the outer process is deliberately thin.

mod autotrader;
mod candidate_pool;
mod config;
mod decision_log;
mod engine;
mod error;
mod indicators;
mod llm;
mod market_data;
mod supervisor;
mod types;
mod venue;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{JsonFileConfigProvider, RuntimeConfig};
use crate::engine::TemplateLibrary;
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("orchestrator starting up");

    let runtime_config_path = std::env::var("ORCHESTRATOR_RUNTIME_CONFIG")
        .unwrap_or_else(|_| "runtime_config.json".to_string());
    let runtime = RuntimeConfig::load(&runtime_config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %runtime_config_path, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    let config_rows_path =
        std::env::var("ORCHESTRATOR_CONFIG_ROWS").unwrap_or_else(|_| "config_rows.json".to_string());
    let config_provider: Arc<dyn config::ConfigProvider> =
        Arc::new(JsonFileConfigProvider::load(&config_rows_path).await.unwrap_or_else(|e| {
            error!(error = %e, path = %config_rows_path, "failed to load configuration rows, starting with none");
            JsonFileConfigProvider::from_rows(config::ConfigRows::default())
        }));

    let mut client_builder = reqwest::Client::builder();
    if let Some(proxy_url) = &runtime.http_proxy {
        match reqwest::Proxy::all(proxy_url.as_str()) {
            Ok(proxy) => client_builder = client_builder.proxy(proxy),
            Err(e) => warn!(error = %e, "failed to configure HTTP proxy, continuing without it"),
        }
    }
    let http_client = client_builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "failed to build configured HTTP client, falling back to default");
        reqwest::Client::new()
    });

    let templates = TemplateLibrary::load(&runtime.prompt_template_dir).await;

    // ── 2. Build the supervisor and load every configured user ──────────
    let supervisor = Arc::new(Supervisor::new(runtime.clone(), config_provider, http_client, templates));

    let user_ids = std::env::var("ORCHESTRATOR_USER_IDS").unwrap_or_default();
    for user_id in user_ids.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match supervisor.load_for_user(user_id).await {
            Ok(loaded) => info!(user_id, traders = ?loaded, "user loaded"),
            Err(e) => error!(user_id, error = %e, "failed to load user's traders"),
        }
    }

    info!(traders = supervisor.list().len(), "all configured traders started. Press Ctrl+C to stop.");

    // ── 3. Graceful shutdown ──────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    supervisor.stop_all().await;

    if let Err(e) = runtime.save(&runtime_config_path) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("orchestrator shut down complete");
    Ok(())
}
