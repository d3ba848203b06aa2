use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use domofon_bridge::api::{OpenRouteState, open_routes};
use domofon_bridge::config::{ApiConfig, DomofonConfig};
use domofon_bridge::domofon::RosDomofon;
use domofon_bridge::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = logging::init("domofon-api");

    let api_config = ApiConfig::from_env().context("invalid API configuration")?;
    let domofon_config = DomofonConfig::from_env().context("invalid Rosdomofon configuration")?;

    eprintln!("🚪 Domofon API v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Rosdomofon: {}", domofon_config.base_url);
    eprintln!("   Open: http://0.0.0.0:{}/api/open", api_config.http_port);

    let issuer = Arc::new(RosDomofon::new(domofon_config)?);
    let app = open_routes(OpenRouteState {
        issuer,
        secret_key: api_config.secret_key,
        key_id: api_config.key_id,
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", api_config.http_port))
        .await
        .with_context(|| format!("failed to bind port {}", api_config.http_port))?;
    info!(port = api_config.http_port, "Domofon API started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown requested");
        })
        .await
        .context("server error")?;
    Ok(())
}
