use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use domofon_bridge::config::{GatekeeperConfig, ModemConfig, PollerConfig};
use domofon_bridge::gatekeeper::Gatekeeper;
use domofon_bridge::logging;
use domofon_bridge::modem::HuaweiModem;
use domofon_bridge::sms::{DedupStore, SmsPoller};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = logging::init("sms-checker");

    let poller_config = PollerConfig::from_env().context("invalid poller configuration")?;
    let modem_config = ModemConfig::from_env().context("invalid modem configuration")?;
    let gatekeeper_config = GatekeeperConfig::from_env().context("invalid gatekeeper configuration")?;

    eprintln!("📟 SMS checker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Modem: {}", modem_config.url);
    eprintln!("   Open URL: {}", gatekeeper_config.open_url);
    eprintln!("   Dedup file: {}", poller_config.last_sms_file.display());

    // ── Modem ────────────────────────────────────────────────────────────
    let modem = Arc::new(HuaweiModem::new(&modem_config)?);
    modem
        .login_with_retry(modem_config.login_attempts, modem_config.login_retry_interval)
        .await
        .context("could not log in to modem")?;

    // ── Dedup store ──────────────────────────────────────────────────────
    let store = DedupStore::load(&poller_config.last_sms_file)
        .await
        .context("could not load dedup store")?;

    // ── Poller ───────────────────────────────────────────────────────────
    let gatekeeper = Arc::new(Gatekeeper::new(gatekeeper_config)?);
    let poller = Arc::new(SmsPoller::new(&poller_config, store, modem, gatekeeper));

    let cancel = CancellationToken::new();
    let handle = poller.clone().spawn(cancel.clone());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    cancel.cancel();

    if let Err(e) = handle.await {
        error!("Poller task ended abnormally: {e}");
    }
    Ok(())
}
