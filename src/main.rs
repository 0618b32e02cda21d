// =============================================================================
// Lattice Grid Engine — Main Entry Point
// =============================================================================
//
// One Bitget connector and one strategy manager per market (spot, futures).
// Strategies persisted as running are restarted on boot; everything is
// stopped gracefully and saved on Ctrl+C.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod engine_config;
mod errors;
mod events;
mod exchange;
mod grid;
mod persistence;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::engine_config::EngineConfig;
use crate::events::EngineEvent;
use crate::exchange::bitget::BitgetConnector;
use crate::exchange::ExchangeConnector;
use crate::grid::manager::StrategyManager;
use crate::persistence::{ensure_data_dir, restore_manager, run_save_task, save_now, JsonStore};
use crate::types::InstType;

/// Everything one market needs at shutdown time; the pump and persistence
/// tasks hold their own connector and manager handles.
struct Market {
    manager: Arc<StrategyManager>,
    store: JsonStore,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Lattice Grid Engine — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = EngineConfig::load("engine_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });
    ensure_data_dir(std::path::Path::new(&config.data_dir))
        .context("data directory is not usable")?;

    let api_key = std::env::var("BITGET_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BITGET_API_SECRET").unwrap_or_default();
    let passphrase = std::env::var("BITGET_PASSPHRASE").unwrap_or_default();
    if api_key.is_empty() {
        warn!("BITGET_API_KEY not set; private endpoints will be rejected");
    }

    // ── 2. Bring up one market stack per instrument kind ─────────────────
    let mut markets = Vec::new();
    for inst_type in [InstType::Spot, InstType::Futures] {
        let market = start_market(
            inst_type,
            &config,
            (api_key.as_str(), api_secret.as_str(), passphrase.as_str()),
        )
        .await?;
        markets.push(market);
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 3. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    for market in &markets {
        market.manager.stop_all().await;
        if let Err(e) = save_now(&market.manager, &market.store) {
            error!(inst_type = %market.manager.inst_type(), error = %e, "final save failed");
        }
    }

    if let Err(e) = config.save("engine_config.json") {
        error!(error = %e, "Failed to save engine config on shutdown");
    }

    info!("Lattice Grid Engine shut down complete.");
    Ok(())
}

/// Build connector, manager, and background tasks for one market, restoring
/// and restarting persisted strategies.
async fn start_market(
    inst_type: InstType,
    config: &EngineConfig,
    (api_key, api_secret, passphrase): (&str, &str, &str),
) -> anyhow::Result<Market> {
    let events = events::EventBus::new();
    let connector: Arc<dyn ExchangeConnector> = Arc::new(BitgetConnector::new(
        api_key,
        api_secret,
        passphrase,
        inst_type,
    ));
    let manager = Arc::new(StrategyManager::new(
        inst_type,
        config.clone(),
        events.clone(),
    ));
    let store = JsonStore::new(&config.data_dir);

    // ── Restore persisted strategies ─────────────────────────────────
    let running = match store.load(inst_type) {
        Ok(Some(state)) => restore_manager(&manager, state),
        Ok(None) => {
            info!(%inst_type, "no persisted state, starting empty");
            Vec::new()
        }
        Err(e) => {
            // A broken file is refused, never partially loaded.
            error!(%inst_type, error = %e, "persisted state rejected; starting empty");
            Vec::new()
        }
    };
    for uid in running {
        if let Err(e) = manager.start_strategy(&uid, connector.clone()).await {
            error!(%uid, error = %e, "failed to restart persisted strategy");
            events.publish(EngineEvent::StrategyError {
                uid: uid.clone(),
                message: format!("restart failed: {e}"),
            });
        }
    }

    // ── Market-data / fill pump ──────────────────────────────────────
    spawn_event_pump(manager.clone(), connector.clone());

    // ── Connection-state watcher ─────────────────────────────────────
    let mut state_rx = connector.connection_state();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = *state_rx.borrow();
            info!(%inst_type, %state, "connector state changed");
        }
    });

    // ── Persistence task ─────────────────────────────────────────────
    tokio::spawn(run_save_task(
        manager.clone(),
        store.clone(),
        config.auto_save_interval_ms,
    ));

    info!(%inst_type, "market stack started");
    Ok(Market { manager, store })
}

/// Forward connector streams into the manager: ticks fan out to subscribed
/// traders, fills route by client order id.
fn spawn_event_pump(
    manager: Arc<StrategyManager>,
    connector: Arc<dyn ExchangeConnector>,
) -> tokio::task::JoinHandle<()> {
    let mut ticks = connector.ticks();
    let mut fills = connector.fills();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                tick = ticks.recv() => match tick {
                    Ok((pair, ticker)) => manager.process_market_data(&pair, ticker),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(dropped)) => {
                        warn!(dropped, "tick pump lagged, oldest ticks dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                fill = fills.recv() => match fill {
                    Ok((client_order_id, fill)) => {
                        manager.route_fill_event(&client_order_id, fill);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(dropped)) => {
                        warn!(dropped, "fill pump lagged, events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}
