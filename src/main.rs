//! Crash Round Server
//!
//! Runs the round runtime and the WebSocket front end in one process with
//! in-memory wallet, store and price cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crash_round::{
    core::{clock::SystemClock, money::Usd, CryptoAmount},
    fairness::FairnessEngine,
    network::{AuthConfig, BroadcastChannel, CrashServer, ServerConfig},
    round::{Currency, RoundRuntime, RuntimeConfig},
    services::{CachedPriceOracle, InMemoryStore, InMemoryWallet, OracleConfig},
    VERSION,
};

/// Demo balance credited to every new account, per currency.
const DEMO_BALANCE_USD: u64 = 1_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Crash Round Server v{}", VERSION);

    let runtime_config = RuntimeConfig::from_env();
    let oracle_config = OracleConfig::from_env();
    let server_config = ServerConfig::from_env();
    let auth_config = AuthConfig::from_env();

    info!(
        wait = ?runtime_config.scheduler.wait,
        tick = ?runtime_config.scheduler.tick,
        growth_per_ms = runtime_config.scheduler.growth_per_ms,
        "round timing"
    );

    let wallet = Arc::new(InMemoryWallet::with_demo_balances(demo_balances(&oracle_config)));
    let store = Arc::new(InMemoryStore::new());
    let oracle = Arc::new(CachedPriceOracle::new(oracle_config.clone()));
    let events = Arc::new(BroadcastChannel::default());

    let runtime = RoundRuntime::new(
        runtime_config,
        FairnessEngine::with_os_entropy(),
        wallet.clone(),
        store,
        Arc::new(SystemClock::new()),
        events.clone(),
    )
    .await
    .context("failed to start round runtime")?;
    let (rounds, runtime_task) = runtime.spawn();

    let server = Arc::new(CrashServer::new(
        server_config,
        auth_config,
        rounds.clone(),
        wallet,
        events,
        oracle,
        oracle_config,
    ));

    let serving = server.clone();
    let mut server_task = tokio::spawn(async move { serving.run().await });

    let served = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("ctrl-c received, shutting down");
            server.shutdown();
            server_task.await
        }
        // Bind failure or a crashed accept loop.
        early = &mut server_task => early,
    };

    rounds.shutdown().await;
    match runtime_task.await {
        Ok(Ok(())) => info!("round runtime stopped"),
        Ok(Err(e)) => warn!(error = %e, "round runtime stopped with error"),
        Err(e) => warn!(error = %e, "round runtime task panicked"),
    }

    served.context("server task panicked")?.context("server failed")?;
    Ok(())
}

/// Starting balance worth `DEMO_BALANCE_USD` at the default prices.
fn demo_balances(oracle_config: &OracleConfig) -> BTreeMap<Currency, CryptoAmount> {
    Currency::ALL
        .into_iter()
        .filter_map(|currency| {
            let price = oracle_config.default_price(currency)?;
            CryptoAmount::from_usd(Usd::from_dollars(DEMO_BALANCE_USD), price).map(|amount| (currency, amount))
        })
        .collect()
}
