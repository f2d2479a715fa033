//! Production runtime: continuous ingestion loop until Ctrl-C.

use pulseflow::client::oauth1::V1Client;
use pulseflow::client::HttpApiClient;
use pulseflow::config::Config;
use pulseflow::ingest::scheduler::{run_home_sync_loop, run_ingestion_loop};
use pulseflow::store::Store;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let cfg = Config::from_env();
    cfg.validate()?;

    log::info!("🚀 Starting pulseflow runtime");
    log::info!("📊 Configuration:");
    log::info!("   Account: @{}", cfg.username);
    log::info!("   DB path: {}", cfg.db_path);
    log::info!(
        "   API: {:.1} req/s, burst {}, {} attempts, {}ms base backoff",
        cfg.api.rps,
        cfg.api.burst,
        cfg.api.max_attempts,
        cfg.api.base_backoff_ms
    );
    log::info!(
        "   Interval: {}s, horizon: {}s",
        cfg.ingest_interval_secs,
        cfg.ingest_horizon_secs
    );

    let store = Store::open(&cfg.db_path)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("🛑 Ctrl-C received, finishing in-flight tick");
            let _ = shutdown_tx.send(true);
        }
    });

    let client = Arc::new(HttpApiClient::new(
        &cfg.credentials.bearer_token,
        &cfg.api,
        shutdown_rx.clone(),
    )?);

    // Home timeline needs OAuth 1.0a; skip the sync when unconfigured.
    if !cfg.credentials.consumer_key.is_empty() {
        let v1 = V1Client::new(client.clone(), &cfg.credentials);
        tokio::spawn(run_home_sync_loop(
            store.clone(),
            Arc::new(v1),
            100,
            5,
            cfg.ingest_interval_secs,
            shutdown_rx.clone(),
        ));
    } else {
        log::info!("🏠 Home-timeline sync disabled (no OAuth credentials)");
    }

    run_ingestion_loop(&store, client.as_ref(), &cfg, shutdown_rx).await;

    log::info!("✅ Shutdown complete");
    Ok(())
}
