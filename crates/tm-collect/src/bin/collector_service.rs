use tm_collect::{Collector, CollectorConfig, Settings, ShutdownToken};
use tm_data::{BinanceClient, KlineStore};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = Settings::from_env()?;
    info!(db = %settings.db_path, pairs = settings.pairs.len(), "starting collector service");

    let store = KlineStore::open(&settings.db_path)?;
    let shutdown = ShutdownToken::new();

    spawn_signal_handler(shutdown.clone());

    let mut handles = Vec::new();
    for (symbol, interval) in &settings.pairs {
        let mut config = CollectorConfig::new(symbol, interval.clone());
        config.start_date = settings.start_date;
        config.poll_delay = settings.poll_delay;
        config.mode = settings.mode;

        let mut collector = Collector::new(
            BinanceClient::new(),
            store.clone(),
            config,
            shutdown.clone(),
        );
        handles.push(tokio::spawn(async move { collector.run().await }));
    }

    for handle in handles {
        match handle.await {
            Ok(reason) => info!(reason = ?reason, "pair loop finished"),
            Err(e) => error!(error = %e, "pair loop panicked"),
        }
    }

    info!("collector service stopped");
    Ok(())
}

fn spawn_signal_handler(shutdown: ShutdownToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    shutdown.trigger();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        info!("termination signal received; finishing in-flight work");
        shutdown.trigger();
    });
}
