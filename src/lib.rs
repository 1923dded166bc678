//! machinewatch -- streaming anomaly detection for industrial sensor telemetry.
//!
//! Readings arrive per machine over a publish/subscribe channel. Each machine
//! first accumulates a baseline, then an isolation forest fitted on that
//! baseline scores every further reading; anomalous ones become alerts on the
//! outbound alert topic.

pub mod alert;
pub mod api;
pub mod config;
pub mod detect;
pub mod engine;
pub mod simulator;
pub mod telemetry;
pub mod transport;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, TransportKind};
use crate::transport::{topics, Channel, MemoryChannel};

/// Open the transport selected by `config`.
pub async fn connect(config: &Config) -> Result<Arc<dyn Channel>> {
    match config.transport.kind {
        TransportKind::Memory => Ok(Arc::new(MemoryChannel::default())),
        #[cfg(feature = "nats")]
        TransportKind::Nats => {
            let url = &config.transport.nats_url;
            let channel = transport::nats::NatsChannel::connect(url)
                .await
                .with_context(|| format!("failed to connect to NATS at {}", url))?;
            Ok(Arc::new(channel))
        }
        #[cfg(not(feature = "nats"))]
        TransportKind::Nats => {
            anyhow::bail!("transport.kind = \"nats\" requires building with the `nats` feature")
        }
    }
}

/// Run the engine: ingest, alerting, optional simulator and query API, until
/// ctrl-c.
pub async fn run(config: Config, simulate: bool) -> Result<()> {
    let channel = connect(&config).await?;
    let namespace = config.transport.namespace.clone();

    // 1. Engine
    let coordinator = engine::Coordinator::new(&config, channel.clone())?;
    coordinator.preload().await;
    let ingest = coordinator
        .start()
        .await
        .context("failed to subscribe to sensor topics")?;

    // 2. Alert feed for the query API
    let feed = api::AlertFeed::new(config.alerts.feed_len);
    feed.follow(channel.as_ref(), &topics::alerts(&namespace))
        .await
        .context("failed to subscribe to alert topic")?;

    // 3. Periodic statistics
    if config.engine.stats_interval_secs > 0 {
        coordinator.spawn_stats_reporter(Duration::from_secs(config.engine.stats_interval_secs));
    }

    // 4. Simulator
    if simulate || config.simulator.enabled {
        simulator::spawn(
            simulator::Simulator::from_config(&config.simulator),
            channel.clone(),
            namespace.clone(),
            Duration::from_millis(config.simulator.interval_ms),
        );
    }

    // 5. Query API
    let state = api::state::AppState::new(coordinator.clone(), feed);
    let api_task = if config.api.enabled {
        let bind = config.api.bind.clone();
        Some(tokio::spawn(async move { api::serve(&bind, state).await }))
    } else {
        None
    };

    tracing::info!(%namespace, "machinewatch running, press ctrl-c to stop");
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown requested");
        }
        res = async {
            match api_task {
                Some(task) => task.await,
                None => std::future::pending().await,
            }
        } => {
            res.context("query API task panicked")??;
        }
    }

    ingest.abort();
    let stats = coordinator.stats().await;
    tracing::info!(
        readings = stats.total_readings,
        anomalies = stats.anomalies_detected,
        machines = stats.machines_monitored,
        "machinewatch stopped"
    );
    Ok(())
}
