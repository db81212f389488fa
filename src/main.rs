//! Rotor Relay - Entry Point
//!
//! Starts the relay and the metrics flusher with graceful shutdown support.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rotor::commander::InMemoryCommander;
use rotor::config::{Config, LogConfig};
use rotor::proxy::fingerprint::CipherShuffler;
use rotor::proxy::probe::{self, ProbeOptions};
use rotor::proxy::{MetricsAggregator, ProxyHandler, ProxyServer, RelaySettings, TransportRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;
    init_tracing(&config.log);

    info!("Starting Rotor relay");

    let registry = Arc::new(TransportRegistry::with_defaults());
    let commander = Arc::new(match &config.inventory {
        Some(path) => InMemoryCommander::load(path, &registry)
            .await
            .with_context(|| format!("Failed to load inventory {}", path))?,
        None => {
            warn!("ROTOR_INVENTORY not set, starting without projects");
            InMemoryCommander::new()
        }
    });

    if let Some(options) = ProbeOptions::from_config(&config.fingerprint) {
        probe_proxies(&commander, &registry, &options).await;
    }

    let (shutdown_tx, _) = watch::channel(false);

    let metrics = Arc::new(MetricsAggregator::new(
        commander.clone(),
        config.metrics.flush_interval,
    ));
    let metrics_shutdown = shutdown_tx.subscribe();
    let metrics_task = {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            metrics.run(metrics_shutdown).await;
        })
    };

    let handler = Arc::new(ProxyHandler::new(
        commander.clone(),
        registry,
        metrics,
        RelaySettings::from(&config.relay),
    )?);
    let relay = ProxyServer::new(config.relay_addr(), handler);

    let relay_shutdown = shutdown_tx.subscribe();
    let relay_task = tokio::spawn(async move {
        if let Err(e) = relay.run(relay_shutdown).await {
            error!("Relay error: {}", e);
        }
    });

    info!("Relay started on {}", config.relay_addr());

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(relay_task, metrics_task);

    info!("Rotor relay stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rotor={}", log.level).into());

    if log.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Fingerprint every inventory proxy once, logging where each one exits
async fn probe_proxies(
    commander: &InMemoryCommander,
    registry: &TransportRegistry,
    options: &ProbeOptions,
) {
    let shuffler = match CipherShuffler::new() {
        Ok(shuffler) => shuffler,
        Err(e) => {
            warn!("Fingerprint probe disabled: {}", e);
            return;
        }
    };

    for proxy in commander.all_proxies() {
        let project = commander.project(&proxy.project_id);
        let tls = match probe::fingerprint_tls(&shuffler, project.as_ref(), &proxy.id) {
            Ok(tls) => tls,
            Err(e) => {
                warn!(proxy_id = %proxy.id, "Cannot probe proxy: {}", e);
                continue;
            }
        };
        let transport = match registry.get_by_name(&proxy.transport_type) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(proxy_id = %proxy.id, "Cannot probe proxy: {}", e);
                continue;
            }
        };
        match probe::fingerprint(transport.as_ref(), &proxy, options, tls).await {
            Ok(fingerprint) => info!(
                proxy_id = %proxy.id,
                ip = %fingerprint.ip,
                country = fingerprint.country_code.as_deref().unwrap_or("-"),
                "Proxy fingerprinted"
            ),
            Err(e) => warn!(proxy_id = %proxy.id, "Fingerprint failed: {}", e),
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
