use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use orepool_core::{MessageBus, SystemClock};
use orepool_relay::{RelaySubscription, ShareRelay, ShareRelayOptions, ShareReceiver, WireFormat};
use orepool_stratum::{BanManager, TlsConfigCache};
use orepoold::config::ClusterConfig;
use orepoold::pool::Pool;
use orepoold::tracing_setup;

mod admin_log {
    use orepool_core::{AdminNotification, MessageBus, ShutdownListener};

    /// Surface admin notifications in the process log. A real deployment
    /// points additional subscribers (persistence, alerting) at the same bus.
    pub fn spawn(bus: &MessageBus, mut shutdown: ShutdownListener) {
        let mut admin = bus.admin.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    event = admin.recv() => match event {
                        Ok(AdminNotification::BlockAccepted { pool_id, block_height, transaction_hash }) => {
                            tracing::info!("[{}] block accepted at height {} ({})", pool_id, block_height, transaction_hash);
                        }
                        Ok(AdminNotification::BlockSubmissionFailed { pool_id, block_height, reason }) => {
                            tracing::warn!("[{}] block submission failed at height {}: {}", pool_id, block_height, reason);
                        }
                        Ok(AdminNotification::DaemonsUnreachable { pool_id }) => {
                            tracing::warn!("[{}] daemons unreachable", pool_id);
                        }
                        Ok(AdminNotification::PoolStartupFailed { pool_id, reason }) => {
                            tracing::error!("[{}] pool failed to start: {}", pool_id, reason);
                        }
                        Err(_) => break,
                    },
                }
            }
        });
    }
}

#[derive(Parser, Debug)]
#[command(name = "orepoold", about = "Multi-currency stratum mining pool server")]
struct Cli {
    /// Path to the cluster configuration document.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Override the configured log file (use "-" to force stdout only).
    #[arg(long)]
    log_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let content = std::fs::read_to_string(&cli.config)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {}", cli.config.display(), e))?;
    let config = ClusterConfig::from_json(&content)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {}", cli.config.display(), e))?;

    let log_file = match cli.log_file.as_deref() {
        Some("-") => None,
        Some(path) => Some(PathBuf::from(path)),
        None => config.log_file.clone(),
    };
    let _log_guard = tracing_setup::init_tracing(log_file.as_deref());

    tracing::info!("----------------------------------");
    tracing::info!("initializing cluster {} ({} pool(s))", config.cluster_name, config.pools.len());
    for pool in &config.pools {
        tracing::info!("\t{}: enabled={}, daemons={}, stratums={}", pool.id, pool.enabled, pool.daemons.len(), pool.stratums.len());
    }
    tracing::info!("----------------------------------");

    let clock = Arc::new(SystemClock);
    let bus = MessageBus::new();
    let ban_manager = Arc::new(BanManager::new(clock.clone(), config.banning.clone()));
    let tls_cache = Arc::new(TlsConfigCache::new());

    let shutdown = orepool_core::ShutdownTrigger::new();
    admin_log::spawn(&bus, shutdown.listener());

    // Cluster-level relay fabric.
    let relay = match &config.share_relay {
        Some(relay_config) => {
            let relay = ShareRelay::new(ShareRelayOptions {
                publish_url: relay_config.publish_url.clone(),
                format: if relay_config.binary_format { WireFormat::Binary } else { WireFormat::Json },
            });
            relay.start(&bus).await.map_err(|e| anyhow::anyhow!("share relay failed to start: {}", e))?;
            Some(relay)
        }
        None => None,
    };

    let receiver = ShareReceiver::new(clock.clone());
    let subscriptions: Vec<RelaySubscription> = config
        .pools
        .iter()
        .flat_map(|pool| pool.external_stratums.iter())
        .map(|external| RelaySubscription {
            url: external.url.clone(),
            topics: external.topics.clone(),
            cluster_name: external.cluster_name.clone(),
        })
        .collect();
    if !subscriptions.is_empty() {
        receiver.start(&bus, subscriptions);
    }

    // Start every enabled pool concurrently: one pool blocked on an
    // unhealthy daemon, or failing fatally, must not hold back its siblings.
    let mut pools: Vec<Arc<Pool>> = Vec::new();
    for pool_config in config.pools.iter().filter(|p| p.enabled).cloned() {
        let pool_id = pool_config.id.clone();
        let pool = match Pool::from_config(
            pool_config,
            config.cluster_name.clone(),
            bus.clone(),
            clock.clone(),
            Arc::clone(&ban_manager),
            Arc::clone(&tls_cache),
        ) {
            Ok(pool) => pool,
            Err(e) => {
                tracing::error!("pool {} construction failed: {}", pool_id, e);
                continue;
            }
        };
        pools.push(Arc::clone(&pool));
        tokio::spawn(async move {
            if let Err(e) = pool.start().await {
                tracing::error!("pool {} failed to start: {}", pool_id, e);
            }
        });
    }

    if pools.is_empty() {
        anyhow::bail!("no pool could be constructed");
    }
    tracing::info!("{} pool(s) starting", pools.len());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested, draining");

    for pool in &pools {
        pool.stop();
    }
    receiver.stop();
    if let Some(relay) = &relay {
        relay.stop();
    }
    shutdown.trigger();

    // Bounded drain window for in-flight sessions and tasks.
    tokio::time::sleep(Duration::from_secs(1)).await;
    tracing::info!("shutdown complete");
    Ok(())
}
