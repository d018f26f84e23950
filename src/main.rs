use std::env;
use std::time::Duration;

use anyhow::Context;
use distlock::{DistributedLock, LockConfig, LockManager, RedisBackend};
use tokio::{signal, time};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "distlock=debug,distlock_runner=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = LockConfig::from_env()?;
    let job_name = env::var("DISTLOCK_JOB_NAME").unwrap_or_else(|_| "heartbeat".to_string());
    let interval = match env::var("DISTLOCK_JOB_INTERVAL_SECS") {
        Ok(raw) => Duration::from_secs(
            raw.trim()
                .parse()
                .with_context(|| format!("DISTLOCK_JOB_INTERVAL_SECS must be an integer, got {:?}", raw))?,
        ),
        Err(_) => Duration::from_secs(30),
    };
    anyhow::ensure!(!interval.is_zero(), "DISTLOCK_JOB_INTERVAL_SECS must be greater than 0");

    info!(
        "Starting distlock-runner for job {} every {:?} ({} policy)",
        job_name, interval, config.failure_policy
    );

    let backend = RedisBackend::connect(&config.redis_url)
        .await
        .context("failed to connect to lock backend")?;
    let ttl = config.default_ttl;
    let manager = LockManager::new(backend, config);
    let key = manager.key_for(&job_name)?;

    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let outcome: anyhow::Result<Option<()>> = manager
                    .with_lock(&key, ttl, || run_job(&job_name))
                    .await;
                match outcome {
                    Ok(Some(())) => {}
                    Ok(None) => info!("Skipped {}: another instance holds the lock", job_name),
                    Err(e) => error!("Job {} failed: {:#}", job_name, e),
                }
            }
        }
    }

    let released = manager.release_all().await;
    info!("Released {} lock(s) on shutdown", released);
    info!("Lock metrics: {}", manager.metrics().snapshot());
    Ok(())
}

async fn run_job(job_name: &str) -> anyhow::Result<()> {
    info!("Running job {}", job_name);
    time::sleep(Duration::from_millis(250)).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, releasing held locks");
        },
        _ = terminate => {
            info!("Received SIGTERM, releasing held locks");
        }
    }
}
