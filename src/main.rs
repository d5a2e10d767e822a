use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use weekdesk::calendar::SystemClock;
use weekdesk::config::Config;
use weekdesk::directory::{NameCache, StaticDirectory};
use weekdesk::engine::BookingEngine;
use weekdesk::notify::NotifyHub;
use weekdesk::observability;
use weekdesk::scheduler::{self, ResetScheduler};
use weekdesk::store::SlotStore;
use weekdesk::wire::{self, WireContext};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;

    let store = match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            Arc::new(SlotStore::open(config.layout.clone(), &dir.join("weekdesk.wal"))?)
        }
        None => Arc::new(SlotStore::in_memory(config.layout.clone())),
    };
    let engine = Arc::new(BookingEngine::new(store.clone(), Arc::new(NotifyHub::new())));

    let scheduler = Arc::new(ResetScheduler::new(
        engine.clone(),
        Arc::new(SystemClock),
        config.reset_anchor,
        config.date_labels,
    ));
    tokio::spawn(scheduler.clone().run());
    tokio::spawn(scheduler::run_compactor(store.clone(), config.compact_threshold));

    let directory = StaticDirectory::new(config.directory.clone());
    info!("directory: {} display names", directory.len());
    let names = Arc::new(NameCache::new(Arc::new(directory), config.name_ttl));
    let evicting = names.clone();
    let ttl = config.name_ttl.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ttl);
        loop {
            interval.tick().await;
            evicting.evict_expired();
        }
    });

    let ctx = Arc::new(WireContext {
        engine,
        scheduler: scheduler.clone(),
        names,
    });

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("weekdesk listening on {addr}");
    match &config.data_dir {
        Some(dir) => info!("  data_dir: {}", dir.display()),
        None => info!("  data_dir: none (in-memory)"),
    }
    info!(
        "  layout: {} days x {} resources",
        config.layout.days().len(),
        config.layout.resources().len()
    );
    info!("  reset: {} (next {})", scheduler.anchor(), scheduler.next_fire(None));
    info!("  max_connections: {max_connections}");
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let ctx = ctx.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, ctx).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(DRAIN_TIMEOUT);
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("weekdesk stopped");
    Ok(())
}
