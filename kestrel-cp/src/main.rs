use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kestrel_coord::{CoordStore, MemCoord};
use kestrel_daemon::{DaemonPool, HttpConnector};
use kestrel_store::{AuditRepo, Repository, SqliteRepository};

use kestrel_cp::alerts::AlertService;
use kestrel_cp::bus::EventBus;
use kestrel_cp::cache::{Cache, RateLimiter};
use kestrel_cp::cluster::ClusterService;
use kestrel_cp::config::Config;
use kestrel_cp::downloads::DownloadManager;
use kestrel_cp::ha::{HaConfig, HaReconciler};
use kestrel_cp::pools::PoolController;
use kestrel_cp::rest::{create_router, AppState};
use kestrel_cp::scheduler::{Scheduler, SoftWeights};
use kestrel_cp::tokens::TokenService;
use kestrel_cp::vms::{VmService, VmStatusReconciler};
use kestrel_cp::volumes::VolumeService;
use kestrel_cp::Leadership;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("kestrel_cp=info".parse()?),
        )
        .init();

    let config = Config::parse();
    let instance_id = config
        .instance_id
        .clone()
        .unwrap_or_else(|| format!("cp-{}", uuid::Uuid::new_v4()));

    info!(
        instance = %instance_id,
        listen = %config.listen,
        dev = config.dev,
        "starting kestrel control plane"
    );

    // Persistence.
    let repo: Arc<dyn Repository> = if config.dev {
        Arc::new(SqliteRepository::open_in_memory().await?)
    } else {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        Arc::new(SqliteRepository::open_with(&config.data_dir, config.db_pool_settings()).await?)
    };

    // Coordination store and leader election.
    let coord = Arc::new(MemCoord::with_session_ttl(config.leader_lease_ttl()));
    let leader_handle = coord
        .campaign(
            "reconcilers",
            &instance_id,
            Box::new(|is_leader| {
                if is_leader {
                    info!("leadership acquired, reconcilers active");
                } else {
                    warn!("leadership lost, reconcilers paused");
                }
            }),
        )
        .await?;
    let leadership: Arc<dyn Leadership> = Arc::new(leader_handle);

    // Shared infrastructure.
    let daemons = Arc::new(DaemonPool::new(Box::new(HttpConnector)));
    let bus = EventBus::new();
    let (vm_ttl, node_ttl, session_ttl) = config.cache_ttls();
    let cache = Arc::new(Cache::with_ttls(vm_ttl, node_ttl, session_ttl));
    let rate_limiter = Arc::new(RateLimiter::new());

    // Services.
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&repo),
        SoftWeights {
            cpu: config.scheduler_cpu_weight,
            memory: config.scheduler_memory_weight,
        },
        config.ha_heartbeat_timeout(),
    ));
    let alerts = Arc::new(AlertService::new(Arc::clone(&repo), Arc::clone(&bus)));
    let vm_service = Arc::new(VmService::new(
        Arc::clone(&repo),
        Arc::clone(&daemons),
        Arc::clone(&coord) as Arc<dyn CoordStore>,
        Arc::clone(&bus),
        Arc::clone(&cache),
        Arc::clone(&scheduler),
    ));
    let volume_service = Arc::new(VolumeService::new(Arc::clone(&repo)));
    let pool_controller = Arc::new(PoolController::new(Arc::clone(&repo), Arc::clone(&daemons)));
    let downloads = Arc::new(
        DownloadManager::new(Arc::clone(&repo), Arc::clone(&daemons), config.dev)
            .with_poll_interval(config.download_poll_interval()),
    );
    let clusters = Arc::new(ClusterService::new(Arc::clone(&repo)));
    let tokens = Arc::new(TokenService::new(Arc::clone(&repo)));
    let ha = Arc::new(HaReconciler::new(
        Arc::clone(&repo),
        Arc::clone(&scheduler),
        Arc::clone(&vm_service),
        Arc::clone(&alerts),
        Arc::clone(&leadership),
        HaConfig {
            enabled: config.ha_enabled,
            check_interval: config.ha_check_interval(),
            heartbeat_timeout: config.ha_heartbeat_timeout(),
            failure_threshold: config.ha_failure_threshold,
        },
    ));
    let status_reconciler = Arc::new(VmStatusReconciler::new(
        Arc::clone(&repo),
        Arc::clone(&daemons),
        Arc::clone(&bus),
        Arc::clone(&cache),
        Arc::clone(&leadership),
        config.status_sync_interval(),
    ));

    // Supervised background tasks, all sharing one shutdown signal.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ha_task = tokio::spawn(Arc::clone(&ha).run(shutdown_rx.clone()));
    let status_task = tokio::spawn(Arc::clone(&status_reconciler).run(shutdown_rx.clone()));
    let poller_task = tokio::spawn(Arc::clone(&downloads).run_poller(shutdown_rx.clone()));
    let retention_task = tokio::spawn(audit_retention(
        Arc::clone(&repo),
        Arc::clone(&leadership),
        config.audit_retention_days,
        shutdown_rx.clone(),
    ));

    // REST server.
    let app_state = Arc::new(AppState {
        repo,
        vms: vm_service,
        volumes: volume_service,
        pools: pool_controller,
        downloads,
        clusters,
        alerts,
        tokens,
        ha,
        bus,
        cache,
        rate_limiter,
        coord: coord as Arc<dyn CoordStore>,
        leadership,
    });
    let router = create_router(app_state);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("REST API listening on {}", config.listen);

    let mut rest_shutdown = shutdown_rx.clone();
    let rest_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                rest_shutdown.changed().await.ok();
            })
            .await
    });

    // Wait for SIGINT/SIGTERM.
    let ctrl_c = signal::ctrl_c();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    let _ = shutdown_tx.send(true);
    let _ = rest_handle.await;
    let _ = ha_task.await;
    let _ = status_task.await;
    let _ = poller_task.await;
    let _ = retention_task.await;

    info!("shutdown complete");
    Ok(())
}

/// Daily leader-only prune of old audit entries.
async fn audit_retention(
    repo: Arc<dyn Repository>,
    leadership: Arc<dyn Leadership>,
    retention_days: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(24 * 3600));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !leadership.is_leader() {
                    continue;
                }
                let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days as i64);
                match repo.audit().prune_before(cutoff).await {
                    Ok(removed) if removed > 0 => {
                        info!(removed = removed, "pruned audit entries");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "audit retention failed"),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
