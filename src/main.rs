use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{info, warn};

use pickup_sync::config;
use pickup_sync::connectivity::{forward_realtime_events, ConnectivityMonitor, HttpProber, Prober};
use pickup_sync::db::open_local_store;
use pickup_sync::feed::{attach_feed, PointsTracker};
use pickup_sync::model::Transition;
use pickup_sync::offline::OfflineCoordinator;
use pickup_sync::realtime::{RealtimeClient, RealtimeOptions, WsTransport, EVENT_NOTIFICATION};
use pickup_sync::replay::HttpReplayer;
use pickup_sync::session::Session;
use pickup_sync::storage::{KeyValueStore, MemoryKv, PendingStore};

/// Probe cadence used when startup finds us offline and periodic probing is off.
const RECOVERY_PROBE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let store = open_local_store(&cfg).await.map(Arc::new);
    let kv: Arc<dyn KeyValueStore> = match &store {
        Some(store) => Arc::clone(store) as Arc<dyn KeyValueStore>,
        None => Arc::new(MemoryKv::new()) as Arc<dyn KeyValueStore>,
    };
    let pending_store = store.map(|store| store as Arc<dyn PendingStore>);
    let session = Session::new(kv);

    let prober: Arc<dyn Prober> = Arc::new(HttpProber::new(
        cfg.health_url()?,
        Duration::from_millis(cfg.health.timeout_ms),
    )?);
    let monitor = Arc::new(
        ConnectivityMonitor::new(Some(prober), true).with_verify_online(cfg.health.verify_online),
    );
    let replayer = Arc::new(HttpReplayer::new(
        cfg.api_base_url()?,
        Duration::from_millis(cfg.api.timeout_ms),
    )?);
    let coordinator = Arc::new(OfflineCoordinator::new(pending_store, replayer));

    if cfg.app.announce_transitions {
        spawn_announcer(&monitor, &coordinator);
    }
    let coordinator_task = coordinator.spawn(monitor.subscribe());

    let online = monitor.check_connection().await;
    let pending = coordinator.refresh_pending_count().await;
    info!(online, pending, queuing = coordinator.queuing_enabled(), "startup state");
    if online && pending > 0 {
        coordinator.sync_pending_requests().await;
    }
    let probe_interval = cfg.probe_interval().or_else(|| {
        (!online).then(|| {
            warn!(
                interval_ms = RECOVERY_PROBE_INTERVAL.as_millis() as u64,
                "offline at startup with periodic probing disabled; probing until reachable"
            );
            RECOVERY_PROBE_INTERVAL
        })
    });
    let probe_task = probe_interval.map(|interval| monitor.spawn_probe_loop(interval));

    let options = RealtimeOptions {
        base_url: cfg.realtime_url()?,
        heartbeat_interval: Duration::from_millis(cfg.realtime.heartbeat_interval_ms),
        reconnect_delay: Duration::from_millis(cfg.realtime.reconnect_delay_ms),
    };
    let client = RealtimeClient::new(options, Arc::new(WsTransport), session);
    let (feed, _feed_sub) = attach_feed(&client, cfg.notifications.feed_capacity);
    let (points, _points_sub) = PointsTracker::attach(&client);
    let _log_sub = client.on(EVENT_NOTIFICATION, |payload| {
        info!(%payload, "notification received");
    });

    let (network_tx, network_rx) = mpsc::channel(16);
    let listener_task = monitor.spawn_event_listener(network_rx);
    let bridge_task = forward_realtime_events(client.subscribe_events(), network_tx);

    info!("starting realtime client");
    client.connect().await;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    client.disconnect().await;
    if let Some(task) = probe_task {
        task.abort();
    }
    coordinator_task.abort();
    bridge_task.abort();
    listener_task.abort();

    let feed_len = feed.lock().map(|f| f.len()).unwrap_or_default();
    info!(
        feed_len,
        points = ?points.balance(),
        pending = coordinator.pending_count(),
        "stopped"
    );
    Ok(())
}

fn spawn_announcer(monitor: &ConnectivityMonitor, coordinator: &OfflineCoordinator) {
    let mut transitions = monitor.subscribe();
    let mut completed = coordinator.subscribe_sync_complete();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                transition = transitions.recv() => match transition {
                    Ok(Transition::WentOffline) => info!("you are offline; changes will be queued"),
                    Ok(Transition::WentOnline) => info!("back online; syncing queued changes"),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                report = completed.recv() => match report {
                    Ok(report) => info!(
                        replayed = report.replayed,
                        failed = report.failed,
                        remaining = report.remaining,
                        "offline sync complete"
                    ),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}
