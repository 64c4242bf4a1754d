//! Online/offline tracking that reconciles passive network events with active
//! health probes.

use crate::model::{ConnectionEvent, ConnectivityState, NetworkEvent, Transition};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode, Url};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Active reachability check. Implementations never fail: errors mean "offline".
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Probes a health endpoint with `HEAD`, falling back to `GET` when the
/// server rejects the method.
#[derive(Clone)]
pub struct HttpProber {
    http: Client,
    url: Url,
}

impl fmt::Debug for HttpProber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProber").field("url", &self.url).finish_non_exhaustive()
    }
}

impl HttpProber {
    pub fn new(url: Url, timeout: Duration) -> reqwest::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("pickup-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { http, url })
    }

    async fn send(&self, method: reqwest::Method) -> reqwest::Result<StatusCode> {
        let res = self
            .http
            .request(method, self.url.clone())
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::PRAGMA, "no-cache")
            .send()
            .await?;
        Ok(res.status())
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self) -> bool {
        let status = match self.send(reqwest::Method::HEAD).await {
            Ok(StatusCode::METHOD_NOT_ALLOWED) => self.send(reqwest::Method::GET).await,
            other => other,
        };
        match status {
            Ok(status) if status.is_success() => true,
            Ok(status) => {
                debug!(url = %self.url, %status, "health probe rejected");
                false
            }
            Err(err) => {
                debug!(url = %self.url, ?err, "health probe failed");
                false
            }
        }
    }
}

/// Produces the single "are we offline" signal.
pub struct ConnectivityMonitor {
    prober: Option<Arc<dyn Prober>>,
    verify_online: bool,
    state: watch::Sender<ConnectivityState>,
    transitions: broadcast::Sender<Transition>,
    /// Bumped on every passive offline event; probe results started under an
    /// older value are stale.
    offline_epoch: AtomicU64,
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("state", &*self.state.borrow())
            .field("verify_online", &self.verify_online)
            .finish_non_exhaustive()
    }
}

impl ConnectivityMonitor {
    /// `initially_online` plays the role of the platform's native flag at startup.
    pub fn new(prober: Option<Arc<dyn Prober>>, initially_online: bool) -> Self {
        let (state, _) = watch::channel(ConnectivityState::new(!initially_online));
        let (transitions, _) = broadcast::channel(64);
        Self {
            prober,
            verify_online: true,
            state,
            transitions,
            offline_epoch: AtomicU64::new(0),
        }
    }

    /// When false, a network "online" event is trusted without probing.
    pub fn with_verify_online(mut self, verify: bool) -> Self {
        self.verify_online = verify;
        self
    }

    pub fn is_offline(&self) -> bool {
        self.state.borrow().is_offline
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    pub async fn handle_network_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::Offline => {
                self.offline_epoch.fetch_add(1, Ordering::SeqCst);
                self.set_offline(true);
            }
            NetworkEvent::Online => match (&self.prober, self.verify_online) {
                (Some(_), true) => {
                    self.check_connection().await;
                }
                _ => self.set_offline(false),
            },
        }
    }

    /// Probe now and update the flag. Without a prober the current state is
    /// reported unchanged. A success is dropped if an offline event arrived
    /// while the probe was in flight.
    pub async fn check_connection(&self) -> bool {
        let Some(prober) = self.prober.clone() else {
            return !self.is_offline();
        };
        let epoch = self.offline_epoch.load(Ordering::SeqCst);
        self.state.send_modify(|s| s.is_checking_connection = true);
        let online = prober.probe().await;
        self.state.send_modify(|s| s.is_checking_connection = false);
        if online && self.offline_epoch.load(Ordering::SeqCst) != epoch {
            debug!("probe succeeded after an offline event; ignoring");
            return false;
        }
        self.set_offline(!online);
        online
    }

    /// Probe every `interval` until the returned task is aborted.
    pub fn spawn_probe_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.check_connection().await;
            }
        })
    }

    /// Feed passive events into the monitor until every sender is gone.
    pub fn spawn_event_listener(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<NetworkEvent>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                monitor.handle_network_event(event).await;
            }
        })
    }

    fn set_offline(&self, offline: bool) {
        let changed = self.state.send_if_modified(|s| {
            if s.is_offline == offline {
                return false;
            }
            s.is_offline = offline;
            true
        });
        if changed {
            let transition = if offline {
                Transition::WentOffline
            } else {
                Transition::WentOnline
            };
            info!(?transition, "connectivity changed");
            let _ = self.transitions.send(transition);
        }
    }
}

/// A realtime socket that opens is a passive "online" hint; the monitor still
/// verifies it with a probe when configured to.
pub fn forward_realtime_events(
    mut events: broadcast::Receiver<ConnectionEvent>,
    network: mpsc::Sender<NetworkEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Open) => {
                    if network.send(NetworkEvent::Online).await.is_err() {
                        break;
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct ScriptedProber {
        results: Mutex<VecDeque<bool>>,
        calls: Mutex<usize>,
    }

    impl ScriptedProber {
        fn new(results: Vec<bool>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    fn as_prober(p: &Arc<ScriptedProber>) -> Option<Arc<dyn Prober>> {
        Some(p.clone() as Arc<dyn Prober>)
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self) -> bool {
            *self.calls.lock().unwrap() += 1;
            self.results.lock().unwrap().pop_front().unwrap_or(false)
        }
    }

    #[tokio::test]
    async fn offline_event_is_immediate() {
        let prober = ScriptedProber::new(vec![]);
        let monitor = ConnectivityMonitor::new(as_prober(&prober), true);
        assert!(!monitor.is_offline());
        monitor.handle_network_event(NetworkEvent::Offline).await;
        assert!(monitor.is_offline());
        assert_eq!(prober.calls(), 0);
    }

    #[tokio::test]
    async fn online_event_waits_for_probe() {
        let prober = ScriptedProber::new(vec![false, true]);
        let monitor = ConnectivityMonitor::new(as_prober(&prober), false);
        let mut transitions = monitor.subscribe();

        monitor.handle_network_event(NetworkEvent::Online).await;
        assert!(monitor.is_offline(), "failed probe must keep us offline");

        monitor.handle_network_event(NetworkEvent::Online).await;
        assert!(!monitor.is_offline());
        assert_eq!(prober.calls(), 2);
        assert_eq!(transitions.try_recv().unwrap(), Transition::WentOnline);
        assert!(transitions.try_recv().is_err());
    }

    #[tokio::test]
    async fn online_event_without_verification_flips_immediately() {
        let monitor = ConnectivityMonitor::new(None, false);
        monitor.handle_network_event(NetworkEvent::Online).await;
        assert!(!monitor.is_offline());

        let prober = ScriptedProber::new(vec![false]);
        let monitor = ConnectivityMonitor::new(as_prober(&prober), false).with_verify_online(false);
        monitor.handle_network_event(NetworkEvent::Online).await;
        assert!(!monitor.is_offline());
        assert_eq!(prober.calls(), 0);
    }

    #[tokio::test]
    async fn flag_tracks_latest_event_sequence() {
        let prober = ScriptedProber::new(vec![true; 8]);
        let monitor = ConnectivityMonitor::new(as_prober(&prober), true);
        let events = [
            NetworkEvent::Offline,
            NetworkEvent::Offline,
            NetworkEvent::Online,
            NetworkEvent::Offline,
            NetworkEvent::Online,
            NetworkEvent::Online,
        ];
        for event in events {
            monitor.handle_network_event(event).await;
            assert_eq!(monitor.is_offline(), event == NetworkEvent::Offline);
        }
    }

    #[tokio::test]
    async fn check_connection_reports_and_resets_checking_flag() {
        let prober = ScriptedProber::new(vec![false]);
        let monitor = ConnectivityMonitor::new(as_prober(&prober), true);
        assert!(!monitor.check_connection().await);
        let state = monitor.state();
        assert!(state.is_offline);
        assert!(!state.is_checking_connection);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_loop_recovers() {
        let prober = ScriptedProber::new(vec![false, true]);
        let monitor = Arc::new(ConnectivityMonitor::new(as_prober(&prober), true));
        let mut state = monitor.watch_state();
        let handle = monitor.spawn_probe_loop(Duration::from_secs(10));

        state.wait_for(|s| s.is_offline).await.unwrap();
        state.wait_for(|s| !s.is_offline).await.unwrap();
        assert_eq!(prober.calls(), 2);
        handle.abort();
    }

    /// Signals when a probe starts and holds it until released.
    #[derive(Default)]
    struct GatedProber {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Prober for GatedProber {
        async fn probe(&self) -> bool {
            self.started.notify_one();
            self.release.notified().await;
            true
        }
    }

    #[tokio::test]
    async fn offline_event_during_probe_wins() {
        let prober = Arc::new(GatedProber::default());
        let monitor = Arc::new(ConnectivityMonitor::new(
            Some(prober.clone() as Arc<dyn Prober>),
            false,
        ));
        let mut transitions = monitor.subscribe();

        let verifying = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.handle_network_event(NetworkEvent::Online).await })
        };
        prober.started.notified().await;
        assert!(monitor.state().is_checking_connection);

        monitor.handle_network_event(NetworkEvent::Offline).await;
        prober.release.notify_one();
        verifying.await.unwrap();

        assert!(monitor.is_offline(), "latest event was offline");
        assert!(!monitor.state().is_checking_connection);
        assert!(transitions.try_recv().is_err());

        // a probe started after the offline event still counts
        let again = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.handle_network_event(NetworkEvent::Online).await })
        };
        prober.started.notified().await;
        prober.release.notify_one();
        again.await.unwrap();
        assert!(!monitor.is_offline());
    }

    #[tokio::test]
    async fn event_listener_applies_passive_events() {
        let monitor = Arc::new(ConnectivityMonitor::new(None, true));
        let mut state = monitor.watch_state();
        let (tx, rx) = mpsc::channel(4);
        let handle = monitor.spawn_event_listener(rx);

        tx.send(NetworkEvent::Offline).await.unwrap();
        state.wait_for(|s| s.is_offline).await.unwrap();
        tx.send(NetworkEvent::Online).await.unwrap();
        state.wait_for(|s| !s.is_offline).await.unwrap();

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn realtime_open_is_forwarded_as_online() {
        let (events_tx, events_rx) = broadcast::channel(8);
        let (net_tx, mut net_rx) = mpsc::channel(8);
        let handle = forward_realtime_events(events_rx, net_tx);

        events_tx.send(ConnectionEvent::Connecting { attempt: 1 }).unwrap();
        events_tx.send(ConnectionEvent::Open).unwrap();
        events_tx.send(ConnectionEvent::Closed { code: Some(1006) }).unwrap();
        drop(events_tx);

        assert_eq!(net_rx.recv().await, Some(NetworkEvent::Online));
        handle.await.unwrap();
        assert_eq!(net_rx.recv().await, None);
    }
}
