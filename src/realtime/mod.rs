//! Reconnecting WebSocket client for server-pushed notifications.
//!
//! One supervisor task owns the socket. It heartbeats while the socket is
//! open, dispatches inbound frames to the listener registry and, after an
//! unexpected close, waits a fixed delay before reconnecting. `disconnect`
//! stops the supervisor wherever it is, including during the reconnect wait.

pub mod registry;
pub mod transport;

use crate::model::{ConnectionEvent, ConnectionState};
use crate::session::Session;
use reqwest::Url;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use registry::{Listener, ListenerId, ListenerRegistry, Subscription};
pub use transport::{Connection, Incoming, Transport, TransportError, WsTransport};

pub const EVENT_NOTIFICATION: &str = "notification";
pub const EVENT_POINTS_UPDATE: &str = "points_update";
pub const EVENT_PONG: &str = "pong";

const PING_FRAME: &str = r#"{"type":"ping"}"#;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has no string `type` field")]
    MissingType,
}

/// Split an inbound text frame into its event type and the full payload.
pub fn parse_frame(text: &str) -> Result<(String, Value), FrameError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_string();
    Ok((kind, value))
}

/// `<base>/ws/<connection_id>?token=<token>`
pub fn socket_url(base: &Url, connection_id: &str, token: &str) -> Result<Url, TransportError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| TransportError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .push("ws")
        .push(connection_id);
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub base_url: Url,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
}

impl RealtimeOptions {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

struct Supervisor {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// State the supervisor task works with.
struct Shared {
    options: RealtimeOptions,
    transport: Arc<dyn Transport>,
    session: Session,
    registry: Arc<ListenerRegistry>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Owned only by client handles, so dropping the last one stops the task.
struct Inner {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(Supervisor { stop, handle }) = self.supervisor.get_mut().take() {
            let _ = stop.send(true);
            handle.abort();
        }
    }
}

enum SessionEnd {
    Stopped,
    Closed(Option<u16>),
}

#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("base_url", &self.inner.shared.options.base_url.as_str())
            .field("state", &self.state())
            .field("registry", &self.inner.shared.registry)
            .finish()
    }
}

impl RealtimeClient {
    pub fn new(options: RealtimeOptions, transport: Arc<dyn Transport>, session: Session) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                shared: Arc::new(Shared {
                    options,
                    transport,
                    session,
                    registry: Arc::new(ListenerRegistry::new()),
                    state,
                    events,
                }),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.shared.events.subscribe()
    }

    pub fn session(&self) -> &Session {
        &self.inner.shared.session
    }

    /// Register a listener for frames whose `type` is `event_type`. Listeners
    /// outlive individual sockets.
    pub fn on<F>(&self, event_type: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let registry = &self.inner.shared.registry;
        let id = registry.add(event_type, Arc::new(callback));
        Subscription::new(registry, event_type, id)
    }

    pub fn off(&self, event_type: &str, id: ListenerId) -> bool {
        self.inner.shared.registry.remove(event_type, id)
    }

    /// Start the connection supervisor. Does nothing while one is running.
    pub async fn connect(&self) {
        let mut slot = self.inner.supervisor.lock().await;
        if let Some(sup) = slot.as_ref() {
            if !sup.handle.is_finished() {
                debug!(state = self.state().as_str(), "connect ignored: already active");
                return;
            }
        }
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(supervise(Arc::clone(&self.inner.shared), stop_rx));
        *slot = Some(Supervisor { stop, handle });
    }

    /// Stop heartbeating, close the socket and cancel any pending reconnect.
    pub async fn disconnect(&self) {
        let supervisor = self.inner.supervisor.lock().await.take();
        if let Some(Supervisor { stop, handle }) = supervisor {
            let _ = stop.send(true);
            if let Err(err) = handle.await {
                warn!(?err, "realtime supervisor ended abnormally");
            }
        }
        self.inner.shared.set_state(ConnectionState::Disconnected);
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn dispatch_frame(&self, text: &str) {
        match parse_frame(text) {
            Ok((kind, payload)) => {
                if self.registry.dispatch(&kind, &payload) == 0 {
                    debug!(kind = %kind, "no listeners for frame type");
                }
            }
            Err(err) => debug!(?err, "dropping inbound frame"),
        }
    }
}

async fn supervise(inner: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut attempt: u64 = 0;
    loop {
        if *stop.borrow() {
            break;
        }
        let token = match inner.session.token().await {
            Ok(Some(token)) => token,
            Ok(None) => {
                info!("no session token; realtime stays disconnected");
                break;
            }
            Err(err) => {
                warn!(?err, "failed to read session token");
                break;
            }
        };
        let url = match inner
            .session
            .connection_id()
            .await
            .map_err(|err| TransportError::Other(err.to_string()))
            .and_then(|cid| socket_url(&inner.options.base_url, &cid, &token))
        {
            Ok(url) => url,
            Err(err) => {
                warn!(?err, "cannot build socket url");
                break;
            }
        };

        attempt += 1;
        inner.set_state(ConnectionState::Connecting);
        inner.emit(ConnectionEvent::Connecting { attempt });
        let opened = tokio::select! {
            res = inner.transport.open(&url) => res,
            _ = stop.changed() => break,
        };

        let code = match opened {
            Ok(conn) => {
                inner.set_state(ConnectionState::Open);
                inner.emit(ConnectionEvent::Open);
                info!(attempt, "realtime connection open");
                match run_session(&inner, conn, &mut stop).await {
                    SessionEnd::Stopped => break,
                    SessionEnd::Closed(code) => code,
                }
            }
            Err(err) => {
                warn!(?err, attempt, "realtime connection failed to open");
                None
            }
        };
        inner.set_state(ConnectionState::Closed);
        inner.emit(ConnectionEvent::Closed { code });

        if !inner.session.is_authenticated().await {
            info!("session ended; not reconnecting");
            break;
        }

        let delay = inner.options.reconnect_delay;
        inner.set_state(ConnectionState::ReconnectWait);
        inner.emit(ConnectionEvent::ReconnectScheduled { delay });
        info!(?code, delay_ms = delay.as_millis() as u64, "realtime connection closed; reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => break,
        }
    }
    inner.set_state(ConnectionState::Disconnected);
    inner.emit(ConnectionEvent::Disconnected);
}

async fn run_session(
    inner: &Shared,
    mut conn: Box<dyn Connection>,
    stop: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let period = inner.options.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    inner.emit(ConnectionEvent::HeartbeatStarted);

    let end = loop {
        tokio::select! {
            _ = stop.changed() => {
                if let Err(err) = conn.close().await {
                    debug!(?err, "error closing realtime socket");
                }
                break SessionEnd::Stopped;
            }
            _ = heartbeat.tick() => {
                if let Err(err) = conn.send_text(PING_FRAME.to_string()).await {
                    warn!(?err, "heartbeat send failed");
                    break SessionEnd::Closed(None);
                }
            }
            incoming = conn.recv() => match incoming {
                Ok(Incoming::Text(text)) => inner.dispatch_frame(&text),
                Ok(Incoming::Closed(code)) => break SessionEnd::Closed(code),
                Err(err) => {
                    warn!(?err, "realtime socket error");
                    break SessionEnd::Closed(None);
                }
            },
        }
    };

    drop(heartbeat);
    inner.emit(ConnectionEvent::HeartbeatStopped);
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_frame_extracts_type() {
        let (kind, value) = parse_frame(r#"{"type":"points_update","points":40}"#).unwrap();
        assert_eq!(kind, "points_update");
        assert_eq!(value, json!({"type": "points_update", "points": 40}));
    }

    #[test]
    fn parse_frame_rejects_garbage() {
        assert!(matches!(parse_frame("{not json"), Err(FrameError::Malformed(_))));
        assert!(matches!(parse_frame(r#"{"kind":"x"}"#), Err(FrameError::MissingType)));
        assert!(matches!(parse_frame(r#"{"type":7}"#), Err(FrameError::MissingType)));
    }

    #[test]
    fn socket_url_layout() {
        let base = Url::parse("wss://api.example.com").unwrap();
        let url = socket_url(&base, "abc-123", "tok en").unwrap();
        assert_eq!(url.as_str(), "wss://api.example.com/ws/abc-123?token=tok+en");

        let base = Url::parse("ws://localhost:8000/backend/").unwrap();
        let url = socket_url(&base, "cid", "t").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8000/backend/ws/cid?token=t");
    }
}
