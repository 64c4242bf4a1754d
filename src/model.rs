use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// A mutating HTTP call, captured so it can be replayed later.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestDescriptor {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl RequestDescriptor {
    pub fn new(method: &str, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.trim().to_ascii_uppercase(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Row of the pending request queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingRequest {
    pub id: i64,
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub synced: bool,
    pub created_at: DateTime<Utc>,
}

impl PendingRequest {
    pub fn descriptor(&self) -> RequestDescriptor {
        RequestDescriptor {
            url: self.url.clone(),
            method: self.method.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectivityState {
    pub is_offline: bool,
    pub is_checking_connection: bool,
}

impl ConnectivityState {
    pub fn new(is_offline: bool) -> Self {
        Self {
            is_offline,
            is_checking_connection: false,
        }
    }
}

/// Change of the online/offline flag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Transition {
    WentOnline,
    WentOffline,
}

/// Passive network signal fed into the connectivity monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Online,
    Offline,
}

/// Outcome of one replay pass, also broadcast as the sync-complete signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncReport {
    pub attempted: usize,
    pub replayed: usize,
    pub failed: usize,
    pub purged: u64,
    pub remaining: i64,
}

/// Notification as shown to the user, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedItem {
    pub message: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
    ReconnectWait,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::ReconnectWait => "reconnect_wait",
        }
    }
}

/// Lifecycle notifications emitted by the realtime client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting { attempt: u64 },
    Open,
    HeartbeatStarted,
    HeartbeatStopped,
    Closed { code: Option<u16> },
    ReconnectScheduled { delay: Duration },
    Disconnected,
}
