//! Outbound monitor channels.
//!
//! The daemon pushes telemetry to configured external monitor endpoints
//! over the same text-frame protocol the console speaks; monitor
//! connections are born authenticated. Connects are strictly serialized:
//! one attempt per reactor tick, taken from the head of a due-sorted
//! pending queue, and the connect itself is synchronous: DNS resolution
//! and the TCP handshake block the reactor for that operation, an
//! explicit, accepted latency cost.
//!
//! Endpoints are keyed by URI stripped of its query string, so one live
//! connection exists per logical endpoint regardless of appended
//! parameters (`?ServerId=...`).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use scrivd_core::config::MonitorConfig;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};

/// A scheduled connect attempt.
#[derive(Debug, Clone)]
pub struct PendingConnect {
    /// Full URI to dial, query string included.
    pub uri: String,
    /// Earliest time the attempt may run.
    pub due: Instant,
}

/// One live (or connecting) monitor channel.
pub struct MonitorChannel {
    /// Full URI this channel was dialed with.
    pub uri: String,
    tx: UnboundedSender<String>,
    writable: bool,
    buffered: Vec<String>,
}

impl MonitorChannel {
    /// A channel in the `connecting` state; output is buffered until
    /// [`MonitorChannel::mark_writable`].
    #[must_use]
    pub fn connecting(uri: String, tx: UnboundedSender<String>) -> Self {
        Self {
            uri,
            tx,
            writable: false,
            buffered: Vec::new(),
        }
    }

    /// Transition `connecting → writable` once the handshake completed;
    /// flushes anything withheld meanwhile.
    pub fn mark_writable(&mut self) {
        self.writable = true;
        for message in self.buffered.drain(..) {
            let _ = self.tx.send(message);
        }
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.writable
    }

    /// Queue one text frame; withheld while still connecting.
    pub fn send(&mut self, message: &str) {
        if self.writable {
            let _ = self.tx.send(message.to_string());
        } else {
            self.buffered.push(message.to_string());
        }
    }
}

/// Strip the query string from a monitor URI.
#[must_use]
pub fn strip_query(uri: &str) -> &str {
    uri.split('?').next().unwrap_or(uri)
}

/// Manager of configured endpoints, live channels and pending connects.
pub struct MonitorManager {
    configured: Vec<MonitorConfig>,
    channels: HashMap<String, MonitorChannel>,
    pending: Vec<PendingConnect>,
}

impl MonitorManager {
    /// Create a manager over the configured endpoint list.
    #[must_use]
    pub fn new(configured: Vec<MonitorConfig>) -> Self {
        Self {
            configured,
            channels: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Schedule every configured endpoint for an immediate connect,
    /// tagging the dial URI with this server's identity.
    pub fn start_all(&mut self, server_id: &str, now: Instant) {
        if self.configured.is_empty() {
            debug!("no monitors configured");
            return;
        }
        let uris: Vec<String> = self
            .configured
            .iter()
            .map(|m| format!("{}?ServerId={server_id}", m.uri))
            .collect();
        for uri in uris {
            self.schedule_connect(uri, now);
        }
    }

    /// Insert a pending connect keeping the queue sorted by due time, so
    /// head-only inspection per tick never starves an earlier entry.
    pub fn schedule_connect(&mut self, uri: String, due: Instant) {
        let at = self
            .pending
            .partition_point(|p| p.due <= due);
        self.pending.insert(at, PendingConnect { uri, due });
    }

    /// Pop the head of the queue if its due time has passed.
    pub fn take_due(&mut self, now: Instant) -> Option<PendingConnect> {
        if self.pending.first().is_some_and(|p| p.due <= now) {
            Some(self.pending.remove(0))
        } else {
            None
        }
    }

    /// Whether a live channel already exists for this URI's endpoint.
    #[must_use]
    pub fn has_channel(&self, uri: &str) -> bool {
        self.channels.contains_key(strip_query(uri))
    }

    /// Register a channel under its logical endpoint key.
    pub fn register(&mut self, channel: MonitorChannel) {
        let key = strip_query(&channel.uri).to_string();
        info!(uri = %key, "connected to remote monitor");
        self.channels.insert(key, channel);
    }

    /// Handle a disconnect. If the endpoint is still configured, the dead
    /// channel is dropped and a reconnect is scheduled after exactly its
    /// configured retry interval; otherwise it is simply dropped.
    pub fn on_disconnect(&mut self, uri: &str, now: Instant) {
        let key = strip_query(uri).to_string();
        self.channels.remove(&key);

        let retry = self
            .configured
            .iter()
            .find(|m| m.uri.eq_ignore_ascii_case(&key))
            .map(|m| m.retry_interval_secs);
        match retry {
            Some(secs) => {
                error!(uri, retry_secs = secs, "monitor disconnected, re-trying");
                self.schedule_connect(uri.to_string(), now + Duration::from_secs(secs));
            },
            None => debug!(uri, "monitor no longer configured, dropping"),
        }
    }

    /// Apply a new configured endpoint list: channels for endpoints no
    /// longer configured are dropped, new endpoints are scheduled.
    pub fn update(&mut self, configured: Vec<MonitorConfig>, server_id: &str, now: Instant) {
        let keep: Vec<String> = configured.iter().map(|m| m.uri.clone()).collect();
        self.channels
            .retain(|key, _| keep.iter().any(|u| u.eq_ignore_ascii_case(key)));
        let known: Vec<String> = self.configured.iter().map(|m| m.uri.clone()).collect();
        let fresh: Vec<String> = configured
            .iter()
            .map(|m| m.uri.clone())
            .filter(|u| !known.iter().any(|k| k.eq_ignore_ascii_case(u)))
            .collect();
        self.configured = configured;
        for uri in fresh {
            self.schedule_connect(format!("{uri}?ServerId={server_id}"), now);
        }
    }

    /// Whether a live channel to a controller endpoint exists.
    #[must_use]
    pub fn has_controller_connection(&self) -> bool {
        self.channels.keys().any(|key| key.contains("controller"))
    }

    /// Push one text frame to every monitor channel.
    pub fn broadcast(&mut self, message: &str) {
        for channel in self.channels.values_mut() {
            channel.send(message);
        }
    }

    /// Number of live channels, for state dumps.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Parse `tcp://host:port[/path]` into a dialable `host:port`.
#[must_use]
pub fn dial_address(uri: &str) -> Option<String> {
    let rest = strip_query(uri).strip_prefix("tcp://")?;
    let authority = rest.split('/').next()?;
    if authority.is_empty() || !authority.contains(':') {
        return None;
    }
    Some(authority.to_string())
}
