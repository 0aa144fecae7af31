//! Public types for the device link.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use sorthub_protocol::constants::{DEFAULT_WS_PATH, WS_CONNECT_TIMEOUT, WS_REQUEST_TIMEOUT};

use crate::tracker::ReplyRoute;

/// Connection state of the link.
///
/// Only transport callbacks and explicit `connect`/`disconnect` calls
/// move the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    /// Handshake in progress (initial connect or a reconnect attempt).
    Connecting,
    Connected,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed locally.
    Cancelled,
    /// The server sent a close frame.
    PeerClosed,
    /// The stream ended without a close frame.
    StreamEnded,
    /// Nothing arrived before the read deadline.
    PongTimeout,
    /// Transport-level read failure.
    ReadError(String),
    /// Transport-level write failure.
    WriteError(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Cancelled => f.write_str("client disconnect"),
            DisconnectReason::PeerClosed => f.write_str("server closed connection"),
            DisconnectReason::StreamEnded => f.write_str("transport closed"),
            DisconnectReason::PongTimeout => f.write_str("ping timeout"),
            DisconnectReason::ReadError(e) => write!(f, "transport error: {e}"),
            DisconnectReason::WriteError(e) => write!(f, "transport write error: {e}"),
        }
    }
}

/// Lifecycle notifications sent on the channel returned by
/// [`ConnectionManager::take_events`](crate::ConnectionManager::take_events).
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// A reconnect attempt is scheduled.
    Reconnecting { attempt: u32, next_retry_secs: f64 },
    /// Reconnection gave up after `attempts` failures.
    ReconnectFailed { attempts: u32 },
}

/// Best-effort snapshot of the session.
///
/// Serializes to the shape the dashboard consumes:
/// `{connected, transport, ping, reconnectAttempts}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connected: bool,
    pub transport: String,
    /// Last measured ping round-trip in milliseconds (0 until the first pong).
    #[serde(rename = "ping")]
    pub ping_ms: u64,
    pub reconnect_attempts: u32,
}

/// Configuration for reconnection with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Attempts allowed before giving up (must be > 0).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt (must be > 1).
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry `n` (0-based): `min(base_delay * multiplier^n, max_delay)`.
    pub fn delay_for_attempt(&self, n: u32) -> Duration {
        let exp = n.min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Attempt counter driven by the connection manager.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            current_attempt: 0,
        }
    }

    /// Failed attempts since the last successful connect.
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Records a failed attempt.
    ///
    /// Returns the delay before the next attempt, or `None` once
    /// `max_attempts` is reached.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.current_attempt = self.current_attempt.saturating_add(1);
        if self.current_attempt >= self.max_attempts() {
            return None;
        }
        Some(self.config.delay_for_attempt(self.current_attempt - 1))
    }

    /// Called on every successful connect.
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Handshake timeout of a single connect attempt.
    pub connect_timeout: Duration,
    /// Default deadline for correlated requests.
    pub request_timeout: Duration,
    /// Path appended to bare `host:port` endpoints.
    pub ws_path: String,
    /// Retry spontaneous disconnects in the background.
    pub auto_reconnect: bool,
    pub reconnect: ReconnectConfig,
    /// Inbound events that settle pending requests.
    pub reply_routes: Vec<ReplyRoute>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: WS_CONNECT_TIMEOUT,
            request_timeout: WS_REQUEST_TIMEOUT,
            ws_path: DEFAULT_WS_PATH.to_string(),
            auto_reconnect: true,
            reconnect: ReconnectConfig::default(),
            reply_routes: vec![ReplyRoute::print()],
        }
    }
}
