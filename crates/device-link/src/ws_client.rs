//! One WebSocket session to the device-control server.
//!
//! A [`Session`] owns the read, write and ping pumps of a single
//! transport connection. It knows nothing about reconnection; the
//! manager opens a new session when one is lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use sorthub_protocol::constants::{SEND_BUFFER_SIZE, WS_MAX_MESSAGE_SIZE};

use crate::error::ConnectError;
use crate::pumps::read::Inbound;
use crate::types::DisconnectReason;

/// How long [`Session::close_and_wait`] waits for the write pump.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Called once when the read pump exits.
pub(crate) type DisconnectCallback = Box<dyn FnOnce(DisconnectReason) + Send>;

/// Ping round-trip bookkeeping shared by the ping and read pumps.
#[derive(Debug, Default)]
pub struct RoundTrip {
    sent: Mutex<Option<Instant>>,
    last_ms: AtomicU64,
    samples: AtomicU64,
}

impl RoundTrip {
    /// Stamps an outgoing ping.
    pub fn mark_ping(&self) {
        *self.sent.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    /// Matches a pong with the last stamped ping and records the
    /// round-trip. Unsolicited pongs return `None`.
    pub fn record_pong(&self) -> Option<Duration> {
        let sent = self
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let rtt = sent.elapsed();
        self.last_ms
            .store(rtt.as_millis().min(u64::MAX as u128) as u64, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
        Some(rtt)
    }

    /// Last measured round-trip, if any pong has been seen.
    pub fn last(&self) -> Option<Duration> {
        (self.samples.load(Ordering::Relaxed) > 0)
            .then(|| Duration::from_millis(self.last_ms.load(Ordering::Relaxed)))
    }
}

/// Resolves a `host:port` or URL endpoint to a WebSocket URL.
///
/// `ws://` and `wss://` URLs are used as-is, `http(s)://` is mapped to
/// `ws(s)://`, and bare `host:port` gets `ws://` plus `path`.
pub fn endpoint_url(endpoint: &str, path: &str) -> Result<String, ConnectError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(ConnectError::InvalidEndpoint("empty endpoint".into()));
    }

    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        return Ok(endpoint.to_string());
    }
    if let Some(rest) = endpoint.strip_prefix("http://") {
        return Ok(format!("ws://{rest}"));
    }
    if let Some(rest) = endpoint.strip_prefix("https://") {
        return Ok(format!("wss://{rest}"));
    }
    if endpoint.contains("://") {
        return Err(ConnectError::InvalidEndpoint(format!(
            "unsupported scheme in {endpoint}"
        )));
    }
    if endpoint.contains('/') || endpoint.contains(char::is_whitespace) {
        return Err(ConnectError::InvalidEndpoint(endpoint.to_string()));
    }

    let path = if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    Ok(format!("ws://{endpoint}{path}"))
}

/// A live transport session.
pub struct Session {
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
    read_handle: tokio::task::JoinHandle<()>,
    write_handle: tokio::task::JoinHandle<()>,
    ping_handle: tokio::task::JoinHandle<()>,
}

impl Session {
    /// Opens a WebSocket to `url` and starts the pumps.
    ///
    /// `on_disconnect` runs when the read pump exits, with the reason it
    /// stopped. Dropping the session aborts the pump without calling it.
    pub(crate) async fn open(
        url: &str,
        connect_timeout: Duration,
        inbound: Inbound,
        on_disconnect: DisconnectCallback,
    ) -> Result<Self, ConnectError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

        let connecting = tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false);
        let (ws_stream, _) = match tokio::time::timeout(connect_timeout, connecting).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectError::Timeout),
        };
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(SEND_BUFFER_SIZE);
        let cancel = CancellationToken::new();
        let (failed_tx, failed_rx) = oneshot::channel();

        let write_handle = tokio::spawn(crate::pumps::write::write_pump(
            write,
            write_rx,
            cancel.clone(),
            failed_tx,
        ));

        let ping_handle = tokio::spawn(crate::pumps::ping::ping_pump(
            write_tx.clone(),
            inbound.rtt.clone(),
            inbound.tracker.clone(),
            cancel.clone(),
        ));

        let read_handle = {
            let write_tx = write_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                crate::pumps::read::read_pump(
                    read,
                    inbound,
                    write_tx,
                    failed_rx,
                    cancel.clone(),
                    on_disconnect,
                )
                .await;
                // Read side gone: stop writing and pinging too.
                cancel.cancel();
            })
        };

        debug!(url = %url, "session open");
        Ok(Self {
            write_tx,
            cancel,
            read_handle,
            write_handle,
            ping_handle,
        })
    }

    /// Cloneable sender feeding the write pump.
    pub(crate) fn sender(&self) -> mpsc::Sender<tungstenite::Message> {
        self.write_tx.clone()
    }

    /// Signals shutdown. The write pump sends a close frame on its way out.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Signals shutdown and waits (briefly) for the close frame to be
    /// written before the pumps are torn down.
    pub async fn close_and_wait(mut self) {
        self.cancel.cancel();
        let _ = tokio::time::timeout(CLOSE_GRACE, &mut self.write_handle).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
        self.ping_handle.abort();
    }
}
