//! Connection manager for the device-control server.
//!
//! Owns the transport session, the subscriber registry and the pending
//! request map, tracks connection state, and reconnects with exponential
//! backoff after unexpected disconnects.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};

use sorthub_protocol::constants::EventName;
use sorthub_protocol::envelope::Frame;

use crate::dispatcher::{Callback, EventDispatcher, Subscription};
use crate::error::{ConnectError, RequestError};
use crate::reconnection::{LinkContext, cancel_any_reconnect, establish};
use crate::tracker::RequestTracker;
use crate::types::{
    ClientConfig, ConnectionEvent, ConnectionInfo, ConnectionState, DisconnectReason,
    ReconnectPolicy,
};
use crate::ws_client::{RoundTrip, endpoint_url};

const EVENT_CHANNEL_SIZE: usize = 64;

/// Connection manager for one device-control endpoint.
pub struct ConnectionManager {
    ctx: LinkContext,
    events_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    /// Serialises `connect()` and `disconnect()`.
    connect_lock: Mutex<()>,
}

impl ConnectionManager {
    /// Creates a disconnected manager.
    pub fn new(config: ClientConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let policy = ReconnectPolicy::new(config.reconnect.clone());
        let tracker = RequestTracker::new(config.reply_routes.clone());

        Self {
            ctx: LinkContext {
                config,
                endpoint: Arc::new(std::sync::Mutex::new(None)),
                state: Arc::new(state),
                session: Arc::new(Mutex::new(None)),
                outbound: Arc::new(std::sync::Mutex::new(None)),
                next_session: Arc::new(AtomicU64::new(0)),
                live_session: Arc::new(AtomicU64::new(0)),
                dispatcher: Arc::new(EventDispatcher::new()),
                tracker: Arc::new(tracker),
                rtt: Arc::new(RoundTrip::default()),
                policy: Arc::new(std::sync::Mutex::new(policy)),
                events_tx,
                reconnect_cancel: Arc::new(std::sync::Mutex::new(None)),
                manual_disconnect: Arc::new(AtomicBool::new(false)),
                ever_connected: Arc::new(AtomicBool::new(false)),
            },
            events_rx: Mutex::new(Some(events_rx)),
            connect_lock: Mutex::new(()),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Connects to `endpoint` (`host:port` or a `ws://` URL).
    ///
    /// Returns immediately if already connected. Failed attempts are
    /// retried after the backoff delay until one succeeds or the policy
    /// runs out of attempts.
    pub async fn connect(&self, endpoint: &str) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Ok(());
        }
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let url = endpoint_url(endpoint, &self.ctx.config.ws_path)?;
        cancel_any_reconnect(&self.ctx.reconnect_cancel);
        self.ctx.manual_disconnect.store(false, Ordering::SeqCst);
        self.lock_policy().reset();
        *self
            .ctx
            .endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(url.clone());
        let cancel = self.ctx.arm_reconnect_token();

        info!(url = %url, "connecting to device server");
        loop {
            self.ctx.set_state(ConnectionState::Connecting);
            let err = match establish(&self.ctx, &cancel).await {
                Ok(()) => return Ok(()),
                Err(ConnectError::Cancelled) => return Err(ConnectError::Cancelled),
                Err(e) => e,
            };

            warn!(url = %url, error = %err, "connect attempt failed");
            self.ctx.set_state(ConnectionState::Disconnected);
            self.ctx.dispatch_local(
                EventName::ConnectError,
                serde_json::json!({ "error": err.to_string() }),
            );

            let (attempt, next) = {
                let mut policy = self.lock_policy();
                let next = policy.record_failure();
                (policy.current_attempt(), next)
            };
            let Some(delay) = next else {
                self.ctx
                    .notify(ConnectionEvent::ReconnectFailed { attempts: attempt });
                return Err(ConnectError::MaxAttemptsExceeded {
                    attempts: attempt,
                    last: err.to_string(),
                });
            };

            self.ctx.notify(ConnectionEvent::Reconnecting {
                attempt,
                next_retry_secs: delay.as_secs_f64(),
            });
            self.ctx.dispatch_local(
                EventName::ReconnectAttempt,
                serde_json::json!({ "attempt": attempt }),
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Closes the session, rejects every pending request and clears all
    /// subscriptions. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        self.ctx.manual_disconnect.store(true, Ordering::SeqCst);
        cancel_any_reconnect(&self.ctx.reconnect_cancel);
        let _guard = self.connect_lock.lock().await;

        let session = {
            let mut slot = self.ctx.session.lock().await;
            self.ctx.live_session.store(0, Ordering::SeqCst);
            self.ctx.set_outbound(None);
            slot.take()
        };
        if let Some(session) = session {
            session.close_and_wait().await;
            self.ctx.dispatch_local(
                EventName::Disconnect,
                serde_json::json!({ "reason": DisconnectReason::Cancelled.to_string() }),
            );
            info!("disconnected from device server");
        }

        let rejected = self.ctx.tracker.cancel_all();
        if rejected > 0 {
            debug!(rejected, "pending requests cancelled");
        }
        self.ctx.dispatcher.clear();
        self.ctx.set_state(ConnectionState::Disconnected);
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.current_state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.ctx.current_state()
    }

    /// Snapshot of the connection, or `None` if never connected.
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        if !self.ctx.ever_connected.load(Ordering::Relaxed) {
            return None;
        }
        Some(ConnectionInfo {
            connected: self.is_connected(),
            transport: "websocket".into(),
            ping_ms: self
                .ctx
                .rtt
                .last()
                .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
                .unwrap_or(0),
            reconnect_attempts: self.lock_policy().current_attempt(),
        })
    }

    /// Sends a fire-and-forget event. Never suspends.
    pub fn emit<T: Serialize>(&self, event: &str, payload: &T) -> Result<(), RequestError> {
        self.emit_frame(&Frame::new(event, payload)?)
    }

    pub fn emit_frame(&self, frame: &Frame) -> Result<(), RequestError> {
        let tx = self.ctx.outbound().ok_or(RequestError::NotConnected)?;
        let text = frame.encode()?;
        tx.try_send(tungstenite::Message::Text(text.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => RequestError::SendBufferFull,
                mpsc::error::TrySendError::Closed(_) => RequestError::NotConnected,
            })
    }

    /// Sends `payload` on `event` and waits for the reply correlated by
    /// `key`.
    ///
    /// Fails at once with [`RequestError::NotConnected`],
    /// [`RequestError::EmptyKey`] or [`RequestError::DuplicateRequest`]. Dropping the returned future
    /// frees `key`.
    pub async fn send_request<T: Serialize>(
        &self,
        key: &str,
        event: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<serde_json::Value, RequestError> {
        if !self.is_connected() {
            return Err(RequestError::NotConnected);
        }
        let frame = Frame::new(event, payload)?;
        let pending = self.ctx.tracker.register(key, timeout)?;
        self.emit_frame(&frame)?;
        debug!(key = %key, event = %event, "request sent");
        pending.wait().await
    }

    /// Like [`send_request`](Self::send_request) with the configured
    /// request timeout.
    pub async fn request<T: Serialize>(
        &self,
        key: &str,
        event: &str,
        payload: &T,
    ) -> Result<serde_json::Value, RequestError> {
        self.send_request(key, event, payload, self.ctx.config.request_timeout)
            .await
    }

    /// Waits for the next `event` from the server.
    ///
    /// The subscription is made by this call, before the future is first
    /// polled, so a command sent after calling it cannot race the reply.
    /// Dropping the future ends the subscription.
    pub fn wait_for(
        &self,
        event: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<serde_json::Value, RequestError>> + Send {
        let (tx, rx) = oneshot::channel();
        let slot = std::sync::Mutex::new(Some(tx));
        let subscription = self.ctx.dispatcher.on_scoped(event, move |payload| {
            if let Some(tx) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(payload.clone());
            }
        });
        let event = event.to_string();

        async move {
            let _subscription = subscription;
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(payload)) => Ok(payload),
                // disconnect() cleared the registry and dropped the sender.
                Ok(Err(_)) => Err(RequestError::ConnectionClosed),
                Err(_) => Err(RequestError::Timeout(event)),
            }
        }
    }

    pub fn on<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.ctx.dispatcher.on(event, callback)
    }

    pub fn subscribe(&self, event: &str, callback: Callback) -> Subscription {
        self.ctx.dispatcher.subscribe(event, callback)
    }

    pub fn off(&self, subscription: &Subscription) -> bool {
        self.ctx.dispatcher.off(subscription)
    }

    pub fn off_callback(&self, event: &str, callback: &Callback) -> bool {
        self.ctx.dispatcher.off_callback(event, callback)
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.ctx.dispatcher
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.ctx.tracker
    }

    fn lock_policy(&self) -> std::sync::MutexGuard<'_, ReconnectPolicy> {
        self.ctx.lock_policy()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.ctx.manual_disconnect.store(true, Ordering::SeqCst);
        cancel_any_reconnect(&self.ctx.reconnect_cancel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::test_server::{TestServer, eventually};
    use crate::types::ReconnectConfig;

    fn fast_config() -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_secs(2),
            reconnect: ReconnectConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
            },
            ..ClientConfig::default()
        }
    }

    async fn connected(server: &TestServer) -> Arc<ConnectionManager> {
        let manager = Arc::new(ConnectionManager::new(fast_config()));
        manager.connect(&server.endpoint()).await.unwrap();
        manager
    }

    #[test]
    fn new_manager_is_disconnected() {
        let manager = ConnectionManager::new(ClientConfig::default());
        assert!(!manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.connection_info().is_none());
    }

    #[tokio::test]
    async fn take_events_only_once() {
        let manager = ConnectionManager::new(ClientConfig::default());
        assert!(manager.take_events().await.is_some());
        assert!(manager.take_events().await.is_none());
    }

    #[tokio::test]
    async fn emit_and_request_fail_when_disconnected() {
        let manager = ConnectionManager::new(ClientConfig::default());
        assert!(matches!(
            manager.emit("get_system_status", &json!({})),
            Err(RequestError::NotConnected)
        ));
        let result = manager
            .send_request("ORD-1", "print_qr", &json!({}), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(RequestError::NotConnected)));
        assert_eq!(manager.tracker().pending_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_when_idle_is_noop() {
        let manager = ConnectionManager::new(ClientConfig::default());
        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn invalid_endpoint_fails_without_retry() {
        let manager = ConnectionManager::new(fast_config());
        let err = manager.connect("ftp://pi:21").await.unwrap_err();
        assert!(matches!(err, ConnectError::InvalidEndpoint(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let server = TestServer::start().await;
        let manager = connected(&server).await;
        manager.connect(&server.endpoint()).await.unwrap();

        assert!(manager.is_connected());
        assert_eq!(server.accepted(), 1);

        let info = manager.connection_info().unwrap();
        assert!(info.connected);
        assert_eq!(info.transport, "websocket");
        assert_eq!(info.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn refused_connect_gives_up_after_max_attempts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let manager = ConnectionManager::new(fast_config());
        let mut events = manager.take_events().await.unwrap();
        let attempts = Arc::new(std::sync::Mutex::new(Vec::new()));
        let a = attempts.clone();
        manager.on("reconnect_attempt", move |v| {
            a.lock().unwrap().push(v["attempt"].as_u64().unwrap());
        });

        let err = manager.connect(&addr.to_string()).await.unwrap_err();
        match err {
            ConnectError::MaxAttemptsExceeded { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected MaxAttemptsExceeded, got {other:?}"),
        }
        assert_eq!(*attempts.lock().unwrap(), vec![1, 2]);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let mut gave_up = false;
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::ReconnectFailed { attempts } = event {
                assert_eq!(attempts, 3);
                gave_up = true;
            }
        }
        assert!(gave_up);
    }

    #[tokio::test]
    async fn disconnect_during_retries_cancels_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClientConfig {
            reconnect: ReconnectConfig {
                max_attempts: 10,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(30),
                multiplier: 1.0,
            },
            ..fast_config()
        };
        let manager = Arc::new(ConnectionManager::new(config));
        let attempted = Arc::new(AtomicBool::new(false));
        let a = attempted.clone();
        manager.on("reconnect_attempt", move |_| a.store(true, Ordering::SeqCst));

        let m = manager.clone();
        let connecting = tokio::spawn(async move { m.connect(&addr.to_string()).await });
        // The first attempt fails; connect is now sleeping before the second.
        assert!(eventually(|| attempted.load(Ordering::SeqCst)).await);

        tokio::time::timeout(Duration::from_secs(2), manager.disconnect())
            .await
            .expect("disconnect does not wait out the backoff");
        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(ConnectError::Cancelled)), "got {result:?}");
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn silent_server_hits_handshake_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let config = ClientConfig {
            connect_timeout: Duration::from_millis(100),
            reconnect: ReconnectConfig {
                max_attempts: 1,
                ..fast_config().reconnect
            },
            ..fast_config()
        };
        let manager = ConnectionManager::new(config);
        match manager.connect(&addr.to_string()).await {
            Err(ConnectError::MaxAttemptsExceeded { attempts, last }) => {
                assert_eq!(attempts, 1);
                assert_eq!(last, ConnectError::Timeout.to_string());
            }
            other => panic!("expected MaxAttemptsExceeded, got {other:?}"),
        }
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        silent.abort();
    }

    #[tokio::test]
    async fn emit_reports_full_send_buffer() {
        let manager = ConnectionManager::new(ClientConfig::default());
        let (tx, rx) = mpsc::channel(1);
        manager.ctx.set_outbound(Some(tx));

        manager.emit("get_system_status", &json!({})).unwrap();
        assert!(matches!(
            manager.emit("get_system_status", &json!({})),
            Err(RequestError::SendBufferFull)
        ));

        // A write pump that has gone away reads as not connected.
        drop(rx);
        assert!(matches!(
            manager.emit("get_system_status", &json!({})),
            Err(RequestError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn request_with_empty_key_is_refused() {
        let server = TestServer::start().await;
        let manager = connected(&server).await;
        let result = manager
            .send_request("", "print_qr", &json!({}), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(RequestError::EmptyKey)));
        assert_eq!(manager.tracker().pending_count(), 0);
    }

    #[tokio::test]
    async fn qr_detected_reaches_subscriber_once() {
        let server = TestServer::start().await;
        let manager = connected(&server).await;

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let s = seen.clone();
        manager.on("qr_detected", move |v| s.lock().unwrap().push(v.clone()));

        server.push("qr_detected", json!({"data": "ABC123"}));

        assert!(eventually(|| !seen.lock().unwrap().is_empty()).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![json!({"data": "ABC123"})]);
    }

    #[tokio::test]
    async fn emit_reaches_server() {
        let mut server = TestServer::start().await;
        let manager = connected(&server).await;

        manager
            .emit("test_message", &json!({"message": "hello"}))
            .unwrap();

        let frame = server.next_frame().await;
        assert_eq!(frame.event, "test_message");
        assert_eq!(frame.data_or_null()["message"], "hello");
    }

    #[tokio::test]
    async fn request_resolves_on_matching_reply() {
        let mut server = TestServer::start().await;
        let manager = connected(&server).await;

        let m = manager.clone();
        let request = tokio::spawn(async move {
            m.send_request(
                "ORD-1",
                "print_qr",
                &json!({"order_number": "ORD-1", "qr_data": "X"}),
                Duration::from_secs(30),
            )
            .await
        });

        let frame = server.next_frame().await;
        assert_eq!(frame.event, "print_qr");
        server.push("print_success", json!({"order_number": "ORD-1"}));

        let reply = tokio::time::timeout(Duration::from_secs(2), request)
            .await
            .expect("resolved before the deadline")
            .unwrap()
            .unwrap();
        assert_eq!(reply["order_number"], "ORD-1");
        assert_eq!(manager.tracker().pending_count(), 0);
    }

    #[tokio::test]
    async fn request_error_reply_carries_server_message() {
        let mut server = TestServer::start().await;
        let manager = connected(&server).await;

        let m = manager.clone();
        let request = tokio::spawn(async move {
            m.send_request("ORD-9", "print_qr", &json!({}), Duration::from_secs(30))
                .await
        });

        server.next_frame().await;
        server.push(
            "print_error",
            json!({"order_number": "ORD-9", "error": "paper out"}),
        );

        match request.await.unwrap() {
            Err(RequestError::Remote { key, message }) => {
                assert_eq!(key, "ORD-9");
                assert_eq!(message, "paper out");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_times_out_without_reply() {
        let server = TestServer::start().await;
        let manager = connected(&server).await;

        let result = manager
            .send_request("ORD-2", "print_qr", &json!({}), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(RequestError::Timeout(k)) if k == "ORD-2"));
        assert!(!manager.tracker().is_pending("ORD-2"));
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let server = TestServer::start().await;
        let manager = connected(&server).await;

        let m = manager.clone();
        let first = tokio::spawn(async move {
            m.send_request("ORD-1", "print_qr", &json!({}), Duration::from_secs(30))
                .await
        });
        assert!(eventually(|| manager.tracker().is_pending("ORD-1")).await);

        let second = manager
            .send_request("ORD-1", "print_qr", &json!({}), Duration::from_secs(30))
            .await;
        assert!(matches!(second, Err(RequestError::DuplicateRequest(_))));
        first.abort();
    }

    #[tokio::test]
    async fn disconnect_rejects_pending_and_clears_subscriptions() {
        let server = TestServer::start().await;
        let manager = connected(&server).await;
        manager.on("qr_detected", |_| {});
        manager.on("status", |_| {});

        let mut requests = Vec::new();
        for key in ["ORD-1", "ORD-2", "ORD-3"] {
            let m = manager.clone();
            requests.push(tokio::spawn(async move {
                m.send_request(key, "print_qr", &json!({}), Duration::from_secs(30))
                    .await
            }));
        }
        assert!(eventually(|| manager.tracker().pending_count() == 3).await);

        manager.disconnect().await;

        for request in requests {
            assert!(matches!(
                request.await.unwrap(),
                Err(RequestError::ConnectionClosed)
            ));
        }
        assert_eq!(manager.tracker().pending_count(), 0);
        assert!(manager.dispatcher().is_empty());
        assert!(!manager.is_connected());
        assert!(!manager.connection_info().unwrap().connected);

        // A second disconnect is harmless.
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn reconnects_after_server_drops_client() {
        let server = TestServer::start().await;
        let manager = connected(&server).await;

        let lost = Arc::new(AtomicBool::new(false));
        let l = lost.clone();
        manager.on("disconnect", move |_| l.store(true, Ordering::SeqCst));
        let reconnected = Arc::new(AtomicBool::new(false));
        let r = reconnected.clone();
        manager.on("connect", move |_| r.store(true, Ordering::SeqCst));

        server.drop_client();

        assert!(eventually(|| lost.load(Ordering::SeqCst)).await);
        assert!(eventually(|| reconnected.load(Ordering::SeqCst)).await);
        assert!(manager.is_connected());
        assert_eq!(server.accepted(), 2);
        assert_eq!(manager.connection_info().unwrap().reconnect_attempts, 0);

        // Subscriptions survive a spontaneous reconnect.
        assert_eq!(manager.dispatcher().subscriber_count("disconnect"), 1);
    }

    #[tokio::test]
    async fn reconnect_gives_up_when_server_is_gone() {
        let server = TestServer::start().await;
        let manager = connected(&server).await;

        let attempts = Arc::new(std::sync::Mutex::new(Vec::new()));
        let a = attempts.clone();
        manager.on("reconnect_attempt", move |v| {
            a.lock().unwrap().push(v["attempt"].as_u64().unwrap());
        });
        let gave_up = Arc::new(std::sync::Mutex::new(None));
        let g = gave_up.clone();
        manager.on("reconnect_failed", move |v| {
            *g.lock().unwrap() = v["attempts"].as_u64();
        });

        drop(server);

        assert!(eventually(|| gave_up.lock().unwrap().is_some()).await);
        assert_eq!(*gave_up.lock().unwrap(), Some(3));
        assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn write_failure_tears_down_and_reconnects() {
        let server = TestServer::start().await;
        let manager = connected(&server).await;
        let lost = Arc::new(std::sync::Mutex::new(None));
        let l = lost.clone();
        manager.on("disconnect", move |v| {
            *l.lock().unwrap() = v["reason"].as_str().map(str::to_string);
        });

        let live = manager.ctx.live_session.load(Ordering::SeqCst);
        crate::reconnection::handle_session_lost(
            manager.ctx.clone(),
            live,
            DisconnectReason::WriteError("broken pipe".into()),
        )
        .await;

        assert_eq!(
            lost.lock().unwrap().as_deref(),
            Some("transport write error: broken pipe")
        );
        assert!(eventually(|| server.accepted() == 2).await);
        assert!(eventually(|| manager.is_connected()).await);
    }

    #[tokio::test]
    async fn loss_reported_after_disconnect_is_ignored() {
        let server = TestServer::start().await;
        let manager = connected(&server).await;
        let live = manager.ctx.live_session.load(Ordering::SeqCst);

        manager.disconnect().await;
        crate::reconnection::handle_session_lost(
            manager.ctx.clone(),
            live,
            DisconnectReason::StreamEnded,
        )
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(server.accepted(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.ctx.reconnect_cancel.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn establish_after_disconnect_does_not_install() {
        let server = TestServer::start().await;
        let manager = connected(&server).await;
        manager.disconnect().await;

        // A reconnect attempt whose token was never cancelled still backs off.
        let token = tokio_util::sync::CancellationToken::new();
        let result = crate::reconnection::establish(&manager.ctx, &token).await;
        assert!(matches!(result, Err(ConnectError::Cancelled)));
        assert!(manager.ctx.session.lock().await.is_none());
        assert!(manager.ctx.outbound().is_none());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn explicit_disconnect_does_not_reconnect() {
        let server = TestServer::start().await;
        let manager = connected(&server).await;

        manager.disconnect().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!manager.is_connected());
        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test]
    async fn wait_for_returns_next_event() {
        let server = TestServer::start().await;
        let manager = connected(&server).await;

        let m = manager.clone();
        let waiter = tokio::spawn(async move {
            m.wait_for("system_status", Duration::from_secs(2)).await
        });
        assert!(eventually(|| manager.dispatcher().subscriber_count("system_status") == 1).await);

        server.push("system_status", json!({"camera": {"available": true}}));

        let status = waiter.await.unwrap().unwrap();
        assert_eq!(status["camera"]["available"], true);
        assert_eq!(manager.dispatcher().subscriber_count("system_status"), 0);
    }

    #[tokio::test]
    async fn wait_for_subscribes_before_first_poll() {
        let server = TestServer::start().await;
        let manager = connected(&server).await;

        let waiting = manager.wait_for("printer_status", Duration::from_secs(2));
        assert_eq!(manager.dispatcher().subscriber_count("printer_status"), 1);

        server.push("printer_status", json!({"online": true}));
        let status = waiting.await.unwrap();
        assert_eq!(status["online"], true);
    }

    #[tokio::test]
    async fn dropped_wait_for_leaves_no_subscriber() {
        let manager = ConnectionManager::new(ClientConfig::default());
        for _ in 0..5 {
            let outer = tokio::time::timeout(
                Duration::from_millis(10),
                manager.wait_for("system_status", Duration::from_secs(60)),
            )
            .await;
            assert!(outer.is_err());
        }
        assert_eq!(manager.dispatcher().subscriber_count("system_status"), 0);

        // Never polled at all.
        drop(manager.wait_for("system_status", Duration::from_secs(60)));
        assert_eq!(manager.dispatcher().subscriber_count("system_status"), 0);
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let server = TestServer::start().await;
        let manager = connected(&server).await;
        let result = manager
            .wait_for("printer_status", Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(RequestError::Timeout(_))));
    }
}
