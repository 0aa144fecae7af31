//! Session establishment and reconnection with exponential backoff.
//!
//! Contains the shared [`LinkContext`], the `establish` step used by both
//! explicit connects and the reconnect loop, and the handler for sessions
//! that drop on their own.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use sorthub_protocol::constants::EventName;

use crate::dispatcher::EventDispatcher;
use crate::error::ConnectError;
use crate::pumps::read::Inbound;
use crate::tracker::RequestTracker;
use crate::types::{
    ClientConfig, ConnectionEvent, ConnectionState, DisconnectReason, ReconnectPolicy,
};
use crate::ws_client::{RoundTrip, Session};

/// Shared state handed to free functions and background tasks.
#[derive(Clone)]
pub(crate) struct LinkContext {
    pub(crate) config: ClientConfig,
    pub(crate) endpoint: Arc<std::sync::Mutex<Option<String>>>,
    pub(crate) state: Arc<watch::Sender<ConnectionState>>,
    pub(crate) session: Arc<Mutex<Option<Session>>>,
    /// Sender of the live session, readable without awaiting.
    pub(crate) outbound: Arc<std::sync::Mutex<Option<mpsc::Sender<tungstenite::Message>>>>,
    /// Allocates session ids.
    pub(crate) next_session: Arc<AtomicU64>,
    /// Id of the installed session, 0 when none. Only changed under the
    /// `session` lock; disconnect callbacks of any other id are stale.
    pub(crate) live_session: Arc<AtomicU64>,
    pub(crate) dispatcher: Arc<EventDispatcher>,
    pub(crate) tracker: Arc<RequestTracker>,
    pub(crate) rtt: Arc<RoundTrip>,
    pub(crate) policy: Arc<std::sync::Mutex<ReconnectPolicy>>,
    pub(crate) events_tx: mpsc::Sender<ConnectionEvent>,
    pub(crate) reconnect_cancel: Arc<std::sync::Mutex<Option<CancellationToken>>>,
    pub(crate) manual_disconnect: Arc<AtomicBool>,
    pub(crate) ever_connected: Arc<AtomicBool>,
}

impl LinkContext {
    pub(crate) fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Updates the state and reports the change on the event channel.
    pub(crate) fn set_state(&self, new_state: ConnectionState) {
        let changed = self.state.send_if_modified(|s| {
            if *s == new_state {
                return false;
            }
            *s = new_state;
            true
        });
        if changed {
            debug!(state = ?new_state, "connection state changed");
            self.notify(ConnectionEvent::StateChanged(new_state));
        }
    }

    /// Sends a lifecycle event without blocking; drops it if nobody is
    /// draining the channel.
    pub(crate) fn notify(&self, event: ConnectionEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            trace!("connection event not delivered: {e}");
        }
    }

    /// Delivers a local lifecycle event to subscribers.
    pub(crate) fn dispatch_local(&self, event: EventName, payload: serde_json::Value) {
        self.dispatcher.dispatch(event.as_str(), &payload);
    }

    pub(crate) fn endpoint(&self) -> Option<String> {
        self.endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn outbound(&self) -> Option<mpsc::Sender<tungstenite::Message>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_outbound(&self, tx: Option<mpsc::Sender<tungstenite::Message>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = tx;
    }

    pub(crate) fn lock_policy(&self) -> std::sync::MutexGuard<'_, ReconnectPolicy> {
        self.policy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inbound(&self) -> Inbound {
        Inbound {
            dispatcher: self.dispatcher.clone(),
            tracker: self.tracker.clone(),
            rtt: self.rtt.clone(),
        }
    }

    /// Installs a fresh cancellation token for connect/reconnect work,
    /// cancelling the previous one.
    pub(crate) fn arm_reconnect_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut guard = self
            .reconnect_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = guard.replace(token.clone()) {
            old.cancel();
        }
        token
    }
}

/// Cancels any active connect or reconnect loop.
pub(crate) fn cancel_any_reconnect(
    reconnect_cancel: &std::sync::Mutex<Option<CancellationToken>>,
) {
    if let Some(token) = reconnect_cancel
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
    {
        token.cancel();
    }
}

/// Opens one session to the stored endpoint and installs it.
///
/// On success the attempt counter is reset, the state flips to
/// `Connected` and the local `connect` event is dispatched.
pub(crate) async fn establish(
    ctx: &LinkContext,
    cancel: &CancellationToken,
) -> Result<(), ConnectError> {
    let url = ctx
        .endpoint()
        .ok_or_else(|| ConnectError::InvalidEndpoint("no endpoint configured".into()))?;

    let id = ctx.next_session.fetch_add(1, Ordering::Relaxed) + 1;
    let on_disconnect = {
        let ctx = ctx.clone();
        Box::new(move |reason: DisconnectReason| {
            tokio::spawn(handle_session_lost(ctx, id, reason));
        })
    };

    let session = Session::open(&url, ctx.config.connect_timeout, ctx.inbound(), on_disconnect)
        .await?;

    // Installation and teardown both happen under the session lock, so a
    // concurrent disconnect() either sees this session or stops it here.
    // A session that is never installed never becomes live, so its
    // disconnect callback is ignored.
    let mut slot = ctx.session.lock().await;
    if cancel.is_cancelled() || ctx.manual_disconnect.load(Ordering::SeqCst) {
        drop(slot);
        session.close_and_wait().await;
        return Err(ConnectError::Cancelled);
    }

    ctx.set_outbound(Some(session.sender()));
    ctx.live_session.store(id, Ordering::SeqCst);
    if let Some(old) = slot.replace(session) {
        old.close();
    }
    ctx.lock_policy().reset();
    ctx.ever_connected.store(true, Ordering::Relaxed);
    ctx.set_state(ConnectionState::Connected);
    drop(slot);

    ctx.dispatch_local(EventName::Connect, serde_json::json!({ "endpoint": url }));
    info!(url = %url, "connected to device server");
    Ok(())
}

/// Runs when a session's read pump exits.
///
/// Whether the loss was asked for is decided by the manual-disconnect flag
/// and the live session id, never by `reason`. Anything not asked for
/// is a spontaneous drop: the state flips to `Disconnected`, subscribers
/// get a `disconnect` event, and the reconnect loop starts.
pub(crate) async fn handle_session_lost(
    ctx: LinkContext,
    id: u64,
    reason: DisconnectReason,
) {
    let mut slot = ctx.session.lock().await;
    if ctx.manual_disconnect.load(Ordering::SeqCst) {
        debug!(%reason, "session closed by disconnect");
        return;
    }
    if ctx.live_session.load(Ordering::SeqCst) != id {
        debug!(session = id, %reason, "ignoring disconnect of stale session");
        return;
    }

    warn!(%reason, "device server connection lost");
    ctx.live_session.store(0, Ordering::SeqCst);
    let lost = slot.take();
    ctx.set_outbound(None);
    ctx.set_state(ConnectionState::Disconnected);
    let cancel = ctx
        .config
        .auto_reconnect
        .then(|| ctx.arm_reconnect_token());
    drop(slot);
    drop(lost);

    // disconnect() sets the flag before it cancels the armed token. A
    // disconnect that ran between the checks above and arming is seen here;
    // a later one cancels the token itself.
    let cancel = cancel.filter(|_| !ctx.manual_disconnect.load(Ordering::SeqCst));

    ctx.dispatch_local(
        EventName::Disconnect,
        serde_json::json!({ "reason": reason.to_string() }),
    );

    if let Some(cancel) = cancel {
        tokio::spawn(reconnect_loop(ctx, cancel));
    }
}

/// Sets `state` unless `cancel` fired or the user disconnected.
///
/// Runs under the session lock so it cannot interleave with `establish`
/// installing a session or `disconnect()` tearing one down.
async fn set_state_unless_cancelled(
    ctx: &LinkContext,
    cancel: &CancellationToken,
    state: ConnectionState,
) -> bool {
    let _slot = ctx.session.lock().await;
    if cancel.is_cancelled() || ctx.manual_disconnect.load(Ordering::SeqCst) {
        return false;
    }
    ctx.set_state(state);
    true
}

/// Reconnection loop with exponential backoff.
///
/// Attempt `n` (1-based) waits `delay_for_attempt(n - 1)` first. The loop
/// gives up once the policy has recorded `max_attempts` failures.
///
/// Returns a boxed future to break the recursive type cycle with
/// `establish` (whose disconnect callback spawns this loop again).
pub(crate) fn reconnect_loop(
    ctx: LinkContext,
    cancel: CancellationToken,
) -> Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        loop {
            let attempt = ctx.lock_policy().current_attempt() + 1;
            let delay = ctx.config.reconnect.delay_for_attempt(attempt - 1);

            let delay_secs = delay.as_secs_f64();
            info!(
                attempt,
                delay_secs = format_args!("{delay_secs:.1}"),
                "reconnecting"
            );
            ctx.notify(ConnectionEvent::Reconnecting {
                attempt,
                next_retry_secs: delay_secs,
            });
            ctx.dispatch_local(
                EventName::ReconnectAttempt,
                serde_json::json!({ "attempt": attempt }),
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("reconnect cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if !set_state_unless_cancelled(&ctx, &cancel, ConnectionState::Connecting).await {
                debug!("reconnect cancelled");
                return;
            }
            match establish(&ctx, &cancel).await {
                Ok(()) => {
                    info!(attempt, "reconnected successfully");
                    return;
                }
                Err(ConnectError::Cancelled) => return,
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    if !set_state_unless_cancelled(&ctx, &cancel, ConnectionState::Disconnected)
                        .await
                    {
                        return;
                    }
                    ctx.dispatch_local(
                        EventName::ConnectError,
                        serde_json::json!({ "error": e.to_string() }),
                    );
                }
            }

            if cancel.is_cancelled() {
                return;
            }
            if ctx.lock_policy().record_failure().is_none() {
                info!(attempts = attempt, "reconnect attempts exhausted, giving up");
                ctx.notify(ConnectionEvent::ReconnectFailed { attempts: attempt });
                ctx.dispatch_local(
                    EventName::ReconnectFailed,
                    serde_json::json!({ "attempts": attempt }),
                );
                return;
            }
        }
    })
}
