//! WebSocket read pump: routes incoming frames.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use sorthub_protocol::constants::WS_PONG_WAIT;
use sorthub_protocol::envelope::Frame;

use crate::dispatcher::EventDispatcher;
use crate::tracker::RequestTracker;
use crate::types::DisconnectReason;
use crate::ws_client::{DisconnectCallback, RoundTrip};

/// Shared sinks for inbound frames.
#[derive(Clone)]
pub(crate) struct Inbound {
    pub(crate) dispatcher: Arc<EventDispatcher>,
    pub(crate) tracker: Arc<RequestTracker>,
    pub(crate) rtt: Arc<RoundTrip>,
}

/// Reads messages from the WebSocket and routes them.
///
/// Any incoming message resets the read deadline; if nothing arrives
/// within [`WS_PONG_WAIT`] the session is considered dead. A failure
/// reported by the write pump ends the loop as well. The disconnect
/// callback always runs once when the loop exits.
pub(crate) async fn read_pump<S>(
    mut read: S,
    inbound: Inbound,
    write_tx: mpsc::Sender<tungstenite::Message>,
    write_failed: oneshot::Receiver<tungstenite::Error>,
    cancel: CancellationToken,
    on_disconnect: DisconnectCallback,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    // A write pump that stops cleanly drops its sender; that is not a failure.
    let write_failed = async move {
        match write_failed.await {
            Ok(e) => e,
            Err(_) => std::future::pending().await,
        }
    };
    tokio::pin!(write_failed);

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break DisconnectReason::Cancelled,

            e = &mut write_failed => {
                warn!("write side failed, closing connection");
                break DisconnectReason::WriteError(e.to_string());
            }

            () = &mut pong_deadline => {
                warn!("pong timeout, closing dead connection");
                break DisconnectReason::PongTimeout;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text_message(&text, &inbound);
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                if let Some(rtt) = inbound.rtt.record_pong() {
                                    trace!(rtt_ms = rtt.as_millis() as u64, "received pong");
                                }
                            }
                            tungstenite::Message::Close(frame) => {
                                debug!(?frame, "received close frame");
                                break DisconnectReason::PeerClosed;
                            }
                            _ => {} // Binary is not used on this channel
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break DisconnectReason::ReadError(e.to_string());
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break DisconnectReason::StreamEnded;
                    }
                }
            }
        }
    };

    on_disconnect(reason);
}

/// Handles a text message: settles a pending request if it is a reply,
/// then fans the payload out to subscribers.
pub(crate) fn handle_text_message(text: &str, inbound: &Inbound) {
    let frame = match Frame::decode(text) {
        Ok(f) => f,
        Err(e) => {
            warn!("dropping inbound message: {e}");
            return;
        }
    };

    if frame.name().is_local() {
        warn!(event = %frame.event, "server sent a reserved lifecycle event, dropping");
        return;
    }

    trace!(event = %frame.event, "received frame");

    inbound.tracker.handle_reply(&frame);

    let delivered = inbound
        .dispatcher
        .dispatch(&frame.event, &frame.data_or_null());
    if delivered == 0 {
        trace!(event = %frame.event, "no subscribers");
    }
}
