//! WebSocket ping pump: periodic keepalive pings.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use sorthub_protocol::constants::WS_PING_PERIOD;

use crate::tracker::RequestTracker;
use crate::ws_client::RoundTrip;

/// Sends periodic pings and stamps them for round-trip measurement.
///
/// Each tick also sweeps pending requests whose deadline has passed,
/// covering waiters that were never polled to completion.
pub(crate) async fn ping_pump(
    write_tx: mpsc::Sender<tungstenite::Message>,
    rtt: Arc<RoundTrip>,
    tracker: Arc<RequestTracker>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                tracker.sweep_expired(tokio::time::Instant::now());
                rtt.mark_ping();
                let ping = tungstenite::Message::Ping(Vec::new().into());
                if write_tx.send(ping).await.is_err() {
                    break;
                }
            }
        }
    }
}
