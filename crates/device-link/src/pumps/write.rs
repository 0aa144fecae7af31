//! WebSocket write pump: serialises outbound frames.
//!
//! The pump owns the sink half of the socket. A failed send ends the pump
//! and is reported once on `failed`, so the read side can tear the session
//! down as a transport failure. The session's cancel token is never
//! touched here: cancellation means a local close, and a write error is not
//! one.

use futures_util::SinkExt;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Sending half of the write pump's failure report.
pub(crate) type WriteFailure = oneshot::Sender<tungstenite::Error>;

/// Writes queued messages to the WebSocket until cancelled or the
/// queue closes.
///
/// A clean stop ends with a close frame. After a failed send the sink is
/// left alone and the error goes to `failed` instead.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
    failed: WriteFailure,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let mut written: u64 = 0;
    let outcome = loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            msg = write_rx.recv() => msg,
        };
        let Some(msg) = msg else {
            break Ok(());
        };
        match write.send(msg).await {
            Ok(()) => written += 1,
            Err(e) => break Err(e),
        }
    };

    match outcome {
        Ok(()) => {
            debug!(written, "write pump stopped");
            let _ = write.send(tungstenite::Message::Close(None)).await;
        }
        Err(e) => {
            error!(written, "WebSocket write error: {e}");
            // The read side may already be gone.
            let _ = failed.send(e);
        }
    }
}
