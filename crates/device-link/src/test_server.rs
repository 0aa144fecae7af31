//! In-process device server for tests.
//!
//! Accepts WebSocket connections one at a time, forwards every decoded
//! frame to `inbound`, and pushes frames or drops the client on command.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;

use sorthub_protocol::envelope::Frame;

enum Command {
    Send(Frame),
    DropClient,
}

pub(crate) struct TestServer {
    pub(crate) addr: SocketAddr,
    pub(crate) inbound: mpsc::UnboundedReceiver<Frame>,
    commands: mpsc::UnboundedSender<Command>,
    accepted: Arc<AtomicUsize>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let command_rx = Arc::new(Mutex::new(command_rx));
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);

                // One client at a time: the session owns the command queue.
                let mut commands = command_rx.lock().await;
                let (mut write, mut read) = ws.split();
                loop {
                    tokio::select! {
                        cmd = commands.recv() => match cmd {
                            Some(Command::Send(frame)) => {
                                let text = frame.encode().unwrap();
                                if write.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            Some(Command::DropClient) | None => break,
                        },
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Ok(frame) = Frame::decode(&text) {
                                    let _ = inbound_tx.send(frame);
                                }
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                    }
                }
            }
        });

        Self {
            addr,
            inbound,
            commands,
            accepted,
            handle,
        }
    }

    /// `host:port` form accepted by `connect()`.
    pub(crate) fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Pushes `event` with `data` to the connected client.
    pub(crate) fn push(&self, event: &str, data: serde_json::Value) {
        let _ = self.commands.send(Command::Send(Frame::new(event, &data).unwrap()));
    }

    /// Drops the current client without a close handshake.
    pub(crate) fn drop_client(&self) {
        let _ = self.commands.send(Command::DropClient);
    }

    /// Connections accepted so far.
    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Next frame sent by the client, failing the test after two seconds.
    pub(crate) async fn next_frame(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), self.inbound.recv())
            .await
            .expect("no frame from client")
            .expect("server gone")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Polls `cond` every 10ms for up to two seconds.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
