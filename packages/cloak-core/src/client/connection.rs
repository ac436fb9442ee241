//! WebSocket connection to a Cloak server.
//!
//! Multiplexes request/response calls over one socket by correlation id and
//! forwards server-push events to a channel owned by the caller.
//!
//! ```text
//!   call() ──► pending[id] = oneshot ──► writer task ──► socket
//!                                                         │
//!   caller ◄── oneshot ◄── reader task ◄──────────────────┘
//!                              │
//!                              └── Event ──► events channel
//! ```
//!
//! When the socket drops every pending call fails with
//! [`Error::Disconnected`] and later calls fail immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::error::{Error, Result};
use crate::protocol::{ClientFrame, Event, Request, ServerFrame};

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

type Responder = oneshot::Sender<Result<serde_json::Value>>;
type PendingCalls = Arc<Mutex<HashMap<u64, Responder>>>;

pub struct Connection {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    pending: PendingCalls,
    connected: Arc<AtomicBool>,
    next_id: AtomicU64,
    call_timeout: Duration,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Connection {
    /// Open a socket to `url` (e.g. `ws://127.0.0.1:8080/ws`).
    pub async fn connect(
        url: &str,
        call_timeout: Duration,
        events: mpsc::UnboundedSender<Event>,
    ) -> Result<Self> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", url, e)))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<ClientFrame>();
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if ws_sender.send(WsMessage::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to serialize client frame: {}", e);
                    }
                }
            }
            let _ = ws_sender.close().await;
        });

        let reader_pending = pending.clone();
        let reader_connected = connected.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(msg_result) = ws_receiver.next().await {
                match msg_result {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::Response { id, ok, data, error }) => {
                            let result = if ok {
                                Ok(data.unwrap_or(serde_json::Value::Null))
                            } else {
                                Err(error.map(Error::from).unwrap_or_else(|| {
                                    Error::ProtocolError("Failed response without error body".into())
                                }))
                            };
                            match reader_pending.lock().remove(&id) {
                                Some(responder) => {
                                    let _ = responder.send(result);
                                }
                                None => tracing::debug!(id, "Response for unknown call"),
                            }
                        }
                        Ok(ServerFrame::Event { event }) => {
                            let _ = events.send(event);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to parse server frame");
                        }
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }

            reader_connected.store(false, Ordering::SeqCst);
            let dropped: Vec<_> = reader_pending.lock().drain().collect();
            tracing::info!(pending = dropped.len(), "Connection closed");
            for (_, responder) in dropped {
                let _ = responder.send(Err(Error::Disconnected));
            }
        });

        Ok(Self {
            outbound: tx,
            pending,
            connected,
            next_id: AtomicU64::new(1),
            call_timeout,
            reader_task,
            writer_task,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a request and wait for its response payload.
    pub async fn call(&self, request: Request) -> Result<serde_json::Value> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let op = request.op_name();
        let (responder, rx) = oneshot::channel();
        self.pending.lock().insert(id, responder);

        // The reader clears `connected` before draining, so one of the two
        // sides always sees the other.
        if !self.is_connected() || self.outbound.send(ClientFrame::new(id, request)).is_err() {
            self.pending.lock().remove(&id);
            return Err(Error::Disconnected);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                self.pending.lock().remove(&id);
                tracing::warn!(id, op, "Call timed out");
                Err(Error::Timeout(op.to_string()))
            }
        }
    }

    /// Close the socket. Pending calls fail with `Disconnected`.
    pub fn close(&self) {
        self.writer_task.abort();
        self.reader_task.abort();
        self.connected.store(false, Ordering::SeqCst);
        for (_, responder) in self.pending.lock().drain() {
            let _ = responder.send(Err(Error::Disconnected));
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
