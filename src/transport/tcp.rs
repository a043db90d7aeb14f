//! TCP client transport
//!
//! Newline-delimited JSON frames over a tokio `TcpStream`. Each
//! outbound frame optionally carries a correlation id; the server
//! answers with an `ack` frame bearing the same id. A reader task owns
//! the read half and dispatches inbound frames; writes go through a
//! shared write half.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task;
use uuid::Uuid;

use super::{AckCallback, HandlerSet, LifecycleEvent, LifecycleHandler, MessageHandler, Transport};
use crate::error::TransportError;

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum Frame {
    #[serde(rename_all = "camelCase")]
    Message {
        message: String,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        id: u64,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

pub struct TcpTransport {
    shared: Arc<TcpShared>,
}

struct TcpShared {
    handlers: HandlerSet,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<HashMap<u64, AckCallback>>,
    next_ack: AtomicU64,
}

impl TcpTransport {
    /// Create an unconnected transport; call [`dial`](Self::dial) to
    /// establish the session.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TcpShared {
                handlers: HandlerSet::new(),
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_ack: AtomicU64::new(1),
            }),
        }
    }

    /// Connect and return a ready transport.
    pub async fn connect(addr: &str) -> tokio::io::Result<Self> {
        let transport = Self::new();
        transport.dial(addr).await?;
        Ok(transport)
    }

    /// Dial (or re-dial) the server. Spawns the reader task and fires a
    /// `Connect` lifecycle event. Safe to call again after a
    /// disconnect; subscriptions survive the reconnect.
    pub async fn dial(&self, addr: &str) -> tokio::io::Result<()> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        {
            let mut writer = self.shared.writer.lock().await;
            *writer = Some(write_half);
        }

        let shared = self.shared.clone();
        task::spawn(read_loop(shared, read_half));

        log::debug!("connected to {}", addr);
        self.shared.handlers.fire(LifecycleEvent::Connect);
        Ok(())
    }

    fn send_frame(&self, frame: Frame) {
        let line = match serde_json::to_string(&frame) {
            Ok(line) => line,
            Err(e) => {
                log::error!("failed to serialize frame: {}", e);
                return;
            }
        };
        let shared = self.shared.clone();
        task::spawn(async move {
            let mut writer = shared.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                log::warn!("dropping frame, transport not connected");
                return;
            };
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                log::warn!("failed to send frame: {}", e);
                return;
            }
            if let Err(e) = writer.write_all(b"\n").await {
                log::warn!("failed to send frame terminator: {}", e);
            }
        });
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_loop(shared: Arc<TcpShared>, read_half: OwnedReadHalf) {
    let reader = BufReader::new(read_half);
    let mut lines = reader.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<Frame>(&line) {
            Ok(Frame::Message { message, payload, .. }) => {
                shared.handlers.dispatch(&message, payload);
            }
            Ok(Frame::Ack { id, payload, error }) => {
                let cb = shared
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                match cb {
                    Some(cb) => match error {
                        Some(reason) => cb(Err(TransportError::AckFailed(reason))),
                        None => cb(Ok(payload)),
                    },
                    None => log::warn!("ack {} has no pending request", id),
                }
            }
            Err(e) => {
                log::warn!("failed to parse frame: {}", e);
            }
        }
    }

    // Session over: drop the writer, fail every in-flight ack, then let
    // subscribers react.
    {
        let mut writer = shared.writer.lock().await;
        *writer = None;
    }
    let pending: Vec<AckCallback> = {
        let mut map = shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.drain().map(|(_, cb)| cb).collect()
    };
    for cb in pending {
        cb(Err(TransportError::Disconnected));
    }
    log::debug!("server connection closed");
    shared.handlers.fire(LifecycleEvent::Disconnect);
}

impl Transport for TcpTransport {
    fn emit(&self, message: &str, payload: Value) {
        self.send_frame(Frame::Message {
            message: message.to_string(),
            payload,
            ack: None,
        });
    }

    fn emit_with_ack(&self, message: &str, payload: Value, ack: AckCallback) {
        let id = self.shared.next_ack.fetch_add(1, Ordering::SeqCst);
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, ack);
        self.send_frame(Frame::Message {
            message: message.to_string(),
            payload,
            ack: Some(id),
        });
    }

    fn on_message(&self, message: &str, handler: MessageHandler) -> Uuid {
        self.shared.handlers.on_message(message, handler)
    }

    fn off_message(&self, id: Uuid) {
        self.shared.handlers.off_message(id);
    }

    fn on_lifecycle(&self, handler: LifecycleHandler) -> Uuid {
        self.shared.handlers.on_lifecycle(handler)
    }

    fn off_lifecycle(&self, id: Uuid) {
        self.shared.handlers.off_lifecycle(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_emit_writes_a_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let transport = TcpTransport::connect(&addr.to_string()).await.unwrap();
        transport.emit("joinRoom", serde_json::json!({ "room": "dashboard" }));

        let received = server.await.unwrap();
        let frame: Frame = serde_json::from_str(received.trim()).unwrap();
        match frame {
            Frame::Message { message, payload, ack } => {
                assert_eq!(message, "joinRoom");
                assert_eq!(payload["room"], "dashboard");
                assert!(ack.is_none());
            }
            Frame::Ack { .. } => panic!("expected a message frame"),
        }
    }

    #[tokio::test]
    async fn test_ack_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let frame: Frame = serde_json::from_str(&line).unwrap();
            let Frame::Message { ack: Some(id), .. } = frame else {
                panic!("expected an ack-bearing message");
            };
            let reply = serde_json::to_string(&Frame::Ack {
                id,
                payload: serde_json::json!({ "revision": 5 }),
                error: None,
            })
            .unwrap();
            write_half.write_all(reply.as_bytes()).await.unwrap();
            write_half.write_all(b"\n").await.unwrap();
        });

        let transport = TcpTransport::connect(&addr.to_string()).await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        transport.emit_with_ack(
            "replicant:read",
            serde_json::json!({ "name": "r", "namespace": "ns" }),
            Box::new(move |result| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(result);
                }
            }),
        );

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result["revision"], 5);
        server.await.unwrap();
    }
}
