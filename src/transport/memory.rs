//! In-process transport for tests and demos
//!
//! Records every emitted message and lets the driving side deliver
//! acknowledgements, push server messages, and fire lifecycle events by
//! hand. Plays the role of the authoritative server in the integration
//! tests.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use super::{AckCallback, HandlerSet, LifecycleEvent, MessageHandler, LifecycleHandler, Transport};
use crate::error::TransportError;

/// One recorded outbound message. `seq` indexes into the transport's
/// send log and is the handle used to deliver its acknowledgement.
#[derive(Clone, Debug)]
pub struct SentMessage {
    pub seq: usize,
    pub message: String,
    pub payload: Value,
    pub wants_ack: bool,
}

#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    handlers: HandlerSet,
    sent: Mutex<Vec<SentMessage>>,
    pending_acks: Mutex<HashMap<usize, AckCallback>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                handlers: HandlerSet::new(),
                sent: Mutex::new(Vec::new()),
                pending_acks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Snapshot of every message emitted so far.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.inner
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many messages with this name have been emitted.
    pub fn sent_count(&self, message: &str) -> usize {
        self.sent().iter().filter(|m| m.message == message).count()
    }

    /// The most recent message with this name, if any.
    pub fn last(&self, message: &str) -> Option<SentMessage> {
        self.sent().into_iter().rev().find(|m| m.message == message)
    }

    /// Deliver a successful acknowledgement for a recorded message.
    /// Each ack callback fires at most once.
    pub fn ack(&self, seq: usize, payload: Value) {
        if let Some(cb) = self.take_ack(seq) {
            cb(Ok(payload));
        }
    }

    /// Deliver a failed acknowledgement.
    pub fn ack_err(&self, seq: usize, error: TransportError) {
        if let Some(cb) = self.take_ack(seq) {
            cb(Err(error));
        }
    }

    /// Push an inbound server message to subscribers.
    pub fn push(&self, message: &str, payload: Value) {
        self.inner.handlers.dispatch(message, payload);
    }

    /// Fire a connect/disconnect lifecycle event.
    pub fn fire(&self, event: LifecycleEvent) {
        self.inner.handlers.fire(event);
    }

    fn take_ack(&self, seq: usize) -> Option<AckCallback> {
        self.inner
            .pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&seq)
    }

    fn record(&self, message: &str, payload: Value, wants_ack: bool) -> usize {
        let mut sent = self
            .inner
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let seq = sent.len();
        sent.push(SentMessage {
            seq,
            message: message.to_string(),
            payload,
            wants_ack,
        });
        seq
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn emit(&self, message: &str, payload: Value) {
        self.record(message, payload, false);
    }

    fn emit_with_ack(&self, message: &str, payload: Value, ack: AckCallback) {
        let seq = self.record(message, payload, true);
        self.inner
            .pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(seq, ack);
    }

    fn on_message(&self, message: &str, handler: MessageHandler) -> Uuid {
        self.inner.handlers.on_message(message, handler)
    }

    fn off_message(&self, id: Uuid) {
        self.inner.handlers.off_message(id);
    }

    fn on_lifecycle(&self, handler: LifecycleHandler) -> Uuid {
        self.inner.handlers.on_lifecycle(handler)
    }

    fn off_lifecycle(&self, id: Uuid) {
        self.inner.handlers.off_lifecycle(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_ack_delivered_exactly_once() {
        let transport = MemoryTransport::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        transport.emit_with_ack(
            "replicant:declare",
            json!({}),
            Box::new(move |_| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let seq = transport.last("replicant:declare").unwrap().seq;
        transport.ack(seq, json!({ "revision": 0 }));
        transport.ack(seq, json!({ "revision": 1 }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_push_reaches_subscribers() {
        let transport = MemoryTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let id = transport.on_message(
            "replicant:assignment",
            Arc::new(move |payload| {
                seen_clone.lock().unwrap().push(payload);
            }),
        );

        transport.push("replicant:assignment", json!({ "revision": 3 }));
        transport.off_message(id);
        transport.push("replicant:assignment", json!({ "revision": 4 }));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["revision"], 3);
    }
}
