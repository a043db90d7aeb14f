//! Transport boundary
//!
//! The core only assumes a duplex channel that can emit named messages
//! (optionally with an acknowledgement callback) and can raise
//! connect/disconnect lifecycle events. Two implementations ship with
//! the crate: an in-process [`memory::MemoryTransport`] for tests and
//! demos, and a newline-delimited-JSON TCP client in [`tcp`].

pub mod memory;
pub mod tcp;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::TransportError;

/// Invoked once with the server's acknowledgement payload (or a
/// transport failure).
pub type AckCallback = Box<dyn FnOnce(Result<Value, TransportError>) + Send>;

pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;
pub type LifecycleHandler = Arc<dyn Fn(LifecycleEvent) + Send + Sync>;

/// Connection lifecycle events raised by a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connect,
    Disconnect,
}

/// A duplex, acknowledgement-capable message channel.
pub trait Transport: Send + Sync {
    /// Fire-and-forget named message.
    fn emit(&self, message: &str, payload: Value);

    /// Named message whose acknowledgement is delivered to `ack` exactly
    /// once, later, on the event loop.
    fn emit_with_ack(&self, message: &str, payload: Value, ack: AckCallback);

    /// Subscribe to an inbound named message. Returns a deregistration
    /// handle.
    fn on_message(&self, message: &str, handler: MessageHandler) -> Uuid;

    fn off_message(&self, id: Uuid);

    /// Subscribe to connect/disconnect lifecycle events.
    fn on_lifecycle(&self, handler: LifecycleHandler) -> Uuid;

    fn off_lifecycle(&self, id: Uuid);
}

/// Shared subscription bookkeeping used by the transport
/// implementations.
#[derive(Default)]
pub(crate) struct HandlerSet {
    messages: Mutex<HashMap<String, Vec<(Uuid, MessageHandler)>>>,
    lifecycle: Mutex<Vec<(Uuid, LifecycleHandler)>>,
}

impl HandlerSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on_message(&self, message: &str, handler: MessageHandler) -> Uuid {
        let id = Uuid::new_v4();
        let mut map = self
            .messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.entry(message.to_string()).or_default().push((id, handler));
        id
    }

    pub(crate) fn off_message(&self, id: Uuid) {
        let mut map = self
            .messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for handlers in map.values_mut() {
            handlers.retain(|(hid, _)| *hid != id);
        }
    }

    pub(crate) fn on_lifecycle(&self, handler: LifecycleHandler) -> Uuid {
        let id = Uuid::new_v4();
        self.lifecycle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((id, handler));
        id
    }

    pub(crate) fn off_lifecycle(&self, id: Uuid) {
        self.lifecycle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|(hid, _)| *hid != id);
    }

    /// Dispatch an inbound message to every subscribed handler.
    pub(crate) fn dispatch(&self, message: &str, payload: Value) {
        let handlers: Vec<MessageHandler> = {
            let map = self
                .messages
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.get(message)
                .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(payload.clone());
        }
    }

    pub(crate) fn fire(&self, event: LifecycleEvent) {
        let handlers: Vec<LifecycleHandler> = {
            let list = self
                .lifecycle
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            list.iter().map(|(_, h)| h.clone()).collect()
        };
        for handler in handlers {
            handler(event);
        }
    }
}
