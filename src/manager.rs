//! Replicant registry
//!
//! One [`Manager`] per transport session. It guarantees a single live
//! [`Replicant`] instance per `(namespace, name)` pair: repeated
//! requests hand back clones of the same instance, and requesting an
//! existing replicant with different options is an error rather than a
//! silent re-declaration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::ReplicantError;
use crate::protocol::{ReplicantIdent, ReplicantOpts};
use crate::replicant::{Replicant, Status};
use crate::transport::Transport;

pub struct Manager {
    transport: Arc<dyn Transport>,
    registry: Mutex<HashMap<ReplicantIdent, Replicant>>,
}

impl Manager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch or create the replicant for `(namespace, name)` with
    /// default options.
    pub fn replicant(
        &self,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Replicant, ReplicantError> {
        self.replicant_with_opts(namespace, name, ReplicantOpts::default())
    }

    /// Fetch or create the replicant for `(namespace, name)`. Creating
    /// starts the declare handshake; fetching an existing instance with
    /// options that differ from the ones it was created with fails with
    /// [`ReplicantError::OptionsMismatch`].
    pub fn replicant_with_opts(
        &self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        opts: ReplicantOpts,
    ) -> Result<Replicant, ReplicantError> {
        let ident = ReplicantIdent::new(namespace, name);
        if ident.namespace.is_empty() || ident.name.is_empty() {
            return Err(ReplicantError::BadRequest(
                "replicant namespace and name must be non-empty".to_string(),
            ));
        }

        let mut registry = self.lock_registry();
        if let Some(existing) = registry.get(&ident) {
            if existing.opts() != &opts {
                return Err(ReplicantError::OptionsMismatch {
                    ident: ident.to_string(),
                });
            }
            return Ok(existing.clone());
        }

        log::debug!("creating replicant {}", ident);
        let replicant = Replicant::new(ident.clone(), opts, self.transport.clone());
        registry.insert(ident, replicant.clone());
        Ok(replicant)
    }

    /// The already-registered instance, if any, without creating one.
    pub fn get(&self, namespace: &str, name: &str) -> Option<Replicant> {
        self.lock_registry()
            .get(&ReplicantIdent::new(namespace, name))
            .cloned()
    }

    /// Idents of every replicant that has completed its declare
    /// handshake.
    pub fn declared(&self) -> Vec<ReplicantIdent> {
        self.lock_registry()
            .iter()
            .filter(|(_, r)| r.status() == Status::Declared)
            .map(|(ident, _)| ident.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock_registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_registry().is_empty()
    }

    /// Drop every registered instance. Existing clones stay alive but
    /// the next request for their ident creates a fresh replicant.
    pub fn clear(&self) {
        self.lock_registry().clear();
    }

    fn lock_registry(&self) -> MutexGuard<'_, HashMap<ReplicantIdent, Replicant>> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use serde_json::json;

    fn manager() -> (Manager, MemoryTransport) {
        let transport = MemoryTransport::new();
        (Manager::new(Arc::new(transport.clone())), transport)
    }

    #[test]
    fn test_same_ident_yields_same_instance() {
        let (manager, transport) = manager();
        let a = manager.replicant("dashboard", "score").unwrap();
        let b = manager.replicant("dashboard", "score").unwrap();
        assert_eq!(a.ident(), b.ident());
        // Only one declare handshake was started.
        assert_eq!(transport.sent_count("joinRoom"), 1);
    }

    #[test]
    fn test_options_mismatch_is_rejected() {
        let (manager, _transport) = manager();
        manager.replicant("dashboard", "score").unwrap();

        let opts = ReplicantOpts {
            persistent: false,
            ..ReplicantOpts::default()
        };
        let err = manager
            .replicant_with_opts("dashboard", "score", opts)
            .unwrap_err();
        assert!(matches!(err, ReplicantError::OptionsMismatch { .. }));
    }

    #[test]
    fn test_replicant_debug_names_ident() {
        let (manager, _transport) = manager();
        let rep = manager.replicant("dashboard", "score").unwrap();
        let rendered = format!("{:?}", rep);
        assert!(rendered.contains("dashboard"));
        assert!(rendered.contains("score"));
        assert!(rendered.contains("Declaring"));
    }

    #[test]
    fn test_empty_ident_is_rejected() {
        let (manager, _transport) = manager();
        assert!(manager.replicant("", "score").is_err());
        assert!(manager.replicant("dashboard", "").is_err());
    }

    #[test]
    fn test_declared_lists_only_declared() {
        let (manager, transport) = manager();
        let rep = manager.replicant("dashboard", "score").unwrap();
        assert!(manager.declared().is_empty());

        let join = transport.last("joinRoom").unwrap();
        transport.ack(join.seq, json!({}));
        let declare = transport.last("replicant:declare").unwrap();
        transport.ack(declare.seq, json!({ "revision": 0 }));

        assert_eq!(rep.status(), Status::Declared);
        assert_eq!(manager.declared(), vec![rep.ident().clone()]);
    }

    #[test]
    fn test_clear_forgets_instances() {
        let (manager, _transport) = manager();
        manager.replicant("dashboard", "score").unwrap();
        assert_eq!(manager.len(), 1);
        manager.clear();
        assert!(manager.is_empty());
    }
}
