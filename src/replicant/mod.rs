//! Replicant core
//!
//! A Replicant is a named, namespaced value kept in sync with an
//! authoritative server over a message transport. Construction starts
//! the declare handshake; once declared, local mutations flow through
//! the interception layer into operation proposals, and inbound server
//! messages flow through the revision-ordered apply path. The server is
//! always authoritative: the client detects divergence and
//! re-synchronizes, it never merges.

pub mod wrap;

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::error::ReplicantError;
use crate::path;
use crate::protocol::{
    AssignmentPush, DeclareAck, DeclareRequest, JoinRoom, OpArgs, OpMethod, Operation,
    OperationsPush, ProposeAssignment, ProposeAssignmentAck, ProposeOperations, ReadAck,
    ReadRequest, ReplicantIdent, ReplicantOpts, ASSIGNMENT, DECLARE, JOIN_ROOM, OPERATIONS,
    PROPOSE_ASSIGNMENT, PROPOSE_OPERATIONS, READ,
};
use crate::schema::CompiledSchema;
use crate::transport::{LifecycleEvent, Transport};
use wrap::{resolve, wrap_recursive, Container, SharedNode, Wrapped};

/// Declaration lifecycle of a replicant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Undeclared,
    Declaring,
    Declared,
}

/// Payload handed to change observers.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub new_value: Option<Value>,
    pub old_value: Option<Value>,
    pub operations: Vec<Operation>,
}

type ChangeObserver = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
type DeclaredObserver = Arc<dyn Fn(&DeclareAck) + Send + Sync>;
type FullUpdateObserver = Arc<dyn Fn(&ReadAck) + Send + Sync>;
type RejectObserver = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Observers {
    declared: HashMap<Uuid, DeclaredObserver>,
    change: HashMap<Uuid, ChangeObserver>,
    full_update: HashMap<Uuid, FullUpdateObserver>,
    declaration_rejected: HashMap<Uuid, RejectObserver>,
    assignment_rejected: HashMap<Uuid, RejectObserver>,
}

/// A deferred invocation captured while the replicant is not yet
/// declared; replayed FIFO exactly once after declaration completes.
enum QueuedAction {
    Assign(Option<Value>),
}

struct State {
    status: Status,
    value: Option<Wrapped>,
    revision: u64,
    schema: Option<CompiledSchema>,
    schema_sum: Option<String>,
    queue: VecDeque<QueuedAction>,
    /// Bumped on every disconnect so acknowledgements from a dead
    /// session are recognized and dropped.
    epoch: u64,
    last_rejection: Option<String>,
}

struct Shared {
    ident: ReplicantIdent,
    opts: ReplicantOpts,
    transport: Arc<dyn Transport>,
    state: Mutex<State>,
    observers: Mutex<Observers>,
}

/// A named, namespaced, server-synchronized value with local change
/// notifications. Cheap to clone; clones are handles onto the same
/// instance.
#[derive(Clone)]
pub struct Replicant {
    shared: Arc<Shared>,
}

impl fmt::Debug for Replicant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replicant")
            .field("ident", &self.shared.ident)
            .field("status", &self.status())
            .field("revision", &self.revision())
            .finish()
    }
}

impl Replicant {
    /// Construct a fresh replicant bound to `transport`, subscribe to
    /// the inbound message kinds, and begin declaring. Deduplication
    /// against existing instances is the registry's job
    /// (`Manager::replicant`); this constructor is only reached for a
    /// `(namespace, name)` pair with no live instance.
    pub(crate) fn new(
        ident: ReplicantIdent,
        opts: ReplicantOpts,
        transport: Arc<dyn Transport>,
    ) -> Replicant {
        let replicant = Replicant {
            shared: Arc::new(Shared {
                ident,
                opts,
                transport: transport.clone(),
                state: Mutex::new(State {
                    status: Status::Undeclared,
                    value: None,
                    revision: 0,
                    schema: None,
                    schema_sum: None,
                    queue: VecDeque::new(),
                    epoch: 0,
                    last_rejection: None,
                }),
                observers: Mutex::new(Observers::default()),
            }),
        };

        let rep = replicant.clone();
        transport.on_message(ASSIGNMENT, Arc::new(move |payload| rep.handle_assignment(payload)));
        let rep = replicant.clone();
        transport.on_message(OPERATIONS, Arc::new(move |payload| rep.handle_operations(payload)));
        let rep = replicant.clone();
        transport.on_lifecycle(Arc::new(move |event| match event {
            LifecycleEvent::Disconnect => rep.handle_disconnect(),
            LifecycleEvent::Connect => rep.declare(),
        }));

        replicant.declare();
        replicant
    }

    // === Accessors ===

    pub fn name(&self) -> &str {
        &self.shared.ident.name
    }

    pub fn namespace(&self) -> &str {
        &self.shared.ident.namespace
    }

    pub fn ident(&self) -> &ReplicantIdent {
        &self.shared.ident
    }

    pub fn opts(&self) -> &ReplicantOpts {
        &self.shared.opts
    }

    pub fn status(&self) -> Status {
        self.lock_state().status
    }

    pub fn revision(&self) -> u64 {
        self.lock_state().revision
    }

    /// Deep snapshot of the current value; `None` before the first
    /// assignment.
    pub fn value(&self) -> Option<Value> {
        self.lock_state().value.as_ref().map(Wrapped::to_value)
    }

    /// Snapshot of the node at `path`, if present.
    pub fn get(&self, p: &str) -> Option<Value> {
        let segments = path::to_segments(p);
        let st = self.lock_state();
        let root = st.value.as_ref()?;
        resolve(root, &segments).map(|w| w.to_value())
    }

    /// The most recent server rejection reason, retained when no
    /// rejection observer was registered.
    pub fn last_rejection(&self) -> Option<String> {
        self.lock_state().last_rejection.clone()
    }

    /// Validate a candidate value against the active schema. Always
    /// succeeds when no schema is active.
    pub fn validate(&self, value: &Value) -> Result<(), ReplicantError> {
        let st = self.lock_state();
        match &st.schema {
            Some(schema) => schema.validate(value).map_err(ReplicantError::Validation),
            None => Ok(()),
        }
    }

    /// A live handle onto the container at `path`, usable with
    /// [`set_shared`](Self::set_shared) / [`assign_shared`](Self::assign_shared).
    pub fn shared_node(&self, p: &str) -> Result<SharedNode, ReplicantError> {
        let segments = path::to_segments(p);
        let st = self.lock_state();
        let root = st
            .value
            .as_ref()
            .ok_or_else(|| ReplicantError::NoSuchPath(p.to_string()))?;
        let node = resolve(root, &segments).ok_or_else(|| ReplicantError::NoSuchPath(p.to_string()))?;
        let container = node
            .as_container()
            .ok_or_else(|| ReplicantError::NotAContainer(p.to_string()))?;
        Ok(SharedNode {
            node: container.clone(),
        })
    }

    // === Observer registration ===

    pub fn on_declared<F>(&self, observer: F) -> Uuid
    where
        F: Fn(&DeclareAck) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.lock_observers().declared.insert(id, Arc::new(observer));
        id
    }

    pub fn off_declared(&self, id: Uuid) {
        self.lock_observers().declared.remove(&id);
    }

    /// Register a change observer. If the replicant is already
    /// declared, the observer is immediately replayed the current value
    /// (old value absent, empty operations list).
    pub fn on_change<F>(&self, observer: F) -> Uuid
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        let observer: ChangeObserver = Arc::new(observer);
        self.lock_observers().change.insert(id, observer.clone());

        let replay = {
            let st = self.lock_state();
            if st.status == Status::Declared {
                Some(ChangeEvent {
                    new_value: st.value.as_ref().map(Wrapped::to_value),
                    old_value: None,
                    operations: Vec::new(),
                })
            } else {
                None
            }
        };
        if let Some(event) = replay {
            observer(&event);
        }
        id
    }

    pub fn off_change(&self, id: Uuid) {
        self.lock_observers().change.remove(&id);
    }

    pub fn on_full_update<F>(&self, observer: F) -> Uuid
    where
        F: Fn(&ReadAck) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.lock_observers().full_update.insert(id, Arc::new(observer));
        id
    }

    pub fn off_full_update(&self, id: Uuid) {
        self.lock_observers().full_update.remove(&id);
    }

    pub fn on_declaration_rejected<F>(&self, observer: F) -> Uuid
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.lock_observers()
            .declaration_rejected
            .insert(id, Arc::new(observer));
        id
    }

    pub fn off_declaration_rejected(&self, id: Uuid) {
        self.lock_observers().declaration_rejected.remove(&id);
    }

    pub fn on_assignment_rejected<F>(&self, observer: F) -> Uuid
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.lock_observers()
            .assignment_rejected
            .insert(id, Arc::new(observer));
        id
    }

    pub fn off_assignment_rejected(&self, id: Uuid) {
        self.lock_observers().assignment_rejected.remove(&id);
    }

    // === Local mutation (the interception facade) ===

    /// Replace the whole value. While declared this validates and
    /// proposes the assignment upstream; before declaration the set is
    /// queued and replayed after the declare handshake completes.
    pub fn assign(&self, value: Value) -> Result<(), ReplicantError> {
        {
            let mut st = self.lock_state();
            if st.status != Status::Declared {
                st.queue.push_back(QueuedAction::Assign(Some(value)));
                return Ok(());
            }
            let current = st.value.as_ref().map(Wrapped::to_value);
            if current.as_ref() == Some(&value) {
                return Ok(());
            }
        }
        self.propose_assignment(Some(value))
    }

    /// Replace the whole value with a live node taken from this
    /// replicant's own tree. A node owned by a different replicant is
    /// rejected without mutating either side.
    pub fn assign_shared(&self, node: &SharedNode) -> Result<(), ReplicantError> {
        if let Some(meta) = node.node.meta() {
            if meta.owner != self.shared.ident {
                return Err(ReplicantError::OwnershipViolation {
                    path: "/".to_string(),
                    owner: meta.owner.to_string(),
                });
            }
        }
        self.assign(node.snapshot())
    }

    /// Write the member addressed by `path`. No-op when the value is
    /// unchanged; otherwise validates the tree with the change applied,
    /// records an `add` (new member) or `update` (existing member)
    /// operation, performs the underlying write, and proposes the
    /// operation upstream.
    pub fn set(&self, p: &str, value: Value) -> Result<(), ReplicantError> {
        let segments = path::to_segments(p);
        if segments.is_empty() {
            return self.assign(value);
        }
        self.set_wrapped(&segments, value, None)
    }

    /// Attach a live container at `path`. Within the same replicant
    /// this moves the node (its recorded path is refreshed); a node
    /// owned by another replicant is rejected without mutation.
    pub fn set_shared(&self, p: &str, node: &SharedNode) -> Result<(), ReplicantError> {
        let segments = path::to_segments(p);
        if segments.is_empty() {
            return self.assign_shared(node);
        }
        if let Some(meta) = node.node.meta() {
            if meta.owner != self.shared.ident {
                return Err(ReplicantError::OwnershipViolation {
                    path: p.to_string(),
                    owner: meta.owner.to_string(),
                });
            }
        }
        self.set_wrapped(&segments, node.snapshot(), Some(node.node.clone()))
    }

    /// Delete the member addressed by `path`. No-op when the parent (or
    /// the whole value) does not exist.
    pub fn delete(&self, p: &str) -> Result<(), ReplicantError> {
        let segments = path::to_segments(p);
        if segments.is_empty() {
            return Err(ReplicantError::BadRequest(
                "cannot delete the root value".to_string(),
            ));
        }
        let (parent_segments, prop) = split_target(&segments);
        let parent_path = path::to_path_string(parent_segments);

        let sent;
        {
            let st = self.lock_state();
            if st.status != Status::Declared {
                return Err(ReplicantError::NotDeclared);
            }
            let Some(root) = st.value.clone() else {
                return Ok(());
            };
            let Some(parent) = resolve(&root, parent_segments)
                .and_then(|w| w.as_container().cloned())
            else {
                return Ok(());
            };

            if let Some(schema) = &st.schema {
                let probe = Wrapped::from_value(&root.to_value());
                if let Some(probe_parent) =
                    resolve(&probe, parent_segments).and_then(|w| w.as_container().cloned())
                {
                    probe_parent.remove_member(prop);
                }
                schema
                    .validate(&probe.to_value())
                    .map_err(ReplicantError::Validation)?;
            }
            sent = (Operation::delete(&parent_path, prop), st.revision);
            parent.remove_member(prop);
        }
        self.send_operations(vec![sent.0], sent.1);
        Ok(())
    }

    /// Invoke a canonical array-mutating method on the array at `path`.
    /// The mutation itself is deferred: the recorded operation is
    /// proposed upstream and applied when the server echoes it at the
    /// next revision.
    pub fn mutate(&self, p: &str, method: OpMethod, args: Vec<Value>) -> Result<(), ReplicantError> {
        if !method.is_array_mutator() {
            return Err(ReplicantError::BadRequest(format!(
                "{} is not an array mutator",
                method
            )));
        }
        let segments = path::to_segments(p);
        let sent;
        {
            let st = self.lock_state();
            if st.status != Status::Declared {
                return Err(ReplicantError::NotDeclared);
            }
            let root = st
                .value
                .clone()
                .ok_or_else(|| ReplicantError::NoSuchPath(p.to_string()))?;
            let target = resolve(&root, &segments)
                .ok_or_else(|| ReplicantError::NoSuchPath(p.to_string()))?;
            target
                .as_container()
                .filter(|c| c.is_array())
                .ok_or_else(|| ReplicantError::NotAnArray(p.to_string()))?;

            if let Some(schema) = &st.schema {
                let probe = Wrapped::from_value(&root.to_value());
                if let Some(probe_target) =
                    resolve(&probe, &segments).and_then(|w| w.as_container().cloned())
                {
                    probe_target.array_mutate(method, &args)?;
                }
                schema
                    .validate(&probe.to_value())
                    .map_err(ReplicantError::Validation)?;
            }
            sent = (Operation::call(p, method, args), st.revision);
        }
        self.send_operations(vec![sent.0], sent.1);
        Ok(())
    }

    pub fn push(&self, p: &str, value: Value) -> Result<(), ReplicantError> {
        self.mutate(p, OpMethod::Push, vec![value])
    }

    pub fn pop(&self, p: &str) -> Result<(), ReplicantError> {
        self.mutate(p, OpMethod::Pop, Vec::new())
    }

    pub fn shift(&self, p: &str) -> Result<(), ReplicantError> {
        self.mutate(p, OpMethod::Shift, Vec::new())
    }

    pub fn unshift(&self, p: &str, value: Value) -> Result<(), ReplicantError> {
        self.mutate(p, OpMethod::Unshift, vec![value])
    }

    pub fn splice(
        &self,
        p: &str,
        start: i64,
        delete_count: i64,
        items: Vec<Value>,
    ) -> Result<(), ReplicantError> {
        let mut args = vec![Value::from(start), Value::from(delete_count)];
        args.extend(items);
        self.mutate(p, OpMethod::Splice, args)
    }

    pub fn sort(&self, p: &str) -> Result<(), ReplicantError> {
        self.mutate(p, OpMethod::Sort, Vec::new())
    }

    pub fn reverse(&self, p: &str) -> Result<(), ReplicantError> {
        self.mutate(p, OpMethod::Reverse, Vec::new())
    }

    fn set_wrapped(
        &self,
        segments: &[String],
        value: Value,
        live_node: Option<Arc<Container>>,
    ) -> Result<(), ReplicantError> {
        let (parent_segments, prop) = split_target(segments);
        let parent_path = path::to_path_string(parent_segments);
        let member_path = path::join(&parent_path, prop);

        let sent;
        {
            let st = self.lock_state();
            if st.status != Status::Declared {
                return Err(ReplicantError::NotDeclared);
            }
            let root = st
                .value
                .clone()
                .ok_or_else(|| ReplicantError::NoSuchPath(parent_path.clone()))?;
            let parent = resolve(&root, parent_segments)
                .ok_or_else(|| ReplicantError::NoSuchPath(parent_path.clone()))?;
            let parent = parent
                .as_container()
                .ok_or_else(|| ReplicantError::NotAContainer(parent_path.clone()))?
                .clone();

            if let Some(node) = &live_node {
                if node.contains(&parent) {
                    return Err(ReplicantError::BadRequest(format!(
                        "cannot attach the node at {} inside its own subtree",
                        member_path
                    )));
                }
            }

            let existing = parent.get_member(prop);
            if let (Some(node), Some(Wrapped::Container(current))) = (&live_node, &existing) {
                if Arc::ptr_eq(node, current) {
                    return Ok(());
                }
            }
            if existing.as_ref().map(Wrapped::to_value).as_ref() == Some(&value) {
                return Ok(());
            }

            if let Some(schema) = &st.schema {
                let probe = Wrapped::from_value(&root.to_value());
                let probe_parent = resolve(&probe, parent_segments)
                    .and_then(|w| w.as_container().cloned())
                    .ok_or_else(|| ReplicantError::NoSuchPath(parent_path.clone()))?;
                probe_parent.set_member(prop, Wrapped::from_value(&value))?;
                schema
                    .validate(&probe.to_value())
                    .map_err(ReplicantError::Validation)?;
            }
            let op = if existing.is_some() {
                Operation::update(&parent_path, prop, value.clone())
            } else {
                Operation::add(&parent_path, prop, value.clone())
            };
            sent = (op, st.revision);

            let member = match live_node {
                Some(node) => Wrapped::Container(node),
                None => Wrapped::from_value(&value),
            };
            parent.set_member(prop, member.clone())?;
            wrap_recursive(&member, &self.shared.ident, &member_path)?;
        }
        self.send_operations(vec![sent.0], sent.1);
        Ok(())
    }

    // === Declare handshake ===

    /// Start the declare handshake. No-op while already declaring or
    /// declared.
    pub fn declare(&self) {
        let epoch = {
            let mut st = self.lock_state();
            if st.status != Status::Undeclared {
                return;
            }
            st.status = Status::Declaring;
            st.epoch
        };

        let room = JoinRoom {
            room: format!("replicant:{}", self.shared.ident.namespace),
        };
        let payload = match serde_json::to_value(&room) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("{}: failed to serialize joinRoom: {}", self.shared.ident, e);
                return;
            }
        };
        let rep = self.clone();
        self.shared.transport.emit_with_ack(
            JOIN_ROOM,
            payload,
            Box::new(move |result| match result {
                Ok(_) => rep.send_declare(epoch),
                Err(e) => {
                    log::error!("{}: failed to join room: {}", rep.shared.ident, e);
                    rep.revert_declaring(epoch);
                }
            }),
        );
    }

    fn send_declare(&self, epoch: u64) {
        let request = DeclareRequest {
            name: self.shared.ident.name.clone(),
            namespace: self.shared.ident.namespace.clone(),
            opts: self.shared.opts.clone(),
        };
        let payload = match serde_json::to_value(&request) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("{}: failed to serialize declare: {}", self.shared.ident, e);
                self.revert_declaring(epoch);
                return;
            }
        };
        let rep = self.clone();
        self.shared.transport.emit_with_ack(
            DECLARE,
            payload,
            Box::new(move |result| rep.handle_declare_ack(epoch, result)),
        );
    }

    fn revert_declaring(&self, epoch: u64) {
        let mut st = self.lock_state();
        if st.epoch == epoch && st.status == Status::Declaring {
            st.status = Status::Undeclared;
        }
    }

    fn handle_declare_ack(
        &self,
        epoch: u64,
        result: Result<Value, crate::error::TransportError>,
    ) {
        let payload = match result {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("{}: declare failed: {}", self.shared.ident, e);
                self.revert_declaring(epoch);
                return;
            }
        };
        let ack: DeclareAck = match serde_json::from_value(payload) {
            Ok(ack) => ack,
            Err(e) => {
                log::error!("{}: malformed declare ack: {}", self.shared.ident, e);
                self.revert_declaring(epoch);
                return;
            }
        };

        let mut change_event = None;
        let mut drained = Vec::new();
        {
            let mut st = self.lock_state();
            if st.epoch != epoch || st.status != Status::Declaring {
                log::debug!("{}: ignoring stale declare ack", self.shared.ident);
                return;
            }

            if let Some(reason) = &ack.reject_reason {
                st.status = Status::Undeclared;
                st.last_rejection = Some(reason.clone());
                let reason = reason.clone();
                drop(st);
                self.emit_declaration_rejected(&reason);
                return;
            }

            st.status = Status::Declared;

            if let Some(schema_doc) = &ack.schema {
                match CompiledSchema::compile(schema_doc) {
                    Ok(schema) => {
                        st.schema_sum = ack
                            .schema_sum
                            .clone()
                            .or_else(|| Some(schema.sum().to_string()));
                        st.schema = Some(schema);
                    }
                    Err(e) => {
                        log::error!("{}: server sent an invalid schema: {}", self.shared.ident, e)
                    }
                }
            }

            let local = st.value.as_ref().map(Wrapped::to_value);
            if ack.revision != st.revision || local != ack.value {
                match assign_locked(&mut st, &self.shared.ident, ack.value.clone(), Some(ack.revision)) {
                    Ok(event) => change_event = Some(event),
                    Err(e) => log::error!("{}: failed to assign declared value: {}", self.shared.ident, e),
                }
            } else if st.value.is_none() && st.revision == 0 {
                // Declaring with an empty value must still notify
                // observers once.
                change_event = Some(ChangeEvent {
                    new_value: None,
                    old_value: None,
                    operations: Vec::new(),
                });
            }

            drained.extend(st.queue.drain(..));
        }

        if let Some(event) = change_event.take() {
            self.emit_change(&event);
        }
        self.emit_declared(&ack);

        for action in drained {
            match action {
                QueuedAction::Assign(value) => {
                    if let Err(e) = self.propose_assignment(value) {
                        log::warn!("{}: queued assignment failed: {}", self.shared.ident, e);
                    }
                }
            }
        }
    }

    // === Proposals ===

    fn propose_assignment(&self, value: Option<Value>) -> Result<(), ReplicantError> {
        let (payload, epoch) = {
            let mut st = self.lock_state();
            if st.status != Status::Declared {
                st.queue.push_back(QueuedAction::Assign(value));
                return Ok(());
            }
            if let (Some(schema), Some(v)) = (&st.schema, &value) {
                schema.validate(v).map_err(ReplicantError::Validation)?;
            }
            let request = ProposeAssignment {
                name: self.shared.ident.name.clone(),
                namespace: self.shared.ident.namespace.clone(),
                value: value.clone(),
                schema_sum: st.schema_sum.clone(),
                opts: self.shared.opts.clone(),
            };
            (serde_json::to_value(&request)?, st.epoch)
        };

        let rep = self.clone();
        self.shared.transport.emit_with_ack(
            PROPOSE_ASSIGNMENT,
            payload,
            Box::new(move |result| rep.handle_propose_ack(epoch, result)),
        );
        Ok(())
    }

    fn handle_propose_ack(
        &self,
        epoch: u64,
        result: Result<Value, crate::error::TransportError>,
    ) {
        let payload = match result {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("{}: proposeAssignment failed: {}", self.shared.ident, e);
                return;
            }
        };
        let ack: ProposeAssignmentAck = match serde_json::from_value(payload) {
            Ok(ack) => ack,
            Err(e) => {
                log::error!("{}: malformed proposeAssignment ack: {}", self.shared.ident, e);
                return;
            }
        };

        let rejection = {
            let mut st = self.lock_state();
            if st.epoch != epoch {
                log::debug!("{}: ignoring stale proposeAssignment ack", self.shared.ident);
                return;
            }
            if let Some(schema_doc) = &ack.schema {
                if ack.schema_sum != st.schema_sum {
                    match CompiledSchema::compile(schema_doc) {
                        Ok(schema) => {
                            st.schema_sum = ack
                                .schema_sum
                                .clone()
                                .or_else(|| Some(schema.sum().to_string()));
                            st.schema = Some(schema);
                        }
                        Err(e) => log::error!(
                            "{}: server sent an invalid schema: {}",
                            self.shared.ident,
                            e
                        ),
                    }
                }
            }
            if let Some(reason) = &ack.reject_reason {
                st.last_rejection = Some(reason.clone());
            }
            ack.reject_reason.clone()
        };

        if let Some(reason) = rejection {
            self.emit_assignment_rejected(&reason);
        }
    }

    fn send_operations(&self, operations: Vec<Operation>, revision: u64) {
        let request = ProposeOperations {
            name: self.shared.ident.name.clone(),
            namespace: self.shared.ident.namespace.clone(),
            revision,
            operations,
        };
        match serde_json::to_value(&request) {
            Ok(payload) => self.shared.transport.emit(PROPOSE_OPERATIONS, payload),
            Err(e) => log::error!(
                "{}: failed to serialize proposeOperations: {}",
                self.shared.ident,
                e
            ),
        }
    }

    // === Inbound handlers ===

    fn handle_assignment(&self, payload: Value) {
        let push: AssignmentPush = match serde_json::from_value(payload) {
            Ok(push) => push,
            Err(e) => {
                log::warn!("malformed assignment push: {}", e);
                return;
            }
        };
        if push.name != self.shared.ident.name || push.namespace != self.shared.ident.namespace {
            return;
        }
        if let Err(e) = self.assign_value(push.new_value, Some(push.revision)) {
            log::error!("{}: failed to apply assignment push: {}", self.shared.ident, e);
        }
    }

    fn handle_operations(&self, payload: Value) {
        let push: OperationsPush = match serde_json::from_value(payload) {
            Ok(push) => push,
            Err(e) => {
                log::error!("malformed operations push: {}", e);
                return;
            }
        };
        if push.name != self.shared.ident.name || push.namespace != self.shared.ident.namespace {
            return;
        }

        let event = {
            let mut st = self.lock_state();
            if st.status != Status::Declared {
                log::debug!(
                    "{}: ignoring operations push while {:?}",
                    self.shared.ident,
                    st.status
                );
                return;
            }

            let expected = st.revision + 1;
            if push.revision != expected {
                log::warn!(
                    "{}: revision gap (have {}, got {}), requesting full update",
                    self.shared.ident,
                    st.revision,
                    push.revision
                );
                drop(st);
                self.full_update();
                return;
            }

            let Some(root) = st.value.clone() else {
                log::error!(
                    "{}: operations push against an empty value, requesting full update",
                    self.shared.ident
                );
                drop(st);
                self.full_update();
                return;
            };

            let old_value = Some(root.to_value());
            let mut operations = push.operations;
            for op in &mut operations {
                if let Err(e) = apply_operation(&root, &self.shared.ident, op) {
                    log::error!(
                        "{}: failed to apply {} at {}: {}, requesting full update",
                        self.shared.ident,
                        op.method,
                        op.path,
                        e
                    );
                    drop(st);
                    self.full_update();
                    return;
                }
            }
            st.revision = push.revision;

            ChangeEvent {
                new_value: Some(root.to_value()),
                old_value,
                operations,
            }
        };
        self.emit_change(&event);
    }

    fn handle_disconnect(&self) {
        let mut st = self.lock_state();
        st.status = Status::Undeclared;
        st.queue.clear();
        st.epoch += 1;
        log::debug!("{}: transport disconnected, now undeclared", self.shared.ident);
    }

    // === Full update (revision-gap recovery) ===

    fn full_update(&self) {
        let request = ReadRequest {
            name: self.shared.ident.name.clone(),
            namespace: self.shared.ident.namespace.clone(),
        };
        if request.name.is_empty() || request.namespace.is_empty() {
            log::error!("refusing read request with empty name or namespace");
            return;
        }
        let payload = match serde_json::to_value(&request) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("{}: failed to serialize read: {}", self.shared.ident, e);
                return;
            }
        };
        let epoch = self.lock_state().epoch;
        let rep = self.clone();
        self.shared.transport.emit_with_ack(
            READ,
            payload,
            Box::new(move |result| rep.handle_read_ack(epoch, result)),
        );
    }

    fn handle_read_ack(&self, epoch: u64, result: Result<Value, crate::error::TransportError>) {
        let payload = match result {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("{}: read failed: {}", self.shared.ident, e);
                return;
            }
        };
        let ack: ReadAck = match serde_json::from_value(payload) {
            Ok(ack) => ack,
            Err(e) => {
                log::error!("{}: malformed read ack: {}", self.shared.ident, e);
                return;
            }
        };
        if self.lock_state().epoch != epoch {
            log::debug!("{}: ignoring stale read ack", self.shared.ident);
            return;
        }
        if let Err(e) = self.assign_value(ack.value.clone(), Some(ack.revision)) {
            log::error!("{}: failed to apply full update: {}", self.shared.ident, e);
            return;
        }
        self.emit_full_update(&ack);
    }

    // === Assignment (authoritative full-value application) ===

    fn assign_value(
        &self,
        value: Option<Value>,
        revision: Option<u64>,
    ) -> Result<(), ReplicantError> {
        let event = {
            let mut st = self.lock_state();
            assign_locked(&mut st, &self.shared.ident, value, revision)?
        };
        self.emit_change(&event);
        Ok(())
    }

    // === Emission ===

    fn emit_change(&self, event: &ChangeEvent) {
        let observers: Vec<ChangeObserver> =
            self.lock_observers().change.values().cloned().collect();
        for observer in observers {
            observer(event);
        }
    }

    fn emit_declared(&self, ack: &DeclareAck) {
        let observers: Vec<DeclaredObserver> =
            self.lock_observers().declared.values().cloned().collect();
        for observer in observers {
            observer(ack);
        }
    }

    fn emit_full_update(&self, ack: &ReadAck) {
        let observers: Vec<FullUpdateObserver> =
            self.lock_observers().full_update.values().cloned().collect();
        for observer in observers {
            observer(ack);
        }
    }

    fn emit_declaration_rejected(&self, reason: &str) {
        let observers: Vec<RejectObserver> = self
            .lock_observers()
            .declaration_rejected
            .values()
            .cloned()
            .collect();
        if observers.is_empty() {
            log::error!(
                "{}: declaration rejected with no listener: {}",
                self.shared.ident,
                reason
            );
            return;
        }
        for observer in observers {
            observer(reason);
        }
    }

    fn emit_assignment_rejected(&self, reason: &str) {
        let observers: Vec<RejectObserver> = self
            .lock_observers()
            .assignment_rejected
            .values()
            .cloned()
            .collect();
        if observers.is_empty() {
            log::error!(
                "{}: assignment rejected with no listener: {}",
                self.shared.ident,
                reason
            );
            return;
        }
        for observer in observers {
            observer(reason);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_observers(&self) -> MutexGuard<'_, Observers> {
        self.shared
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn split_target(segments: &[String]) -> (&[String], &str) {
    // Callers guard against empty paths; an empty split targets the
    // root's "" member, which cannot exist.
    match segments.split_last() {
        Some((last, parents)) => (parents, last),
        None => (&[], ""),
    }
}

/// Apply one authoritative full-value assignment under the state lock:
/// snapshot the old value, rewrap the new value rooted at `/`, bump the
/// revision, and hand back the change event for emission after unlock.
fn assign_locked(
    st: &mut State,
    ident: &ReplicantIdent,
    value: Option<Value>,
    revision: Option<u64>,
) -> Result<ChangeEvent, ReplicantError> {
    let old_value = st.value.as_ref().map(Wrapped::to_value);
    let wrapped = value.as_ref().map(Wrapped::from_value);
    if let Some(w) = &wrapped {
        wrap_recursive(w, ident, "/")?;
    }
    st.value = wrapped;
    if let Some(revision) = revision {
        st.revision = revision;
    }
    Ok(ChangeEvent {
        new_value: value,
        old_value,
        operations: Vec::new(),
    })
}

/// Apply one already-agreed operation to the live value tree. Writes go
/// through the container layer directly, beneath the interception
/// facade, so applying never validates, records, or proposes anything.
/// The operation's `result` field is filled in with what applying it
/// returned.
fn apply_operation(
    root: &Wrapped,
    owner: &ReplicantIdent,
    op: &mut Operation,
) -> Result<(), ReplicantError> {
    let segments = path::to_segments(&op.path);
    let target = resolve(root, &segments).ok_or_else(|| ReplicantError::NoSuchPath(op.path.clone()))?;

    if op.method.is_array_mutator() {
        let container = target
            .as_container()
            .filter(|c| c.is_array())
            .ok_or_else(|| ReplicantError::NotAnArray(op.path.clone()))?;
        let args = match &op.args {
            OpArgs::Call(args) => args.clone(),
            OpArgs::Member { .. } => {
                return Err(ReplicantError::Protocol(format!(
                    "{} operation carries member args",
                    op.method
                )))
            }
        };
        op.result = container.array_mutate(op.method, &args)?;
        // Pick up nested structures the mutation introduced.
        wrap_recursive(&target, owner, &op.path)?;
        return Ok(());
    }

    let container = target
        .as_container()
        .ok_or_else(|| ReplicantError::NotAContainer(op.path.clone()))?;
    let (prop, new_value) = match &op.args {
        OpArgs::Member { prop, new_value } => (prop.clone(), new_value.clone()),
        OpArgs::Call(_) => {
            return Err(ReplicantError::Protocol(format!(
                "{} operation carries call args",
                op.method
            )))
        }
    };

    match op.method {
        OpMethod::Add | OpMethod::Update => {
            let value = new_value.ok_or_else(|| {
                ReplicantError::Protocol(format!("{} operation without newValue", op.method))
            })?;
            let member = Wrapped::from_value(&value);
            container.set_member(&prop, member.clone())?;
            wrap_recursive(&member, owner, &path::join(&op.path, &prop))?;
            op.result = Some(value);
        }
        OpMethod::Delete => {
            let existed = container.remove_member(&prop);
            op.result = Some(Value::Bool(existed));
        }
        _ => unreachable!("array mutators handled above"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ident() -> ReplicantIdent {
        ReplicantIdent::new("test-bundle", "state")
    }

    fn wrapped(value: Value) -> Wrapped {
        let w = Wrapped::from_value(&value);
        wrap_recursive(&w, &ident(), "/").unwrap();
        w
    }

    #[test]
    fn test_apply_add_and_update() {
        let root = wrapped(json!({ "config": {} }));

        let mut add = Operation::add("/config", "title", json!("hello"));
        apply_operation(&root, &ident(), &mut add).unwrap();
        assert_eq!(root.to_value(), json!({ "config": { "title": "hello" } }));
        assert_eq!(add.result, Some(json!("hello")));

        let mut update = Operation::update("/config", "title", json!("bye"));
        apply_operation(&root, &ident(), &mut update).unwrap();
        assert_eq!(root.to_value(), json!({ "config": { "title": "bye" } }));
    }

    #[test]
    fn test_apply_delete_reports_existence() {
        let root = wrapped(json!({ "config": { "title": "hello" } }));

        let mut del = Operation::delete("/config", "title");
        apply_operation(&root, &ident(), &mut del).unwrap();
        assert_eq!(del.result, Some(json!(true)));

        let mut again = Operation::delete("/config", "title");
        apply_operation(&root, &ident(), &mut again).unwrap();
        assert_eq!(again.result, Some(json!(false)));
    }

    #[test]
    fn test_apply_array_mutator_wraps_new_structures() {
        let root = wrapped(json!({ "items": [1] }));

        let mut push = Operation::call("/items", OpMethod::Push, vec![json!({ "nested": true })]);
        apply_operation(&root, &ident(), &mut push).unwrap();
        assert_eq!(root.to_value(), json!({ "items": [1, { "nested": true }] }));
        assert_eq!(push.result, Some(json!(2)));

        // The pushed object must have picked up metadata at its path.
        let item = resolve(&root, &["items".to_string(), "1".to_string()]).unwrap();
        let meta = item.as_container().unwrap().meta().unwrap();
        assert_eq!(meta.path, "/items/1");
        assert_eq!(meta.owner, ident());
    }

    #[test]
    fn test_apply_unknown_target_fails() {
        let root = wrapped(json!({}));
        let mut op = Operation::add("/missing", "x", json!(1));
        assert!(matches!(
            apply_operation(&root, &ident(), &mut op),
            Err(ReplicantError::NoSuchPath(_))
        ));
    }
}
