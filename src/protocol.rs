//! Wire protocol for replicant synchronization
//!
//! Message names, request/acknowledgement payloads, and the `Operation`
//! record that describes a single mutation of a replicated value tree.
//! All payloads are JSON objects; `undefined` values are modelled as
//! absent fields (`Option::None`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// === Message names ===

pub const JOIN_ROOM: &str = "joinRoom";
pub const DECLARE: &str = "replicant:declare";
pub const PROPOSE_ASSIGNMENT: &str = "replicant:proposeAssignment";
pub const PROPOSE_OPERATIONS: &str = "replicant:proposeOperations";
pub const READ: &str = "replicant:read";
pub const ASSIGNMENT: &str = "replicant:assignment";
pub const OPERATIONS: &str = "replicant:operations";

/// Identity of a replicant: unique per `(namespace, name)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicantIdent {
    pub namespace: String,
    pub name: String,
}

impl ReplicantIdent {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ReplicantIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Per-replicant options, immutable after first use.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplicantOpts {
    /// Whether the server should persist this replicant across restarts.
    pub persistent: bool,

    /// How often (milliseconds) the server flushes a persistent replicant.
    pub persistence_interval_ms: u64,

    /// Value the server assigns if it has none at declare time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

pub const DEFAULT_PERSISTENCE_INTERVAL_MS: u64 = 100;

impl Default for ReplicantOpts {
    fn default() -> Self {
        Self {
            persistent: true,
            persistence_interval_ms: DEFAULT_PERSISTENCE_INTERVAL_MS,
            default_value: None,
        }
    }
}

// === Operations ===

/// The fixed mutation vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpMethod {
    Add,
    Update,
    Delete,
    Push,
    Pop,
    Shift,
    Unshift,
    Splice,
    Sort,
    Reverse,
}

impl OpMethod {
    /// Whether this method mutates an array in place (as opposed to a
    /// named-member add/update/delete).
    pub fn is_array_mutator(&self) -> bool {
        !matches!(self, OpMethod::Add | OpMethod::Update | OpMethod::Delete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpMethod::Add => "add",
            OpMethod::Update => "update",
            OpMethod::Delete => "delete",
            OpMethod::Push => "push",
            OpMethod::Pop => "pop",
            OpMethod::Shift => "shift",
            OpMethod::Unshift => "unshift",
            OpMethod::Splice => "splice",
            OpMethod::Sort => "sort",
            OpMethod::Reverse => "reverse",
        }
    }
}

impl fmt::Display for OpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method-specific arguments: an object for member operations, a
/// positional list for array mutators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpArgs {
    #[serde(rename_all = "camelCase")]
    Member {
        prop: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_value: Option<Value>,
    },
    Call(Vec<Value>),
}

/// A single mutation record: constructed to describe one mutation, sent
/// once, applied once.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub path: String,
    pub method: OpMethod,
    pub args: OpArgs,

    /// The return value of applying this operation (e.g. what a removal
    /// returned), filled in at apply time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Wall-clock creation time in milliseconds.
    pub timestamp: u64,
}

impl Operation {
    fn new(path: impl Into<String>, method: OpMethod, args: OpArgs) -> Self {
        Self {
            path: path.into(),
            method,
            args,
            result: None,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
        }
    }

    pub fn add(path: impl Into<String>, prop: impl Into<String>, new_value: Value) -> Self {
        Self::new(
            path,
            OpMethod::Add,
            OpArgs::Member {
                prop: prop.into(),
                new_value: Some(new_value),
            },
        )
    }

    pub fn update(path: impl Into<String>, prop: impl Into<String>, new_value: Value) -> Self {
        Self::new(
            path,
            OpMethod::Update,
            OpArgs::Member {
                prop: prop.into(),
                new_value: Some(new_value),
            },
        )
    }

    pub fn delete(path: impl Into<String>, prop: impl Into<String>) -> Self {
        Self::new(
            path,
            OpMethod::Delete,
            OpArgs::Member {
                prop: prop.into(),
                new_value: None,
            },
        )
    }

    /// An array-mutator invocation with positional call arguments.
    pub fn call(path: impl Into<String>, method: OpMethod, args: Vec<Value>) -> Self {
        Self::new(path, method, OpArgs::Call(args))
    }
}

// === Outbound payloads (client → server) ===

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub room: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclareRequest {
    pub name: String,
    pub namespace: String,
    pub opts: ReplicantOpts,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposeAssignment {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_sum: Option<String>,
    pub opts: ReplicantOpts,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposeOperations {
    pub name: String,
    pub namespace: String,
    pub revision: u64,
    pub operations: Vec<Operation>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub name: String,
    pub namespace: String,
}

// === Acknowledgements (server → client, via ack callback) ===

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeclareAck {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub revision: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_sum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProposeAssignmentAck {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_sum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadAck {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub revision: u64,
}

// === Inbound pushes (server → client) ===

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentPush {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    pub revision: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationsPush {
    pub name: String,
    pub namespace: String,
    pub revision: u64,
    pub operations: Vec<Operation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_member_op_wire_shape() {
        let op = Operation::add("/config", "title", json!("hello"));
        let wire = serde_json::to_value(&op).unwrap();
        assert_eq!(wire["path"], "/config");
        assert_eq!(wire["method"], "add");
        assert_eq!(wire["args"]["prop"], "title");
        assert_eq!(wire["args"]["newValue"], "hello");
        assert!(wire.get("result").is_none());

        let back: Operation = serde_json::from_value(wire).unwrap();
        assert_eq!(back.method, OpMethod::Add);
        match back.args {
            OpArgs::Member { prop, new_value } => {
                assert_eq!(prop, "title");
                assert_eq!(new_value, Some(json!("hello")));
            }
            OpArgs::Call(_) => panic!("expected member args"),
        }
    }

    #[test]
    fn test_array_mutator_wire_shape() {
        let op = Operation::call("/items", OpMethod::Push, vec![json!(4)]);
        let wire = serde_json::to_value(&op).unwrap();
        assert_eq!(wire["method"], "push");
        assert_eq!(wire["args"], json!([4]));

        let back: Operation = serde_json::from_value(wire).unwrap();
        assert!(back.method.is_array_mutator());
        assert_eq!(back.args, OpArgs::Call(vec![json!(4)]));
    }

    #[test]
    fn test_unknown_method_fails_parse() {
        let wire = json!({
            "path": "/items",
            "method": "transmogrify",
            "args": [],
            "timestamp": 0,
        });
        assert!(serde_json::from_value::<Operation>(wire).is_err());
    }

    #[test]
    fn test_declare_ack_defaults() {
        let ack: DeclareAck = serde_json::from_value(json!({})).unwrap();
        assert_eq!(ack.value, None);
        assert_eq!(ack.revision, 0);
        assert!(ack.reject_reason.is_none());
    }

    #[test]
    fn test_opts_defaults() {
        let opts = ReplicantOpts::default();
        assert!(opts.persistent);
        assert_eq!(opts.persistence_interval_ms, DEFAULT_PERSISTENCE_INTERVAL_MS);

        let parsed: ReplicantOpts = serde_json::from_value(json!({})).unwrap();
        assert_eq!(parsed, opts);
    }
}
