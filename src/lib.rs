//! Client-side replicated state over an authoritative server.
//!
//! A [`Replicant`] is a named, namespaced JSON value that stays in sync
//! with a server across any number of clients. Local mutations are
//! validated, recorded as operations, and proposed upstream; the server
//! totally orders them and broadcasts revision-stamped batches back to
//! every declared client. The server's copy always wins: clients detect
//! revision gaps and re-fetch rather than merging.
//!
//! Typical use:
//!
//! ```no_run
//! use replicant::{Manager, transport::tcp::TcpTransport};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(TcpTransport::connect("127.0.0.1:9090").await?);
//! let manager = Manager::new(transport);
//!
//! let score = manager.replicant("dashboard", "score")?;
//! score.on_change(|event| {
//!     println!("score is now {:?}", event.new_value);
//! });
//! score.assign(json!({ "home": 0, "away": 0 }))?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod manager;
pub mod path;
pub mod protocol;
pub mod replicant;
pub mod schema;
pub mod transport;

pub use error::{ReplicantError, TransportError};
pub use manager::Manager;
pub use protocol::{OpMethod, Operation, ReplicantIdent, ReplicantOpts};
pub use replicant::wrap::SharedNode;
pub use replicant::{ChangeEvent, Replicant, Status};
pub use schema::{CompiledSchema, SchemaViolation, ValidationFailure};
pub use transport::{LifecycleEvent, Transport};
