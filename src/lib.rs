//! Raft-replicated atomic values.
//!
//! Based on:
//! - "In Search of an Understandable Consensus Algorithm" (Ongaro & Ousterhout)
//! - Diego Ongaro's PhD dissertation (leader stickiness, lease reads, client sessions)
//!
//! The consensus core ([`node`], [`runtime`]) performs no network I/O: it returns
//! [`command::Command`]s for the caller to carry out. [`server`] wires it to disk,
//! TCP and HTTP; [`cluster`] drives it in memory under a virtual clock.

pub mod client;
pub mod client_api;
pub mod cluster;
pub mod command;
pub mod file_storage;
pub mod machine;
pub mod membership;
pub mod node;
pub mod primitive;
pub mod runtime;
pub mod server;
pub mod session;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod value;

pub use client::{AtomicValueClient, ClientConfig, ClientError};
pub use machine::{AtomicValueMachine, ClientCommand};
pub use membership::Membership;
pub use node::{Node, Role};
pub use primitive::{ClientReply, ClientRequest};
pub use runtime::{Runtime, StateMachine, TimerConfig};
pub use session::{SessionId, SessionTag};
pub use types::{LogEntry, LogIndex, NodeId, Term};
pub use value::{AtomicValue, ValueCommand, ValueResult};
