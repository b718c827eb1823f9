//! Raft consensus with joint-consensus membership changes and snapshot compaction.
//!
//! A [`Node`] owns one participant. Peers reach it through a [`NodeHandle`], which the embedding
//! transport calls for inbound RPCs; outbound RPCs, persistence and the replicated application
//! are supplied through the [`Transport`], [`PersistentStore`] and [`StateMachine`] traits.

pub mod cluster;
pub mod config;
pub mod election;
pub mod error;
pub mod membership;
pub mod msg;
pub mod node;
pub mod pronouncer;
mod raft_node;
pub mod replication;
mod rpc;
mod state;
pub mod storage;
pub mod timer;
pub mod transport;

pub use config::EngineConfig;
pub use error::{
    DiscoveryError, RaftError, Result, StateMachineError, StorageError, TransportError,
};
pub use node::{Node, NodeHandle};
pub use storage::{MemoryStore, PersistentStore};
pub use transport::{Discovery, StateMachine, Transport};
