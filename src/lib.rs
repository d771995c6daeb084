//! MAGNETAR - Sharded In-Memory Key-Value Cluster
//!
//! A cluster gateway fans writes out to independent primary shards and reads
//! to a live primary or one of its read replicas. Every storage instance is
//! backed by a Robin-Hood hash table and an append-only journal.

pub mod config;
pub mod error;
pub mod instance;
pub mod network;
pub mod observability;
pub mod persistence;
pub mod protocol;
pub mod security;
pub mod storage;

pub use config::{ClientConfig, ServerConfig};
pub use error::Error;
pub use instance::{Cluster, Node, NodeReplica};
pub use network::{Client, Server, ServerHandle};
pub use persistence::{Journal, JournalRecord, MutationOp};
pub use protocol::{Command, LineCodec, Response};
pub use storage::{HashTable, TableStats, Value};
