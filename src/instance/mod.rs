//! Instance Module
//!
//! The three runtime roles: read replica, primary shard and the
//! client-facing gateway. Replicas and primaries share the storage-backed
//! command surface implemented here.

mod cluster;
mod node;
mod replica;

pub use cluster::{Cluster, ClusterConfig, GroupConfig};
pub use node::{Node, NodeConfig};
pub use replica::{NodeReplica, ReplicaConfig};

use crate::error::Error;
use crate::network::{Reply, Session};
use crate::protocol::{Command, Response};
use crate::storage::{Operation, OperationOutput, StorageHandle};

/// Canonical journal file name, kept beside the role's config file.
pub const JOURNAL_FILE: &str = ".journal";

/// Execute a storage-backed command against the instance's engine and turn
/// the outcome into wire frames. REGX streams one `OK` frame per match and
/// terminates with `DONE`; an empty result is the single frame `OK 0`.
pub(crate) async fn storage_reply(engine: &StorageHandle, command: Command) -> Reply {
    let op = match command {
        Command::Put { key, value } => Operation::Put { key, value },
        Command::Get { key } => Operation::Get { key },
        Command::Del { key } => Operation::Del { key },
        Command::Incr { key, delta } => Operation::Incr { key, delta },
        Command::Decr { key, delta } => Operation::Decr { key, delta },
        Command::Regx {
            pattern,
            limit,
            offset,
        } => Operation::Regx {
            pattern,
            limit,
            offset,
        },
        Command::Stats => Operation::Stats,
        // Connection-level commands never reach the engine.
        Command::Auth { .. } | Command::Nauth { .. } | Command::Ping | Command::Quit => {
            return Reply::Frame(Response::from(&Error::UnknownCommand))
        }
    };

    match engine.execute(op).await {
        Ok(OperationOutput::Done) => Reply::Frame(Response::Ok),
        Ok(OperationOutput::Value(value)) => Reply::Frame(Response::ok_value(value)),
        Ok(OperationOutput::Stats(stats)) => Reply::Frame(Response::ok_value(stats.to_string())),
        Ok(OperationOutput::Entries(entries)) => {
            if entries.is_empty() {
                return Reply::Frame(Response::ok_value("0"));
            }
            let mut frames: Vec<Response> = entries
                .into_iter()
                .map(|(key, value)| Response::ok_value(format!("{} {}", key, value)))
                .collect();
            frames.push(Response::Done);
            Reply::Stream(frames)
        }
        Err(e) => Reply::Frame(Response::from(&e)),
    }
}

/// The reply for a frame that arrived before authentication, or that did
/// not parse at all.
pub(crate) fn gate_reply(session: &Session, parse_error: Option<&Error>) -> Reply {
    if !session.authenticated {
        return Reply::Frame(Response::from(&Error::NotAuthenticated));
    }
    match parse_error {
        Some(e) => Reply::Frame(Response::from(e)),
        None => Reply::Frame(Response::from(&Error::UnknownCommand)),
    }
}
