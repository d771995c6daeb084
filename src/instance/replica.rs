//! Read Replica
//!
//! Accepts authenticated pushes from its primary, applies them to the
//! local table, journals them and serves reads. Replicas never initiate
//! replication; on restart the journal is replayed into an empty table
//! before the listener starts.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{self, ServerConfig};
use crate::error::{Error, Result};
use crate::instance::{gate_reply, storage_reply, JOURNAL_FILE};
use crate::network::{LineHandler, Reply, Server, ServerHandle, Session};
use crate::persistence::Journal;
use crate::protocol::{Command, Response};
use crate::security::SharedKey;
use crate::storage::{HashTable, StorageEngine, StorageHandle};

/// Config file read by the replica role.
pub const CONFIG_FILE: &str = ".nodereplica";

/// Replica instance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Seconds between background maintenance ticks.
    pub health_check_interval: u64,
    pub server_config: ServerConfig,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            health_check_interval: 2,
            server_config: ServerConfig::default().with_address("localhost:4002"),
        }
    }
}

/// A running read replica.
pub struct NodeReplica {
    config: ReplicaConfig,
    engine: StorageHandle,
    server: ServerHandle,
}

impl NodeReplica {
    /// Load (or create) the config in `dir`, replay the journal and start
    /// serving.
    pub async fn open(dir: impl AsRef<Path>, shared_key: &str) -> Result<Self> {
        if shared_key.is_empty() {
            return Err(Error::MissingSharedKey);
        }
        let dir = dir.as_ref();
        let config: ReplicaConfig = config::load_or_create(dir, CONFIG_FILE, ReplicaConfig::default())?;

        let journal_path = dir.join(JOURNAL_FILE);
        let mut table = HashTable::new();
        let replayed = Journal::replay(&journal_path, |record| {
            StorageEngine::apply_record(&mut table, record);
        })?;
        if replayed > 0 {
            info!(replayed, "journal replayed into table");
        }
        let journal = Journal::open(&journal_path)?;
        let engine = StorageEngine::spawn(table, Some(journal));

        let handler = Arc::new(ReplicaHandler {
            engine: engine.clone(),
            shared_key: SharedKey::new(shared_key),
        });
        let server = Server::new(config.server_config.clone()).start(handler).await?;
        info!(address = %server.local_addr(), "node replica open");

        Ok(Self {
            config,
            engine,
            server,
        })
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Stop serving, drain handlers and close the journal.
    pub async fn close(self) {
        self.server.close().await;
        self.engine.shutdown().await;
        info!("node replica closed");
    }
}

struct ReplicaHandler {
    engine: StorageHandle,
    shared_key: SharedKey,
}

impl LineHandler for ReplicaHandler {
    async fn handle(&self, session: &mut Session, line: String) -> Reply {
        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(e) => return gate_reply(session, Some(&e)),
        };

        if !session.authenticated {
            return match command {
                Command::Nauth { token } if self.shared_key.verify(&token) => {
                    session.authenticated = true;
                    debug!(peer = %session.peer, "primary connection authenticated");
                    Reply::Frame(Response::authenticated())
                }
                _ => gate_reply(session, None),
            };
        }

        match command {
            Command::Quit => Reply::Close(Response::ok_value("bye")),
            Command::Ping => Reply::Frame(Response::pong()),
            // Re-authentication is idempotent.
            Command::Nauth { token } if self.shared_key.verify(&token) => {
                Reply::Frame(Response::authenticated())
            }
            Command::Nauth { .. } | Command::Auth { .. } => {
                Reply::Frame(Response::from(&Error::NotAuthenticated))
            }
            command => storage_reply(&self.engine, command).await,
        }
    }
}
