//! Primary Node
//!
//! One shard: the replica command surface plus replication fan-out. Every
//! acknowledged mutation is enqueued to each healthy read replica over a
//! dedicated outbound client owned by a forwarder task, so per-connection
//! order is preserved and a slow replica never blocks the reply to the
//! gateway. A background loop pings the replicas every
//! `health_check_interval` seconds and refreshes the memory guard.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{self, ClientConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::instance::{gate_reply, storage_reply, JOURNAL_FILE};
use crate::network::{Client, LineHandler, Reply, Server, ServerHandle, Session};
use crate::observability::MemoryGuard;
use crate::persistence::Journal;
use crate::protocol::{Command, Response};
use crate::security::SharedKey;
use crate::storage::{HashTable, StorageEngine, StorageHandle};

/// Config file read by the primary role.
pub const CONFIG_FILE: &str = ".node";

/// Primary instance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Seconds between replica health ticks.
    pub health_check_interval: u64,
    /// Refuse writes when process RSS exceeds this percentage of total
    /// memory.
    pub max_memory_threshold: f64,
    pub server_config: ServerConfig,
    /// Outbound endpoints of this shard's read replicas.
    pub read_replicas: Vec<ClientConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            health_check_interval: 2,
            max_memory_threshold: 75.0,
            server_config: ServerConfig::default().with_address("localhost:4001"),
            read_replicas: Vec::new(),
        }
    }
}

/// A running primary shard.
pub struct Node {
    config: NodeConfig,
    engine: StorageHandle,
    server: ServerHandle,
    links: Arc<Vec<Arc<ReplicaLink>>>,
    health_task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Load (or create) the config in `dir`, replay the journal, connect
    /// the replica links and start serving.
    pub async fn open(dir: impl AsRef<Path>, shared_key: &str) -> Result<Self> {
        if shared_key.is_empty() {
            return Err(Error::MissingSharedKey);
        }
        let dir = dir.as_ref();
        let config: NodeConfig = config::load_or_create(dir, CONFIG_FILE, NodeConfig::default())?;
        let shared_key = SharedKey::new(shared_key);

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

        let links: Arc<Vec<Arc<ReplicaLink>>> = Arc::new(
            config
                .read_replicas
                .iter()
                .map(|replica| ReplicaLink::spawn(replica.clone(), shared_key.token()))
                .collect(),
        );

        let memory = Arc::new(MemoryGuard::new(config.max_memory_threshold));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let health_task = tokio::spawn(health_loop(
            config.health_check_interval,
            links.clone(),
            memory.clone(),
            shutdown_rx,
        ));

        let handler = Arc::new(NodeHandler {
            engine: engine.clone(),
            shared_key,
            links: links.clone(),
            memory,
        });
        let server = Server::new(config.server_config.clone()).start(handler).await?;
        info!(
            address = %server.local_addr(),
            replicas = links.len(),
            "node open"
        );

        Ok(Self {
            config,
            engine,
            server,
            links,
            health_task,
            shutdown: shutdown_tx,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Stop accepting, cancel the health loop, close the replica links and
    /// the journal.
    pub async fn close(self) {
        self.server.close().await;
        let _ = self.shutdown.send(true);
        let _ = self.health_task.await;
        for link in self.links.iter() {
            link.close();
        }
        self.engine.shutdown().await;
        info!("node closed");
    }
}

enum LinkCommand {
    /// Replicate one mutation line.
    Mutation(String),
    /// Ping the replica and update the health flag.
    HealthCheck,
    /// Drain and close the link.
    Shutdown,
}

/// One outbound replica connection, owned by its forwarder task. The
/// queue preserves per-connection mutation order.
struct ReplicaLink {
    address: String,
    tx: mpsc::UnboundedSender<LinkCommand>,
    healthy: Arc<AtomicBool>,
}

impl ReplicaLink {
    fn spawn(config: ClientConfig, nauth_token: String) -> Arc<Self> {
        let address = config.server_address.clone();
        let healthy = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_link(
            Client::new(config),
            nauth_token,
            rx,
            healthy.clone(),
        ));
        // The first health tick connects and authenticates the link.
        let link = Self {
            address,
            tx,
            healthy,
        };
        let _ = link.tx.send(LinkCommand::HealthCheck);
        Arc::new(link)
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn enqueue(&self, line: String) {
        // Fire-and-forget: a dropped forwarder means accepted loss.
        let _ = self.tx.send(LinkCommand::Mutation(line));
    }

    fn ping(&self) {
        let _ = self.tx.send(LinkCommand::HealthCheck);
    }

    fn close(&self) {
        let _ = self.tx.send(LinkCommand::Shutdown);
    }
}

async fn run_link(
    mut client: Client,
    nauth_token: String,
    mut rx: mpsc::UnboundedReceiver<LinkCommand>,
    healthy: Arc<AtomicBool>,
) {
    let mut authed = false;
    while let Some(command) = rx.recv().await {
        match command {
            LinkCommand::Mutation(line) => {
                if let Err(e) = ensure_link_ready(&mut client, &nauth_token, &mut authed).await {
                    healthy.store(false, Ordering::Relaxed);
                    warn!(address = %client.server_address(), error = %e, "dropping replicated mutation");
                    continue;
                }
                match client.send(&line).await {
                    Ok(reply) if reply.starts_with("OK") => {}
                    Ok(reply) => {
                        warn!(address = %client.server_address(), reply, "replica rejected mutation")
                    }
                    Err(e) => {
                        authed = false;
                        healthy.store(false, Ordering::Relaxed);
                        warn!(address = %client.server_address(), error = %e, "replication send failed");
                    }
                }
            }
            LinkCommand::HealthCheck => {
                let ok = match ensure_link_ready(&mut client, &nauth_token, &mut authed).await {
                    Ok(()) => matches!(client.send("PING").await.as_deref(), Ok("OK PONG")),
                    Err(_) => false,
                };
                if !ok {
                    authed = false;
                }
                let was = healthy.swap(ok, Ordering::Relaxed);
                if was != ok {
                    info!(address = %client.server_address(), healthy = ok, "replica health changed");
                }
            }
            LinkCommand::Shutdown => break,
        }
    }
    client.close().await;
    debug!(address = %client.server_address(), "replica link closed");
}

async fn ensure_link_ready(client: &mut Client, nauth_token: &str, authed: &mut bool) -> Result<()> {
    if !client.is_connected() {
        client.reconnect().await?;
        *authed = false;
    }
    if !*authed {
        let reply = client.send(&format!("NAUTH {}", nauth_token)).await?;
        if reply != "OK authenticated" {
            return Err(Error::NotAuthenticated);
        }
        *authed = true;
    }
    Ok(())
}

async fn health_loop(
    interval_secs: u64,
    links: Arc<Vec<Arc<ReplicaLink>>>,
    memory: Arc<MemoryGuard>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                memory.refresh();
                for link in links.iter() {
                    link.ping();
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

struct NodeHandler {
    engine: StorageHandle,
    shared_key: SharedKey,
    links: Arc<Vec<Arc<ReplicaLink>>>,
    memory: Arc<MemoryGuard>,
}

impl LineHandler for NodeHandler {
    async fn handle(&self, session: &mut Session, line: String) -> Reply {
        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(e) => return gate_reply(session, Some(&e)),
        };

        if !session.authenticated {
            return match command {
                Command::Nauth { token } if self.shared_key.verify(&token) => {
                    session.authenticated = true;
                    debug!(peer = %session.peer, "gateway connection authenticated");
                    Reply::Frame(Response::authenticated())
                }
                _ => gate_reply(session, None),
            };
        }

        match command {
            Command::Quit => Reply::Close(Response::ok_value("bye")),
            Command::Ping => Reply::Frame(Response::pong()),
            Command::Nauth { token } if self.shared_key.verify(&token) => {
                Reply::Frame(Response::authenticated())
            }
            Command::Nauth { .. } | Command::Auth { .. } => {
                Reply::Frame(Response::from(&Error::NotAuthenticated))
            }
            command if command.is_mutation() => {
                if self.memory.is_over_threshold() {
                    return Reply::Frame(Response::from(&Error::MemoryPressure));
                }
                let reply = storage_reply(&self.engine, command).await;
                if let Reply::Frame(response) = &reply {
                    if response.is_ok() {
                        self.replicate(&line);
                    }
                }
                reply
            }
            command => storage_reply(&self.engine, command).await,
        }
    }
}

impl NodeHandler {
    /// Enqueue an acknowledged mutation to every healthy replica.
    fn replicate(&self, line: &str) {
        for link in self.links.iter() {
            if link.is_healthy() {
                link.enqueue(line.to_string());
            } else {
                debug!(address = %link.address, "skipping unhealthy replica");
            }
        }
    }
}
