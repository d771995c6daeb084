//! Cluster Gateway
//!
//! The client-facing router. Holds one persistent, continuously
//! health-checked connection per primary and per replica, grouped into
//! replication groups. Writes broadcast to every healthy primary; reads
//! prefer a group's primary and fall over to its replicas; REGX unions the
//! shards. The gateway elects no leaders and keeps no replay queue: writes
//! issued while a primary is down are lost by design.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{self, ClientConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::instance::gate_reply;
use crate::network::{Client, LineHandler, Reply, Server, ServerHandle, Session};
use crate::protocol::{Command, Response};
use crate::security::{Credentials, SharedKey};

/// Config file read by the gateway role.
pub const CONFIG_FILE: &str = ".cluster";

/// One replication group: a primary endpoint and its ordered replicas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub node: ClientConfig,
    pub replicas: Vec<ClientConfig>,
}

/// Gateway instance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Seconds between connection health ticks.
    pub health_check_interval: u64,
    pub server_config: ServerConfig,
    /// The replication groups this gateway fronts.
    pub node_configs: Vec<GroupConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            health_check_interval: 2,
            server_config: ServerConfig::default().with_address("localhost:4000"),
            node_configs: Vec::new(),
        }
    }
}

/// A running gateway.
pub struct Cluster {
    config: ClusterConfig,
    state: Arc<ClusterState>,
    server: ServerHandle,
    health_task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Cluster {
    /// Load (or create) the config in `dir`, connect to the configured
    /// instances and start serving clients.
    pub async fn open(
        dir: impl AsRef<Path>,
        shared_key: &str,
        username: &str,
        password: &str,
    ) -> Result<Self> {
        if shared_key.is_empty() {
            return Err(Error::MissingSharedKey);
        }
        if username.is_empty() || password.is_empty() {
            return Err(Error::MissingCredentials);
        }
        let dir = dir.as_ref();
        let config: ClusterConfig = config::load_or_create(dir, CONFIG_FILE, ClusterConfig::default())?;

        let groups = config
            .node_configs
            .iter()
            .map(|group| ReplicationGroup {
                primary: Arc::new(NodeConnection::new(group.node.clone(), false)),
                replicas: group
                    .replicas
                    .iter()
                    .map(|replica| Arc::new(NodeConnection::new(replica.clone(), true)))
                    .collect(),
            })
            .collect();

        let state = Arc::new(ClusterState {
            credentials: Credentials::new(username, password),
            nauth_token: SharedKey::new(shared_key).token(),
            groups,
        });

        // First connect pass so the routing table is usable immediately;
        // unreachable instances stay unhealthy until a later tick.
        join_all(
            state
                .connections()
                .map(|conn| conn.health_check(&state.nauth_token)),
        )
        .await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let health_task = tokio::spawn(health_loop(
            config.health_check_interval,
            state.clone(),
            shutdown_rx,
        ));

        let handler = Arc::new(ClusterHandler {
            state: state.clone(),
        });
        let server = Server::new(config.server_config.clone()).start(handler).await?;
        info!(
            address = %server.local_addr(),
            groups = state.groups.len(),
            "cluster open"
        );

        Ok(Self {
            config,
            state,
            server,
            health_task,
            shutdown: shutdown_tx,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Stop accepting, cancel the health loop and close the outbound
    /// connections.
    pub async fn close(self) {
        self.server.close().await;
        let _ = self.shutdown.send(true);
        let _ = self.health_task.await;
        for conn in self.state.connections() {
            conn.close().await;
        }
        info!("cluster closed");
    }
}

/// Gateway-side record of one outbound connection.
struct NodeConnection {
    address: String,
    is_replica: bool,
    healthy: AtomicBool,
    last_health_check: Mutex<Option<Instant>>,
    conn: tokio::sync::Mutex<Conn>,
}

struct Conn {
    client: Client,
    authed: bool,
}

impl NodeConnection {
    fn new(config: ClientConfig, is_replica: bool) -> Self {
        let address = config.server_address.clone();
        Self {
            address,
            is_replica,
            healthy: AtomicBool::new(false),
            last_health_check: Mutex::new(None),
            conn: tokio::sync::Mutex::new(Conn {
                client: Client::new(config),
                authed: false,
            }),
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Send one line over the established connection. Never dials; the
    /// health loop owns connection recovery.
    async fn query(&self, line: &str) -> Result<String> {
        let mut conn = self.conn.lock().await;
        if !conn.client.is_connected() || !conn.authed {
            return Err(Error::NotConnected);
        }
        match conn.client.send(line).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                conn.authed = false;
                self.healthy.store(false, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Send one line and collect the streamed response.
    async fn query_scan(&self, line: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        if !conn.client.is_connected() || !conn.authed {
            return Err(Error::NotConnected);
        }
        match conn.client.send_scan(line).await {
            Ok(lines) => Ok(lines),
            Err(e) => {
                conn.authed = false;
                self.healthy.store(false, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// One health tick: ping the live connection, or try to re-establish
    /// it. The unhealthy flag is set before any slow reconnect so reads
    /// fail over promptly.
    async fn health_check(&self, nauth_token: &str) {
        let mut alive = false;
        {
            let mut conn = self.conn.lock().await;
            if conn.client.is_connected() && conn.authed {
                match conn.client.send("PING").await {
                    Ok(reply) if reply == "OK PONG" => alive = true,
                    _ => conn.authed = false,
                }
            }
        }
        if !alive {
            self.healthy.store(false, Ordering::Relaxed);
            alive = self.establish(nauth_token).await.is_ok();
        }
        let was = self.healthy.swap(alive, Ordering::Relaxed);
        if was != alive {
            info!(address = %self.address, replica = self.is_replica, healthy = alive, "connection health changed");
        }
        if let Ok(mut last) = self.last_health_check.lock() {
            *last = Some(Instant::now());
        }
    }

    async fn establish(&self, nauth_token: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if !conn.client.is_connected() {
            conn.client.reconnect().await?;
            conn.authed = false;
        }
        if !conn.authed {
            let reply = conn.client.send(&format!("NAUTH {}", nauth_token)).await?;
            if reply != "OK authenticated" {
                return Err(Error::NotAuthenticated);
            }
            conn.authed = true;
        }
        Ok(())
    }

    async fn close(&self) {
        let mut conn = self.conn.lock().await;
        conn.client.close().await;
        conn.authed = false;
    }
}

struct ReplicationGroup {
    primary: Arc<NodeConnection>,
    replicas: Vec<Arc<NodeConnection>>,
}

struct ClusterState {
    credentials: Credentials,
    nauth_token: String,
    groups: Vec<ReplicationGroup>,
}

impl ClusterState {
    fn connections(&self) -> impl Iterator<Item = &Arc<NodeConnection>> {
        self.groups
            .iter()
            .flat_map(|group| std::iter::once(&group.primary).chain(group.replicas.iter()))
    }

    /// Broadcast a mutation to every healthy primary. The first `OK` wins;
    /// when every healthy primary answered `ERR`, the first `ERR` is
    /// relayed; zero healthy primaries is its own error.
    async fn broadcast_write(&self, line: &str) -> Reply {
        let mut first_ok: Option<String> = None;
        let mut first_err: Option<String> = None;
        for group in &self.groups {
            let primary = &group.primary;
            if !primary.is_healthy() {
                continue;
            }
            match primary.query(line).await {
                Ok(reply) if reply.starts_with("OK") => {
                    if first_ok.is_none() {
                        first_ok = Some(reply);
                    }
                }
                Ok(reply) => {
                    if first_err.is_none() {
                        first_err = Some(reply);
                    }
                }
                Err(e) => {
                    warn!(address = %primary.address, error = %e, "write to primary failed");
                }
            }
        }
        match (first_ok, first_err) {
            (Some(reply), _) => Reply::Frame(Response::from_line(&reply)),
            (None, Some(reply)) => Reply::Frame(Response::from_line(&reply)),
            (None, None) => Reply::Frame(Response::from(&Error::NoPrimaries)),
        }
    }

    /// Walk groups in order: prefer the primary when healthy, else try its
    /// replicas; the first `OK` wins.
    async fn read_one(&self, line: &str) -> Reply {
        let mut attempted = false;
        for group in &self.groups {
            let mut primary_answered = false;
            if group.primary.is_healthy() {
                attempted = true;
                match group.primary.query(line).await {
                    Ok(reply) if reply.starts_with("OK") => {
                        return Reply::Frame(Response::from_line(&reply));
                    }
                    // An authoritative miss on this shard; on to the next.
                    Ok(_) => primary_answered = true,
                    Err(_) => {}
                }
            }
            if primary_answered {
                continue;
            }
            for replica in &group.replicas {
                if !replica.is_healthy() {
                    continue;
                }
                attempted = true;
                match replica.query(line).await {
                    Ok(reply) if reply.starts_with("OK") => {
                        return Reply::Frame(Response::from_line(&reply));
                    }
                    _ => continue,
                }
            }
        }
        if attempted {
            Reply::Frame(Response::from(&Error::KeyNotFound))
        } else {
            Reply::Frame(Response::from(&Error::NoPrimaries))
        }
    }

    /// Query every group (primary, or replica fallback) with the bare
    /// pattern, union the streams, then apply gateway-side offset/limit.
    async fn regx_union(
        &self,
        pattern: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Reply {
        let downstream = format!("REGX {}", pattern);
        let mut attempted = false;
        let mut seen = std::collections::HashSet::new();
        let mut union: Vec<String> = Vec::new();
        for group in &self.groups {
            let target = if group.primary.is_healthy() {
                Some(&group.primary)
            } else {
                group.replicas.iter().find(|replica| replica.is_healthy())
            };
            let Some(target) = target else { continue };
            attempted = true;
            match target.query_scan(&downstream).await {
                Ok(lines) => {
                    for line in lines {
                        if line == "DONE" || line == "OK 0" || line.starts_with("ERR") {
                            continue;
                        }
                        if let Some(payload) = line.strip_prefix("OK ") {
                            // Broadcast writes land on every shard, so the
                            // union dedups by key.
                            let key = payload.split_once(' ').map(|(key, _)| key).unwrap_or(payload);
                            if seen.insert(key.to_string()) {
                                union.push(payload.to_string());
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(address = %target.address, error = %e, "scan query failed");
                }
            }
        }
        if !attempted {
            return Reply::Frame(Response::from(&Error::NoPrimaries));
        }

        let sliced: Vec<String> = union
            .into_iter()
            .skip(offset.unwrap_or(0))
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        if sliced.is_empty() {
            return Reply::Frame(Response::ok_value("0"));
        }
        let mut frames: Vec<Response> = sliced.into_iter().map(Response::ok_value).collect();
        frames.push(Response::Done);
        Reply::Stream(frames)
    }

    /// One stats segment per reachable instance, tagged with its address.
    async fn aggregate_stats(&self) -> Reply {
        let mut segments = Vec::new();
        for conn in self.connections() {
            if !conn.is_healthy() {
                continue;
            }
            if let Ok(reply) = conn.query("STATS").await {
                if let Some(payload) = reply.strip_prefix("OK ") {
                    segments.push(format!("[{}] {}", conn.address, payload));
                }
            }
        }
        if segments.is_empty() {
            Reply::Frame(Response::from(&Error::NoPrimaries))
        } else {
            Reply::Frame(Response::ok_value(segments.join(" | ")))
        }
    }
}

async fn health_loop(
    interval_secs: u64,
    state: Arc<ClusterState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    // The open pass already ran one round of checks.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                join_all(
                    state
                        .connections()
                        .map(|conn| conn.health_check(&state.nauth_token)),
                )
                .await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

struct ClusterHandler {
    state: Arc<ClusterState>,
}

impl LineHandler for ClusterHandler {
    async fn handle(&self, session: &mut Session, line: String) -> Reply {
        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(e) => return gate_reply(session, Some(&e)),
        };

        if !session.authenticated {
            return match command {
                Command::Auth { token } if self.state.credentials.verify(&token) => {
                    session.authenticated = true;
                    debug!(peer = %session.peer, "client authenticated");
                    Reply::Frame(Response::authenticated())
                }
                _ => gate_reply(session, None),
            };
        }

        match command {
            Command::Quit => Reply::Close(Response::ok_value("bye")),
            Command::Ping => Reply::Frame(Response::pong()),
            Command::Auth { token } if self.state.credentials.verify(&token) => {
                Reply::Frame(Response::authenticated())
            }
            Command::Auth { .. } | Command::Nauth { .. } => {
                Reply::Frame(Response::from(&Error::NotAuthenticated))
            }
            Command::Get { .. } => self.state.read_one(&line).await,
            Command::Regx {
                pattern,
                limit,
                offset,
            } => self.state.regx_union(&pattern, limit, offset).await,
            Command::Stats => self.state.aggregate_stats().await,
            command if command.is_mutation() => self.state.broadcast_write(&line).await,
            // All verbs are covered above; parse would have failed first.
            _ => Reply::Frame(Response::from(&Error::UnknownCommand)),
        }
    }
}
