//! MAGNETAR Server Binary
//!
//! Starts one instance in the selected role: cluster gateway, primary
//! node or read replica. Configuration lives in the role's YAML file
//! inside the config directory and is created with defaults on first
//! start.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use magnetar::instance::{Cluster, Node, NodeReplica};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Client-facing gateway fronting the replication groups.
    Cluster,
    /// Primary shard accepting gateway commands.
    Node,
    /// Read replica following one primary.
    NodeReplica,
}

/// MAGNETAR - Sharded In-Memory Key-Value Cluster
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Instance role
    #[arg(long, value_enum)]
    role: Role,

    /// Directory holding the role's config file and journal
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Shared key authenticating instances to each other
    /// (falls back to MAGNETAR_SHARED_KEY)
    #[arg(long)]
    shared_key: Option<String>,

    /// Gateway client username (cluster role, falls back to MAGNETAR_USERNAME)
    #[arg(long)]
    username: Option<String>,

    /// Gateway client password (cluster role, falls back to MAGNETAR_PASSWORD)
    #[arg(long)]
    password: Option<String>,
}

fn arg_or_env(arg: Option<String>, env_key: &str) -> String {
    arg.or_else(|| std::env::var(env_key).ok()).unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("magnetar=info".parse()?))
        .init();

    let args = Args::parse();
    let shared_key = arg_or_env(args.shared_key, "MAGNETAR_SHARED_KEY");

    match args.role {
        Role::Cluster => {
            let username = arg_or_env(args.username, "MAGNETAR_USERNAME");
            let password = arg_or_env(args.password, "MAGNETAR_PASSWORD");
            let cluster = Cluster::open(&args.config_dir, &shared_key, &username, &password)
                .await
                .context("failed to open cluster")?;
            info!(address = %cluster.local_addr(), "cluster running");
            signal::ctrl_c().await?;
            cluster.close().await;
        }
        Role::Node => {
            let node = Node::open(&args.config_dir, &shared_key)
                .await
                .context("failed to open node")?;
            info!(address = %node.local_addr(), "node running");
            signal::ctrl_c().await?;
            node.close().await;
        }
        Role::NodeReplica => {
            let replica = NodeReplica::open(&args.config_dir, &shared_key)
                .await
                .context("failed to open node replica")?;
            info!(address = %replica.local_addr(), "node replica running");
            signal::ctrl_c().await?;
            replica.close().await;
        }
    }

    Ok(())
}
