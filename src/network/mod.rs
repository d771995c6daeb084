//! Network Module
//!
//! Line-framed TCP transport: server accept loop with graceful shutdown
//! and per-read timeouts, resilient outbound client, optional TLS
//! wrapping on both sides.

mod client;
mod server;
mod tls;

pub use client::Client;
pub use server::{LineHandler, Reply, Server, ServerHandle, Session};
pub use tls::{client_connector, server_acceptor, ClientStream};
