//! Shared wire-level test utilities.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;

use magnetar::security::{Credentials, SharedKey};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub const SHARED_KEY: &str = "test-key";
pub const USERNAME: &str = "test-user";
pub const PASSWORD: &str = "test-pass";

/// A raw protocol connection speaking CRLF frames.
pub struct Wire {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Wire {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Write one frame and read one response frame.
    pub async fn send(&mut self, line: &str) -> String {
        self.write(line).await;
        self.read_line().await
    }

    pub async fn write(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .expect("write frame");
    }

    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await.expect("read frame");
        assert!(n > 0, "connection closed by peer");
        line.trim_end().to_string()
    }

    /// Read a streamed response: frames up to and including `DONE`, or a
    /// single non-stream frame.
    pub async fn read_stream(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let terminal =
                line == "DONE" || line == "OK 0" || line.starts_with("ERR") || line == "OK";
            lines.push(line);
            if terminal {
                break;
            }
        }
        lines
    }

    /// Authenticate with the instance shared key (replica/node roles).
    pub async fn nauth(&mut self) {
        let reply = self
            .send(&format!("NAUTH {}", SharedKey::new(SHARED_KEY).token()))
            .await;
        assert_eq!(reply, "OK authenticated");
    }

    /// Authenticate with the gateway credentials.
    pub async fn auth(&mut self) {
        let token = Credentials::new(USERNAME, PASSWORD).encode();
        let reply = self.send(&format!("AUTH {}", token)).await;
        assert_eq!(reply, "OK authenticated");
    }
}

/// Write a role config file into the instance directory.
pub fn write_config<T: Serialize>(dir: &Path, file_name: &str, config: &T) {
    std::fs::write(
        dir.join(file_name),
        serde_yaml::to_string(config).expect("serialize config"),
    )
    .expect("write config");
}

/// Outbound endpoint settings tuned for tests: fast failure, no retry
/// backoff.
pub fn test_client_config(addr: SocketAddr) -> magnetar::ClientConfig {
    let mut config = magnetar::ClientConfig::default().with_server_address(addr.to_string());
    config.connect_timeout = 2;
    config.write_timeout = 2;
    config.read_timeout = 2;
    config.max_retries = 1;
    config.retry_wait_time = 0;
    config
}
