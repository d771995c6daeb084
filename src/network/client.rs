//! Resilient Line Client
//!
//! Connects to one remote instance, writes a line, reads a line. A
//! transport error moves the client to the disconnected state; sends fail
//! until `reconnect()` succeeds. Reconnects make at most `max_retries`
//! attempts spaced `retry_wait_time` seconds apart.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::network::tls::{self, ClientStream};
use crate::protocol::LineCodec;

/// Outbound connection to a primary or replica.
pub struct Client {
    config: ClientConfig,
    framed: Option<Framed<ClientStream, LineCodec>>,
}

impl Client {
    /// Create a disconnected client.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            framed: None,
        }
    }

    pub fn server_address(&self) -> &str {
        &self.config.server_address
    }

    pub fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    /// Establish the connection, wrapping in TLS when configured.
    pub async fn connect(&mut self) -> Result<()> {
        let connect = TcpStream::connect(&self.config.server_address);
        let stream = timeout(Duration::from_secs(self.config.connect_timeout), connect)
            .await
            .map_err(|_| Error::Timeout)??;

        let stream = if self.config.use_tls {
            let connector = tls::client_connector(self.config.ca_cert_file.as_deref())?;
            let name = tls::server_name(&self.config.server_address)?;
            ClientStream::Tls(Box::new(connector.connect(name, stream).await?))
        } else {
            ClientStream::Plain(stream)
        };

        self.framed = Some(Framed::new(
            stream,
            LineCodec::new(self.config.buffer_size),
        ));
        debug!(address = %self.config.server_address, "client connected");
        Ok(())
    }

    /// Write one line and read one response line.
    pub async fn send(&mut self, line: &str) -> Result<String> {
        match self.try_send(line).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.framed = None;
                Err(e)
            }
        }
    }

    /// Write one line and collect a streamed response: frames up to and
    /// including the `DONE` terminator, or a single non-stream frame.
    pub async fn send_scan(&mut self, line: &str) -> Result<Vec<String>> {
        match self.try_send_scan(line).await {
            Ok(lines) => Ok(lines),
            Err(e) => {
                self.framed = None;
                Err(e)
            }
        }
    }

    /// Re-establish a dropped connection under the retry policy.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.framed = None;
        let wait = Duration::from_secs(self.config.retry_wait_time);
        let mut last_error = Error::NotConnected;
        for attempt in 1..=self.config.max_retries.max(1) {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        address = %self.config.server_address,
                        attempt,
                        error = %e,
                        "reconnect attempt failed"
                    );
                    last_error = e;
                }
            }
            if attempt < self.config.max_retries.max(1) {
                sleep(wait).await;
            }
        }
        Err(last_error)
    }

    /// Close the connection, if any.
    pub async fn close(&mut self) {
        if let Some(mut framed) = self.framed.take() {
            let _ = framed.close().await;
        }
    }

    async fn try_send(&mut self, line: &str) -> Result<String> {
        self.write_line(line).await?;
        self.read_line().await
    }

    async fn try_send_scan(&mut self, line: &str) -> Result<Vec<String>> {
        self.write_line(line).await?;
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            let terminal = line == "DONE" || line == "OK 0" || line.starts_with("ERR ");
            let streamed = line.starts_with("OK ");
            lines.push(line);
            if terminal || !streamed {
                break;
            }
        }
        Ok(lines)
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let framed = self.framed.as_mut().ok_or(Error::NotConnected)?;
        timeout(
            Duration::from_secs(self.config.write_timeout),
            framed.send(line.to_string()),
        )
        .await
        .map_err(|_| Error::Timeout)??;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let framed = self.framed.as_mut().ok_or(Error::NotConnected)?;
        let next = timeout(Duration::from_secs(self.config.read_timeout), framed.next())
            .await
            .map_err(|_| Error::Timeout)?;
        match next {
            Some(Ok(line)) => Ok(line),
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::ServerConfig;
    use crate::network::server::{LineHandler, Reply, Server, Session};
    use crate::protocol::Response;

    struct Scanner;

    impl LineHandler for Scanner {
        async fn handle(&self, _session: &mut Session, line: String) -> Reply {
            match line.as_str() {
                "PING" => Reply::Frame(Response::pong()),
                "SCAN" => Reply::Stream(vec![
                    Response::ok_value("a 1"),
                    Response::ok_value("b 2"),
                    Response::Done,
                ]),
                "EMPTY" => Reply::Frame(Response::ok_value("0")),
                _ => Reply::Frame(Response::Err("unknown command".into())),
            }
        }
    }

    async fn start_scanner() -> crate::network::ServerHandle {
        let config = ServerConfig::default().with_address("localhost:0");
        Server::new(config).start(Arc::new(Scanner)).await.unwrap()
    }

    fn client_for(addr: std::net::SocketAddr) -> Client {
        let mut config = ClientConfig::default().with_server_address(addr.to_string());
        config.retry_wait_time = 0;
        Client::new(config)
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let server = start_scanner().await;
        let mut client = client_for(server.local_addr());

        assert!(!client.is_connected());
        assert!(matches!(
            client.send("PING").await,
            Err(Error::NotConnected)
        ));

        client.connect().await.unwrap();
        assert_eq!(client.send("PING").await.unwrap(), "OK PONG");

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_scan_collects_until_done() {
        let server = start_scanner().await;
        let mut client = client_for(server.local_addr());
        client.connect().await.unwrap();

        let lines = client.send_scan("SCAN").await.unwrap();
        assert_eq!(lines, vec!["OK a 1", "OK b 2", "DONE"]);

        let lines = client.send_scan("EMPTY").await.unwrap();
        assert_eq!(lines, vec!["OK 0"]);

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_send_after_server_gone_disconnects() {
        let server = start_scanner().await;
        let addr = server.local_addr();
        let mut client = client_for(addr);
        client.connect().await.unwrap();
        server.close().await;

        // The transport error moves the client to disconnected; further
        // sends fail fast until a reconnect succeeds.
        assert!(client.send("PING").await.is_err());
        assert!(!client.is_connected());
        assert!(matches!(
            client.send("PING").await,
            Err(Error::NotConnected)
        ));
        assert!(client.reconnect().await.is_err());
    }
}
