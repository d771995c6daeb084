//! Line Server
//!
//! Accept loop that spawns one task per connection, frames it with the
//! line codec, applies the configured read timeout to every read and hands
//! each frame to the instance's handler together with the connection's
//! authentication state. `close()` is graceful: stop accepting, signal
//! live connections, await handler exits.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::network::tls;
use crate::protocol::{LineCodec, Response};

/// Per-connection state handed to the handler with every frame.
#[derive(Debug)]
pub struct Session {
    pub peer: SocketAddr,
    /// Set by the handler after a successful AUTH/NAUTH frame; destroyed
    /// with the connection.
    pub authenticated: bool,
}

/// What the handler wants written back for one request frame.
#[derive(Debug)]
pub enum Reply {
    /// One response frame.
    Frame(Response),
    /// A streamed response (REGX): several frames, last one terminal.
    Stream(Vec<Response>),
    /// Write one frame, then close the connection.
    Close(Response),
}

/// Per-frame command dispatcher implemented by each instance role.
pub trait LineHandler: Send + Sync + 'static {
    fn handle(
        &self,
        session: &mut Session,
        line: String,
    ) -> impl Future<Output = Reply> + Send;
}

/// Line-framed TCP server with optional TLS.
pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Bind and start accepting. Returns a handle exposing the bound
    /// address and the graceful close operation.
    pub async fn start<H: LineHandler>(self, handler: Arc<H>) -> Result<ServerHandle> {
        let listener = TcpListener::bind(&self.config.address).await?;
        let local_addr = listener.local_addr()?;

        let acceptor = if self.config.use_tls {
            let cert = self
                .config
                .cert_file
                .as_deref()
                .ok_or_else(|| Error::Tls("cert_file required when use_tls is set".into()))?;
            let key = self
                .config
                .key_file
                .as_deref()
                .ok_or_else(|| Error::Tls("key_file required when use_tls is set".into()))?;
            Some(tls::server_acceptor(cert, key)?)
        } else {
            None
        };

        info!(address = %local_addr, tls = self.config.use_tls, "server listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            self.config,
            handler,
            shutdown_rx,
        ));

        Ok(ServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// The bound listen address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close live connections and wait for handlers to
    /// drain.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn accept_loop<H: LineHandler>(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    config: ServerConfig,
    handler: Arc<H>,
    shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    let mut accept_shutdown = shutdown.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(%peer, "new connection");
                    connections.spawn(serve_socket(
                        socket,
                        peer,
                        acceptor.clone(),
                        config.clone(),
                        handler.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                }
            },
            _ = accept_shutdown.changed() => break,
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
    info!("server closed");
}

async fn serve_socket<H: LineHandler>(
    socket: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    config: ServerConfig,
    handler: Arc<H>,
    shutdown: watch::Receiver<bool>,
) {
    let result = match acceptor {
        Some(acceptor) => match acceptor.accept(socket).await {
            Ok(stream) => serve_connection(stream, peer, &config, handler, shutdown).await,
            Err(e) => {
                error!(%peer, error = %e, "tls handshake failed");
                Ok(())
            }
        },
        None => serve_connection(socket, peer, &config, handler, shutdown).await,
    };
    if let Err(e) = result {
        debug!(%peer, error = %e, "connection error");
    }
    debug!(%peer, "connection closed");
}

async fn serve_connection<S, H>(
    stream: S,
    peer: SocketAddr,
    config: &ServerConfig,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    H: LineHandler,
{
    let mut framed = Framed::new(stream, LineCodec::new(config.buffer_size));
    let mut session = Session {
        peer,
        authenticated: false,
    };
    let read_timeout = Duration::from_secs(config.read_timeout);

    loop {
        let next = tokio::select! {
            next = timeout(read_timeout, framed.next()) => next,
            _ = shutdown.changed() => break,
        };
        let line = match next {
            // Idle past the read deadline: drop the connection.
            Err(_) => {
                debug!(%peer, "read timeout");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                // Oversized or undecodable frame: report and close.
                let _ = framed.send(format!("ERR {}", e)).await;
                return Err(e);
            }
            Ok(Some(Ok(line))) => line,
        };

        match handler.handle(&mut session, line).await {
            Reply::Frame(response) => framed.send(response.to_string()).await?,
            Reply::Stream(responses) => {
                for response in responses {
                    framed.send(response.to_string()).await?;
                }
            }
            Reply::Close(response) => {
                framed.send(response.to_string()).await?;
                break;
            }
        }
    }
    Ok(())
}
