//! Accepts one client at a time and runs its session to completion.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::FutureExt;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};
use tokio::time::sleep;

use crate::config::DaqConfig;
use crate::session::{Session, SessionError, SessionOutcome};
use crate::source::{SourceError, SourceSpec};

/// Errors fatal to the whole server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot resolve {0}")]
    Resolve(String),

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("sample source unusable: {0}")]
    Source(#[from] SourceError),
}

/// Upper bound on reads while draining a closing connection.
const MAX_DRAIN_READS: usize = 64;

pub struct Server {
    listener: TcpListener,
    config: DaqConfig,
    source: SourceSpec,
}

impl Server {
    /// Binds the listening socket with address reuse enabled.
    pub async fn bind(config: DaqConfig, source: SourceSpec) -> Result<Self, ServerError> {
        source.check()?;

        let target = format!("{}:{}", config.host, config.port);
        let addr = lookup_host(&target)
            .await
            .map_err(|_| ServerError::Resolve(target.clone()))?
            .next()
            .ok_or_else(|| ServerError::Resolve(target.clone()))?;

        let listener = listen(addr, &config).map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        info!("Listening for clients on {}", addr);
        Ok(Self {
            listener,
            config,
            source,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves clients one after another, forever. Per-session failures are
    /// logged and never stop the loop.
    pub async fn run(&self) -> Result<(), ServerError> {
        loop {
            if let Err(e) = self.serve_next().await {
                error!("Accept failed: {}", e);
                sleep(Duration::from_millis(50)).await;
            }
        }
    }

    /// Accepts a single client and serves it until its session closes.
    pub async fn serve_next(&self) -> io::Result<Result<SessionOutcome, SessionError>> {
        let (stream, peer) = self.listener.accept().await?;
        info!("Accepted client at {}", peer);
        Ok(serve_connection(stream, self.config.clone(), self.source.clone()).await)
    }
}

fn listen(addr: SocketAddr, config: &DaqConfig) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    if let Some(size) = config.send_buffer_size {
        // Accepted sockets inherit the listener's buffer size
        socket.set_send_buffer_size(size)?;
    }
    socket.bind(addr)?;
    socket.listen(1)
}

/// Runs one session over `stream` and always cleans the connection up.
pub async fn serve_connection(
    stream: TcpStream,
    config: DaqConfig,
    source: SourceSpec,
) -> Result<SessionOutcome, SessionError> {
    let mut session = Session::new(stream, config, source);
    let result = session.run().await;
    match &result {
        Ok(outcome) => info!("Session closed: {:?}", outcome),
        Err(SessionError::PeerReset(e)) => warn!("Client connection reset: {}", e),
        Err(e) => error!("Session aborted: {}", e),
    }
    cleanup(session.into_inner()).await;
    result
}

/// Drains whatever the client still has in flight, then shuts the
/// connection down.
///
/// Every failure here is swallowed and logged at debug level: the client may
/// already be gone, and nothing about a closing connection is worth
/// interrupting the accept loop for.
pub async fn cleanup<S>(mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 4096];
    for _ in 0..MAX_DRAIN_READS {
        match stream.read(&mut buf).now_or_never() {
            Some(Ok(n)) if n > 0 => continue,
            Some(Err(e)) => {
                debug!("Ignoring error while draining client: {}", e);
                break;
            }
            _ => break,
        }
    }
    if let Err(e) = stream.shutdown().await {
        debug!("Ignoring error while shutting down client: {}", e);
    }
}
