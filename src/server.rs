//! TCP accept loop.
//!
//! One task is spawned per accepted connection; each task performs the
//! upgrade handshake and then runs the connection engine to completion.
//! Connections share nothing but the listener's accept queue.

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::Config;

/// WebSocket echo server.
///
/// # Example
///
/// ```ignore
/// use tokio::net::TcpListener;
/// use wsframe::{Config, Server};
///
/// let listener = TcpListener::bind("0.0.0.0:3000").await?;
/// Server::new(Config::default()).serve(listener).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a server with the given per-connection configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Get the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Accept connections from `listener` until it fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.map_err(Error::Io)?;
            stream.set_nodelay(true).ok();

            let config = self.config.clone();
            tokio::spawn(async move {
                match Connection::accept(stream, &config).await {
                    Ok(mut conn) => {
                        info!(%peer, "connection upgraded");
                        if let Err(e) = conn.run().await {
                            warn!(%peer, error = %e, "connection aborted");
                        }
                        info!(%peer, "connection closed");
                    }
                    Err(e) => warn!(%peer, error = %e, "handshake rejected"),
                }
            });
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
