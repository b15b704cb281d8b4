//! Control server.
//!
//! Exposes the three logical service surfaces over the wire protocol:
//!
//! - *LocalWorkerConfigService*: config streams for workers.
//! - *LocalWorkerControlService*: request streams to workers, actual
//!   streams back from them, discovery plumbing, the clock.
//! - *NetworkControlService*: unary `Set*` operations and `Watch*`
//!   streams for operator-facing controllers.
//!
//! Every connection runs on its own task; every server stream on a
//! sub-task that dies with the connection or an explicit cancel frame.

mod conn;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::ApiError;
use crate::manager::Manager;

use conn::Connection;

/// Listener configuration of the control server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8823,
        }
    }
}

/// The control server.
pub struct Server {
    config: ServerConfig,
    manager: Arc<Manager>,
}

impl Server {
    pub fn new(config: ServerConfig, manager: Arc<Manager>) -> Self {
        Self { config, manager }
    }

    /// Binds and serves until the token is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<(), ApiError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(address = %addr, "control server listening");
        Self::serve(Arc::clone(&self.manager), listener, token).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(
        manager: Arc<Manager>,
        listener: TcpListener,
        token: CancellationToken,
    ) -> Result<(), ApiError> {
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    tracing::debug!("control server shutting down");
                    return Ok(());
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(peer = %peer, "connection accepted");
                            let conn = Connection::new(
                                Arc::clone(&manager),
                                peer.ip().to_string(),
                                token.child_token(),
                            );
                            tokio::spawn(conn.run(stream));
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                        }
                    }
                }
            }
        }
    }
}
