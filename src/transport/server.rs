//! WebSocket server accepting viewer sessions.
//!
//! Binds a TCP listener and spawns an accept loop that upgrades each
//! connection and runs it as a [`Session`] task with its own id.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::session::Session;
use crate::bridge::ProcessBridge;

/// Delay before retrying after a failed `accept`.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// WebSocket server for viewer sessions.
#[derive(Debug)]
pub struct Server {
    /// Address actually bound (resolves port 0).
    local_addr: SocketAddr,
    /// Cancels the accept loop and every session.
    shutdown: CancellationToken,
    /// Handle to the accept loop task.
    accept_handle: JoinHandle<()>,
}

impl Server {
    /// Bind `addr` and start accepting sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: &str, bridge: Arc<ProcessBridge>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read bound address")?;

        log::info!("[Server] Listening on ws://{local_addr}");

        let shutdown = CancellationToken::new();
        let accept_handle = tokio::spawn(Self::accept_loop(listener, bridge, shutdown.clone()));

        Ok(Self {
            local_addr,
            shutdown,
            accept_handle,
        })
    }

    /// Accept loop - runs as a tokio task.
    async fn accept_loop(
        listener: TcpListener,
        bridge: Arc<ProcessBridge>,
        shutdown: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let session_id = generate_session_id();
                    log::info!("[Server] Connection from {peer} as session {session_id}");
                    let session = Session::new(
                        session_id,
                        peer,
                        Arc::clone(&bridge),
                        shutdown.child_token(),
                    );
                    tokio::spawn(session.run(stream));
                }
                Err(e) => {
                    log::error!("[Server] Accept error: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
        log::info!("[Server] Accept loop stopped");
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Stop accepting and close every session.
    ///
    /// Closing a session cancels its queued and running submissions.
    pub fn shutdown(self) {
        self.shutdown.cancel();
        self.accept_handle.abort();
    }
}

/// Generate a unique session id.
fn generate_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
