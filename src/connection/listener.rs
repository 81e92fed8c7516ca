//! Listener and accept loop

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::target::resolve;
use crate::config::ListenConfig;
use crate::error::ForwardError;
use crate::relay::RelayEngine;

/// Accepts client connections and hands each one to the relay engine
pub struct Listener {
    listener: TcpListener,
    engine: Arc<RelayEngine>,
}

impl Listener {
    /// Bind with address reuse and the configured backlog
    pub async fn bind(
        listen: &ListenConfig,
        engine: Arc<RelayEngine>,
    ) -> Result<Self, ForwardError> {
        let addr = resolve(&listen.host, listen.port)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ForwardError::NoAddresses {
                target: format!("{}:{}", listen.host, listen.port),
            })?;

        info!("Binding TCP listener to {}", addr);
        let listener = open_listener(addr, listen.backlog)
            .map_err(|source| ForwardError::Bind { addr, source })?;

        info!("Listening on {}", listener.local_addr().unwrap_or(addr));
        info!("Forwarding traffic to {}", engine.target());
        Ok(Self { listener, engine })
    }

    /// The address actually bound
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until a shutdown signal arrives, then release the socket.
    ///
    /// Sessions already running are not touched.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Starting connection acceptance loop");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            let engine = Arc::clone(&self.engine);
                            tokio::spawn(async move {
                                // Failures are logged by the engine and scoped to this client
                                let _ = engine.start_session(stream, addr).await;
                            });
                        }
                        Err(e) => {
                            // Continue accepting connections even if one fails
                            error!("{}", ForwardError::Accept(e));
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
            }
        }

        info!(
            "Connection acceptance loop stopped, {} sessions left running",
            self.engine.active_session_count()
        );
    }
}

fn open_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}
