//! Proxy network layer: the UDP socket and the event loop around the registry.

use crate::backend::BackendConnector;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::registry::SessionRegistry;
use log::{debug, error, info};
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};

/// Largest datagram the proxy reads.
const RECV_BUFFER_SIZE: usize = 2048;

/// Client-facing UDP server.
///
/// All session state lives in a single [`SessionRegistry`] owned by the
/// event loop, so datagram handling and ticks never run concurrently.
pub struct ProxyServer {
    socket: UdpSocket,
    registry: SessionRegistry,
    config: ProxyConfig,
}

impl ProxyServer {
    /// Binds the client-facing socket.
    pub async fn bind(
        config: ProxyConfig,
        connector: Arc<dyn BackendConnector>,
    ) -> Result<Self, ProxyError> {
        let addr = config.bind_address;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        let registry = SessionRegistry::new(config.clone(), connector);

        info!(
            "Proxy listening on {} (server id {})",
            socket.local_addr()?,
            registry.server_id()
        );

        Ok(Self {
            socket,
            registry,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Runs until the process is killed.
    pub async fn run(&mut self) -> Result<(), ProxyError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Runs until `shutdown` resolves, then notifies every client.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
        let mut tick_interval = interval(self.config.tick_interval());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, sender)) => {
                            self.registry.dispatch(&buffer[..len], sender, Instant::now());
                        }
                        // Windows reports ICMP port unreachable on the next read.
                        Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                            debug!("Ignoring connection reset: {}", e);
                        }
                        Err(e) => error!("Error receiving datagram: {}", e),
                    }
                }

                _ = tick_interval.tick() => {
                    self.registry.tick(Instant::now());
                }

                _ = &mut shutdown => {
                    info!("Proxy shutting down");
                    break;
                }
            }

            self.flush().await;
        }

        self.registry.shutdown(Instant::now());
        self.flush().await;
        Ok(())
    }

    /// Sends every datagram the registry has queued.
    async fn flush(&mut self) {
        for (target, datagram) in self.registry.drain_outgoing() {
            if let Err(e) = self.socket.send_to(&datagram, target).await {
                error!("Failed to send datagram to {}: {}", target, e);
            }
        }
    }
}
