//! # Bedrock Proxy Library
//!
//! This library implements the client-facing front door of a RakNet game
//! proxy. It answers discovery pings, walks each client through the RakNet
//! connection handshake, and once a client is connected relays its game
//! payloads to a downstream backend.
//!
//! ## Core Responsibilities
//!
//! ### Discovery
//! Unconnected pings are answered with a status line built from the
//! configured MOTD and the live session count. Discovery never creates
//! sessions.
//!
//! ### Session Lifecycle
//! A session is created by `OpenConnectionRequest1` and advances through
//! MTU negotiation, address confirmation and the encapsulated connection
//! request until the client reports `NewIncomingConnection`. Sessions end on
//! a disconnection notification, on idle timeout, or at shutdown.
//!
//! ### Backend Relay
//! Connected sessions own a [`backend::BackendBridge`]. Game payloads from
//! the client are forwarded to it, and payloads it produces are framed and
//! sent back to the client.
//!
//! ## Architecture Design
//!
//! ### Single-Owner Event Loop
//! [`network::ProxyServer`] owns the UDP socket and the
//! [`registry::SessionRegistry`]. One `tokio::select!` loop handles inbound
//! datagrams and the periodic tick, so session state is never shared
//! between tasks and needs no locking.
//!
//! ### Sans-IO Sessions
//! Sessions and the registry never touch the socket. They queue outgoing
//! datagrams that the event loop drains after every event, which keeps the
//! handshake logic testable without a network.
//!
//! ## Module Organization
//!
//! - `address`: canonical peer identity used as the registry key
//! - `backend`: the backend traits plus UDP relay and in-process channel connectors
//! - `config`: serde-backed runtime configuration
//! - `error`: proxy and backend error types
//! - `network`: the socket event loop
//! - `registry`: session table, discovery and capacity enforcement
//! - `reliability`: frame-set sequencing, ACK/NACK, ordering and split reassembly
//! - `session`: the per-client handshake state machine
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use proxy::backend::UdpRelayConnector;
//! use proxy::config::ProxyConfig;
//! use proxy::network::ProxyServer;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::default();
//!     let connector = Arc::new(UdpRelayConnector::new(config.backend_address));
//!
//!     let mut server = ProxyServer::bind(config, connector).await?;
//!     server
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod backend;
pub mod config;
pub mod error;
pub mod network;
pub mod registry;
pub mod reliability;
pub mod session;

pub use address::AddressKey;
pub use config::ProxyConfig;
pub use error::{BackendError, ProxyError};
pub use network::ProxyServer;
pub use registry::SessionRegistry;
pub use session::{ClientSession, HandshakeStage};
