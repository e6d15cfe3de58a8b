//! Error types for the proxy crate.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Fatal errors: startup and configuration.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Failures of the downstream backend. Never fatal to the proxy.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend {addr} unreachable: {source}")]
    Unreachable {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("backend link closed")]
    Closed,

    #[error("backend io error: {0}")]
    Io(#[from] io::Error),
}
