//! Error types surfaced by the connection

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors from constructing, binding or configuring a [`crate::Conn`]
#[derive(Debug, Error)]
pub enum Error {
    #[error("no tokio runtime available")]
    NoRuntime,

    #[error("failed to bind any {network} port (tried {ports:?}): {source}")]
    Bind {
        network: &'static str,
        ports: Vec<u16>,
        #[source]
        source: io::Error,
    },

    #[error("connection closed")]
    Closed,

    #[error("unknown peer {0}")]
    UnknownPeer(String),

    #[error("invalid key {0:?}")]
    InvalidKey(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors from sending data or disco messages
#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,

    #[error("network down")]
    NetworkDown,

    /// The node's private key is zero; nothing is sent until one is set.
    #[error("no private key")]
    NoPrivateKey,

    /// Neither a direct nor a relay address is known for the peer.
    #[error("no UDP or relay address for peer")]
    NoPath,

    /// A UDP write was attempted and failed; no relay write succeeded.
    #[error("UDP send to {addr} failed: {source}")]
    Udp {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// No transport had a chance to attempt delivery.
    #[error("packet not sent: {0}")]
    NotSent(&'static str),

    #[error("relay write queue full, packet dropped")]
    RelayQueueFull,

    #[error("peer has no disco key")]
    NoDiscoKey,
}

/// Errors from the receive pumps
#[derive(Debug, Error)]
pub enum RecvError {
    #[error("connection closed")]
    Closed,

    #[error("connection not listening")]
    NotListening,

    #[error(transparent)]
    Io(#[from] io::Error),
}
