//! Relay servers: map, client interface and reconnect backoff
//!
//! Relays forward packets between peers that cannot (yet) reach each other
//! directly. Each region is served by one or more relay nodes; the
//! connection keeps at most one client per region.
//!
//! ```text
//!                ┌──────────── region 1 (home) ────────────┐
//!  Conn ─ write ─►  writer task ──► RelayClient::send       │
//!       ◄─ recv ──  reader task ◄── RelayClient::recv       │
//!                └─────────────────────────────────────────┘
//!                ┌──────────── region 7 (idle 60s → closed)┐
//!                │  ...                                    │
//!                └─────────────────────────────────────────┘
//! ```
//!
//! The wire protocol to relay servers is supplied by a [`RelayDialer`]
//! implementation; this crate only drives the clients.

pub mod backoff;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::{NodePrivate, NodePublic};

pub use backoff::RelayBackoff;

/// Relay region identifier (non-zero)
pub type RegionId = u16;

// ============================================================================
// Relay Map
// ============================================================================

/// All relay regions known to the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMap {
    pub regions: BTreeMap<RegionId, RelayRegion>,
}

impl RelayMap {
    pub fn region(&self, id: RegionId) -> Option<&RelayRegion> {
        self.regions.get(&id)
    }

    pub fn region_ids(&self) -> Vec<RegionId> {
        self.regions.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// A geographic relay region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRegion {
    pub region_id: RegionId,
    /// Short code, e.g. "fra"
    pub region_code: String,
    #[serde(default)]
    pub region_name: String,
    pub nodes: Vec<RelayNode>,
}

/// One relay server within a region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayNode {
    pub name: String,
    pub host_name: String,
    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub ipv6: Option<String>,
    #[serde(default)]
    pub port: u16,
}

// ============================================================================
// Client Interface
// ============================================================================

/// Frames a relay client can deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// Server greeting after (re)connect
    ServerInfo,
    /// Packet forwarded from another peer
    Packet { source: NodePublic, data: Vec<u8> },
    /// Keepalive the server expects echoed
    Ping([u8; 8]),
    KeepAlive,
    /// Server-side health advisory; `None` clears it
    Health { problem: Option<String> },
    /// Peer disconnected from this relay
    PeerGone(NodePublic),
    /// Peer is connected to this relay
    PeerPresent(NodePublic),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay client closed")]
    Closed,

    #[error("relay connect failed: {0}")]
    Connect(String),

    #[error("relay transport error: {0}")]
    Transport(String),
}

/// Connection to one relay region
///
/// Clients connect lazily and reconnect on the next `recv`/`send` after a
/// failure; `close` is final.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Wait for the next frame.
    async fn recv(&self) -> Result<RelayMessage, RelayError>;

    /// Forward `pkt` to `dst` through the relay.
    async fn send(&self, dst: NodePublic, pkt: Vec<u8>) -> Result<(), RelayError>;

    /// Answer a server `Ping`.
    async fn send_pong(&self, data: [u8; 8]) -> Result<(), RelayError>;

    /// Round trip to the server.
    async fn ping(&self) -> Result<(), RelayError>;

    /// Tell the server whether this is our home region.
    fn note_preferred(&self, preferred: bool);

    async fn close(&self);
}

/// Creates relay clients
pub trait RelayDialer: Send + Sync {
    /// Create a (not yet connected) client for `region`. Must not block.
    fn new_client(
        &self,
        private_key: &NodePrivate,
        region: &RelayRegion,
    ) -> Result<Arc<dyn RelayClient>, RelayError>;
}

/// Dialer used when none is configured; every region fails to connect
#[derive(Debug, Default)]
pub struct NoRelayDialer;

impl RelayDialer for NoRelayDialer {
    fn new_client(
        &self,
        _private_key: &NodePrivate,
        region: &RelayRegion,
    ) -> Result<Arc<dyn RelayClient>, RelayError> {
        Err(RelayError::Connect(format!(
            "no relay dialer configured for region {}",
            region.region_id
        )))
    }
}
