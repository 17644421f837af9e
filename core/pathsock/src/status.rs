//! Diagnostics snapshot of a connection

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::candidate::Candidate;
use crate::key::NodePublic;
use crate::relay::RegionId;

/// Point-in-time view of a [`crate::Conn`]
#[derive(Debug, Clone, Default)]
pub struct Status {
    /// `None` while no private key is set
    pub self_key: Option<NodePublic>,
    /// Endpoints last reported to the control plane
    pub self_endpoints: Vec<Candidate>,
    pub home_relay: Option<RegionId>,
    /// Sorted by key
    pub peers: Vec<PeerStatus>,
    /// Sorted by region
    pub relays: Vec<RelayStatus>,
}

impl Status {
    pub fn peer(&self, key: &NodePublic) -> Option<&PeerStatus> {
        self.peers.iter().find(|p| p.key == *key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub key: NodePublic,
    /// Region code of the peer's home relay, or its number when unknown
    pub relay: Option<String>,
    /// Trusted direct address, when that is the only path in use
    pub cur_addr: Option<SocketAddr>,
    pub last_write: Option<Duration>,
    pub last_recv: Option<Duration>,
    /// Outbound traffic within the session timeout
    pub active: bool,
    /// Heartbeat timer armed
    pub heartbeat: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    pub region: RegionId,
    pub home: bool,
    /// Time since the connection was created
    pub age: Duration,
    /// Time since the last write was queued
    pub idle: Duration,
    /// Server greeting received on the current connection
    pub connected: bool,
    /// Server-reported health problem
    pub health: Option<String>,
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "relay-{}=cr{}s,wr{}s",
            self.region,
            self.age.as_secs(),
            self.idle.as_secs()
        )?;
        if self.home {
            f.write_str(",home")?;
        }
        Ok(())
    }
}
