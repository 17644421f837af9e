//! Control-plane inputs: the peer list

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::key::{DiscoPublic, NodePublic};
use crate::relay::RegionId;

/// Magic IP the control plane uses to express "relay region N" as `ip:N`
pub const RELAY_MAGIC_IP: Ipv4Addr = Ipv4Addr::new(127, 3, 3, 40);

/// One peer as described by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNode {
    /// Identity key
    pub key: NodePublic,
    /// Disco key; `None` for legacy peers that only speak via relay
    pub disco_key: Option<DiscoPublic>,
    /// Home relay, `"127.3.3.40:<region>"`
    pub relay: Option<String>,
    /// Advertised candidate endpoints, `"ip:port"`
    pub endpoints: Vec<String>,
}

impl PeerNode {
    /// Home relay region, if the relay string is well-formed
    pub fn relay_region(&self) -> Option<RegionId> {
        self.relay.as_deref().and_then(parse_relay_addr)
    }
}

/// Full peer list plus debug flags pushed by the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMap {
    pub peers: Vec<PeerNode>,
    /// Keep re-STUNing even when the data plane reports idle
    #[serde(default)]
    pub force_background_stun: bool,
}

/// Parse `"127.3.3.40:<region>"` into a region ID. Region 0 is invalid.
pub fn parse_relay_addr(s: &str) -> Option<RegionId> {
    let addr: SocketAddr = s.parse().ok()?;
    if addr.ip() != IpAddr::V4(RELAY_MAGIC_IP) || addr.port() == 0 {
        return None;
    }
    Some(addr.port())
}

/// Render a region ID the way the control plane writes it
pub fn relay_addr_string(region: RegionId) -> String {
    SocketAddr::new(IpAddr::V4(RELAY_MAGIC_IP), region).to_string()
}
