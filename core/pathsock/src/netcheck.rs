//! Network condition probing and port mapping interfaces
//!
//! The STUN prober and the UPnP/NAT-PMP/PCP port mapper are external; the
//! connection consumes their results through these traits.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::relay::{RegionId, RelayMap};

/// Result of one network condition probe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    /// UDP works at all
    pub udp: bool,
    pub ipv4: bool,
    pub ipv6: bool,
    /// An IPv4 socket could send (false on some v6-only hosts)
    pub ipv4_can_send: bool,
    /// NAT maps differently per destination ("hard" NAT)
    pub mapping_varies_by_dest_ip: Option<bool>,
    pub hair_pinning: Option<bool>,
    pub upnp: Option<bool>,
    pub pmp: Option<bool>,
    pub pcp: Option<bool>,
    /// Region with the lowest latency, if any answered
    pub preferred_relay: Option<RegionId>,
    pub region_latency: BTreeMap<RegionId, Duration>,
    pub region_v4_latency: BTreeMap<RegionId, Duration>,
    pub region_v6_latency: BTreeMap<RegionId, Duration>,
    /// Public IPv4 address as seen by STUN
    pub global_v4: Option<SocketAddr>,
    pub global_v6: Option<SocketAddr>,
}

impl Report {
    pub fn any_port_mapping(&self) -> bool {
        self.upnp == Some(true) || self.pmp == Some(true) || self.pcp == Some(true)
    }
}

#[derive(Debug, Error)]
pub enum NetcheckError {
    #[error("netcheck timed out")]
    Timeout,

    #[error("netcheck failed: {0}")]
    Failed(String),
}

/// Runs STUN-based network condition probes
#[async_trait]
pub trait NetChecker: Send + Sync {
    async fn get_report(&self, relay_map: &RelayMap) -> Result<Report, NetcheckError>;
}

/// Creates and caches router port mappings
pub trait PortMapper: Send + Sync {
    /// Current external mapping, kicking off creation in the background if
    /// there is none yet. Never blocks.
    fn get_cached_mapping_or_start_creating(&self) -> Option<SocketAddr>;

    /// Whether a mapping currently exists
    fn have_mapping(&self) -> bool;

    /// Local port to map; changes after a rebind.
    fn set_local_port(&self, port: u16);

    fn note_network_down(&self);

    fn close(&self);
}

/// Prober used when none is configured: reports nothing reachable
#[derive(Debug, Default)]
pub struct NoopNetChecker;

#[async_trait]
impl NetChecker for NoopNetChecker {
    async fn get_report(&self, _relay_map: &RelayMap) -> Result<Report, NetcheckError> {
        Ok(Report::default())
    }
}

/// Port mapper used when none is configured
#[derive(Debug, Default)]
pub struct NoopPortMapper;

impl PortMapper for NoopPortMapper {
    fn get_cached_mapping_or_start_creating(&self) -> Option<SocketAddr> {
        None
    }

    fn have_mapping(&self) -> bool {
        false
    }

    fn set_local_port(&self, _port: u16) {}

    fn note_network_down(&self) {}

    fn close(&self) {}
}

/// Summary of network conditions handed to the control plane
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetInfo {
    pub mapping_varies_by_dest_ip: Option<bool>,
    pub hair_pinning: Option<bool>,
    pub working_ipv6: Option<bool>,
    pub working_udp: Option<bool>,
    pub have_port_map: bool,
    pub upnp: Option<bool>,
    pub pmp: Option<bool>,
    pub pcp: Option<bool>,
    /// Home relay region
    pub preferred_relay: Option<RegionId>,
    /// Latency in seconds keyed by `"<region>-v4"` / `"<region>-v6"`
    pub relay_latency: BTreeMap<String, f64>,
}

impl NetInfo {
    /// Build from a report; `preferred_relay` is filled in by the caller.
    pub fn from_report(report: &Report, have_port_map: bool) -> Self {
        let mut relay_latency = BTreeMap::new();
        for (region, d) in &report.region_v4_latency {
            relay_latency.insert(format!("{}-v4", region), d.as_secs_f64());
        }
        for (region, d) in &report.region_v6_latency {
            relay_latency.insert(format!("{}-v6", region), d.as_secs_f64());
        }
        Self {
            mapping_varies_by_dest_ip: report.mapping_varies_by_dest_ip,
            hair_pinning: report.hair_pinning,
            working_ipv6: Some(report.ipv6),
            working_udp: Some(report.udp),
            have_port_map,
            upnp: report.upnp,
            pmp: report.pmp,
            pcp: report.pcp,
            preferred_relay: None,
            relay_latency,
        }
    }
}
