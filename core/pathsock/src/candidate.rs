//! Self-endpoint candidates
//!
//! The addresses this node advertises to peers (via the control plane and
//! in CallMeMaybe messages), tagged by how they were learned.
//!
//! # Priority
//!
//! ```text
//! PortMapped > Stun (v4, v6) > Stun4LocalPort > Local
//! ```
//!
//! Order is a hint for peers; consumers compare sets, not lists.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// ============================================================================
// Candidate Types
// ============================================================================

/// How a self endpoint was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    /// Local network interface address
    Local,
    /// Public address observed by STUN
    Stun,
    /// Public IP from STUN paired with the local port, for NATs that map
    /// per destination but usually keep the port
    Stun4LocalPort,
    /// Mapping created through UPnP / NAT-PMP / PCP
    PortMapped,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateType::Local => write!(f, "local"),
            CandidateType::Stun => write!(f, "stun"),
            CandidateType::Stun4LocalPort => write!(f, "stun4localport"),
            CandidateType::PortMapped => write!(f, "portmap"),
        }
    }
}

/// An address this node believes peers may reach it on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub addr: SocketAddr,
    pub candidate_type: CandidateType,
}

impl Candidate {
    pub fn new(addr: SocketAddr, candidate_type: CandidateType) -> Self {
        Self { addr, candidate_type }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.addr, self.candidate_type)
    }
}

// ============================================================================
// Candidate List
// ============================================================================

/// Accumulates candidates in priority order, dropping duplicate addresses
#[derive(Debug, Default)]
pub struct CandidateList {
    seen: HashSet<SocketAddr>,
    list: Vec<Candidate>,
}

impl CandidateList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, addr: SocketAddr, candidate_type: CandidateType) {
        if self.seen.insert(addr) {
            self.list.push(Candidate::new(addr, candidate_type));
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn into_vec(self) -> Vec<Candidate> {
        self.list
    }
}

/// Order-insensitive equality of two candidate sets
pub fn candidate_sets_equal(a: &[Candidate], b: &[Candidate]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    if a == b {
        return true;
    }
    let sa: HashSet<&Candidate> = a.iter().collect();
    let sb: HashSet<&Candidate> = b.iter().collect();
    sa == sb
}

/// Whether `ip` is an IPv6 link-local unicast address (fe80::/10)
pub fn is_v6_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(_) => false,
        IpAddr::V6(addr) => (addr.segments()[0] & 0xffc0) == 0xfe80,
    }
}

// ============================================================================
// Platform-specific Interface Enumeration
// ============================================================================

/// Local interface addresses split into (regular, loopback)
///
/// Link-local IPv6 addresses are skipped; they need a zone to be useful.
#[cfg(unix)]
pub fn local_addresses() -> (Vec<IpAddr>, Vec<IpAddr>) {
    let mut regular = Vec::new();
    let mut loopback = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return (regular, loopback);
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;

            if !ifa.ifa_addr.is_null() && (ifa.ifa_flags & libc::IFF_UP as libc::c_uint) != 0 {
                let family = (*ifa.ifa_addr).sa_family as i32;
                let ip = if family == libc::AF_INET {
                    let sin = ifa.ifa_addr as *const libc::sockaddr_in;
                    let b = (*sin).sin_addr.s_addr.to_ne_bytes();
                    Some(IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])))
                } else if family == libc::AF_INET6 {
                    let sin6 = ifa.ifa_addr as *const libc::sockaddr_in6;
                    Some(IpAddr::V6(Ipv6Addr::from((*sin6).sin6_addr.s6_addr)))
                } else {
                    None
                };

                if let Some(ip) = ip {
                    if ip.is_loopback() {
                        loopback.push(ip);
                    } else if !is_v6_link_local(&ip) {
                        regular.push(ip);
                    }
                }
            }

            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    (regular, loopback)
}

#[cfg(not(unix))]
pub fn local_addresses() -> (Vec<IpAddr>, Vec<IpAddr>) {
    (Vec::new(), vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
}

// ============================================================================
// Tests
// ============================================================================
