//! Per-peer path state machine
//!
//! One [`Endpoint`] exists per peer in the network map. It tracks every
//! candidate address for the peer, the pings in flight, and the single
//! best direct address along with how long that address is trusted.
//!
//! # Path States
//!
//! ```text
//!            send / heartbeat                 pong
//!   cold ───────────────────────► probing ─────────────► direct-trusted
//! (relay)        full ping          (relay)                (UDP only)
//!    ▲                                ▲                         │
//!    │ stop_and_reset                 │ trust expired /         │
//!    │ disco key change               │ connectivity change     ▼
//!    └────────────────────────────────┴──────────────────── direct-stale
//!                                                          (UDP + relay)
//! ```
//!
//! # Locking
//!
//! The endpoint lock may be taken while the connection lock is held, never
//! the other way around. Methods that need to send collect the sends in an
//! [`Outbox`] and flush it after releasing the endpoint lock.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::candidate::is_v6_link_local;
use crate::disco::{self, CallMeMaybe, Message, Ping, Pong, TxId};
use crate::error::SendError;
use crate::key::{DiscoPublic, NodePublic};
use crate::netmap::PeerNode;
use crate::relay::RegionId;
use crate::timer::{Spawner, Timer};

// ============================================================================
// Constants
// ============================================================================

/// How long after the last outbound packet a session counts as active
pub const SESSION_ACTIVE_TIMEOUT: Duration = Duration::from_secs(45);

/// How often to look for a better path while one already works
pub const UPGRADE_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between pings to the best address
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// How long a pong makes a UDP address the exclusive path
pub const TRUST_UDP_ADDR_DURATION: Duration = Duration::from_millis(6500);

/// Latency at or under which no upgrade is attempted
pub const GOOD_ENOUGH_LATENCY: Duration = Duration::from_millis(5);

/// How long to wait for a pong
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum time between pings to one candidate
pub const DISCO_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Pong replies kept per candidate
pub const PONG_HISTORY_COUNT: usize = 64;

/// Candidate count above which stale candidates are pruned
pub const MAX_CANDIDATES: usize = 100;

/// Minimum time between receive-activity callbacks per peer
pub const NOTE_RECV_ACTIVITY_INTERVAL: Duration = Duration::from_secs(10);

/// IPv6 wins over IPv4 while `lat6 / DEN * NUM < lat4`
pub const IPV6_PREFERENCE_NUM: u32 = 9;
pub const IPV6_PREFERENCE_DEN: u32 = 10;

// ============================================================================
// Addresses
// ============================================================================

/// Where a packet to a peer goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendAddr {
    /// Direct UDP
    Udp(SocketAddr),
    /// Via the relay server of this region
    Relay(RegionId),
}

impl SendAddr {
    pub fn is_relay(&self) -> bool {
        matches!(self, SendAddr::Relay(_))
    }
}

impl fmt::Display for SendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendAddr::Udp(addr) => write!(f, "{}", addr),
            SendAddr::Relay(region) => write!(f, "relay-{}", region),
        }
    }
}

/// A direct address with its last measured round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrLatency {
    pub addr: SocketAddr,
    pub latency: Duration,
}

/// Whether `a` is a better direct address than the incumbent `b`.
pub fn better_addr(a: &AddrLatency, b: Option<&AddrLatency>) -> bool {
    let Some(b) = b else {
        return true;
    };
    if a.addr == b.addr {
        return false;
    }
    if a.addr.is_ipv6() && b.addr.is_ipv4() {
        // Prefer IPv6 as long as latencies are roughly equivalent.
        if a.latency / IPV6_PREFERENCE_DEN * IPV6_PREFERENCE_NUM < b.latency {
            return true;
        }
    } else if a.addr.is_ipv4() && b.addr.is_ipv6() && better_addr(b, Some(a)) {
        return false;
    }
    a.latency < b.latency
}

// ============================================================================
// Connection callbacks
// ============================================================================

/// What an endpoint needs from its connection
///
/// Implementations take the connection lock, so these must never be called
/// with an endpoint lock held.
pub(crate) trait PathHost: Send + Sync {
    /// This node's identity key, sent in pings
    fn self_node_key(&self) -> Option<NodePublic>;

    /// Whether probing and heartbeats are allowed. Must not block.
    fn have_private_key(&self) -> bool;

    /// Seal and send a disco message. `Ok(true)` once handed to a transport.
    fn send_disco_message(
        &self,
        dst: SendAddr,
        dst_key: NodePublic,
        dst_disco: DiscoPublic,
        msg: Message,
        verbose: bool,
    ) -> Result<bool, SendError>;

    /// Send a data packet. `Ok(true)` once handed to a transport.
    fn send_addr(&self, dst: SendAddr, peer: NodePublic, pkt: &[u8]) -> Result<bool, SendError>;

    /// Send (possibly after refreshing our endpoints) a CallMeMaybe via relay.
    fn enqueue_call_me_maybe(&self, region: RegionId, peer: NodePublic, disco: DiscoPublic);

    fn note_recv_activity(&self, peer: NodePublic);
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PingPurpose {
    /// Is this path valid?
    Discovery,
    /// Is the peer still there on the best path?
    Heartbeat,
    /// Caller-requested ping, may go via relay
    Cli,
}

struct SentPing {
    to: SendAddr,
    at: Instant,
    timer: Timer,
    purpose: PingPurpose,
}

#[derive(Debug, Clone, Copy)]
struct PongReply {
    latency: Duration,
    /// What the peer reported it heard our ping from
    pong_src: SocketAddr,
}

#[derive(Default)]
struct CandidateState {
    last_ping: Option<Instant>,
    /// Set for candidates learned from an inbound ping rather than the
    /// network map; refreshed on every such ping.
    last_got_ping: Option<Instant>,
    call_me_maybe_time: Option<Instant>,
    recent_pongs: Vec<PongReply>,
    recent_pong: usize,
    /// Position in the network map's endpoint list; `None` once gone from it
    index: Option<usize>,
}

impl CandidateState {
    fn should_delete(&self, now: Instant) -> bool {
        if self.call_me_maybe_time.is_some() {
            return false;
        }
        match self.last_got_ping {
            None => self.index.is_none(),
            Some(t) => now.saturating_duration_since(t) > SESSION_ACTIVE_TIMEOUT,
        }
    }

    fn add_pong_reply(&mut self, reply: PongReply) {
        if self.recent_pongs.len() < PONG_HISTORY_COUNT {
            self.recent_pong = self.recent_pongs.len();
            self.recent_pongs.push(reply);
            return;
        }
        let i = (self.recent_pong + 1) % PONG_HISTORY_COUNT;
        self.recent_pongs[i] = reply;
        self.recent_pong = i;
    }

    fn latest_pong(&self) -> Option<&PongReply> {
        self.recent_pongs.get(self.recent_pong)
    }
}

struct PendingCliPing {
    tx: oneshot::Sender<PingResult>,
}

/// Result of a caller-requested disco ping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingResult {
    pub node: NodePublic,
    pub latency: Option<Duration>,
    /// Set when the pong came over a direct path
    pub endpoint: Option<SocketAddr>,
    /// Set when the pong came via relay
    pub relay_region: Option<RegionId>,
    pub err: Option<String>,
}

struct PathState {
    disco_key: Option<DiscoPublic>,
    disco_short: String,
    heartbeat: Option<Timer>,
    heartbeat_gen: u64,
    last_send: Option<Instant>,
    last_full_ping: Option<Instant>,
    relay_addr: Option<RegionId>,
    best_addr: Option<AddrLatency>,
    best_addr_at: Option<Instant>,
    trust_best_addr_until: Option<Instant>,
    sent_ping: HashMap<TxId, SentPing>,
    candidates: HashMap<SocketAddr, CandidateState>,
    is_call_me_maybe: HashMap<SocketAddr, bool>,
    pending_cli_pings: Vec<PendingCliPing>,
}

impl PathState {
    fn new(disco_key: Option<DiscoPublic>) -> Self {
        Self {
            disco_key,
            disco_short: disco_short(disco_key),
            heartbeat: None,
            heartbeat_gen: 0,
            last_send: None,
            last_full_ping: None,
            relay_addr: None,
            best_addr: None,
            best_addr_at: None,
            trust_best_addr_until: None,
            sent_ping: HashMap::new(),
            candidates: HashMap::new(),
            is_call_me_maybe: HashMap::new(),
            pending_cli_pings: Vec::new(),
        }
    }

    fn can_p2p(&self) -> bool {
        self.disco_key.is_some()
    }

    fn trust_expired(&self, now: Instant) -> bool {
        self.trust_best_addr_until.map_or(true, |until| now > until)
    }

    /// Direct address and/or relay region to use for the next packet.
    fn addr_for_send(&self, now: Instant) -> (Option<SocketAddr>, Option<RegionId>) {
        let udp = self.best_addr.map(|b| b.addr);
        let relay = if udp.is_none() || self.trust_expired(now) {
            self.relay_addr
        } else {
            None
        };
        (udp, relay)
    }

    fn want_full_ping(&self, now: Instant) -> bool {
        if !self.can_p2p() {
            return false;
        }
        let (Some(best), Some(last_full)) = (self.best_addr, self.last_full_ping) else {
            return true;
        };
        if self.trust_expired(now) {
            return true;
        }
        if best.latency <= GOOD_ENOUGH_LATENCY {
            return false;
        }
        now.saturating_duration_since(last_full) >= UPGRADE_INTERVAL
    }

    fn delete_candidate(&mut self, addr: &SocketAddr) {
        self.candidates.remove(addr);
        if self.best_addr.map(|b| b.addr) == Some(*addr) {
            self.best_addr = None;
        }
    }

    fn prune_candidates(&mut self, now: Instant) {
        let stale: Vec<SocketAddr> = self
            .candidates
            .iter()
            .filter(|(_, c)| c.should_delete(now))
            .map(|(a, _)| *a)
            .collect();
        for addr in stale {
            self.delete_candidate(&addr);
        }
    }

    /// Revert to relay-only. Leaves the heartbeat timer alone.
    fn reset(&mut self) {
        self.last_send = None;
        self.last_full_ping = None;
        self.best_addr = None;
        self.best_addr_at = None;
        self.trust_best_addr_until = None;
        for c in self.candidates.values_mut() {
            c.last_ping = None;
        }
        // Dropping each SentPing cancels its timeout.
        self.sent_ping.clear();
    }
}

fn disco_short(disco_key: Option<DiscoPublic>) -> String {
    disco_key.map(|k| k.short_string()).unwrap_or_default()
}

/// Disco pings waiting to be sent once the endpoint lock is released
struct PendingPing {
    to: SendAddr,
    tx_id: TxId,
    disco: DiscoPublic,
    verbose: bool,
}

#[derive(Default)]
pub(crate) struct Outbox {
    pings: Vec<PendingPing>,
    call_me_maybe: Option<(RegionId, DiscoPublic)>,
}

/// Returned by [`Endpoint::handle_pong`] when the pong matched our ping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PongOutcome {
    /// Direct source of the pong, when it did not come via relay
    pub confirmed_addr: Option<SocketAddr>,
}

/// Per-peer status snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub relay_region: Option<RegionId>,
    /// Time since the last outbound packet
    pub last_write: Option<Duration>,
    pub last_recv: Option<Duration>,
    pub active: bool,
    /// Set when a trusted direct address is the only path in use
    pub cur_addr: Option<SocketAddr>,
    pub candidates: usize,
    pub heartbeat: bool,
}

// ============================================================================
// Endpoint
// ============================================================================

/// The path state machine for one peer
pub struct Endpoint {
    id: u64,
    public_key: NodePublic,
    host: Weak<dyn PathHost>,
    spawner: Spawner,
    self_ref: Weak<Endpoint>,
    debug_disco: bool,
    created: Instant,
    /// Milliseconds since `created` plus one; zero means never
    last_recv: AtomicU64,
    num_stop_and_reset: AtomicU64,
    state: Mutex<PathState>,
}

impl Endpoint {
    pub(crate) fn new(
        id: u64,
        host: Weak<dyn PathHost>,
        spawner: Spawner,
        node: &PeerNode,
        debug_disco: bool,
    ) -> Arc<Self> {
        let ep = Arc::new_cyclic(|self_ref| Endpoint {
            id,
            public_key: node.key,
            host,
            spawner,
            self_ref: self_ref.clone(),
            debug_disco,
            created: Instant::now(),
            last_recv: AtomicU64::new(0),
            num_stop_and_reset: AtomicU64::new(0),
            state: Mutex::new(PathState::new(node.disco_key)),
        });
        ep.update_from_node(node);
        ep
    }

    /// Opaque per-object token
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn public_key(&self) -> NodePublic {
        self.public_key
    }

    pub fn disco_key(&self) -> Option<DiscoPublic> {
        self.state.lock().disco_key
    }

    /// Whether the peer speaks disco
    pub fn can_p2p(&self) -> bool {
        self.state.lock().can_p2p()
    }

    /// Generation counter bumped by every `stop_and_reset`
    pub fn num_stop_and_reset(&self) -> u64 {
        self.num_stop_and_reset.load(Ordering::SeqCst)
    }

    pub fn best_addr(&self) -> Option<AddrLatency> {
        self.state.lock().best_addr
    }

    pub fn relay_region(&self) -> Option<RegionId> {
        self.state.lock().relay_addr
    }

    pub fn heartbeat_active(&self) -> bool {
        self.status().heartbeat
    }

    pub(crate) fn outstanding_pings(&self) -> usize {
        self.state.lock().sent_ping.len()
    }

    /// Reconcile with the peer's latest network-map entry.
    pub fn update_from_node(&self, node: &PeerNode) {
        let now = Instant::now();
        let mut st = self.state.lock();

        if st.disco_key != node.disco_key {
            log::info!(
                "disco: node {} changed disco key from {:?} to {:?}",
                self.public_key.short_string(),
                st.disco_key,
                node.disco_key
            );
            st.disco_key = node.disco_key;
            st.disco_short = disco_short(node.disco_key);
            st.reset();
        }

        st.relay_addr = node.relay_region();

        for c in st.candidates.values_mut() {
            c.index = None;
        }
        for (i, ep_str) in node.endpoints.iter().enumerate() {
            let addr: SocketAddr = match ep_str.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    log::warn!("bogus netmap endpoint {:?}", ep_str);
                    continue;
                }
            };
            st.candidates.entry(addr).or_default().index = Some(i);
        }

        st.prune_candidates(now);
    }

    /// Note an address a valid disco ping from this peer arrived from.
    pub fn add_candidate_endpoint(&self, addr: SocketAddr) {
        let now = Instant::now();
        let mut st = self.state.lock();

        if let Some(c) = st.candidates.get_mut(&addr) {
            // Network-map candidates keep their provenance.
            if c.last_got_ping.is_some() {
                c.last_got_ping = Some(now);
            }
            return;
        }

        log::debug!(
            "disco: adding {} as candidate endpoint for {} ({})",
            addr,
            st.disco_short,
            self.public_key.short_string()
        );
        st.candidates.insert(
            addr,
            CandidateState {
                last_got_ping: Some(now),
                ..Default::default()
            },
        );

        let size = st.candidates.len();
        if size > MAX_CANDIDATES {
            st.prune_candidates(now);
            log::debug!(
                "disco: pruned candidate set for {} from {} to {} entries",
                self.public_key.short_string(),
                size,
                st.candidates.len()
            );
        }
    }

    /// Distrust the best address until it is re-confirmed; keep it as a hint.
    pub fn note_connectivity_change(&self) {
        self.state.lock().trust_best_addr_until = None;
    }

    /// Record an inbound packet; tells the connection at most every 10s.
    pub fn note_recv_activity(&self) {
        let now = self.millis_since_created() + 1;
        let last = self.last_recv.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) <= NOTE_RECV_ACTIVITY_INTERVAL.as_millis() as u64 {
            return;
        }
        self.last_recv.store(now, Ordering::Relaxed);
        if let Some(host) = self.host.upgrade() {
            host.note_recv_activity(self.public_key);
        }
    }

    /// Time since the last recorded inbound packet
    pub fn last_recv_activity(&self) -> Option<Duration> {
        let last = self.last_recv.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        let now = self.millis_since_created() + 1;
        Some(Duration::from_millis(now.saturating_sub(last)))
    }

    fn millis_since_created(&self) -> u64 {
        Instant::now().saturating_duration_since(self.created).as_millis() as u64
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send a data packet on the current best path, probing if needed.
    pub fn send(&self, pkt: &[u8]) -> Result<(), SendError> {
        let now = Instant::now();
        let mut outbox = Outbox::default();
        let probing = self.host_has_key();

        let (udp, relay) = {
            let mut st = self.state.lock();
            let (udp, relay) = st.addr_for_send(now);
            if probing && st.can_p2p() && (udp.is_none() || st.trust_expired(now)) {
                self.send_pings_locked(&mut st, now, true, &mut outbox);
            }
            self.note_active_locked(&mut st, now, probing);
            (udp, relay)
        };
        self.flush(outbox);

        if udp.is_none() && relay.is_none() {
            return Err(SendError::NoPath);
        }
        let host = self.host.upgrade().ok_or(SendError::Closed)?;

        let udp_res = udp.map(|addr| host.send_addr(SendAddr::Udp(addr), self.public_key, pkt));
        let relay_res = relay.map(|r| host.send_addr(SendAddr::Relay(r), self.public_key, pkt));

        match (udp_res, relay_res) {
            (Some(Ok(true)), _) | (_, Some(Ok(true))) => Ok(()),
            (Some(Err(e)), _) => Err(e),
            (_, Some(Err(e))) => Err(e),
            _ => Err(SendError::NotSent("no transport could attempt delivery")),
        }
    }

    fn note_active_locked(&self, st: &mut PathState, now: Instant, probing: bool) {
        st.last_send = Some(now);
        if probing && st.heartbeat.is_none() && st.can_p2p() {
            self.schedule_heartbeat(st);
        }
    }

    fn host_has_key(&self) -> bool {
        self.host.upgrade().map_or(false, |h| h.have_private_key())
    }

    fn schedule_heartbeat(&self, st: &mut PathState) {
        st.heartbeat_gen += 1;
        let gen = st.heartbeat_gen;
        let weak = self.self_ref.clone();
        st.heartbeat = Some(Timer::after(&self.spawner, HEARTBEAT_INTERVAL, move || {
            if let Some(ep) = weak.upgrade() {
                ep.heartbeat(gen);
            }
        }));
    }

    /// Keep the best path alive, or look for a better one.
    fn heartbeat(&self, gen: u64) {
        let now = Instant::now();
        let mut outbox = Outbox::default();
        let probing = self.host_has_key();
        {
            let mut st = self.state.lock();
            if st.heartbeat_gen != gen || st.heartbeat.is_none() {
                return;
            }
            st.heartbeat = None;

            if !probing || !st.can_p2p() {
                return;
            }
            let Some(last_send) = st.last_send else {
                return;
            };
            if now.saturating_duration_since(last_send) > SESSION_ACTIVE_TIMEOUT {
                log::debug!(
                    "disco: ending heartbeats for idle session to {} ({})",
                    self.public_key.short_string(),
                    st.disco_short
                );
                return;
            }

            let (udp, _) = st.addr_for_send(now);
            if let Some(addr) = udp {
                self.start_ping_locked(&mut st, SendAddr::Udp(addr), now, PingPurpose::Heartbeat, &mut outbox);
            }
            if st.want_full_ping(now) {
                self.send_pings_locked(&mut st, now, true, &mut outbox);
            }

            self.schedule_heartbeat(&mut st);
        }
        self.flush(outbox);
    }

    fn start_ping_locked(
        &self,
        st: &mut PathState,
        to: SendAddr,
        now: Instant,
        purpose: PingPurpose,
        outbox: &mut Outbox,
    ) {
        let Some(disco) = st.disco_key else {
            log::warn!("disco: tried to ping {} which can't disco", self.public_key.short_string());
            return;
        };
        if purpose != PingPurpose::Cli {
            let SendAddr::Udp(addr) = to else {
                return;
            };
            match st.candidates.get_mut(&addr) {
                Some(c) => c.last_ping = Some(now),
                None => {
                    log::warn!("disco: attempt to ping no longer live endpoint {}", addr);
                    return;
                }
            }
        }

        let tx_id = disco::new_tx_id();
        let weak = self.self_ref.clone();
        let timer = Timer::after(&self.spawner, PING_TIMEOUT, move || {
            if let Some(ep) = weak.upgrade() {
                ep.ping_timeout(tx_id);
            }
        });
        st.sent_ping.insert(
            tx_id,
            SentPing {
                to,
                at: now,
                timer,
                purpose,
            },
        );
        outbox.pings.push(PendingPing {
            to,
            tx_id,
            disco,
            verbose: purpose == PingPurpose::Heartbeat,
        });
    }

    fn send_pings_locked(&self, st: &mut PathState, now: Instant, send_call_me_maybe: bool, outbox: &mut Outbox) {
        st.last_full_ping = Some(now);

        let addrs: Vec<SocketAddr> = st.candidates.keys().copied().collect();
        let mut sent_any = false;
        for addr in addrs {
            let (stale, last_ping) = match st.candidates.get(&addr) {
                Some(c) => (c.should_delete(now), c.last_ping),
                None => continue,
            };
            if stale {
                st.delete_candidate(&addr);
                continue;
            }
            if let Some(last) = last_ping {
                if now.saturating_duration_since(last) < DISCO_PING_INTERVAL {
                    continue;
                }
            }

            if !sent_any && send_call_me_maybe {
                log::debug!(
                    "disco: send, starting discovery for {} ({})",
                    self.public_key.short_string(),
                    st.disco_short
                );
            }
            sent_any = true;
            self.start_ping_locked(st, SendAddr::Udp(addr), now, PingPurpose::Discovery, outbox);
        }

        if sent_any && send_call_me_maybe {
            if let (Some(region), Some(disco)) = (st.relay_addr, st.disco_key) {
                outbox.call_me_maybe = Some((region, disco));
            }
        }
    }

    /// Hand collected sends to the connection. Endpoint lock must not be held.
    fn flush(&self, outbox: Outbox) {
        if outbox.pings.is_empty() && outbox.call_me_maybe.is_none() {
            return;
        }
        let Some(host) = self.host.upgrade() else {
            return;
        };
        let self_key = host.self_node_key();
        for ping in outbox.pings {
            let msg = Message::Ping(Ping {
                tx_id: ping.tx_id,
                node_key: self_key,
            });
            let sent = host
                .send_disco_message(ping.to, self.public_key, ping.disco, msg, ping.verbose)
                .unwrap_or(false);
            if !sent {
                self.forget_ping(ping.tx_id);
            }
        }
        if let Some((region, disco)) = outbox.call_me_maybe {
            host.enqueue_call_me_maybe(region, self.public_key, disco);
        }
    }

    fn ping_timeout(&self, tx_id: TxId) {
        let now = Instant::now();
        let mut st = self.state.lock();
        let Some(sp) = st.sent_ping.remove(&tx_id) else {
            return;
        };
        if self.debug_disco || st.best_addr.is_none() || st.trust_expired(now) {
            log::debug!(
                "disco: timeout waiting for pong {} from {} ({}, {})",
                hex::encode(&tx_id[..6]),
                sp.to,
                self.public_key.short_string(),
                st.disco_short
            );
        }
    }

    /// Drop a ping that never left, so its candidate is due again at once.
    fn forget_ping(&self, tx_id: TxId) {
        let mut st = self.state.lock();
        let Some(sp) = st.sent_ping.remove(&tx_id) else {
            return;
        };
        sp.timer.stop();
        if let SendAddr::Udp(addr) = sp.to {
            if let Some(c) = st.candidates.get_mut(&addr) {
                if c.last_ping == Some(sp.at) {
                    c.last_ping = None;
                }
            }
        }
        if sp.purpose == PingPurpose::Discovery && st.last_full_ping == Some(sp.at) {
            st.last_full_ping = None;
        }
    }

    /// Start a caller-requested ping; the result arrives on `tx`.
    pub(crate) fn cli_ping(&self, tx: oneshot::Sender<PingResult>) {
        let now = Instant::now();
        let mut outbox = Outbox::default();
        let probing = self.host_has_key();
        {
            let mut st = self.state.lock();
            let err = if !probing {
                Some("local node stopped")
            } else if !st.can_p2p() {
                Some("peer has no disco key")
            } else {
                None
            };
            if let Some(err) = err {
                let _ = tx.send(PingResult {
                    node: self.public_key,
                    latency: None,
                    endpoint: None,
                    relay_region: None,
                    err: Some(err.to_string()),
                });
                return;
            }
            st.pending_cli_pings.push(PendingCliPing { tx });

            let (udp, relay) = st.addr_for_send(now);
            if let Some(region) = relay {
                self.start_ping_locked(&mut st, SendAddr::Relay(region), now, PingPurpose::Cli, &mut outbox);
            }
            match udp {
                // Only ping the path in use so results don't bounce between
                // equally close addresses.
                Some(addr) if !st.trust_expired(now) => {
                    self.start_ping_locked(&mut st, SendAddr::Udp(addr), now, PingPurpose::Cli, &mut outbox);
                }
                _ => {
                    let addrs: Vec<SocketAddr> = st.candidates.keys().copied().collect();
                    for addr in addrs {
                        self.start_ping_locked(&mut st, SendAddr::Udp(addr), now, PingPurpose::Cli, &mut outbox);
                    }
                }
            }
            self.note_active_locked(&mut st, now, probing);
        }
        self.flush(outbox);
    }

    // ------------------------------------------------------------------------
    // Disco input
    // ------------------------------------------------------------------------

    /// Handle a pong. Called with the connection lock held.
    ///
    /// Returns `None` when the transaction is not one of ours (or was
    /// already answered).
    pub(crate) fn handle_pong(&self, pong: &Pong, src: SendAddr, now: Instant) -> Option<PongOutcome> {
        let mut st = self.state.lock();

        let sp = st.sent_ping.remove(&pong.tx_id)?;
        sp.timer.stop();
        let latency = now.saturating_duration_since(sp.at);
        let mut outcome = PongOutcome { confirmed_addr: None };

        if let SendAddr::Udp(from) = src {
            let SendAddr::Udp(to) = sp.to else {
                return Some(outcome);
            };
            let Some(c) = st.candidates.get_mut(&to) else {
                // No longer a candidate we care about.
                return Some(outcome);
            };
            c.add_pong_reply(PongReply {
                latency,
                pong_src: pong.src,
            });
            outcome.confirmed_addr = Some(from);
        }

        if sp.purpose != PingPurpose::Heartbeat || self.debug_disco {
            log::debug!(
                "disco: <-{} ({}, {}) got pong tx={} latency={:?} pong.src={}{}",
                st.disco_short,
                self.public_key.short_string(),
                src,
                hex::encode(&pong.tx_id[..6]),
                latency,
                pong.src,
                if sp.to != src { format!(" ping.to={}", sp.to) } else { String::new() }
            );
        }

        for pending in st.pending_cli_pings.drain(..) {
            let (endpoint, relay_region) = match sp.to {
                SendAddr::Udp(addr) => (Some(addr), None),
                SendAddr::Relay(region) => (None, Some(region)),
            };
            let _ = pending.tx.send(PingResult {
                node: self.public_key,
                latency: Some(latency),
                endpoint,
                relay_region,
                err: None,
            });
        }

        if let (SendAddr::Udp(_), SendAddr::Udp(to)) = (src, sp.to) {
            let this_pong = AddrLatency { addr: to, latency };
            if better_addr(&this_pong, st.best_addr.as_ref()) {
                log::info!(
                    "disco: node {} {} now using {}",
                    self.public_key.short_string(),
                    st.disco_short,
                    to
                );
                st.best_addr = Some(this_pong);
            }
            if st.best_addr.map(|b| b.addr) == Some(to) {
                st.best_addr = Some(this_pong);
                st.best_addr_at = Some(now);
                st.trust_best_addr_until = Some(now + TRUST_UDP_ADDR_DURATION);
            }
        }

        Some(outcome)
    }

    /// Handle a relay-delivered CallMeMaybe: replace the advertised subset
    /// and probe everything right away.
    pub(crate) fn handle_call_me_maybe(&self, msg: &CallMeMaybe) {
        let now = Instant::now();
        let mut outbox = Outbox::default();
        if !self.host_has_key() {
            log::debug!(
                "disco: ignoring call-me-maybe for {} while stopped",
                self.public_key.short_string()
            );
            return;
        }
        {
            let mut st = self.state.lock();
            if !st.can_p2p() {
                log::warn!(
                    "disco: call-me-maybe for {} which has no disco key",
                    self.public_key.short_string()
                );
                return;
            }

            for want in st.is_call_me_maybe.values_mut() {
                *want = false;
            }
            let mut new_eps = Vec::new();
            for addr in &msg.my_number {
                if is_v6_link_local(&addr.ip()) {
                    continue;
                }
                st.is_call_me_maybe.insert(*addr, true);
                match st.candidates.get_mut(addr) {
                    Some(c) => c.call_me_maybe_time = Some(now),
                    None => {
                        st.candidates.insert(
                            *addr,
                            CandidateState {
                                call_me_maybe_time: Some(now),
                                ..Default::default()
                            },
                        );
                        new_eps.push(addr.to_string());
                    }
                }
            }
            if !new_eps.is_empty() {
                log::debug!(
                    "disco: call-me-maybe from {} {} added new endpoints: {}",
                    self.public_key.short_string(),
                    st.disco_short,
                    new_eps.join(", ")
                );
            }

            let dropped: Vec<SocketAddr> = st
                .is_call_me_maybe
                .iter()
                .filter(|(_, want)| !**want)
                .map(|(addr, _)| *addr)
                .collect();
            for addr in dropped {
                st.is_call_me_maybe.remove(&addr);
                st.delete_candidate(&addr);
            }

            for c in st.candidates.values_mut() {
                c.last_ping = None;
            }
            self.send_pings_locked(&mut st, now, false, &mut outbox);
        }
        self.flush(outbox);
    }

    // ------------------------------------------------------------------------
    // Lifecycle and status
    // ------------------------------------------------------------------------

    /// Stop all timers and revert to relay-only.
    pub fn stop_and_reset(&self) {
        self.num_stop_and_reset.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock();

        log::debug!("doing cleanup for discovery key {}", st.disco_short);

        st.reset();
        if let Some(timer) = st.heartbeat.take() {
            timer.stop();
        }
        st.pending_cli_pings.clear();
    }

    pub fn status(&self) -> EndpointStatus {
        let now = Instant::now();
        let st = self.state.lock();
        let mut status = EndpointStatus {
            relay_region: st.relay_addr,
            last_write: None,
            last_recv: self.last_recv_activity(),
            active: false,
            cur_addr: None,
            candidates: st.candidates.len(),
            heartbeat: st.heartbeat.as_ref().map_or(false, Timer::is_pending),
        };
        let Some(last_send) = st.last_send else {
            return status;
        };
        let since = now.saturating_duration_since(last_send);
        status.last_write = Some(since);
        status.active = since < SESSION_ACTIVE_TIMEOUT;
        if let (Some(udp), None) = st.addr_for_send(now) {
            status.cur_addr = Some(udp);
        }
        status
    }

    /// Latest pong source the peer reported for `addr`, if any.
    pub fn last_pong_src(&self, addr: &SocketAddr) -> Option<SocketAddr> {
        let st = self.state.lock();
        st.candidates.get(addr)?.latest_pong().map(|r| r.pong_src)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint{{{}, #{}}}", self.public_key.short_string(), self.id)
    }
}

// ============================================================================
// Tests
// ============================================================================
