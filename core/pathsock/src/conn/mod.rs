//! Connection manager
//!
//! [`Conn`] owns the UDP sockets, the relay client pool, the peer index and
//! the disco shared-secret cache, and exposes the data-plane contract:
//! `send`, the `receive_*` pumps and `parse_endpoint`.
//!
//! ```text
//!  control plane ──► set_network_map / set_relay_map / set_private_key
//!                            │
//!                            ▼
//!   ┌──────────────────────── Conn ────────────────────────────┐
//!   │  PeerMap ──► Endpoint (per peer, own lock, timers)       │
//!   │  disco_info (shared secrets)    active_relay (pool)      │
//!   │  pconn4 / pconn6 (rebindable)   periodic re-STUN         │
//!   └──────────────────────────────────────────────────────────┘
//!        ▲ receive_ipv4 / receive_ipv6 / receive_relay     │ send
//!        └────────────── data plane ◄──────────────────────┘
//! ```
//!
//! # Locking
//!
//! One connection lock guards [`ConnState`]. Endpoint locks are taken only
//! after it (or without it), and nothing that takes the connection lock
//! runs while an endpoint lock is held. Per-packet receive state (network
//! up, have-key, closed) lives in atomics.

mod endpoints;
mod relay;

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::candidate::Candidate;
use crate::config::{EndpointsFn, IdleFn, NetInfoFn, NoteRecvActivityFn, Options, RelayActiveFn};
use crate::disco::{self, CallMeMaybe, DiscoError, Message, Ping, Pong};
use crate::endpoint::{Endpoint, PathHost, PingResult, SendAddr};
use crate::error::{Error, RecvError, SendError};
use crate::key::{DiscoPrivate, DiscoPublic, DiscoShared, NodePrivate, NodePublic};
use crate::metrics::Metrics;
use crate::netcheck::{NetChecker, NetInfo, PortMapper};
use crate::netmap::{NetworkMap, PeerNode, RELAY_MAGIC_IP};
use crate::peer_map::PeerMap;
use crate::rebind::{CurrentPortFate, Network, RebindingUdpSocket};
use crate::relay::{RegionId, RelayDialer, RelayMap};
use crate::status::{PeerStatus, Status};
use crate::timer::{Spawner, Timer};

use relay::{ActiveRelay, RelayReadResult, RelayRoute};

// ============================================================================
// Constants
// ============================================================================

/// Non-home relay connections idle this long are closed
pub const RELAY_INACTIVE_CLEANUP_TIME: Duration = Duration::from_secs(60);

/// How often idle relay connections are swept
pub const RELAY_CLEAN_STALE_INTERVAL: Duration = Duration::from_secs(15);

/// Our endpoints must be this fresh before we send a CallMeMaybe
pub const ENDPOINTS_FRESH_ENOUGH_DURATION: Duration = Duration::from_secs(27);

/// Relay writes queued per region before sends are dropped
pub const BUFFERED_RELAY_WRITES_BEFORE_DROP: usize = 32;

/// Upper bound on one network condition probe
pub const NETCHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// A ping from the same source within this window is likely a heartbeat
pub const HEARTBEAT_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Post-rebind relay liveness check timeout
pub const RELAY_REBIND_PING_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// Peer handle
// ============================================================================

/// Opaque handle to a peer, handed to the data plane
///
/// Handles compare equal only when they name the same endpoint object; a
/// peer removed and re-added gets a new one.
#[derive(Clone)]
pub struct PeerHandle(Arc<Endpoint>);

impl PeerHandle {
    pub fn public_key(&self) -> NodePublic {
        self.0.public_key()
    }

    /// Stable textual form (the peer's hex key)
    pub fn dst_to_string(&self) -> String {
        self.0.public_key().to_hex()
    }

    /// Synthetic destination bytes: `"ps"` then the endpoint id, big endian.
    /// Not a routable address.
    pub fn dst_to_bytes(&self) -> [u8; 10] {
        let mut b = [0u8; 10];
        b[..2].copy_from_slice(b"ps");
        b[2..].copy_from_slice(&self.0.id().to_be_bytes());
        b
    }

    /// Source addresses are not tracked per handle.
    pub fn clear_src(&self) {}
}

impl PartialEq for PeerHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for PeerHandle {}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dst_to_string())
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerHandle({:?})", self.0)
    }
}

// ============================================================================
// State
// ============================================================================

/// Shared secret and ping bookkeeping per remote disco key
struct DiscoInfo {
    shared: Arc<DiscoShared>,
    short: String,
    last_ping_from: Option<SendAddr>,
    last_ping_time: Option<Instant>,
    /// Last node this disco key was unambiguously resolved to
    last_node_key: Option<NodePublic>,
}

/// Last address -> endpoint resolution on one receive socket
struct RecvCache {
    addr: SocketAddr,
    ep: Arc<Endpoint>,
    gen: u64,
}

/// Work a disco message asks for once the connection lock is released
enum DiscoFollowup {
    SendPong {
        dst: SendAddr,
        dst_key: Option<NodePublic>,
        disco: DiscoPublic,
        pong: Pong,
    },
    CallMeMaybe(Arc<Endpoint>, CallMeMaybe),
}

/// Everything behind the connection lock
struct ConnState {
    closed: bool,
    private_key: NodePrivate,
    public_key: Option<NodePublic>,
    ever_had_key: bool,

    relay_map: RelayMap,
    /// Home relay region
    my_relay: Option<RegionId>,
    net_map_peers: Vec<PeerNode>,
    force_background_stun: bool,
    peer_set: HashSet<NodePublic>,
    peer_map: PeerMap,
    disco_info: HashMap<DiscoPublic, DiscoInfo>,

    endpoints_update_active: bool,
    want_endpoints_update: Option<String>,
    last_endpoints: Vec<Candidate>,
    last_endpoints_time: Option<Instant>,
    /// CallMeMaybes waiting for fresh endpoints, per peer
    on_endpoint_refreshed: HashMap<NodePublic, (RegionId, DiscoPublic)>,
    periodic_restun: Option<Timer>,
    net_info_last: Option<NetInfo>,

    active_relay: BTreeMap<RegionId, ActiveRelay>,
    /// Tasks of the latest generation per region; the next generation
    /// waits for them before starting
    prev_relay: HashMap<RegionId, TaskTracker>,
    next_relay_gen: u64,
    relay_cleanup_timer: Option<Timer>,
    /// Region we last heard each peer on, for replying without dialing
    relay_route: HashMap<NodePublic, RelayRoute>,
    peer_last_relay: HashMap<NodePublic, RegionId>,
}

impl ConnState {
    fn new() -> Self {
        Self {
            closed: false,
            private_key: NodePrivate::zero(),
            public_key: None,
            ever_had_key: false,
            relay_map: RelayMap::default(),
            my_relay: None,
            net_map_peers: Vec::new(),
            force_background_stun: false,
            peer_set: HashSet::new(),
            peer_map: PeerMap::new(),
            disco_info: HashMap::new(),
            endpoints_update_active: false,
            want_endpoints_update: None,
            last_endpoints: Vec::new(),
            last_endpoints_time: None,
            on_endpoint_refreshed: HashMap::new(),
            periodic_restun: None,
            net_info_last: None,
            active_relay: BTreeMap::new(),
            prev_relay: HashMap::new(),
            next_relay_gen: 0,
            relay_cleanup_timer: None,
            relay_route: HashMap::new(),
            peer_last_relay: HashMap::new(),
        }
    }
}

pub(crate) struct ConnInner {
    self_ref: Weak<ConnInner>,
    spawner: Spawner,
    config: crate::config::Config,

    net_checker: Arc<dyn NetChecker>,
    port_mapper: Arc<dyn PortMapper>,
    relay_dialer: Arc<dyn RelayDialer>,
    endpoints_fn: Option<EndpointsFn>,
    relay_active_fn: Option<RelayActiveFn>,
    idle_fn: Option<IdleFn>,
    note_recv_activity_fn: Option<NoteRecvActivityFn>,
    net_info_fn: Option<NetInfoFn>,

    disco_private: DiscoPrivate,
    disco_public: DiscoPublic,
    disco_short: String,

    pconn4: RebindingUdpSocket,
    pconn6: RebindingUdpSocket,
    recv_cache4: Mutex<Option<RecvCache>>,
    recv_cache6: Mutex<Option<RecvCache>>,
    relay_recv_tx: mpsc::Sender<RelayReadResult>,
    relay_recv_rx: tokio::sync::Mutex<mpsc::Receiver<RelayReadResult>>,

    have_private_key: AtomicBool,
    network_up: AtomicBool,
    listening: AtomicBool,
    closed: AtomicBool,
    /// Last report said no IPv4 / IPv6 / IPv4 sends failed
    no_v4: AtomicBool,
    no_v6: AtomicBool,
    no_v4_send: AtomicBool,
    preferred_port: AtomicU16,
    next_endpoint_id: AtomicU64,
    relay_fallback_seed: u64,
    metrics: Arc<Metrics>,

    state: Mutex<ConnState>,
}

// ============================================================================
// Conn
// ============================================================================

/// The path-management connection
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl Conn {
    /// Create a connection and bind its sockets. Must be called within a
    /// tokio runtime; the connection starts out not listening.
    pub fn new(opts: Options) -> Result<Self, Error> {
        let spawner = Spawner::current().ok_or(Error::NoRuntime)?;
        let Options {
            config,
            net_checker,
            port_mapper,
            relay_dialer,
            endpoints_fn,
            relay_active_fn,
            idle_fn,
            note_recv_activity,
            net_info_fn,
        } = opts;

        let disco_private = DiscoPrivate::generate();
        let disco_public = disco_private.public();
        let (relay_recv_tx, relay_recv_rx) = mpsc::channel(1);

        let inner = Arc::new_cyclic(|self_ref| ConnInner {
            self_ref: self_ref.clone(),
            spawner,
            preferred_port: AtomicU16::new(config.port),
            config,
            net_checker,
            port_mapper,
            relay_dialer,
            endpoints_fn,
            relay_active_fn,
            idle_fn,
            note_recv_activity_fn: note_recv_activity,
            net_info_fn,
            disco_short: disco_public.short_string(),
            disco_private,
            disco_public,
            pconn4: RebindingUdpSocket::new(Network::Udp4),
            pconn6: RebindingUdpSocket::new(Network::Udp6),
            recv_cache4: Mutex::new(None),
            recv_cache6: Mutex::new(None),
            relay_recv_tx,
            relay_recv_rx: tokio::sync::Mutex::new(relay_recv_rx),
            have_private_key: AtomicBool::new(false),
            network_up: AtomicBool::new(true),
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            no_v4: AtomicBool::new(false),
            no_v6: AtomicBool::new(false),
            no_v4_send: AtomicBool::new(false),
            next_endpoint_id: AtomicU64::new(1),
            relay_fallback_seed: rand::random(),
            metrics: Arc::new(Metrics::new()),
            state: Mutex::new(ConnState::new()),
        });
        log::info!("disco key = {}", inner.disco_short);

        inner.rebind_sockets(CurrentPortFate::Keep)?;
        Ok(Self { inner })
    }

    pub fn disco_public_key(&self) -> DiscoPublic {
        self.inner.disco_public
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    /// Local IPv4 port, or 0 when unbound
    pub fn local_port(&self) -> u16 {
        self.inner.pconn4.port().unwrap_or(0)
    }

    /// Start accepting reads from the receive pumps.
    pub fn open(&self) -> Result<u16, Error> {
        if self.inner.is_closed() {
            return Err(Error::Closed);
        }
        self.inner.listening.store(true, Ordering::SeqCst);
        Ok(self.local_port())
    }

    /// Tear everything down and wait for every background task to finish.
    pub async fn close(&self) {
        let inner = &self.inner;
        {
            let mut st = inner.state.lock();
            if !st.closed {
                st.relay_cleanup_timer = None;
                st.periodic_restun = None;
                inner.port_mapper.close();
                for ep in st.peer_map.endpoints() {
                    ep.stop_and_reset();
                }
                st.closed = true;
                inner.closed.store(true, Ordering::SeqCst);
                inner.close_all_relays_locked(&mut st, "conn-close");
            }
        }
        inner.pconn4.close();
        inner.pconn6.close();
        inner.spawner.shutdown().await;
        log::info!("connection closed");
    }

    /// Number of background tasks still running
    pub fn task_count(&self) -> usize {
        self.inner.spawner.task_count()
    }

    pub fn relay_count(&self) -> usize {
        self.inner.state.lock().active_relay.len()
    }

    // ------------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------------

    /// Set (or zero) the node's identity key.
    pub fn set_private_key(&self, private_key: NodePrivate) {
        let inner = &self.inner;
        let mut restun = false;
        {
            let mut guard = inner.state.lock();
            let st = &mut *guard;
            if st.private_key == private_key {
                return;
            }
            let old_zero = st.private_key.is_zero();
            let new_zero = private_key.is_zero();
            st.public_key = (!new_zero).then(|| private_key.public());
            st.private_key = private_key;
            inner.have_private_key.store(!new_zero, Ordering::SeqCst);

            if old_zero {
                st.ever_had_key = true;
                log::info!("private key set (init)");
                restun = true;
            } else if new_zero {
                log::info!("private key zeroed");
                inner.close_all_relays_locked(st, "zero-private-key");
                st.periodic_restun = None;
                st.on_endpoint_refreshed.clear();
            } else {
                log::info!("private key changed");
                inner.close_all_relays_locked(st, "new-private-key");
            }

            if let (Some(home), false) = (st.my_relay, new_zero) {
                log::info!("private key changed, reconnecting to home relay-{}", home);
                inner.relay_write_chan_locked(st, home, None);
            }

            if new_zero {
                for ep in st.peer_map.endpoints() {
                    ep.stop_and_reset();
                }
            }
        }
        if restun {
            inner.re_stun("set-private-key");
        }
    }

    /// Apply a new peer list from the control plane.
    pub fn set_network_map(&self, nm: &NetworkMap) {
        let inner = &self.inner;
        let mut guard = inner.state.lock();
        let st = &mut *guard;
        if st.closed {
            return;
        }
        st.force_background_stun = nm.force_background_stun;
        if st.net_map_peers == nm.peers {
            return;
        }

        let num_no_disco = nm.peers.iter().filter(|n| n.disco_key.is_none()).count();
        inner.metrics.peers.store(nm.peers.len() as u64, Ordering::Relaxed);
        log::debug!("got updated network map; {} peers", nm.peers.len());
        if num_no_disco != 0 {
            log::debug!("{} relay-only peers (no disco key)", num_no_disco);
        }
        st.net_map_peers = nm.peers.clone();

        for n in &nm.peers {
            match st.peer_map.endpoint_for_node_key(&n.key) {
                Some(ep) => {
                    let old_disco = ep.disco_key();
                    ep.update_from_node(n);
                    st.peer_map.upsert_endpoint(&ep, old_disco);
                }
                None => {
                    let id = inner.next_endpoint_id.fetch_add(1, Ordering::Relaxed);
                    let host: Weak<dyn PathHost> = inner.self_ref.clone();
                    let ep = Endpoint::new(id, host, inner.spawner.clone(), n, inner.config.debug_disco);
                    if inner.config.debug_disco {
                        log::info!(
                            "created endpoint key={} disco={:?} relay={:?} endpoints={:?}",
                            n.key.short_string(),
                            n.disco_key,
                            n.relay,
                            n.endpoints
                        );
                    }
                    st.peer_map.upsert_endpoint(&ep, None);
                }
            }
            // Relay-only peers never confirm an address via disco; map
            // their advertised ones so direct packets still resolve.
            if n.disco_key.is_none() {
                for addr in n.endpoints.iter().filter_map(|s| s.parse::<SocketAddr>().ok()) {
                    st.peer_map.set_node_key_for_addr(addr, n.key);
                }
            }
        }

        if st.peer_map.node_count() != nm.peers.len() {
            let keep: HashSet<NodePublic> = nm.peers.iter().map(|n| n.key).collect();
            let gone: Vec<Arc<Endpoint>> = st
                .peer_map
                .endpoints()
                .filter(|ep| !keep.contains(&ep.public_key()))
                .cloned()
                .collect();
            for ep in gone {
                log::debug!("removing endpoint for {}", ep.public_key().short_string());
                st.peer_map.delete_endpoint(&ep);
            }
        }

        let peer_map = &st.peer_map;
        st.disco_info.retain(|dk, _| peer_map.has_disco_key(dk));
    }

    /// Replace the set of peers the data plane is configured with.
    pub fn update_peers(&self, peers: HashSet<NodePublic>) {
        let restun = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let old = std::mem::replace(&mut st.peer_set, peers);
            for peer in old.iter().filter(|p| !st.peer_set.contains(p)) {
                st.relay_route.remove(peer);
                st.peer_last_relay.remove(peer);
            }
            old.is_empty() && !st.peer_set.is_empty()
        };
        if restun {
            self.inner.re_stun("non-zero-peers");
        }
    }

    /// Replace the relay map. An empty map disables relays.
    pub fn set_relay_map(&self, relay_map: RelayMap) {
        let inner = &self.inner;
        {
            let mut guard = inner.state.lock();
            let st = &mut *guard;
            if st.relay_map == relay_map {
                return;
            }
            let old = std::mem::replace(&mut st.relay_map, relay_map);
            if st.relay_map.is_empty() {
                inner.close_all_relays_locked(st, "relay-disabled");
                return;
            }

            let mut changes = false;
            for (rid, old_def) in &old.regions {
                if st.relay_map.region(*rid) == Some(old_def) {
                    continue;
                }
                changes = true;
                if st.my_relay == Some(*rid) {
                    st.my_relay = None;
                }
                inner.close_relay_locked(st, *rid, "relay-region-redefined");
            }
            if changes {
                inner.log_active_relays_locked(st);
            }
        }
        inner.re_stun("relay-map-update");
    }

    /// Note whether the host has network connectivity.
    pub fn set_network_up(&self, up: bool) {
        let inner = &self.inner;
        {
            let mut guard = inner.state.lock();
            let st = &mut *guard;
            if inner.network_up.load(Ordering::SeqCst) == up {
                return;
            }
            log::info!("network up: {}", up);
            inner.network_up.store(up, Ordering::SeqCst);

            if up {
                if let Some(home) = st.my_relay {
                    inner.relay_write_chan_locked(st, home, None);
                }
            } else {
                inner.port_mapper.note_network_down();
                inner.close_all_relays_locked(st, "network-down");
                st.periodic_restun = None;
            }
        }
        if up {
            inner.re_stun("network-up");
        }
    }

    /// Change the preferred local port, rebinding on a new one.
    pub fn set_preferred_port(&self, port: u16) {
        let inner = &self.inner;
        if inner.preferred_port.swap(port, Ordering::SeqCst) == port {
            return;
        }
        if let Err(e) = inner.rebind_sockets(CurrentPortFate::Drop) {
            log::warn!("set_preferred_port({}): {}", port, e);
            return;
        }
        inner.reset_endpoint_states();
    }

    /// Rebind the sockets (keeping the port if possible), re-check relays
    /// and distrust every direct path.
    pub fn rebind(&self) {
        self.inner.rebind();
    }

    /// Request an endpoint discovery pass.
    pub fn re_stun(&self, why: &str) {
        self.inner.re_stun(why);
    }

    // ------------------------------------------------------------------------
    // Data plane
    // ------------------------------------------------------------------------

    /// Send a data packet to a peer.
    pub fn send(&self, ep: &PeerHandle, pkt: &[u8]) -> Result<(), SendError> {
        if self.inner.is_closed() {
            return Err(SendError::Closed);
        }
        if self.inner.network_down() {
            return Err(SendError::NetworkDown);
        }
        if !self.inner.have_private_key.load(Ordering::SeqCst) {
            return Err(SendError::NoPrivateKey);
        }
        ep.0.send(pkt)
    }

    /// Next data packet received directly over IPv4.
    pub async fn receive_ipv4(&self, buf: &mut [u8]) -> Result<(usize, PeerHandle), RecvError> {
        self.inner.receive_udp(Network::Udp4, buf).await
    }

    /// Next data packet received directly over IPv6.
    pub async fn receive_ipv6(&self, buf: &mut [u8]) -> Result<(usize, PeerHandle), RecvError> {
        self.inner.receive_udp(Network::Udp6, buf).await
    }

    /// Next data packet received via any relay.
    pub async fn receive_relay(&self, buf: &mut [u8]) -> Result<(usize, PeerHandle), RecvError> {
        self.inner.receive_relay(buf).await
    }

    /// Resolve a peer's hex identity key to its handle.
    pub fn parse_endpoint(&self, node_key: &str) -> Result<PeerHandle, Error> {
        let key = NodePublic::from_hex(node_key)?;
        let st = self.inner.state.lock();
        if st.closed {
            return Err(Error::Closed);
        }
        match st.peer_map.endpoint_for_node_key(&key) {
            Some(ep) => Ok(PeerHandle(ep)),
            None => {
                log::warn!("parse_endpoint: unknown node key {}", key.short_string());
                Err(Error::UnknownPeer(key.short_string()))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    /// Disco ping a peer; the first pong (direct or via relay) answers.
    pub fn ping(&self, peer: &NodePublic) -> oneshot::Receiver<PingResult> {
        let (tx, rx) = oneshot::channel();
        let fail = |tx: oneshot::Sender<PingResult>, err: &str| {
            let _ = tx.send(PingResult {
                node: *peer,
                latency: None,
                endpoint: None,
                relay_region: None,
                err: Some(err.to_string()),
            });
        };
        let ep = {
            let st = self.inner.state.lock();
            if st.private_key.is_zero() {
                fail(tx, "local node stopped");
                return rx;
            }
            match st.peer_map.endpoint_for_node_key(peer) {
                Some(ep) => ep,
                None => {
                    fail(tx, "unknown peer");
                    return rx;
                }
            }
        };
        ep.cli_ping(tx);
        rx
    }

    /// Time since anything was received from `nk`
    pub fn last_recv_activity_of_node_key(&self, nk: &NodePublic) -> Option<Duration> {
        let st = self.inner.state.lock();
        st.peer_map.endpoint_for_node_key(nk)?.last_recv_activity()
    }

    pub fn peer_has_disco_key(&self, nk: &NodePublic) -> bool {
        let st = self.inner.state.lock();
        st.peer_map
            .endpoint_for_node_key(nk)
            .map_or(false, |ep| ep.can_p2p())
    }

    pub fn status(&self) -> Status {
        let st = self.inner.state.lock();

        let mut peers: Vec<PeerStatus> = st
            .peer_map
            .endpoints()
            .map(|ep| {
                let s = ep.status();
                PeerStatus {
                    key: ep.public_key(),
                    relay: s.relay_region.map(|r| match st.relay_map.region(r) {
                        Some(region) if !region.region_code.is_empty() => region.region_code.clone(),
                        _ => r.to_string(),
                    }),
                    cur_addr: s.cur_addr,
                    last_write: s.last_write,
                    last_recv: s.last_recv,
                    active: s.active,
                    heartbeat: s.heartbeat,
                }
            })
            .collect();
        peers.sort_by(|a, b| a.key.cmp(&b.key));

        let relays = self.inner.relay_statuses_locked(&st);

        Status {
            self_key: st.public_key,
            self_endpoints: st.last_endpoints.clone(),
            home_relay: st.my_relay,
            peers,
            relays,
        }
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        // Stops every task even if close() was never awaited.
        self.inner.spawner.token().cancel();
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn{{disco={}}}", self.inner.disco_short)
    }
}

// ============================================================================
// ConnInner: sockets, sending, receiving, disco
// ============================================================================

impl ConnInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn network_down(&self) -> bool {
        !self.network_up.load(Ordering::SeqCst)
    }

    fn log_disco(&self, args: fmt::Arguments<'_>) {
        if self.config.debug_disco {
            log::info!("{}", args);
        } else {
            log::debug!("{}", args);
        }
    }

    fn socket(&self, network: Network) -> &RebindingUdpSocket {
        match network {
            Network::Udp4 => &self.pconn4,
            Network::Udp6 => &self.pconn6,
        }
    }

    fn rebind_sockets(&self, fate: CurrentPortFate) -> Result<(), Error> {
        if self.config.always_use_relay {
            log::info!("UDP disabled, always using relay");
            self.pconn4.unbind();
            self.pconn6.unbind();
            return Ok(());
        }
        let port = self.preferred_port.load(Ordering::SeqCst);
        let local = self.pconn4.rebind(self.spawner.handle(), port, fate)?;
        self.port_mapper.set_local_port(local);
        if let Err(e) = self.pconn6.rebind(self.spawner.handle(), port, fate) {
            log::info!("ignoring IPv6 bind failure: {}", e);
        }
        Ok(())
    }

    fn rebind(&self) {
        Metrics::inc(&self.metrics.rebind_total);
        if let Err(e) = self.rebind_sockets(CurrentPortFate::Keep) {
            log::warn!("rebind: {}", e);
            return;
        }
        self.ping_relays_after_rebind();
        self.reset_endpoint_states();
    }

    /// Distrust every peer's best address until it is re-confirmed.
    fn reset_endpoint_states(&self) {
        let st = self.state.lock();
        for ep in st.peer_map.endpoints() {
            ep.note_connectivity_change();
        }
    }

    fn disco_info_locked<'a>(
        &self,
        infos: &'a mut HashMap<DiscoPublic, DiscoInfo>,
        dk: DiscoPublic,
    ) -> Option<&'a mut DiscoInfo> {
        match infos.entry(dk) {
            Entry::Occupied(e) => Some(e.into_mut()),
            Entry::Vacant(v) => {
                let shared = match self.disco_private.shared(&dk) {
                    Ok(shared) => shared,
                    Err(e) => {
                        log::warn!("disco: no shared key with {}: {}", dk.short_string(), e);
                        return None;
                    }
                };
                Some(v.insert(DiscoInfo {
                    shared: Arc::new(shared),
                    short: dk.short_string(),
                    last_ping_from: None,
                    last_ping_time: None,
                    last_node_key: None,
                }))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// `Ok(false)` when nothing was attempted (e.g. no socket for the family).
    fn send_udp(&self, addr: SocketAddr, pkt: &[u8]) -> Result<bool, SendError> {
        let (sock, family_down) = match addr.ip() {
            IpAddr::V4(_) => (&self.pconn4, self.no_v4.load(Ordering::Relaxed)),
            IpAddr::V6(_) => (&self.pconn6, self.no_v6.load(Ordering::Relaxed)),
        };
        if !sock.is_bound() {
            return Ok(false);
        }
        match sock.try_send_to(pkt, addr) {
            Ok(_) => {
                Metrics::inc(&self.metrics.send_udp_total);
                Ok(true)
            }
            Err(e) if family_down || e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(source) => Err(SendError::Udp { addr, source }),
        }
    }

    /// Like `send_udp`, but a socket with no room yet gets the packet once
    /// it is writable instead of dropping it.
    fn send_disco_udp(&self, addr: SocketAddr, pkt: Vec<u8>) -> Result<bool, SendError> {
        let (network, family_down) = match addr.ip() {
            IpAddr::V4(_) => (Network::Udp4, self.no_v4.load(Ordering::Relaxed)),
            IpAddr::V6(_) => (Network::Udp6, self.no_v6.load(Ordering::Relaxed)),
        };
        let sock = self.socket(network);
        if !sock.is_bound() {
            return Ok(false);
        }
        match sock.try_send_to(&pkt, addr) {
            Ok(_) => {
                Metrics::inc(&self.metrics.send_udp_total);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let Some(this) = self.self_ref.upgrade() else {
                    return Ok(false);
                };
                let token = self.spawner.token().clone();
                self.spawner.spawn(async move {
                    let res = tokio::select! {
                        _ = token.cancelled() => return,
                        res = this.socket(network).send_to(&pkt, addr) => res,
                    };
                    match res {
                        Ok(_) => Metrics::inc(&this.metrics.send_udp_total),
                        Err(e) => log::debug!("disco: deferred send to {} failed: {}", addr, e),
                    }
                });
                Ok(true)
            }
            Err(_) if family_down => Ok(false),
            Err(source) => Err(SendError::Udp { addr, source }),
        }
    }

    fn send_addr_to(&self, dst: SendAddr, peer: Option<NodePublic>, pkt: &[u8]) -> Result<bool, SendError> {
        let region = match dst {
            SendAddr::Udp(addr) => return self.send_udp(addr, pkt),
            SendAddr::Relay(region) => region,
        };
        let Some(peer) = peer else {
            return Ok(false);
        };
        let Some(tx) = self.relay_write_chan(region, Some(peer)) else {
            return Ok(false);
        };
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        match tx.try_send(relay::RelayWrite {
            peer,
            pkt: pkt.to_vec(),
        }) {
            Ok(()) => {
                Metrics::inc(&self.metrics.send_relay_total);
                Ok(true)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Metrics::inc(&self.metrics.send_relay_queue_full_total);
                Err(SendError::RelayQueueFull)
            }
            // Writer already gone; the region was closed under us.
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(false),
        }
    }

    fn send_disco(
        &self,
        dst: SendAddr,
        dst_key: Option<NodePublic>,
        dst_disco: DiscoPublic,
        msg: &Message,
        verbose: bool,
    ) -> Result<bool, SendError> {
        let shared = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(SendError::Closed);
            }
            match self.disco_info_locked(&mut st.disco_info, dst_disco) {
                Some(di) => di.shared.clone(),
                None => return Err(SendError::NoDiscoKey),
            }
        };
        let pkt = disco::encode_packet(&self.disco_public, &shared, msg)
            .map_err(|_| SendError::NotSent("disco seal failed"))?;

        let res = match dst {
            SendAddr::Udp(addr) => self.send_disco_udp(addr, pkt),
            SendAddr::Relay(_) => self.send_addr_to(dst, dst_key, &pkt),
        };
        match &res {
            Ok(true) => {
                if !verbose || self.config.debug_disco {
                    self.log_disco(format_args!(
                        "disco: {}->{} ({}, {}) sent {}",
                        self.disco_short,
                        dst_disco.short_string(),
                        dst_key.map_or_else(|| "?".to_string(), |k| k.short_string()),
                        dst,
                        msg.summary()
                    ));
                }
                let counter = match msg {
                    Message::Ping(_) => &self.metrics.disco_sent_ping_total,
                    Message::Pong(_) => &self.metrics.disco_sent_pong_total,
                    Message::CallMeMaybe(_) => &self.metrics.disco_sent_call_me_maybe_total,
                };
                Metrics::inc(counter);
            }
            Ok(false) => {}
            Err(e) => {
                if !self.network_down() {
                    log::warn!("disco: failed to send {} to {}: {}", msg.summary(), dst, e);
                }
            }
        }
        res
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    fn check_receiving(&self) -> Result<(), RecvError> {
        if self.is_closed() {
            return Err(RecvError::Closed);
        }
        if !self.listening.load(Ordering::SeqCst) {
            return Err(RecvError::NotListening);
        }
        Ok(())
    }

    async fn receive_udp(&self, network: Network, buf: &mut [u8]) -> Result<(usize, PeerHandle), RecvError> {
        self.check_receiving()?;
        let sock = self.socket(network);
        loop {
            let (n, src) = match sock.recv_from(buf).await {
                Ok(v) => v,
                Err(_) if self.is_closed() => return Err(RecvError::Closed),
                Err(e) => return Err(e.into()),
            };
            if let Some(ep) = self.receive_ip(&buf[..n], src, network) {
                let counter = match network {
                    Network::Udp4 => &self.metrics.recv_data_ipv4_total,
                    Network::Udp6 => &self.metrics.recv_data_ipv6_total,
                };
                Metrics::inc(counter);
                return Ok((n, PeerHandle(ep)));
            }
        }
    }

    /// Resolve a direct packet to its endpoint, consuming disco messages.
    fn receive_ip(&self, pkt: &[u8], src: SocketAddr, network: Network) -> Option<Arc<Endpoint>> {
        if self.handle_disco_message(pkt, SendAddr::Udp(src), None) {
            return None;
        }
        if !self.have_private_key.load(Ordering::SeqCst) {
            return None;
        }

        let cache = match network {
            Network::Udp4 => &self.recv_cache4,
            Network::Udp6 => &self.recv_cache6,
        };
        let cached = {
            let c = cache.lock();
            c.as_ref()
                .filter(|c| c.addr == src && c.gen == c.ep.num_stop_and_reset())
                .map(|c| c.ep.clone())
        };
        let ep = match cached {
            Some(ep) => ep,
            None => {
                let ep = self.state.lock().peer_map.endpoint_for_addr(&src)?;
                *cache.lock() = Some(RecvCache {
                    addr: src,
                    gen: ep.num_stop_and_reset(),
                    ep: ep.clone(),
                });
                ep
            }
        };
        ep.note_recv_activity();
        Some(ep)
    }

    async fn receive_relay(&self, buf: &mut [u8]) -> Result<(usize, PeerHandle), RecvError> {
        self.check_receiving()?;
        let mut rx = self.relay_recv_rx.lock().await;
        loop {
            let res = tokio::select! {
                _ = self.spawner.token().cancelled() => None,
                res = rx.recv() => res,
            };
            let Some(res) = res else {
                return Err(RecvError::Closed);
            };
            if self.is_closed() {
                return Err(RecvError::Closed);
            }
            if let Some((n, ep)) = self.process_relay_read_result(res, buf) {
                Metrics::inc(&self.metrics.recv_data_relay_total);
                return Ok((n, PeerHandle(ep)));
            }
        }
    }

    fn process_relay_read_result(&self, res: RelayReadResult, buf: &mut [u8]) -> Option<(usize, Arc<Endpoint>)> {
        let n = res.data.len();
        if n > buf.len() {
            log::warn!(
                "received relay packet of length {} that's too big for buffer size {}",
                n,
                buf.len()
            );
            return None;
        }
        buf[..n].copy_from_slice(&res.data);

        if self.handle_disco_message(&buf[..n], SendAddr::Relay(res.region), Some(res.src)) {
            return None;
        }
        let ep = self.state.lock().peer_map.endpoint_for_node_key(&res.src)?;
        ep.note_recv_activity();
        Some((n, ep))
    }

    // ------------------------------------------------------------------------
    // Disco
    // ------------------------------------------------------------------------

    /// Consume `msg` if it is a disco message. Returns whether it was one
    /// (handled or silently dropped).
    ///
    /// `relay_src` is the sending node as reported by the relay, for
    /// packets that arrived via relay.
    fn handle_disco_message(&self, msg: &[u8], src: SendAddr, relay_src: Option<NodePublic>) -> bool {
        let Some(sender) = disco::source_disco_key(msg) else {
            return false;
        };

        let mut followups = Vec::new();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.closed {
                return true;
            }
            if self.config.debug_disco {
                log::info!("disco: got disco-looking frame from {}", sender.short_string());
            }
            if st.private_key.is_zero() {
                return true;
            }
            if !st.peer_map.has_disco_key(&sender) {
                Metrics::inc(&self.metrics.disco_drop_unknown_key_total);
                if self.config.debug_disco {
                    log::info!("disco: ignoring frame, don't know endpoint for {}", sender.short_string());
                }
                return true;
            }

            let Some(di) = self.disco_info_locked(&mut st.disco_info, sender) else {
                return true;
            };
            let shared = di.shared.clone();
            let dm = match disco::decode_packet(msg, &shared) {
                Ok(dm) => dm,
                Err(DiscoError::OpenFailed) => {
                    // Possibly sealed for a disco key we rotated away from.
                    Metrics::inc(&self.metrics.disco_drop_open_total);
                    if self.config.debug_disco {
                        log::info!("disco: failed to open box from {}", sender.short_string());
                    }
                    return true;
                }
                Err(e) => {
                    Metrics::inc(&self.metrics.disco_drop_parse_total);
                    if self.config.debug_disco {
                        log::info!("disco: parse failed from {}: {}", sender.short_string(), e);
                    }
                    return true;
                }
            };

            match dm {
                Message::Ping(ping) => {
                    Metrics::inc(&self.metrics.disco_recv_ping_total);
                    self.handle_ping_locked(st, &ping, src, sender, relay_src, &mut followups);
                }
                Message::Pong(pong) => {
                    Metrics::inc(&self.metrics.disco_recv_pong_total);
                    let now = Instant::now();
                    // Several nodes may share the disco key; the one that
                    // sent the ping owns the tx id.
                    for ep in st.peer_map.endpoints_with_disco_key(&sender) {
                        let Some(outcome) = ep.handle_pong(&pong, src, now) else {
                            continue;
                        };
                        if let Some(addr) = outcome.confirmed_addr {
                            st.peer_map.set_node_key_for_addr(addr, ep.public_key());
                        }
                        if let Some(di) = st.disco_info.get_mut(&sender) {
                            di.last_node_key = Some(ep.public_key());
                        }
                        break;
                    }
                }
                Message::CallMeMaybe(cmm) => {
                    Metrics::inc(&self.metrics.disco_recv_call_me_maybe_total);
                    let (SendAddr::Relay(_), Some(node_key)) = (src, relay_src) else {
                        log::warn!("disco: call-me-maybe packets should only come via relay");
                        return true;
                    };
                    let Some(ep) = st.peer_map.endpoint_for_node_key(&node_key) else {
                        log::info!(
                            "disco: ignoring call-me-maybe from {}; {} is unknown",
                            sender.short_string(),
                            node_key.short_string()
                        );
                        return true;
                    };
                    if !ep.can_p2p() {
                        return true;
                    }
                    if ep.disco_key() != Some(sender) {
                        log::warn!(
                            "disco: call-me-maybe from {} via relay whose netmap disco key != {}",
                            node_key.short_string(),
                            sender.short_string()
                        );
                        return true;
                    }
                    if let Some(di) = st.disco_info.get_mut(&sender) {
                        di.last_node_key = Some(node_key);
                    }
                    self.log_disco(format_args!(
                        "disco: {}<-{} ({}, {}) got call-me-maybe, {} endpoints",
                        self.disco_short,
                        sender.short_string(),
                        node_key.short_string(),
                        src,
                        cmm.my_number.len()
                    ));
                    followups.push(DiscoFollowup::CallMeMaybe(ep, cmm));
                }
            }
        }

        for followup in followups {
            match followup {
                DiscoFollowup::SendPong {
                    dst,
                    dst_key,
                    disco,
                    pong,
                } => {
                    let _ = self.send_disco(dst, dst_key, disco, &Message::Pong(pong), true);
                }
                DiscoFollowup::CallMeMaybe(ep, cmm) => ep.handle_call_me_maybe(&cmm),
            }
        }
        true
    }

    /// The node that sent `ping`, when it can be known for certain.
    fn unambiguous_node_key_of_ping(
        &self,
        st: &ConnState,
        ping: &Ping,
        dk: DiscoPublic,
        relay_src: Option<NodePublic>,
    ) -> Option<NodePublic> {
        for nk in [relay_src, ping.node_key].into_iter().flatten() {
            if let Some(ep) = st.peer_map.endpoint_for_node_key(&nk) {
                if ep.disco_key() == Some(dk) {
                    return Some(nk);
                }
            }
        }
        st.peer_map.only_node_with_disco_key(&dk)
    }

    fn handle_ping_locked(
        &self,
        st: &mut ConnState,
        ping: &Ping,
        src: SendAddr,
        sender: DiscoPublic,
        relay_src: Option<NodePublic>,
        followups: &mut Vec<DiscoFollowup>,
    ) {
        let now = Instant::now();
        let resolved = self.unambiguous_node_key_of_ping(st, ping, sender, relay_src);

        let ConnState {
            disco_info,
            peer_map,
            ..
        } = st;
        let Some(di) = disco_info.get_mut(&sender) else {
            return;
        };
        let likely_heartbeat = di.last_ping_from == Some(src)
            && di
                .last_ping_time
                .map_or(false, |t| now.saturating_duration_since(t) < HEARTBEAT_DEDUP_WINDOW);
        di.last_ping_from = Some(src);
        di.last_ping_time = Some(now);

        if let Some(nk) = resolved {
            di.last_node_key = Some(nk);
            if let SendAddr::Udp(addr) = src {
                peer_map.set_node_key_for_addr(addr, nk);
            }
        }

        let mut dst_key = relay_src;
        let mut num_nodes = 0;
        match src {
            SendAddr::Relay(_) => {
                let ep = relay_src.and_then(|k| peer_map.endpoint_for_node_key(&k));
                if ep.map_or(false, |ep| ep.disco_key() == Some(sender)) {
                    num_nodes = 1;
                }
            }
            SendAddr::Udp(addr) => {
                for ep in peer_map.endpoints_with_disco_key(&sender) {
                    ep.add_candidate_endpoint(addr);
                    num_nodes += 1;
                    if num_nodes == 1 && dst_key.is_none() {
                        dst_key = Some(ep.public_key());
                    }
                }
                if num_nodes > 1 {
                    dst_key = None;
                }
            }
        }

        if num_nodes == 0 {
            log::warn!(
                "disco: got ping from {}/{:?} for node not in peers",
                src,
                relay_src.map(|k| k.short_string())
            );
            return;
        }

        if !likely_heartbeat || self.config.debug_disco {
            let who = if num_nodes > 1 {
                "[one-of-multi]".to_string()
            } else {
                dst_key.or(di.last_node_key).map(|k| k.short_string()).unwrap_or_default()
            };
            self.log_disco(format_args!(
                "disco: {}<-{} ({}, {}) got ping tx={}",
                self.disco_short,
                di.short,
                who,
                src,
                hex::encode(&ping.tx_id[..6])
            ));
        }

        let pong_src = match src {
            SendAddr::Udp(addr) => addr,
            SendAddr::Relay(region) => SocketAddr::new(IpAddr::V4(RELAY_MAGIC_IP), region),
        };
        followups.push(DiscoFollowup::SendPong {
            dst: src,
            dst_key,
            disco: sender,
            pong: Pong {
                tx_id: ping.tx_id,
                src: pong_src,
            },
        });
    }
}

impl PathHost for ConnInner {
    fn self_node_key(&self) -> Option<NodePublic> {
        self.state.lock().public_key
    }

    fn have_private_key(&self) -> bool {
        self.have_private_key.load(Ordering::SeqCst)
    }

    fn send_disco_message(
        &self,
        dst: SendAddr,
        dst_key: NodePublic,
        dst_disco: DiscoPublic,
        msg: Message,
        verbose: bool,
    ) -> Result<bool, SendError> {
        self.send_disco(dst, Some(dst_key), dst_disco, &msg, verbose)
    }

    fn send_addr(&self, dst: SendAddr, peer: NodePublic, pkt: &[u8]) -> Result<bool, SendError> {
        self.send_addr_to(dst, Some(peer), pkt)
    }

    fn enqueue_call_me_maybe(&self, region: RegionId, peer: NodePublic, disco: DiscoPublic) {
        self.enqueue_call_me_maybe(region, peer, disco);
    }

    fn note_recv_activity(&self, peer: NodePublic) {
        if let Some(f) = &self.note_recv_activity_fn {
            f(peer);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::CandidateType;
    use crate::config::Config;
    use crate::key::DiscoPrivate;
    use crate::relay::{RelayNode, RelayRegion};

    pub(super) fn test_conn() -> Conn {
        Conn::new(Options::default()).unwrap()
    }

    fn region(id: RegionId) -> RelayRegion {
        RelayRegion {
            region_id: id,
            region_code: format!("r{}", id),
            region_name: String::new(),
            nodes: vec![RelayNode {
                name: format!("{}a", id),
                host_name: format!("relay{}.example.com", id),
                ipv4: None,
                ipv6: None,
                port: 0,
            }],
        }
    }

    fn peer_node(disco: Option<DiscoPublic>, endpoints: &[&str]) -> PeerNode {
        PeerNode {
            key: NodePrivate::generate().public(),
            disco_key: disco,
            relay: Some("127.3.3.40:1".to_string()),
            endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_new_without_runtime_fails() {
        assert!(matches!(Conn::new(Options::default()), Err(Error::NoRuntime)));
    }

    #[tokio::test]
    async fn test_receive_before_open() {
        let conn = test_conn();
        let mut buf = [0u8; 64];
        assert!(matches!(
            conn.receive_ipv4(&mut buf).await,
            Err(RecvError::NotListening)
        ));
        assert!(conn.open().unwrap() != 0);
        conn.close().await;
        assert!(matches!(conn.receive_relay(&mut buf).await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn test_parse_endpoint() {
        let conn = test_conn();
        let n = peer_node(None, &[]);
        conn.set_network_map(&NetworkMap {
            peers: vec![n.clone()],
            force_background_stun: false,
        });

        let h = conn.parse_endpoint(&n.key.to_hex()).unwrap();
        assert_eq!(h.public_key(), n.key);
        assert_eq!(h.dst_to_string(), n.key.to_hex());
        assert_eq!(&h.dst_to_bytes()[..2], b"ps");
        assert_eq!(h, conn.parse_endpoint(&n.key.to_hex()).unwrap());

        let other = NodePrivate::generate().public();
        assert!(matches!(conn.parse_endpoint(&other.to_hex()), Err(Error::UnknownPeer(_))));
        assert!(matches!(conn.parse_endpoint("zz"), Err(Error::InvalidKey(_))));
        conn.close().await;
    }

    #[tokio::test]
    async fn test_network_map_removes_peers_and_disco_info() {
        let conn = test_conn();
        let dk = DiscoPrivate::generate().public();
        let a = peer_node(Some(dk), &["10.0.0.1:1"]);
        let b = peer_node(None, &["10.0.0.2:1"]);
        conn.set_network_map(&NetworkMap {
            peers: vec![a.clone(), b.clone()],
            force_background_stun: false,
        });
        {
            let mut st = conn.inner.state.lock();
            assert_eq!(st.peer_map.node_count(), 2);
            // Legacy peer's advertised address resolves.
            assert!(st.peer_map.endpoint_for_addr(&"10.0.0.2:1".parse().unwrap()).is_some());
            conn.inner.disco_info_locked(&mut st.disco_info, dk).unwrap();
        }

        conn.set_network_map(&NetworkMap {
            peers: vec![b.clone()],
            force_background_stun: false,
        });
        let st = conn.inner.state.lock();
        assert_eq!(st.peer_map.node_count(), 1);
        assert!(st.peer_map.endpoint_for_node_key(&a.key).is_none());
        assert!(st.disco_info.is_empty());
        st.peer_map.assert_consistent();
        drop(st);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_disco_from_unknown_key_is_consumed() {
        let conn = test_conn();
        conn.set_private_key(NodePrivate::generate());
        let stranger = DiscoPrivate::generate();
        let shared = stranger.shared(&conn.disco_public_key()).unwrap();
        let pkt = disco::encode_packet(
            &stranger.public(),
            &shared,
            &Message::Ping(Ping {
                tx_id: disco::new_tx_id(),
                node_key: None,
            }),
        )
        .unwrap();

        let src: SocketAddr = "10.0.0.1:1".parse().unwrap();
        assert!(conn.inner.handle_disco_message(&pkt, SendAddr::Udp(src), None));
        assert!(!conn.inner.handle_disco_message(b"not disco", SendAddr::Udp(src), None));
        assert_eq!(conn.metrics().disco_drop_unknown_key_total.load(Ordering::Relaxed), 1);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_ping_adds_candidate_and_maps_addr() {
        let conn = test_conn();
        conn.set_private_key(NodePrivate::generate());
        let peer_disco = DiscoPrivate::generate();
        let n = peer_node(Some(peer_disco.public()), &[]);
        conn.set_network_map(&NetworkMap {
            peers: vec![n.clone()],
            force_background_stun: false,
        });

        let shared = peer_disco.shared(&conn.disco_public_key()).unwrap();
        let pkt = disco::encode_packet(
            &peer_disco.public(),
            &shared,
            &Message::Ping(Ping {
                tx_id: disco::new_tx_id(),
                node_key: Some(n.key),
            }),
        )
        .unwrap();
        let src: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(conn.inner.handle_disco_message(&pkt, SendAddr::Udp(src), None));

        let st = conn.inner.state.lock();
        let ep = st.peer_map.endpoint_for_addr(&src).unwrap();
        assert_eq!(ep.public_key(), n.key);
        assert_eq!(ep.status().candidates, 1);
        drop(st);
        assert_eq!(conn.metrics().disco_recv_ping_total.load(Ordering::Relaxed), 1);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_call_me_maybe_over_udp_rejected() {
        let conn = test_conn();
        conn.set_private_key(NodePrivate::generate());
        let peer_disco = DiscoPrivate::generate();
        let n = peer_node(Some(peer_disco.public()), &[]);
        conn.set_network_map(&NetworkMap {
            peers: vec![n.clone()],
            force_background_stun: false,
        });

        let shared = peer_disco.shared(&conn.disco_public_key()).unwrap();
        let pkt = disco::encode_packet(
            &peer_disco.public(),
            &shared,
            &Message::CallMeMaybe(CallMeMaybe {
                my_number: vec!["203.0.113.1:41641".parse().unwrap()],
            }),
        )
        .unwrap();
        let src: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(conn.inner.handle_disco_message(&pkt, SendAddr::Udp(src), None));

        let ep = conn.inner.state.lock().peer_map.endpoint_for_node_key(&n.key).unwrap();
        assert_eq!(ep.status().candidates, 0);
        conn.close().await;
    }

    fn sealed(from: &DiscoPrivate, conn: &Conn, msg: Message) -> Vec<u8> {
        let shared = from.shared(&conn.disco_public_key()).unwrap();
        disco::encode_packet(&from.public(), &shared, &msg).unwrap()
    }

    #[tokio::test]
    async fn test_call_me_maybe_via_relay_probes() {
        let conn = test_conn();
        conn.set_private_key(NodePrivate::generate());
        let peer_disco = DiscoPrivate::generate();
        let n = peer_node(Some(peer_disco.public()), &[]);
        conn.set_network_map(&NetworkMap {
            peers: vec![n.clone()],
            force_background_stun: false,
        });

        let pkt = sealed(
            &peer_disco,
            &conn,
            Message::CallMeMaybe(CallMeMaybe {
                my_number: vec!["127.0.0.1:9".parse().unwrap(), "127.0.0.1:10".parse().unwrap()],
            }),
        );
        assert!(conn.inner.handle_disco_message(&pkt, SendAddr::Relay(1), Some(n.key)));

        let ep = conn.inner.state.lock().peer_map.endpoint_for_node_key(&n.key).unwrap();
        assert_eq!(ep.status().candidates, 2);
        assert_eq!(ep.outstanding_pings(), 2);
        assert_eq!(conn.metrics().disco_recv_call_me_maybe_total.load(Ordering::Relaxed), 1);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_call_me_maybe_via_relay_wrong_disco_key() {
        let conn = test_conn();
        conn.set_private_key(NodePrivate::generate());
        let a_disco = DiscoPrivate::generate();
        let b_disco = DiscoPrivate::generate();
        let a = peer_node(Some(a_disco.public()), &[]);
        let b = peer_node(Some(b_disco.public()), &[]);
        conn.set_network_map(&NetworkMap {
            peers: vec![a.clone(), b.clone()],
            force_background_stun: false,
        });

        // Sealed by b's disco key but forwarded as coming from a.
        let pkt = sealed(
            &b_disco,
            &conn,
            Message::CallMeMaybe(CallMeMaybe {
                my_number: vec!["127.0.0.1:9".parse().unwrap()],
            }),
        );
        assert!(conn.inner.handle_disco_message(&pkt, SendAddr::Relay(1), Some(a.key)));

        let st = conn.inner.state.lock();
        for key in [a.key, b.key] {
            assert_eq!(st.peer_map.endpoint_for_node_key(&key).unwrap().status().candidates, 0);
        }
        drop(st);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_relay_ping_needs_matching_disco_key() {
        let conn = test_conn();
        conn.set_private_key(NodePrivate::generate());
        let a_disco = DiscoPrivate::generate();
        let b_disco = DiscoPrivate::generate();
        let a = peer_node(Some(a_disco.public()), &[]);
        let b = peer_node(Some(b_disco.public()), &[]);
        conn.set_network_map(&NetworkMap {
            peers: vec![a.clone(), b.clone()],
            force_background_stun: false,
        });
        let ping = Ping {
            tx_id: disco::new_tx_id(),
            node_key: None,
        };

        let mut st = conn.inner.state.lock();
        conn.inner.disco_info_locked(&mut st.disco_info, b_disco.public()).unwrap();
        let mut followups = Vec::new();
        conn.inner
            .handle_ping_locked(&mut st, &ping, SendAddr::Relay(1), b_disco.public(), Some(a.key), &mut followups);
        assert!(followups.is_empty());

        conn.inner
            .handle_ping_locked(&mut st, &ping, SendAddr::Relay(1), b_disco.public(), Some(b.key), &mut followups);
        assert!(matches!(
            followups.as_slice(),
            [DiscoFollowup::SendPong { dst_key: Some(k), .. }] if *k == b.key
        ));
        drop(st);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_legacy_peer_gains_disco_key_then_probes() {
        let conn = test_conn();
        conn.set_private_key(NodePrivate::generate());
        let mut n = peer_node(None, &["127.0.0.1:9", "127.0.0.1:10"]);
        conn.set_network_map(&NetworkMap {
            peers: vec![n.clone()],
            force_background_stun: false,
        });
        let h = conn.parse_endpoint(&n.key.to_hex()).unwrap();
        let _ = conn.send(&h, b"data");
        assert_eq!(h.0.outstanding_pings(), 0);

        n.disco_key = Some(DiscoPrivate::generate().public());
        conn.set_network_map(&NetworkMap {
            peers: vec![n.clone()],
            force_background_stun: false,
        });
        // The socket was bound moments ago and may not be writable yet;
        // pings must still go out.
        let _ = conn.send(&h, b"data");
        assert_eq!(h.0.outstanding_pings(), 2);
        assert_eq!(conn.metrics().disco_sent_ping_total.load(Ordering::Relaxed), 2);
        assert!(h.0.heartbeat_active());
        conn.close().await;
    }

    #[tokio::test]
    async fn test_send_after_zero_key_stays_silent() {
        let conn = test_conn();
        conn.set_private_key(NodePrivate::generate());
        let n = peer_node(Some(DiscoPrivate::generate().public()), &["127.0.0.1:9"]);
        conn.set_network_map(&NetworkMap {
            peers: vec![n.clone()],
            force_background_stun: false,
        });
        let h = conn.parse_endpoint(&n.key.to_hex()).unwrap();
        let _ = conn.send(&h, b"data");
        assert!(h.0.heartbeat_active());

        conn.set_private_key(NodePrivate::zero());
        assert!(!h.0.heartbeat_active());
        assert!(matches!(conn.send(&h, b"data"), Err(SendError::NoPrivateKey)));
        assert!(!h.0.heartbeat_active());
        assert_eq!(h.0.outstanding_pings(), 0);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_set_endpoints_suppressed_without_stun_or_relay_map() {
        let conn = test_conn();
        let local = vec![Candidate::new("192.168.1.2:41641".parse().unwrap(), CandidateType::Local)];

        let (changed, _) = conn.inner.set_endpoints(&local);
        assert!(!changed);
        assert!(conn.status().self_endpoints.is_empty());

        let mut with_stun = local.clone();
        with_stun.push(Candidate::new("198.51.100.7:41641".parse().unwrap(), CandidateType::Stun));
        assert!(conn.inner.set_endpoints(&with_stun).0);

        // Same set in another order is not a change.
        with_stun.reverse();
        assert!(!conn.inner.set_endpoints(&with_stun).0);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_stale_endpoints_defer_call_me_maybe() {
        let conn = Conn::new(Options::with_config(Config {
            always_use_relay: true,
            ..Default::default()
        }))
        .unwrap();
        let peer = NodePrivate::generate().public();
        let disco = DiscoPrivate::generate().public();

        conn.inner.enqueue_call_me_maybe(1, peer, disco);
        assert!(conn.inner.state.lock().on_endpoint_refreshed.contains_key(&peer));

        let stun = vec![Candidate::new("198.51.100.7:41641".parse().unwrap(), CandidateType::Stun)];
        let (_, refreshed) = conn.inner.set_endpoints(&stun);
        assert_eq!(refreshed, vec![(peer, (1, disco))]);
        assert!(conn.inner.state.lock().on_endpoint_refreshed.is_empty());
        conn.close().await;
    }

    #[tokio::test]
    async fn test_relay_map_redefinition_clears_home() {
        let conn = test_conn();
        let mut map = RelayMap::default();
        map.regions.insert(1, region(1));
        map.regions.insert(2, region(2));
        conn.set_relay_map(map.clone());
        conn.inner.state.lock().my_relay = Some(2);

        map.regions.insert(2, region(20));
        conn.set_relay_map(map);
        assert_eq!(conn.status().home_relay, None);
        conn.close().await;
    }
}
