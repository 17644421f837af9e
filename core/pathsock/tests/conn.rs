//! End-to-end tests: real loopback UDP sockets, in-memory relay and prober.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use pathsock::candidate::Candidate;
use pathsock::endpoint::{DISCO_PING_INTERVAL, HEARTBEAT_INTERVAL};
use pathsock::key::{DiscoPrivate, NodePrivate, NodePublic};
use pathsock::netcheck::{NetChecker, NetcheckError, Report};
use pathsock::netmap::{relay_addr_string, NetworkMap, PeerNode};
use pathsock::relay::{RegionId, RelayClient, RelayDialer, RelayError, RelayMap, RelayMessage, RelayNode, RelayRegion};
use pathsock::{Config, Conn, Options, PeerHandle};

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .is_test(true)
            .try_init();
    });
}

// ============================================================================
// In-memory relay
// ============================================================================

/// Forwards packets between clients registered in the same region
#[derive(Default)]
struct RelayHub {
    clients: Mutex<HashMap<(RegionId, NodePublic), (u64, mpsc::UnboundedSender<RelayMessage>)>>,
    next_id: AtomicU64,
}

struct HubClient {
    id: u64,
    region: RegionId,
    key: NodePublic,
    hub: Arc<RelayHub>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<RelayMessage>>,
}

#[async_trait]
impl RelayClient for HubClient {
    async fn recv(&self) -> Result<RelayMessage, RelayError> {
        self.inbox.lock().await.recv().await.ok_or(RelayError::Closed)
    }

    async fn send(&self, dst: NodePublic, pkt: Vec<u8>) -> Result<(), RelayError> {
        let clients = self.hub.clients.lock();
        if let Some((_, tx)) = clients.get(&(self.region, dst)) {
            let _ = tx.send(RelayMessage::Packet {
                source: self.key,
                data: pkt,
            });
        }
        Ok(())
    }

    async fn send_pong(&self, _data: [u8; 8]) -> Result<(), RelayError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), RelayError> {
        Ok(())
    }

    fn note_preferred(&self, _preferred: bool) {}

    async fn close(&self) {
        let mut clients = self.hub.clients.lock();
        if clients.get(&(self.region, self.key)).map(|(id, _)| *id) == Some(self.id) {
            clients.remove(&(self.region, self.key));
        }
    }
}

struct HubDialer {
    hub: Arc<RelayHub>,
}

impl RelayDialer for HubDialer {
    fn new_client(
        &self,
        private_key: &NodePrivate,
        region: &RelayRegion,
    ) -> Result<Arc<dyn RelayClient>, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(RelayMessage::ServerInfo);
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        let key = private_key.public();
        self.hub
            .clients
            .lock()
            .insert((region.region_id, key), (id, tx));
        Ok(Arc::new(HubClient {
            id,
            region: region.region_id,
            key,
            hub: self.hub.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        }))
    }
}

// ============================================================================
// Scripted prober
// ============================================================================

struct ScriptedNetChecker {
    report: Report,
}

#[async_trait]
impl NetChecker for ScriptedNetChecker {
    async fn get_report(&self, _relay_map: &RelayMap) -> Result<Report, NetcheckError> {
        Ok(self.report.clone())
    }
}

fn report(global_v4: Option<&str>) -> Report {
    Report {
        udp: true,
        ipv4: true,
        ipv4_can_send: true,
        preferred_relay: Some(1),
        global_v4: global_v4.map(|s| s.parse().unwrap()),
        ..Default::default()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn relay_map(ids: &[RegionId]) -> RelayMap {
    let mut map = RelayMap::default();
    for id in ids {
        map.regions.insert(
            *id,
            RelayRegion {
                region_id: *id,
                region_code: format!("r{}", id),
                region_name: String::new(),
                nodes: vec![RelayNode {
                    name: format!("{}a", id),
                    host_name: format!("relay{}.example.com", id),
                    ipv4: None,
                    ipv6: None,
                    port: 0,
                }],
            },
        );
    }
    map
}

fn options(hub: &Arc<RelayHub>) -> Options {
    Options {
        net_checker: Arc::new(ScriptedNetChecker { report: report(None) }),
        relay_dialer: Arc::new(HubDialer { hub: hub.clone() }),
        ..Options::with_config(Config::default())
    }
}

struct Node {
    conn: Arc<Conn>,
    key: NodePrivate,
    received: mpsc::UnboundedReceiver<(Vec<u8>, PeerHandle)>,
}

impl Node {
    fn start(opts: Options) -> Self {
        let conn = Arc::new(Conn::new(opts).unwrap());
        conn.open().unwrap();
        let key = NodePrivate::generate();
        conn.set_private_key(key.clone());

        let (tx, received) = mpsc::unbounded_channel();
        for family in 0..3 {
            let conn = conn.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 2048];
                loop {
                    let res = match family {
                        0 => conn.receive_ipv4(&mut buf).await,
                        1 => conn.receive_ipv6(&mut buf).await,
                        _ => conn.receive_relay(&mut buf).await,
                    };
                    match res {
                        Ok((n, from)) => {
                            let _ = tx.send((buf[..n].to_vec(), from));
                        }
                        Err(_) => break,
                    }
                }
            });
        }
        Self { conn, key, received }
    }

    fn public(&self) -> NodePublic {
        self.key.public()
    }

    fn as_peer(&self, relay: RegionId) -> PeerNode {
        PeerNode {
            key: self.public(),
            disco_key: Some(self.conn.disco_public_key()),
            relay: Some(relay_addr_string(relay)),
            endpoints: vec![format!("127.0.0.1:{}", self.conn.local_port())],
        }
    }
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let res = tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(res.is_ok(), "timed out waiting for {}", what);
}

/// A disco-capable peer whose advertised address never answers
fn silent_peer(relay: RegionId, port: u16) -> PeerNode {
    PeerNode {
        key: NodePrivate::generate().public(),
        disco_key: Some(DiscoPrivate::generate().public()),
        relay: Some(relay_addr_string(relay)),
        endpoints: vec![format!("127.0.0.1:{}", port)],
    }
}

fn heartbeating(conn: &Conn, peers: &[&PeerNode]) -> usize {
    let status = conn.status();
    peers
        .iter()
        .filter(|p| status.peer(&p.key).map_or(false, |s| s.heartbeat))
        .count()
}

fn legacy_peer(relay: RegionId, endpoints: &[String]) -> PeerNode {
    PeerNode {
        key: NodePrivate::generate().public(),
        disco_key: None,
        relay: Some(relay_addr_string(relay)),
        endpoints: endpoints.to_vec(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_nodes_find_direct_path() {
    init_logging();
    let hub = Arc::new(RelayHub::default());
    let a = Node::start(options(&hub));
    let mut b = Node::start(options(&hub));

    for node in [&a, &b] {
        node.conn.set_relay_map(relay_map(&[1]));
    }
    for node in [&a, &b] {
        let conn = node.conn.clone();
        wait_for("home relay", move || conn.relay_count() == 1).await;
    }
    a.conn.set_network_map(&NetworkMap {
        peers: vec![b.as_peer(1)],
        force_background_stun: false,
    });
    b.conn.set_network_map(&NetworkMap {
        peers: vec![a.as_peer(1)],
        force_background_stun: false,
    });
    a.conn.update_peers(HashSet::from([b.public()]));
    b.conn.update_peers(HashSet::from([a.public()]));

    // No path confirmed yet: the first packet goes via relay and starts
    // probing the advertised address.
    let to_b = a.conn.parse_endpoint(&b.public().to_hex()).unwrap();
    a.conn.send(&to_b, b"hello").unwrap();

    let (data, from) = tokio::time::timeout(Duration::from_secs(10), b.received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data, b"hello");
    assert_eq!(from.public_key(), a.public());

    let b_addr: SocketAddr = format!("127.0.0.1:{}", b.conn.local_port()).parse().unwrap();
    let status_conn = a.conn.clone();
    let b_key = b.public();
    wait_for("direct path to b", move || {
        status_conn.status().peer(&b_key).and_then(|p| p.cur_addr) == Some(b_addr)
    })
    .await;

    // Once direct, data flows over UDP.
    a.conn.send(&to_b, b"direct").unwrap();
    let (data, _) = tokio::time::timeout(Duration::from_secs(10), b.received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data, b"direct");
    assert!(a.conn.metrics().send_udp_total.load(Ordering::Relaxed) > 0);
    assert!(b.conn.metrics().disco_recv_ping_total.load(Ordering::Relaxed) > 0);

    // A caller-driven ping is answered too.
    let res = tokio::time::timeout(Duration::from_secs(10), a.conn.ping(&b.public()))
        .await
        .unwrap()
        .unwrap();
    assert!(res.err.is_none(), "ping failed: {:?}", res.err);
    assert!(res.latency.is_some());

    a.conn.close().await;
    b.conn.close().await;
    assert_eq!(a.conn.task_count(), 0);
    assert_eq!(b.conn.task_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zero_private_key_stops_everything() {
    init_logging();
    let hub = Arc::new(RelayHub::default());
    let a = Node::start(options(&hub));
    a.conn.set_relay_map(relay_map(&[1]));
    let conn = a.conn.clone();
    wait_for("home relay", move || conn.relay_count() == 1).await;

    let peer = legacy_peer(1, &[]);
    let c = silent_peer(1, 9);
    let d = silent_peer(1, 10);
    a.conn.set_network_map(&NetworkMap {
        peers: vec![peer.clone(), c.clone(), d.clone()],
        force_background_stun: false,
    });
    assert!(a.conn.status().self_key.is_some());

    for p in [&c, &d] {
        let h = a.conn.parse_endpoint(&p.key.to_hex()).unwrap();
        a.conn.send(&h, b"data").unwrap();
    }
    let metrics = a.conn.metrics();
    let m = metrics.clone();
    wait_for("probes", move || m.disco_sent_ping_total.load(Ordering::Relaxed) >= 2).await;
    assert_eq!(heartbeating(&a.conn, &[&c, &d]), 2);

    a.conn.set_private_key(NodePrivate::zero());
    assert_eq!(a.conn.relay_count(), 0);
    assert!(a.conn.status().self_key.is_none());
    assert_eq!(heartbeating(&a.conn, &[&c, &d]), 0);

    let res = a.conn.ping(&peer.key).await.unwrap();
    assert_eq!(res.err.as_deref(), Some("local node stopped"));

    // Later sends are refused and re-arm nothing; no ping leaves for
    // longer than a probe round plus a heartbeat.
    let pings = metrics.disco_sent_ping_total.load(Ordering::Relaxed);
    for p in [&c, &d] {
        let h = a.conn.parse_endpoint(&p.key.to_hex()).unwrap();
        assert!(matches!(a.conn.send(&h, b"data"), Err(pathsock::SendError::NoPrivateKey)));
    }
    tokio::time::sleep(DISCO_PING_INTERVAL + HEARTBEAT_INTERVAL).await;
    assert_eq!(heartbeating(&a.conn, &[&c, &d]), 0);
    assert_eq!(metrics.disco_sent_ping_total.load(Ordering::Relaxed), pings);

    // Re-discovery requests are ignored once a key was seen and zeroed.
    let before = a.conn.metrics().restun_total.load(Ordering::Relaxed);
    a.conn.re_stun("test");
    assert_eq!(a.conn.metrics().restun_total.load(Ordering::Relaxed), before);

    a.conn.close().await;
    assert_eq!(a.conn.task_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_waits_for_relays_and_timers() {
    init_logging();
    let hub = Arc::new(RelayHub::default());
    let a = Node::start(options(&hub));
    a.conn.set_relay_map(relay_map(&[1, 2, 3]));
    let c = silent_peer(2, 9);
    let d = silent_peer(3, 10);
    a.conn.set_network_map(&NetworkMap {
        peers: vec![c.clone(), d.clone()],
        force_background_stun: false,
    });
    a.conn.update_peers(HashSet::from([c.key, d.key]));

    // No direct path answers, so data rides each peer's home relay while
    // both heartbeats keep probing.
    for peer in [&c, &d] {
        let h = a.conn.parse_endpoint(&peer.key.to_hex()).unwrap();
        let _ = a.conn.send(&h, b"via relay");
    }
    let conn = a.conn.clone();
    wait_for("three relays", move || conn.relay_count() == 3).await;
    assert_eq!(heartbeating(&a.conn, &[&c, &d]), 2);
    assert!(a.conn.task_count() > 0);

    a.conn.close().await;
    assert_eq!(a.conn.relay_count(), 0);
    assert_eq!(a.conn.task_count(), 0);

    // Nothing fires after close returned.
    let pings = a.conn.metrics().disco_sent_ping_total.load(Ordering::Relaxed);
    tokio::time::sleep(HEARTBEAT_INTERVAL + Duration::from_millis(500)).await;
    assert_eq!(a.conn.metrics().disco_sent_ping_total.load(Ordering::Relaxed), pings);
    assert_eq!(a.conn.task_count(), 0);

    let h = a.conn.parse_endpoint(&c.key.to_hex());
    assert!(h.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_legacy_peer_direct_packet_resolves() {
    init_logging();
    let hub = Arc::new(RelayHub::default());
    let mut a = Node::start(options(&hub));

    let legacy_sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let legacy_addr = legacy_sock.local_addr().unwrap();
    let legacy = legacy_peer(1, &[legacy_addr.to_string()]);
    a.conn.set_network_map(&NetworkMap {
        peers: vec![legacy.clone()],
        force_background_stun: false,
    });

    let a_addr: SocketAddr = format!("127.0.0.1:{}", a.conn.local_port()).parse().unwrap();
    legacy_sock.send_to(b"legacy data", a_addr).await.unwrap();

    let (data, from) = tokio::time::timeout(Duration::from_secs(10), a.received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data, b"legacy data");
    assert_eq!(from.public_key(), legacy.key);
    assert!(a.conn.last_recv_activity_of_node_key(&legacy.key).is_some());
    assert!(!a.conn.peer_has_disco_key(&legacy.key));

    a.conn.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_endpoints_reported_only_on_change() {
    init_logging();
    let hub = Arc::new(RelayHub::default());
    let calls: Arc<Mutex<Vec<Vec<Candidate>>>> = Arc::default();
    let recorded = calls.clone();
    let opts = Options {
        net_checker: Arc::new(ScriptedNetChecker {
            report: report(Some("198.51.100.7:41641")),
        }),
        endpoints_fn: Some(Arc::new(move |eps: &[Candidate]| recorded.lock().push(eps.to_vec()))),
        ..options(&hub)
    };
    let a = Node::start(opts);
    let metrics = a.conn.metrics();

    // No relay map: no probe runs, and local-only endpoints aren't reported.
    let m = metrics.clone();
    wait_for("first update", move || m.update_endpoints_total.load(Ordering::Relaxed) >= 1).await;
    assert!(calls.lock().is_empty());

    a.conn.set_relay_map(relay_map(&[1]));
    let m = metrics.clone();
    wait_for("second update", move || m.update_endpoints_total.load(Ordering::Relaxed) >= 2).await;
    assert_eq!(calls.lock().len(), 1);
    let stun: SocketAddr = "198.51.100.7:41641".parse().unwrap();
    assert!(calls.lock()[0].iter().any(|c| c.addr == stun));
    assert_eq!(a.conn.status().home_relay, Some(1));

    a.conn.re_stun("test");
    let m = metrics.clone();
    wait_for("third update", move || m.update_endpoints_total.load(Ordering::Relaxed) >= 3).await;
    assert_eq!(calls.lock().len(), 1);

    a.conn.close().await;
}

#[tokio::test]
async fn test_send_when_network_down() {
    let hub = Arc::new(RelayHub::default());
    let a = Node::start(options(&hub));
    let peer = legacy_peer(1, &[]);
    a.conn.set_network_map(&NetworkMap {
        peers: vec![peer.clone()],
        force_background_stun: false,
    });
    let h = a.conn.parse_endpoint(&peer.key.to_hex()).unwrap();

    a.conn.set_network_up(false);
    assert!(matches!(a.conn.send(&h, b"x"), Err(pathsock::SendError::NetworkDown)));
    a.conn.set_network_up(true);

    a.conn.close().await;
    assert!(matches!(a.conn.send(&h, b"x"), Err(pathsock::SendError::Closed)));
}
