//! Relay connection pool
//!
//! One [`ActiveRelay`] per region with an open client. Each has a reader
//! task demultiplexing server frames and a writer task draining a bounded
//! queue. A region's next generation of tasks waits for the previous
//! generation to finish, so two readers never share a client's region.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;

use super::{
    ConnInner, ConnState, BUFFERED_RELAY_WRITES_BEFORE_DROP, RELAY_CLEAN_STALE_INTERVAL,
    RELAY_INACTIVE_CLEANUP_TIME, RELAY_REBIND_PING_TIMEOUT,
};
use crate::key::NodePublic;
use crate::metrics::Metrics;
use crate::relay::{RegionId, RelayBackoff, RelayClient, RelayError, RelayMessage};
use crate::status::RelayStatus;
use crate::timer::Timer;

/// A packet queued for a relay writer
pub(super) struct RelayWrite {
    pub(super) peer: NodePublic,
    pub(super) pkt: Vec<u8>,
}

/// A packet a relay reader handed to the data plane
pub(super) struct RelayReadResult {
    pub(super) region: RegionId,
    pub(super) src: NodePublic,
    pub(super) data: Vec<u8>,
}

/// Region a peer was last heard on, valid for one connection generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct RelayRoute {
    pub(super) region: RegionId,
    pub(super) gen: u64,
}

pub(super) struct ActiveRelay {
    pub(super) client: Arc<dyn RelayClient>,
    pub(super) cancel: CancellationToken,
    pub(super) write_tx: mpsc::Sender<RelayWrite>,
    pub(super) tracker: TaskTracker,
    pub(super) gen: u64,
    pub(super) create_time: Instant,
    pub(super) last_write: Instant,
    pub(super) connected: bool,
    pub(super) health: Option<String>,
}

impl ConnInner {
    pub(super) fn relay_write_chan(
        &self,
        region: RegionId,
        peer: Option<NodePublic>,
    ) -> Option<mpsc::Sender<RelayWrite>> {
        let mut st = self.state.lock();
        self.relay_write_chan_locked(&mut st, region, peer)
    }

    /// Write queue for `region`, dialing it if needed. `peer` is the node
    /// being written to, if any; its route hint may pick another region.
    pub(super) fn relay_write_chan_locked(
        &self,
        st: &mut ConnState,
        region: RegionId,
        peer: Option<NodePublic>,
    ) -> Option<mpsc::Sender<RelayWrite>> {
        if self.network_down() || st.relay_map.is_empty() || st.closed || st.private_key.is_zero() {
            return None;
        }
        let now = Instant::now();

        if let Some(ad) = st.active_relay.get_mut(&region) {
            ad.last_write = now;
            return Some(ad.write_tx.clone());
        }

        if !self.config.disable_relay_route {
            if let Some(peer) = peer {
                if let Some(route) = st.relay_route.get(&peer).copied() {
                    if let Some(ad) = st.active_relay.get_mut(&route.region) {
                        if ad.gen == route.gen {
                            ad.last_write = now;
                            let tx = ad.write_tx.clone();
                            if st.peer_last_relay.insert(peer, route.region) != Some(route.region) {
                                log::info!(
                                    "relay route for {} via relay-{} instead of home relay-{}",
                                    peer.short_string(),
                                    route.region,
                                    region
                                );
                            }
                            return Some(tx);
                        }
                    }
                }
            }
        }

        let Some(region_def) = st.relay_map.region(region).cloned() else {
            log::warn!("relay-{} not in relay map", region);
            return None;
        };

        let why = match peer {
            Some(peer) => peer.short_string(),
            None => "home-keep-alive".to_string(),
        };
        log::info!("adding connection to relay-{} for {}", region, why);

        let client = match self.relay_dialer.new_client(&st.private_key, &region_def) {
            Ok(client) => client,
            Err(e) => {
                log::warn!("relay-{}: {}", region, e);
                return None;
            }
        };
        let this = self.self_ref.upgrade()?;
        Metrics::inc(&self.metrics.relay_dial_total);
        client.note_preferred(st.my_relay == Some(region));

        let cancel = self.spawner.token().child_token();
        let (write_tx, write_rx) = mpsc::channel(BUFFERED_RELAY_WRITES_BEFORE_DROP);
        let gen = st.next_relay_gen;
        st.next_relay_gen += 1;

        let tracker = TaskTracker::new();
        let gate = st.prev_relay.insert(region, tracker.clone());

        st.active_relay.insert(
            region,
            ActiveRelay {
                client: client.clone(),
                cancel: cancel.clone(),
                write_tx: write_tx.clone(),
                tracker: tracker.clone(),
                gen,
                create_time: now,
                last_write: now,
                connected: false,
                health: None,
            },
        );
        self.metrics
            .relay_active
            .store(st.active_relay.len() as u64, Ordering::Relaxed);

        self.spawner.spawn(this.clone().run_relay_reader(
            region,
            gen,
            client.clone(),
            cancel.clone(),
            gate.clone(),
            tracker.token(),
        ));
        self.spawner
            .spawn(this.run_relay_writer(region, client, write_rx, cancel, gate, tracker.token()));

        if st.my_relay != Some(region) {
            self.schedule_clean_stale_relays_locked(st);
        }
        self.log_active_relays_locked(st);
        self.notify_relay_active();
        Some(write_tx)
    }

    pub(super) fn close_relay_locked(&self, st: &mut ConnState, region: RegionId, why: &str) {
        let Some(ad) = st.active_relay.remove(&region) else {
            return;
        };
        log::info!(
            "closing connection to relay-{} ({}), age {}s",
            region,
            why,
            ad.create_time.elapsed().as_secs()
        );
        ad.cancel.cancel();
        ad.tracker.close();
        st.relay_route.retain(|_, r| r.region != region);
        self.metrics
            .relay_active
            .store(st.active_relay.len() as u64, Ordering::Relaxed);
        self.log_active_relays_locked(st);
        self.notify_relay_active();
    }

    pub(super) fn close_all_relays_locked(&self, st: &mut ConnState, why: &str) {
        if st.active_relay.is_empty() {
            return;
        }
        let regions: Vec<RegionId> = st.active_relay.keys().copied().collect();
        for region in regions {
            self.close_relay_locked(st, region, why);
        }
    }

    pub(super) fn relay_statuses_locked(&self, st: &ConnState) -> Vec<RelayStatus> {
        let now = Instant::now();
        st.active_relay
            .iter()
            .map(|(region, ad)| RelayStatus {
                region: *region,
                home: st.my_relay == Some(*region),
                age: now.saturating_duration_since(ad.create_time),
                idle: now.saturating_duration_since(ad.last_write),
                connected: ad.connected,
                health: ad.health.clone(),
            })
            .collect()
    }

    pub(super) fn log_active_relays_locked(&self, st: &ConnState) {
        let statuses = self.relay_statuses_locked(st);
        let list: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
        log::info!("{} active relay conns: {}", statuses.len(), list.join(" "));
    }

    fn notify_relay_active(&self) {
        if let Some(f) = self.relay_active_fn.clone() {
            self.spawner.spawn(async move { f() });
        }
    }

    /// Make `region` home. Returns false when relays are disabled.
    pub(super) fn set_nearest_relay_locked(&self, st: &mut ConnState, region: RegionId) -> bool {
        if st.relay_map.is_empty() {
            st.my_relay = None;
            return false;
        }
        if st.my_relay == Some(region) {
            return true;
        }
        st.my_relay = Some(region);
        let code = st
            .relay_map
            .region(region)
            .map(|r| r.region_code.clone())
            .unwrap_or_default();
        log::info!("home is now relay-{} ({})", region, code);

        for (r, ad) in &st.active_relay {
            ad.client.note_preferred(*r == region);
        }
        self.relay_write_chan_locked(st, region, None);
        true
    }

    // ------------------------------------------------------------------------
    // Route hints
    // ------------------------------------------------------------------------

    fn add_relay_route(&self, peer: NodePublic, region: RegionId, gen: u64) {
        let mut st = self.state.lock();
        if st.active_relay.get(&region).map(|ad| ad.gen) != Some(gen) {
            return;
        }
        st.relay_route.insert(peer, RelayRoute { region, gen });
    }

    fn remove_relay_route(&self, peer: NodePublic, region: RegionId, gen: u64) {
        let mut st = self.state.lock();
        if st.relay_route.get(&peer) == Some(&RelayRoute { region, gen }) {
            st.relay_route.remove(&peer);
        }
    }

    fn note_relay_connected(&self, region: RegionId, gen: u64, connected: bool) {
        let mut st = self.state.lock();
        match st.active_relay.get_mut(&region) {
            Some(ad) if ad.gen == gen => ad.connected = connected,
            _ => return,
        }
        if !connected {
            st.relay_route.retain(|_, r| *r != RelayRoute { region, gen });
        }
    }

    fn set_relay_health(&self, region: RegionId, gen: u64, problem: Option<String>) {
        let mut st = self.state.lock();
        if let Some(ad) = st.active_relay.get_mut(&region) {
            if ad.gen == gen {
                ad.health = problem;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Pumps
    // ------------------------------------------------------------------------

    async fn run_relay_reader(
        self: Arc<Self>,
        region: RegionId,
        gen: u64,
        client: Arc<dyn RelayClient>,
        cancel: CancellationToken,
        gate: Option<TaskTracker>,
        _running: TaskTrackerToken,
    ) {
        if !wait_gate(gate, &cancel).await {
            client.close().await;
            return;
        }

        let mut backoff = RelayBackoff::new();
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = client.recv() => msg,
            };
            let msg = match msg {
                Ok(msg) => {
                    backoff.reset();
                    msg
                }
                Err(e) => {
                    self.note_relay_connected(region, gen, false);
                    if matches!(e, RelayError::Closed) || cancel.is_cancelled() {
                        break;
                    }
                    if self.network_down() {
                        log::info!("relay-{}: read error while network down: {}", region, e);
                        break;
                    }
                    log::info!("relay-{}: read error: {}", region, e);
                    self.re_stun("relay-recv-error");
                    if !backoff.wait(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            match msg {
                RelayMessage::ServerInfo => {
                    log::info!("relay-{} connected", region);
                    self.note_relay_connected(region, gen, true);
                }
                RelayMessage::Packet { source, data } => {
                    self.add_relay_route(source, region, gen);
                    let res = RelayReadResult {
                        region,
                        src: source,
                        data,
                    };
                    let sent = tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = self.relay_recv_tx.send(res) => sent,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
                RelayMessage::Ping(data) => {
                    let client = client.clone();
                    let cancel = cancel.clone();
                    self.spawner.spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            res = client.send_pong(data) => {
                                if let Err(e) = res {
                                    log::info!("relay-{}: pong error: {}", region, e);
                                }
                            }
                        }
                    });
                }
                RelayMessage::KeepAlive => {}
                RelayMessage::Health { problem } => {
                    if let Some(problem) = &problem {
                        log::warn!("relay-{} health: {}", region, problem);
                    }
                    self.set_relay_health(region, gen, problem);
                }
                RelayMessage::PeerGone(peer) => self.remove_relay_route(peer, region, gen),
                RelayMessage::PeerPresent(peer) => self.add_relay_route(peer, region, gen),
            }
        }

        client.close().await;
        log::debug!("relay-{} reader exited", region);
    }

    async fn run_relay_writer(
        self: Arc<Self>,
        region: RegionId,
        client: Arc<dyn RelayClient>,
        mut rx: mpsc::Receiver<RelayWrite>,
        cancel: CancellationToken,
        gate: Option<TaskTracker>,
        _running: TaskTrackerToken,
    ) {
        if !wait_gate(gate, &cancel).await {
            return;
        }
        loop {
            let write = tokio::select! {
                _ = cancel.cancelled() => break,
                write = rx.recv() => match write {
                    Some(write) => write,
                    None => break,
                },
            };
            let res = tokio::select! {
                _ = cancel.cancelled() => break,
                res = client.send(write.peer, write.pkt) => res,
            };
            if let Err(e) = res {
                Metrics::inc(&self.metrics.send_relay_error_total);
                log::info!("relay-{}: write to {} failed: {}", region, write.peer.short_string(), e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    fn schedule_clean_stale_relays_locked(&self, st: &mut ConnState) {
        if st.relay_cleanup_timer.as_ref().map_or(false, |t| t.is_pending()) {
            return;
        }
        let weak = self.self_ref.clone();
        st.relay_cleanup_timer = Some(Timer::after(&self.spawner, RELAY_CLEAN_STALE_INTERVAL, move || {
            if let Some(this) = weak.upgrade() {
                this.clean_stale_relays();
            }
        }));
    }

    fn clean_stale_relays(&self) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.relay_cleanup_timer = None;
        if st.closed {
            return;
        }

        let now = Instant::now();
        let stale: Vec<RegionId> = st
            .active_relay
            .iter()
            .filter(|(region, ad)| {
                st.my_relay != Some(**region)
                    && now.saturating_duration_since(ad.last_write) > RELAY_INACTIVE_CLEANUP_TIME
            })
            .map(|(region, _)| *region)
            .collect();
        for region in stale {
            self.close_relay_locked(st, region, "idle");
        }

        if st.active_relay.keys().any(|r| st.my_relay != Some(*r)) {
            self.schedule_clean_stale_relays_locked(st);
        }
    }

    /// Ping every relay after a rebind; close (and redial home) the ones
    /// that don't answer.
    pub(super) fn ping_relays_after_rebind(&self) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let clients: Vec<(RegionId, u64, Arc<dyn RelayClient>)> = {
            let st = self.state.lock();
            st.active_relay
                .iter()
                .map(|(region, ad)| (*region, ad.gen, ad.client.clone()))
                .collect()
        };

        for (region, gen, client) in clients {
            let this = this.clone();
            let token = self.spawner.token().clone();
            self.spawner.spawn(async move {
                let ok = tokio::select! {
                    _ = token.cancelled() => return,
                    res = tokio::time::timeout(RELAY_REBIND_PING_TIMEOUT, client.ping()) => {
                        matches!(res, Ok(Ok(())))
                    }
                };
                if ok {
                    return;
                }
                let mut guard = this.state.lock();
                let st = &mut *guard;
                if st.active_relay.get(&region).map(|ad| ad.gen) != Some(gen) {
                    return;
                }
                this.close_relay_locked(st, region, "rebind-ping-fail");
                if st.my_relay == Some(region) {
                    this.relay_write_chan_locked(st, region, None);
                }
            });
        }
    }
}

/// Wait for the previous generation of a region's tasks. False if
/// cancelled first.
async fn wait_gate(gate: Option<TaskTracker>, cancel: &CancellationToken) -> bool {
    let Some(gate) = gate else {
        return true;
    };
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = gate.wait() => true,
    }
}
