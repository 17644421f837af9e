//! Self-endpoint discovery and re-STUN scheduling

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use super::{ConnInner, ConnState, ENDPOINTS_FRESH_ENOUGH_DURATION, NETCHECK_TIMEOUT};
use crate::candidate::{candidate_sets_equal, local_addresses, Candidate, CandidateList, CandidateType};
use crate::disco::{CallMeMaybe, Message};
use crate::endpoint::{SendAddr, SESSION_ACTIVE_TIMEOUT};
use crate::key::{DiscoPublic, NodePublic};
use crate::metrics::Metrics;
use crate::netcheck::{NetInfo, NetcheckError, Report};
use crate::relay::RegionId;
use crate::timer::Timer;

/// CallMeMaybes released by an endpoint refresh: peer, relay region, disco key
pub(super) type RefreshedPeers = Vec<(NodePublic, (RegionId, DiscoPublic))>;

impl ConnInner {
    /// Request an endpoint discovery pass, coalescing with one in flight.
    pub(super) fn re_stun(&self, why: &str) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        if st.private_key.is_zero() && st.ever_had_key {
            log::debug!("ignoring re_stun({}) with zero private key", why);
            return;
        }
        Metrics::inc(&self.metrics.restun_total);

        if st.endpoints_update_active {
            if st.want_endpoints_update.as_deref() != Some(why) {
                log::debug!("re_stun({}): endpoint update active, need another later", why);
                st.want_endpoints_update = Some(why.to_string());
            }
        } else {
            st.endpoints_update_active = true;
            self.spawn_update_endpoints(why.to_string());
        }
    }

    fn spawn_update_endpoints(&self, why: String) {
        if let Some(this) = self.self_ref.upgrade() {
            self.spawner.spawn(this.update_endpoints(why));
        }
    }

    async fn update_endpoints(self: Arc<Self>, why: String) {
        log::debug!("starting endpoint update ({})", why);
        if self.no_v4_send.load(Ordering::SeqCst) && !self.is_closed() {
            log::info!("last netcheck reported send error; rebinding");
            self.rebind();
        }

        let token = self.spawner.token().clone();
        let endpoints = tokio::select! {
            _ = token.cancelled() => None,
            eps = self.determine_endpoints() => Some(eps),
        };
        match endpoints {
            Some(Ok(eps)) => {
                let (changed, refreshed) = self.set_endpoints(&eps);
                if changed {
                    let list: Vec<String> = eps.iter().map(|c| c.to_string()).collect();
                    log::info!("endpoints changed: {}", list.join(", "));
                    if let Some(f) = &self.endpoints_fn {
                        f(&eps);
                    }
                }
                for (peer, (region, disco)) in refreshed {
                    self.enqueue_call_me_maybe(region, peer, disco);
                }
                Metrics::inc(&self.metrics.update_endpoints_total);
            }
            Some(Err(e)) => log::info!("endpoint update ({}) failed: {}", why, e),
            None => {}
        }
        self.finish_endpoint_update();
    }

    fn finish_endpoint_update(&self) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.closed {
            st.endpoints_update_active = false;
            return;
        }
        if let Some(why) = st.want_endpoints_update.take() {
            self.spawn_update_endpoints(why);
            return;
        }
        st.endpoints_update_active = false;

        if self.should_do_periodic_restun_locked(st) {
            let delay = Duration::from_millis(rand::thread_rng().gen_range(20_000..26_000));
            let weak = self.self_ref.clone();
            st.periodic_restun = Some(Timer::after(&self.spawner, delay, move || {
                if let Some(this) = weak.upgrade() {
                    this.re_stun("periodic");
                }
            }));
        } else {
            log::debug!("periodic re-STUN disabled");
            st.periodic_restun = None;
        }
    }

    fn should_do_periodic_restun_locked(&self, st: &ConnState) -> bool {
        if self.network_down() || st.peer_set.is_empty() || st.private_key.is_zero() {
            return false;
        }
        if let Some(idle_fn) = &self.idle_fn {
            let idle_for = idle_fn();
            if self.config.restun_stop_on_idle {
                log::info!("periodic re-STUN: idle for {:?}", idle_for);
            }
            if idle_for > SESSION_ACTIVE_TIMEOUT {
                return st.force_background_stun;
            }
        }
        true
    }

    /// Gather the addresses peers might reach us on, best first.
    async fn determine_endpoints(&self) -> Result<Vec<Candidate>, NetcheckError> {
        let mut list = CandidateList::new();

        if let Some(ext) = self.port_mapper.get_cached_mapping_or_start_creating() {
            list.add(ext, CandidateType::PortMapped);
            self.set_net_info_have_port_map();
        }

        let report = self.update_net_info().await?;
        if let Some(v4) = report.global_v4 {
            list.add(v4, CandidateType::Stun);
            // Hard NAT with a fixed local port: maybe a static mapping.
            let preferred = self.preferred_port.load(Ordering::SeqCst);
            if report.mapping_varies_by_dest_ip == Some(true) && preferred != 0 {
                list.add(SocketAddr::new(v4.ip(), preferred), CandidateType::Stun4LocalPort);
            }
        }
        if let Some(v6) = report.global_v6 {
            list.add(v6, CandidateType::Stun);
        }

        if !self.config.omit_local_addrs {
            if let Some(local) = self.pconn4.local_addr() {
                if local.ip().is_unspecified() {
                    let (ips, loopback) = local_addresses();
                    let ips = if ips.is_empty() && list.is_empty() { loopback } else { ips };
                    for ip in ips {
                        list.add(SocketAddr::new(ip, local.port()), CandidateType::Local);
                    }
                } else {
                    list.add(local, CandidateType::Local);
                }
            }
        }

        Ok(list.into_vec())
    }

    /// Record a discovery result. Returns whether the set changed, plus the
    /// CallMeMaybes that were waiting for fresh endpoints.
    pub(super) fn set_endpoints(&self, eps: &[Candidate]) -> (bool, RefreshedPeers) {
        let mut st = self.state.lock();
        let any_stun = eps.iter().any(|c| c.candidate_type == CandidateType::Stun);
        if !any_stun && st.relay_map.is_empty() {
            // Without relays or STUN, peers can't use what we'd report.
            log::debug!("skipping endpoint update: no STUN results and no relay map");
            return (false, Vec::new());
        }
        st.last_endpoints_time = Some(Instant::now());
        let refreshed: RefreshedPeers = st.on_endpoint_refreshed.drain().collect();
        if candidate_sets_equal(eps, &st.last_endpoints) {
            return (false, refreshed);
        }
        st.last_endpoints = eps.to_vec();
        (true, refreshed)
    }

    // ------------------------------------------------------------------------
    // Network conditions
    // ------------------------------------------------------------------------

    async fn update_net_info(&self) -> Result<Report, NetcheckError> {
        let relay_map = self.state.lock().relay_map.clone();
        if relay_map.is_empty() || self.network_down() {
            return Ok(Report::default());
        }

        let report = match tokio::time::timeout(NETCHECK_TIMEOUT, self.net_checker.get_report(&relay_map)).await {
            Ok(res) => res?,
            Err(_) => return Err(NetcheckError::Timeout),
        };
        self.no_v4.store(!report.ipv4, Ordering::SeqCst);
        self.no_v6.store(!report.ipv6, Ordering::SeqCst);
        self.no_v4_send
            .store(report.udp && !report.ipv4_can_send, Ordering::SeqCst);

        let mut ni = NetInfo::from_report(&report, self.port_mapper.have_mapping());
        let changed = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let preferred = report
                .preferred_relay
                .filter(|r| st.relay_map.region(*r).is_some())
                .or_else(|| self.pick_relay_fallback_locked(st));
            ni.preferred_relay = preferred.filter(|r| self.set_nearest_relay_locked(st, *r));
            if st.net_info_last.as_ref() != Some(&ni) {
                st.net_info_last = Some(ni.clone());
                true
            } else {
                false
            }
        };
        if changed {
            log::info!("net info changed: {:?}", ni);
            if let Some(f) = &self.net_info_fn {
                f(&ni);
            }
        }
        Ok(report)
    }

    fn set_net_info_have_port_map(&self) {
        let ni = {
            let mut st = self.state.lock();
            match st.net_info_last.as_mut() {
                Some(ni) if !ni.have_port_map => {
                    ni.have_port_map = true;
                    ni.clone()
                }
                _ => return,
            }
        };
        if let Some(f) = &self.net_info_fn {
            f(&ni);
        }
    }

    /// Home relay when no report names one: keep the current home, else
    /// the region most peers call home, else a per-connection pick.
    pub(super) fn pick_relay_fallback_locked(&self, st: &ConnState) -> Option<RegionId> {
        let ids = st.relay_map.region_ids();
        if ids.is_empty() {
            return None;
        }
        if let Some(home) = st.my_relay {
            return Some(home);
        }

        let mut peers_on: BTreeMap<RegionId, usize> = BTreeMap::new();
        for ep in st.peer_map.endpoints() {
            if let Some(region) = ep.relay_region().filter(|r| st.relay_map.region(*r).is_some()) {
                *peers_on.entry(region).or_default() += 1;
            }
        }
        let mut best: Option<(RegionId, usize)> = None;
        for (region, count) in peers_on {
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((region, count));
            }
        }
        if let Some((region, _)) = best {
            return Some(region);
        }

        Some(ids[(self.relay_fallback_seed % ids.len() as u64) as usize])
    }

    // ------------------------------------------------------------------------
    // CallMeMaybe
    // ------------------------------------------------------------------------

    /// Send our endpoints to `peer` via relay, refreshing them first if stale.
    pub(super) fn enqueue_call_me_maybe(&self, region: RegionId, peer: NodePublic, disco: DiscoPublic) {
        let my_number: Vec<SocketAddr> = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            let fresh = st
                .last_endpoints_time
                .map_or(false, |t| t.elapsed() < ENDPOINTS_FRESH_ENOUGH_DURATION);
            if !fresh {
                log::debug!(
                    "want call-me-maybe to {} but endpoints stale; re-STUNing",
                    peer.short_string()
                );
                st.on_endpoint_refreshed.insert(peer, (region, disco));
                drop(st);
                self.re_stun("refresh-for-peering");
                return;
            }
            st.last_endpoints.iter().map(|c| c.addr).collect()
        };
        let msg = Message::CallMeMaybe(CallMeMaybe { my_number });
        let _ = self.send_disco(SendAddr::Relay(region), Some(peer), disco, &msg, false);
    }
}
