//! Peer index
//!
//! Three lookup tables over one set of endpoints:
//!
//! ```text
//! by_node_key:    NodePublic  ──► PeerInfo { ep, addrs }
//! by_addr:        SocketAddr  ──► NodePublic
//! nodes_of_disco: DiscoPublic ──► {NodePublic, ...}
//! ```
//!
//! Every `by_addr` and `nodes_of_disco` entry names a node present in
//! `by_node_key`. The index has no lock of its own; the connection owns it
//! and only touches it under the connection lock.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::key::{DiscoPublic, NodePublic};

struct PeerInfo {
    ep: Arc<Endpoint>,
    /// Addresses this peer has been confirmed at via disco
    addrs: HashSet<SocketAddr>,
}

#[derive(Default)]
pub(crate) struct PeerMap {
    by_node_key: HashMap<NodePublic, PeerInfo>,
    by_addr: HashMap<SocketAddr, NodePublic>,
    nodes_of_disco: HashMap<DiscoPublic, HashSet<NodePublic>>,
}

impl PeerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.by_node_key.len()
    }

    /// Some endpoint using `dk`, if any node does.
    pub fn any_endpoint_for_disco_key(&self, dk: &DiscoPublic) -> Option<Arc<Endpoint>> {
        self.nodes_of_disco
            .get(dk)?
            .iter()
            .find_map(|nk| self.endpoint_for_node_key(nk))
    }

    pub fn endpoint_for_node_key(&self, nk: &NodePublic) -> Option<Arc<Endpoint>> {
        self.by_node_key.get(nk).map(|info| info.ep.clone())
    }

    pub fn endpoint_for_addr(&self, addr: &SocketAddr) -> Option<Arc<Endpoint>> {
        let nk = self.by_addr.get(addr)?;
        self.endpoint_for_node_key(nk)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Arc<Endpoint>> + '_ {
        self.by_node_key.values().map(|info| &info.ep)
    }

    /// All endpoints sharing `dk`.
    pub fn endpoints_with_disco_key(&self, dk: &DiscoPublic) -> Vec<Arc<Endpoint>> {
        self.nodes_of_disco
            .get(dk)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|nk| self.endpoint_for_node_key(nk))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The node using `dk` when exactly one does.
    pub fn only_node_with_disco_key(&self, dk: &DiscoPublic) -> Option<NodePublic> {
        let nodes = self.nodes_of_disco.get(dk)?;
        if nodes.len() == 1 {
            nodes.iter().next().copied()
        } else {
            None
        }
    }

    pub fn has_disco_key(&self, dk: &DiscoPublic) -> bool {
        self.nodes_of_disco.contains_key(dk)
    }

    /// Insert `ep` or refresh its disco key indexing.
    ///
    /// `old_disco` is the endpoint's disco key before the update that
    /// prompted this call.
    pub fn upsert_endpoint(&mut self, ep: &Arc<Endpoint>, old_disco: Option<DiscoPublic>) {
        let nk = ep.public_key();
        let disco = ep.disco_key();

        if let Some(old) = old_disco {
            if Some(old) != disco {
                self.remove_disco_node(&old, &nk);
            }
        }
        if let Some(dk) = disco {
            self.nodes_of_disco.entry(dk).or_default().insert(nk);
        }

        self.by_node_key.entry(nk).or_insert_with(|| PeerInfo {
            ep: ep.clone(),
            addrs: HashSet::new(),
        });
    }

    /// Record that `addr` was confirmed (by disco) to belong to `nk`.
    pub fn set_node_key_for_addr(&mut self, addr: SocketAddr, nk: NodePublic) {
        if let Some(old) = self.by_addr.get(&addr).copied() {
            if old == nk {
                return;
            }
            if let Some(info) = self.by_node_key.get_mut(&old) {
                info.addrs.remove(&addr);
            }
        }
        if let Some(info) = self.by_node_key.get_mut(&nk) {
            info.addrs.insert(addr);
            self.by_addr.insert(addr, nk);
        }
    }

    /// Stop `ep` and remove it from every table.
    pub fn delete_endpoint(&mut self, ep: &Arc<Endpoint>) {
        ep.stop_and_reset();

        let nk = ep.public_key();
        if let Some(dk) = ep.disco_key() {
            self.remove_disco_node(&dk, &nk);
        }

        let Some(info) = self.by_node_key.get(&nk) else {
            return;
        };
        if !Arc::ptr_eq(&info.ep, ep) {
            return;
        }
        if let Some(info) = self.by_node_key.remove(&nk) {
            for addr in info.addrs {
                if self.by_addr.get(&addr) == Some(&nk) {
                    self.by_addr.remove(&addr);
                }
            }
        }
    }

    fn remove_disco_node(&mut self, dk: &DiscoPublic, nk: &NodePublic) {
        if let Some(nodes) = self.nodes_of_disco.get_mut(dk) {
            nodes.remove(nk);
            if nodes.is_empty() {
                self.nodes_of_disco.remove(dk);
            }
        }
    }

    /// Check the cross-table invariant. Test-only.
    #[cfg(test)]
    pub fn assert_consistent(&self) {
        for nk in self.by_addr.values() {
            assert!(self.by_node_key.contains_key(nk), "by_addr names unknown {:?}", nk);
        }
        for (dk, nodes) in &self.nodes_of_disco {
            assert!(!nodes.is_empty(), "empty disco set for {:?}", dk);
            for nk in nodes {
                assert!(self.by_node_key.contains_key(nk), "disco set names unknown {:?}", nk);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::tests::{test_endpoint, RecordingHost};
    use crate::key::{DiscoPrivate, NodePrivate};
    use crate::netmap::PeerNode;

    fn node(disco: Option<DiscoPublic>) -> PeerNode {
        PeerNode {
            key: NodePrivate::generate().public(),
            disco_key: disco,
            relay: Some("127.3.3.40:1".to_string()),
            endpoints: vec!["192.168.1.1:5000".to_string()],
        }
    }

    #[tokio::test]
    async fn test_upsert_and_lookup() {
        let host = RecordingHost::new();
        let dk = DiscoPrivate::generate().public();
        let n = node(Some(dk));
        let ep = test_endpoint(&host, &n);

        let mut pm = PeerMap::new();
        pm.upsert_endpoint(&ep, None);

        assert_eq!(pm.node_count(), 1);
        assert!(pm.endpoint_for_node_key(&n.key).is_some());
        assert!(pm.any_endpoint_for_disco_key(&dk).is_some());
        assert_eq!(pm.only_node_with_disco_key(&dk), Some(n.key));
        pm.assert_consistent();
    }

    #[tokio::test]
    async fn test_shared_disco_key_maps_many_nodes() {
        let host = RecordingHost::new();
        let dk = DiscoPrivate::generate().public();
        let a = test_endpoint(&host, &node(Some(dk)));
        let b = test_endpoint(&host, &node(Some(dk)));

        let mut pm = PeerMap::new();
        pm.upsert_endpoint(&a, None);
        pm.upsert_endpoint(&b, None);

        assert_eq!(pm.endpoints_with_disco_key(&dk).len(), 2);
        assert_eq!(pm.only_node_with_disco_key(&dk), None);
        pm.assert_consistent();
    }

    #[tokio::test]
    async fn test_disco_key_rotation_reindexes() {
        let host = RecordingHost::new();
        let old = DiscoPrivate::generate().public();
        let new = DiscoPrivate::generate().public();
        let mut n = node(Some(old));
        let ep = test_endpoint(&host, &n);

        let mut pm = PeerMap::new();
        pm.upsert_endpoint(&ep, None);

        n.disco_key = Some(new);
        ep.update_from_node(&n);
        pm.upsert_endpoint(&ep, Some(old));

        assert!(!pm.has_disco_key(&old));
        assert!(pm.any_endpoint_for_disco_key(&new).is_some());
        pm.assert_consistent();
    }

    #[tokio::test]
    async fn test_set_node_key_for_addr_moves_addr() {
        let host = RecordingHost::new();
        let a = test_endpoint(&host, &node(None));
        let b = test_endpoint(&host, &node(None));
        let addr: SocketAddr = "10.0.0.7:41641".parse().unwrap();

        let mut pm = PeerMap::new();
        pm.upsert_endpoint(&a, None);
        pm.upsert_endpoint(&b, None);

        pm.set_node_key_for_addr(addr, a.public_key());
        assert!(Arc::ptr_eq(&pm.endpoint_for_addr(&addr).unwrap(), &a));

        pm.set_node_key_for_addr(addr, b.public_key());
        assert!(Arc::ptr_eq(&pm.endpoint_for_addr(&addr).unwrap(), &b));

        // Deleting the old owner must not drop the new mapping.
        pm.delete_endpoint(&a);
        assert!(pm.endpoint_for_addr(&addr).is_some());
        pm.assert_consistent();
    }

    #[tokio::test]
    async fn test_delete_removes_from_all_tables() {
        let host = RecordingHost::new();
        let dk = DiscoPrivate::generate().public();
        let ep = test_endpoint(&host, &node(Some(dk)));
        let addr: SocketAddr = "10.0.0.8:41641".parse().unwrap();

        let mut pm = PeerMap::new();
        pm.upsert_endpoint(&ep, None);
        pm.set_node_key_for_addr(addr, ep.public_key());
        pm.delete_endpoint(&ep);

        assert_eq!(pm.node_count(), 0);
        assert!(pm.endpoint_for_addr(&addr).is_none());
        assert!(!pm.has_disco_key(&dk));
        pm.assert_consistent();
    }

    #[tokio::test]
    async fn test_unknown_node_addr_ignored() {
        let mut pm = PeerMap::new();
        let addr: SocketAddr = "10.0.0.9:1".parse().unwrap();
        pm.set_node_key_for_addr(addr, NodePrivate::generate().public());
        assert!(pm.endpoint_for_addr(&addr).is_none());
        pm.assert_consistent();
    }
}
