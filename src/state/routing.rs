//! Shard Routing
//!
//! Which node holds the primary copy of each shard and where the peers
//! live. Recovery consults the registry before enabling local writes and
//! when picking the feeder of a replica.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::replication::FeederParam;
use crate::wal::Scn;

/// Shard ids are below this bound
pub const MAX_SHARD: usize = 4096;

/// Where a shard's primary lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub shard_id: u32,
    /// Primary copy is on this node
    pub local: bool,
    /// Peer holding the primary copy, when not local
    pub peer: Option<String>,
    pub last_known_scn: Scn,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.peer, self.local) {
            (_, true) => write!(f, "shard {} local scn {}", self.shard_id, self.last_known_scn),
            (Some(peer), false) => write!(
                f,
                "shard {} on {} scn {}",
                self.shard_id, peer, self.last_known_scn
            ),
            (None, false) => write!(f, "shard {} unassigned", self.shard_id),
        }
    }
}

/// Process-wide shard routing registry
pub struct RoutingTable {
    node_id: String,
    routes: RwLock<Vec<Option<Route>>>,
    peers: RwLock<HashMap<String, SocketAddr>>,
}

impl RoutingTable {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            routes: RwLock::new(vec![None; MAX_SHARD]),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn add_peer(&self, name: impl Into<String>, addr: SocketAddr) {
        self.peers.write().insert(name.into(), addr);
    }

    pub fn peer_addr(&self, name: &str) -> Option<SocketAddr> {
        self.peers.read().get(name).copied()
    }

    /// Record that `shard_id` is primary on `peer` (or on this node when
    /// `peer` names it), as of `scn`.
    pub fn update_rt(&self, shard_id: u32, peer: &str, scn: Scn) -> Result<()> {
        let slot = shard_index(shard_id)?;
        let local = peer == self.node_id;
        if !local && !self.peers.read().contains_key(peer) {
            return Err(Error::InvalidState(format!(
                "shard {} routed to unknown peer {:?}",
                shard_id, peer
            )));
        }

        let route = Route {
            shard_id,
            local,
            peer: (!local).then(|| peer.to_string()),
            last_known_scn: scn,
            updated_at: chrono::Utc::now(),
        };

        let mut routes = self.routes.write();
        if routes[slot].as_ref().map(|r| (r.local, &r.peer)) != Some((route.local, &route.peer)) {
            tracing::info!("Route updated: {}", route);
        }
        routes[slot] = Some(route);
        Ok(())
    }

    /// Remember the newest SCN seen for a shard
    pub fn update_scn(&self, shard_id: u32, scn: Scn) -> Result<()> {
        let slot = shard_index(shard_id)?;
        if let Some(route) = self.routes.write()[slot].as_mut() {
            route.last_known_scn = route.last_known_scn.max(scn);
            route.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    pub fn route(&self, shard_id: u32) -> Option<Route> {
        let slot = shard_index(shard_id).ok()?;
        self.routes.read()[slot].clone()
    }

    /// All assigned routes, by shard id
    pub fn routes(&self) -> Vec<Route> {
        self.routes.read().iter().flatten().cloned().collect()
    }

    /// Feeder parameters for replicating `shard_id` from its primary.
    ///
    /// `None` when the shard is local, unassigned or its peer has no
    /// address.
    pub fn fill_feeder_param(&self, shard_id: u32) -> Option<FeederParam> {
        let route = self.route(shard_id)?;
        if route.local {
            return None;
        }
        let addr = self.peer_addr(route.peer.as_deref()?)?;
        Some(FeederParam::new(addr))
    }

    /// Whether another node holds the primary copy of `shard_id`
    pub fn is_replica_of_other(&self, shard_id: u32) -> bool {
        self.route(shard_id)
            .map(|route| !route.local && route.peer.is_some())
            .unwrap_or(false)
    }
}

fn shard_index(shard_id: u32) -> Result<usize> {
    let slot = shard_id as usize;
    if slot >= MAX_SHARD {
        return Err(Error::InvalidState(format!(
            "shard id {} out of range (max {})",
            shard_id,
            MAX_SHARD - 1
        )));
    }
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoutingTable {
        let table = RoutingTable::new("node-1");
        table.add_peer("node-2", "10.0.0.2:33034".parse().unwrap());
        table
    }

    #[test]
    fn test_local_and_remote_routes() {
        let table = table();
        table.update_rt(1, "node-1", 10).unwrap();
        table.update_rt(2, "node-2", 20).unwrap();

        assert!(table.route(1).unwrap().local);
        assert!(!table.is_replica_of_other(1));
        assert!(table.fill_feeder_param(1).is_none());

        assert!(table.is_replica_of_other(2));
        let param = table.fill_feeder_param(2).unwrap();
        assert_eq!(param.addr, "10.0.0.2:33034".parse().unwrap());

        assert!(table.route(3).is_none());
        assert!(!table.is_replica_of_other(3));
        assert_eq!(table.routes().len(), 2);
    }

    #[test]
    fn test_rejects_bad_updates() {
        let table = table();
        assert!(matches!(
            table.update_rt(MAX_SHARD as u32, "node-1", 0),
            Err(Error::InvalidState(_))
        ));
        assert!(table.update_rt(5, "node-9", 0).is_err());
        assert!(table.route(MAX_SHARD as u32).is_none());
    }

    #[test]
    fn test_scn_only_moves_forward() {
        let table = table();
        table.update_rt(7, "node-2", 100).unwrap();
        table.update_scn(7, 150).unwrap();
        table.update_scn(7, 120).unwrap();
        assert_eq!(table.route(7).unwrap().last_known_scn, 150);
    }
}
