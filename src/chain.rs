//! Broker Chaining (spec.md §4.8): one-hop forwarding to peer brokers. A message whose
//! target peer isn't registered locally but is reachable through a configured peer
//! broker gets forwarded there with the `Forwarded` flag set; a forwarded message is
//! never forwarded again.

use crate::codec::FLAG_FORWARDED;
use crate::envelope::Envelope;
use crate::error::{BrokerError, Result};
use dashmap::DashMap;
use std::net::SocketAddr;
use tracing::debug;
use uuid::Uuid;

/// Routes a peer id to the broker endpoint that last advertised owning it (spec.md
/// §4.8: "a chain-routing table populated from registration advertisements"), and the
/// endpoint onward to whichever registry entry holds the live outbound connection to
/// that chain peer (maintained by the broker's chain-connection pool as links come up
/// and go down).
pub struct ChainRoutingTable {
    routes: DashMap<Uuid, SocketAddr>,
    links: DashMap<SocketAddr, Uuid>,
    proxy_endpoints: Vec<SocketAddr>,
}

impl ChainRoutingTable {
    pub fn new(proxy_endpoints: Vec<SocketAddr>) -> Self {
        Self {
            routes: DashMap::new(),
            links: DashMap::new(),
            proxy_endpoints,
        }
    }

    pub fn advertise(&self, peer_id: Uuid, broker_addr: SocketAddr) {
        debug!(%peer_id, %broker_addr, "chain route advertised");
        self.routes.insert(peer_id, broker_addr);
    }

    pub fn withdraw(&self, peer_id: Uuid) {
        self.routes.remove(&peer_id);
    }

    pub fn route_for(&self, peer_id: Uuid) -> Option<SocketAddr> {
        self.routes.get(&peer_id).map(|r| *r)
    }

    /// Record that `broker_addr`'s outbound connection is registered under
    /// `link_id` in the peer registry, so `forward_decision` can resolve a target all
    /// the way to a queue.
    pub fn register_link(&self, broker_addr: SocketAddr, link_id: Uuid) {
        self.links.insert(broker_addr, link_id);
    }

    pub fn unregister_link(&self, broker_addr: SocketAddr) {
        self.links.remove(&broker_addr);
    }

    pub fn link_for(&self, peer_id: Uuid) -> Option<Uuid> {
        let addr = self.route_for(peer_id)?;
        self.links.get(&addr).map(|l| *l)
    }

    pub fn proxy_endpoints(&self) -> &[SocketAddr] {
        &self.proxy_endpoints
    }
}

/// Decide whether `envelope` should be forwarded to a chained broker rather than
/// handled locally. The `Forwarded` flag is checked first and unconditionally blocks a
/// second hop (spec.md §2 supplement, §4.8: one-hop enforcement takes priority over
/// routing-table lookups). Forwarding is only chosen when a live link connection is
/// registered — a route with no live link falls back to local handling, which reports
/// `TargetPeerNotFound` rather than silently dropping the message.
pub fn forward_decision(
    flags: u16,
    envelope: &Envelope,
    routing: &ChainRoutingTable,
) -> ForwardDecision {
    if flags & FLAG_FORWARDED != 0 {
        return ForwardDecision::Local;
    }
    match routing.link_for(envelope.target_peer_id) {
        Some(link_id) => ForwardDecision::Forward(link_id),
        None => ForwardDecision::Local,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecision {
    Local,
    Forward(Uuid),
}

/// Build the flags a forwarded block carries: the original flags with `Forwarded` set,
/// so the receiving broker's `forward_decision` call refuses to forward it again.
pub fn mark_forwarded(flags: u16) -> u16 {
    flags | FLAG_FORWARDED
}

pub fn target_not_found() -> Result<()> {
    Err(BrokerError::TargetPeerNotFound)
}
