//! Peer Registry (spec.md §4.4): the single source of truth for which peer ids have a
//! live inbound and/or outbound connection, and the at-most-one-of-each invariant that
//! everything else in the broker depends on.

use crate::error::{BrokerError, Result};
use crate::queue::PeerQueue;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle events the registry hands to observers, delivered in order on a dedicated
/// task so a slow observer never stalls a `register`/`unregister` call (spec.md §4.4).
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    PeerConnected { peer_id: Uuid, inbound: bool },
    /// A newer connection replaced one already on file for this peer/direction.
    /// `replaced_conn_id` lets the observer tear down the superseded physical
    /// connection instead of leaving it to linger until its own idle timeout
    /// (spec.md §4.4: "the new connection wins").
    PeerReconnected {
        peer_id: Uuid,
        inbound: bool,
        replaced_conn_id: Uuid,
    },
    PeerDisconnected { peer_id: Uuid, inbound: bool },
}

/// One peer's registry entry: independent inbound/outbound connection slots plus the
/// shared outbound delivery queue, all behind a single per-entry lock so concurrent
/// registration attempts for the same peer serialize without blocking unrelated peers.
struct Entry {
    inbound_conn_id: Option<Uuid>,
    outbound_conn_id: Option<Uuid>,
    queue: Arc<PeerQueue>,
}

pub struct PeerRegistry {
    entries: DashMap<Uuid, Arc<AsyncMutex<Entry>>>,
    events_tx: mpsc::UnboundedSender<RegistryEvent>,
    queue_max_entries: usize,
    queue_max_bytes: usize,
    queue_pre_register_threshold: usize,
}

impl PeerRegistry {
    /// Build the registry and spawn its event-delivery task. Observers subscribe by
    /// being handed the `mpsc::UnboundedReceiver` returned alongside the registry.
    pub fn new(
        queue_max_entries: usize,
        queue_max_bytes: usize,
        queue_pre_register_threshold: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            entries: DashMap::new(),
            events_tx,
            queue_max_entries,
            queue_max_bytes,
            queue_pre_register_threshold,
        });
        (registry, events_rx)
    }

    fn entry_for(&self, peer_id: Uuid) -> Arc<AsyncMutex<Entry>> {
        self.entries
            .entry(peer_id)
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(Entry {
                    inbound_conn_id: None,
                    outbound_conn_id: None,
                    queue: Arc::new(PeerQueue::new(
                        peer_id,
                        self.queue_max_entries,
                        self.queue_max_bytes,
                        self.queue_pre_register_threshold,
                    )),
                }))
            })
            .clone()
    }

    /// Register an inbound connection for `peer_id`. If one already exists it is
    /// reported as replaced — the new connection wins (spec.md §4.4: "at most one
    /// inbound connection per peer id").
    pub async fn register_inbound(&self, peer_id: Uuid, conn_id: Uuid) -> Arc<PeerQueue> {
        let entry_lock = self.entry_for(peer_id);
        let mut entry = entry_lock.lock().await;
        let replaced = entry.inbound_conn_id.replace(conn_id);
        let queue = entry.queue.clone();
        drop(entry);

        let event = match replaced {
            Some(replaced_conn_id) => RegistryEvent::PeerReconnected {
                peer_id,
                inbound: true,
                replaced_conn_id,
            },
            None => RegistryEvent::PeerConnected { peer_id, inbound: true },
        };
        debug!(%peer_id, %conn_id, reconnect = replaced.is_some(), "registered inbound connection");
        let _ = self.events_tx.send(event);
        queue
    }

    /// Register an outbound connection for `peer_id` (spec.md §4.4: same invariant,
    /// independent slot).
    pub async fn register_outbound(&self, peer_id: Uuid, conn_id: Uuid) -> Arc<PeerQueue> {
        let entry_lock = self.entry_for(peer_id);
        let mut entry = entry_lock.lock().await;
        let replaced = entry.outbound_conn_id.replace(conn_id);
        let queue = entry.queue.clone();
        drop(entry);

        let event = match replaced {
            Some(replaced_conn_id) => RegistryEvent::PeerReconnected {
                peer_id,
                inbound: false,
                replaced_conn_id,
            },
            None => RegistryEvent::PeerConnected { peer_id, inbound: false },
        };
        debug!(%peer_id, %conn_id, reconnect = replaced.is_some(), "registered outbound connection");
        let _ = self.events_tx.send(event);
        queue
    }

    /// Clear a connection slot. A no-op if `conn_id` no longer matches what is on file
    /// (it was already replaced by a newer connection) — this keeps disconnect handling
    /// for an old connection from clobbering a live replacement (spec.md §4.4).
    pub async fn unregister(&self, peer_id: Uuid, conn_id: Uuid, inbound: bool) {
        let Some(entry_lock) = self.entries.get(&peer_id).map(|e| e.clone()) else {
            return;
        };
        let mut entry = entry_lock.lock().await;
        let matched = if inbound {
            if entry.inbound_conn_id == Some(conn_id) {
                entry.inbound_conn_id = None;
                true
            } else {
                false
            }
        } else if entry.outbound_conn_id == Some(conn_id) {
            entry.outbound_conn_id = None;
            true
        } else {
            false
        };
        let empty = entry.inbound_conn_id.is_none() && entry.outbound_conn_id.is_none();
        drop(entry);

        if matched {
            info!(%peer_id, %conn_id, inbound, "unregistered connection");
            let _ = self.events_tx.send(RegistryEvent::PeerDisconnected { peer_id, inbound });
        }
        if empty {
            self.entries.remove(&peer_id);
        }
    }

    /// Look up the outbound delivery queue for a peer id, used by the dispatcher to
    /// route a message to its target (spec.md §4.6). Returns `TargetPeerNotFound`
    /// (error code 99) when the peer has no registry entry at all.
    pub async fn lookup_queue(&self, peer_id: Uuid) -> Result<Arc<PeerQueue>> {
        let entry_lock = self
            .entries
            .get(&peer_id)
            .map(|e| e.clone())
            .ok_or(BrokerError::TargetPeerNotFound)?;
        let entry = entry_lock.lock().await;
        Ok(entry.queue.clone())
    }

    pub fn is_registered(&self, peer_id: Uuid) -> bool {
        self.entries.contains_key(&peer_id)
    }

    /// True only if `peer_id` has a live outbound connection — stronger than
    /// [`PeerRegistry::is_registered`], which is satisfied by an inbound-only peer.
    /// Relaying to a peer requires an actual outbound connection to deliver through
    /// (spec.md §4.3/§4.6), not merely a known peer id.
    pub async fn outbound_registered(&self, peer_id: Uuid) -> bool {
        let Some(entry_lock) = self.entries.get(&peer_id).map(|e| e.clone()) else {
            return false;
        };
        entry_lock.lock().await.outbound_conn_id.is_some()
    }

    pub fn connected_peer_count(&self) -> usize {
        self.entries.len()
    }

    /// Snapshot every peer's outbound queue, for the shutdown drain sequence (spec.md
    /// §4.10 step 3).
    pub async fn all_queues(&self) -> Vec<Arc<PeerQueue>> {
        let locks: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        let mut queues = Vec::with_capacity(locks.len());
        for lock in locks {
            queues.push(lock.lock().await.queue.clone());
        }
        queues
    }
}
