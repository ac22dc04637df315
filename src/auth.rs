//! Authorization Cache (spec.md §4.5): validates externally-issued tokens through a
//! pluggable callback, coalesces concurrent validations of the same token into one
//! call, and caches the outcome — positive for longer, negative only briefly so a
//! retried token is re-checked quickly.

use crate::envelope::TokenFingerprint;
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// Validates one authentication token against an external authority. Implementations
/// are supplied by the embedder; the broker core only ever sees the boolean outcome.
#[async_trait]
pub trait AuthenticationCallback: Send + Sync {
    async fn authenticate(&self, token_type: &str, token_data: &[u8]) -> Result<()>;
}

#[derive(Clone)]
enum CacheState {
    Authorized { expires_at: Instant },
    Denied { expires_at: Instant, reason: String },
}

enum Slot {
    Resolved(CacheState),
    InFlight(broadcast::Sender<CacheState>),
}

/// A cache slot plus the token type it was authorized under. `TokenFingerprint` is a
/// one-way SHA-256 hash (spec.md §4.5) and cannot be inverted back to a type, so
/// `evict_all` needs this stored alongside it to scope eviction by token type.
struct SlotEntry {
    token_type: String,
    slot: Slot,
}

struct Inner {
    slots: HashMap<TokenFingerprint, SlotEntry>,
    lru: VecDeque<TokenFingerprint>,
}

/// Single-flight, TTL+LRU authorization cache (spec.md §4.5).
pub struct AuthorizationCache {
    inner: Mutex<Inner>,
    callback: Arc<dyn AuthenticationCallback>,
    ttl: Duration,
    negative_ttl: Duration,
    capacity: usize,
}

impl AuthorizationCache {
    pub fn new(
        callback: Arc<dyn AuthenticationCallback>,
        ttl: Duration,
        negative_ttl: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                lru: VecDeque::new(),
            }),
            callback,
            ttl,
            negative_ttl,
            capacity,
        }
    }

    /// Authorize `token_type`/`token_data`, fingerprinted as `fp`. Concurrent callers
    /// authorizing the same fingerprint share one underlying `authenticate` call
    /// (spec.md §4.5: "single-flight coalescing").
    pub async fn authorize(
        &self,
        fp: TokenFingerprint,
        token_type: &str,
        token_data: &[u8],
    ) -> Result<()> {
        let mut subscribe_to = None;
        {
            let mut guard = self.inner.lock().await;
            match guard.slots.get(&fp).map(|entry| &entry.slot) {
                Some(Slot::Resolved(state)) => {
                    if let Some(result) = resolve_if_fresh(state) {
                        touch(&mut guard.lru, fp);
                        return result;
                    }
                    // expired: fall through to start a fresh flight below
                }
                Some(Slot::InFlight(tx)) => {
                    subscribe_to = Some(tx.subscribe());
                }
                None => {}
            }

            if subscribe_to.is_none()
                && !matches!(guard.slots.get(&fp).map(|entry| &entry.slot), Some(Slot::InFlight(_)))
            {
                let (tx, _rx) = broadcast::channel(1);
                guard.slots.insert(
                    fp,
                    SlotEntry {
                        token_type: token_type.to_string(),
                        slot: Slot::InFlight(tx),
                    },
                );
            }
        }

        if let Some(mut rx) = subscribe_to {
            let state = rx.recv().await.map_err(|_| BrokerError::internal("authorization flight dropped"))?;
            return resolve_if_fresh(&state).unwrap_or(Err(BrokerError::Auth("token expired".into())));
        }

        let outcome = self.callback.authenticate(token_type, token_data).await;
        let (state, result) = match outcome {
            Ok(()) => (
                CacheState::Authorized {
                    expires_at: Instant::now() + self.ttl,
                },
                Ok(()),
            ),
            Err(e) => {
                let reason = e.to_string();
                (
                    CacheState::Denied {
                        expires_at: Instant::now() + self.negative_ttl,
                        reason: reason.clone(),
                    },
                    Err(BrokerError::Auth(reason)),
                )
            }
        };

        let mut guard = self.inner.lock().await;
        if let Some(SlotEntry {
            slot: Slot::InFlight(tx),
            ..
        }) = guard.slots.remove(&fp)
        {
            let _ = tx.send(state.clone());
        }
        guard.slots.insert(
            fp,
            SlotEntry {
                token_type: token_type.to_string(),
                slot: Slot::Resolved(state),
            },
        );
        touch(&mut guard.lru, fp);
        evict_if_over_capacity(&mut guard, self.capacity);

        debug!(%fp, ok = result.is_ok(), "authorization resolved");
        result
    }

    /// Drop every cached entry whose token type matches `token_type`, forcing
    /// re-authentication on next use (spec.md §4.5: administrative invalidation scoped by
    /// token type, e.g. rotating the signing key for one issuer without disturbing
    /// others). `TokenFingerprint` is a one-way hash of type-and-data, so the type has to
    /// be tracked alongside each entry rather than recovered from the key itself.
    pub async fn evict_all(&self, token_type: &str) {
        let mut guard = self.inner.lock().await;
        let to_remove: Vec<TokenFingerprint> = guard
            .slots
            .iter()
            .filter(|(_, entry)| entry.token_type == token_type)
            .map(|(fp, _)| *fp)
            .collect();
        for fp in to_remove {
            guard.slots.remove(&fp);
            guard.lru.retain(|k| *k != fp);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.slots.len()
    }
}

fn resolve_if_fresh(state: &CacheState) -> Option<Result<()>> {
    match state {
        CacheState::Authorized { expires_at } if Instant::now() < *expires_at => Some(Ok(())),
        CacheState::Denied { expires_at, reason } if Instant::now() < *expires_at => {
            Some(Err(BrokerError::Auth(reason.clone())))
        }
        _ => None,
    }
}

fn touch(lru: &mut VecDeque<TokenFingerprint>, fp: TokenFingerprint) {
    lru.retain(|k| *k != fp);
    lru.push_back(fp);
}

fn evict_if_over_capacity(inner: &mut Inner, capacity: usize) {
    while inner.slots.len() > capacity {
        let Some(oldest) = inner.lru.pop_front() else {
            break;
        };
        inner.slots.remove(&oldest);
    }
}
