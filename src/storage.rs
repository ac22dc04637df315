//! Chunk Storage Adapter (spec.md §4.7): wraps a synchronous storage backend so the
//! rest of the broker only ever awaits it, bounding how many blocking operations run
//! at once and how many any single session may have outstanding.

use crate::error::{BrokerError, Result};
use crate::queue::CompletionSink;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A chunk storage backend. Implementations are synchronous and may block (spec.md
/// §4.7: "may be backed by a blocking filesystem or database client") — the adapter is
/// what makes that safe to call from async code.
pub trait ChunkStorage: Send + Sync + 'static {
    fn load(&self, session_id: Uuid, chunk_id: &str) -> Result<Vec<u8>>;
    fn save(&self, session_id: Uuid, chunk_id: &str, data: &[u8]) -> Result<()>;
    fn remove(&self, session_id: Uuid, chunk_id: &str) -> Result<()>;
    /// Flush and release any resources held for `session_id` (spec.md §2 supplement,
    /// wired from the `AdminFlush` envelope message type).
    fn flush_peer_sessions(&self, session_id: Uuid) -> Result<()>;
}

/// In-memory backend used for tests and for running the broker without a configured
/// external store.
#[derive(Default)]
pub struct InMemoryChunkStorage {
    chunks: Mutex<HashMap<(Uuid, String), Vec<u8>>>,
}

impl ChunkStorage for InMemoryChunkStorage {
    fn load(&self, session_id: Uuid, chunk_id: &str) -> Result<Vec<u8>> {
        self.chunks
            .blocking_lock()
            .get(&(session_id, chunk_id.to_string()))
            .cloned()
            .ok_or_else(|| BrokerError::Storage(format!("no such chunk: {chunk_id}")))
    }

    fn save(&self, session_id: Uuid, chunk_id: &str, data: &[u8]) -> Result<()> {
        self.chunks
            .blocking_lock()
            .insert((session_id, chunk_id.to_string()), data.to_vec());
        Ok(())
    }

    fn remove(&self, session_id: Uuid, chunk_id: &str) -> Result<()> {
        self.chunks.blocking_lock().remove(&(session_id, chunk_id.to_string()));
        Ok(())
    }

    fn flush_peer_sessions(&self, session_id: Uuid) -> Result<()> {
        self.chunks.blocking_lock().retain(|(sid, _), _| *sid != session_id);
        Ok(())
    }
}

/// Outcome of one chunk operation, handed back to a `CompletionSink` on the
/// `NonBlocking` pool (spec.md §2 supplement, §4.9) once the blocking call finishes.
pub enum ChunkOutcome {
    Loaded(Vec<u8>),
    Saved,
    Removed,
    Flushed,
}

/// Bounded async facade over a [`ChunkStorage`] backend. Work is dispatched onto
/// `tokio::task::spawn_blocking`, capped globally by `worker_permits` and per-session by
/// `session_permits` (spec.md §4.7).
pub struct ChunkStorageAdapter {
    backend: Arc<dyn ChunkStorage>,
    worker_permits: Arc<Semaphore>,
    session_permits: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
    /// Per-session, per-operation cancellation tokens, so `flush_peer_sessions` can
    /// actively cancel whatever load/save/remove calls are in flight for a session
    /// (spec.md §4.7) instead of queuing behind them on the session semaphore.
    session_ops: Mutex<HashMap<Uuid, HashMap<Uuid, CancellationToken>>>,
    max_concurrent_per_session: usize,
    outstanding: AtomicUsize,
}

impl ChunkStorageAdapter {
    pub fn new(backend: Arc<dyn ChunkStorage>, worker_pool_size: usize, max_concurrent_per_session: usize) -> Self {
        Self {
            backend,
            worker_permits: Arc::new(Semaphore::new(worker_pool_size)),
            session_permits: Mutex::new(HashMap::new()),
            session_ops: Mutex::new(HashMap::new()),
            max_concurrent_per_session,
            outstanding: AtomicUsize::new(0),
        }
    }

    async fn session_semaphore(&self, session_id: Uuid) -> Arc<Semaphore> {
        let mut guard = self.session_permits.lock().await;
        guard
            .entry(session_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent_per_session)))
            .clone()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub async fn load(&self, session_id: Uuid, chunk_id: String) -> Result<Vec<u8>> {
        let backend = self.backend.clone();
        self.run(session_id, move || backend.load(session_id, &chunk_id)).await
    }

    pub async fn save(&self, session_id: Uuid, chunk_id: String, data: Vec<u8>) -> Result<()> {
        let backend = self.backend.clone();
        self.run(session_id, move || backend.save(session_id, &chunk_id, &data)).await
    }

    pub async fn remove(&self, session_id: Uuid, chunk_id: String) -> Result<()> {
        let backend = self.backend.clone();
        self.run(session_id, move || backend.remove(session_id, &chunk_id)).await
    }

    /// Flush `session_id`, first canceling every load/save/remove already in flight for
    /// it rather than queuing behind them (spec.md §4.7): a flush is an administrative
    /// request to release the session now, not to wait its turn.
    pub async fn flush_peer_sessions(&self, session_id: Uuid) -> Result<()> {
        let pending: Vec<CancellationToken> = {
            let mut guard = self.session_ops.lock().await;
            guard
                .remove(&session_id)
                .map(|ops| ops.into_values().collect())
                .unwrap_or_default()
        };
        for token in pending {
            token.cancel();
        }

        let backend = self.backend.clone();
        self.run(session_id, move || backend.flush_peer_sessions(session_id)).await
    }

    /// Acquire the global and per-session permits, then run `op` on the blocking pool.
    /// Registers a cancellation token for the operation's lifetime so a concurrent
    /// `flush_peer_sessions` can abort it with [`BrokerError::Canceled`] instead of
    /// waiting behind it (spec.md §4.7).
    async fn run<T, F>(&self, session_id: Uuid, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let session_sema = self.session_semaphore(session_id).await;
        let _session_permit = session_sema
            .acquire_owned()
            .await
            .map_err(|_| BrokerError::internal("session semaphore closed"))?;
        let _worker_permit = self
            .worker_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BrokerError::internal("worker semaphore closed"))?;

        let op_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        {
            let mut guard = self.session_ops.lock().await;
            guard.entry(session_id).or_default().insert(op_id, cancel.clone());
        }

        self.outstanding.fetch_add(1, Ordering::Relaxed);
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(BrokerError::Canceled),
            joined = tokio::task::spawn_blocking(op) => joined
                .map_err(|e| BrokerError::internal(format!("storage worker panicked: {e}")))
                .and_then(|r| r),
        };
        self.outstanding.fetch_sub(1, Ordering::Relaxed);

        {
            let mut guard = self.session_ops.lock().await;
            if let Some(ops) = guard.get_mut(&session_id) {
                ops.remove(&op_id);
                if ops.is_empty() {
                    guard.remove(&session_id);
                }
            }
        }

        result
    }

    /// Run `op` and hand the outcome to `sink` once it resolves, without the caller
    /// awaiting the result directly — the re-entry path storage operations use when
    /// invoked from the dispatcher (spec.md §2 supplement: `CompletionSink`).
    pub fn spawn_with_completion<F>(self: &Arc<Self>, message_id: Uuid, sink: Arc<dyn CompletionSink>, op: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        tokio::spawn(async move {
            let result = op.await;
            sink.complete(message_id, result);
        });
    }
}
