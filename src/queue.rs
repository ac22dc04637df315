//! Per-peer outbound delivery queue (spec.md §4.3): a bounded, strictly FIFO buffer of
//! blocks waiting to be written to one peer's connection, with a completion callback per
//! entry so the dispatcher learns the outcome of each delivery attempt.

use crate::error::{BrokerError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

/// Re-entry point for an asynchronous completion (spec.md §2 supplement, grounded in
/// `baselib`'s `CompletionSink`): whatever scheduled the write gets told how it went,
/// without blocking the queue on the callback running.
pub trait CompletionSink: Send + Sync {
    fn complete(&self, message_id: Uuid, result: Result<()>);
}

/// A `CompletionSink` that does nothing; used where a caller has no interest in the
/// delivery outcome (e.g. heartbeats).
pub struct NoopSink;

impl CompletionSink for NoopSink {
    fn complete(&self, _message_id: Uuid, _result: Result<()>) {}
}

pub struct QueueItem {
    pub message_id: Uuid,
    pub flags: u16,
    pub message_id_hash: [u8; 8],
    pub envelope: Vec<u8>,
    pub payload: Vec<u8>,
    pub completion: std::sync::Arc<dyn CompletionSink>,
}

impl QueueItem {
    fn byte_len(&self) -> usize {
        self.envelope.len() + self.payload.len()
    }
}

struct Inner {
    items: VecDeque<QueueItem>,
}

/// Bounded FIFO queue for one peer's outbound traffic. Ordering is never reshuffled —
/// `try_enqueue` always appends, `pop_front` always removes the oldest entry first
/// (spec.md §4.3, "strict per-peer ordering").
pub struct PeerQueue {
    pub peer_id: Uuid,
    inner: Mutex<Inner>,
    current_bytes: AtomicUsize,
    max_entries: usize,
    max_bytes: usize,
    pre_register_threshold: usize,
    not_empty: Notify,
}

impl PeerQueue {
    pub fn new(peer_id: Uuid, max_entries: usize, max_bytes: usize, pre_register_threshold: usize) -> Self {
        Self {
            peer_id,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
            }),
            current_bytes: AtomicUsize::new(0),
            max_entries,
            max_bytes,
            pre_register_threshold,
            not_empty: Notify::new(),
        }
    }

    /// Append `item` to the tail, or reject it as `TargetPeerQueueFull` (error code 105)
    /// if either bound would be exceeded (spec.md §4.3, §6).
    pub async fn try_enqueue(&self, item: QueueItem) -> Result<()> {
        let item_bytes = item.byte_len();
        let mut guard = self.inner.lock().await;

        if guard.items.len() >= self.max_entries {
            return Err(BrokerError::TargetPeerQueueFull);
        }
        let projected_bytes = self.current_bytes.load(Ordering::Acquire) + item_bytes;
        if projected_bytes > self.max_bytes {
            return Err(BrokerError::TargetPeerQueueFull);
        }

        self.current_bytes.fetch_add(item_bytes, Ordering::AcqRel);
        guard.items.push_back(item);
        drop(guard);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove and return the oldest entry, if any.
    pub async fn pop_front(&self) -> Option<QueueItem> {
        let mut guard = self.inner.lock().await;
        let item = guard.items.pop_front()?;
        self.current_bytes.fetch_sub(item.byte_len(), Ordering::AcqRel);
        Some(item)
    }

    /// Wait until an entry is available, then remove and return it. Used by a
    /// connection's writer loop to drain the queue without busy-polling (spec.md §4.3).
    pub async fn pop_front_or_wait(&self) -> QueueItem {
        loop {
            if let Some(item) = self.pop_front().await {
                return item;
            }
            self.not_empty.notified().await;
        }
    }

    /// Fail every queued entry with `err`, invoking each completion callback and
    /// emptying the queue. Used when the target connection is gone for good (spec.md
    /// §4.3: queue contents are discarded, never silently dropped).
    pub async fn fail_all(&self, err: BrokerError) {
        let mut guard = self.inner.lock().await;
        while let Some(item) = guard.items.pop_front() {
            self.current_bytes.fetch_sub(item.byte_len(), Ordering::AcqRel);
            let message_id = item.message_id;
            item.completion.complete(message_id, Err(clone_err(&err)));
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    pub fn byte_len(&self) -> usize {
        self.current_bytes.load(Ordering::Acquire)
    }

    /// Whether this queue is still shallow enough for its connection to count as
    /// `Registered` rather than backpressured (spec.md §4.3).
    pub async fn below_pre_register_threshold(&self) -> bool {
        self.inner.lock().await.items.len() < self.pre_register_threshold
    }
}

fn clone_err(err: &BrokerError) -> BrokerError {
    match err {
        BrokerError::Protocol(s) => BrokerError::Protocol(s.clone()),
        BrokerError::Auth(s) => BrokerError::Auth(s.clone()),
        BrokerError::TargetPeerNotFound => BrokerError::TargetPeerNotFound,
        BrokerError::TargetPeerQueueFull => BrokerError::TargetPeerQueueFull,
        BrokerError::Transport(s) => BrokerError::Transport(s.clone()),
        BrokerError::Timeout => BrokerError::Timeout,
        BrokerError::Canceled => BrokerError::Canceled,
        BrokerError::Storage(s) => BrokerError::Storage(s.clone()),
        BrokerError::Internal { correlation_id, detail } => BrokerError::Internal {
            correlation_id: *correlation_id,
            detail: detail.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    struct CountingSink(Arc<AtomicU32>);
    impl CompletionSink for CountingSink {
        fn complete(&self, _message_id: Uuid, _result: Result<()>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn item(bytes: usize) -> QueueItem {
        QueueItem {
            message_id: Uuid::new_v4(),
            flags: 0,
            message_id_hash: [0; 8],
            envelope: vec![0u8; bytes],
            payload: vec![],
            completion: Arc::new(NoopSink),
        }
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let q = PeerQueue::new(Uuid::new_v4(), 10, 1024, 64);
        let ids: Vec<Uuid> = (0..5)
            .map(|_| {
                let it = item(4);
                let id = it.message_id;
                id
            })
            .collect();
        for (i, id) in ids.iter().enumerate() {
            let mut it = item(4);
            it.message_id = *id;
            let _ = i;
            q.try_enqueue(it).await.unwrap();
        }
        for id in ids {
            let popped = q.pop_front().await.unwrap();
            assert_eq!(popped.message_id, id);
        }
        assert!(q.pop_front().await.is_none());
    }

    #[tokio::test]
    async fn rejects_once_entry_bound_hit() {
        let q = PeerQueue::new(Uuid::new_v4(), 2, 1024, 64);
        q.try_enqueue(item(4)).await.unwrap();
        q.try_enqueue(item(4)).await.unwrap();
        let err = q.try_enqueue(item(4)).await.unwrap_err();
        assert!(matches!(err, BrokerError::TargetPeerQueueFull));
    }

    #[tokio::test]
    async fn rejects_once_byte_bound_hit() {
        let q = PeerQueue::new(Uuid::new_v4(), 100, 8, 64);
        q.try_enqueue(item(8)).await.unwrap();
        let err = q.try_enqueue(item(1)).await.unwrap_err();
        assert!(matches!(err, BrokerError::TargetPeerQueueFull));
    }

    #[tokio::test]
    async fn fail_all_invokes_every_completion() {
        let q = PeerQueue::new(Uuid::new_v4(), 10, 1024, 64);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let mut it = item(4);
            it.completion = Arc::new(CountingSink(counter.clone()));
            q.try_enqueue(it).await.unwrap();
        }
        q.fail_all(BrokerError::TargetPeerNotFound).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(q.len().await, 0);
        assert_eq!(q.byte_len(), 0);
    }
}
