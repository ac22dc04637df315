//! Task Scheduler & Thread Pool (spec.md §4.9): two named pools — `GeneralPurpose` for
//! ordinary dispatcher work and `NonBlocking` for I/O completions that must never wait
//! behind CPU-bound work — plus an `ExecutionQueue` that bounds how much work is ready
//! or executing at once and reports completion back to whoever scheduled it.

use crate::error::{BrokerError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pool {
    /// Ordinary dispatcher and storage-adapter work.
    GeneralPurpose,
    /// I/O completions that must not queue behind `GeneralPurpose` work (spec.md §4.9).
    NonBlocking,
}

/// Events an [`ExecutionQueue`] reports as tasks move through it (spec.md §4.9).
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Ready(Uuid),
    Discarded(Uuid),
    Completed(Uuid),
    AllCompleted,
}

/// Bounds how many tasks may be ready-or-executing at once and reports their progress.
/// Tasks beyond the bound block in `schedule` until a slot frees up (spec.md §4.9:
/// "max ready-or-executing").
pub struct ExecutionQueue {
    permits: Arc<Semaphore>,
    outstanding: Arc<AtomicUsize>,
    events_tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ExecutionQueue {
    pub fn new(max_ready_or_executing: usize) -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                permits: Arc::new(Semaphore::new(max_ready_or_executing)),
                outstanding: Arc::new(AtomicUsize::new(0)),
                events_tx,
            },
            events_rx,
        )
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

/// The general-purpose and non-blocking thread pools (spec.md §4.9). Backed by the
/// ambient tokio runtime's own worker and blocking pools — `GeneralPurpose` work is
/// bounded with a semaphore so it cannot starve `NonBlocking` completions, which run
/// unthrottled.
pub struct Scheduler {
    general_permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(processing_threads_count: usize) -> Self {
        Self {
            general_permits: Arc::new(Semaphore::new(processing_threads_count)),
        }
    }

    /// Schedule `fut` onto `pool` under `eq`'s bound, reporting `Ready`/`Completed`
    /// events and honoring `cancel` (spec.md §4.9). Returns a [`Task`] handle the
    /// caller can chain a continuation onto or cancel.
    pub fn schedule<F>(&self, eq: &ExecutionQueue, pool: Pool, fut: F) -> Task
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let eq_permits = eq.permits.clone();
        let eq_outstanding = eq.outstanding.clone();
        let events_tx = eq.events_tx.clone();
        let general_permits = self.general_permits.clone();
        let task_cancel = cancel.clone();

        eq_outstanding.fetch_add(1, Ordering::Relaxed);
        let _ = events_tx.send(ExecutionEvent::Ready(id));

        tokio::spawn(async move {
            let eq_permit = match eq_permits.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let _general_permit = if pool == Pool::GeneralPurpose {
                general_permits.acquire_owned().await.ok()
            } else {
                None
            };

            tokio::select! {
                _ = task_cancel.cancelled() => {
                    trace!(%id, "task canceled before execution");
                    let _ = events_tx.send(ExecutionEvent::Discarded(id));
                }
                _ = fut => {
                    let _ = events_tx.send(ExecutionEvent::Completed(id));
                }
            }

            drop(eq_permit);
            let remaining = eq_outstanding.fetch_sub(1, Ordering::Relaxed) - 1;
            if remaining == 0 {
                let _ = events_tx.send(ExecutionEvent::AllCompleted);
            }
        });

        Task { id, cancel }
    }
}

/// Run `fut` through `scheduler`'s `pool`/`eq` bound and return its output, bridging
/// `schedule`'s fire-and-forget completion events back into an awaitable value (spec.md
/// §4.9: authorization lookups, storage operations and administrative work all run
/// bounded by a pool rather than as unthrottled ambient tasks). An `Err(Canceled)` means
/// the scheduled task was discarded before it could send its result.
pub async fn run_on<F, T>(scheduler: &Scheduler, eq: &ExecutionQueue, pool: Pool, fut: F) -> Result<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    scheduler.schedule(eq, pool, async move {
        let value = fut.await;
        let _ = tx.send(value);
    });
    rx.await.map_err(|_| BrokerError::Canceled)
}

/// A handle to a scheduled unit of work (spec.md §4.9). Dropping the handle does not
/// cancel the task — call [`Task::request_cancel`] explicitly.
pub struct Task {
    pub id: Uuid,
    cancel: CancellationToken,
}

impl Task {
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Run `first`, and only if it completes without cancellation, run `second` (spec.md
/// §2 supplement: continuation tasks, grounded in `baselib::Task::and_then`).
pub fn and_then<F1, F2, Fut1, Fut2>(
    cancel: CancellationToken,
    first: F1,
    second: F2,
) -> impl Future<Output = ()>
where
    F1: FnOnce() -> Fut1,
    F2: FnOnce() -> Fut2,
    Fut1: Future<Output = bool>,
    Fut2: Future<Output = ()>,
{
    async move {
        if cancel.is_cancelled() {
            return;
        }
        if first().await {
            second().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test]
    async fn scheduled_task_reports_completion() {
        let (eq, mut events) = ExecutionQueue::new(4);
        let scheduler = Scheduler::new(2);
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();

        scheduler.schedule(&eq, Pool::GeneralPurpose, async move {
            ran_clone.store(true, Ordering::SeqCst);
        });

        let mut saw_completed = false;
        for _ in 0..4 {
            match events.recv().await.unwrap() {
                ExecutionEvent::Completed(_) | ExecutionEvent::AllCompleted => saw_completed = true,
                _ => {}
            }
            if saw_completed && ran.load(Ordering::SeqCst) {
                break;
            }
        }
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn canceled_task_reports_discarded_not_completed() {
        let (eq, mut events) = ExecutionQueue::new(4);
        let scheduler = Scheduler::new(2);

        let task = scheduler.schedule(&eq, Pool::GeneralPurpose, async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        task.request_cancel();

        let mut discarded = false;
        for _ in 0..4 {
            if let ExecutionEvent::Discarded(id) = events.recv().await.unwrap() {
                assert_eq!(id, task.id);
                discarded = true;
                break;
            }
        }
        assert!(discarded);
    }

    #[tokio::test]
    async fn execution_queue_bounds_concurrency() {
        let (eq, _events) = ExecutionQueue::new(1);
        let scheduler = Scheduler::new(4);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            scheduler.schedule(&eq, Pool::GeneralPurpose, async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
