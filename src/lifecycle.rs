//! Lifecycle & Shutdown (spec.md §4.10): turns SIGINT/SIGTERM/SIGQUIT into an ordered
//! drain sequence with a deadline, and reports whether the drain finished cleanly so the
//! binary can choose its exit code.

use crate::error::BrokerError;
use crate::queue::PeerQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Broker-wide lifecycle state, shared by the acceptors, dispatcher and shutdown task.
/// Two independent tokens so that "stop admitting new connections" and "finish in-flight
/// writes" can be signaled at different points in the sequence (spec.md §4.10 step 1 vs.
/// step 3): `accept_shutdown` is cancelled the moment a shutdown signal arrives, so
/// acceptors close immediately; `writer_shutdown` is cancelled only once the drain
/// deadline has been given a chance to flush queued blocks, so outbound write loops keep
/// running through the drain window instead of being torn down alongside the acceptors.
pub struct Lifecycle {
    accept_shutdown: CancellationToken,
    writer_shutdown: CancellationToken,
    draining: AtomicBool,
}

impl Lifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            accept_shutdown: CancellationToken::new(),
            writer_shutdown: CancellationToken::new(),
            draining: AtomicBool::new(false),
        })
    }

    /// Token acceptors and the dispatcher select on to stop admitting new connections
    /// and new work (spec.md §4.10 step 1).
    pub fn accept_shutdown_token(&self) -> CancellationToken {
        self.accept_shutdown.clone()
    }

    /// Token outbound write-drain loops select on. Stays live through the drain window so
    /// queued blocks can still be flushed to peers; cancel it with
    /// [`Lifecycle::begin_writer_shutdown`] once the drain sequence has finished.
    pub fn writer_shutdown_token(&self) -> CancellationToken {
        self.writer_shutdown.clone()
    }

    /// Tear down any still-running writer loops once the drain sequence has completed or
    /// given up (spec.md §4.10 step 4: disposal after the drain window closes).
    pub fn begin_writer_shutdown(&self) {
        self.writer_shutdown.cancel();
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Wait for SIGINT, SIGTERM, or SIGQUIT (spec.md §4.10) and begin draining. Returns
    /// once a signal is observed; the caller is expected to then run [`drain_queues`] and
    /// finally [`Lifecycle::begin_writer_shutdown`].
    pub async fn wait_for_shutdown_signal(&self) {
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigquit.recv() => info!("received SIGQUIT"),
        }
        self.draining.store(true, Ordering::SeqCst);
        self.accept_shutdown.cancel();
    }
}

/// Outcome of a drain attempt. spec.md §4.10's general language says a non-zero code
/// follows a deadline elapsing, but §8 Scenario E — the literal worked example of this
/// case — states the broker "exits with code 0" even when the deadline aborts
/// outstanding operations. Taking the scenario as authoritative: the deadline-triggered
/// abort is the designed backstop for a saturated drain, not a failure, so both outcomes
/// map to 0. Non-zero exit codes are reserved for configuration (1) and runtime (2)
/// failures per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Clean,
    DeadlineElapsed,
}

impl DrainOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            DrainOutcome::Clean => 0,
            DrainOutcome::DeadlineElapsed => 0,
        }
    }
}

/// Run the drain sequence: wait up to `deadline` for every peer queue the registry knows
/// about to empty, then fail whatever is left with `operation_aborted` (spec.md §4.10
/// step 3). Acceptors and the dispatcher are expected to have already stopped admitting
/// new work by the time this is called (steps 1-2 are the caller's responsibility, since
/// they own the listener sockets and the dispatch loop).
pub async fn drain_queues(queues: Vec<Arc<PeerQueue>>, deadline: Duration) -> DrainOutcome {
    let start = tokio::time::Instant::now();
    loop {
        let mut total_outstanding = 0usize;
        for queue in &queues {
            total_outstanding += queue.len().await;
        }
        if total_outstanding == 0 {
            info!("all peer queues drained cleanly");
            return DrainOutcome::Clean;
        }
        if start.elapsed() >= deadline {
            warn!(total_outstanding, "drain deadline elapsed, aborting outstanding operations");
            for queue in &queues {
                queue.fail_all(BrokerError::Canceled).await;
            }
            return DrainOutcome::DeadlineElapsed;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
