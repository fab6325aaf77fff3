//! # Fatal abort coordination
//!
//! Any worker that hits an unrecoverable condition publishes the error through
//! an [`AbortHandle`]. Exactly one [`AbortCoordinator`] receives it, cancels
//! every worker, runs cleanup once and hands the outcome back to `main`.
//!
//! ```text
//! Running ──fatal error──▶ FatalReceived ──▶ CleaningUp ──▶ Exited
//!    │                                          ▲
//!    └──────────────shutdown request────────────┘
//! ```
//!
//! The first published error wins; later ones are logged and dropped.

use crate::error::OscError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortState {
    Running,
    FatalReceived,
    CleaningUp,
    Exited,
}

/// How the coordinator finished.
#[derive(Debug)]
pub enum AbortOutcome {
    /// A worker published a fatal error
    Fatal(OscError),
    /// Orderly shutdown (operator interrupt or completed migration)
    Shutdown,
}

impl AbortOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Fatal(_) => 1,
            Self::Shutdown => 0,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Create a connected handle/coordinator pair.
pub fn abort_channel() -> (AbortHandle, AbortCoordinator) {
    let (tx, rx) = mpsc::channel(1);
    let token = CancellationToken::new();
    let (state_tx, _) = watch::channel(AbortState::Running);

    let handle = AbortHandle {
        tx,
        token: token.clone(),
    };
    let coordinator = AbortCoordinator {
        rx,
        token,
        state: state_tx,
    };
    (handle, coordinator)
}

/// Cloneable sender side, held by every worker.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: mpsc::Sender<OscError>,
    token: CancellationToken,
}

impl AbortHandle {
    /// Publish a fatal error and cancel all workers. Never blocks.
    pub fn abort(&self, err: OscError) {
        error!(error = %err, code = err.error_code(), "Fatal error, aborting migration");
        if let Err(e) = self.tx.try_send(err) {
            warn!(error = %e, "Abort already in progress, dropping error");
        }
        self.token.cancel();
    }

    /// True once an abort or shutdown has been requested.
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token workers select on to stop early.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Resolves once an abort or shutdown has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Receiver side, owned by `main`.
#[derive(Debug)]
pub struct AbortCoordinator {
    rx: mpsc::Receiver<OscError>,
    token: CancellationToken,
    state: watch::Sender<AbortState>,
}

impl AbortCoordinator {
    /// Current state.
    pub fn state(&self) -> AbortState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<AbortState> {
        self.state.subscribe()
    }

    /// Wait for a fatal error or `shutdown`, then run `cleanup` once.
    pub async fn run<S, F, Fut>(mut self, shutdown: S, cleanup: F) -> AbortOutcome
    where
        S: Future<Output = ()>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let outcome = tokio::select! {
            Some(err) = self.rx.recv() => {
                self.state.send_replace(AbortState::FatalReceived);
                AbortOutcome::Fatal(err)
            }
            _ = shutdown => {
                info!("Shutdown requested");
                AbortOutcome::Shutdown
            }
        };

        self.token.cancel();
        self.state.send_replace(AbortState::CleaningUp);
        cleanup().await;
        self.state.send_replace(AbortState::Exited);

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fatal_error_runs_cleanup_once() {
        let (handle, coordinator) = abort_channel();
        let mut states = coordinator.subscribe();
        assert_eq!(coordinator.state(), AbortState::Running);

        let worker = handle.clone();
        tokio::spawn(async move {
            worker.abort(OscError::other("applier failed"));
        });

        let cleanups = Arc::new(AtomicUsize::new(0));
        let counter = cleanups.clone();
        let outcome = coordinator
            .run(std::future::pending(), || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        match outcome {
            AbortOutcome::Fatal(err) => assert_eq!(err.to_string(), "applier failed"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(handle.is_aborted());
        assert_eq!(*states.borrow_and_update(), AbortState::Exited);
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let (handle, coordinator) = abort_channel();
        handle.abort(OscError::other("first"));
        handle.abort(OscError::other("second"));

        let outcome = coordinator.run(std::future::pending(), || async {}).await;
        match outcome {
            AbortOutcome::Fatal(err) => assert_eq!(err.to_string(), "first"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_outcome() {
        let (handle, coordinator) = abort_channel();
        let token = handle.cancellation_token();

        let outcome = coordinator.run(async {}, || async {}).await;
        assert!(!outcome.is_fatal());
        assert_eq!(outcome.exit_code(), 0);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_workers_observe_cancellation() {
        let (handle, coordinator) = abort_channel();
        let worker = handle.clone();
        let task = tokio::spawn(async move {
            worker.cancelled().await;
            true
        });

        handle.abort(OscError::timeout("lock"));
        let outcome = coordinator.run(std::future::pending(), || async {}).await;
        assert_eq!(outcome.exit_code(), 1);
        assert!(task.await.unwrap());
    }
}
