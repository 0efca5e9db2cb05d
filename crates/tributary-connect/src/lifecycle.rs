//! Receiver lifecycle: state, stop flag and cancellation
//!
//! The state only moves forward (`Created -> Provisioning -> Streaming`) and
//! `Stopped` is terminal. Stopping is level-triggered: once set, every later
//! check observes it, and every pending wait on [`Lifecycle::cancelled`] wakes.

use crate::error::ConnectorError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{error, info};

/// Receiver lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LifecycleState {
    Created = 0,
    Provisioning = 1,
    Streaming = 2,
    Stopped = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Provisioning,
            2 => Self::Streaming,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Streaming => write!(f, "streaming"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why a receiver stopped
#[derive(Debug, Clone)]
pub enum StopCause {
    /// Stop requested by the supervisor
    Requested(String),
    /// Unrecoverable failure inside the receiver
    Failed(Arc<ConnectorError>),
}

impl StopCause {
    pub fn requested(reason: impl Into<String>) -> Self {
        Self::Requested(reason.into())
    }

    pub fn failed(error: impl Into<ConnectorError>) -> Self {
        Self::Failed(Arc::new(error.into()))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// The originating error, if the receiver failed
    pub fn error(&self) -> Option<&ConnectorError> {
        match self {
            Self::Failed(e) => Some(e),
            Self::Requested(_) => None,
        }
    }
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested(reason) => write!(f, "stop requested: {}", reason),
            Self::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Supervisor callback invoked exactly once per receiver, when it stops.
pub trait StopHook: Send + Sync {
    fn on_stop(&self, receiver: &str, cause: &StopCause);
}

/// Stop hook that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingStopHook;

impl StopHook for LoggingStopHook {
    fn on_stop(&self, receiver: &str, cause: &StopCause) {
        match cause {
            StopCause::Requested(reason) => {
                info!(receiver = %receiver, reason = %reason, "Receiver stopped")
            }
            StopCause::Failed(e) => error!(receiver = %receiver, error = %e, "Receiver failed"),
        }
    }
}

/// Lifecycle state shared by the provisioner, the fetch loop and `stop`.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    cancel: CancellationToken,
    cause: Mutex<Option<StopCause>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Created as u8),
            cancel: CancellationToken::new(),
            cause: Mutex::new(None),
        }
    }

    #[inline]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.state() == LifecycleState::Stopped
    }

    /// Move forward to `next`.
    ///
    /// Fails when already stopped or when `next` is not ahead of the current
    /// state. `Stopped` can only be entered through [`Lifecycle::stop`].
    pub fn advance(&self, next: LifecycleState) -> bool {
        if next == LifecycleState::Stopped {
            return false;
        }
        let target = next as u8;
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < target).then_some(target)
            })
            .is_ok()
    }

    /// Enter `Stopped`. Returns `true` for the first caller only.
    ///
    /// The cause slot is locked across the state swap, so anyone who observes
    /// `Stopped` and then reads [`Lifecycle::cause`] sees the recorded cause.
    pub fn stop(&self, cause: StopCause) -> bool {
        let mut slot = self.cause.lock();
        let previous = self
            .state
            .swap(LifecycleState::Stopped as u8, Ordering::AcqRel);
        if previous == LifecycleState::Stopped as u8 {
            return false;
        }
        *slot = Some(cause);
        drop(slot);
        self.cancel.cancel();
        true
    }

    /// Cause recorded by the first `stop`
    pub fn cause(&self) -> Option<StopCause> {
        self.cause.lock().clone()
    }

    /// Resolves once the lifecycle is stopped
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_created() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Created);
        assert!(!lifecycle.is_stopped());
        assert!(lifecycle.cause().is_none());
    }

    #[test]
    fn test_advances_forward_only() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.advance(LifecycleState::Provisioning));
        assert!(lifecycle.advance(LifecycleState::Streaming));
        assert!(!lifecycle.advance(LifecycleState::Provisioning));
        assert_eq!(lifecycle.state(), LifecycleState::Streaming);
    }

    #[test]
    fn test_cannot_advance_into_or_out_of_stopped() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.advance(LifecycleState::Stopped));
        assert!(lifecycle.stop(StopCause::requested("test")));
        assert!(!lifecycle.advance(LifecycleState::Streaming));
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.stop(StopCause::requested("first")));
        assert!(!lifecycle.stop(StopCause::failed(ConnectorError::fatal("second"))));

        let cause = lifecycle.cause().unwrap();
        assert!(!cause.is_failure());
        assert_eq!(cause.to_string(), "stop requested: first");
    }

    #[test]
    fn test_cause_visible_once_stopped() {
        for _ in 0..200 {
            let lifecycle = Arc::new(Lifecycle::new());
            let observer = {
                let lifecycle = lifecycle.clone();
                std::thread::spawn(move || {
                    while !lifecycle.is_stopped() {
                        std::hint::spin_loop();
                    }
                    lifecycle.cause()
                })
            };
            lifecycle.stop(StopCause::requested("external"));
            let cause = observer.join().unwrap();
            assert_eq!(cause.unwrap().to_string(), "stop requested: external");
        }
    }

    #[tokio::test]
    async fn test_stop_wakes_waiters() {
        let lifecycle = Arc::new(Lifecycle::new());
        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.cancelled().await })
        };
        lifecycle.stop(StopCause::requested("shutdown"));
        waiter.await.unwrap();
    }

    #[test]
    fn test_failed_cause_exposes_error() {
        let cause = StopCause::failed(ConnectorError::fatal("boom"));
        assert!(cause.is_failure());
        assert!(matches!(cause.error(), Some(ConnectorError::Fatal(_))));
        assert_eq!(cause.to_string(), "failed: fatal error: boom");
    }
}
