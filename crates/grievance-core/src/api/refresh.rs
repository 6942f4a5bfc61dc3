//! Single-flight token refresh.
//!
//! At most one refresh call is outstanding per client. The first request to
//! see a 401 creates the ticket and issues the call; every 401 that arrives
//! while the ticket exists joins it and awaits the same shared outcome. The
//! ticket is removed by the refresh future itself the moment the call
//! settles, before any joiner observes the result, so the next 401 after
//! that starts a fresh cycle.
//!
//! The refresh call only makes progress while someone awaits it. If every
//! caller is dropped before it settles, the ticket stays and `state()` keeps
//! reporting `Refreshing` until the next 401 joins and drives the call to
//! completion. The future holds the coordinator weakly, so an abandoned
//! ticket is freed together with its client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use super::ApiError;

/// Result every joiner of one refresh receives: the new access token or the
/// single refresh error.
pub type RefreshOutcome = Result<String, ApiError>;

pub(crate) type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

/// How a caller took part in a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshRole {
    /// Created the ticket and issued the refresh call.
    Initiator,
    /// Joined a refresh already in flight.
    Waiter,
}

struct Ticket {
    id: u64,
    outcome: SharedRefresh,
    waiters: usize,
}

#[derive(Default)]
pub struct RefreshCoordinator {
    // Never held across an await
    ticket: Mutex<Option<Ticket>>,
    next_id: AtomicU64,
    started: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RefreshState {
        if self.slot().is_some() {
            RefreshState::Refreshing
        } else {
            RefreshState::Idle
        }
    }

    /// Number of refresh calls issued over the coordinator's lifetime.
    pub fn refresh_count(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    /// Join the in-flight refresh, or become the initiator and start one
    /// with `start`. `start` is only invoked for the initiator.
    pub fn join_or_start<F>(self: &Arc<Self>, start: F) -> (RefreshRole, SharedRefresh)
    where
        F: FnOnce() -> BoxFuture<'static, RefreshOutcome>,
    {
        let mut slot = self.slot();

        if let Some(ticket) = slot.as_mut() {
            ticket.waiters += 1;
            debug!(ticket = ticket.id, waiters = ticket.waiters, "Joined in-flight token refresh");
            return (RefreshRole::Waiter, ticket.outcome.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.started.fetch_add(1, Ordering::SeqCst);

        let refresh = start();
        let coordinator: Weak<Self> = Arc::downgrade(self);
        let outcome = async move {
            let outcome = refresh.await;
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.settle(id, outcome.is_ok());
            }
            outcome
        }
        .boxed()
        .shared();

        *slot = Some(Ticket {
            id,
            outcome: outcome.clone(),
            waiters: 0,
        });
        debug!(ticket = id, "Started token refresh");

        (RefreshRole::Initiator, outcome)
    }

    fn settle(&self, id: u64, succeeded: bool) {
        let mut slot = self.slot();
        if slot.as_ref().map(|t| t.id) == Some(id) {
            if let Some(ticket) = slot.take() {
                debug!(ticket = id, waiters = ticket.waiters, succeeded, "Token refresh settled");
            }
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Ticket>> {
        // The guarded data is a plain Option; a panic elsewhere cannot leave it torn
        self.ticket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn pending_refresh(
        calls: &Arc<AtomicUsize>,
        rx: oneshot::Receiver<RefreshOutcome>,
    ) -> impl FnOnce() -> BoxFuture<'static, RefreshOutcome> {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                rx.await
                    .unwrap_or_else(|_| Err(ApiError::network("refresh sender dropped")))
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_joiners_share_one_call() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let (first_role, first) = coordinator.join_or_start(pending_refresh(&calls, rx));
        assert_eq!(first_role, RefreshRole::Initiator);
        assert_eq!(coordinator.state(), RefreshState::Refreshing);

        let mut joiners = Vec::new();
        for _ in 0..4 {
            let (_, never_rx) = oneshot::channel();
            let (role, outcome) = coordinator.join_or_start(pending_refresh(&calls, never_rx));
            assert_eq!(role, RefreshRole::Waiter);
            joiners.push(outcome);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tx.send(Ok("new123".to_string())).expect("receiver alive");

        assert_eq!(first.await.as_deref(), Ok("new123"));
        for outcome in joiners {
            assert_eq!(outcome.await.as_deref(), Ok("new123"));
        }
        assert_eq!(coordinator.state(), RefreshState::Idle);
        assert_eq!(coordinator.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_delivered_to_all_and_ticket_cleared() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let (_, first) = coordinator.join_or_start(pending_refresh(&calls, rx));
        let (_, never_rx) = oneshot::channel();
        let (_, second) = coordinator.join_or_start(pending_refresh(&calls, never_rx));

        let expired = ApiError::token_expired("gone");
        tx.send(Err(expired.clone())).expect("receiver alive");

        assert_eq!(first.await, Err(expired.clone()));
        assert_eq!(second.await, Err(expired));
        assert_eq!(coordinator.state(), RefreshState::Idle);

        // The next 401 starts a new cycle
        let (tx, rx) = oneshot::channel();
        let (role, outcome) = coordinator.join_or_start(pending_refresh(&calls, rx));
        assert_eq!(role, RefreshRole::Initiator);
        tx.send(Ok("again".to_string())).expect("receiver alive");
        assert_eq!(outcome.await.as_deref(), Ok("again"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_initiator_does_not_strand_waiters() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let (_, initiator) = coordinator.join_or_start(pending_refresh(&calls, rx));
        let (_, never_rx) = oneshot::channel();
        let (_, waiter) = coordinator.join_or_start(pending_refresh(&calls, never_rx));
        drop(initiator);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(Ok("late".to_string()));
        });

        assert_eq!(waiter.await.as_deref(), Ok("late"));
        assert_eq!(coordinator.state(), RefreshState::Idle);
    }

    #[tokio::test]
    async fn test_abandoned_ticket_resumes_on_next_join() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let (_, abandoned) = coordinator.join_or_start(pending_refresh(&calls, rx));
        drop(abandoned);
        assert_eq!(coordinator.state(), RefreshState::Refreshing);
        // The pending future does not keep its coordinator alive
        assert_eq!(Arc::strong_count(&coordinator), 1);

        let (_, never_rx) = oneshot::channel();
        let (role, outcome) = coordinator.join_or_start(pending_refresh(&calls, never_rx));
        assert_eq!(role, RefreshRole::Waiter);
        tx.send(Ok("resumed".to_string())).expect("receiver alive");
        assert_eq!(outcome.await.as_deref(), Ok("resumed"));
        assert_eq!(coordinator.state(), RefreshState::Idle);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
