// Single-flight refresh coordination
//
// All authorization failures funnel through `RefreshCoordinator::await_fresh_token`.
// The first one while idle starts the exchange; everyone else parks a oneshot
// sender in the wait queue. When the exchange resolves, the queue is drained in
// FIFO order and every waiter receives exactly one `Resumption`.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

use super::refresh::RefreshExchange;
use super::store::CredentialStore;
use super::types::{Credentials, SessionEvent, TokenPair};
use crate::error::{ClientError, RefreshExchangeError};
use crate::metrics::AuthMetrics;

/// Capacity of the session event channel
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// What a waiting call is told when the refresh cycle ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumption {
    /// Credentials were rotated; send again with the current token
    Refreshed,
    /// The session is gone; fail with `SessionExpired`
    Expired,
}

/// A suspended call waiting for the in-flight refresh
type PendingCall = oneshot::Sender<Resumption>;

enum RefreshState {
    Idle,
    Refreshing(Cycle),
}

/// One refresh exchange and everyone waiting on it
struct Cycle {
    id: u64,
    /// The call that triggered the exchange; resolved after the queue
    refresher: PendingCall,
    /// FIFO wait queue
    queue: Vec<PendingCall>,
}

enum Entry {
    /// Tokens already changed since the rejected attempt was sent
    RetryNow,
    /// No session to refresh
    Expired,
    Wait(oneshot::Receiver<Resumption>),
}

struct Shared {
    state: Mutex<RefreshState>,
    next_cycle: AtomicU64,
    store: Arc<CredentialStore>,
    exchange: Arc<dyn RefreshExchange>,
    events: broadcast::Sender<SessionEvent>,
    metrics: Arc<AuthMetrics>,
    refresh_timeout: Duration,
}

/// Ensures at most one refresh exchange is in flight and that every call
/// caught behind it is resumed or failed exactly once.
#[derive(Clone)]
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        exchange: Arc<dyn RefreshExchange>,
        metrics: Arc<AuthMetrics>,
        refresh_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RefreshState::Idle),
                next_cycle: AtomicU64::new(1),
                store,
                exchange,
                events,
                metrics,
                refresh_timeout,
            }),
        }
    }

    /// Receive session events (refresh, expiry, login, logout)
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.shared.store
    }

    pub fn metrics(&self) -> &Arc<AuthMetrics> {
        &self.shared.metrics
    }

    /// True while an exchange is in flight
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.lock(), RefreshState::Refreshing(_))
    }

    /// Number of calls parked behind the in-flight exchange (excluding the
    /// one that triggered it)
    pub fn queued(&self) -> usize {
        match &*self.lock() {
            RefreshState::Idle => 0,
            RefreshState::Refreshing(cycle) => cycle.queue.len(),
        }
    }

    pub(crate) fn notify(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.shared.events.send(event);
    }

    /// Handle an authorization failure for an attempt that was sent with the
    /// tokens of `seen_generation`.
    ///
    /// Returns `Ok(())` once fresh credentials are in the store and the call
    /// should be sent again, or `SessionExpired` if the session could not be
    /// refreshed.
    pub async fn await_fresh_token(&self, seen_generation: u64) -> Result<(), ClientError> {
        let rx = match self.enter(seen_generation) {
            Entry::RetryNow => return Ok(()),
            Entry::Expired => return Err(ClientError::SessionExpired),
            Entry::Wait(rx) => rx,
        };

        match rx.await {
            Ok(Resumption::Refreshed) => Ok(()),
            Ok(Resumption::Expired) => Err(ClientError::SessionExpired),
            // The exchange task was dropped along with the runtime
            Err(_) => Err(ClientError::SessionExpired),
        }
    }

    fn enter(&self, seen_generation: u64) -> Entry {
        let mut state = self.lock();

        if let RefreshState::Refreshing(cycle) = &mut *state {
            let (tx, rx) = oneshot::channel();
            cycle.queue.push(tx);
            self.shared.metrics.record_queued();
            tracing::debug!(
                cycle = cycle.id,
                queued = cycle.queue.len(),
                "Refresh in flight, waiting"
            );
            return Entry::Wait(rx);
        }

        let creds = self.shared.store.get();
        if !creds.valid {
            tracing::debug!("Authorization failure without a session");
            return Entry::Expired;
        }

        if creds.generation != seen_generation {
            self.shared.metrics.record_stale_token_retry();
            tracing::debug!(
                seen_generation,
                current_generation = creds.generation,
                "Token already rotated, retrying without refresh"
            );
            return Entry::RetryNow;
        }

        let id = self.shared.next_cycle.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        *state = RefreshState::Refreshing(Cycle {
            id,
            refresher: tx,
            queue: Vec::new(),
        });
        self.shared.metrics.record_refresh_started();
        tracing::info!(
            cycle = id,
            role = %creds.role,
            generation = creds.generation,
            "Authorization failed, starting token refresh"
        );

        self.spawn_exchange(id, creds);
        Entry::Wait(rx)
    }

    /// Run the exchange in its own task so that cancelling the triggering
    /// caller cannot strand the queue.
    fn spawn_exchange(&self, cycle: u64, creds: Credentials) {
        let coordinator = self.clone();

        tokio::spawn(async move {
            let mut guard = CycleGuard {
                coordinator: coordinator.clone(),
                cycle,
                armed: true,
            };

            let timeout = coordinator.shared.refresh_timeout;
            let exchange = AssertUnwindSafe(
                coordinator
                    .shared
                    .exchange
                    .exchange(creds.role, &creds.refresh_token),
            )
            .catch_unwind();

            let outcome = match tokio::time::timeout(timeout, exchange).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(RefreshExchangeError::Panicked),
                Err(_) => Err(RefreshExchangeError::Timeout(timeout)),
            };

            guard.armed = false;
            coordinator.complete(cycle, creds.generation, outcome);
        });
    }

    /// Resolve the cycle: update the store, go back to idle and release
    /// every waiter.
    ///
    /// The store is written before the state lock is taken, so persistence
    /// never runs under it. Failures arriving meanwhile still join this cycle.
    fn complete(
        &self,
        cycle_id: u64,
        generation: u64,
        outcome: Result<TokenPair, RefreshExchangeError>,
    ) {
        let store = &self.shared.store;

        let (resumption, event) = match outcome {
            Ok(pair) => {
                self.shared.metrics.record_refresh_succeeded();
                match store.set_if_generation(generation, pair.access_token, pair.refresh_token) {
                    Some(new_generation) => {
                        tracing::info!(
                            cycle = cycle_id,
                            generation = new_generation,
                            "Token refresh succeeded, resuming waiting calls"
                        );
                        (
                            Resumption::Refreshed,
                            Some(SessionEvent::Refreshed {
                                generation: new_generation,
                            }),
                        )
                    }
                    None => {
                        // Logged out or in again while the exchange ran
                        let resumption = self.resumption_for_current_session();
                        tracing::warn!(
                            cycle = cycle_id,
                            ?resumption,
                            "Session changed during refresh, discarding refreshed tokens"
                        );
                        (resumption, None)
                    }
                }
            }
            Err(e) => {
                self.shared.metrics.record_refresh_failed();
                if store.clear_if_generation(generation) {
                    tracing::error!(cycle = cycle_id, "Token refresh failed, session expired: {}", e);
                    (
                        Resumption::Expired,
                        Some(SessionEvent::Expired {
                            reason: e.to_string(),
                        }),
                    )
                } else {
                    let resumption = self.resumption_for_current_session();
                    tracing::warn!(
                        cycle = cycle_id,
                        ?resumption,
                        "Token refresh failed after the session changed: {}",
                        e
                    );
                    (resumption, None)
                }
            }
        };

        let Some(cycle) = self.take_cycle(cycle_id) else {
            return;
        };
        tracing::debug!(
            cycle = cycle_id,
            waiters = cycle.queue.len() + 1,
            ?resumption,
            "Releasing waiting calls"
        );
        self.release(cycle, resumption);

        if let Some(event) = event {
            self.notify(event);
        }
    }

    /// End a cycle whose exchange task was dropped before finishing
    /// (runtime shutdown). Waiters fail, the stored session is kept.
    fn abandon(&self, cycle_id: u64) {
        if let Some(cycle) = self.take_cycle(cycle_id) {
            tracing::warn!(
                cycle = cycle_id,
                waiters = cycle.queue.len() + 1,
                "Refresh cancelled, keeping the stored session"
            );
            self.release(cycle, Resumption::Expired);
        }
    }

    fn resumption_for_current_session(&self) -> Resumption {
        if self.shared.store.get().valid {
            Resumption::Refreshed
        } else {
            Resumption::Expired
        }
    }

    /// Back to idle, handing over the cycle if it is still the current one
    fn take_cycle(&self, cycle_id: u64) -> Option<Cycle> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, RefreshState::Idle) {
            RefreshState::Refreshing(cycle) if cycle.id == cycle_id => Some(cycle),
            other => {
                *state = other;
                None
            }
        }
    }

    /// Queue first in FIFO order, then the refresher
    fn release(&self, cycle: Cycle, resumption: Resumption) {
        let Cycle {
            refresher, queue, ..
        } = cycle;
        for waiter in queue.into_iter().chain(std::iter::once(refresher)) {
            self.shared
                .metrics
                .record_resolved(resumption == Resumption::Refreshed);
            // A caller that gave up has dropped its receiver
            let _ = waiter.send(resumption);
        }
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the cycle if the exchange task is dropped without completing it
struct CycleGuard {
    coordinator: RefreshCoordinator,
    cycle: u64,
    armed: bool,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.abandon(self.cycle);
        }
    }
}
