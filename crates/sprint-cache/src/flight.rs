//! Single-flight coalescing.
//!
//! The first worker to claim a fingerprint performs the upstream call;
//! everyone else parks on a watch channel and receives the same outcome.
//! A claim is a scoped resource: dropping the guard without fulfilling it
//! releases the slot and wakes the waiters with an error, so a cancelled
//! or panicked claimer can never wedge a fingerprint.

use bytes::Bytes;
use dashmap::DashMap;
use sprint_core::{ErrorKind, Fingerprint};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::debug;

type FlightOutcome = Result<Bytes, ErrorKind>;

#[derive(Debug)]
pub(crate) struct FlightTable {
    slots: DashMap<Fingerprint, watch::Sender<Option<FlightOutcome>>>,
}

impl FlightTable {
    pub fn new() -> Self {
        Self { slots: DashMap::new() }
    }

    /// Try to become the single flier for `fp`.
    pub fn claim(self: &Arc<Self>, fp: Fingerprint) -> ClaimResult {
        use dashmap::mapref::entry::Entry;
        match self.slots.entry(fp) {
            Entry::Occupied(occupied) => {
                ClaimResult::AlreadyInFlight(Waiter { rx: occupied.get().subscribe() })
            }
            Entry::Vacant(vacant) => {
                let (tx, _rx) = watch::channel(None);
                vacant.insert(tx);
                ClaimResult::Claimed(ClaimGuard { table: Arc::clone(self), fp, done: false })
            }
        }
    }

    /// A waiter for an already-claimed fingerprint, if any.
    pub fn waiter(&self, fp: &Fingerprint) -> Option<Waiter> {
        self.slots.get(fp).map(|slot| Waiter { rx: slot.subscribe() })
    }

    pub fn in_flight_count(&self) -> usize {
        self.slots.len()
    }

    fn complete(&self, fp: &Fingerprint, outcome: FlightOutcome) {
        if let Some((_, tx)) = self.slots.remove(fp) {
            // Waiters may all be gone; that's fine.
            let _ = tx.send(Some(outcome));
        }
    }
}

/// Result of a claim attempt.
pub enum ClaimResult {
    /// Caller owns the flight and must fulfill (or drop) the guard.
    Claimed(ClaimGuard),
    /// Someone else is already fetching; wait on their outcome.
    AlreadyInFlight(Waiter),
}

/// Exclusive right to fetch one fingerprint upstream.
#[derive(Debug)]
pub struct ClaimGuard {
    table: Arc<FlightTable>,
    fp: Fingerprint,
    done: bool,
}

impl ClaimGuard {
    pub fn fingerprint(&self) -> Fingerprint {
        self.fp
    }

    /// Publish the outcome to every waiter and release the slot.
    pub fn fulfill(mut self, outcome: Result<Bytes, ErrorKind>) {
        self.done = true;
        self.table.complete(&self.fp, outcome);
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.done {
            debug!(fingerprint = %self.fp, "in-flight claim abandoned");
            self.table
                .complete(&self.fp, Err(ErrorKind::upstream("in-flight request abandoned")));
        }
    }
}

/// Handle for losers of the claim race.
pub struct Waiter {
    rx: watch::Receiver<Option<FlightOutcome>>,
}

impl Waiter {
    /// Wait for the flier's outcome, bounded by the caller's deadline.
    pub async fn wait(mut self, deadline: Instant) -> Result<Bytes, ErrorKind> {
        loop {
            if let Some(outcome) = self.rx.borrow_and_update().clone() {
                return outcome;
            }
            match tokio::time::timeout_at(deadline.into(), self.rx.changed()).await {
                Ok(Ok(())) => continue,
                // Sender dropped without a value: claimer vanished.
                Ok(Err(_)) => return Err(ErrorKind::upstream("in-flight request abandoned")),
                Err(_) => return Err(ErrorKind::DeadlineExceeded),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fp(n: u8) -> Fingerprint {
        Fingerprint::from_raw([n; 32])
    }

    #[tokio::test]
    async fn test_first_claim_wins() {
        let table = Arc::new(FlightTable::new());
        let first = table.claim(fp(1));
        assert!(matches!(first, ClaimResult::Claimed(_)));
        let second = table.claim(fp(1));
        assert!(matches!(second, ClaimResult::AlreadyInFlight(_)));
        assert_eq!(table.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn test_waiters_receive_fulfillment() {
        let table = Arc::new(FlightTable::new());
        let ClaimResult::Claimed(guard) = table.claim(fp(1)) else {
            panic!("expected claim");
        };

        let mut waiters = Vec::new();
        for _ in 0..10 {
            let ClaimResult::AlreadyInFlight(waiter) = table.claim(fp(1)) else {
                panic!("expected in-flight");
            };
            let deadline = Instant::now() + Duration::from_secs(1);
            waiters.push(tokio::spawn(waiter.wait(deadline)));
        }

        guard.fulfill(Ok(Bytes::from_static(b"answer")));

        for handle in waiters {
            let got = handle.await.unwrap().unwrap();
            assert_eq!(&got[..], b"answer");
        }
        assert_eq!(table.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_waiter_deadline() {
        let table = Arc::new(FlightTable::new());
        let ClaimResult::Claimed(_guard) = table.claim(fp(1)) else {
            panic!("expected claim");
        };
        let ClaimResult::AlreadyInFlight(waiter) = table.claim(fp(1)) else {
            panic!("expected in-flight");
        };

        let deadline = Instant::now() + Duration::from_millis(20);
        let outcome = waiter.wait(deadline).await;
        assert_eq!(outcome.unwrap_err(), ErrorKind::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_dropped_guard_wakes_waiters_with_error() {
        let table = Arc::new(FlightTable::new());
        let ClaimResult::Claimed(guard) = table.claim(fp(1)) else {
            panic!("expected claim");
        };
        let ClaimResult::AlreadyInFlight(waiter) = table.claim(fp(1)) else {
            panic!("expected in-flight");
        };

        drop(guard);
        let outcome = waiter.wait(Instant::now() + Duration::from_secs(1)).await;
        assert!(matches!(outcome.unwrap_err(), ErrorKind::Upstream { .. }));
        assert_eq!(table.in_flight_count(), 0);

        // The slot is free again.
        assert!(matches!(table.claim(fp(1)), ClaimResult::Claimed(_)));
    }

    #[tokio::test]
    async fn test_error_outcome_propagates() {
        let table = Arc::new(FlightTable::new());
        let ClaimResult::Claimed(guard) = table.claim(fp(1)) else {
            panic!("expected claim");
        };
        let ClaimResult::AlreadyInFlight(waiter) = table.claim(fp(1)) else {
            panic!("expected in-flight");
        };

        guard.fulfill(Err(ErrorKind::circuit_open("ethereum")));
        let outcome = waiter.wait(Instant::now() + Duration::from_secs(1)).await;
        assert!(matches!(outcome.unwrap_err(), ErrorKind::CircuitOpen { .. }));
    }
}
