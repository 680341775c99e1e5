use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::error::AffinityError;

#[derive(Debug, Default)]
struct GateState {
    in_flight: usize,
    migrating: bool,
}

/// Exclusive gate serializing ownership migration against in-flight
/// marshalled work.
///
/// Marshalled operations hold a [`GatePass`] for as long as they are in
/// flight. A migration takes the single [`MigrationPermit`], which first
/// holds back new passes and then waits for outstanding passes to drain.
#[derive(Debug, Default)]
pub struct MigrationGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

/// Proof that one marshalled operation is in flight.
#[derive(Debug)]
pub struct GatePass<'a> {
    gate: &'a MigrationGate,
}

/// Exclusive right to change ownership; released on drop.
#[derive(Debug)]
pub struct MigrationPermit<'a> {
    gate: &'a MigrationGate,
}

impl MigrationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight marshalled operation, waiting out any
    /// migration currently underway.
    pub fn enter(&self, timeout: Option<Duration>) -> Result<GatePass<'_>, AffinityError> {
        let state = self.lock();
        let mut state = self
            .wait_while(state, timeout, |s| s.migrating)
            .map_err(|_| AffinityError::Timeout {
                owner: "migration gate".to_string(),
                after: timeout.unwrap_or_default(),
            })?;
        state.in_flight += 1;
        Ok(GatePass { gate: self })
    }

    /// Take the exclusive migration permit.
    ///
    /// Fails immediately with [`AffinityError::MigrationInProgress`] if
    /// another migration holds it. Otherwise new passes are held back and
    /// this waits until every in-flight pass has been released.
    pub fn begin_migration(
        &self,
        timeout: Option<Duration>,
    ) -> Result<MigrationPermit<'_>, AffinityError> {
        let mut state = self.lock();
        if state.migrating {
            return Err(AffinityError::MigrationInProgress);
        }
        state.migrating = true;
        debug!(in_flight = state.in_flight, "migration gate closed; draining");

        match self.wait_while(state, timeout, |s| s.in_flight > 0) {
            Ok(_) => Ok(MigrationPermit { gate: self }),
            Err(mut state) => {
                state.migrating = false;
                drop(state);
                self.changed.notify_all();
                Err(AffinityError::Timeout {
                    owner: "migration gate".to_string(),
                    after: timeout.unwrap_or_default(),
                })
            }
        }
    }

    /// Number of marshalled operations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Whether a migration currently holds the gate.
    pub fn is_migrating(&self) -> bool {
        self.lock().migrating
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().expect("migration gate lock poisoned")
    }

    /// Wait while `condition` holds. On timeout the guard is handed back as
    /// the error so the caller can repair state.
    fn wait_while<'a>(
        &self,
        guard: MutexGuard<'a, GateState>,
        timeout: Option<Duration>,
        condition: impl FnMut(&mut GateState) -> bool,
    ) -> Result<MutexGuard<'a, GateState>, MutexGuard<'a, GateState>> {
        match timeout {
            None => Ok(self
                .changed
                .wait_while(guard, condition)
                .expect("migration gate lock poisoned")),
            Some(timeout) => {
                let (guard, result) = self
                    .changed
                    .wait_timeout_while(guard, timeout, condition)
                    .expect("migration gate lock poisoned");
                if result.timed_out() {
                    Err(guard)
                } else {
                    Ok(guard)
                }
            }
        }
    }
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        state.in_flight -= 1;
        drop(state);
        self.gate.changed.notify_all();
    }
}

impl Drop for MigrationPermit<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        state.migrating = false;
        drop(state);
        self.gate.changed.notify_all();
    }
}

const PENDING: u8 = 0;
const COMMITTED: u8 = 1;
const ABORTED: u8 = 2;

/// One-shot race between a hand-over committing on the old owner and the
/// migrating caller giving up.
///
/// Exactly one of [`Self::try_commit`] and [`Self::try_abort`] succeeds.
#[derive(Debug, Default)]
pub struct HandOffClaim {
    state: AtomicU8,
}

impl HandOffClaim {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_commit(&self) -> bool {
        self.state
            .compare_exchange(PENDING, COMMITTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn try_abort(&self) -> bool {
        self.state
            .compare_exchange(PENDING, ABORTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_committed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMMITTED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn passes_count_in_flight() {
        let gate = MigrationGate::new();
        let a = gate.enter(None).unwrap();
        let b = gate.enter(None).unwrap();
        assert_eq!(gate.in_flight(), 2);
        drop(a);
        drop(b);
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn second_migration_is_rejected() {
        let gate = MigrationGate::new();
        let _permit = gate.begin_migration(None).unwrap();
        assert!(matches!(
            gate.begin_migration(None),
            Err(AffinityError::MigrationInProgress)
        ));
    }

    #[test]
    fn migration_waits_for_in_flight_work() {
        let gate = Arc::new(MigrationGate::new());
        let pass_gate = Arc::clone(&gate);
        let (tx, rx) = std::sync::mpsc::channel();
        let holder = thread::spawn(move || {
            let _pass = pass_gate.enter(None).unwrap();
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(30));
        });
        rx.recv().unwrap();

        let started = Instant::now();
        let permit = gate.begin_migration(None).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(gate.in_flight(), 0);
        drop(permit);
        holder.join().unwrap();
    }

    #[test]
    fn drain_timeout_reopens_gate() {
        let gate = MigrationGate::new();
        let pass = gate.enter(None).unwrap();
        let result = gate.begin_migration(Some(Duration::from_millis(5)));
        assert!(matches!(result, Err(AffinityError::Timeout { .. })));
        assert!(!gate.is_migrating());
        drop(pass);
        assert!(gate.begin_migration(None).is_ok());
    }

    #[test]
    fn passes_wait_out_a_migration() {
        let gate = Arc::new(MigrationGate::new());
        let permit_gate = Arc::clone(&gate);
        let (tx, rx) = std::sync::mpsc::channel();
        let migrator = thread::spawn(move || {
            let _permit = permit_gate.begin_migration(None).unwrap();
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(30));
        });
        rx.recv().unwrap();

        assert!(matches!(
            gate.enter(Some(Duration::from_millis(5))),
            Err(AffinityError::Timeout { .. })
        ));
        let pass = gate.enter(None).unwrap();
        assert!(!gate.is_migrating());
        drop(pass);
        migrator.join().unwrap();
    }

    #[test]
    fn hand_off_claim_has_one_winner() {
        let claim = HandOffClaim::new();
        assert!(claim.try_commit());
        assert!(!claim.try_abort());
        assert!(claim.is_committed());

        let claim = HandOffClaim::new();
        assert!(claim.try_abort());
        assert!(!claim.try_commit());
        assert!(!claim.is_committed());
    }
}
