//! Per-thread run loops.
//!
//! Every thread that captures an [`AffinityToken`] lazily gets a run loop:
//! an `mpsc` mailbox whose sender hangs off the token. Marshalled work is
//! posted to that mailbox and executed, strictly FIFO, whenever the thread
//! services its loop.

use std::cell::{Cell, RefCell};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::marshal::CallSlot;
use crate::token::AffinityToken;

/// A message delivered to a run loop mailbox.
pub(crate) enum Envelope {
    /// A unit of work to execute.
    Work(UnitOfWork),
    /// A reply slot was filled; a waiting frame should re-check it.
    Wake,
    /// Stop `run_until_shutdown` once the current envelope is handled.
    Shutdown,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Work(_) => f.write_str("Work"),
            Self::Wake => f.write_str("Wake"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// A closure queued for execution on an owning thread.
///
/// If the unit is dropped without running (the owner's mailbox was torn
/// down, or the post failed), its `abandon` hook fires so the waiting caller
/// is released instead of blocking forever.
pub(crate) struct UnitOfWork {
    task: Option<Box<dyn FnOnce() + Send>>,
    abandon: Option<Box<dyn FnOnce() + Send>>,
}

impl UnitOfWork {
    pub(crate) fn new(
        task: impl FnOnce() + Send + 'static,
        abandon: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            task: Some(Box::new(task)),
            abandon: Some(Box::new(abandon)),
        }
    }

    fn run(mut self) {
        self.abandon = None;
        if let Some(task) = self.task.take() {
            task();
        }
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if let Some(abandon) = self.abandon.take() {
            abandon();
        }
    }
}

thread_local! {
    static LOCAL: RunLoop = RunLoop::bound_to_current_thread();
    static IDENTITY: RefCell<Vec<AffinityToken>> = const { RefCell::new(Vec::new()) };
}

/// Identity of the calling code: the innermost detached loop being serviced,
/// otherwise the thread's own token.
pub(crate) fn current_identity() -> AffinityToken {
    IDENTITY
        .with(|stack| stack.borrow().last().cloned())
        .unwrap_or_else(|| LOCAL.with(|local| local.token.clone()))
}

/// Run `f` against the calling thread's own run loop.
pub fn with_current<R>(f: impl FnOnce(&RunLoop) -> R) -> R {
    LOCAL.with(f)
}

/// Execute every unit of work already queued for the calling thread.
pub fn pump_pending() -> usize {
    LOCAL.with(RunLoop::pump_pending)
}

/// Service the calling thread's run loop for `duration`.
pub fn run_for(duration: Duration) -> usize {
    LOCAL.with(|local| local.run_for(duration))
}

/// Service the calling thread's run loop until a shutdown is posted to it.
pub fn run_until_shutdown() -> usize {
    LOCAL.with(RunLoop::run_until_shutdown)
}

struct IdentityGuard;

impl IdentityGuard {
    fn push(token: AffinityToken) -> Self {
        IDENTITY.with(|stack| stack.borrow_mut().push(token));
        IdentityGuard
    }
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        IDENTITY.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// A FIFO mailbox of units of work plus the loop that services it.
///
/// Each OS thread has one, created on first use. [`RunLoop::detached`]
/// creates a free-standing loop with a simulated identity that any thread
/// may pump; while it executes one of that loop's units of work,
/// [`AffinityToken::capture`] returns the loop's token.
pub struct RunLoop {
    token: AffinityToken,
    mailbox: Receiver<Envelope>,
    shutdown: Cell<bool>,
}

impl RunLoop {
    fn bound_to_current_thread() -> Self {
        let current = thread::current();
        let (tx, rx) = mpsc::channel();
        Self {
            token: AffinityToken::new(current.name(), Some(current.id()), tx),
            mailbox: rx,
            shutdown: Cell::new(false),
        }
    }

    /// A run loop with a simulated identity, not bound to any OS thread.
    pub fn detached(label: impl Into<String>) -> Self {
        let label = label.into();
        let (tx, rx) = mpsc::channel();
        Self {
            token: AffinityToken::new(Some(&label), None, tx),
            mailbox: rx,
            shutdown: Cell::new(false),
        }
    }

    /// The identity work must target to run on this loop.
    pub fn token(&self) -> &AffinityToken {
        &self.token
    }

    /// Whether a shutdown envelope has been received.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.get()
    }

    /// Execute every queued unit of work without blocking. Returns the
    /// number executed.
    pub fn pump_pending(&self) -> usize {
        let mut executed = 0;
        while let Ok(envelope) = self.mailbox.try_recv() {
            if self.dispatch(envelope) {
                executed += 1;
            }
        }
        executed
    }

    /// Service the loop until `duration` elapses or shutdown is requested.
    pub fn run_for(&self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut executed = 0;
        while !self.shutdown.get() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.mailbox.recv_timeout(remaining) {
                Ok(envelope) => {
                    if self.dispatch(envelope) {
                        executed += 1;
                    }
                }
                Err(_) => break,
            }
        }
        executed
    }

    /// Service the loop until a shutdown envelope arrives.
    pub fn run_until_shutdown(&self) -> usize {
        let mut executed = 0;
        while !self.shutdown.get() {
            match self.mailbox.recv() {
                Ok(envelope) => {
                    if self.dispatch(envelope) {
                        executed += 1;
                    }
                }
                Err(_) => break,
            }
        }
        executed
    }

    /// Block until `slot` is filled or `deadline` passes, servicing this
    /// loop's mailbox in the meantime.
    ///
    /// Returns `None` on deadline expiry.
    pub(crate) fn wait_for<T>(&self, slot: &CallSlot<T>, deadline: Option<Instant>) -> Option<T> {
        loop {
            if let Some(value) = slot.take() {
                return Some(value);
            }
            let envelope = match deadline {
                None => match self.mailbox.recv() {
                    Ok(envelope) => envelope,
                    Err(_) => return slot.take(),
                },
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return slot.take();
                    }
                    match self.mailbox.recv_timeout(remaining) {
                        Ok(envelope) => envelope,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => return slot.take(),
                    }
                }
            };
            self.dispatch(envelope);
        }
    }

    /// Handle one envelope. Returns `true` if a unit of work was executed.
    fn dispatch(&self, envelope: Envelope) -> bool {
        match envelope {
            Envelope::Work(unit) => {
                let _identity = IdentityGuard::push(self.token.clone());
                unit.run();
                true
            }
            Envelope::Wake => false,
            Envelope::Shutdown => {
                trace!(loop_token = %self.token, "shutdown received");
                self.shutdown.set(true);
                false
            }
        }
    }
}

impl Drop for RunLoop {
    fn drop(&mut self) {
        // Queued units are dropped with the receiver right after this, which
        // fires their abandon hooks; they observe the token as stale.
        self.token.mark_stale();
    }
}

impl std::fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLoop")
            .field("token", &self.token)
            .field("shutdown", &self.shutdown.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn post_counter(target: &AffinityToken, counter: &Arc<AtomicUsize>) {
        let counter = Arc::clone(counter);
        let unit = UnitOfWork::new(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            || {},
        );
        assert!(target.post(Envelope::Work(unit)).is_ok());
    }

    #[test]
    fn pump_pending_runs_queued_work_in_order() {
        let rl = RunLoop::detached("sim");
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            let unit = UnitOfWork::new(move || order.lock().unwrap().push(i), || {});
            rl.token().post(Envelope::Work(unit)).unwrap();
        }
        assert_eq!(rl.pump_pending(), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(rl.token().queued_total(), 3);
    }

    #[test]
    fn detached_identity_is_current_while_servicing() {
        let rl = RunLoop::detached("sim");
        let seen = Arc::new(std::sync::Mutex::new(None));
        let slot = Arc::clone(&seen);
        let unit = UnitOfWork::new(
            move || *slot.lock().unwrap() = Some(AffinityToken::capture()),
            || {},
        );
        rl.token().post(Envelope::Work(unit)).unwrap();
        rl.pump_pending();

        assert_eq!(seen.lock().unwrap().clone(), Some(rl.token().clone()));
        // Outside the unit of work the thread's own identity is back.
        assert_ne!(AffinityToken::capture(), *rl.token());
    }

    #[test]
    fn shutdown_stops_run_until_shutdown() {
        let rl = RunLoop::detached("sim");
        let counter = Arc::new(AtomicUsize::new(0));
        post_counter(rl.token(), &counter);
        rl.token().post(Envelope::Shutdown).ok();
        post_counter(rl.token(), &counter);

        assert_eq!(rl.run_until_shutdown(), 1);
        assert!(rl.shutdown_requested());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_for_returns_after_duration() {
        let rl = RunLoop::detached("sim");
        let started = Instant::now();
        assert_eq!(rl.run_for(Duration::from_millis(20)), 0);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn dropping_loop_abandons_queued_work() {
        let rl = RunLoop::detached("sim");
        let abandoned = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&abandoned);
        let unit = UnitOfWork::new(
            || panic!("must not run"),
            move || {
                flag.fetch_add(1, Ordering::SeqCst);
            },
        );
        let token = rl.token().clone();
        token.post(Envelope::Work(unit)).unwrap();
        drop(rl);

        assert!(!token.is_alive());
        assert_eq!(abandoned.load(Ordering::SeqCst), 1);
        // Posting to a torn-down loop hands the envelope back.
        assert!(token.post(Envelope::Wake).is_err());
    }

    #[test]
    fn thread_local_loop_is_pumped_by_free_functions() {
        let counter = Arc::new(AtomicUsize::new(0));
        let me = AffinityToken::capture();
        post_counter(&me, &counter);
        post_counter(&me, &counter);
        assert_eq!(pump_pending(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        with_current(|local| assert_eq!(local.token(), &me));
    }
}
