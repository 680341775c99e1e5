use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use crate::error::AffinityError;
use crate::run_loop::{self, Envelope, UnitOfWork};
use crate::token::AffinityToken;

/// Reply slot shared between a blocked caller and the unit of work it
/// queued.
pub(crate) struct CallSlot<T> {
    value: Mutex<Option<T>>,
    cancelled: AtomicBool,
}

impl<T> CallSlot<T> {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }

    fn fill(&self, value: T) {
        *self.value.lock().expect("call slot lock poisoned") = Some(value);
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.value.lock().expect("call slot lock poisoned").take()
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Run `work` on the thread identified by `owner` and block until it
/// completes.
///
/// - If the caller already *is* `owner`, `work` runs inline and nothing is
///   queued.
/// - Otherwise `work` is queued FIFO on the owner's run loop. While blocked,
///   the caller keeps servicing its own run loop.
/// - With a `timeout`, the caller gives up with [`AffinityError::Timeout`].
///   A unit of work still queued at that point is skipped when dequeued; one
///   already running completes and its result is discarded.
/// - If the owner's run loop is gone, or is torn down before the work runs,
///   the call fails with [`AffinityError::StaleOwner`].
pub fn marshal<R, E, F>(owner: &AffinityToken, timeout: Option<Duration>, work: F) -> Result<R, E>
where
    R: Send + 'static,
    E: From<AffinityError> + Send + 'static,
    F: FnOnce() -> Result<R, E> + Send + 'static,
{
    if *owner == AffinityToken::capture() {
        trace!(owner = %owner, "caller is owner; running inline");
        return work();
    }
    if !owner.is_alive() {
        warn!(owner = %owner, "marshal target is stale");
        return Err(AffinityError::StaleOwner {
            owner: owner.to_string(),
        }
        .into());
    }

    let slot: Arc<CallSlot<Result<R, E>>> = Arc::new(CallSlot::new());
    let waker = run_loop::with_current(|local| local.token().clone());
    let label = owner.to_string();

    let unit = {
        let run_slot = Arc::clone(&slot);
        let run_waker = waker.clone();
        let run_label = label.clone();
        let abandon_slot = Arc::clone(&slot);
        let abandon_label = label.clone();
        UnitOfWork::new(
            move || {
                if run_slot.is_cancelled() {
                    debug!(owner = %run_label, "skipping unit of work abandoned by its caller");
                    return;
                }
                let outcome = panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|_| {
                    error!(owner = %run_label, "marshalled unit of work panicked");
                    Err(AffinityError::Panicked { owner: run_label }.into())
                });
                run_slot.fill(outcome);
                let _ = run_waker.post(Envelope::Wake);
            },
            move || {
                abandon_slot.fill(Err(AffinityError::StaleOwner {
                    owner: abandon_label,
                }
                .into()));
                let _ = waker.post(Envelope::Wake);
            },
        )
    };

    debug!(owner = %label, ?timeout, "marshalling unit of work");
    if let Err(rejected) = owner.post(Envelope::Work(unit)) {
        // Dropping the rejected unit fires its abandon hook.
        drop(rejected);
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    match run_loop::with_current(|local| local.wait_for(&slot, deadline)) {
        Some(outcome) => outcome,
        None => {
            slot.cancel();
            let after = timeout.unwrap_or_default();
            warn!(owner = %label, ?after, "marshalled call timed out");
            Err(AffinityError::Timeout { owner: label, after }.into())
        }
    }
}
