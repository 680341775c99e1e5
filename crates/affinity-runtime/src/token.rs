use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::ThreadId;

use crate::run_loop::{self, Envelope};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

struct TokenInner {
    serial: u64,
    label: String,
    thread: Option<ThreadId>,
    alive: AtomicBool,
    queued: AtomicU64,
    mailbox: Sender<Envelope>,
}

/// Opaque identity of one thread of execution.
///
/// Tokens compare equal iff they denote the same thread (or the same
/// simulated identity of a detached [`crate::RunLoop`]). A token is
/// immutable once captured; ownership changes replace the token held by an
/// owner wholesale.
///
/// The token also addresses the thread's run loop mailbox, which is how
/// marshalled work reaches it.
#[derive(Clone)]
pub struct AffinityToken {
    inner: Arc<TokenInner>,
}

impl AffinityToken {
    /// Capture the identity of the calling thread, right now.
    ///
    /// While a thread is executing a unit of work from a detached run loop,
    /// this returns that loop's token instead of the thread's own.
    pub fn capture() -> Self {
        run_loop::current_identity()
    }

    pub(crate) fn new(name: Option<&str>, thread: Option<ThreadId>, mailbox: Sender<Envelope>) -> Self {
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        let label = match name {
            Some(name) => name.to_string(),
            None => format!("thread-{serial}"),
        };
        Self {
            inner: Arc::new(TokenInner {
                serial,
                label,
                thread,
                alive: AtomicBool::new(true),
                queued: AtomicU64::new(0),
                mailbox,
            }),
        }
    }

    /// Process-unique serial number of this identity.
    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    /// Human-readable label (thread name when available).
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// The OS thread this token was captured on. `None` for simulated
    /// identities.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.inner.thread
    }

    /// Returns `true` until the identity's run loop has been torn down.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Total units of work ever queued to this identity.
    pub fn queued_total(&self) -> u64 {
        self.inner.queued.load(Ordering::Acquire)
    }

    pub(crate) fn mark_stale(&self) {
        self.inner.alive.store(false, Ordering::Release);
    }

    /// Post an envelope to this identity's mailbox. On failure the envelope
    /// is handed back so the caller decides how it is dropped.
    pub(crate) fn post(&self, envelope: Envelope) -> Result<(), Envelope> {
        let is_work = matches!(envelope, Envelope::Work(_));
        self.inner.mailbox.send(envelope).map_err(|e| e.0)?;
        if is_work {
            self.inner.queued.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

impl PartialEq for AffinityToken {
    fn eq(&self, other: &Self) -> bool {
        self.inner.serial == other.inner.serial
    }
}

impl Eq for AffinityToken {}

impl Hash for AffinityToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.serial.hash(state);
    }
}

impl fmt::Debug for AffinityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AffinityToken({self})")
    }
}

impl fmt::Display for AffinityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.inner.label, self.inner.serial)
    }
}
