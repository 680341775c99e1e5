use std::io;
use std::time::Duration;

/// Errors surfaced by ownership checks and marshalled calls.
///
/// Every variant is returned synchronously to the thread that issued the
/// blocking call. The runtime never retries on its own.
#[derive(Debug, thiserror::Error)]
pub enum AffinityError {
    /// The owning thread terminated before the unit of work could run.
    #[error("owning thread {owner} is no longer running")]
    StaleOwner { owner: String },

    /// The marshal deadline elapsed before the owner serviced the call.
    #[error("marshalled call to {owner} timed out after {after:?}")]
    Timeout { owner: String, after: Duration },

    /// Another migration currently holds the exclusive gate.
    #[error("an ownership migration is already in progress")]
    MigrationInProgress,

    /// A migration was requested from inside marshalled work for the same
    /// context; waiting for that work to drain would never finish.
    #[error("cannot migrate ownership from inside a marshalled unit of work for the same context")]
    ReentrantMigration,

    /// An object's token diverged from its context's token outside a
    /// migration window.
    #[error("ownership invariant violated: {detail}")]
    OwnershipInvariantViolation { detail: String },

    /// The unit of work panicked on the owning thread.
    #[error("marshalled unit of work panicked on {owner}")]
    Panicked { owner: String },

    /// A home thread could not be spawned.
    #[error("failed to spawn home thread: {0}")]
    Spawn(#[from] io::Error),
}

impl AffinityError {
    /// Returns `true` for errors a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::MigrationInProgress)
    }
}

/// Errors from loading or writing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Convenience alias used throughout the runtime crate.
pub type Result<T> = std::result::Result<T, AffinityError>;
