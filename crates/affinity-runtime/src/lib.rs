//! Thread affinity runtime.
//!
//! Provides the machinery that binds state to one "home" thread and
//! redirects work from every other thread onto it:
//!
//! - [`AffinityToken`]: comparable identity of one thread of execution
//! - [`RunLoop`]: a thread's FIFO mailbox of units of work and the loop
//!   that services it
//! - [`marshal`]: run a closure on the thread a token names, blocking the
//!   caller until it completes
//! - [`MigrationGate`]: serializes ownership hand-over against in-flight
//!   marshalled work
//! - [`HomeThread`]: a dedicated OS thread that services its run loop
//!
//! # Servicing rule
//!
//! A thread can only execute marshalled work while it is servicing its run
//! loop: running as a [`HomeThread`], calling one of the `run_loop` pump
//! functions, or blocking on a marshalled call of its own. A thread that is
//! waiting for a reply keeps servicing its own mailbox, so two threads that
//! marshal into each other cannot deadlock.

pub mod config;
pub mod error;
pub mod gate;
pub mod home;
pub mod marshal;
pub mod run_loop;
pub mod stats;
pub mod token;

pub use config::AffinityConfig;
pub use error::{AffinityError, ConfigError, Result};
pub use gate::{GatePass, HandOffClaim, MigrationGate, MigrationPermit};
pub use home::HomeThread;
pub use marshal::marshal;
pub use run_loop::RunLoop;
pub use stats::{MarshalCounters, MarshalStats};
pub use token::AffinityToken;
