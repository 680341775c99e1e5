use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tracing::info;

use crate::config::AffinityConfig;
use crate::error::AffinityError;
use crate::marshal::marshal;
use crate::run_loop::{self, Envelope};
use crate::token::AffinityToken;

/// A dedicated OS thread that services its run loop until shut down.
///
/// The usual home for a context: create the context through
/// [`HomeThread::invoke`] (or hand it [`HomeThread::token`]) and every
/// access from other threads is marshalled here. Dropping the handle shuts
/// the thread down and joins it; work still queued at that point fails with
/// [`AffinityError::StaleOwner`].
pub struct HomeThread {
    token: AffinityToken,
    handle: Option<JoinHandle<()>>,
}

impl HomeThread {
    /// Spawn a home thread with the given name.
    pub fn spawn(name: impl Into<String>) -> Result<Self, AffinityError> {
        let name = name.into();
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let token = AffinityToken::capture();
            info!(home = %token, "home thread started");
            if tx.send(token.clone()).is_err() {
                return;
            }
            let executed = run_loop::run_until_shutdown();
            info!(home = %token, executed, "home thread stopped");
        })?;
        let token = rx.recv().map_err(|_| AffinityError::StaleOwner { owner: name })?;
        Ok(Self {
            token,
            handle: Some(handle),
        })
    }

    /// Spawn a home thread named by `config.home_thread_name`.
    pub fn spawn_with(config: &AffinityConfig) -> Result<Self, AffinityError> {
        Self::spawn(config.home_thread_name.clone())
    }

    /// Identity of the home thread.
    pub fn token(&self) -> &AffinityToken {
        &self.token
    }

    /// Run `work` on the home thread and wait for its result.
    pub fn invoke<R, E, F>(&self, work: F) -> Result<R, E>
    where
        R: Send + 'static,
        E: From<AffinityError> + Send + 'static,
        F: FnOnce() -> Result<R, E> + Send + 'static,
    {
        marshal(&self.token, None, work)
    }

    /// Stop the run loop once already-queued work ahead of the request has
    /// run, and join the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.token.post(Envelope::Shutdown);
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for HomeThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for HomeThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HomeThread")
            .field("token", &self.token)
            .field("running", &self.handle.is_some())
            .finish()
    }
}
