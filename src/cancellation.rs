//! Cooperative cancellation shared between the caller and the update pipeline.
//!
//! A [`CancellationSource`] owns the flag; any number of [`CancellationToken`]
//! clones observe it. Callees check the token at safe points (loop iterations,
//! between commands, between retries) and bail out with
//! [`UpdaterError::Cancelled`].

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::sleep;

use crate::errors::{Result, UpdaterError};

/// Cadence used when a wait needs to observe cancellation.
pub const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct CancellationState {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

impl CancellationState {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(Vec::new()),
        }
    }
}

#[derive(Clone)]
pub struct CancellationSource {
    state: Arc<CancellationState>,
}

impl CancellationSource {
    pub fn new() -> (CancellationSource, CancellationToken) {
        let source = CancellationSource {
            state: Arc::new(CancellationState::new()),
        };
        let token = source.token();
        (source, token)
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            state: Some(self.state.clone()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Sets the flag and runs every registered callback once, in registration
    /// order. Repeated calls are no-ops. Callbacks that panic do not stop the
    /// remaining ones; their count is returned as [`UpdaterError::CallbackFailed`].
    pub fn cancel(&self) -> Result<()> {
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("cancellation requested");

        let callbacks = match self.state.callbacks.lock() {
            Ok(mut locked) => std::mem::take(&mut *locked),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        let mut failures = 0usize;
        for (id, callback) in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                tracing::warn!("cancellation callback id={} panicked", id);
                failures += 1;
            }
        }

        if failures > 0 {
            return Err(UpdaterError::CallbackFailed(failures));
        }
        Ok(())
    }
}

/// Read-only view of a [`CancellationSource`]. A token without a source is
/// never cancelled.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Option<Arc<CancellationState>>,
}

impl CancellationToken {
    pub fn none() -> Self {
        Self { state: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state
            .as_ref()
            .map(|state| state.cancelled.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn throw_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(UpdaterError::Cancelled);
        }
        Ok(())
    }

    /// Registers `callback` to run on cancellation. When the token is already
    /// cancelled the callback runs immediately on the calling thread.
    pub fn register<F>(&self, callback: F) -> CancellationRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(state) = self.state.as_ref() else {
            return CancellationRegistration::empty();
        };

        let id = state.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut locked = match state.callbacks.lock() {
                Ok(locked) => locked,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Checked under the lock so a concurrent cancel either drains this
            // callback or we observe the flag here.
            if !state.cancelled.load(Ordering::SeqCst) {
                locked.push((id, Box::new(callback)));
                return CancellationRegistration {
                    state: Some(state.clone()),
                    id,
                };
            }
        }

        if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
            tracing::warn!("cancellation callback id={} panicked", id);
        }
        CancellationRegistration::empty()
    }

    /// Resolves once the token is observed cancelled, polling at
    /// [`CANCELLATION_POLL_INTERVAL`]. Never resolves for [`CancellationToken::none`].
    pub async fn cancelled(&self) {
        if self.state.is_none() {
            std::future::pending::<()>().await;
        }
        while !self.is_cancelled() {
            sleep(CANCELLATION_POLL_INTERVAL).await;
        }
    }
}

/// Handle returned by [`CancellationToken::register`]. Disposing (or
/// dropping) it removes the callback if it has not fired yet.
pub struct CancellationRegistration {
    state: Option<Arc<CancellationState>>,
    id: u64,
}

impl CancellationRegistration {
    fn empty() -> Self {
        Self { state: None, id: 0 }
    }

    pub fn dispose(mut self) {
        self.unregister();
    }

    fn unregister(&mut self) {
        if let Some(state) = self.state.take() {
            let mut locked = match state.callbacks.lock() {
                Ok(locked) => locked,
                Err(poisoned) => poisoned.into_inner(),
            };
            locked.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for CancellationRegistration {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// Drives `future` to completion unless `token` is observed cancelled first,
/// in which case the future is dropped and [`UpdaterError::Cancelled`] returned.
pub async fn run_cancellable<F, T>(token: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    token.throw_if_cancelled()?;
    tokio::select! {
        result = future => {
            match result {
                Err(err) if token.is_cancelled() && !err.is_cancelled() => {
                    tracing::debug!("suppressing error observed after cancellation: {}", err);
                    Err(UpdaterError::Cancelled)
                }
                other => other,
            }
        }
        _ = token.cancelled() => Err(UpdaterError::Cancelled),
    }
}
