use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::{error, info};

use crate::docker::{CancelToken, RuntimeGateway};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    Releasing,
    Released,
}

/// Idempotent teardown of one container.
///
/// Clones share state. One caller at a time performs the removal; concurrent
/// callers wait for it to settle. They return `Ok` only once the container is
/// actually gone, and retry the removal themselves if the other attempt
/// failed. A failed removal puts the handle back to active.
#[derive(Clone)]
pub struct ReleaseHandle {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    gateway: Arc<dyn RuntimeGateway>,
    state: Mutex<State>,
    settled: Condvar,
}

impl fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("id", &self.inner.id)
            .field("released", &self.is_released())
            .finish()
    }
}

impl ReleaseHandle {
    pub(crate) fn new(id: impl Into<String>, gateway: Arc<dyn RuntimeGateway>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                gateway,
                state: Mutex::new(State::Active),
                settled: Condvar::new(),
            }),
        }
    }

    /// Id of the container this handle removes.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_released(&self) -> bool {
        *self.state() == State::Released
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Force-remove the container.
    ///
    /// A container that is already gone counts as released. Removal runs
    /// under its own uncancelled token so it still happens after the
    /// provisioning token has fired.
    pub fn release(&self) -> Result<()> {
        {
            let mut state = self.state();
            loop {
                match *state {
                    State::Released => return Ok(()),
                    State::Releasing => {
                        state = self
                            .inner
                            .settled
                            .wait(state)
                            .unwrap_or_else(|e| e.into_inner());
                    }
                    State::Active => {
                        *state = State::Releasing;
                        break;
                    }
                }
            }
        }

        let id = self.id();
        let removed = self
            .inner
            .gateway
            .remove_container(id, true, &CancelToken::new());
        let outcome = match removed {
            Ok(()) => {
                info!(id, "released container");
                Ok(())
            }
            Err(Error::NotFound(_)) => {
                info!(id, "container already gone");
                Ok(())
            }
            Err(e) => {
                error!(id, error = %e, "failed to release container");
                Err(Error::ReleaseFailed {
                    id: id.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        *self.state() = if outcome.is_ok() {
            State::Released
        } else {
            State::Active
        };
        self.inner.settled.notify_all();
        outcome
    }
}

/// Release every present handle, attempting all of them even after a failure.
///
/// Returns the first failure, if any, together with the ids that are still
/// up.
pub(crate) fn release_all<'a>(
    handles: impl IntoIterator<Item = &'a ReleaseHandle>,
) -> (Option<Error>, Vec<String>) {
    let mut first = None;
    let mut leaked = Vec::new();
    for handle in handles {
        if let Err(e) = handle.release() {
            leaked.push(handle.id().to_string());
            first.get_or_insert(e);
        }
    }
    (first, leaked)
}
