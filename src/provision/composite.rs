use std::ops::Index;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{error, info};

use super::release::{ReleaseHandle, release_all};
use super::types::Resource;
use crate::docker::CancelToken;
use crate::docker::run::POLL_INTERVAL;
use crate::error::Result;

/// Every container brought up by one [`Provisioner::provision_all`] call.
///
/// Resources are in request order. Releasing is idempotent and happens
/// automatically when the governing token is cancelled or the value is
/// dropped.
///
/// [`Provisioner::provision_all`]: super::Provisioner::provision_all
#[derive(Debug)]
pub struct Provisioned {
    resources: Vec<Resource>,
    handles: Arc<[ReleaseHandle]>,
    dropped: Arc<AtomicBool>,
}

impl Provisioned {
    pub(crate) fn new(resources: Vec<Resource>, handles: Vec<ReleaseHandle>) -> Self {
        Self {
            resources,
            handles: handles.into(),
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn get(&self, index: usize) -> Option<&Resource> {
        self.resources.get(index)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Resource> {
        self.resources.iter()
    }

    /// True once every container has been removed.
    pub fn is_released(&self) -> bool {
        self.handles.iter().all(ReleaseHandle::is_released)
    }

    /// Remove every container.
    ///
    /// All members are attempted even if one fails; the first failure is
    /// returned and the containers that could not be removed stay eligible
    /// for another attempt.
    pub fn release(&self) -> Result<()> {
        let (first, leaked) = release_all(self.handles.iter());
        match first {
            None => Ok(()),
            Some(e) => {
                error!(?leaked, "containers left running");
                Err(e)
            }
        }
    }

    /// Block until SIGINT/SIGTERM arrives or `cancel` fires, then release
    /// everything.
    pub fn wait_for_signal(&self, cancel: &CancelToken) -> Result<()> {
        let signalled = termination_flag()?;
        info!(containers = self.len(), "waiting for termination signal");

        loop {
            if signalled.swap(false, Ordering::AcqRel) {
                info!("termination signal received");
                break;
            }
            if cancel.is_cancelled() {
                info!("cancelled");
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        self.release()
    }

    /// Release everything once `cancel` fires. The watcher exits on its own
    /// once all members are released by other means or the value is dropped.
    pub(crate) fn release_on_cancel(&self, cancel: CancelToken) -> JoinHandle<()> {
        let handles = self.handles.clone();
        let dropped = self.dropped.clone();
        std::thread::spawn(move || {
            loop {
                if dropped.load(Ordering::Acquire)
                    || handles.iter().all(ReleaseHandle::is_released)
                {
                    return;
                }
                if cancel.is_cancelled() {
                    info!("governing token cancelled, releasing containers");
                    let (first, leaked) = release_all(handles.iter());
                    if let Some(e) = first {
                        error!(error = %e, ?leaked, "containers left running");
                    }
                    return;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        })
    }
}

impl Drop for Provisioned {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!(error = %e, "release on drop failed");
        }
        self.dropped.store(true, Ordering::Release);
    }
}

impl Index<usize> for Provisioned {
    type Output = Resource;

    fn index(&self, index: usize) -> &Resource {
        &self.resources[index]
    }
}

impl<'a> IntoIterator for &'a Provisioned {
    type Item = &'a Resource;
    type IntoIter = std::slice::Iter<'a, Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.resources.iter()
    }
}

/// Cancel `cancel` when SIGINT/SIGTERM arrives.
///
/// Install this before provisioning so that an interrupt during a long pull
/// takes the normal cancel-and-release path instead of killing the process.
/// [`Provisioned::wait_for_signal`] shares the same handler.
pub fn cancel_on_signal(cancel: &CancelToken) -> Result<()> {
    let signalled = termination_flag()?;
    cancel_when_raised(signalled, cancel.clone());
    Ok(())
}

fn cancel_when_raised(raised: Arc<AtomicBool>, cancel: CancelToken) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !cancel.is_cancelled() {
            if raised.swap(false, Ordering::AcqRel) {
                info!("termination signal received, cancelling");
                cancel.cancel();
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    })
}

/// Process-wide flag raised by SIGINT/SIGTERM. The handler can only be
/// installed once per process, so it is shared by every waiter.
fn termination_flag() -> Result<Arc<AtomicBool>> {
    static FLAG: Mutex<Option<Arc<AtomicBool>>> = Mutex::new(None);

    let mut slot = FLAG.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(flag) = slot.as_ref() {
        return Ok(flag.clone());
    }

    let flag = Arc::new(AtomicBool::new(false));
    let raised = flag.clone();
    ctrlc::set_handler(move || raised.store(true, Ordering::Release))?;
    *slot = Some(flag.clone());
    Ok(flag)
}
