use std::sync::mpsc;

use tracing::{debug, error, info, warn};

use super::composite::Provisioned;
use super::provisioner::Provisioner;
use super::release::{ReleaseHandle, release_all};
use super::request::ProvisionRequest;
use super::types::Resource;
use crate::docker::CancelToken;
use crate::error::{Error, Result};

type Member = (Resource, ReleaseHandle);

impl Provisioner {
    /// Bring up every request in parallel.
    ///
    /// Either all containers come up and are returned in request order, or
    /// the first failure is returned as [`Error::Aggregate`] after the other
    /// workers have been cancelled, have settled, and every container they
    /// managed to create has been released.
    ///
    /// Cancelling `cancel` after a successful return releases the result.
    pub fn provision_all(
        &self,
        requests: &[ProvisionRequest],
        cancel: &CancelToken,
    ) -> Result<Provisioned> {
        info!(count = requests.len(), "provisioning containers");

        // Workers share a child token so that a member failure cancels its
        // siblings without cancelling the caller.
        let group = cancel.child();
        let mut slots: Vec<Option<Member>> = requests.iter().map(|_| None).collect();
        let mut first_error: Option<(usize, Error)> = None;
        let mut leaked = Vec::new();

        std::thread::scope(|s| {
            let (tx, rx) = mpsc::channel();
            for (index, request) in requests.iter().enumerate() {
                let tx = tx.clone();
                let group = &group;
                s.spawn(move || {
                    let outcome = self.provision_one(request, group);
                    // The receiver outlives every worker.
                    let _ = tx.send((index, outcome));
                });
            }
            drop(tx);

            for (index, outcome) in rx {
                match outcome {
                    Ok(member) => slots[index] = Some(member),
                    Err(e) => {
                        leaked.extend(e.leaked());
                        if first_error.is_none() {
                            warn!(index, error = %e, "request failed, cancelling the rest");
                            group.cancel();
                            first_error = Some((index, e));
                        } else {
                            debug!(index, error = %e, "request failed after cancellation");
                        }
                    }
                }
            }
        });

        let first_error = first_error.or_else(|| {
            slots.iter().position(Option::is_none).map(|index| {
                let e = Error::Runtime(format!("worker for request #{index} produced no result"));
                (index, e)
            })
        });

        if let Some((index, source)) = first_error {
            let settled = slots.iter().flatten().map(|(_, handle)| handle);
            let (_, stuck) = release_all(settled);
            leaked.extend(stuck);
            if leaked.is_empty() {
                info!(index, "released every member after failure");
            } else {
                error!(index, ?leaked, "members left running after failure");
            }
            return Err(Error::Aggregate {
                index,
                source: Box::new(source),
                leaked,
            });
        }

        let (resources, handles) = slots.into_iter().flatten().unzip();
        let provisioned = Provisioned::new(resources, handles);
        provisioned.release_on_cancel(cancel.clone());
        info!(count = provisioned.len(), "all containers ready");
        Ok(provisioned)
    }
}
