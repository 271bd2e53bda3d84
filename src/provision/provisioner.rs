use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, info_span, warn};

use super::release::ReleaseHandle;
use super::request::{DEFAULT_HOST_IP, ProvisionRequest, normalize};
use super::types::Resource;
use crate::config::Config;
use crate::docker::{CancelToken, CreateSpec, ProgressSink, RuntimeGateway, TracingSink};
use crate::error::{Error, Result};

/// Brings containers up through a [`RuntimeGateway`].
#[derive(Clone)]
pub struct Provisioner {
    gateway: Arc<dyn RuntimeGateway>,
    default_host_ip: String,
    progress: Arc<dyn ProgressSink>,
}

impl fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provisioner")
            .field("default_host_ip", &self.default_host_ip)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    /// Pull progress goes to `tracing` and containers are published on
    /// [`DEFAULT_HOST_IP`] unless overridden.
    pub fn new(gateway: Arc<dyn RuntimeGateway>) -> Self {
        Self {
            gateway,
            default_host_ip: DEFAULT_HOST_IP.to_string(),
            progress: Arc::new(TracingSink),
        }
    }

    pub fn from_config(cfg: &Config, gateway: Arc<dyn RuntimeGateway>) -> Self {
        Self::new(gateway).with_default_host_ip(cfg.host_ip.clone())
    }

    /// Host address used for requests that leave `host_ip` empty.
    pub fn with_default_host_ip(mut self, ip: impl Into<String>) -> Self {
        self.default_host_ip = ip.into();
        self
    }

    /// Where image pull progress is sent.
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn default_host_ip(&self) -> &str {
        &self.default_host_ip
    }

    /// Bring up a single container.
    ///
    /// On success the caller owns the returned [`ReleaseHandle`]. On failure
    /// any container created along the way has already been removed, unless
    /// the error is [`Error::Leaked`].
    pub fn provision_one(
        &self,
        request: &ProvisionRequest,
        cancel: &CancelToken,
    ) -> Result<(Resource, ReleaseHandle)> {
        let request = normalize(request, &self.default_host_ip)?;
        let span = info_span!(
            "provision",
            image = %request.image,
            name = request.name.as_deref().unwrap_or_default()
        );
        let _guard = span.enter();

        self.ensure_image(&request.image, cancel)?;
        if let Some(name) = &request.name {
            self.clear_name(name, request.override_existing, cancel)?;
        }

        let spec = CreateSpec {
            image: request.image.clone(),
            name: request.name.clone(),
            port_key: request.port_key(),
            host_ip: request.host_ip.clone(),
            host_port: request.binding_port.clone(),
            env: request.env.clone(),
        };
        let id = match self.gateway.create_container(&spec, cancel) {
            Ok(id) => id,
            Err(e) if e.is_cancelled() => {
                return Err(match &request.name {
                    Some(name) => self.reclaim_cancelled_create(name, e),
                    None => e,
                });
            }
            Err(e) => {
                return Err(e.classify(|reason| Error::CreationFailed {
                    image: request.image.clone(),
                    reason,
                }));
            }
        };
        info!(id = %id, port = %spec.port_key, "created container");

        // From here on every failure must remove the container again.
        let release = ReleaseHandle::new(id.clone(), self.gateway.clone());

        match self.start_and_inspect(&request, &id, cancel) {
            Ok(resource) => {
                info!(id = %id, uri = %resource.uri, "container ready");
                Ok((resource, release))
            }
            Err(e) => {
                warn!(id = %id, error = %e, "provisioning failed, releasing container");
                match release.release() {
                    Ok(()) => Err(e),
                    Err(release_err) => Err(Error::Leaked {
                        id,
                        source: Box::new(e),
                        release: Box::new(release_err),
                    }),
                }
            }
        }
    }

    /// Pull `image` unless a local image carries exactly that tag.
    fn ensure_image(&self, image: &str, cancel: &CancelToken) -> Result<()> {
        let images = self.gateway.list_images(cancel)?;
        if images.iter().any(|i| i.tags.iter().any(|t| t == image)) {
            debug!(image, "image present locally");
            return Ok(());
        }

        info!(image, "pulling image");
        self.gateway
            .pull_image(image, self.progress.as_ref(), cancel)
            .map_err(|e| {
                e.classify(|reason| Error::ImageResolution {
                    image: image.to_string(),
                    reason,
                })
            })
    }

    /// Make sure no container is called `name`, removing it when allowed.
    fn clear_name(&self, name: &str, override_existing: bool, cancel: &CancelToken) -> Result<()> {
        let wanted = strip_name(name);
        let existing: Vec<_> = self
            .gateway
            .list_containers(true, cancel)?
            .into_iter()
            .filter(|c| c.names.iter().any(|n| strip_name(n) == wanted))
            .collect();

        if existing.is_empty() {
            return Ok(());
        }
        if !override_existing {
            return Err(Error::ResourceConflict {
                name: wanted.to_string(),
            });
        }

        for container in existing {
            match self.gateway.remove_container(&container.id, true, cancel) {
                Ok(()) | Err(Error::NotFound(_)) => {
                    info!(id = %container.id, name = wanted, "removed existing container");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// A cancelled create may still have produced a container. Any container
    /// now carrying `name` is ours, since the name was cleared beforehand.
    fn reclaim_cancelled_create(&self, name: &str, cause: Error) -> Error {
        let wanted = strip_name(name);
        let listed = match self.gateway.list_containers(true, &CancelToken::new()) {
            Ok(listed) => listed,
            Err(e) => {
                warn!(name = wanted, error = %e, "cannot check for a container left by a cancelled create");
                return cause;
            }
        };

        let mut cause = cause;
        for container in listed
            .into_iter()
            .filter(|c| c.names.iter().any(|n| strip_name(n) == wanted))
        {
            info!(id = %container.id, name = wanted, "removing container left by a cancelled create");
            let release = ReleaseHandle::new(container.id.clone(), self.gateway.clone());
            if let Err(release_err) = release.release() {
                cause = Error::Leaked {
                    id: container.id,
                    source: Box::new(cause),
                    release: Box::new(release_err),
                };
            }
        }
        cause
    }

    fn start_and_inspect(
        &self,
        request: &ProvisionRequest,
        id: &str,
        cancel: &CancelToken,
    ) -> Result<Resource> {
        self.gateway.start_container(id, cancel).map_err(|e| {
            e.classify(|reason| Error::StartFailed {
                id: id.to_string(),
                reason,
            })
        })?;

        let port_key = request.port_key();
        let bindings = self.gateway.inspect_container(id, cancel)?;
        let Some(binding) = bindings.get(&port_key).and_then(|b| b.first()) else {
            return Err(Error::PortUnavailable {
                id: id.to_string(),
                port: port_key,
            });
        };

        let host = if binding.host_ip.is_empty() {
            request.host_ip.clone()
        } else {
            binding.host_ip.clone()
        };
        Ok(Resource::new(
            id.to_string(),
            request.name.clone(),
            host,
            binding.host_port.clone(),
        ))
    }
}

/// Runtimes report names with a leading `/`.
fn strip_name(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::docker::MemoryRuntime;

    fn setup() -> (Arc<MemoryRuntime>, Provisioner) {
        let rt = Arc::new(MemoryRuntime::new());
        rt.with_image("redis:7");
        let provisioner = Provisioner::new(rt.clone());
        (rt, provisioner)
    }

    #[test]
    fn runtime_chosen_port_ends_up_in_uri() {
        let (_rt, p) = setup();
        let (resource, _release) = p
            .provision_one(&ProvisionRequest::new("redis:7", "6379"), &CancelToken::new())
            .unwrap();
        assert_eq!(resource.port, "32768");
        assert_eq!(resource.uri, "127.0.0.1:32768");
    }

    #[test]
    fn configured_host_is_used_for_requests_without_one() {
        let (_rt, p) = setup();
        let p = p.with_default_host_ip("0.0.0.0");
        let (resource, _release) = p
            .provision_one(
                &ProvisionRequest::new("redis:7", "6379").binding_port("36379"),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(resource.uri, "0.0.0.0:36379");
    }

    #[test]
    fn invalid_request_makes_no_runtime_calls() {
        let (rt, p) = setup();
        let err = p
            .provision_one(&ProvisionRequest::new("", "6379"), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(rt.call_count(), 0);
    }

    #[test]
    fn missing_image_is_pulled_with_progress() {
        let (rt, p) = setup();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let p = p.with_progress(Arc::new(move |image: &str, line: &str| {
            captured.lock().unwrap().push(format!("{image} {line}"));
        }));

        p.provision_one(&ProvisionRequest::new("mongo:4.4", "27017"), &CancelToken::new())
            .unwrap();
        assert_eq!(rt.pulls(), vec!["mongo:4.4"]);
        assert!(!lines.lock().unwrap().is_empty());
    }

    #[test]
    fn present_image_is_not_pulled() {
        let (rt, p) = setup();
        p.provision_one(&ProvisionRequest::new("redis:7", "6379"), &CancelToken::new())
            .unwrap();
        assert!(rt.pulls().is_empty());
    }

    #[test]
    fn failed_pull_is_an_image_resolution_error() {
        let (rt, p) = setup();
        rt.fail_pull("private/thing:1");
        let err = p
            .provision_one(&ProvisionRequest::new("private/thing:1", "80"), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::ImageResolution { .. }));
        assert!(rt.container_ids().is_empty());
    }

    #[test]
    fn override_replaces_existing_container() {
        let (rt, p) = setup();
        let old = rt.seed_container("svc-1", "redis:7");
        let (resource, _release) = p
            .provision_one(
                &ProvisionRequest::new("redis:7", "6379")
                    .name("svc-1")
                    .override_existing(true),
                &CancelToken::new(),
            )
            .unwrap();
        assert_ne!(resource.id, old);
        assert_eq!(rt.container_ids(), vec![resource.id.clone()]);
        assert_eq!(rt.container_names(), vec!["svc-1"]);
    }

    #[test]
    fn name_clash_without_override_is_a_conflict() {
        let (rt, p) = setup();
        let old = rt.seed_container("svc-1", "redis:7");
        let err = p
            .provision_one(
                &ProvisionRequest::new("redis:7", "6379").name("/svc-1"),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::ResourceConflict { ref name } if name == "svc-1"));
        assert_eq!(rt.container_ids(), vec![old]);
    }

    #[test]
    fn start_failure_removes_the_container() {
        let (rt, p) = setup();
        rt.with_image("broken:1").fail_start("broken:1");
        let err = p
            .provision_one(&ProvisionRequest::new("broken:1", "80"), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::StartFailed { .. }));
        assert!(rt.container_ids().is_empty());
        assert_eq!(rt.removals().len(), 1);
    }

    #[test]
    fn missing_binding_is_port_unavailable_and_released() {
        let (rt, p) = setup();
        rt.with_image("nobind:1").drop_bindings("nobind:1");
        let err = p
            .provision_one(&ProvisionRequest::new("nobind:1", "80"), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::PortUnavailable { ref port, .. } if port == "80/tcp"));
        assert!(rt.container_ids().is_empty());
    }

    #[test]
    fn cleanup_failure_is_escalated() {
        let (rt, p) = setup();
        rt.with_image("stuck:1").fail_start("stuck:1").fail_remove("stuck:1");
        let err = p
            .provision_one(&ProvisionRequest::new("stuck:1", "80"), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::Leaked { .. }));
        assert_eq!(err.leaked(), rt.container_ids());
    }

    #[test]
    fn release_handle_removes_the_container() {
        let (rt, p) = setup();
        let (resource, release) = p
            .provision_one(&ProvisionRequest::new("redis:7", "6379"), &CancelToken::new())
            .unwrap();
        assert_eq!(release.id(), resource.id);
        release.release().unwrap();
        release.release().unwrap();
        assert!(rt.container_ids().is_empty());
    }

    #[test]
    fn container_from_cancelled_create_is_removed_by_name() {
        let (rt, p) = setup();
        rt.with_image("slow:1")
            .stall_create("slow:1")
            .orphan_on_cancel("slow:1");
        let cancel = CancelToken::new();

        let err = std::thread::scope(|s| {
            let worker = s.spawn(|| {
                p.provision_one(&ProvisionRequest::new("slow:1", "80").name("svc-slow"), &cancel)
            });
            std::thread::sleep(std::time::Duration::from_millis(50));
            cancel.cancel();
            worker.join().unwrap().unwrap_err()
        });

        assert!(err.is_cancelled());
        assert!(rt.container_ids().is_empty());
        assert_eq!(rt.removals().len(), 1);
    }

    #[test]
    fn unremovable_container_from_cancelled_create_is_leaked() {
        let (rt, p) = setup();
        rt.with_image("slow:1")
            .stall_create("slow:1")
            .orphan_on_cancel("slow:1")
            .fail_remove("slow:1");
        let cancel = CancelToken::new();

        let err = std::thread::scope(|s| {
            let worker = s.spawn(|| {
                p.provision_one(&ProvisionRequest::new("slow:1", "80").name("svc-slow"), &cancel)
            });
            std::thread::sleep(std::time::Duration::from_millis(50));
            cancel.cancel();
            worker.join().unwrap().unwrap_err()
        });

        assert!(matches!(err, Error::Leaked { .. }));
        assert!(err.is_cancelled());
        assert_eq!(err.leaked(), rt.container_ids());
    }

    #[test]
    fn names_are_compared_without_leading_slash() {
        assert_eq!(strip_name("/svc"), "svc");
        assert_eq!(strip_name("svc"), "svc");
        assert_eq!(strip_name("//svc"), "/svc");
    }
}
