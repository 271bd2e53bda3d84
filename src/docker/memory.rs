//! In-memory [`RuntimeGateway`] with fault injection.
//!
//! Containers never run anything; the runtime only tracks what a real daemon
//! would report. Faults are keyed by image name so that individual members of
//! a fan-out can be made to fail, stall or misbehave.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::gateway::RuntimeGateway;
use super::types::{
    CancelToken, ContainerSummary, CreateSpec, HostBinding, ImageSummary, PortBindings,
    ProgressSink,
};
use crate::error::{Error, Result};

const STALL_POLL: Duration = Duration::from_millis(5);
const FIRST_EPHEMERAL_PORT: u16 = 32768;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Fault {
    Pull,
    Create,
    Start,
    Remove,
    StallCreate,
    OrphanOnCancel,
    StallInspect,
    NoBindings,
}

#[derive(Debug, Clone)]
struct Container {
    name: Option<String>,
    image: String,
    port_key: String,
    binding: HostBinding,
    running: bool,
}

#[derive(Debug, Default)]
struct State {
    images: Vec<String>,
    containers: BTreeMap<String, Container>,
    faults: HashSet<(String, Fault)>,
    unavailable: bool,
    next_id: u64,
    next_port: u16,
    calls: usize,
    pulls: Vec<String>,
    removals: Vec<String>,
}

/// A fake container runtime that keeps all state in memory.
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    state: Mutex<State>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge the other workers.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn inject(&self, image: &str, fault: Fault) -> &Self {
        self.lock().faults.insert((image.to_string(), fault));
        self
    }

    /// Make `image` available locally so it is not pulled.
    pub fn with_image(&self, image: &str) -> &Self {
        self.lock().images.push(image.to_string());
        self
    }

    pub fn fail_pull(&self, image: &str) -> &Self {
        self.inject(image, Fault::Pull)
    }

    pub fn fail_create(&self, image: &str) -> &Self {
        self.inject(image, Fault::Create)
    }

    pub fn fail_start(&self, image: &str) -> &Self {
        self.inject(image, Fault::Start)
    }

    pub fn fail_remove(&self, image: &str) -> &Self {
        self.inject(image, Fault::Remove)
    }

    /// Block creation of `image` containers until the call is cancelled.
    pub fn stall_create(&self, image: &str) -> &Self {
        self.inject(image, Fault::StallCreate)
    }

    /// Let a stalled create of `image` still register its container once
    /// cancelled, the way a daemon finishes a request whose client went away.
    pub fn orphan_on_cancel(&self, image: &str) -> &Self {
        self.inject(image, Fault::OrphanOnCancel)
    }

    /// Block inspection of `image` containers until the call is cancelled.
    pub fn stall_inspect(&self, image: &str) -> &Self {
        self.inject(image, Fault::StallInspect)
    }

    /// Report no host bindings for `image` containers.
    pub fn drop_bindings(&self, image: &str) -> &Self {
        self.inject(image, Fault::NoBindings)
    }

    /// Make every call fail as if the daemon were down.
    pub fn set_unavailable(&self, unavailable: bool) -> &Self {
        self.lock().unavailable = unavailable;
        self
    }

    /// Register a running container that this runtime did not create itself.
    pub fn seed_container(&self, name: &str, image: &str) -> String {
        let mut state = self.lock();
        let id = state.allocate_id();
        state.containers.insert(
            id.clone(),
            Container {
                name: Some(name.to_string()),
                image: image.to_string(),
                port_key: String::new(),
                binding: HostBinding {
                    host_ip: String::new(),
                    host_port: String::new(),
                },
                running: true,
            },
        );
        id
    }

    /// Number of gateway calls made so far.
    pub fn call_count(&self) -> usize {
        self.lock().calls
    }

    /// Ids of every container that currently exists.
    pub fn container_ids(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    /// Names of every container that currently exists.
    pub fn container_names(&self) -> Vec<String> {
        self.lock()
            .containers
            .values()
            .filter_map(|c| c.name.clone())
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.lock().containers.values().filter(|c| c.running).count()
    }

    /// Images pulled so far, in call order.
    pub fn pulls(&self) -> Vec<String> {
        self.lock().pulls.clone()
    }

    /// Ids successfully removed so far, in call order.
    pub fn removals(&self) -> Vec<String> {
        self.lock().removals.clone()
    }

    /// Record a call and bail out if the runtime is down or `cancel` fired.
    fn enter(&self, cancel: &CancelToken) -> Result<MutexGuard<'_, State>> {
        let mut state = self.lock();
        state.calls += 1;
        if state.unavailable {
            return Err(Error::RuntimeUnavailable("memory runtime is down".into()));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(state)
    }

    fn stall(&self, cancel: &CancelToken) -> Error {
        while !cancel.is_cancelled() {
            std::thread::sleep(STALL_POLL);
        }
        Error::Cancelled
    }
}

impl State {
    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("mem{:012x}", self.next_id)
    }

    fn allocate_port(&mut self) -> String {
        if self.next_port == 0 {
            self.next_port = FIRST_EPHEMERAL_PORT;
        }
        let port = self.next_port;
        self.next_port += 1;
        port.to_string()
    }

    fn insert(&mut self, spec: &CreateSpec) -> String {
        let host_port = if spec.host_port.is_empty() {
            self.allocate_port()
        } else {
            spec.host_port.clone()
        };
        let id = self.allocate_id();
        self.containers.insert(
            id.clone(),
            Container {
                name: spec.name.clone(),
                image: spec.image.clone(),
                port_key: spec.port_key.clone(),
                binding: HostBinding {
                    host_ip: spec.host_ip.clone(),
                    host_port,
                },
                running: false,
            },
        );
        id
    }

    fn has_fault(&self, image: &str, fault: Fault) -> bool {
        self.faults.contains(&(image.to_string(), fault))
    }

    fn container(&self, id: &str) -> Result<&Container> {
        self.containers
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }
}

impl RuntimeGateway for MemoryRuntime {
    fn list_images(&self, cancel: &CancelToken) -> Result<Vec<ImageSummary>> {
        let state = self.enter(cancel)?;
        Ok(state
            .images
            .iter()
            .map(|tag| ImageSummary {
                tags: vec![tag.clone()],
            })
            .collect())
    }

    fn pull_image(
        &self,
        image: &str,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut state = self.enter(cancel)?;
        if state.has_fault(image, Fault::Pull) {
            return Err(Error::Runtime(format!("pull access denied for {image}")));
        }
        state.pulls.push(image.to_string());
        state.images.push(image.to_string());
        drop(state);
        sink.line(image, &format!("Pulling from {image}"));
        sink.line(image, &format!("Status: Downloaded newer image for {image}"));
        Ok(())
    }

    fn list_containers(&self, all: bool, cancel: &CancelToken) -> Result<Vec<ContainerSummary>> {
        let state = self.enter(cancel)?;
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| all || c.running)
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                names: c.name.iter().map(|n| format!("/{n}")).collect(),
            })
            .collect())
    }

    fn create_container(&self, spec: &CreateSpec, cancel: &CancelToken) -> Result<String> {
        let state = self.enter(cancel)?;
        if state.has_fault(&spec.image, Fault::StallCreate) {
            let orphan = state.has_fault(&spec.image, Fault::OrphanOnCancel);
            drop(state);
            let err = self.stall(cancel);
            if orphan {
                self.lock().insert(spec);
            }
            return Err(err);
        }
        let mut state = state;
        if state.has_fault(&spec.image, Fault::Create) {
            return Err(Error::Runtime(format!("cannot create {}", spec.image)));
        }
        if let Some(name) = &spec.name
            && state
                .containers
                .values()
                .any(|c| c.name.as_deref() == Some(name.as_str()))
        {
            return Err(Error::Runtime(format!(
                "Conflict. The container name \"/{name}\" is already in use"
            )));
        }
        Ok(state.insert(spec))
    }

    fn start_container(&self, id: &str, cancel: &CancelToken) -> Result<()> {
        let mut state = self.enter(cancel)?;
        let image = state.container(id)?.image.clone();
        if state.has_fault(&image, Fault::Start) {
            return Err(Error::Runtime(format!("cannot start {id}")));
        }
        if let Some(c) = state.containers.get_mut(id) {
            c.running = true;
        }
        Ok(())
    }

    fn inspect_container(&self, id: &str, cancel: &CancelToken) -> Result<PortBindings> {
        let state = self.enter(cancel)?;
        let container = state.container(id)?.clone();
        if state.has_fault(&container.image, Fault::StallInspect) {
            drop(state);
            return Err(self.stall(cancel));
        }
        let mut bindings = PortBindings::new();
        if container.port_key.is_empty() {
            return Ok(bindings);
        }
        let published = if state.has_fault(&container.image, Fault::NoBindings) {
            Vec::new()
        } else {
            vec![container.binding]
        };
        bindings.insert(container.port_key, published);
        Ok(bindings)
    }

    fn remove_container(&self, id: &str, force: bool, cancel: &CancelToken) -> Result<()> {
        let mut state = self.enter(cancel)?;
        let container = state.container(id)?;
        if state.has_fault(&container.image, Fault::Remove) {
            return Err(Error::Runtime(format!("cannot remove {id}: device busy")));
        }
        if container.running && !force {
            return Err(Error::Runtime(format!(
                "cannot remove running container {id}; stop it or use force"
            )));
        }
        state.containers.remove(id);
        state.removals.push(id.to_string());
        Ok(())
    }
}
