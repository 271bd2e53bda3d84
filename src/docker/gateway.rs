use super::types::{
    CancelToken, ContainerSummary, CreateSpec, ImageSummary, PortBindings, ProgressSink,
};
use crate::error::Result;

/// Capability interface to a container runtime.
///
/// Every call takes the governing [`CancelToken`] and should return
/// [`Error::Cancelled`](crate::Error::Cancelled) promptly once it fires.
/// Failures the implementation cannot attribute more precisely are reported
/// as [`Error::Runtime`](crate::Error::Runtime); the provisioner tags them
/// with the step they happened in.
pub trait RuntimeGateway: Send + Sync {
    /// Images available locally.
    fn list_images(&self, cancel: &CancelToken) -> Result<Vec<ImageSummary>>;

    /// Pull `image`, forwarding progress to `sink`.
    fn pull_image(&self, image: &str, sink: &dyn ProgressSink, cancel: &CancelToken)
    -> Result<()>;

    /// Containers known to the runtime; stopped ones only when `all` is set.
    fn list_containers(&self, all: bool, cancel: &CancelToken) -> Result<Vec<ContainerSummary>>;

    /// Create (but do not start) a container, returning its id.
    fn create_container(&self, spec: &CreateSpec, cancel: &CancelToken) -> Result<String>;

    fn start_container(&self, id: &str, cancel: &CancelToken) -> Result<()>;

    /// Host bindings of every published port.
    fn inspect_container(&self, id: &str, cancel: &CancelToken) -> Result<PortBindings>;

    /// Remove a container. Returns [`Error::NotFound`](crate::Error::NotFound)
    /// if it does not exist.
    fn remove_container(&self, id: &str, force: bool, cancel: &CancelToken) -> Result<()>;
}
