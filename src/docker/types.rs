use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;

/// Cooperative cancellation token backed by an `AtomicBool`.
///
/// A token created with [`CancelToken::child`] also reports cancellation when
/// any of its ancestors is cancelled, while cancelling the child leaves the
/// parent untouched.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a token that is cancelled together with `self`.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
            || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }
}

/// Describes a `docker` invocation. `args` is the full argument list.
#[derive(Debug, Clone)]
pub struct ContainerCommand {
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl ContainerCommand {
    pub fn new<I, S>(args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            timeout,
        }
    }

    /// The subcommand, used in log fields and error messages.
    pub fn label(&self) -> String {
        self.args
            .iter()
            .take_while(|a| !a.starts_with('-'))
            .take(2)
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Outcome of a `docker` invocation.
#[derive(Debug, Default)]
pub struct ContainerResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub cancelled: bool,
    pub timed_out: bool,
}

/// Streamed output from a running `docker` process.
#[derive(Debug)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
    Done(ContainerResult),
}

/// One image known to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub tags: Vec<String>,
}

/// One container known to the runtime, running or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
}

/// Everything the runtime needs to create a single-port container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    pub image: String,
    pub name: Option<String>,
    /// `port/protocol`, e.g. `6379/tcp`.
    pub port_key: String,
    pub host_ip: String,
    /// Empty lets the runtime choose a port.
    pub host_port: String,
    pub env: Vec<String>,
}

/// A host-side address a container port is published on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostBinding {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

/// Port bindings reported by inspection, keyed by `port/protocol`.
pub type PortBindings = HashMap<String, Vec<HostBinding>>;

/// Receives image pull progress, one line at a time.
pub trait ProgressSink: Send + Sync {
    fn line(&self, image: &str, line: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn line(&self, image: &str, line: &str) {
        self(image, line)
    }
}

/// Forwards pull progress to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn line(&self, image: &str, line: &str) {
        tracing::debug!(image, "{line}");
    }
}

/// Drops pull progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn line(&self, _image: &str, _line: &str) {}
}
