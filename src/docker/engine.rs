use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::gateway::RuntimeGateway;
use super::run;
use super::types::{
    CancelToken, ContainerCommand, ContainerSummary, CreateSpec, HostBinding, ImageSummary,
    PortBindings, ProgressSink,
};
use crate::error::{Error, Result};

/// Verify that the Docker daemon is reachable.
pub fn ensure_available() -> Result<()> {
    let status = Command::new("docker")
        .args(["version", "--format", "{{.Server.Version}}"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| {
            Error::RuntimeUnavailable(format!(
                "failed to invoke `docker` ({e}); is it installed and on PATH?"
            ))
        })?;

    if !status.success() {
        return Err(Error::RuntimeUnavailable(format!(
            "docker daemon is not running (exit {status})"
        )));
    }
    Ok(())
}

/// [`RuntimeGateway`] backed by the `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    timeout: Duration,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl DockerCli {
    /// `timeout` bounds every single `docker` invocation, pulls included.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn command<I, S>(&self, args: I) -> ContainerCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ContainerCommand::new(args, self.timeout)
    }

    /// Run a command and collect its non-empty stdout lines.
    fn lines<I, S>(&self, args: I, cancel: &CancelToken) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Vec::new();
        run::run(self.command(args), cancel, |line| {
            if !line.trim().is_empty() {
                out.push(line.to_string());
            }
        })?;
        Ok(out)
    }
}

#[derive(Deserialize)]
struct ImageRow {
    #[serde(rename = "Repository")]
    repository: String,
    #[serde(rename = "Tag")]
    tag: String,
}

#[derive(Deserialize)]
struct ContainerRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
}

impl RuntimeGateway for DockerCli {
    fn list_images(&self, cancel: &CancelToken) -> Result<Vec<ImageSummary>> {
        self.lines(["image", "ls", "--format", "{{json .}}"], cancel)?
            .iter()
            .map(|line| -> Result<ImageSummary> {
                let row: ImageRow = serde_json::from_str(line)?;
                Ok(image_summary(row))
            })
            .collect()
    }

    fn pull_image(
        &self,
        image: &str,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<()> {
        run::run(self.command(["pull", image]), cancel, |line| sink.line(image, line))?;
        Ok(())
    }

    fn list_containers(&self, all: bool, cancel: &CancelToken) -> Result<Vec<ContainerSummary>> {
        let mut args = vec!["ps", "--no-trunc", "--format", "{{json .}}"];
        if all {
            args.push("--all");
        }
        self.lines(args, cancel)?
            .iter()
            .map(|line| -> Result<ContainerSummary> {
                let row: ContainerRow = serde_json::from_str(line)?;
                Ok(ContainerSummary {
                    id: row.id,
                    names: row.names.split(',').map(str::to_string).collect(),
                })
            })
            .collect()
    }

    fn create_container(&self, spec: &CreateSpec, cancel: &CancelToken) -> Result<String> {
        let out = self.lines(create_args(spec), cancel)?;
        out.last()
            .map(|id| id.trim().to_string())
            .ok_or_else(|| Error::Runtime("`docker create` printed no container id".into()))
    }

    fn start_container(&self, id: &str, cancel: &CancelToken) -> Result<()> {
        run::run(self.command(["start", id]), cancel, |_| {})?;
        Ok(())
    }

    fn inspect_container(&self, id: &str, cancel: &CancelToken) -> Result<PortBindings> {
        let out = self.lines(
            ["inspect", "--format", "{{json .NetworkSettings.Ports}}", id],
            cancel,
        )?;
        parse_port_bindings(&out.concat())
    }

    fn remove_container(&self, id: &str, force: bool, cancel: &CancelToken) -> Result<()> {
        let mut args = vec!["rm"];
        if force {
            args.push("--force");
        }
        args.push(id);
        debug!(id, "removing container");
        match run::run(self.command(args), cancel, |_| {}) {
            Ok(_) => Ok(()),
            Err(Error::Runtime(reason)) if reason.contains("No such container") => {
                Err(Error::NotFound(id.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

fn image_summary(row: ImageRow) -> ImageSummary {
    let tags = if row.repository == "<none>" || row.tag == "<none>" {
        Vec::new()
    } else {
        vec![format!("{}:{}", row.repository, row.tag)]
    };
    ImageSummary { tags }
}

/// Build the `docker create` argument list for a single-port container.
fn create_args(spec: &CreateSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--expose".into(),
        spec.port_key.clone(),
        "--publish".into(),
        format!("{}:{}:{}", spec.host_ip, spec.host_port, spec.port_key),
    ];
    for kv in &spec.env {
        args.push("--env".into());
        args.push(kv.clone());
    }
    if let Some(name) = &spec.name {
        args.push("--name".into());
        args.push(name.clone());
    }
    args.push(spec.image.clone());
    args
}

fn parse_port_bindings(raw: &str) -> Result<PortBindings> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "null" {
        return Ok(PortBindings::new());
    }
    let ports: HashMap<String, Option<Vec<HostBinding>>> = serde_json::from_str(raw)?;
    Ok(ports
        .into_iter()
        .map(|(port, bindings)| (port, bindings.unwrap_or_default()))
        .collect())
}
