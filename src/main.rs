use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stevedore::Provisioner;
use stevedore::config;
use stevedore::docker::{self, CancelToken, DockerCli};
use stevedore::provision::cancel_on_signal;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stevedore=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let dir = match std::env::args_os().nth(1) {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir().context("failed to read the current directory")?,
    };

    let cfg = config::load(&dir)
        .with_context(|| format!("failed to load {}", dir.join(config::CONFIG_FILE).display()))?;
    if cfg.services.is_empty() {
        info!(dir = %dir.display(), "no services configured");
        return Ok(());
    }

    docker::ensure_available()?;

    let gateway = Arc::new(DockerCli::new(cfg.docker_timeout()));
    let provisioner = Provisioner::from_config(&cfg, gateway);
    let cancel = CancelToken::new();
    cancel_on_signal(&cancel).context("failed to install the signal handler")?;

    let services = provisioner
        .provision_all(&cfg.services, &cancel)
        .context("failed to provision services")?;

    for (request, resource) in cfg.services.iter().zip(services.iter()) {
        println!(
            "{}\t{}\t{}",
            resource.name.as_deref().unwrap_or("-"),
            request.image,
            resource.uri
        );
    }

    services
        .wait_for_signal(&cancel)
        .context("failed to release services")?;
    info!("bye");
    Ok(())
}
