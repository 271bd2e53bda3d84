use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provision::{DEFAULT_HOST_IP, ProvisionRequest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host address for services that do not set `host_ip`.
    pub host_ip: String,
    /// Upper bound in seconds for any single `docker` command.
    pub docker_timeout: u64,
    pub services: Vec<ProvisionRequest>,
}

impl Config {
    pub fn docker_timeout(&self) -> Duration {
        Duration::from_secs(self.docker_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_ip: DEFAULT_HOST_IP.to_string(),
            docker_timeout: 300,
            services: Vec::new(),
        }
    }
}
