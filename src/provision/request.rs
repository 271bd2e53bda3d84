use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Host address containers are published on unless configured otherwise.
pub const DEFAULT_HOST_IP: &str = "127.0.0.1";

/// Protocol used when a request does not name one.
pub const DEFAULT_PROTOCOL: &str = "tcp";

/// One container to bring up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionRequest {
    /// Container name; must be unique on the runtime when set.
    pub name: Option<String>,
    /// Image and tag, e.g. `redis:7`.
    pub image: String,
    /// Port inside the container.
    #[serde(deserialize_with = "port")]
    pub exposed_port: String,
    /// Host port to publish on. Empty lets the runtime pick one.
    #[serde(deserialize_with = "port")]
    pub binding_port: String,
    pub protocol: String,
    pub host_ip: String,
    /// `KEY=VALUE` pairs, passed through verbatim.
    pub env: Vec<String>,
    /// Remove an existing container with the same name before creating.
    #[serde(rename = "override")]
    pub override_existing: bool,
}

impl ProvisionRequest {
    pub fn new(image: impl Into<String>, exposed_port: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            exposed_port: exposed_port.into(),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn binding_port(mut self, port: impl Into<String>) -> Self {
        self.binding_port = port.into();
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn host_ip(mut self, ip: impl Into<String>) -> Self {
        self.host_ip = ip.into();
        self
    }

    pub fn env(mut self, kv: impl Into<String>) -> Self {
        self.env.push(kv.into());
        self
    }

    pub fn override_existing(mut self, yes: bool) -> Self {
        self.override_existing = yes;
        self
    }

    /// `port/protocol` key the runtime uses for this request's port.
    pub fn port_key(&self) -> String {
        format!("{}/{}", self.exposed_port, self.protocol)
    }
}

/// Accept ports written either as YAML numbers or as strings.
fn port<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    struct PortVisitor;

    impl<'de> Visitor<'de> for PortVisitor {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a port number or string")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<String, E> {
            if value > u64::from(u16::MAX) {
                return Err(E::custom(format!("port {value} is out of range")));
            }
            Ok(value.to_string())
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<String, E> {
            u64::try_from(value)
                .map_err(|_| E::custom(format!("port {value} is out of range")))
                .and_then(|v| self.visit_u64(v))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<String, E> {
            Ok(value.to_string())
        }
    }

    deserializer.deserialize_any(PortVisitor)
}

/// Validate a request and fill in defaults.
///
/// Fails before touching the request when the image or the exposed port is
/// missing.
pub fn normalize(request: &ProvisionRequest, default_host_ip: &str) -> Result<ProvisionRequest> {
    if request.image.trim().is_empty() {
        return Err(Error::InvalidRequest("image is required".into()));
    }
    if request.exposed_port.trim().is_empty() {
        return Err(Error::InvalidRequest(format!(
            "exposed port is required for {}",
            request.image
        )));
    }

    let mut out = request.clone();
    if out.protocol.is_empty() {
        out.protocol = DEFAULT_PROTOCOL.to_string();
    }
    if out.host_ip.is_empty() {
        out.host_ip = default_host_ip.to_string();
    }
    out.name = request
        .name
        .as_deref()
        .map(|n| n.strip_prefix('/').unwrap_or(n))
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    Ok(out)
}
