use std::fmt;

/// A running container and where to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Runtime id of the container.
    pub id: String,
    /// Name the container was created with, if any.
    pub name: Option<String>,
    /// Host address the port is published on, e.g. `127.0.0.1`.
    pub host: String,
    /// Host port bound to the container port.
    pub port: String,
    /// `host:port`.
    pub uri: String,
}

impl Resource {
    pub(crate) fn new(id: String, name: Option<String>, host: String, port: String) -> Self {
        let uri = format!("{host}:{port}");
        Self {
            id,
            name,
            host,
            port,
            uri,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({}) at {}", short_id(&self.id), self.uri),
            None => write!(f, "{} at {}", short_id(&self.id), self.uri),
        }
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
