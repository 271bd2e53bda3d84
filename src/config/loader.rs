use std::path::Path;

use super::types::Config;
use crate::error::Result;

/// File name looked up in the working directory.
pub const CONFIG_FILE: &str = ".stevedore.yaml";

/// Load config from a `.stevedore.yaml` file in the given directory.
///
/// A missing file yields the default config; a malformed one is an error.
pub fn load(dir: &Path) -> Result<Config> {
    let path = dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load(dir.path()).unwrap(), Config::default());
    }

    #[test]
    fn reads_services_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "services:\n  - image: redis:7\n    exposed_port: 6379\n",
        )
        .unwrap();
        let cfg = load(dir.path()).unwrap();
        assert_eq!(cfg.services[0].image, "redis:7");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "services: 12\n").unwrap();
        assert!(matches!(load(dir.path()), Err(Error::Config(_))));
    }
}
