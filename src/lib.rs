//! Bring up throwaway service containers (databases, caches, ...) in parallel
//! and tear them down again, all or nothing.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stevedore::docker::{CancelToken, DockerCli};
//! use stevedore::{ProvisionRequest, Provisioner};
//!
//! # fn main() -> stevedore::Result<()> {
//! let provisioner = Provisioner::new(Arc::new(DockerCli::default()));
//! let cancel = CancelToken::new();
//! let services = provisioner.provision_all(
//!     &[
//!         ProvisionRequest::new("redis:7", "6379"),
//!         ProvisionRequest::new("mongo:4.4", "27017").binding_port("37017"),
//!     ],
//!     &cancel,
//! )?;
//! println!("redis at {}", services[0].uri);
//! services.release()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod docker;
pub mod error;
pub mod provision;

pub use error::{Error, Result};
pub use provision::{ProvisionRequest, Provisioned, Provisioner, ReleaseHandle, Resource};
