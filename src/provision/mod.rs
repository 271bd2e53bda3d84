// Provisioning core — request normalization, single-container bring-up, parallel fan-out and teardown.
mod composite;
mod fanout;
mod provisioner;
pub mod release;
pub mod request;
mod types;

pub use composite::{Provisioned, cancel_on_signal};
pub use provisioner::Provisioner;
pub use release::ReleaseHandle;
pub use request::{DEFAULT_HOST_IP, DEFAULT_PROTOCOL, ProvisionRequest, normalize};
pub use types::Resource;
