// Container runtime access — the gateway trait, the docker CLI driver and an in-memory fake.

pub mod engine;
pub mod gateway;
pub mod memory;
pub mod run;
pub mod types;

pub use engine::{DockerCli, ensure_available};
pub use gateway::RuntimeGateway;
pub use memory::MemoryRuntime;
pub use types::{
    CancelToken, ContainerCommand, ContainerResult, ContainerSummary, CreateSpec, HostBinding,
    ImageSummary, NullSink, OutputLine, PortBindings, ProgressSink, TracingSink,
};
