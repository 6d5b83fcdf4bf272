pub mod agent;
pub mod cli;
pub mod mock;
pub mod registry;

pub use agent::{Agent, AgentOutcome, CallOptions, StreamSink};
pub use cli::CliAgent;
pub use mock::MockAgent;
pub use registry::{AgentRegistry, ProviderError};
