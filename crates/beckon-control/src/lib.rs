//! Agent control plane: registration, the agent table, and bind
//! notifications for new public streams.

pub mod agent_registry;
pub mod server;

pub use agent_registry::{
    AgentKey, AgentRegistry, ControlSink, Notifier, NotifyError, RegisteredAgent,
};
pub use server::{acl_grants, ControlServer, RegisterError};
