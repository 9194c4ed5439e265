pub mod agent;
pub mod client;
pub mod errors;
pub mod protocol;
pub mod server;
pub mod types;
pub mod workspace;

// Primary re-exports
pub use agent::{Agent, WorkspaceSet, load_workspaces};
pub use client::{AgentClient, HijackedStream};
pub use errors::AgentError;
pub use protocol::messages::{Method, Request, Response};
pub use types::{AgentConfig, WorkspaceConfig, WorkspaceInfo, load_agent_config};
pub use workspace::{LaunchSpec, OutputStream, Status, StatusChange, Workspace};
