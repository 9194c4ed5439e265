pub mod connection;

pub use connection::{AgentClient, HijackedStream};
