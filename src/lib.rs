//! ota-agent - Modular over-the-air update agent for edge devices
//!
//! The agent keeps a set of named, independently versioned driver modules in
//! sync with a remote catalog: it polls a manifest, downloads new module
//! binaries, verifies them against the manifest digest (and optional
//! signature), stages them durably, and hot-swaps them into the running
//! process without a restart.

pub mod agent;

pub use agent::config::AgentConfig;
pub use agent::host::{Event, Host, LogLevel, Status};
pub use agent::orchestrator::UpdateOrchestrator;
pub use agent::version::SemVer;
