//! Agents that drive workweave requests to completion.
//!
//! This crate provides:
//!
//! - **Agent runtime**: claim, process and release rounds on a worker pool
//! - **Agents**: clerk, submitter, poller, trigger and finisher
//! - **Manager**: starts the enabled agents and shuts them down
//! - **Configuration**: layered file and environment settings

pub mod agent;
pub mod agents;
pub mod config;
pub mod error;
pub mod manager;
pub mod schedule;
pub mod telemetry;

pub use agent::{Agent, AgentKind, AgentRunner, RoundReport};
pub use agents::{ClaimedProcessing, Clerk, Finisher, Poller, Submitter, Trigger};
pub use config::{AgentConfig, AgentSettings};
pub use error::{AgentError, ConfigError};
pub use manager::AgentManager;
pub use schedule::PollSchedule;
pub use telemetry::{DEFAULT_DIRECTIVE, init_tracing};
