//! Client of the orchestrator topology manager.
//!
//! Orchestrator observes the replication topology of every mysql cluster,
//! runs the failovers and keeps an audit of them. The operator treats it as
//! the source of truth for node roles.

/// Orchestrator client
mod client;
/// Errors of the orchestrator client
mod error;
/// In memory orchestrator
pub mod fake;
/// Instances and recoveries as reported by orchestrator
mod instance;

pub use client::{HttpOrchestrator, Orchestrator};
pub use error::{Error, Result};
pub use instance::{determine_master, Instance, InstanceKey, NullInt64, TopologyRecovery};
