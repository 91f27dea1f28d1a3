//! ###############################################################################
//! # snapagent - a guest agent that lets a target be fuzzed at snapshot speed     #
//! ###############################################################################
//!
//! The agent lives inside the fuzzed VM. It negotiates with the snapshot
//! hypervisor, shares a coverage buffer and a payload buffer with it, takes the
//! snapshot right before the first input is consumed and rewinds after every
//! iteration. Fatal signals, aborts, failed assertions and panics are reported
//! to the host with a backtrace instead of killing the process.
//!
//! Harness code only sees [`Fuzz`] and [`Execution::run`]. Built with the
//! `snapshot` feature, `run` executes one VM restore cycle per call; without
//! it, the same harness runs once over the buffer it was given.

pub mod afl;
pub mod agent;
pub mod config;
pub mod crash;
pub mod error;
pub mod fuzz;
pub mod hypercall;
pub mod logger;
pub mod message;
pub mod shared;

#[cfg(feature = "preload")]
pub mod preload;

#[cfg(test)]
mod mock;

pub use agent::{Agent, Lifecycle};
pub use config::AgentOptions;
pub use error::{AgentError, Result};
pub use fuzz::{BufferFuzz, Execution, Fuzz, HostSession, SnapshotFuzz};
pub use hypercall::{AgentConfig, HostConfig, Hypercall, Hypervisor, Vmcall};
