//! Errors surfaced by the agent before the fuzzing loop is running.
//!
//! Target crashes are not errors: they take the terminal path in [`crate::crash`]
//! and never come back as a `Result`.

use thiserror::Error;

/// Everything that can go wrong while negotiating with the host or moving
/// fuzz inputs across the shared buffers
#[derive(Error, Debug)]
pub enum AgentError {
	/// The host answered GET_HOST_CONFIG with a magic we do not speak
	#[error("host magic {found:#x} does not match {expected:#x}, the hypervisor is probably outdated")]
	HostMagic { found: u32, expected: u32 },

	/// The host speaks the protocol but a different revision of it
	#[error("host version {found} does not match {expected}, the hypervisor is probably outdated")]
	HostVersion { found: u32, expected: u32 },

	/// Snapshot mode was compiled in but no hypervisor is attached
	#[error("no snapshot hypervisor detected, run the target inside the snapshot VM")]
	HostUnavailable,

	/// The process-wide host handle was already handed out
	#[error("the hypervisor handle was already claimed by another agent")]
	HostClaimed,

	/// A shared region of zero bytes was requested
	#[error("refusing to map an empty shared region")]
	EmptyRegion,

	/// `mmap` failed for a shared region
	#[error("failed to map {size:#x} bytes of shared memory: {source}")]
	Map {
		size: usize,
		#[source]
		source: nix::Error,
	},

	/// `mlock` failed while pinning memory for a hypercall
	#[error("failed to pin {size:#x} bytes at {addr:#x}: {source}")]
	Pin {
		addr: usize,
		size: usize,
		#[source]
		source: nix::Error,
	},

	/// The host declared more payload bytes than fit the buffers
	#[error("host declared a payload of {declared} bytes but only {capacity} fit")]
	PayloadSize { declared: i64, capacity: usize },

	/// The payload buffer is too small to hold its own size header
	#[error("payload buffer of {len} bytes cannot hold the size header")]
	PayloadHeader { len: usize },

	/// The process-wide session is held by another execution handle
	#[error("the snapshot session is already in use by another fuzz handle")]
	SessionBusy,

	/// The next `sigaction` in the link chain could not be resolved
	#[error("unable to resolve the real `sigaction`")]
	MissingSigaction,

	/// Installing a crash handler failed
	#[error("failed to install the {signal:?} handler: {source}")]
	SignalInstall {
		signal: nix::sys::signal::Signal,
		#[source]
		source: nix::Error,
	},
}

/// Result type used throughout the agent
pub type Result<T> = std::result::Result<T, AgentError>;
