//! The harness-facing side: one fuzz entry point, two ways to feed it.
//!
//! [`SnapshotFuzz`] drives the snapshot hypervisor, one VM restore per
//! iteration. [`BufferFuzz`] hands over the buffer it was built with, once,
//! like any in-process fuzz target. The `snapshot` cargo feature decides which
//! one [`Fuzz`] is, so harness code never branches on the mode.

use crate::agent::{host_abort, Agent};
use crate::config::AgentOptions;
use crate::crash;
use crate::error::{AgentError, Result};
use crate::hypercall::{Hypervisor, Vmcall, VMCALL};
use crate::logger::HostLogger;
use std::ops::DerefMut;
use std::sync::{Mutex, MutexGuard, OnceLock, TryLockError};

/// Runs one fuzz iteration at a time.
///
/// The target must finish synchronously: each call of `run` invokes it exactly
/// once, and in snapshot mode the VM is rewound right after it returns.
pub trait Execution {
	fn run<F: FnOnce(&[u8])>(&mut self, target: F);
}

/// Plain in-process execution over a caller supplied buffer
#[derive(Debug, Clone, Copy)]
pub struct BufferFuzz<'a> {
	buffer: &'a [u8],
}

impl<'a> BufferFuzz<'a> {
	pub fn new(buffer: &'a [u8]) -> BufferFuzz<'a> {
		BufferFuzz { buffer }
	}
}

impl Execution for BufferFuzz<'_> {
	fn run<F: FnOnce(&[u8])>(&mut self, target: F) {
		target(self.buffer)
	}
}

/// Execution under the snapshot hypervisor.
///
/// `S` is how the negotiated [`Agent`] is held: owned in a box for an
/// explicit host, or locked out of the process-wide session for the real one.
pub struct SnapshotFuzz<S> {
	session: S,
	input: Vec<u8>,
}

impl<H: Hypervisor> SnapshotFuzz<Box<Agent<H>>> {
	/// Negotiate with `host` and size the input buffer to what it may deliver
	pub fn with_host(host: H, options: &AgentOptions) -> Result<SnapshotFuzz<Box<Agent<H>>>> {
		let agent = Agent::negotiate_with(host, options)?;
		Ok(SnapshotFuzz::from_session(Box::new(agent)))
	}
}

impl<H, S> SnapshotFuzz<S>
where
	H: Hypervisor,
	S: DerefMut<Target = Agent<H>>,
{
	/// Drive an already negotiated session
	pub fn from_session(session: S) -> SnapshotFuzz<S> {
		let input = vec![0u8; session.max_input_size()];
		SnapshotFuzz { session, input }
	}

	pub fn agent(&self) -> &Agent<H> {
		&self.session
	}

	pub fn max_input_size(&self) -> usize {
		self.input.len()
	}

	/// Acquire an input, run `target` on it and release the VM
	pub fn try_run<F: FnOnce(&[u8])>(&mut self, target: F) -> Result<()> {
		let len = self.session.acquire(&mut self.input)?;
		target(&self.input[..len]);
		self.session.release();
		Ok(())
	}
}

impl<H, S> Execution for SnapshotFuzz<S>
where
	H: Hypervisor,
	S: DerefMut<Target = Agent<H>>,
{
	fn run<F: FnOnce(&[u8])>(&mut self, target: F) {
		if let Err(err) = self.try_run(target) {
			host_abort(self.session.host(), &err)
		}
	}
}

/// Attach to the real hypervisor: claim it, route logging and crashes to it
/// and negotiate. Every failure here is fatal.
pub fn attach(options: &AgentOptions) -> Agent<&'static Vmcall> {
	let host = match Vmcall::claim() {
		Ok(host) => host,
		Err(err) => {
			// No host to report to, this is the only place we talk to stderr
			eprintln!("snapagent: {err}");
			std::process::abort()
		}
	};

	if HostLogger::init(host, options.log_level).is_err() {
		log::debug!("a logger is already installed, keeping it");
	}

	if let Err(err) = crash::install(host, options) {
		host_abort(host, &err)
	}

	match Agent::negotiate_with(host, options) {
		Ok(agent) => agent,
		Err(err) => host_abort(host, &err),
	}
}

/// The session with the real hypervisor, negotiated once per process
static SESSION: OnceLock<Mutex<Agent<&'static Vmcall>>> = OnceLock::new();

/// Exclusive access to the real host session
pub type HostSession = MutexGuard<'static, Agent<&'static Vmcall>>;

/// Lock the agent in `slot`, negotiating it with `connect` on first use.
///
/// Later calls reuse the same agent, so the trace and payload buffers are
/// only ever mapped once. A slot that is still held fails with
/// [`AgentError::SessionBusy`] instead of deadlocking the single fuzz thread.
pub fn lock_session<H, C>(
	slot: &OnceLock<Mutex<Agent<H>>>,
	connect: C,
) -> Result<MutexGuard<'_, Agent<H>>>
where
	H: Hypervisor,
	C: FnOnce() -> Agent<H>,
{
	let session = slot.get_or_init(|| Mutex::new(connect()));
	match session.try_lock() {
		Ok(agent) => Ok(agent),
		Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
		Err(TryLockError::WouldBlock) => Err(AgentError::SessionBusy),
	}
}

/// Attach on first use, then hand out the same session. Fatal when the
/// session is already held.
pub fn host_session() -> HostSession {
	match lock_session(&SESSION, || attach(&AgentOptions::from_env())) {
		Ok(session) => session,
		Err(err) => host_abort(&VMCALL, &err),
	}
}

impl SnapshotFuzz<HostSession> {
	/// Attach to the hypervisor, or pick up the session an earlier handle
	/// negotiated. The buffer only matters for [`BufferFuzz`] and is ignored
	/// here.
	pub fn new(_buffer: &[u8]) -> SnapshotFuzz<HostSession> {
		SnapshotFuzz::from_session(host_session())
	}
}

/// The execution mode selected at build time
#[cfg(feature = "snapshot")]
pub type Fuzz = SnapshotFuzz<HostSession>;

/// The execution mode selected at build time
#[cfg(not(feature = "snapshot"))]
pub type Fuzz<'a> = BufferFuzz<'a>;

/// Declare a `fn(&[u8])` entry point that builds the build-time selected
/// [`Fuzz`] and hands it to `$target`. In snapshot mode every call after the
/// first reuses the negotiated session.
///
/// ```ignore
/// fn headers(fuzz: &mut impl Execution) {
///     fuzz.run(|input| process_headers(input));
/// }
/// snapshot_target!(fuzz_headers, headers);
/// ```
#[macro_export]
macro_rules! snapshot_target {
	($name:ident, $target:path) => {
		pub fn $name(buffer: &[u8]) {
			let mut fuzz = $crate::Fuzz::new(buffer);
			$target(&mut fuzz)
		}
	};
}
