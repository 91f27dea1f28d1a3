//! The agent session: capability negotiation and the snapshot lifecycle.
//!
//! An [`Agent`] only exists after a successful handshake, so no hypercall
//! besides GET_HOST_CONFIG can be issued against an incompatible host.
//!
//! ```text
//! negotiate ──► Negotiated ──► BufferRegistered ──► SnapshotPending ──► Running
//!                                                         ▲                │
//!                                                         └──── Released ◄─┘
//! ```
//!
//! The first FAST_ACQUIRE makes the host capture the VM. Every RELEASE rewinds
//! the guest to the instruction after that call with a fresh input in the
//! payload buffer, which is how the fuzzing loop happens without a loop in
//! here.

use crate::afl::{self, CoverageMap};
use crate::config::AgentOptions;
use crate::error::{AgentError, Result};
use crate::hypercall::{
	AgentConfig, DumpFile, HostConfig, Hypercall, Hypervisor, AGENT_MAGIC, AGENT_VERSION,
	HOST_MAGIC, HOST_VERSION, MODE_64, PAYLOAD_HEADER_SIZE,
};
use crate::message::HostString;
use crate::shared::{pin_slice, SharedRegion};
use std::ffi::CStr;
use std::fmt::{self, Write};

/// Name the auto-dictionary is stored under on the host
pub const DICTIONARY_FILE: &CStr = c"afl_autodict.txt";

/// Where the session is in the snapshot cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
	/// Host config fetched and agent config sent
	Negotiated,
	/// Payload buffer mapped and announced to the host
	BufferRegistered,
	/// Execution mode submitted, FAST_ACQUIRE in flight
	SnapshotPending,
	/// An input was delivered and is being executed
	Running,
	/// The host was asked to rewind to the snapshot
	Released,
}

/// One negotiated session with the snapshot hypervisor
pub struct Agent<H: Hypervisor> {
	host: H,
	host_config: HostConfig,
	state: Lifecycle,
	trace: SharedRegion,
	payload: Option<SharedRegion>,
	coverage: Option<CoverageMap>,
}

impl<H: Hypervisor> Agent<H> {
	/// Handshake with the default options
	pub fn negotiate(host: H) -> Result<Agent<H>> {
		Agent::negotiate_with(host, &AgentOptions::default())
	}

	/// Fetch the host capabilities, check we speak the same protocol, map the
	/// trace buffer and declare ourselves to the host
	pub fn negotiate_with(host: H, options: &AgentOptions) -> Result<Agent<H>> {
		let mut host_config = HostConfig::default();
		unsafe {
			host.hypercall(Hypercall::GetHostConfig, &mut host_config as *mut HostConfig as u64)
		};

		// The structs are shared byte-for-byte, anything past this point is
		// undefined against a host with a different layout
		let magic = host_config.host_magic;
		if magic != HOST_MAGIC {
			return Err(AgentError::HostMagic { found: magic, expected: HOST_MAGIC });
		}
		let version = host_config.host_version;
		if version != HOST_VERSION {
			return Err(AgentError::HostVersion { found: version, expected: HOST_VERSION });
		}

		let bitmap_size = host_config.bitmap_size;
		let ijon_bitmap_size = host_config.ijon_bitmap_size;
		let payload_buffer_size = host_config.payload_buffer_size;
		log::info!("[capabilities] host_config.bitmap_size: {bitmap_size:#x}");
		log::info!("[capabilities] host_config.ijon_bitmap_size: {ijon_bitmap_size:#x}");
		log::info!("[capabilities] host_config.payload_buffer_size: {payload_buffer_size:#x}");

		// A host without a coverage bitmap still gets the liveness byte
		let trace = SharedRegion::map((bitmap_size as usize).max(1))?;

		let mut agent_config = AgentConfig {
			agent_magic: AGENT_MAGIC,
			agent_version: AGENT_VERSION,
			timeout_detection: 0,
			tracing: 1,
			ijon_tracing: 0,
			non_reload_mode: 0,
			trace_buffer_vaddr: trace.addr(),
			ijon_trace_buffer_vaddr: 0,
			..AgentConfig::default()
		};
		unsafe {
			host.hypercall(
				Hypercall::SetAgentConfig,
				&mut agent_config as *mut AgentConfig as u64,
			)
		};

		let coverage = if options.bridge_coverage { CoverageMap::discover() } else { None };
		if coverage.is_some() {
			log::debug!("bridging instrumentation coverage into the trace buffer");
		}

		let agent = Agent {
			host,
			host_config,
			state: Lifecycle::Negotiated,
			trace,
			payload: None,
			coverage,
		};

		if options.upload_dictionary {
			if let Some(dictionary) = afl::runtime_dictionary() {
				agent.upload_dictionary(dictionary)?;
			}
		}

		Ok(agent)
	}

	/// Largest input the host will deliver, in bytes
	pub fn max_input_size(&self) -> usize {
		self.host_config.payload_buffer_size as usize
	}

	pub fn host_config(&self) -> HostConfig {
		self.host_config
	}

	pub fn state(&self) -> Lifecycle {
		self.state
	}

	pub fn host(&self) -> &H {
		&self.host
	}

	/// The coverage buffer shared with the host
	pub fn trace(&self) -> &SharedRegion {
		&self.trace
	}

	/// Bridge coverage from `map` on every release, replacing any discovered map
	pub fn set_coverage(&mut self, map: CoverageMap) {
		self.coverage = Some(map);
	}

	/// Store `data` as a named artifact on the host
	pub fn upload_file(&self, name: &CStr, data: &[u8], append: bool) -> Result<()> {
		if data.is_empty() {
			return Ok(());
		}

		let _pinned = pin_slice(data)?;

		let mut file = DumpFile {
			file_name_ptr: name.as_ptr() as u64,
			data_ptr: data.as_ptr() as u64,
			bytes: data.len() as u64,
			append: append as u8,
		};
		unsafe { self.host.hypercall(Hypercall::DumpFile, &mut file as *mut DumpFile as u64) };

		Ok(())
	}

	/// Seed the host mutator with dictionary tokens
	pub fn upload_dictionary(&self, dictionary: &[u8]) -> Result<()> {
		log::info!("uploading {:#x} bytes of auto-dictionary", dictionary.len());
		self.upload_file(DICTIONARY_FILE, dictionary, true)
	}

	/// Map the payload buffer and tell the host where to write inputs
	fn register_payload(&mut self) -> Result<()> {
		let region = SharedRegion::map(self.max_input_size())?;

		{
			let _pinned = region.pin()?;
			unsafe { self.host.hypercall(Hypercall::GetPayload, region.addr()) };
		}

		log::info!(
			"[init] payload buffer is mapped at {:#x} (size: {:#x})",
			region.addr(),
			region.len()
		);

		self.payload = Some(region);
		self.state = Lifecycle::BufferRegistered;

		Ok(())
	}

	/// Receive the next fuzz input into `dest` and return its length.
	///
	/// The first call takes the snapshot. Everything that must only happen
	/// once per process has to run before it.
	pub fn acquire(&mut self, dest: &mut [u8]) -> Result<usize> {
		if self.payload.is_none() {
			self.register_payload()?;
		}
		let Some(payload) = self.payload.as_ref() else {
			unreachable!("payload buffer is registered above");
		};

		// Keep the pages resident while the host writes the input
		let _pinned = payload.pin()?;

		if self.state == Lifecycle::BufferRegistered {
			unsafe { self.host.hypercall(Hypercall::UserSubmitMode, MODE_64) };
		}

		self.state = Lifecycle::SnapshotPending;
		unsafe { self.host.hypercall(Hypercall::UserFastAcquire, 0) };
		self.state = Lifecycle::Running;

		// Liveness marker for the host
		if let Some(marker) = self.trace.as_mut_slice().first_mut() {
			*marker = 1;
		}

		copy_payload(payload, dest)
	}

	/// Finish the iteration and ask the host to rewind to the snapshot.
	///
	/// Under a real hypervisor this does not return to the caller: execution
	/// continues after the FAST_ACQUIRE in [`Agent::acquire`].
	pub fn release(&mut self) {
		if let Some(coverage) = &self.coverage {
			let trace = self.trace.as_mut_slice();
			coverage.bridge_into(trace);
			if let Some(marker) = trace.first_mut() {
				*marker = 1;
			}
		}

		self.state = Lifecycle::Released;
		unsafe { self.host.hypercall(Hypercall::Release, 0) };
	}

	/// Print through the host console
	pub fn print(&self, args: fmt::Arguments<'_>) {
		host_print(&self.host, args);
	}
}

/// Copy the host-delivered input out of the payload buffer.
///
/// The declared byte count comes from the host and is checked against both
/// the mapping and the destination before anything is copied.
fn copy_payload(payload: &SharedRegion, dest: &mut [u8]) -> Result<usize> {
	let bytes = payload.as_slice();

	let (Some(header), Some(room)) =
		(bytes.get(..PAYLOAD_HEADER_SIZE), bytes.len().checked_sub(PAYLOAD_HEADER_SIZE))
	else {
		return Err(AgentError::PayloadHeader { len: bytes.len() });
	};

	let mut raw = [0u8; PAYLOAD_HEADER_SIZE];
	raw.copy_from_slice(header);
	let declared = i32::from_ne_bytes(raw) as i64;

	let capacity = room.min(dest.len());
	if declared < 0 || declared as usize > capacity {
		return Err(AgentError::PayloadSize { declared, capacity });
	}

	let len = declared as usize;
	dest[..len].copy_from_slice(&bytes[PAYLOAD_HEADER_SIZE..PAYLOAD_HEADER_SIZE + len]);

	Ok(len)
}

/// Format into a bounded buffer and send it to the host console
pub fn host_print(host: &(impl Hypervisor + ?Sized), args: fmt::Arguments<'_>) {
	let mut text = HostString::new();
	let _ = text.write_fmt(args);
	unsafe { host.hypercall(Hypercall::Printf, text.addr()) };
}

/// Report a fatal condition through the host abort channel and stop
pub fn host_abort(host: &(impl Hypervisor + ?Sized), reason: &dyn fmt::Display) -> ! {
	let mut text = HostString::new();
	let _ = write!(text, "{reason}");
	unsafe { host.hypercall(Hypercall::UserAbort, text.addr()) };

	// The host is expected to tear us down, make sure nothing runs on if not
	std::process::abort()
}
