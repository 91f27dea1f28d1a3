//! The hypercall surface shared with the snapshot hypervisor.
//!
//! Every struct in here is read or written by the host byte-for-byte, so the
//! layouts are `#[repr(C, packed)]` and must only change together with the host.

use crate::error::{AgentError, Result};
use std::sync::atomic::{AtomicBool, Ordering};

/// Value placed in `rax` to tell the hypervisor this `vmcall` is for the fuzzer
pub const HYPERCALL_RAX_ID: u64 = 0x1f;

/// Magic the host writes into [`HostConfig::host_magic`] ("NyxH")
pub const HOST_MAGIC: u32 = 0x4878_794e;
/// Host protocol revision this agent was built against
pub const HOST_VERSION: u32 = 2;
/// Magic we write into [`AgentConfig::agent_magic`] ("NyxA")
pub const AGENT_MAGIC: u32 = 0x4178_794e;
/// Agent protocol revision
pub const AGENT_VERSION: u32 = 1;

/// Execution mode submitted before taking the snapshot
pub const MODE_64: u64 = 0;

/// Capacity of any string handed to the host, NUL terminator included
pub const HOST_STRING_SIZE: usize = 0x1000;

/// Hypercall opcodes, placed in `rbx`
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hypercall {
	GetPayload = 1,
	Release = 4,
	Printf = 13,
	UserSubmitMode = 17,
	UserFastAcquire = 18,
	UserAbort = 20,
	PanicExtended = 32,
	GetHostConfig = 35,
	SetAgentConfig = 36,
	DumpFile = 37,
}

impl Hypercall {
	/// Every opcode the agent issues
	pub const ALL: [Hypercall; 10] = [
		Hypercall::GetPayload,
		Hypercall::Release,
		Hypercall::Printf,
		Hypercall::UserSubmitMode,
		Hypercall::UserFastAcquire,
		Hypercall::UserAbort,
		Hypercall::PanicExtended,
		Hypercall::GetHostConfig,
		Hypercall::SetAgentConfig,
		Hypercall::DumpFile,
	];

	/// Decode a raw opcode, mostly useful to host emulations
	pub fn from_raw(raw: u64) -> Option<Hypercall> {
		Hypercall::ALL.iter().copied().find(|op| *op as u64 == raw)
	}
}

/// Capabilities reported by the host, fetched once during negotiation
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostConfig {
	pub host_magic: u32,
	pub host_version: u32,
	pub bitmap_size: u32,
	pub ijon_bitmap_size: u32,
	pub payload_buffer_size: u32,
	pub worker_id: u32,
}

/// What the agent declares about itself, sent once after negotiation
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentConfig {
	pub agent_magic: u32,
	pub agent_version: u32,
	pub timeout_detection: u8,
	pub tracing: u8,
	pub ijon_tracing: u8,
	pub non_reload_mode: u8,
	pub trace_buffer_vaddr: u64,
	pub ijon_trace_buffer_vaddr: u64,
	pub coverage_bitmap_size: u32,
	pub input_buffer_size: u32,
	pub dump_payloads: u8,
}

/// Request to store a named artifact on the host side
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpFile {
	pub file_name_ptr: u64,
	pub data_ptr: u64,
	pub bytes: u64,
	pub append: u8,
}

/// Offset of the payload bytes inside the payload buffer; the host writes an
/// `i32` byte count in front of them
pub const PAYLOAD_HEADER_SIZE: usize = std::mem::size_of::<i32>();

/// A channel to the snapshot hypervisor.
///
/// The real implementation is [`Vmcall`]; tests drive the agent through an
/// in-process emulation of the host.
pub trait Hypervisor {
	/// Issue one hypercall and block until the host has serviced it.
	///
	/// # Safety
	///
	/// `arg` is dereferenced by the host according to `op`: it must be a valid
	/// address of the struct or buffer that opcode expects, and that memory must
	/// stay untouched by the guest until this returns.
	unsafe fn hypercall(&self, op: Hypercall, arg: u64) -> u64;
}

impl<H: Hypervisor + ?Sized> Hypervisor for &H {
	unsafe fn hypercall(&self, op: Hypercall, arg: u64) -> u64 {
		(**self).hypercall(op, arg)
	}
}

/// Set once the real hypervisor handle has been handed out
static CLAIMED: AtomicBool = AtomicBool::new(false);

/// The real hypercall backend, trapping into the hypervisor with `vmcall`
#[derive(Debug, Clone, Copy)]
pub struct Vmcall {
	_private: (),
}

/// The instance the crash handlers report through
pub(crate) static VMCALL: Vmcall = Vmcall { _private: () };

impl Vmcall {
	/// Check that a hypervisor is attached and claim the process-wide handle.
	///
	/// Only one agent may talk to the host per process, so the second call
	/// fails with [`AgentError::HostClaimed`].
	pub fn claim() -> Result<&'static Vmcall> {
		if !Vmcall::present() {
			return Err(AgentError::HostUnavailable);
		}
		if CLAIMED.swap(true, Ordering::SeqCst) {
			return Err(AgentError::HostClaimed);
		}
		Ok(&VMCALL)
	}

	/// Presence check: CPUID leaf 1 reports bit 31 of ECX when running under
	/// a hypervisor. Issuing `vmcall` on bare metal raises #UD.
	#[cfg(target_arch = "x86_64")]
	pub fn present() -> bool {
		#[allow(unused_unsafe)]
		let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
		leaf.ecx & (1 << 31) != 0
	}

	#[cfg(not(target_arch = "x86_64"))]
	pub fn present() -> bool {
		false
	}
}

impl Hypervisor for Vmcall {
	#[cfg(target_arch = "x86_64")]
	unsafe fn hypercall(&self, op: Hypercall, arg: u64) -> u64 {
		let ret: u64;

		// LLVM reserves rbx, so swap the opcode in and out around the trap
		core::arch::asm!(
			"xchg {op}, rbx",
			"vmcall",
			"xchg {op}, rbx",
			op = inout(reg) op as u64 => _,
			inout("rax") HYPERCALL_RAX_ID => ret,
			in("rcx") arg,
			options(nostack),
		);

		ret
	}

	#[cfg(not(target_arch = "x86_64"))]
	unsafe fn hypercall(&self, _op: Hypercall, _arg: u64) -> u64 {
		// `claim` never hands out a handle on these targets
		unreachable!("vmcall hypercalls are only available on x86_64")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::mem::size_of;

	#[test]
	fn wire_structs_keep_their_packed_layout() {
		assert_eq!(size_of::<HostConfig>(), 24);
		assert_eq!(size_of::<AgentConfig>(), 37);
		assert_eq!(size_of::<DumpFile>(), 25);
	}

	#[test]
	fn opcodes_match_the_host_numbering() {
		assert_eq!(Hypercall::GetPayload as u64, 1);
		assert_eq!(Hypercall::Release as u64, 4);
		assert_eq!(Hypercall::UserFastAcquire as u64, 18);
		assert_eq!(Hypercall::PanicExtended as u64, 32);
		assert_eq!(Hypercall::GetHostConfig as u64, 35);
		assert_eq!(Hypercall::DumpFile as u64, 37);
	}

	#[test]
	fn raw_opcodes_decode() {
		for op in Hypercall::ALL {
			assert_eq!(Hypercall::from_raw(op as u64), Some(op));
		}
		assert_eq!(Hypercall::from_raw(0), None);
		assert_eq!(Hypercall::from_raw(99), None);
	}
}
