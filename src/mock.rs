//! In-process emulation of the host side of every hypercall, for tests.

use crate::crash;
use crate::hypercall::{
	AgentConfig, DumpFile, HostConfig, Hypercall, Hypervisor, HOST_MAGIC, HOST_STRING_SIZE,
	HOST_VERSION, PAYLOAD_HEADER_SIZE,
};
use crate::shared::SharedRegion;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult};
use std::cell::{Ref, RefCell};
use std::collections::VecDeque;
use std::ffi::CStr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Everything the emulated host observed
#[derive(Debug, Default)]
pub(crate) struct MockState {
	pub calls: Vec<Hypercall>,
	pub agent_config: Option<AgentConfig>,
	pub payload_addr: Option<u64>,
	pub mode: Option<u64>,
	/// FAST_ACQUIRE calls that captured a snapshot
	pub snapshots: usize,
	/// FAST_ACQUIRE calls that resumed from an existing snapshot
	pub resumes: usize,
	pub releases: usize,
	pub inputs: VecDeque<Vec<u8>>,
	/// Byte count to declare instead of the real input length
	pub declared_size: Option<i32>,
	/// First bytes of the trace buffer at every RELEASE
	pub trace_heads: Vec<Vec<u8>>,
	pub printed: Vec<String>,
	pub panics: Vec<String>,
	pub aborts: Vec<String>,
	pub dumps: Vec<(String, Vec<u8>, bool)>,
}

pub(crate) struct MockHost {
	config: HostConfig,
	state: RefCell<MockState>,
}

impl MockHost {
	pub fn new(config: HostConfig) -> MockHost {
		MockHost { config, state: RefCell::new(MockState::default()) }
	}

	/// A compatible host with the given sizes
	pub fn compatible(bitmap_size: u32, payload_buffer_size: u32) -> MockHost {
		MockHost::new(HostConfig {
			host_magic: HOST_MAGIC,
			host_version: HOST_VERSION,
			bitmap_size,
			ijon_bitmap_size: 0x1000,
			payload_buffer_size,
			worker_id: 0,
		})
	}

	pub fn push_input(&self, input: &[u8]) {
		self.state.borrow_mut().inputs.push_back(input.to_vec());
	}

	pub fn declare_size(&self, size: i32) {
		self.state.borrow_mut().declared_size = Some(size);
	}

	pub fn state(&self) -> Ref<'_, MockState> {
		self.state.borrow()
	}

	pub fn count(&self, op: Hypercall) -> usize {
		self.state().calls.iter().filter(|call| **call == op).count()
	}

	fn deliver(&self, state: &mut MockState) {
		let Some(addr) = state.payload_addr else {
			return;
		};

		let input = state.inputs.pop_front().unwrap_or_default();
		let size = self.config.payload_buffer_size as usize;
		let Some(capacity) = size.checked_sub(PAYLOAD_HEADER_SIZE) else {
			// No room for the size header, a real host would refuse this config
			return;
		};
		let len = input.len().min(capacity);
		let declared = state.declared_size.unwrap_or(len as i32);

		unsafe {
			std::ptr::write_unaligned(addr as *mut i32, declared);
			std::ptr::copy_nonoverlapping(
				input.as_ptr(),
				(addr as usize + PAYLOAD_HEADER_SIZE) as *mut u8,
				len,
			);
		}
	}
}

unsafe fn read_cstr(addr: u64) -> String {
	CStr::from_ptr(addr as *const libc::c_char).to_string_lossy().into_owned()
}

impl Hypervisor for MockHost {
	unsafe fn hypercall(&self, op: Hypercall, arg: u64) -> u64 {
		let mut state = self.state.borrow_mut();
		state.calls.push(op);

		match op {
			Hypercall::GetHostConfig => {
				std::ptr::write_unaligned(arg as *mut HostConfig, self.config);
			}
			Hypercall::SetAgentConfig => {
				state.agent_config = Some(std::ptr::read_unaligned(arg as *const AgentConfig));
			}
			Hypercall::GetPayload => state.payload_addr = Some(arg),
			Hypercall::UserSubmitMode => state.mode = Some(arg),
			Hypercall::UserFastAcquire => {
				if state.snapshots == 0 {
					state.snapshots += 1;
				} else {
					state.resumes += 1;
				}
				self.deliver(&mut state);
			}
			Hypercall::Release => {
				state.releases += 1;
				if let Some(config) = state.agent_config {
					let head = (self.config.bitmap_size as usize).min(16);
					let trace = config.trace_buffer_vaddr as *const u8;
					let bytes = std::slice::from_raw_parts(trace, head).to_vec();
					state.trace_heads.push(bytes);
				}
			}
			Hypercall::Printf => {
				let text = read_cstr(arg);
				state.printed.push(text);
			}
			Hypercall::PanicExtended => {
				let text = read_cstr(arg);
				state.panics.push(text);
			}
			Hypercall::UserAbort => {
				let text = read_cstr(arg);
				state.aborts.push(text);
			}
			Hypercall::DumpFile => {
				let file = std::ptr::read_unaligned(arg as *const DumpFile);
				let name = read_cstr(file.file_name_ptr);
				let data =
					std::slice::from_raw_parts(file.data_ptr as *const u8, file.bytes as usize)
						.to_vec();
				state.dumps.push((name, data, file.append != 0));
			}
		}

		0
	}
}

/// Host stand-in for forked children: the last terminal report (PANIC_EXTENDED
/// or USER_ABORT) lands in a page shared with the parent. The opcode sits at
/// offset 0, the NUL-terminated text at [`SINK_TEXT`].
pub(crate) struct SharedSink {
	page: SharedRegion,
}

const SINK_TEXT: usize = 8;

/// What the parent saw of a forked child
#[derive(Debug)]
pub(crate) struct ChildReport {
	pub op: Option<Hypercall>,
	pub text: String,
	/// Still running after it reported, i.e. spinning in the terminal state
	pub alive: bool,
}

/// Forking tests run one at a time
static FORK_LOCK: Mutex<()> = Mutex::new(());

impl SharedSink {
	/// Map and leak a sink. Done in the parent so children never allocate for it.
	pub fn leak() -> &'static SharedSink {
		let page = SharedRegion::map(SINK_TEXT + HOST_STRING_SIZE).unwrap();
		Box::leak(Box::new(SharedSink { page }))
	}

	fn opcode(&self) -> &AtomicU64 {
		unsafe { &*(self.page.as_ptr() as *const AtomicU64) }
	}

	/// Copy a terminal report into the page, other hypercalls are ignored
	pub unsafe fn record(&self, op: Hypercall, arg: u64) {
		if !matches!(op, Hypercall::PanicExtended | Hypercall::UserAbort) {
			return;
		}

		let text = CStr::from_ptr(arg as *const libc::c_char).to_bytes();
		let len = text.len().min(self.page.len() - SINK_TEXT - 1);
		let dest = self.page.as_ptr().add(SINK_TEXT);
		std::ptr::copy_nonoverlapping(text.as_ptr(), dest, len);
		*dest.add(len) = 0;
		self.opcode().store(op as u64, Ordering::Release);
	}

	/// Run `body` in a forked child and collect what it reported
	pub fn run_in_child(&'static self, body: impl FnOnce()) -> ChildReport {
		let _serial = FORK_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

		// Load the unwinder before forking, not in the child
		crash::capture(&mut [0usize; 1]);

		match unsafe { fork() }.unwrap() {
			ForkResult::Child => {
				// Never unwind back into the test harness of the child
				let _ = panic::catch_unwind(AssertUnwindSafe(body));
				unsafe { libc::_exit(3) }
			}
			ForkResult::Parent { child } => {
				let deadline = Instant::now() + Duration::from_secs(20);
				while self.opcode().load(Ordering::Acquire) == 0 && Instant::now() < deadline {
					std::thread::sleep(Duration::from_millis(10));
				}

				let alive =
					matches!(waitpid(child, Some(WaitPidFlag::WNOHANG)), Ok(WaitStatus::StillAlive));
				let _ = kill(child, Signal::SIGKILL);
				let _ = waitpid(child, None);

				let bytes = &self.page.as_slice()[SINK_TEXT..];
				let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
				ChildReport {
					op: Hypercall::from_raw(self.opcode().load(Ordering::Acquire)),
					text: String::from_utf8_lossy(&bytes[..end]).into_owned(),
					alive,
				}
			}
		}
	}
}

impl Hypervisor for SharedSink {
	unsafe fn hypercall(&self, op: Hypercall, arg: u64) -> u64 {
		self.record(op, arg);
		0
	}
}
