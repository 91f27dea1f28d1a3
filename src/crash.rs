//! Crash interception.
//!
//! Fatal signals, aborts, failed assertions and Rust panics are turned into an
//! extended panic hypercall carrying a symbolized backtrace. The faulting
//! thread then spins until the host restores the VM: returning would resume a
//! process that already faulted.
//!
//! Everything reachable from [`fault_handler`] formats into fixed stack
//! buffers and does not allocate.

use crate::config::AgentOptions;
use crate::error::{AgentError, Result};
use crate::hypercall::{Hypercall, Hypervisor, HOST_STRING_SIZE};
use crate::message::{HostString, ReasonBuf};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::ffi::{c_int, c_void, CStr};
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// First line of every crash report
pub const BACKTRACE_HEADER: &str = "====== BACKTRACE ======";
/// Line added when the frame buffer filled up
pub const TRUNCATION_MARKER: &str = "(backtrace may be truncated)";
/// Deepest backtrace captured
pub const MAX_FRAMES: usize = 50;

/// Signals the target is never allowed to handle itself. SIGIOT is SIGABRT
/// on every platform we run on.
pub const FATAL_SIGNALS: [Signal; 7] = [
	Signal::SIGSEGV,
	Signal::SIGFPE,
	Signal::SIGBUS,
	Signal::SIGILL,
	Signal::SIGABRT,
	Signal::SIGTRAP,
	Signal::SIGSYS,
];

/// Is `signum` one of the signals reserved for crash reporting
pub fn is_fatal(signum: c_int) -> bool {
	FATAL_SIGNALS.iter().any(|sig| *sig as c_int == signum)
}

/// Signature of the libc signal registration primitive
pub type SigactionFn =
	unsafe extern "C" fn(c_int, *const libc::sigaction, *mut libc::sigaction) -> c_int;

/// Gatekeeper for signal handler registration.
///
/// Holds the real registration primitive; requests from the target go through
/// [`SignalFilter::register`], which drops attempts to take over a fatal
/// signal while still reporting success.
pub struct SignalFilter {
	real: SigactionFn,
	block: AtomicBool,
}

impl SignalFilter {
	pub const fn new(real: SigactionFn, block_target_overrides: bool) -> SignalFilter {
		SignalFilter { real, block: AtomicBool::new(block_target_overrides) }
	}

	pub fn set_block_target_overrides(&self, block: bool) {
		self.block.store(block, Ordering::SeqCst);
	}

	pub fn blocks_target_overrides(&self) -> bool {
		self.block.load(Ordering::SeqCst)
	}

	/// `sigaction` as the target sees it.
	///
	/// A blocked request still gets the currently installed action in
	/// `oldact`, so callers that save and restore handlers keep working.
	///
	/// # Safety
	///
	/// Same contract as `sigaction(2)`: `act` and `oldact` are null or valid.
	pub unsafe fn register(
		&self,
		signum: c_int,
		act: *const libc::sigaction,
		oldact: *mut libc::sigaction,
	) -> c_int {
		if act.is_null() || !is_fatal(signum) || !self.blocks_target_overrides() {
			return (self.real)(signum, act, oldact);
		}

		log::warn!(
			"target attempts to install own {} handler (ignoring)",
			Signal::try_from(signum).map(|sig| sig.as_str()).unwrap_or("?")
		);

		if !oldact.is_null() {
			(self.real)(signum, std::ptr::null(), oldact);
		}

		0
	}

	/// Point every fatal signal at [`fault_handler`], bypassing the filter
	pub fn install_handlers(&self) -> Result<()> {
		for signal in FATAL_SIGNALS {
			let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
			action.sa_sigaction = fault_handler
				as extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void)
				as libc::sighandler_t;
			action.sa_flags = libc::SA_SIGINFO;
			unsafe { libc::sigemptyset(&mut action.sa_mask) };

			if unsafe { (self.real)(signal as c_int, &action, std::ptr::null_mut()) } == -1 {
				return Err(AgentError::SignalInstall { signal, source: Errno::last() });
			}
		}

		Ok(())
	}
}

/// The process-wide filter the exported `sigaction` routes through
static FILTER: OnceLock<SignalFilter> = OnceLock::new();

/// Where crash reports go
static HOST: OnceLock<&'static (dyn Hypervisor + Sync)> = OnceLock::new();

/// The `sigaction` that sits behind ours.
///
/// When preloaded we export `sigaction` ourselves, so the real one is the
/// next definition in the lookup chain.
#[cfg(feature = "preload")]
fn real_sigaction() -> Result<SigactionFn> {
	let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, c"sigaction".as_ptr()) };
	if sym.is_null() {
		return Err(AgentError::MissingSigaction);
	}
	Ok(unsafe { std::mem::transmute::<*mut c_void, SigactionFn>(sym) })
}

#[cfg(not(feature = "preload"))]
fn real_sigaction() -> Result<SigactionFn> {
	Ok(libc::sigaction)
}

/// The process-wide filter, created on first use with overrides blocked
pub fn signal_filter() -> Result<&'static SignalFilter> {
	if let Some(filter) = FILTER.get() {
		return Ok(filter);
	}
	let real = real_sigaction()?;
	Ok(FILTER.get_or_init(|| SignalFilter::new(real, true)))
}

/// Install crash reporting towards `host`. Must run before any fuzzed code.
///
/// The first installed host wins, later calls only refresh the handlers.
pub fn install(host: &'static (dyn Hypervisor + Sync), options: &AgentOptions) -> Result<()> {
	let _ = HOST.set(host);

	let filter = signal_filter()?;
	filter.set_block_target_overrides(options.block_target_overrides);

	// The first `backtrace` call loads the unwinder, which allocates; do it
	// now instead of inside a signal handler
	let mut frames = [0usize; 1];
	capture(&mut frames);

	filter.install_handlers()?;
	install_panic_hook();

	log::debug!("crash handlers installed for {} signals", FATAL_SIGNALS.len());
	Ok(())
}

/// Route Rust panics through the crash report
pub fn install_panic_hook() {
	std::panic::set_hook(Box::new(|info| {
		let payload = info.payload();
		let message = payload
			.downcast_ref::<&str>()
			.copied()
			.or_else(|| payload.downcast_ref::<String>().map(String::as_str))
			.unwrap_or("Box<dyn Any>");

		let mut reason = ReasonBuf::<HOST_STRING_SIZE>::new();
		let _ = match info.location() {
			Some(loc) => write!(reason, "panicked at {}:{}: {message}", loc.file(), loc.line()),
			None => write!(reason, "panicked: {message}"),
		};

		panic_with_backtrace(Some(reason.as_str()))
	}));
}

/// Handler for every signal in [`FATAL_SIGNALS`]
pub extern "C" fn fault_handler(signo: c_int, _info: *mut libc::siginfo_t, _ctx: *mut c_void) {
	let mut reason = ReasonBuf::<64>::new();
	let _ = write!(reason, "caught signal: {signo}");
	panic_with_backtrace(Some(reason.as_str()))
}

/// Reason line for a failed C assertion
pub fn write_assertion(
	out: &mut impl Write,
	expr: &str,
	function: &str,
	file: &str,
	line: u32,
) {
	let _ = write!(out, "assertion failed: \"{expr}\" in {function} ({file}:{line})");
}

/// Report a failed C assertion and stop
pub fn assertion_failed(expr: &str, function: &str, file: &str, line: u32) -> ! {
	let mut reason = ReasonBuf::<HOST_STRING_SIZE>::new();
	write_assertion(&mut reason, expr, function, file, line);
	panic_with_backtrace(Some(reason.as_str()))
}

#[cfg(target_env = "gnu")]
extern "C" {
	fn backtrace(buffer: *mut *mut c_void, size: c_int) -> c_int;
}

/// Fill `frames` with return addresses of the current stack
#[cfg(target_env = "gnu")]
pub(crate) fn capture(frames: &mut [usize]) -> usize {
	let captured = unsafe { backtrace(frames.as_mut_ptr() as *mut *mut c_void, frames.len() as c_int) };
	captured.max(0) as usize
}

#[cfg(not(target_env = "gnu"))]
pub(crate) fn capture(_frames: &mut [usize]) -> usize {
	0
}

fn c_text<'a>(ptr: *const libc::c_char) -> Option<&'a str> {
	if ptr.is_null() {
		return None;
	}
	unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// Render one frame the way `backtrace_symbols` does, without allocating:
/// `module(symbol+0xoff) [0xaddr]`
pub fn symbolize(out: &mut HostString, addr: usize) {
	let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
	if unsafe { libc::dladdr(addr as *const c_void, &mut info) } == 0 {
		let _ = write!(out, "[{addr:#x}]");
		return;
	}

	let module = c_text(info.dli_fname).unwrap_or("??");
	let _ = match c_text(info.dli_sname) {
		Some(symbol) => {
			let offset = addr.wrapping_sub(info.dli_saddr as usize);
			write!(out, "{module}({symbol}+{offset:#x}) [{addr:#x}]")
		}
		None => {
			let offset = addr.wrapping_sub(info.dli_fbase as usize);
			write!(out, "{module}(+{offset:#x}) [{addr:#x}]")
		}
	};
}

/// Lay out a crash report: header, truncation note, reason, one frame per line.
///
/// Holding [`MAX_FRAMES`] frames means the stack may have been deeper, so
/// only the first [`MAX_FRAMES`] are written and the report says so.
pub fn format_report<S>(out: &mut HostString, reason: Option<&str>, frames: &[usize], mut symbolize: S)
where
	S: FnMut(&mut HostString, usize),
{
	let _ = writeln!(out, "{BACKTRACE_HEADER}");

	if frames.len() >= MAX_FRAMES {
		let _ = writeln!(out, "{TRUNCATION_MARKER}");
	}

	// No `Reason:` prefix, host triage matches whole lines such as
	// `caught signal: 11`
	if let Some(reason) = reason {
		let _ = writeln!(out, "{}", reason.trim_end());
	}

	for frame in frames.iter().take(MAX_FRAMES) {
		symbolize(out, *frame);
		out.push_str("\n");
	}
}

/// Capture, format and report the current stack, then never return
pub fn panic_with_backtrace(reason: Option<&str>) -> ! {
	let mut frames = [0usize; MAX_FRAMES];
	let captured = capture(&mut frames);

	let mut message = HostString::new();
	format_report(&mut message, reason, &frames[..captured], symbolize);

	match HOST.get() {
		Some(host) => {
			unsafe { host.hypercall(Hypercall::PanicExtended, message.addr()) };

			// The host tears the VM down or restores it from here
			loop {
				std::hint::spin_loop();
			}
		}
		None => {
			// Nobody to report to, leave the report on stderr
			let text = message.as_bytes();
			unsafe {
				libc::write(libc::STDERR_FILENO, text.as_ptr() as *const c_void, text.len());
				libc::_exit(1)
			}
		}
	}
}
