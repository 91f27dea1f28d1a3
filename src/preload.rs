//! C ABI for targets that are not written in Rust.
//!
//! Built with the `preload` feature, the cdylib is `LD_PRELOAD`ed into the
//! target. It provides the `nyx_*` harness calls and shadows the libc entry
//! points a target could use to die quietly or to steal the crash signals.

use crate::agent::{host_abort, host_print};
use crate::crash;
use crate::fuzz::host_session;
use crate::hypercall::VMCALL;
use crate::message::ReasonBuf;
use std::ffi::{c_char, c_int, c_uint, CStr};
use std::fmt::Write;

fn c_text<'a>(ptr: *const c_char) -> &'a str {
	if ptr.is_null() {
		return "?";
	}
	unsafe { CStr::from_ptr(ptr) }.to_str().unwrap_or("?")
}

/// Negotiate with the host and return the largest input it will deliver.
/// Later calls reuse the session, whether C or Rust code negotiated it.
#[no_mangle]
pub extern "C" fn nyx_init() -> usize {
	host_session().max_input_size()
}

/// Copy the next input into `data` and return its length. The first call
/// takes the snapshot.
///
/// # Safety
///
/// `data` must be valid for writes of `max_size` bytes.
#[no_mangle]
pub unsafe extern "C" fn nyx_get_fuzz_data(data: *mut u8, max_size: usize) -> usize {
	let mut agent = host_session();
	let dest = std::slice::from_raw_parts_mut(data, max_size);
	match agent.acquire(dest) {
		Ok(len) => len,
		Err(err) => host_abort(agent.host(), &err),
	}
}

/// Rewind the VM to the snapshot
#[no_mangle]
pub extern "C" fn nyx_release() {
	host_session().release()
}

/// Print a line through the host console
///
/// # Safety
///
/// `message` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn nyx_print(message: *const c_char) {
	host_print(&VMCALL, format_args!("{}", c_text(message)));
}

/// Registration requests from the target pass the crash filter first
///
/// # Safety
///
/// Same contract as `sigaction(2)`.
#[no_mangle]
pub unsafe extern "C" fn sigaction(
	signum: c_int,
	act: *const libc::sigaction,
	oldact: *mut libc::sigaction,
) -> c_int {
	match crash::signal_filter() {
		Ok(filter) => filter.register(signum, act, oldact),
		Err(_) => {
			*libc::__errno_location() = libc::ENOSYS;
			-1
		}
	}
}

#[no_mangle]
pub extern "C" fn abort() -> ! {
	crash::panic_with_backtrace(Some("abort"))
}

#[no_mangle]
pub extern "C" fn _abort() -> ! {
	crash::panic_with_backtrace(Some("abort"))
}

#[no_mangle]
pub extern "C" fn __abort() -> ! {
	crash::panic_with_backtrace(Some("abort"))
}

/// BSD flavour of the assertion hook
///
/// # Safety
///
/// Pointers are null or NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn __assert(
	function: *const c_char,
	file: *const c_char,
	line: c_int,
	expr: *const c_char,
) -> ! {
	crash::assertion_failed(c_text(expr), c_text(function), c_text(file), line as u32)
}

/// glibc assertion hook
///
/// # Safety
///
/// Pointers are null or NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn __assert_fail(
	expr: *const c_char,
	file: *const c_char,
	line: c_uint,
	function: *const c_char,
) -> ! {
	crash::assertion_failed(c_text(expr), c_text(function), c_text(file), line)
}

/// glibc `assert_perror` hook
///
/// # Safety
///
/// Pointers are null or NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn __assert_perror_fail(
	_errnum: c_int,
	file: *const c_char,
	line: c_uint,
	function: *const c_char,
) -> ! {
	let mut reason = ReasonBuf::<1024>::new();
	let _ = write!(reason, "assert_perror: in {} ({}:{line})", c_text(function), c_text(file));
	crash::panic_with_backtrace(Some(reason.as_str()))
}
