//! Hooks into the AFL++ instrumentation runtime, when the target carries one.
//!
//! The runtime is optional, so its globals are looked up with `dlsym` instead
//! of being linked against directly.

use std::ffi::{c_void, CStr};

/// Look up a global exported by the process or anything it loaded
fn lookup(name: &CStr) -> Option<*mut c_void> {
	let sym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
	if sym.is_null() {
		None
	} else {
		Some(sym)
	}
}

/// Where release copies coverage from
#[derive(Debug, Clone, Copy)]
enum Source {
	/// `__afl_area_ptr` and `__afl_map_size`. The runtime may swap the map
	/// out during its own init, so both are re-read on every bridge.
	Runtime { area: *const *const u8, size: *const u32 },
	/// A map owned by the caller
	Fixed { ptr: *const u8, len: usize },
}

/// The instrumentation's coverage map, bridged into the trace buffer
#[derive(Debug, Clone, Copy)]
pub struct CoverageMap {
	source: Source,
}

// Only read from the thread driving the lifecycle
unsafe impl Send for CoverageMap {}

impl CoverageMap {
	/// Find the runtime map, if the target was built with AFL++ instrumentation
	pub fn discover() -> Option<CoverageMap> {
		let area = lookup(c"__afl_area_ptr")? as *const *const u8;
		let size = lookup(c"__afl_map_size")? as *const u32;
		Some(CoverageMap { source: Source::Runtime { area, size } })
	}

	/// Bridge from a map the caller keeps alive for the rest of the process
	pub fn from_static(map: &'static [u8]) -> CoverageMap {
		CoverageMap { source: Source::Fixed { ptr: map.as_ptr(), len: map.len() } }
	}

	/// The map as it stands right now
	pub fn current(&self) -> Option<&[u8]> {
		let (ptr, len) = match self.source {
			Source::Runtime { area, size } => unsafe { (*area, *size as usize) },
			Source::Fixed { ptr, len } => (ptr, len),
		};

		if ptr.is_null() || len == 0 {
			return None;
		}

		Some(unsafe { std::slice::from_raw_parts(ptr, len) })
	}

	/// Copy as much of the map as fits into `trace`, returning the byte count
	pub fn bridge_into(&self, trace: &mut [u8]) -> usize {
		match self.current() {
			Some(map) => {
				let len = map.len().min(trace.len());
				trace[..len].copy_from_slice(&map[..len]);
				len
			}
			None => 0,
		}
	}
}

/// The auto-dictionary harvested by the instrumentation, if any
pub fn runtime_dictionary() -> Option<&'static [u8]> {
	let len = lookup(c"__afl_dictionary_len")? as *const u32;
	let data = lookup(c"__afl_dictionary")? as *const *const u8;

	let (len, data) = unsafe { (*len as usize, *data) };
	if len == 0 || data.is_null() {
		return None;
	}

	Some(unsafe { std::slice::from_raw_parts(data, len) })
}
