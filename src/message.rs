//! Bounded text buffers handed to the host.
//!
//! These live on the stack and never allocate, so they are safe to build from
//! inside a signal handler.

use crate::hypercall::HOST_STRING_SIZE;
use std::fmt;

/// A NUL-terminated string of at most [`HOST_STRING_SIZE`] bytes.
///
/// Writes past the capacity are dropped rather than reported, a truncated
/// diagnostic is still worth delivering.
pub struct HostString {
	bytes: [u8; HOST_STRING_SIZE],
	len: usize,
}

impl HostString {
	/// Largest text length, one byte is kept for the terminator
	pub const CAPACITY: usize = HOST_STRING_SIZE - 1;

	pub const fn new() -> HostString {
		HostString { bytes: [0; HOST_STRING_SIZE], len: 0 }
	}

	/// Append as much of `text` as fits
	pub fn push_str(&mut self, text: &str) {
		self.push_bytes(text.as_bytes());
	}

	/// Append raw bytes, truncating at the capacity
	pub fn push_bytes(&mut self, bytes: &[u8]) {
		let take = bytes.len().min(HostString::CAPACITY - self.len);
		self.bytes[self.len..self.len + take].copy_from_slice(&bytes[..take]);
		self.len += take;
	}

	/// Text written so far, without the terminator
	pub fn as_bytes(&self) -> &[u8] {
		&self.bytes[..self.len]
	}

	/// Lossless when everything written was UTF-8 and nothing got cut mid-character
	pub fn as_str(&self) -> &str {
		match std::str::from_utf8(self.as_bytes()) {
			Ok(text) => text,
			Err(err) => {
				// Truncation may have split a multi-byte character
				std::str::from_utf8(&self.bytes[..err.valid_up_to()]).unwrap_or("")
			}
		}
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn is_full(&self) -> bool {
		self.len == HostString::CAPACITY
	}

	/// Address of the NUL-terminated text, the argument the host expects
	pub fn addr(&mut self) -> u64 {
		self.bytes[self.len] = 0;
		self.bytes.as_ptr() as u64
	}

	pub fn clear(&mut self) {
		self.len = 0;
	}
}

impl Default for HostString {
	fn default() -> HostString {
		HostString::new()
	}
}

impl fmt::Write for HostString {
	fn write_str(&mut self, text: &str) -> fmt::Result {
		self.push_str(text);
		Ok(())
	}
}

impl fmt::Debug for HostString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("HostString").field(&self.as_str()).finish()
	}
}

/// A small stack buffer for building the reason line before the report
pub struct ReasonBuf<const N: usize> {
	bytes: [u8; N],
	len: usize,
}

impl<const N: usize> ReasonBuf<N> {
	pub const fn new() -> ReasonBuf<N> {
		ReasonBuf { bytes: [0; N], len: 0 }
	}

	pub fn as_str(&self) -> &str {
		match std::str::from_utf8(&self.bytes[..self.len]) {
			Ok(text) => text,
			Err(err) => std::str::from_utf8(&self.bytes[..err.valid_up_to()]).unwrap_or(""),
		}
	}
}

impl<const N: usize> Default for ReasonBuf<N> {
	fn default() -> ReasonBuf<N> {
		ReasonBuf::new()
	}
}

impl<const N: usize> fmt::Write for ReasonBuf<N> {
	fn write_str(&mut self, text: &str) -> fmt::Result {
		let take = text.len().min(N - self.len);
		self.bytes[self.len..self.len + take].copy_from_slice(&text.as_bytes()[..take]);
		self.len += take;
		Ok(())
	}
}
