//! Shared memory bridge between the guest and the hypervisor.
//!
//! The host reads and writes these regions through guest-physical memory, so
//! they are anonymous `MAP_SHARED` mappings rather than private copy-on-write
//! pages. A region is never unmapped: the host keeps its address across
//! snapshot restores for as long as the process lives.

use crate::error::{AgentError, Result};
use nix::sys::mman::{mlock, mmap_anonymous, munlock, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// A zero-initialized read/write region visible to the host
#[derive(Debug)]
pub struct SharedRegion {
	ptr: NonNull<u8>,
	len: usize,
}

// The region is plain memory; hypercall boundaries are the only
// synchronization with the host.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
	/// Map `len` bytes of anonymous shared memory
	pub fn map(len: usize) -> Result<SharedRegion> {
		let length = NonZeroUsize::new(len).ok_or(AgentError::EmptyRegion)?;

		let ptr = unsafe {
			mmap_anonymous(
				None,
				length,
				ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
				MapFlags::MAP_SHARED,
			)
		}
		.map_err(|source| AgentError::Map { size: len, source })?;

		let mut region = SharedRegion { ptr: ptr.cast(), len };

		// Fresh anonymous pages are already zero, but be explicit: the host
		// must never observe stale bytes in a buffer it is about to consume
		region.zero();

		Ok(region)
	}

	/// Size of the region in bytes
	pub fn len(&self) -> usize {
		self.len
	}

	/// Regions are never empty, `map` refuses zero sizes
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Guest virtual address of the region, as handed to the host
	pub fn addr(&self) -> u64 {
		self.ptr.as_ptr() as u64
	}

	/// Raw pointer to the first byte
	pub fn as_ptr(&self) -> *mut u8 {
		self.ptr.as_ptr()
	}

	/// View the region. Must not be held across a hypercall that writes it.
	pub fn as_slice(&self) -> &[u8] {
		unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
	}

	/// Mutable view of the region. Must not be held across a hypercall.
	pub fn as_mut_slice(&mut self) -> &mut [u8] {
		unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
	}

	/// Clear every byte
	pub fn zero(&mut self) {
		self.as_mut_slice().fill(0);
	}

	/// Lock the region in physical memory until the returned guard drops
	pub fn pin(&self) -> Result<Pinned<'_>> {
		pin_raw(self.ptr.cast(), self.len)
	}
}

/// Memory locked with `mlock`, released again on drop.
///
/// The host writes straight into guest-physical pages while servicing a
/// hypercall; a page swapped out mid-call would silently lose the write.
#[derive(Debug)]
pub struct Pinned<'a> {
	addr: NonNull<c_void>,
	len: usize,
	_memory: PhantomData<&'a [u8]>,
}

/// Pin an arbitrary byte slice for the duration of a hypercall
pub fn pin_slice(bytes: &[u8]) -> Result<Pinned<'_>> {
	let addr = NonNull::new(bytes.as_ptr() as *mut c_void).unwrap_or(NonNull::dangling());
	pin_raw(addr, bytes.len())
}

fn pin_raw<'a>(addr: NonNull<c_void>, len: usize) -> Result<Pinned<'a>> {
	unsafe { mlock(addr, len) }.map_err(|source| AgentError::Pin {
		addr: addr.as_ptr() as usize,
		size: len,
		source,
	})?;

	Ok(Pinned { addr, len, _memory: PhantomData })
}

impl Drop for Pinned<'_> {
	fn drop(&mut self) {
		if let Err(err) = unsafe { munlock(self.addr, self.len) } {
			log::warn!("munlock of {:#x} bytes at {:p} failed: {err}", self.len, self.addr);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mapped_region_is_zeroed_and_writable() {
		let mut region = SharedRegion::map(0x2000).unwrap();
		assert_eq!(region.len(), 0x2000);
		assert!(region.as_slice().iter().all(|b| *b == 0));

		region.as_mut_slice()[0x1fff] = 0x41;
		assert_eq!(region.as_slice()[0x1fff], 0x41);

		region.zero();
		assert_eq!(region.as_slice()[0x1fff], 0);
	}

	#[test]
	fn empty_regions_are_refused() {
		assert!(matches!(SharedRegion::map(0), Err(AgentError::EmptyRegion)));
	}

	#[test]
	fn region_pins_and_unpins() {
		let region = SharedRegion::map(0x1000).unwrap();
		let pinned = region.pin().unwrap();
		drop(pinned);
	}

	#[test]
	fn shared_mapping_survives_fork() {
		use nix::sys::wait::{waitpid, WaitStatus};
		use nix::unistd::{fork, ForkResult};

		let mut region = SharedRegion::map(0x1000).unwrap();

		match unsafe { fork() }.unwrap() {
			ForkResult::Child => {
				region.as_mut_slice()[7] = 0x99;
				unsafe { libc::_exit(0) };
			}
			ForkResult::Parent { child } => {
				assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
				assert_eq!(region.as_slice()[7], 0x99);
			}
		}
	}
}
