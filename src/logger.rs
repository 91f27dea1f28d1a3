//! A `log` backend printing through the host console.
//!
//! Inside the snapshot VM there is no terminal to write to; the host collects
//! whatever the guest sends with the PRINTF hypercall.

use crate::agent::host_print;
use crate::hypercall::Hypervisor;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

pub struct HostLogger<H> {
	host: H,
	level: LevelFilter,
}

impl<H: Hypervisor + Send + Sync + 'static> HostLogger<H> {
	pub fn new(host: H, level: LevelFilter) -> HostLogger<H> {
		HostLogger { host, level }
	}

	/// Make this the global logger
	pub fn init(host: H, level: LevelFilter) -> Result<(), SetLoggerError> {
		log::set_boxed_logger(Box::new(HostLogger::new(host, level)))?;
		log::set_max_level(level);
		Ok(())
	}
}

impl<H: Hypervisor + Send + Sync> Log for HostLogger<H> {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= self.level
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}
		host_print(&self.host, format_args!("[{}] {}\n", record.level(), record.args()));
	}

	fn flush(&self) {}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::hypercall::Hypercall;
	use std::ffi::CStr;
	use std::sync::Mutex;

	#[derive(Default)]
	struct Console {
		lines: Mutex<Vec<String>>,
	}

	impl Hypervisor for Console {
		unsafe fn hypercall(&self, op: Hypercall, arg: u64) -> u64 {
			assert_eq!(op, Hypercall::Printf);
			let text = CStr::from_ptr(arg as *const libc::c_char).to_string_lossy().into_owned();
			self.lines.lock().unwrap().push(text);
			0
		}
	}

	#[test]
	fn records_above_the_level_are_dropped() {
		let logger = HostLogger::new(Console::default(), LevelFilter::Info);

		logger.log(
			&Record::builder()
				.level(log::Level::Info)
				.args(format_args!("payload buffer is mapped at {:#x}", 0x7000))
				.build(),
		);
		logger.log(&Record::builder().level(log::Level::Debug).args(format_args!("noise")).build());

		let lines = logger.host.lines.lock().unwrap();
		assert_eq!(*lines, vec!["[INFO] payload buffer is mapped at 0x7000\n".to_string()]);
	}
}
