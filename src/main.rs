//! ###############################################################################
//! # snapagent-demo - a "Hello World" harness running on the snapshot agent      #
//! ###############################################################################
//!
//! Built plainly, this executable reads one input file and runs the target on
//! it once. Built with `--features snapshot` and started inside the snapshot
//! VM, the very same code is fed by the hypervisor, one restore per input.

use snapagent::{Execution, Fuzz};
use std::env;
use std::fs;
use std::process::exit;

/// Record tag whose handler carries the planted bug
const TAG_BLOB: u8 = 0xcc;

/// Our toy target walks a list of `[tag, len, payload...]` records
fn parse_records(input: &[u8]) -> usize {
	let mut records = 0;
	let mut cursor = input;

	while cursor.len() >= 2 {
		let tag = cursor[0];
		let len = cursor[1] as usize;
		cursor = &cursor[2..];

		// Blobs trust their length byte, that is the bug the fuzzer should find
		if tag == TAG_BLOB {
			let blob = &cursor[..len];
			log::debug!("blob of {} bytes", blob.len());
		}

		cursor = &cursor[len.min(cursor.len())..];
		records += 1;
	}

	records
}

fn main() {
	if !cfg!(feature = "snapshot") {
		env_logger::Builder::new()
			.filter_level(log::LevelFilter::Info)
			.parse_env("SNAPAGENT_LOG")
			.init();
	}

	// In snapshot mode the hypervisor supplies the input, the file is optional
	let data = match env::args().nth(1) {
		Some(path) => fs::read(&path).unwrap_or_else(|err| {
			eprintln!("unable to read {path}: {err}");
			exit(1);
		}),
		None if cfg!(feature = "snapshot") => Vec::new(),
		None => {
			eprintln!("usage: snapagent-demo <input file>");
			exit(1);
		}
	};

	let mut fuzz = Fuzz::new(&data);

	// Under the hypervisor this runs once per restore, otherwise exactly once
	fuzz.run(|input| {
		let records = parse_records(input);
		log::info!("parsed {records} records from {} bytes", input.len());
	});
}
