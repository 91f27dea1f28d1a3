//! Runtime knobs of the agent.
//!
//! The agent is usually preloaded into a target we do not control the command
//! line of, so options come from the environment.

use log::LevelFilter;
use std::str::FromStr;

/// Environment variable holding the log level forwarded to the host
pub const ENV_LOG: &str = "SNAPAGENT_LOG";
/// Upload the instrumentation's auto-dictionary during negotiation
pub const ENV_DICTIONARY: &str = "SNAPAGENT_DICTIONARY";
/// Copy the instrumentation coverage map into the trace buffer on release
pub const ENV_COVERAGE_BRIDGE: &str = "SNAPAGENT_COVERAGE_BRIDGE";
/// Ignore target attempts to replace the fatal-signal handlers
pub const ENV_BLOCK_SIGNAL_OVERRIDES: &str = "SNAPAGENT_BLOCK_SIGNAL_OVERRIDES";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOptions {
	pub log_level: LevelFilter,
	pub upload_dictionary: bool,
	pub bridge_coverage: bool,
	pub block_target_overrides: bool,
}

pub fn default_log_level() -> LevelFilter {
	LevelFilter::Info
}

impl Default for AgentOptions {
	fn default() -> Self {
		Self {
			log_level: default_log_level(),
			upload_dictionary: true,
			bridge_coverage: true,
			block_target_overrides: true,
		}
	}
}

/// Accepts the usual spellings of a boolean switch
fn parse_switch(value: &str) -> Option<bool> {
	match value.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

impl AgentOptions {
	/// Read the options from the process environment
	pub fn from_env() -> AgentOptions {
		AgentOptions::from_lookup(|key| std::env::var(key).ok())
	}

	/// Build the options from any key/value source, keeping defaults for
	/// missing or malformed entries
	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AgentOptions {
		let mut options = AgentOptions::default();

		if let Some(level) = lookup(ENV_LOG) {
			match LevelFilter::from_str(level.trim()) {
				Ok(level) => options.log_level = level,
				Err(_) => log::warn!("{ENV_LOG}: unknown log level {level:?}, keeping {}", options.log_level),
			}
		}

		let switches: [(&str, &mut bool); 3] = [
			(ENV_DICTIONARY, &mut options.upload_dictionary),
			(ENV_COVERAGE_BRIDGE, &mut options.bridge_coverage),
			(ENV_BLOCK_SIGNAL_OVERRIDES, &mut options.block_target_overrides),
		];

		for (key, slot) in switches {
			let Some(value) = lookup(key) else {
				continue;
			};

			match parse_switch(&value) {
				Some(on) => *slot = on,
				None => log::warn!("{key}: expected a boolean, got {value:?}, keeping {slot}"),
			}
		}

		options
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn options(pairs: &[(&str, &str)]) -> AgentOptions {
		let env: HashMap<String, String> =
			pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		AgentOptions::from_lookup(|key| env.get(key).cloned())
	}

	#[test]
	fn empty_environment_gives_defaults() {
		assert_eq!(options(&[]), AgentOptions::default());
	}

	#[test]
	fn switches_and_level_are_read() {
		let opts = options(&[
			(ENV_LOG, "debug"),
			(ENV_DICTIONARY, "off"),
			(ENV_COVERAGE_BRIDGE, "0"),
			(ENV_BLOCK_SIGNAL_OVERRIDES, "No"),
		]);

		assert_eq!(opts.log_level, LevelFilter::Debug);
		assert!(!opts.upload_dictionary);
		assert!(!opts.bridge_coverage);
		assert!(!opts.block_target_overrides);
	}

	#[test]
	fn malformed_values_keep_defaults() {
		let opts = options(&[(ENV_LOG, "chatty"), (ENV_DICTIONARY, "maybe")]);
		assert_eq!(opts.log_level, default_log_level());
		assert!(opts.upload_dictionary);
	}
}
