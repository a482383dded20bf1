//! Configuration

// Imports
use commap::Topology;

/// Configuration
#[derive(Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
	/// Trace skip
	pub trace_skip: usize,

	/// Debug output period (in seconds)
	pub debug_output_period_secs: f64,

	/// Tracker configuration
	pub tracker: TrackerSection,

	/// Placement configuration
	pub placement: PlacementSection,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			trace_skip: 0,
			debug_output_period_secs: 2.0,
			tracker: TrackerSection::default(),
			placement: PlacementSection::default(),
		}
	}
}

/// Tracker config
#[derive(Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TrackerSection {
	/// Maximum tracked threads
	pub max_threads: usize,

	/// Tracked address-space size, as an exponent
	pub mem_bits: u32,

	/// Only tally accesses within the trace's region of interest
	pub roi_only: bool,
}

impl Default for TrackerSection {
	fn default() -> Self {
		Self {
			max_threads: 64,
			mem_bits:    30,
			roi_only:    false,
		}
	}
}

/// Placement config
#[derive(Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PlacementSection {
	/// Maximum partitions when no topology is given
	pub max_partitions: usize,

	/// Target machine topology
	pub topology: Option<Topology>,
}

impl Default for PlacementSection {
	fn default() -> Self {
		Self {
			max_partitions: 16,
			topology:       None,
		}
	}
}
