//! Communication-aware thread mapper (`commap`)
//!
//! Replays the memory-access trace of a parallel program, reconstructs
//! cacheline sharing and per-thread-pair communication scoped by calling
//! context, and derives a thread-to-core placement from the resulting
//! affinity matrices.

// Modules
pub mod comm;
pub mod matrix;
pub mod metrics;
pub mod page_table;
pub mod partition;
pub mod perm;
pub mod replay;
pub mod sim;
pub mod stats;
pub mod threads;
pub mod topology;

// Exports
pub use self::{
	comm::{CommTrace, Communicator},
	matrix::{AffinityMatrix, Matrix},
	page_table::{PageTable, TrackerConfig},
	partition::MappingGraph,
	perm::Permutation,
	replay::{TraceReader, TraceWriter},
	sim::{EventSink, Simulator},
	topology::Topology,
};
