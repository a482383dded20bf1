//! Call-scoped communication accumulation
//!
//! Every read resolves to a producer slot through the page table; the
//! (reader, producer) pair is tallied into the thread's current delta. The
//! delta is folded into the enclosing [`Communicator`] scopes on routine
//! entry and exit, so each instrumented routine ends up with the
//! communication that happened while it was on the call stack.

// Imports
use {
	crate::{
		matrix::{AffinityMatrix, Matrix},
		metrics::AffinityMetrics,
		page_table::{PageTable, TrackerConfig},
		threads::ThreadRegistry,
		topology::Topology,
	},
	anyhow::Context,
	std::{
		collections::BTreeMap,
		fs,
		path::Path,
		sync::{
			atomic::{AtomicBool, AtomicUsize, Ordering},
			Arc, Mutex, PoisonError,
		},
	},
};

/// Communication tallies of a single scope
#[derive(Clone, Debug)]
pub struct CommCells {
	/// Bytes communicated, cell `(reader, producer)`
	pub bytes: Matrix<u64>,

	/// Read touches, cell `(reader, producer)`
	pub touches: Matrix<u64>,
}

impl CommCells {
	/// Tallies a read of `size` bytes by `reader` of data produced by `producer`
	fn record(&mut self, reader: usize, producer: usize, size: u32) {
		*self.bytes.get_mut(reader, producer) += u64::from(size);
		*self.touches.get_mut(reader, producer) += 1;
	}

	/// Adds `other`'s tallies into this scope, growing to fit
	fn fold(&mut self, other: &Self) {
		self.bytes.resize(other.bytes.size());
		self.touches.resize(other.touches.size());
		self.bytes += &other.bytes;
		self.touches += &other.touches;
	}

	/// Zeroes all tallies, keeping the allocation
	fn reset(&mut self) {
		self.bytes.set(0);
		self.touches.set(0);
	}

	/// Returns if no touches were tallied
	fn is_empty(&self) -> bool {
		self.touches.sum() == 0.0
	}
}

impl Default for CommCells {
	fn default() -> Self {
		Self {
			bytes:   Matrix::new(0),
			touches: Matrix::new(0),
		}
	}
}

/// Communication accumulated under one routine scope
#[derive(Debug)]
pub struct Communicator {
	/// Scope name
	name: String,

	/// Accumulated tallies
	cells: Mutex<CommCells>,

	/// Per-slot recursion depth
	recurse: Box<[AtomicUsize]>,
}

impl Communicator {
	/// Creates an empty communicator named `name` for `max_threads` slots
	pub fn new(name: impl Into<String>, max_threads: usize) -> Self {
		Self {
			name:    name.into(),
			cells:   Mutex::new(CommCells::default()),
			recurse: (0..max_threads).map(|_| AtomicUsize::new(0)).collect(),
		}
	}

	/// Returns the scope name
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Registers `slot` entering this scope, returning the previous depth
	fn enter(&self, slot: usize) -> usize {
		self.recurse[slot].fetch_add(1, Ordering::Relaxed)
	}

	/// Registers `slot` leaving this scope, returning the new depth
	fn leave(&self, slot: usize) -> usize {
		self.recurse[slot]
			.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |depth| Some(depth.saturating_sub(1)))
			.map_or(0, |prev| prev.saturating_sub(1))
	}

	/// Folds `delta` into this scope's tallies
	fn fold(&self, delta: &CommCells) {
		self.cells.lock().unwrap_or_else(PoisonError::into_inner).fold(delta);
	}

	/// Returns a copy of the accumulated tallies
	pub fn snapshot(&self) -> CommCells {
		self.cells.lock().unwrap_or_else(PoisonError::into_inner).clone()
	}

	/// Writes this scope's matrices as `{name}.bytes.mat` / `{name}.touches.mat`
	pub fn write_files(&self, dir: &Path) -> Result<(), anyhow::Error> {
		let name = sanitize_name(&self.name);
		let cells = self.snapshot();
		cells
			.bytes
			.write_file(&dir.join(format!("{name}.bytes.mat")))
			.with_context(|| format!("Unable to write byte matrix of {:?}", self.name))?;
		cells
			.touches
			.write_file(&dir.join(format!("{name}.touches.mat")))
			.with_context(|| format!("Unable to write touch matrix of {:?}", self.name))?;
		Ok(())
	}
}

/// Replaces filesystem-hostile characters of a scope name
fn sanitize_name(name: &str) -> String {
	name.chars()
		.map(|ch| match ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
			true => ch,
			false => '_',
		})
		.collect()
}

/// Per-thread tracking state
#[derive(Debug, Default)]
struct ThreadState {
	/// Open scopes, outermost first. The root scope stays at the bottom.
	backtrace: Vec<Arc<Communicator>>,

	/// Communication since the last scope change
	current: CommCells,
}

/// Whole-program communication trace
#[derive(Debug)]
pub struct CommTrace {
	/// Whether accesses are currently tallied
	enabled: AtomicBool,

	/// Cacheline ownership tracking
	page_table: PageTable,

	/// Thread id to slot mapping
	registry: ThreadRegistry,

	/// Per-routine communicators
	comms: Mutex<BTreeMap<u64, Arc<Communicator>>>,

	/// Root scope, below every backtrace
	global: Arc<Communicator>,

	/// Per-slot thread state
	threads: Box<[Mutex<ThreadState>]>,

	/// Thread slot count
	max_threads: usize,
}

impl CommTrace {
	/// Creates a trace for `config`'s bounds
	pub fn new(config: &TrackerConfig) -> Self {
		let global = Arc::new(Communicator::new("global", config.max_threads));
		let threads = (0..config.max_threads)
			.map(|_| {
				Mutex::new(ThreadState {
					backtrace: vec![Arc::clone(&global)],
					current:   CommCells::default(),
				})
			})
			.collect();

		Self {
			enabled: AtomicBool::new(true),
			page_table: PageTable::new(config),
			registry: ThreadRegistry::new(config.max_threads),
			comms: Mutex::new(BTreeMap::new()),
			global,
			threads,
			max_threads: config.max_threads,
		}
	}

	/// Returns the page table
	pub fn page_table(&self) -> &PageTable {
		&self.page_table
	}

	/// Returns the thread registry
	pub fn registry(&self) -> &ThreadRegistry {
		&self.registry
	}

	/// Returns the root communicator
	pub fn global(&self) -> &Arc<Communicator> {
		&self.global
	}

	/// Returns the communicator of `routine`, if one exists
	pub fn communicator(&self, routine: u64) -> Option<Arc<Communicator>> {
		self.comms
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&routine)
			.cloned()
	}

	/// Associates `name` with `routine`'s communicator.
	///
	/// Only the first registration of a routine names it.
	pub fn register_routine(&self, routine: u64, name: &str) {
		let mut comms = self.comms.lock().unwrap_or_else(PoisonError::into_inner);
		match comms.get(&routine) {
			Some(comm) =>
				if comm.name() != name {
					tracing::debug!(routine, name, prev = comm.name(), "Ignoring routine rename");
				},
			None => {
				comms.insert(routine, Arc::new(Communicator::new(name, self.max_threads)));
			},
		}
	}

	/// Returns `routine`'s communicator, creating an unnamed one if needed
	fn comm_for(&self, routine: u64) -> Arc<Communicator> {
		let mut comms = self.comms.lock().unwrap_or_else(PoisonError::into_inner);
		Arc::clone(
			comms
				.entry(routine)
				.or_insert_with(|| Arc::new(Communicator::new(format!("routine_{routine:#x}"), self.max_threads))),
		)
	}

	/// Toggles access tallying
	pub fn set_enabled(&self, enabled: bool) {
		self.enabled.store(enabled, Ordering::Release);
		tracing::info!(enabled, "Toggled communication tracking");
	}

	/// Registers `tid` entering `routine`.
	///
	/// On the outermost entry, the thread's pending delta is folded into all
	/// enclosing scopes and reset, and the routine's scope is pushed.
	/// Recursive re-entries only bump the depth.
	pub fn routine_enter(&self, routine: u64, tid: u64) {
		if !self.enabled.load(Ordering::Acquire) {
			return;
		}

		let slot = self.registry.slot(tid);
		let comm = self.comm_for(routine);
		if comm.enter(slot) != 0 {
			return;
		}

		let mut state = self.threads[slot].lock().unwrap_or_else(PoisonError::into_inner);
		if !state.current.is_empty() {
			let delta = state.current.clone();
			for ancestor in &state.backtrace {
				ancestor.fold(&delta);
			}
			state.current.reset();
		}
		state.backtrace.push(comm);
	}

	/// Registers `tid` leaving `routine`.
	///
	/// On the outermost exit, the pending delta is folded into the scope
	/// being popped, which is then removed. The delta itself stays pending,
	/// to be folded into the remaining scopes at the next scope change.
	pub fn routine_exit(&self, routine: u64, tid: u64) {
		if !self.enabled.load(Ordering::Acquire) {
			return;
		}

		let slot = self.registry.slot(tid);
		let comm = self.comm_for(routine);
		if comm.leave(slot) != 0 {
			return;
		}

		let mut state = self.threads[slot].lock().unwrap_or_else(PoisonError::into_inner);
		match state.backtrace.last() {
			// The root scope is never popped
			Some(top) if Arc::ptr_eq(top, &comm) && state.backtrace.len() > 1 => {
				comm.fold(&state.current);
				state.backtrace.pop();
			},
			_ => tracing::debug!(routine, tid, "Unbalanced routine exit"),
		}
	}

	/// Registers a read of `addr` by `tid`
	pub fn mem_read(&self, tid: u64, addr: u64, size: u32) {
		if !self.enabled.load(Ordering::Acquire) {
			return;
		}

		let slot = self.registry.slot(tid);
		let producer = self.page_table.read(addr, slot, size);
		let mut state = self.threads[slot].lock().unwrap_or_else(PoisonError::into_inner);
		state.current.record(slot, producer, size);
	}

	/// Registers a write of `addr` by `tid`
	pub fn mem_write(&self, tid: u64, addr: u64, size: u32) {
		if !self.enabled.load(Ordering::Acquire) {
			return;
		}

		let slot = self.registry.slot(tid);
		let _ = self.page_table.write(addr, slot, size);
	}

	/// Registers `child` being spawned by `parent`.
	///
	/// The child inherits the parent's open scopes, so communication it
	/// performs is attributed to the routines active at spawn time.
	pub fn thread_create(&self, parent: u64, child: u64) {
		let parent_slot = self.registry.slot(parent);
		let child_slot = self.registry.slot(child);
		if parent_slot == child_slot {
			return;
		}

		// Lock in slot order
		let (low, high) = match parent_slot < child_slot {
			true => (parent_slot, child_slot),
			false => (child_slot, parent_slot),
		};
		let mut low_state = self.threads[low].lock().unwrap_or_else(PoisonError::into_inner);
		let mut high_state = self.threads[high].lock().unwrap_or_else(PoisonError::into_inner);

		let (parent_state, child_state) = match parent_slot < child_slot {
			true => (&*low_state, &mut *high_state),
			false => (&*high_state, &mut *low_state),
		};
		child_state.backtrace = parent_state.backtrace.clone();
		child_state.current = CommCells::default();
	}

	/// Folds every thread's pending delta into its open scopes and collapses
	/// the backtraces back to the root scope
	pub fn force_close(&self) {
		for state in &*self.threads {
			let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
			if !state.current.is_empty() {
				let delta = state.current.clone();
				for scope in &state.backtrace {
					scope.fold(&delta);
				}
				state.current.reset();
			}
			state.backtrace.truncate(1);
		}
	}

	/// Writes all communication matrices and the metrics summary into `dir`
	pub fn flush(&self, dir: &Path, topology: Option<&Topology>) -> Result<(), anyhow::Error> {
		fs::create_dir_all(dir).with_context(|| format!("Unable to create output directory {dir:?}"))?;

		self.global
			.write_files(dir)
			.context("Unable to write global matrices")?;
		let comms = self
			.comms
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.values()
			.cloned()
			.collect::<Vec<_>>();
		for comm in &comms {
			comm.write_files(dir)
				.with_context(|| format!("Unable to write matrices of {:?}", comm.name()))?;
		}

		let nthreads = usize::max(self.registry.threads_seen(), 1);
		let page_stats = self.page_table.stats(nthreads);
		let global_cells = self.global.snapshot();

		let mut metrics = AffinityMetrics::new(&page_stats, topology);
		metrics.add_matrix_metrics(&AffinityMatrix::new(global_cells.bytes.to_f64()), "bytes", topology);
		metrics.add_matrix_metrics(&AffinityMatrix::new(global_cells.touches.to_f64()), "touches", topology);
		metrics.write(dir, "metrics.csv").context("Unable to write metrics")?;

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn trace() -> CommTrace {
		CommTrace::new(&TrackerConfig {
			max_threads: 8,
			mem_bits:    20,
		})
	}

	#[test]
	fn read_reaches_global_scope() {
		let trace = trace();
		trace.mem_write(100, 0x1000, 8);
		trace.mem_read(200, 0x1000, 64);
		trace.force_close();

		// Thread 100 is slot 0, thread 200 slot 1
		let cells = trace.global().snapshot();
		assert_eq!(cells.bytes.get(1, 0), 64);
		assert_eq!(cells.touches.get(1, 0), 1);
	}

	#[test]
	fn routine_scope_captures_reads_within() {
		let trace = trace();
		trace.register_routine(7, "compute");

		trace.mem_read(100, 0x0, 4);
		trace.routine_enter(7, 100);
		trace.mem_read(100, 0x2000, 16);
		trace.routine_exit(7, 100);
		trace.force_close();

		// Only the read inside the scope lands in the routine's cells
		let comm = trace.communicator(7).expect("Missing communicator");
		assert_eq!(comm.name(), "compute");
		let cells = comm.snapshot();
		assert_eq!(cells.bytes.get(0, 0), 16);
		assert_eq!(cells.touches.sum(), 1.0);

		// The global scope sees both
		let global = trace.global().snapshot();
		assert_eq!(global.touches.sum(), 2.0);
	}

	#[test]
	fn recursive_enters_collapse_into_one_scope() {
		let trace = trace();
		trace.routine_enter(3, 100);
		trace.routine_enter(3, 100);
		trace.routine_enter(3, 100);
		trace.mem_read(100, 0x0, 8);
		trace.routine_exit(3, 100);
		trace.routine_exit(3, 100);
		trace.routine_exit(3, 100);
		trace.force_close();

		let cells = trace.communicator(3).expect("Missing communicator").snapshot();
		assert_eq!(cells.touches.sum(), 1.0);
		assert_eq!(cells.bytes.get(0, 0), 8);
	}

	#[test]
	fn unbalanced_exit_is_ignored() {
		let trace = trace();
		trace.mem_read(100, 0x0, 8);
		trace.routine_exit(9, 100);
		trace.force_close();

		let cells = trace.communicator(9).expect("Missing communicator").snapshot();
		assert_eq!(cells.touches.sum(), 0.0);
		assert_eq!(trace.global().snapshot().touches.sum(), 1.0);
	}

	#[test]
	fn spawned_thread_inherits_open_scopes() {
		let trace = trace();
		trace.routine_enter(5, 100);
		trace.thread_create(100, 200);
		trace.mem_read(200, 0x0, 32);
		trace.routine_exit(5, 200);
		trace.force_close();

		let cells = trace.communicator(5).expect("Missing communicator").snapshot();
		assert_eq!(cells.bytes.get(1, 1), 32);
	}

	#[test]
	fn disabled_routine_events_do_no_work() {
		let trace = trace();
		trace.set_enabled(false);
		trace.routine_enter(1, 100);
		trace.set_enabled(true);
		trace.mem_read(100, 0x0, 8);
		trace.force_close();

		// No communicator was created and no scope captured the read
		assert!(trace.communicator(1).is_none());
		assert_eq!(trace.global().snapshot().touches.sum(), 1.0);
	}

	#[test]
	fn flush_writes_the_metrics_report() {
		let trace = trace();
		trace.mem_write(100, 0x0, 8);
		trace.mem_read(200, 0x0, 8);
		trace.force_close();

		let dir = std::env::temp_dir().join(format!("commap-flush-test-{}", std::process::id()));
		trace.flush(&dir, None).expect("Unable to flush");
		assert!(dir.join("metrics.csv").is_file());
		assert!(dir.join("sharing.mat").is_file());
		assert!(dir.join("global.bytes.mat").is_file());
		fs::remove_dir_all(&dir).expect("Unable to clean up");
	}

	#[test]
	fn disabled_trace_tallies_nothing() {
		let trace = trace();
		trace.set_enabled(false);
		trace.mem_write(100, 0x0, 8);
		trace.mem_read(200, 0x0, 8);
		trace.force_close();

		assert_eq!(trace.global().snapshot().touches.sum(), 0.0);
	}

	#[test]
	fn sanitized_names() {
		assert_eq!(sanitize_name("std::vector<int>::push_back"), "std__vector_int___push_back");
		assert_eq!(sanitize_name("main"), "main");
	}
}
