//! Trace simulation
//!
//! Drives a [`TraceReader`] over an [`EventSink`], dispatching each record
//! to the matching sink call. Memory accesses may be subsampled via the
//! trace skip; structural records (routine boundaries, thread spawns,
//! region-of-interest markers) are always delivered so scopes stay balanced.

// Imports
use {
	crate::{
		comm::CommTrace,
		replay::{Record, TraceReader},
	},
	anyhow::Context,
	std::{
		fmt,
		io,
		time::{Duration, Instant},
	},
};

/// Receiver of replayed trace events
pub trait EventSink {
	/// Handles a memory read
	fn mem_read(&self, tid: u64, addr: u64, size: u32);

	/// Handles a memory write
	fn mem_write(&self, tid: u64, addr: u64, size: u32);

	/// Handles a routine entry
	fn routine_enter(&self, routine: u64, tid: u64);

	/// Handles a routine exit
	fn routine_exit(&self, routine: u64, tid: u64);

	/// Handles a thread spawn
	fn thread_create(&self, parent: u64, child: u64);

	/// Toggles whether accesses should be tallied
	fn set_enabled(&self, enabled: bool);

	/// Registers a routine name
	fn register_routine(&self, routine: u64, name: &str) {
		let _ = (routine, name);
	}

	/// Formats debug output to `f`
	fn fmt_debug(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
		let _ = f;
		Ok(())
	}
}

/// Simulator
#[derive(Debug)]
pub struct Simulator {
	/// Trace skip.
	///
	/// Dictates how many memory accesses are skipped for each one delivered.
	/// A value of 0 delivers all accesses, a value of 1 every other one.
	trace_skip: usize,

	/// Interval in which to output debug output for the sink
	debug_output_period: Duration,
}

impl Simulator {
	/// Creates a new simulator
	pub fn new(trace_skip: usize, debug_output_period: Duration) -> Self {
		Self {
			trace_skip,
			debug_output_period,
		}
	}

	/// Runs the simulator on all records from `trace_reader` with sink `sink`.
	///
	/// With `roi_only`, tallying starts disabled and follows the trace's
	/// region-of-interest markers.
	pub fn run<S: EventSink>(
		&mut self,
		trace_reader: &mut TraceReader<impl io::Read>,
		sink: &S,
		roi_only: bool,
	) -> Result<RunOutput, anyhow::Error> {
		sink.set_enabled(!roi_only);

		// Note: We start in the past so that we output right away at the start
		let mut last_debug_time = Instant::now() - self.debug_output_period;

		let total_records = trace_reader.records_remaining();
		let record_it = std::iter::from_fn(|| trace_reader.read_next().transpose());

		let mut records_processed = 0_u64;
		let mut accesses_seen = 0_usize;
		let mut accesses_delivered = 0_u64;
		for (record_idx, record_res) in record_it.enumerate() {
			let record = record_res.context("Unable to read next record")?;
			records_processed += 1;

			// Subsample memory accesses; everything else always goes through
			if record.is_mem_access() {
				let deliver = accesses_seen % (self.trace_skip + 1) == 0;
				accesses_seen += 1;
				if !deliver {
					continue;
				}
				accesses_delivered += 1;
			}

			match record {
				Record::MemRead { tid, addr, size } => sink.mem_read(tid, addr, size),
				Record::MemWrite { tid, addr, size } => sink.mem_write(tid, addr, size),
				Record::RoutineEnter { tid, routine } => sink.routine_enter(routine, tid),
				Record::RoutineExit { tid, routine } => sink.routine_exit(routine, tid),
				Record::ThreadCreate { parent, child } => sink.thread_create(parent, child),
				Record::RoiBegin =>
					if roi_only {
						sink.set_enabled(true);
					},
				Record::RoiEnd =>
					if roi_only {
						sink.set_enabled(false);
					},
				Record::RoutineName { routine, ref name } => sink.register_routine(routine, name),
			}

			// Then show debug output, if it's been long enough
			let cur_time = Instant::now();
			if cur_time.duration_since(last_debug_time) >= self.debug_output_period {
				let records_processed_percentage = 100.0 * (record_idx as f64 / total_records as f64);
				tracing::info!(
					"[{records_processed_percentage:.2}%] Debug: {}",
					commap_util::DisplayWrapper::new(|f| sink.fmt_debug(f))
				);
				last_debug_time = cur_time;
			}
		}

		Ok(RunOutput {
			records_processed,
			accesses_delivered,
		})
	}
}

/// Output for [`Simulator::run`]
#[derive(Clone, Copy, Debug)]
pub struct RunOutput {
	/// Total records processed
	pub records_processed: u64,

	/// Memory accesses delivered to the sink after subsampling
	pub accesses_delivered: u64,
}

impl EventSink for CommTrace {
	fn mem_read(&self, tid: u64, addr: u64, size: u32) {
		Self::mem_read(self, tid, addr, size);
	}

	fn mem_write(&self, tid: u64, addr: u64, size: u32) {
		Self::mem_write(self, tid, addr, size);
	}

	fn routine_enter(&self, routine: u64, tid: u64) {
		Self::routine_enter(self, routine, tid);
	}

	fn routine_exit(&self, routine: u64, tid: u64) {
		Self::routine_exit(self, routine, tid);
	}

	fn thread_create(&self, parent: u64, child: u64) {
		Self::thread_create(self, parent, child);
	}

	fn set_enabled(&self, enabled: bool) {
		Self::set_enabled(self, enabled);
	}

	fn register_routine(&self, routine: u64, name: &str) {
		Self::register_routine(self, routine, name);
	}

	fn fmt_debug(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
		let cells = self.global().snapshot();
		let touches = cells.touches.cells().map(|touch| touch as f64).collect::<average::Variance>();

		write!(
			f,
			"threads: {}, touches/cell: μ={:.2} σ={:.2}",
			self.registry().threads_seen(),
			touches.mean(),
			touches.sample_variance().sqrt()
		)
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{page_table::TrackerConfig, replay::TraceWriter},
	};

	fn write_trace(records: &[Record]) -> Vec<u8> {
		let mut writer = TraceWriter::new(io::Cursor::new(Vec::new())).expect("Unable to create writer");
		for record in records {
			writer.write(record).expect("Unable to write record");
		}
		writer.finish().expect("Unable to finish").into_inner()
	}

	fn run_trace(records: &[Record], trace_skip: usize, roi_only: bool) -> CommTrace {
		let buf = write_trace(records);
		let mut reader = TraceReader::from_reader(io::Cursor::new(buf)).expect("Unable to create reader");

		let trace = CommTrace::new(&TrackerConfig {
			max_threads: 8,
			mem_bits:    20,
		});
		Simulator::new(trace_skip, Duration::from_secs(3600))
			.run(&mut reader, &trace, roi_only)
			.expect("Unable to run simulation");
		trace.force_close();
		trace
	}

	#[test]
	fn replay_reaches_the_sink() {
		let trace = run_trace(
			&[
				Record::MemWrite {
					tid:  100,
					addr: 0x1000,
					size: 8,
				},
				Record::MemRead {
					tid:  200,
					addr: 0x1000,
					size: 64,
				},
			],
			0,
			false,
		);

		assert_eq!(trace.global().snapshot().bytes.get(1, 0), 64);
	}

	#[test]
	fn roi_gating_skips_outside_accesses() {
		let trace = run_trace(
			&[
				Record::MemRead {
					tid:  100,
					addr: 0x0,
					size: 8,
				},
				Record::RoiBegin,
				Record::MemRead {
					tid:  100,
					addr: 0x40,
					size: 8,
				},
				Record::RoiEnd,
				Record::MemRead {
					tid:  100,
					addr: 0x80,
					size: 8,
				},
			],
			0,
			true,
		);

		assert_eq!(trace.global().snapshot().touches.sum(), 1.0);
	}

	#[test]
	fn trace_skip_subsamples_only_accesses() {
		let records = vec![
			Record::RoutineName {
				routine: 1,
				name:    "work".to_owned(),
			},
			Record::RoutineEnter { tid: 100, routine: 1 },
			Record::MemRead {
				tid:  100,
				addr: 0x0,
				size: 8,
			},
			Record::MemRead {
				tid:  100,
				addr: 0x40,
				size: 8,
			},
			Record::MemRead {
				tid:  100,
				addr: 0x80,
				size: 8,
			},
			Record::MemRead {
				tid:  100,
				addr: 0xc0,
				size: 8,
			},
			Record::RoutineExit { tid: 100, routine: 1 },
		];
		let trace = run_trace(&records, 1, false);

		// Half the accesses land, and the routine scope still closes
		assert_eq!(trace.global().snapshot().touches.sum(), 2.0);
		let comm = trace.communicator(1).expect("Missing communicator");
		assert_eq!(comm.name(), "work");
		assert_eq!(comm.snapshot().touches.sum(), 2.0);
	}
}
