//! Communication-aware thread mapper (`commap`)

// Modules
mod args;
mod config;

// Imports
use {
	self::args::Args,
	anyhow::Context,
	clap::Parser,
	commap::{CommTrace, MappingGraph, Simulator, TraceReader, TrackerConfig},
	commap_util::logger,
	itertools::Itertools,
	std::{fs, time::Duration},
};

fn main() -> Result<(), anyhow::Error> {
	// Get arguments
	let args = Args::parse();
	logger::pre_init::debug(format!("Args: {args:?}"));

	// Initialize logging
	logger::init(args.log_file.as_deref(), args.log_file_append);

	// Read the trace file
	let trace_file = fs::File::open(&args.trace_file).context("Unable to open trace file")?;
	let mut trace_reader =
		TraceReader::from_reader(std::io::BufReader::new(trace_file)).context("Unable to parse trace")?;
	tracing::trace!(target: "commap::parse_trace", records = trace_reader.records_remaining(), "Parsed trace");

	// Read the config file, if any
	let config = match &args.config_file {
		Some(config_file) => {
			let config_file = fs::File::open(config_file).context("Unable to open config file")?;
			serde_json::from_reader::<_, self::config::Config>(config_file).context("Unable to parse config file")?
		},
		None => self::config::Config::default(),
	};

	// Run the simulator
	let mut sim = Simulator::new(
		config.trace_skip,
		Duration::from_secs_f64(config.debug_output_period_secs),
	);
	let trace = CommTrace::new(&TrackerConfig {
		max_threads: config.tracker.max_threads,
		mem_bits:    config.tracker.mem_bits,
	});
	let run_output = sim
		.run(&mut trace_reader, &trace, config.tracker.roi_only)
		.context("Unable to run simulator")?;
	trace.force_close();
	tracing::info!(
		records = run_output.records_processed,
		accesses = run_output.accesses_delivered,
		threads = trace.registry().threads_seen(),
		"Finished replay"
	);

	// Write the matrices and metrics.
	// Output failures shouldn't lose the placement, so just log them.
	let topology = config.placement.topology.as_ref();
	if let Err(err) = trace.flush(&args.output_dir, topology) {
		tracing::warn!("Unable to write output: {err:?}");
	}

	// Derive the placement from the global touch matrix
	let cells = trace.global().snapshot();
	let graph = MappingGraph::from_matrix(&cells.touches);
	let perm = match topology {
		Some(topology) => graph.map(topology),
		None => graph.partition(config.placement.max_partitions),
	};

	if let Err(err) = perm.write_file(&args.output_dir.join("permutation.txt")) {
		tracing::warn!("Unable to write permutation: {err:?}");
	}
	println!("{perm}");
	if let Some(topology) = topology {
		let os_indices = perm.to_os_indices(topology);
		println!("{}", os_indices.iter().format(" "));
	}

	Ok(())
}
