//! Logger

// Imports
use {
	std::{fs, io, path::Path, sync::Mutex},
	tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter},
};

/// Logging before the logger is initialized.
///
/// Messages are buffered and emitted once [`init`] installs the subscriber.
pub mod pre_init {
	use std::sync::Mutex;

	/// Buffered messages
	pub(super) static MESSAGES: Mutex<Vec<String>> = Mutex::new(Vec::new());

	/// Buffers a debug message until the logger is initialized
	pub fn debug(msg: impl Into<String>) {
		let mut messages = MESSAGES.lock().expect("Pre-init message buffer was poisoned");
		messages.push(msg.into());
	}
}

/// Initializes the logger.
///
/// Always logs to stderr, filtered by `RUST_LOG`. When `log_file` is given,
/// additionally logs to it, filtered by `RUST_LOG_FILE`.
pub fn init(log_file: Option<&Path>, log_file_append: bool) {
	// Stderr layer
	let stderr_layer = tracing_subscriber::fmt::layer()
		.with_writer(io::stderr)
		.with_filter(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::INFO.into())
				.with_env_var("RUST_LOG")
				.from_env_lossy(),
		);

	// File layer, if requested
	let file_layer = log_file.and_then(|path| {
		let mut options = fs::OpenOptions::new();
		options.create(true).write(true);
		match log_file_append {
			true => options.append(true),
			false => options.truncate(true),
		};

		match options.open(path) {
			Ok(file) => Some(
				tracing_subscriber::fmt::layer()
					.with_ansi(false)
					.with_writer(Mutex::new(file))
					.with_filter(
						EnvFilter::builder()
							.with_default_directive(LevelFilter::DEBUG.into())
							.with_env_var("RUST_LOG_FILE")
							.from_env_lossy(),
					),
			),
			Err(err) => {
				eprintln!("Unable to open log file {path:?}: {err}");
				None
			},
		}
	});

	tracing_subscriber::registry()
		.with(stderr_layer)
		.with(file_layer)
		.init();

	// Emit anything logged before we got here
	let mut messages = pre_init::MESSAGES.lock().expect("Pre-init message buffer was poisoned");
	for msg in messages.drain(..) {
		tracing::debug!(target: "commap::pre_init", "{msg}");
	}
}
