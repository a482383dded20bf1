//! Metrics report
//!
//! Collects the scalar descriptors of a run into a single column-aligned
//! text report: one commented info line per metric, then a header row and a
//! value row, so several runs can be concatenated and compared column-wise.

// Imports
use {
	crate::{
		matrix::{AffinityMatrix, Matrix},
		page_table::PageTableStats,
		topology::Topology,
	},
	anyhow::Context,
	std::{fs, io, io::Write, path::Path},
};

/// A single named metric
#[derive(Clone, Debug)]
pub struct Metric {
	/// Column name
	name: String,

	/// Formatted value
	value: String,

	/// Human description, emitted as a comment
	info: String,

	/// Column width
	width: usize,
}

impl Metric {
	/// Creates a metric from a floating value
	pub fn float(name: impl Into<String>, value: f64, info: impl Into<String>) -> Self {
		Self::from_value(name.into(), format!("{value:.6}"), info.into())
	}

	/// Creates a metric from an integer value
	pub fn integer(name: impl Into<String>, value: u64, info: impl Into<String>) -> Self {
		Self::from_value(name.into(), value.to_string(), info.into())
	}

	fn from_value(name: String, value: String, info: String) -> Self {
		let width = usize::max(name.len(), value.len());
		Self { name, value, info, width }
	}
}

/// Metrics report of a finished run
#[derive(Clone, Debug)]
pub struct AffinityMetrics {
	/// Pairwise sharing matrix, written alongside the report
	sharing: Matrix<u64>,

	/// Collected metrics, in emission order
	metrics: Vec<Metric>,
}

impl AffinityMetrics {
	/// Creates a report seeded with the page table's metrics, including the
	/// matrix descriptors of the sharing matrix
	pub fn new(stats: &PageTableStats, topology: Option<&Topology>) -> Self {
		let mut this = Self {
			sharing: stats.sharing_matrix.clone(),
			metrics: Vec::new(),
		};

		this.add_metric(Metric::integer(
			"lines",
			stats.sharing_degree.count(),
			"Cachelines touched",
		));
		this.add_metric(Metric::float(
			"sharing_avg",
			stats.sharing_degree.mean(),
			"Average threads sharing a cacheline",
		));
		this.add_metric(Metric::float(
			"sharing_sd",
			stats.sharing_degree.sd(),
			"Standard deviation of threads sharing a cacheline",
		));
		this.add_metric(Metric::float(
			"writing_avg",
			stats.writing_degree.mean(),
			"Average threads writing a cacheline",
		));
		this.add_metric(Metric::float(
			"writing_sd",
			stats.writing_degree.sd(),
			"Standard deviation of threads writing a cacheline",
		));
		this.add_metric(Metric::float(
			"write_ratio",
			stats.write_ratio.mean(),
			"Average write fraction per cacheline",
		));
		this.add_metric(Metric::float(
			"shared_write_ratio",
			stats.shared_write_ratio.mean(),
			"Average write fraction per shared cacheline",
		));
		this.add_metric(Metric::float(
			"footprint_avg",
			stats.footprint.mean(),
			"Average touches per thread",
		));
		this.add_metric(Metric::float(
			"footprint_sd",
			stats.footprint.sd(),
			"Standard deviation of touches per thread",
		));

		this.add_matrix_metrics(&AffinityMatrix::new(stats.sharing_matrix.to_f64()), "sharing", topology);

		this
	}

	/// Appends a metric
	pub fn add_metric(&mut self, metric: Metric) {
		self.metrics.push(metric);
	}

	/// Appends the derived descriptors of `aff`, with columns prefixed by
	/// `name`.
	///
	/// The private ratio is taken over the raw matrix; all other descriptors
	/// are computed over the matrix with the diagonal blanked and values
	/// rescaled to `[0, 1]`, so they compare across runs of different volume.
	pub fn add_matrix_metrics(&mut self, aff: &AffinityMatrix<f64>, name: &str, topology: Option<&Topology>) {
		let mat = aff.as_matrix();
		let n = mat.size();
		let total = mat.sum();
		let private = match total > 0.0 {
			true => (0..n).map(|i| mat.get(i, i)).sum::<f64>() / total,
			false => 0.0,
		};

		let mut norm = mat.clone();
		norm.blankdiag();
		norm.scale(1.0);
		let aff = AffinityMatrix::new(norm);
		let stat = aff.compute_stat();
		let amount = aff.amount();

		self.add_metric(Metric::float(
			format!("{name}_private"),
			private,
			"Fraction of communication with self",
		));
		self.add_metric(Metric::float(
			format!("{name}_CH"),
			stat.heterogeneity,
			"Communication heterogeneity",
		));
		self.add_metric(Metric::float(format!("{name}_CB"), stat.balance, "Communication balance"));
		self.add_metric(Metric::float(
			format!("{name}_CC"),
			stat.centrality,
			"Communication centrality",
		));
		self.add_metric(Metric::float(
			format!("{name}_NC"),
			stat.neighbour_frac,
			"Fraction of communication beyond immediate neighbours",
		));
		self.add_metric(Metric::float(format!("{name}_amount"), amount, "Mean communication per cell"));
		self.add_metric(Metric::float(
			format!("{name}_clusterSD"),
			aff.cluster_sd(topology),
			"Standard deviation of per-cluster communication",
		));
		self.add_metric(Metric::float(
			format!("{name}_hopbyte"),
			aff.hopbyte(topology),
			"Communication weighted by hop distance",
		));

		if let Some(topology) = topology {
			let split = topology.cluster_size();
			self.add_metric(Metric::float(
				format!("{name}_splitfrac"),
				aff.compute_split_frac(split),
				"Fraction of communication crossing cluster blocks",
			));
		}
	}

	/// Writes the report into `writer`
	pub fn write_to(&self, writer: &mut impl io::Write) -> Result<(), anyhow::Error> {
		for metric in &self.metrics {
			writeln!(writer, "# {:>20}: {}", metric.name, metric.info).context("Unable to write info line")?;
		}
		writeln!(writer).context("Unable to write separator")?;

		for metric in &self.metrics {
			write!(writer, "{:>width$} ", metric.name, width = metric.width).context("Unable to write header")?;
		}
		writeln!(writer).context("Unable to finish header")?;

		for metric in &self.metrics {
			write!(writer, "{:>width$} ", metric.value, width = metric.width).context("Unable to write value")?;
		}
		writeln!(writer).context("Unable to finish values")?;

		Ok(())
	}

	/// Writes the report as `dir/filename` and the sharing matrix as
	/// `dir/sharing.mat`
	pub fn write(&self, dir: &Path, filename: &str) -> Result<(), anyhow::Error> {
		let path = dir.join(filename);
		let file = fs::File::create(&path).with_context(|| format!("Unable to create {path:?}"))?;
		let mut writer = io::BufWriter::new(file);
		self.write_to(&mut writer)
			.with_context(|| format!("Unable to write metrics to {path:?}"))?;

		self.sharing
			.write_file(&dir.join("sharing.mat"))
			.context("Unable to write sharing matrix")?;

		tracing::info!(?path, "Wrote metrics report");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::page_table::{PageTable, TrackerConfig},
	};

	fn sample_stats() -> PageTableStats {
		let table = PageTable::new(&TrackerConfig {
			max_threads: 4,
			mem_bits:    20,
		});
		table.write(0x0, 0, 8);
		table.read(0x0, 1, 8);
		table.stats(2)
	}

	#[test]
	fn report_is_column_aligned() {
		let mut metrics = AffinityMetrics::new(&sample_stats(), None);
		metrics.add_metric(Metric::float("extra", 1.5, "An extra metric"));

		let mut buf = Vec::new();
		metrics.write_to(&mut buf).expect("Unable to write");
		let text = String::from_utf8(buf).expect("Invalid utf-8");

		let mut lines = text.lines();
		let ncomments = lines.by_ref().take_while(|line| line.starts_with("# ")).count();
		let header = lines.next().expect("Missing header");
		let values = lines.next().expect("Missing values");

		// 9 page table metrics, 8 sharing matrix descriptors, 1 extra
		assert_eq!(ncomments, 18);
		assert_eq!(header.len(), values.len());
		assert!(header.contains("sharing_avg"));
		assert!(values.contains("1.500000"));
	}

	#[test]
	fn sharing_matrix_descriptors_are_emitted() {
		let metrics = AffinityMetrics::new(&sample_stats(), None);

		let mut buf = Vec::new();
		metrics.write_to(&mut buf).expect("Unable to write");
		let text = String::from_utf8(buf).expect("Invalid utf-8");

		assert!(text.contains("sharing_private"));
		assert!(text.contains("sharing_CH"));
		assert!(text.contains("sharing_hopbyte"));
	}

	#[test]
	fn matrix_metrics_get_prefixed() {
		let mut metrics = AffinityMetrics::new(&sample_stats(), None);
		let aff = AffinityMatrix::new(Matrix::<f64>::new(4));
		metrics.add_matrix_metrics(&aff, "bytes", None);

		let mut buf = Vec::new();
		metrics.write_to(&mut buf).expect("Unable to write");
		let text = String::from_utf8(buf).expect("Invalid utf-8");

		assert!(text.contains("bytes_CH"));
		assert!(text.contains("bytes_hopbyte"));
		assert!(!text.contains("bytes_splitfrac"));
	}

	#[test]
	fn descriptors_use_the_normalized_matrix() {
		let mut metrics = AffinityMetrics::new(&sample_stats(), None);

		// Constant matrix, diagonal included: 5 everywhere
		let mut mat = Matrix::<f64>::new(4);
		mat.set(5.0);
		metrics.add_matrix_metrics(&AffinityMatrix::new(mat), "bytes", None);

		let mut buf = Vec::new();
		metrics.write_to(&mut buf).expect("Unable to write");
		let text = String::from_utf8(buf).expect("Invalid utf-8");
		let mut lines = text
			.lines()
			.filter(|line| !line.starts_with("# ") && !line.is_empty());
		let names = lines.next().expect("Missing header").split_whitespace();
		let values = lines.next().expect("Missing values").split_whitespace();
		let by_name = names.zip(values).collect::<std::collections::HashMap<_, _>>();

		// Private ratio comes from the raw matrix; the amount from the
		// blanked and rescaled one (12 cells of 1.0 over 16)
		assert_eq!(by_name["bytes_private"], "0.250000");
		assert_eq!(by_name["bytes_amount"], "0.750000");
	}
}
