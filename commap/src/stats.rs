//! Descriptive statistics
//!
//! Both flavors aggregate samples as `f64`: [`Stats`] over a finished batch,
//! [`OnlineStats`] incrementally via Welford's single-pass algorithm, so the
//! two agree on mean and variance for the same sample sequence.

/// Streaming statistics over a sequence of samples
#[derive(Clone, Copy, Debug, Default)]
pub struct OnlineStats {
	/// Sample count
	n: u64,

	/// Running sum
	sum: f64,

	/// Smallest sample so far
	min: f64,

	/// Largest sample so far
	max: f64,

	/// Running mean
	mean: f64,

	/// Sum of squared deviations from the running mean
	m2: f64,
}

impl OnlineStats {
	/// Creates empty statistics
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts a sample
	pub fn insert(&mut self, value: f64) {
		self.n += 1;
		self.sum += value;

		match self.n {
			1 => {
				self.min = value;
				self.max = value;
			},
			_ => {
				self.min = f64::min(self.min, value);
				self.max = f64::max(self.max, value);
			},
		}

		let delta = value - self.mean;
		self.mean += delta / self.n as f64;
		let delta2 = value - self.mean;
		self.m2 += delta * delta2;
	}

	/// Returns the sample count
	pub fn count(&self) -> u64 {
		self.n
	}

	/// Returns the sum of all samples
	pub fn sum(&self) -> f64 {
		self.sum
	}

	/// Returns the smallest sample, or `0` if empty
	pub fn min(&self) -> f64 {
		self.min
	}

	/// Returns the largest sample, or `0` if empty
	pub fn max(&self) -> f64 {
		self.max
	}

	/// Returns the mean
	pub fn mean(&self) -> f64 {
		self.mean
	}

	/// Returns the sample variance.
	///
	/// `0` for fewer than 2 samples.
	pub fn var(&self) -> f64 {
		match self.n {
			0 | 1 => 0.0,
			n => self.m2 / (n - 1) as f64,
		}
	}

	/// Returns the sample standard deviation
	pub fn sd(&self) -> f64 {
		self.var().sqrt()
	}
}

/// Batch statistics over a finished sample sequence
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
	/// Sample count
	count: u64,

	/// Sum
	sum: f64,

	/// Minimum
	min: f64,

	/// Maximum
	max: f64,

	/// Mean
	mean: f64,

	/// Sample variance
	var: f64,

	/// Sample standard deviation
	sd: f64,
}

impl Stats {
	/// Computes statistics over `samples`
	pub fn new(samples: impl IntoIterator<Item = f64>) -> Self {
		let mut online = OnlineStats::new();
		for sample in samples {
			online.insert(sample);
		}

		Self {
			count: online.count(),
			sum:   online.sum(),
			min:   online.min(),
			max:   online.max(),
			mean:  online.mean(),
			var:   online.var(),
			sd:    online.sd(),
		}
	}

	/// Returns the sample count
	pub fn count(&self) -> u64 {
		self.count
	}

	/// Returns the sum of all samples
	pub fn sum(&self) -> f64 {
		self.sum
	}

	/// Returns the smallest sample, or `0` if empty
	pub fn min(&self) -> f64 {
		self.min
	}

	/// Returns the largest sample, or `0` if empty
	pub fn max(&self) -> f64 {
		self.max
	}

	/// Returns the mean
	pub fn mean(&self) -> f64 {
		self.mean
	}

	/// Returns the sample variance
	pub fn var(&self) -> f64 {
		self.var
	}

	/// Returns the sample standard deviation
	pub fn sd(&self) -> f64 {
		self.sd
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn online_matches_batch() {
		let samples = [3.0, 1.5, 4.25, 1.0, 5.75, 9.0, 2.5, 6.0];

		let mut online = OnlineStats::new();
		for sample in samples {
			online.insert(sample);
		}
		let batch = Stats::new(samples);

		assert!((online.mean() - batch.mean()).abs() < 1e-9);
		assert!((online.sd() - batch.sd()).abs() < 1e-9);
		assert_eq!(online.count(), batch.count());
	}

	#[test]
	fn online_matches_average_crate() {
		let samples = [0.25, 7.5, 3.0, 3.0, 12.0, 0.5];

		let mut online = OnlineStats::new();
		for sample in samples {
			online.insert(sample);
		}
		let oracle = samples.into_iter().collect::<average::Variance>();

		assert!((online.mean() - oracle.mean()).abs() < 1e-9);
		assert!((online.var() - oracle.sample_variance()).abs() < 1e-9);
	}

	#[test]
	fn min_max_track_samples() {
		let mut online = OnlineStats::new();
		for sample in [5.0, 2.0, 8.0] {
			online.insert(sample);
		}

		assert_eq!(online.min(), 2.0);
		assert_eq!(online.max(), 8.0);
		assert_eq!(online.sum(), 15.0);
	}

	#[test]
	fn empty_is_zeroed() {
		let stats = Stats::new([]);
		assert_eq!(stats.count(), 0);
		assert_eq!(stats.mean(), 0.0);
		assert_eq!(stats.sd(), 0.0);
	}

	#[test]
	fn single_sample() {
		let stats = Stats::new([4.0]);
		assert_eq!(stats.mean(), 4.0);
		assert_eq!(stats.var(), 0.0);
		assert_eq!(stats.min(), 4.0);
		assert_eq!(stats.max(), 4.0);
	}
}
