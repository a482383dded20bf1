//! Affinity matrices
//!
//! [`AffinityMatrix`] wraps a communication [`Matrix`] with the derived
//! scalar descriptors used to judge how much a placement change could help.
//! All descriptors are normalized to be higher the more opportunity there
//! is, and zero when communication is already diagonal/local.

// Imports
use {
	super::{Element, Matrix},
	crate::{stats::Stats, topology::Topology},
};

/// A communication matrix with derived statistics
#[derive(Clone, Debug)]
pub struct AffinityMatrix<T> {
	/// Underlying communication matrix
	mat: Matrix<T>,
}

/// Scalar descriptors of a communication matrix.
///
/// See [`AffinityMatrix::compute_stat`].
#[derive(Clone, Copy, Debug, Default)]
pub struct MatrixStat {
	/// Average, across rows, of the variance of off-diagonal entries
	pub heterogeneity: f64,

	/// `1 - mean/max` over off-diagonal communication
	pub balance: f64,

	/// Average fractional width of the smallest symmetric window around the
	/// diagonal capturing half of a row's communication
	pub centrality: f64,

	/// `1 - (communication with immediate neighbours) / total`
	pub neighbour_frac: f64,
}

impl<T: Element> AffinityMatrix<T> {
	/// Creates an affinity matrix over `mat`
	pub fn new(mat: Matrix<T>) -> Self {
		Self { mat }
	}

	/// Creates an affinity matrix over `mat` reindexed by `perm`
	pub fn with_order(mat: &Matrix<T>, perm: &crate::perm::Permutation) -> Self {
		Self { mat: mat.order(perm) }
	}

	/// Returns the underlying matrix
	pub fn as_matrix(&self) -> &Matrix<T> {
		&self.mat
	}

	/// Returns the underlying matrix mutably
	pub fn as_matrix_mut(&mut self) -> &mut Matrix<T> {
		&mut self.mat
	}

	/// Unwraps into the underlying matrix
	pub fn into_matrix(self) -> Matrix<T> {
		self.mat
	}

	/// Cell `(i, j)` as a floating value
	fn at(&self, i: usize, j: usize) -> f64 {
		self.mat.get(i, j).to_f64()
	}

	/// Mean communication per cell
	pub fn amount(&self) -> f64 {
		let n = self.mat.size();
		match n {
			0 => 0.0,
			_ => self.mat.sum() / (n * n) as f64,
		}
	}

	/// Total communication weighted by hop distance.
	///
	/// Uses the real topology's hop matrix when available, a synthetic
	/// binary-hypercube one otherwise.
	pub fn hopbyte(&self, topology: Option<&Topology>) -> f64 {
		let mut hops = match topology {
			Some(topology) => topology.hops::<T>(),
			None => self.mat.binary_hops(),
		};
		hops *= &self.mat;
		hops.sum()
	}

	/// Returns `(cluster count, cluster size)`.
	///
	/// NUMA boundaries when a topology is supplied, recursive halving down
	/// to clusters of more than 4 otherwise.
	pub fn n_cluster_size(&self, topology: Option<&Topology>) -> (usize, usize) {
		match topology {
			Some(topology) => (topology.n_clusters(), topology.cluster_size()),
			None => {
				let mut nclusters = 1;
				let mut cluster_size = self.mat.size();
				while cluster_size % 2 == 0 && cluster_size > 4 {
					cluster_size /= 2;
					nclusters *= 2;
				}
				(nclusters, cluster_size)
			},
		}
	}

	/// Standard deviation of total per-cluster communication
	pub fn cluster_sd(&self, topology: Option<&Topology>) -> f64 {
		let (nclusters, cluster_size) = self.n_cluster_size(topology);
		let n = self.mat.size();

		let mut cluster_sums = Vec::with_capacity(nclusters);
		for c in 0..nclusters {
			let begin = c * cluster_size;
			let end = usize::min((c + 1) * cluster_size, n);

			let mut aff = 0.0;
			for i in 0..n {
				for j in begin..end {
					aff += self.at(i, j);
					aff += self.at(j, i);
				}
			}
			cluster_sums.push(aff);
		}

		Stats::new(cluster_sums).sd()
	}

	/// Computes the scalar descriptors of this matrix
	pub fn compute_stat(&self) -> MatrixStat {
		let n = self.mat.size();
		if n < 2 {
			return MatrixStat::default();
		}

		let mut sum_var = 0.0;
		let mut sum_val = 0.0;
		let mut max = 0.0_f64;
		let mut r = 0.0;
		for i in 0..n {
			let mut sum_line = 0.0;
			let mut sum_sq = 0.0;
			for j in 0..n {
				let value = self.at(i, j);
				if i != j {
					sum_line += value;
					sum_sq += value * value;
				}
				max = f64::max(max, value);
			}
			sum_val += sum_line;

			// Line variance by König-Huygens
			let avg_line = sum_line / (n - 1) as f64;
			sum_var += sum_sq / (n - 1) as f64 - avg_line * avg_line;

			// Smallest symmetric window around the diagonal holding half of
			// the line's communication
			let mut j1 = i;
			let mut j2 = i;
			let mut sum = 0.0;
			while sum < sum_line / 2.0 {
				if j1 == 0 && j2 == n - 1 {
					break;
				}
				if j1 > 0 {
					j1 -= 1;
				}
				if j2 < n - 1 {
					j2 += 1;
				}
				sum += self.at(i, j1) + self.at(i, j2);
			}
			r += (j2 - j1) as f64 / n as f64;
		}

		let avg_val = sum_val / (n * n - n) as f64;
		MatrixStat {
			heterogeneity:  sum_var / n as f64,
			balance:        match max > 0.0 {
				true => 1.0 - avg_val / max,
				false => 0.0,
			},
			centrality:     r / n as f64,
			neighbour_frac: self.neighbour_com_frac(sum_val),
		}
	}

	/// Fraction of communication not involving immediate neighbours
	fn neighbour_com_frac(&self, sum_val: f64) -> f64 {
		if sum_val <= 0.0 {
			return 0.0;
		}

		let n = self.mat.size();
		let mut neighbour_sum = 0.0;
		for i in 0..n {
			if i >= 2 {
				neighbour_sum += self.at(i, i - 1);
			}
			if i + 1 < n - 1 {
				neighbour_sum += self.at(i, i + 1);
			}
		}

		1.0 - neighbour_sum / sum_val
	}

	/// Fraction of communication falling outside `split`x`split` blocks
	/// centered on the diagonal
	pub fn compute_split_frac(&self, split: usize) -> f64 {
		let n = self.mat.size();
		if split == 0 || split >= n {
			return 0.0;
		}
		let sum_val = self.mat.sum();
		if sum_val <= 0.0 {
			return 0.0;
		}

		let mut sum_inside = 0.0;
		for s in (0..n).step_by(split) {
			for l in 0..split {
				for k in 0..split {
					let i = s + l;
					let j = s + k;
					if i < n && j < n {
						sum_inside += self.at(i, j);
					}
				}
			}
		}

		1.0 - sum_inside / sum_val
	}
}

impl<T: Element> From<Matrix<T>> for AffinityMatrix<T> {
	fn from(mat: Matrix<T>) -> Self {
		Self::new(mat)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	/// `n`x`n` matrix with `value` everywhere off the diagonal
	fn uniform(n: usize, value: f64) -> AffinityMatrix<f64> {
		let mut mat = Matrix::new(n);
		for i in 0..n {
			for j in 0..n {
				if i != j {
					*mat.get_mut(i, j) = value;
				}
			}
		}
		AffinityMatrix::new(mat)
	}

	#[test]
	fn amount_is_mean_per_cell() {
		let aff = uniform(4, 1.0);
		assert!((aff.amount() - 12.0 / 16.0).abs() < 1e-12);
	}

	#[test]
	fn uniform_matrix_has_no_heterogeneity_or_imbalance() {
		let stat = uniform(4, 1.0).compute_stat();
		assert!(stat.heterogeneity.abs() < 1e-12);
		assert!(stat.balance.abs() < 1e-12);
		assert!((stat.neighbour_frac - 2.0 / 3.0).abs() < 1e-12);
	}

	#[test]
	fn empty_and_trivial_stats_are_zero() {
		let stat = uniform(1, 0.0).compute_stat();
		assert_eq!(stat.heterogeneity, 0.0);
		assert_eq!(stat.centrality, 0.0);

		// All-zero rows must not spin in the window search
		let stat = uniform(4, 0.0).compute_stat();
		assert_eq!(stat.centrality, 0.0);
	}

	#[test]
	fn split_frac_counts_off_block_communication() {
		let aff = uniform(4, 1.0);
		// 2x2 diagonal blocks hold 4 of the 12 units
		assert!((aff.compute_split_frac(2) - 2.0 / 3.0).abs() < 1e-12);
		assert_eq!(aff.compute_split_frac(4), 0.0);
		assert_eq!(aff.compute_split_frac(0), 0.0);
	}

	#[test]
	fn cluster_sd_is_zero_for_uniform() {
		let aff = uniform(8, 1.0);
		assert!(aff.cluster_sd(None).abs() < 1e-9);
	}

	#[test]
	fn hopbyte_weights_by_distance() {
		let aff = uniform(2, 1.0);
		// Two threads, 4 hops each way
		assert!((aff.hopbyte(None) - 8.0).abs() < 1e-12);
	}
}
