//! Machine topology
//!
//! A tree description of the target machine, as per-level arities from the
//! root down to the cores. Hop distances assume one hop per tree edge, so
//! two cores under the same parent are 2 hops apart.

// Imports
use {
	crate::matrix::{Element, Matrix},
	serde::{Deserialize, Serialize},
};

/// Machine topology tree
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Topology {
	/// Children per node at each level, root first
	pub arities: Vec<usize>,

	/// Depth of the NUMA boundary, in levels below the root
	#[serde(default = "Topology::default_numa_level")]
	pub numa_level: usize,

	/// OS core id of each leaf, in leaf order.
	///
	/// Leaves map to their own index when absent.
	#[serde(default)]
	pub os_indices: Option<Vec<usize>>,
}

impl Topology {
	fn default_numa_level() -> usize {
		1
	}

	/// Returns the number of leaves (cores)
	pub fn n_leaves(&self) -> usize {
		self.arities.iter().product()
	}

	/// Returns the number of NUMA clusters
	pub fn n_clusters(&self) -> usize {
		self.arities.iter().take(self.numa_level).product()
	}

	/// Returns the number of cores per NUMA cluster
	pub fn cluster_size(&self) -> usize {
		let nclusters = self.n_clusters();
		match nclusters {
			0 => 0,
			_ => self.n_leaves() / nclusters,
		}
	}

	/// Returns the OS core id of `leaf`
	pub fn os_index(&self, leaf: usize) -> usize {
		match &self.os_indices {
			Some(indices) if leaf < indices.len() => indices[leaf],
			_ => leaf,
		}
	}

	/// Mixed-radix digits of `leaf`, root level first
	fn digits(&self, mut leaf: usize) -> Vec<usize> {
		let mut digits = vec![0; self.arities.len()];
		for (digit, &arity) in digits.iter_mut().zip(&self.arities).rev() {
			*digit = leaf % arity;
			leaf /= arity;
		}
		digits
	}

	/// Computes the leaf-to-leaf hop distance matrix.
	///
	/// Two leaves are `2 * levels` apart, where `levels` is the distance to
	/// their deepest common ancestor.
	pub fn hops<T: Element>(&self) -> Matrix<T> {
		let n = self.n_leaves();
		let depth = self.arities.len();
		let mut hops = Matrix::new(n);

		for i in 0..n {
			let digits_i = self.digits(i);
			for j in 0..n {
				if i == j {
					continue;
				}
				let digits_j = self.digits(j);
				let common = digits_i.iter().zip(&digits_j).take_while(|(a, b)| a == b).count();
				*hops.get_mut(i, j) = T::from_usize(2 * (depth - common));
			}
		}

		hops
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	/// 2 sockets of 2 cores
	fn two_by_two() -> Topology {
		Topology {
			arities:    vec![2, 2],
			numa_level: 1,
			os_indices: None,
		}
	}

	#[test]
	fn leaf_and_cluster_counts() {
		let topo = two_by_two();
		assert_eq!(topo.n_leaves(), 4);
		assert_eq!(topo.n_clusters(), 2);
		assert_eq!(topo.cluster_size(), 2);
	}

	#[test]
	fn hop_distances() {
		let hops = two_by_two().hops::<u64>();
		assert_eq!(hops.get(0, 0), 0);
		assert_eq!(hops.get(0, 1), 2);
		assert_eq!(hops.get(1, 0), 2);
		assert_eq!(hops.get(0, 2), 4);
		assert_eq!(hops.get(1, 3), 4);
	}

	#[test]
	fn os_indices_fall_back_to_identity() {
		let mut topo = two_by_two();
		assert_eq!(topo.os_index(3), 3);

		topo.os_indices = Some(vec![0, 2, 1, 3]);
		assert_eq!(topo.os_index(1), 2);
	}

	#[test]
	fn parses_from_json() {
		let topo = serde_json::from_str::<Topology>(r#"{ "arities": [2, 4] }"#).expect("Unable to parse");
		assert_eq!(topo.n_leaves(), 8);
		assert_eq!(topo.numa_level, 1);
		assert_eq!(topo.n_clusters(), 2);
	}
}
