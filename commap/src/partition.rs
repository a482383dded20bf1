//! Graph partitioning placement
//!
//! Turns a communication matrix into an undirected weighted graph and
//! derives a thread placement by recursive bisection: threads that
//! communicate heavily end up in the same partition, and partitions are laid
//! out contiguously so they map onto NUMA clusters.

// Imports
use {
	crate::{
		matrix::{Element, Matrix},
		perm::{Permutation, PermutationKind},
		topology::Topology,
	},
	std::path::Path,
};

/// Undirected weighted graph in compressed sparse rows
#[derive(Clone, Debug)]
pub struct MappingGraph {
	/// Number of vertices
	vertnbr: usize,

	/// Per-vertex edge offsets into `edgetab` (`vertnbr + 1` entries)
	verttab: Vec<usize>,

	/// Edge targets, ascending within each row
	edgetab: Vec<usize>,

	/// Edge weights, parallel to `edgetab`
	edlotab: Vec<u64>,
}

impl MappingGraph {
	/// Builds the placement graph of a communication matrix.
	///
	/// The matrix is normalized first (column and row minima removed, the
	/// diagonal blanked, values rescaled to `[0, 100]`), then symmetrized:
	/// the edge weight between `i` and `j` is the sum of both directions.
	pub fn from_matrix<T: Element>(mat: &Matrix<T>) -> Self {
		let mut mat = mat.to_f64();
		mat.coldownscale();
		mat.rowdownscale();
		mat.blankdiag();
		mat.scale(100.0);

		let n = mat.size();
		let mut verttab = Vec::with_capacity(n + 1);
		let mut edgetab = Vec::new();
		let mut edlotab = Vec::new();

		verttab.push(0);
		for i in 0..n {
			for j in 0..n {
				if i == j {
					continue;
				}
				let weight = (mat.get(i, j) + mat.get(j, i)).round() as u64;
				if weight > 0 {
					edgetab.push(j);
					edlotab.push(weight);
				}
			}
			verttab.push(edgetab.len());
		}

		Self {
			vertnbr: n,
			verttab,
			edgetab,
			edlotab,
		}
	}

	/// Builds the placement graph from a matrix file
	pub fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
		let mat = Matrix::<f64>::from_file(path)?;
		Ok(Self::from_matrix(&mat))
	}

	/// Returns the number of vertices
	pub fn vertnbr(&self) -> usize {
		self.vertnbr
	}

	/// Weight of the edge between `u` and `v`, `0` if absent
	fn edge_weight(&self, u: usize, v: usize) -> u64 {
		let row = &self.edgetab[self.verttab[u]..self.verttab[u + 1]];
		match row.binary_search(&v) {
			Ok(pos) => self.edlotab[self.verttab[u] + pos],
			Err(_) => 0,
		}
	}

	/// Partitions the graph into contiguous groups and returns the resulting
	/// placement.
	///
	/// The partition count is the largest power of two that both divides the
	/// vertex count and keeps twice the count below `max_partitions`. A
	/// count of one yields the identity placement.
	pub fn partition(&self, max_partitions: usize) -> Permutation {
		let n = self.vertnbr;
		let mut partnbr = 1;
		let mut group = n;
		let mut levels = 0;
		while group > 1 && group % 2 == 0 && partnbr * 2 < max_partitions {
			group /= 2;
			partnbr *= 2;
			levels += 1;
		}

		if partnbr == 1 {
			if n % 2 != 0 && max_partitions > 2 {
				tracing::debug!(vertices = n, "Vertex count not halvable, keeping identity placement");
			}
			return Permutation::new(n, PermutationKind::Compact);
		}

		let mut parts = vec![0; n];
		self.assign((0..n).collect(), 0, levels, &mut parts);
		Self::partition_order(&parts, partnbr)
	}

	/// Recursively bisects `verts`, assigning the final part of each vertex
	fn assign(&self, verts: Vec<usize>, part: usize, levels: usize, parts: &mut [usize]) {
		if levels == 0 {
			for v in verts {
				parts[v] = part;
			}
			return;
		}

		let (lhs, rhs) = self.bisect(verts);
		self.assign(lhs, 2 * part, levels - 1, parts);
		self.assign(rhs, 2 * part + 1, levels - 1, parts);
	}

	/// Splits `verts` into equal halves minimizing the cut weight.
	///
	/// Starts from the trivial half/half split and greedily applies the
	/// best-gain pairwise swap until no swap improves the cut, with the swap
	/// gain `D(a) + D(b) - 2 w(a, b)` where `D(v)` is external minus
	/// internal edge weight of `v` within `verts`.
	fn bisect(&self, verts: Vec<usize>) -> (Vec<usize>, Vec<usize>) {
		let half = verts.len() / 2;
		let mut in_rhs = vec![false; verts.len()];
		for side in in_rhs.iter_mut().skip(half) {
			*side = true;
		}

		let mut passes = 0;
		loop {
			passes += 1;

			// Diff values over the current split
			let d = (0..verts.len())
				.map(|a| {
					(0..verts.len())
						.filter(|&b| b != a)
						.map(|b| {
							let w = self.edge_weight(verts[a], verts[b]) as i64;
							match in_rhs[a] == in_rhs[b] {
								true => -w,
								false => w,
							}
						})
						.sum::<i64>()
				})
				.collect::<Vec<_>>();

			let mut best: Option<(usize, usize, i64)> = None;
			for a in 0..verts.len() {
				for b in 0..verts.len() {
					if !in_rhs[a] && in_rhs[b] {
						let gain = d[a] + d[b] - 2 * self.edge_weight(verts[a], verts[b]) as i64;
						if gain > 0 && best.map_or(true, |(_, _, best_gain)| gain > best_gain) {
							best = Some((a, b, gain));
						}
					}
				}
			}

			match best {
				Some((a, b, _)) if passes <= verts.len() => {
					in_rhs[a] = true;
					in_rhs[b] = false;
				},
				_ => break,
			}
		}

		let lhs = (0..verts.len()).filter(|&a| !in_rhs[a]).map(|a| verts[a]).collect();
		let rhs = (0..verts.len()).filter(|&a| in_rhs[a]).map(|a| verts[a]).collect();
		(lhs, rhs)
	}

	/// Builds the placement laying each part's vertices out contiguously, in
	/// part order
	fn partition_order(parts: &[usize], partnbr: usize) -> Permutation {
		let mut indices = Vec::with_capacity(parts.len());
		for part in 0..partnbr {
			indices.extend((0..parts.len()).filter(|&v| parts[v] == part));
		}
		Permutation::from_indices(indices, PermutationKind::Other)
	}

	/// Derives a placement matching `topology`'s NUMA clusters.
	///
	/// Falls back to the identity placement when the cluster count is not a
	/// power of two.
	pub fn map(&self, topology: &Topology) -> Permutation {
		let nclusters = topology.n_clusters();
		if nclusters == 0 || !nclusters.is_power_of_two() {
			tracing::warn!(nclusters, "Cluster count not a power of two, keeping identity placement");
			return Permutation::new(self.vertnbr, PermutationKind::Compact);
		}

		self.partition(2 * nclusters)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	/// 4 threads, heavy communication within `{0, 2}` and `{1, 3}`
	fn paired_matrix() -> Matrix<u64> {
		let mut mat = Matrix::new(4);
		*mat.get_mut(0, 2) = 10;
		*mat.get_mut(2, 0) = 10;
		*mat.get_mut(1, 3) = 10;
		*mat.get_mut(3, 1) = 10;
		mat
	}

	#[test]
	fn single_partition_is_identity() {
		let graph = MappingGraph::from_matrix(&paired_matrix());
		let perm = graph.partition(1);
		assert_eq!(perm.kind(), PermutationKind::Compact);
		assert_eq!(perm.as_slice(), &[0, 1, 2, 3]);
	}

	#[test]
	fn bisection_groups_communicating_pairs() {
		let graph = MappingGraph::from_matrix(&paired_matrix());
		let perm = graph.partition(4);
		assert_eq!(perm.len(), 4);

		// Each half of the placement holds one communicating pair
		let first = [perm.get(0), perm.get(1)];
		assert!(first == [0, 2] || first == [2, 0] || first == [1, 3] || first == [3, 1]);
	}

	#[test]
	fn odd_vertex_count_keeps_identity() {
		let graph = MappingGraph::from_matrix(&Matrix::<u64>::new(5));
		let perm = graph.partition(8);
		assert_eq!(perm.as_slice(), &[0, 1, 2, 3, 4]);
	}

	#[test]
	fn map_follows_cluster_count() {
		let topology = Topology {
			arities:    vec![2, 2],
			numa_level: 1,
			os_indices: None,
		};
		let graph = MappingGraph::from_matrix(&paired_matrix());
		let perm = graph.map(&topology);

		let first = [perm.get(0), perm.get(1)];
		assert!(first == [0, 2] || first == [2, 0] || first == [1, 3] || first == [3, 1]);
	}

	#[test]
	fn edge_weights_symmetrize_both_directions() {
		let mut mat = Matrix::<u64>::new(2);
		*mat.get_mut(0, 1) = 3;
		*mat.get_mut(1, 0) = 1;

		let graph = MappingGraph::from_matrix(&mat);
		assert_eq!(graph.edge_weight(0, 1), graph.edge_weight(1, 0));
	}
}
