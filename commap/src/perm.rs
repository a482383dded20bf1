//! Thread permutations
//!
//! A [`Permutation`] maps matrix positions to thread slots: `indices[pos]`
//! is the thread placed at position `pos`. Placements are built either from
//! a fixed scheme ([`PermutationKind`]) or from a graph partition, and
//! composed via [`Permutation::order`].

// Imports
use {
	anyhow::Context,
	rand::seq::SliceRandom,
	std::{fmt, fs, io, io::Write, path::Path},
};

/// Fixed permutation schemes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermutationKind {
	/// Identity: thread `i` at position `i`
	Compact,

	/// Bit-reversed interleave, spreading consecutive threads maximally far
	/// apart
	Balanced,

	/// Uniformly random placement
	Random,

	/// Computed elsewhere (e.g. from a partition)
	Other,
}

/// A thread-to-position permutation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Permutation {
	/// Thread at each position
	indices: Vec<usize>,

	/// Scheme this permutation was built from
	kind: PermutationKind,
}

impl Permutation {
	/// Creates a permutation of `n` threads following `kind`.
	///
	/// [`PermutationKind::Random`] draws from the thread rng; use
	/// [`Self::new_random_with`] for a seeded draw.
	pub fn new(n: usize, kind: PermutationKind) -> Self {
		match kind {
			PermutationKind::Compact | PermutationKind::Other => Self {
				indices: (0..n).collect(),
				kind,
			},
			PermutationKind::Balanced => {
				let mut indices = vec![0; n];
				for i in 0..n {
					// Interleave by peeling the low bits of `i` into the high
					// bits of the position, for every power-of-two factor
					let mut nleaf = n;
					let mut index = i;
					let mut offset = 0;
					while nleaf % 2 == 0 {
						nleaf /= 2;
						offset += index % 2 * nleaf;
						index /= 2;
					}
					indices[offset + index] = i;
				}
				Self {
					indices,
					kind: PermutationKind::Balanced,
				}
			},
			PermutationKind::Random => Self::new_random_with(n, &mut rand::thread_rng()),
		}
	}

	/// Creates a uniformly random permutation of `n` threads using `rng`
	pub fn new_random_with(n: usize, rng: &mut impl rand::Rng) -> Self {
		let mut indices = (0..n).collect::<Vec<_>>();
		indices.shuffle(rng);
		Self {
			indices,
			kind: PermutationKind::Random,
		}
	}

	/// Creates a permutation from explicit position-to-thread indices
	pub fn from_indices(indices: Vec<usize>, kind: PermutationKind) -> Self {
		Self { indices, kind }
	}

	/// Returns the thread at position `pos`
	pub fn get(&self, pos: usize) -> usize {
		self.indices[pos]
	}

	/// Returns the number of threads
	pub fn len(&self) -> usize {
		self.indices.len()
	}

	/// Returns if the permutation is empty
	pub fn is_empty(&self) -> bool {
		self.indices.is_empty()
	}

	/// Returns the position-to-thread indices
	pub fn as_slice(&self) -> &[usize] {
		&self.indices
	}

	/// Returns the scheme this permutation was built from
	pub fn kind(&self) -> PermutationKind {
		self.kind
	}

	/// Returns the inverse permutation: position of each thread.
	///
	/// Computed by stable argsort, so ties cannot occur for valid
	/// permutations and duplicated indices keep their relative order.
	pub fn order(&self) -> Self {
		if self.kind == PermutationKind::Compact {
			return self.clone();
		}

		let mut ord = (0..self.indices.len()).collect::<Vec<_>>();
		ord.sort_by_key(|&pos| self.indices[pos]);
		Self {
			indices: ord,
			kind:    PermutationKind::Compact,
		}
	}

	/// Returns the OS core id of each thread, in thread order.
	///
	/// Inverts first: the placement maps positions to threads, while an
	/// affinity list needs each thread's position, mapped through the
	/// topology's OS core ids.
	pub fn to_os_indices(&self, topology: &crate::topology::Topology) -> Vec<usize> {
		let inv = self.order();
		inv.indices.iter().map(|&pos| topology.os_index(pos)).collect()
	}

	/// Writes the permutation as a single space-separated line
	pub fn write_file(&self, path: &Path) -> Result<(), anyhow::Error> {
		let file = fs::File::create(path).with_context(|| format!("Unable to create {path:?}"))?;
		let mut writer = io::BufWriter::new(file);
		writeln!(writer, "{self}").with_context(|| format!("Unable to write permutation to {path:?}"))?;
		Ok(())
	}
}

impl fmt::Display for Permutation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut first = true;
		for index in &self.indices {
			match first {
				true => first = false,
				false => write!(f, " ")?,
			}
			write!(f, "{index}")?;
		}
		Ok(())
	}
}
