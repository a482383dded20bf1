//! Dense square matrices
//!
//! [`Matrix`] is the numeric container behind every accumulator in the
//! crate: communication tallies, sharing counts, hop distances. It grows on
//! mutable access, never on read, and over-allocates by doubling so growth
//! preserves existing cells cheaply.

// Modules
pub mod affinity;

// Exports
pub use affinity::AffinityMatrix;

// Imports
use {
	crate::perm::Permutation,
	anyhow::Context,
	itertools::Itertools,
	std::{cmp, fmt, fs, io, ops, path::Path},
};

/// Numeric capability required of matrix cells
pub trait Element:
	Copy
	+ Default
	+ PartialOrd
	+ fmt::Display
	+ fmt::Debug
	+ ops::Add<Output = Self>
	+ ops::AddAssign
	+ ops::Sub<Output = Self>
	+ ops::SubAssign
	+ ops::Mul<Output = Self>
	+ ops::MulAssign
	+ ops::Div<Output = Self>
{
	/// Additive identity
	const ZERO: Self;

	/// Converts to a floating value
	fn to_f64(self) -> f64;

	/// Converts from a (small) index-like value
	fn from_usize(value: usize) -> Self;

	/// Parses a cell from its text form
	fn parse(s: &str) -> Result<Self, anyhow::Error>;
}

/// Implements [`Element`] for a primitive numeric type
macro_rules! impl_element {
	($($ty:ty),* $(,)?) => {$(
		impl Element for $ty {
			const ZERO: Self = 0 as $ty;

			fn to_f64(self) -> f64 {
				self as f64
			}

			fn from_usize(value: usize) -> Self {
				value as $ty
			}

			fn parse(s: &str) -> Result<Self, anyhow::Error> {
				s.parse::<$ty>()
					.with_context(|| format!("Unable to parse matrix cell {s:?}"))
			}
		}
	)*};
}

impl_element! { u32, u64, usize, i64, f64 }

/// Minimum allocated side length
const DEF_CAP: usize = 64;

/// Dense square matrix with doubling over-allocation
#[derive(Clone, Debug)]
pub struct Matrix<T> {
	/// Logical side length
	n: usize,

	/// Allocated side length (`n <= cap`)
	cap: usize,

	/// Cell storage, row-major over `cap`
	vals: Vec<T>,
}

impl<T: Element> Matrix<T> {
	/// Creates a zeroed `n`x`n` matrix
	pub fn new(n: usize) -> Self {
		let mut this = Self {
			n:    0,
			cap:  0,
			vals: Vec::new(),
		};
		this.reserve(usize::max(n, DEF_CAP));
		this.n = n;
		this
	}

	/// Returns the logical side length
	pub fn size(&self) -> usize {
		self.n
	}

	/// Returns if the matrix is logically empty
	pub fn is_empty(&self) -> bool {
		self.n == 0
	}

	/// Grows the allocation to at least `cap`x`cap`, preserving all cells
	fn reserve(&mut self, cap: usize) {
		if cap <= self.cap {
			return;
		}

		let mut vals = vec![T::ZERO; cap * cap];
		for i in 0..self.n {
			for j in 0..self.n {
				vals[i * cap + j] = self.vals[i * self.cap + j];
			}
		}
		self.vals = vals;
		self.cap = cap;
	}

	/// Grows the logical size to `n`x`n`, zero-filling new cells.
	///
	/// Never shrinks.
	pub fn resize(&mut self, n: usize) {
		if n < self.n {
			return;
		}
		if n > self.cap {
			self.reserve(2 * n);
		}
		self.n = n;
	}

	/// Returns cell `(i, j)`, clamping out-of-bounds indices to the last
	/// row/column. Never allocates; `ZERO` if empty.
	pub fn get(&self, i: usize, j: usize) -> T {
		if self.n == 0 {
			return T::ZERO;
		}
		let i = i.min(self.n - 1);
		let j = j.min(self.n - 1);
		self.vals[i * self.cap + j]
	}

	/// Returns cell `(i, j)` mutably, growing the matrix to contain it
	pub fn get_mut(&mut self, i: usize, j: usize) -> &mut T {
		let size = usize::max(i, j) + 1;
		if size > self.n {
			self.resize(size);
		}
		&mut self.vals[i * self.cap + j]
	}

	/// Sets every cell to `value`
	pub fn set(&mut self, value: T) {
		for i in 0..self.n {
			for j in 0..self.n {
				self.vals[i * self.cap + j] = value;
			}
		}
	}

	/// Iterates over all cells, row-major
	pub fn cells(&self) -> impl Iterator<Item = T> + '_ {
		(0..self.n).flat_map(move |i| self.vals[i * self.cap..i * self.cap + self.n].iter().copied())
	}

	/// Returns `(min, max)` over all cells, or `None` if empty
	pub fn limits(&self) -> Option<(T, T)> {
		self.cells()
			.minmax_by(|a, b| a.partial_cmp(b).unwrap_or(cmp::Ordering::Equal))
			.into_option()
	}

	/// Returns the sum of all cells as a floating value
	pub fn sum(&self) -> f64 {
		self.cells().map(T::to_f64).sum()
	}

	/// Converts all cells to floating values
	pub fn to_f64(&self) -> Matrix<f64> {
		let mut ret = Matrix::new(self.n);
		for i in 0..self.n {
			for j in 0..self.n {
				*ret.get_mut(i, j) = self.get(i, j).to_f64();
			}
		}
		ret
	}

	/// Returns this matrix reindexed by `perm` on both axes
	pub fn order(&self, perm: &Permutation) -> Self {
		let mut ret = Self::new(self.n);
		for i in 0..self.n {
			for j in 0..self.n {
				*ret.get_mut(i, j) = self.get(perm.get(i), perm.get(j));
			}
		}
		ret
	}

	/// Rescales all cells linearly into `[0, max_val]`.
	///
	/// No-op when all cells are equal.
	pub fn scale(&mut self, max_val: T) {
		let Some((min, max)) = self.limits() else { return };
		let span = max - min;
		if !(span > T::ZERO) {
			return;
		}

		for i in 0..self.n {
			for j in 0..self.n {
				let cell = &mut self.vals[i * self.cap + j];
				*cell = (*cell - min) * max_val / span;
			}
		}
	}

	/// Subtracts each row's minimum from that row
	pub fn rowdownscale(&mut self) {
		for i in 0..self.n {
			let Some(min) = self.vals[i * self.cap..i * self.cap + self.n]
				.iter()
				.copied()
				.min_by(|a, b| a.partial_cmp(b).unwrap_or(cmp::Ordering::Equal))
			else {
				continue;
			};
			for j in 0..self.n {
				self.vals[i * self.cap + j] -= min;
			}
		}
	}

	/// Subtracts each column's minimum from that column
	pub fn coldownscale(&mut self) {
		for j in 0..self.n {
			let Some(min) = (0..self.n)
				.map(|i| self.vals[i * self.cap + j])
				.min_by(|a, b| a.partial_cmp(b).unwrap_or(cmp::Ordering::Equal))
			else {
				continue;
			};
			for i in 0..self.n {
				self.vals[i * self.cap + j] -= min;
			}
		}
	}

	/// Zeroes the diagonal
	pub fn blankdiag(&mut self) {
		for i in 0..self.n {
			self.vals[i * self.cap + i] = T::ZERO;
		}
	}

	/// Derives a synthetic hop-distance matrix assuming a recursively
	/// bisected interconnect: all distinct pairs start at 2 hops, and each
	/// power-of-two fold of the index space adds a hop for pairs split by it.
	pub fn binary_hops(&self) -> Self {
		let n = self.n;
		let mut hops = Self::new(n);
		for i in 0..n {
			for j in 0..n {
				if i != j {
					*hops.get_mut(i, j) = T::from_usize(2);
				}
			}
		}

		let mut block = n;
		while block % 2 == 0 && block > 1 {
			block /= 2;
			for i in 0..n {
				for p in (0..n).step_by(block) {
					// Skip the block `i` itself falls in
					if p == i - i % block {
						continue;
					}
					for j in p..p + block {
						*hops.get_mut(i, j) += T::from_usize(1);
						*hops.get_mut(j, i) += T::from_usize(1);
					}
				}
			}
		}

		hops
	}

	/// Writes the matrix in its adjacency-list text format
	pub fn write_to(&self, writer: &mut impl io::Write) -> Result<(), anyhow::Error> {
		writeln!(writer, "0").context("Unable to write version line")?;
		writeln!(writer, "{} {}", self.n, self.n * self.n).context("Unable to write size line")?;
		writeln!(writer, "0 010").context("Unable to write base line")?;

		for i in 0..self.n {
			write!(writer, "{}", self.n).context("Unable to write row arity")?;
			for j in 0..self.n {
				write!(writer, " {} {j}", self.get(i, j)).context("Unable to write cell")?;
			}
			writeln!(writer).context("Unable to finish row")?;
		}

		Ok(())
	}

	/// Writes the matrix to a file
	pub fn write_file(&self, path: &Path) -> Result<(), anyhow::Error> {
		let file = fs::File::create(path).with_context(|| format!("Unable to create {path:?}"))?;
		let mut writer = io::BufWriter::new(file);
		self.write_to(&mut writer)
			.with_context(|| format!("Unable to write matrix to {path:?}"))?;
		tracing::debug!(?path, "Dumped matrix");
		Ok(())
	}

	/// Parses a matrix from its adjacency-list text format
	pub fn from_reader(reader: impl io::BufRead) -> Result<Self, anyhow::Error> {
		let mut lines = reader.lines();

		// Version line, then `<n> <n*n>`, then the base-value line
		let _ = next_line(&mut lines).context("Unable to read version line")?;
		let size_line = next_line(&mut lines).context("Unable to read size line")?;
		let n = size_line
			.split_whitespace()
			.next()
			.context("Missing size field")?
			.parse::<usize>()
			.context("Unable to parse size field")?;
		let _ = next_line(&mut lines).context("Unable to read base line")?;

		let mut mat = Self::new(n);
		for i in 0..n {
			let row = next_line(&mut lines).with_context(|| format!("Unable to read row {i}"))?;
			let mut fields = row.split_whitespace();
			let arity = fields
				.next()
				.context("Missing row arity")?
				.parse::<usize>()
				.context("Unable to parse row arity")?;

			for _ in 0..arity {
				let value = T::parse(fields.next().context("Missing cell value")?)?;
				let j = fields
					.next()
					.context("Missing cell column")?
					.parse::<usize>()
					.context("Unable to parse cell column")?;
				*mat.get_mut(i, j) = value;
			}
		}

		Ok(mat)
	}

	/// Parses a matrix from a file
	pub fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
		let file = fs::File::open(path).with_context(|| format!("Unable to open {path:?}"))?;
		Self::from_reader(io::BufReader::new(file)).with_context(|| format!("Unable to parse matrix from {path:?}"))
	}
}

/// Reads the next line of `lines`
fn next_line(lines: &mut impl Iterator<Item = io::Result<String>>) -> Result<String, anyhow::Error> {
	lines
		.next()
		.context("Unexpected end of file")?
		.context("Unable to read line")
}

impl<T: Element> ops::AddAssign<&Matrix<T>> for Matrix<T> {
	/// Adds `rhs` elementwise over the overlapping region
	fn add_assign(&mut self, rhs: &Matrix<T>) {
		let n = usize::min(self.n, rhs.n);
		for i in 0..n {
			for j in 0..n {
				self.vals[i * self.cap + j] += rhs.get(i, j);
			}
		}
	}
}

impl<T: Element> ops::MulAssign<&Matrix<T>> for Matrix<T> {
	/// Multiplies by `rhs` elementwise over the overlapping region
	fn mul_assign(&mut self, rhs: &Matrix<T>) {
		let n = usize::min(self.n, rhs.n);
		for i in 0..n {
			for j in 0..n {
				self.vals[i * self.cap + j] *= rhs.get(i, j);
			}
		}
	}
}

impl<T: Element> PartialEq for Matrix<T> {
	fn eq(&self, other: &Self) -> bool {
		self.n == other.n && self.cells().zip(other.cells()).all(|(a, b)| a == b)
	}
}

#[cfg(test)]
mod tests {
	use {super::*, crate::perm::PermutationKind};

	#[test]
	fn growth_preserves_cells() {
		let mut mat = Matrix::<u64>::new(4);
		for i in 0..4 {
			for j in 0..4 {
				*mat.get_mut(i, j) = (10 * i + j) as u64;
			}
		}

		*mat.get_mut(8, 8) = 99;
		assert_eq!(mat.size(), 9);
		for i in 0..4 {
			for j in 0..4 {
				assert_eq!(mat.get(i, j), (10 * i + j) as u64);
			}
		}
		assert_eq!(mat.get(5, 5), 0);
	}

	#[test]
	fn read_access_never_grows() {
		let mat = Matrix::<u64>::new(2);
		assert_eq!(mat.get(100, 100), 0);
		assert_eq!(mat.size(), 2);
	}

	#[test]
	fn add_over_overlap() {
		let mut lhs = Matrix::<u64>::new(3);
		let mut rhs = Matrix::<u64>::new(2);
		*lhs.get_mut(2, 2) = 7;
		*rhs.get_mut(0, 1) = 3;
		*rhs.get_mut(1, 1) = 5;

		lhs += &rhs;
		assert_eq!(lhs.get(0, 1), 3);
		assert_eq!(lhs.get(1, 1), 5);
		assert_eq!(lhs.get(2, 2), 7);
		assert_eq!(lhs.size(), 3);
	}

	#[test]
	fn order_reindexes_both_axes() {
		let mut mat = Matrix::<u64>::new(2);
		*mat.get_mut(0, 0) = 1;
		*mat.get_mut(0, 1) = 2;
		*mat.get_mut(1, 0) = 3;
		*mat.get_mut(1, 1) = 4;

		let swap = Permutation::from_indices(vec![1, 0], PermutationKind::Other);
		let ordered = mat.order(&swap);
		assert_eq!(ordered.get(0, 0), 4);
		assert_eq!(ordered.get(0, 1), 3);
		assert_eq!(ordered.get(1, 0), 2);
		assert_eq!(ordered.get(1, 1), 1);
	}

	#[test]
	fn binary_hops_for_four() {
		let mat = Matrix::<u64>::new(4);
		let hops = mat.binary_hops();

		// Same half of the fold: one extra fold crossing. Other half: two.
		assert_eq!(hops.get(0, 0), 0);
		assert_eq!(hops.get(0, 1), 4);
		assert_eq!(hops.get(2, 3), 4);
		assert_eq!(hops.get(0, 2), 6);
		assert_eq!(hops.get(0, 3), 6);
		assert_eq!(hops.get(3, 0), 6);
	}

	#[test]
	fn normalization_pipeline() {
		let mut mat = Matrix::<i64>::new(2);
		*mat.get_mut(0, 0) = 10;
		*mat.get_mut(0, 1) = 14;
		*mat.get_mut(1, 0) = 12;
		*mat.get_mut(1, 1) = 10;

		mat.coldownscale();
		assert_eq!(mat.get(0, 0), 0);
		assert_eq!(mat.get(1, 0), 2);
		assert_eq!(mat.get(0, 1), 4);

		mat.blankdiag();
		assert_eq!(mat.get(0, 0), 0);

		mat.scale(100);
		let (min, max) = mat.limits().expect("Non-empty");
		assert_eq!(min, 0);
		assert_eq!(max, 100);
	}

	#[test]
	fn text_format_roundtrip() {
		let mut mat = Matrix::<u64>::new(3);
		*mat.get_mut(0, 1) = 5;
		*mat.get_mut(2, 0) = 9;

		let mut buf = Vec::new();
		mat.write_to(&mut buf).expect("Unable to write");

		let text = String::from_utf8(buf.clone()).expect("Invalid utf-8");
		assert!(text.starts_with("0\n3 9\n0 010\n"));

		let parsed = Matrix::<u64>::from_reader(io::Cursor::new(buf)).expect("Unable to parse");
		assert_eq!(parsed, mat);
	}
}
