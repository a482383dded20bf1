//! Cacheline-granularity access simulation
//!
//! The page table answers "who produced the value at this address" for every
//! read, and counts per-thread touches per cacheline. Ownership is a
//! two-field state machine per line: an `owner` slot and a monotonically
//! increasing `version` acting as a logical clock. Writers release-publish a
//! new owner/version pair; readers acquire-load the version and compare it
//! against the last version they observed on that line.

// Imports
use {
	crate::{
		matrix::Matrix,
		stats::{OnlineStats, Stats},
	},
	std::sync::{
		atomic::{AtomicU64, AtomicUsize, Ordering},
		PoisonError, RwLock,
	},
};

/// Page size exponent (4 KiB pages)
pub const PAGE_BITS: u32 = 12;

/// Cacheline size exponent (64 B lines)
pub const LINE_BITS: u32 = 6;

/// Cachelines per page
pub const LINES_PER_PAGE: usize = 1 << (PAGE_BITS - LINE_BITS);

/// Bounds of the tracked simulation
#[derive(Clone, Copy, Debug)]
pub struct TrackerConfig {
	/// Maximum number of thread slots
	pub max_threads: usize,

	/// Tracked virtual-address-space size, as an exponent.
	///
	/// Addresses beyond `2^mem_bits` alias by page mask rather than being
	/// dropped.
	pub mem_bits: u32,
}

impl Default for TrackerConfig {
	fn default() -> Self {
		Self {
			max_threads: 64,
			mem_bits:    30,
		}
	}
}

/// Per-cacheline state
#[derive(Debug)]
pub struct Cacheline {
	/// Slot of the last writer
	owner: AtomicUsize,

	/// Logical clock, bumped on every write
	version: AtomicU64,

	/// Last version each slot observed
	snapshots: Box<[AtomicU64]>,

	/// Read touches per slot
	reads: Box<[AtomicU64]>,

	/// Write touches per slot
	writes: Box<[AtomicU64]>,
}

impl Cacheline {
	/// Creates a fresh cacheline for `max_threads` slots
	fn new(max_threads: usize) -> Self {
		Self {
			owner:     AtomicUsize::new(0),
			version:   AtomicU64::new(0),
			snapshots: (0..max_threads).map(|_| AtomicU64::new(0)).collect(),
			reads:     (0..max_threads).map(|_| AtomicU64::new(0)).collect(),
			writes:    (0..max_threads).map(|_| AtomicU64::new(0)).collect(),
		}
	}

	/// Registers a write by `slot` and returns the previous owner.
	///
	/// The snapshot keeps the pre-bump version, so the writer's own next
	/// read resolves through the owner field, back to itself.
	pub fn write(&self, slot: usize) -> usize {
		let prev = self.owner.swap(slot, Ordering::AcqRel);
		let version = self.version.fetch_add(1, Ordering::AcqRel);
		self.snapshots[slot].store(version, Ordering::Release);
		self.writes[slot].fetch_add(1, Ordering::Relaxed);
		prev
	}

	/// Registers a read by `slot` and returns the slot that produced the
	/// current value.
	///
	/// If the line's version matches the reader's last-observed version, no
	/// one wrote since the reader last looked and the reader is credited
	/// itself; otherwise the current owner produced the data. A fresh line
	/// (version 0, all snapshots 0) therefore credits the reader, never the
	/// default owner slot.
	pub fn read(&self, slot: usize) -> usize {
		self.reads[slot].fetch_add(1, Ordering::Relaxed);
		let version = self.version.load(Ordering::Acquire);
		let last_seen = self.snapshots[slot].swap(version, Ordering::AcqRel);
		match version == last_seen {
			true => slot,
			false => self.owner.load(Ordering::Acquire),
		}
	}

	/// Total read touches
	pub fn total_reads(&self) -> u64 {
		self.reads.iter().map(|r| r.load(Ordering::Relaxed)).sum()
	}

	/// Total write touches
	pub fn total_writes(&self) -> u64 {
		self.writes.iter().map(|w| w.load(Ordering::Relaxed)).sum()
	}

	/// Number of distinct slots that touched this line
	pub fn sharing_degree(&self) -> usize {
		(0..self.reads.len())
			.filter(|&slot| {
				self.reads[slot].load(Ordering::Relaxed) > 0 || self.writes[slot].load(Ordering::Relaxed) > 0
			})
			.count()
	}

	/// Number of distinct slots that wrote this line
	pub fn writing_degree(&self) -> usize {
		self.writes
			.iter()
			.filter(|writes| writes.load(Ordering::Relaxed) > 0)
			.count()
	}

	/// Fraction of touches that were writes
	pub fn write_ratio(&self) -> f64 {
		let writes = self.total_writes() as f64;
		let reads = self.total_reads() as f64;
		writes / (writes + reads)
	}

	/// Returns if more than one slot touched this line
	pub fn is_shared(&self) -> bool {
		self.sharing_degree() > 1
	}

	/// Adds this line's pairwise sharing to `mat`, over slots `0..n`.
	///
	/// `sharing(i, j) = min(reads_i, reads_j) + min(writes_i, writes_j)`,
	/// mirrored so the accumulated matrix stays symmetric.
	fn accumulate_sharing(&self, mat: &mut Matrix<u64>, n: usize) {
		let n = usize::min(n, self.reads.len());
		for i in 0..n {
			let reads_i = self.reads[i].load(Ordering::Relaxed);
			let writes_i = self.writes[i].load(Ordering::Relaxed);
			for j in 0..=i {
				let shared = u64::min(reads_i, self.reads[j].load(Ordering::Relaxed)) +
					u64::min(writes_i, self.writes[j].load(Ordering::Relaxed));
				*mat.get_mut(i, j) += shared;
				if i != j {
					*mat.get_mut(j, i) += shared;
				}
			}
		}
	}

	/// Adds this line's per-slot touches to `out`
	fn accumulate_touches(&self, out: &mut [u64]) {
		for (slot, touches) in out.iter_mut().enumerate().take(self.reads.len()) {
			*touches += self.reads[slot].load(Ordering::Relaxed) + self.writes[slot].load(Ordering::Relaxed);
		}
	}
}

/// A page of lazily allocated cachelines.
///
/// The lock is write-held only for first-touch allocation; accesses to
/// already-allocated lines go through atomics under the read guard.
#[derive(Debug, Default)]
pub struct Page {
	/// Cacheline slots, empty until the page's first touch
	lines: RwLock<Vec<Option<Box<Cacheline>>>>,
}

impl Page {
	/// Runs `f` on line `line_idx`, allocating it on first touch
	fn with_line<R>(&self, line_idx: usize, max_threads: usize, f: impl FnOnce(&Cacheline) -> R) -> R {
		// Fast path: line already allocated
		{
			let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
			if let Some(Some(line)) = lines.get(line_idx) {
				return f(line);
			}
		}

		// Slow path: allocate the page and/or the line
		let mut lines = self.lines.write().unwrap_or_else(PoisonError::into_inner);
		if lines.is_empty() {
			lines.resize_with(LINES_PER_PAGE, || None);
		}
		let line = lines[line_idx].get_or_insert_with(|| Box::new(Cacheline::new(max_threads)));
		f(line)
	}

	/// Runs `f` on every allocated line
	fn for_each_line(&self, mut f: impl FnMut(&Cacheline)) {
		let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
		for line in lines.iter().flatten() {
			f(line);
		}
	}
}

/// Aggregated page table statistics.
///
/// Computed over a quiescent table, see [`PageTable::stats`].
#[derive(Debug)]
pub struct PageTableStats {
	/// Symmetric pairwise sharing matrix
	pub sharing_matrix: Matrix<u64>,

	/// Distribution of per-line sharing degrees
	pub sharing_degree: OnlineStats,

	/// Distribution of per-line writing degrees
	pub writing_degree: OnlineStats,

	/// Distribution of per-line write ratios
	pub write_ratio: OnlineStats,

	/// Write ratio distribution restricted to shared lines
	pub shared_write_ratio: OnlineStats,

	/// Per-thread total touches
	pub touches_per_thread: Vec<u64>,

	/// Distribution of per-thread touches
	pub footprint: Stats,
}

/// Cacheline-granularity access simulator
#[derive(Debug)]
pub struct PageTable {
	/// All pages covering the tracked address range
	pages: Box<[Page]>,

	/// Page index mask (`pages.len() - 1`)
	page_mask: usize,

	/// Thread slots per cacheline
	max_threads: usize,
}

impl PageTable {
	/// Creates a page table covering `config`'s address range
	pub fn new(config: &TrackerConfig) -> Self {
		let mem_bits = u32::max(config.mem_bits, PAGE_BITS);
		let npages = 1_usize << (mem_bits - PAGE_BITS);
		Self {
			pages:       (0..npages).map(|_| Page::default()).collect(),
			page_mask:   npages - 1,
			max_threads: config.max_threads,
		}
	}

	/// Page index of `addr`, aliased into the tracked range
	fn page_idx(&self, addr: u64) -> usize {
		(addr >> PAGE_BITS) as usize & self.page_mask
	}

	/// Cacheline index of `addr` within its page
	fn line_idx(addr: u64) -> usize {
		(addr >> LINE_BITS) as usize & (LINES_PER_PAGE - 1)
	}

	/// Registers a read of `addr` by `slot` and returns the slot credited
	/// with producing the data
	pub fn read(&self, addr: u64, slot: usize, _size: u32) -> usize {
		let slot = slot % self.max_threads;
		self.pages[self.page_idx(addr)].with_line(Self::line_idx(addr), self.max_threads, |line| line.read(slot))
	}

	/// Registers a write of `addr` by `slot` and returns the previous owner
	pub fn write(&self, addr: u64, slot: usize, _size: u32) -> usize {
		let slot = slot % self.max_threads;
		self.pages[self.page_idx(addr)].with_line(Self::line_idx(addr), self.max_threads, |line| line.write(slot))
	}

	/// Computes aggregate statistics over all allocated cachelines,
	/// restricted to slots `0..nthreads`.
	///
	/// Assumes the trace is quiescent; the table is not mutated.
	pub fn stats(&self, nthreads: usize) -> PageTableStats {
		let nthreads = nthreads.clamp(1, self.max_threads);

		let mut sharing_matrix = Matrix::new(nthreads);
		let mut sharing_degree = OnlineStats::new();
		let mut writing_degree = OnlineStats::new();
		let mut write_ratio = OnlineStats::new();
		let mut shared_write_ratio = OnlineStats::new();
		let mut touches_per_thread = vec![0_u64; self.max_threads];

		for page in &*self.pages {
			page.for_each_line(|line| {
				line.accumulate_sharing(&mut sharing_matrix, nthreads);
				sharing_degree.insert(line.sharing_degree() as f64);
				writing_degree.insert(line.writing_degree() as f64);
				write_ratio.insert(line.write_ratio());
				if line.is_shared() {
					shared_write_ratio.insert(line.write_ratio());
				}
				line.accumulate_touches(&mut touches_per_thread);
			});
		}

		touches_per_thread.truncate(nthreads);
		let footprint = Stats::new(touches_per_thread.iter().map(|&touches| touches as f64));

		PageTableStats {
			sharing_matrix,
			sharing_degree,
			writing_degree,
			write_ratio,
			shared_write_ratio,
			touches_per_thread,
			footprint,
		}
	}

	/// Computes only the summed sharing matrix over slots `0..nthreads`
	pub fn sharing_matrix(&self, nthreads: usize) -> Matrix<u64> {
		let nthreads = nthreads.clamp(1, self.max_threads);
		let mut mat = Matrix::new(nthreads);
		for page in &*self.pages {
			page.for_each_line(|line| line.accumulate_sharing(&mut mat, nthreads));
		}
		mat
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Small table for tests: 16 thread slots, 1 MiB tracked
	fn table() -> PageTable {
		PageTable::new(&TrackerConfig {
			max_threads: 16,
			mem_bits:    20,
		})
	}

	#[test]
	fn self_consumption_returns_writer() {
		let table = table();
		table.write(0x1000, 3, 8);
		assert_eq!(table.read(0x1000, 3, 8), 3);
	}

	#[test]
	fn cross_thread_read_returns_owner() {
		let table = table();
		table.write(0x2000, 1, 8);
		assert_eq!(table.read(0x2000, 2, 8), 1);

		// Once observed, re-reads are credited to the reader itself
		assert_eq!(table.read(0x2000, 2, 8), 2);
	}

	#[test]
	fn fresh_line_read_credits_reader() {
		let table = table();
		assert_eq!(table.read(0x3000, 5, 4), 5);
	}

	#[test]
	fn sharing_matrix_is_symmetric() {
		let table = table();
		table.write(0x0, 0, 8);
		table.read(0x0, 1, 8);
		table.read(0x0, 2, 8);
		table.write(0x40, 2, 8);
		table.read(0x40, 0, 8);
		table.write(0x40, 1, 8);

		let mat = table.sharing_matrix(3);
		for i in 0..mat.size() {
			for j in 0..mat.size() {
				assert_eq!(mat.get(i, j), mat.get(j, i), "asymmetric at ({i}, {j})");
			}
		}
	}

	#[test]
	fn stats_for_single_shared_line() {
		let table = table();
		table.write(0x0, 0, 8);
		table.read(0x0, 1, 8);
		table.read(0x0, 0, 8);

		let stats = table.stats(2);
		assert_eq!(stats.sharing_degree.mean(), 2.0);
		assert_eq!(stats.writing_degree.mean(), 1.0);
		assert!((stats.write_ratio.mean() - 1.0 / 3.0).abs() < 1e-12);
		assert_eq!(stats.touches_per_thread, vec![2, 1]);
		assert_eq!(stats.footprint.sum(), 3.0);

		// sharing(0, 1) = min(1, 1) reads + min(1, 0) writes
		assert_eq!(stats.sharing_matrix.get(0, 1), 1);
		assert_eq!(stats.sharing_matrix.get(1, 0), 1);
	}

	#[test]
	fn distinct_lines_do_not_share() {
		let table = table();
		table.write(0x0, 0, 8);
		table.write(0x40, 1, 8);

		let stats = table.stats(2);
		assert_eq!(stats.sharing_matrix.get(0, 1), 0);
		assert_eq!(stats.sharing_degree.mean(), 1.0);
	}

	#[test]
	fn addresses_alias_into_tracked_range() {
		let table = table();
		// Same page index after masking
		table.write(0xffff_f000_0000, 0, 8);
		let stats = table.stats(1);
		assert_eq!(stats.footprint.sum(), 1.0);
	}
}
