//! Thread registry
//!
//! Maps OS thread ids, as they appear in the trace, to dense slot indices
//! used throughout the matrices. Slots are handed out in order of first
//! appearance, so the first thread of the trace is always slot 0.

// Imports
use std::{
	collections::HashMap,
	sync::{PoisonError, RwLock},
};

/// Inner registry state
#[derive(Debug, Default)]
struct Inner {
	/// Thread id to slot
	slots: HashMap<u64, usize>,

	/// Next slot to hand out
	next: usize,
}

/// Dense slot registry for OS thread ids
#[derive(Debug)]
pub struct ThreadRegistry {
	/// Registered threads
	inner: RwLock<Inner>,

	/// Maximum number of distinct slots
	max_slots: usize,
}

impl ThreadRegistry {
	/// Creates a registry handing out up to `max_slots` slots
	pub fn new(max_slots: usize) -> Self {
		Self {
			inner: RwLock::new(Inner::default()),
			max_slots,
		}
	}

	/// Returns the slot of `tid`, assigning the next free one on first sight.
	///
	/// Once `max_slots` distinct threads have been seen, further threads
	/// alias onto existing slots by modulo instead of being dropped.
	pub fn slot(&self, tid: u64) -> usize {
		// Fast path: already registered
		{
			let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
			if let Some(&slot) = inner.slots.get(&tid) {
				return slot;
			}
		}

		let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
		if let Some(&slot) = inner.slots.get(&tid) {
			return slot;
		}

		let slot = inner.next % self.max_slots;
		if inner.next == self.max_slots {
			tracing::warn!(max_slots = self.max_slots, "Thread slots exhausted, aliasing further threads");
		}
		inner.next += 1;
		inner.slots.insert(tid, slot);
		slot
	}

	/// Returns the slot of `tid` without assigning one
	pub fn get(&self, tid: u64) -> Option<usize> {
		self.inner
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.slots
			.get(&tid)
			.copied()
	}

	/// Number of distinct threads seen, capped at the slot count
	pub fn threads_seen(&self) -> usize {
		let seen = self.inner.read().unwrap_or_else(PoisonError::into_inner).next;
		usize::min(seen, self.max_slots)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn slots_by_first_appearance() {
		let registry = ThreadRegistry::new(8);
		assert_eq!(registry.slot(4000), 0);
		assert_eq!(registry.slot(1234), 1);
		assert_eq!(registry.slot(4000), 0);
		assert_eq!(registry.threads_seen(), 2);
	}

	#[test]
	fn exhausted_registry_aliases() {
		let registry = ThreadRegistry::new(2);
		assert_eq!(registry.slot(10), 0);
		assert_eq!(registry.slot(11), 1);
		assert_eq!(registry.slot(12), 0);
		assert_eq!(registry.slot(13), 1);

		// Aliased threads keep their slot
		assert_eq!(registry.slot(12), 0);
		assert_eq!(registry.threads_seen(), 2);
	}

	#[test]
	fn get_does_not_assign() {
		let registry = ThreadRegistry::new(4);
		assert_eq!(registry.get(99), None);
		registry.slot(99);
		assert_eq!(registry.get(99), Some(0));
	}
}
