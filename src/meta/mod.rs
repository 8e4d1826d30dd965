//! Per-object dependence metadata.
//!
//! Every live object carries one [`ObjectDeps`] record with the
//! generation-level bookkeeping behind the readiness rules. Three
//! interchangeable schemes implement the same contract; the build selects
//! one, and the rest of the crate only sees the re-exported `ObjectDeps` and
//! `DepTag` types.

#[cfg(any(
	not(any(feature = "tg-generations", feature = "tg-compact")),
	feature = "queues"
))]
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use bitflags::bitflags;

#[cfg(not(any(feature = "tg-generations", feature = "tg-compact")))]
pub(crate) mod tickets;

#[cfg(feature = "tg-generations")]
pub(crate) mod generations;

#[cfg(all(feature = "tg-compact", not(feature = "tg-generations")))]
pub(crate) mod compact;

#[cfg(not(any(feature = "tg-generations", feature = "tg-compact")))]
pub(crate) use tickets::{DepTag, ObjectDeps};

#[cfg(feature = "tg-generations")]
pub(crate) use generations::{DepTag, ObjectDeps};

#[cfg(all(feature = "tg-compact", not(feature = "tg-generations")))]
pub(crate) use compact::{DepTag, ObjectDeps};

/// The declared intent of one task argument.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum AccessMode {
	Read,
	Write,
	ReadWrite,
	#[cfg(feature = "commutative")]
	Commutative,
	#[cfg(feature = "reduction")]
	Reduction,
}

bitflags! {
	/// Conflict classes an access mode must wait out before running.
	#[derive(Copy, Clone, Debug, Eq, PartialEq)]
	pub(crate) struct Conflicts: u8 {
		const READERS = 1 << 0;
		const WRITERS = 1 << 1;
		const COMMUT = 1 << 2;
		const REDUCT = 1 << 3;
	}
}

impl AccessMode {
	/// The conflict class this mode itself belongs to.
	pub(crate) fn class(self) -> Conflicts {
		match self {
			AccessMode::Read => Conflicts::READERS,
			AccessMode::Write | AccessMode::ReadWrite => Conflicts::WRITERS,
			#[cfg(feature = "commutative")]
			AccessMode::Commutative => Conflicts::COMMUT,
			#[cfg(feature = "reduction")]
			AccessMode::Reduction => Conflicts::REDUCT,
		}
	}

	/// The conflict classes this mode must wait out.
	///
	/// Readers conflict with everything that modifies; writers conflict with
	/// everything; commutative and reduction tasks admit their own kind and
	/// exclude each other.
	pub(crate) fn conflicts(self) -> Conflicts {
		match self {
			AccessMode::Read => Conflicts::all() & !Conflicts::READERS,
			AccessMode::Write | AccessMode::ReadWrite => Conflicts::all(),
			#[cfg(feature = "commutative")]
			AccessMode::Commutative => Conflicts::all() & !Conflicts::COMMUT,
			#[cfg(feature = "reduction")]
			AccessMode::Reduction => Conflicts::all() & !Conflicts::REDUCT,
		}
	}
}

/// A head/tail ticket pair.
///
/// Issue takes a ticket from the tail, release advances the head. The pair
/// is empty when every ticket taken has been released, and a task whose
/// snapshot of the tail has been reached by the head has no predecessors
/// left in this class.
#[cfg(any(
	not(any(feature = "tg-generations", feature = "tg-compact")),
	feature = "queues"
))]
#[derive(Debug, Default)]
pub(crate) struct FifoPair {
	head: AtomicU32,
	tail: AtomicU32,
}

#[cfg(any(
	not(any(feature = "tg-generations", feature = "tg-compact")),
	feature = "queues"
))]
impl FifoPair {
	pub(crate) const fn new() -> Self {
		Self {
			head: AtomicU32::new(0),
			tail: AtomicU32::new(0),
		}
	}

	pub(crate) fn adv_head(&self) -> u32 {
		self.head.fetch_add(1, Ordering::AcqRel)
	}

	pub(crate) fn adv_tail(&self) -> u32 {
		self.tail.fetch_add(1, Ordering::AcqRel)
	}

	pub(crate) fn empty(&self) -> bool {
		self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
	}

	/// Has the head caught up with the ticket snapshot `tag`?
	pub(crate) fn chk_tag(&self, tag: u32) -> bool {
		self.head.load(Ordering::Acquire) == tag
	}

	pub(crate) fn get_tag(&self) -> u32 {
		self.tail.load(Ordering::Acquire)
	}

	pub(crate) fn counts(&self) -> (u32, u32) {
		(
			self.head.load(Ordering::Relaxed),
			self.tail.load(Ordering::Relaxed),
		)
	}
}

/// Mutual-exclusion flag for commutative arguments and reduction slots.
///
/// There is no blocking lock operation: a commutative task that fails the
/// acquire stays on the ready list and is retried later; a reduction scans
/// for another slot.
#[cfg(any(feature = "commutative", feature = "reduction"))]
#[derive(Debug, Default)]
pub(crate) struct TryLock {
	taken: std::sync::atomic::AtomicBool,
}

#[cfg(any(feature = "commutative", feature = "reduction"))]
impl TryLock {
	pub(crate) const fn new() -> Self {
		Self {
			taken: std::sync::atomic::AtomicBool::new(false),
		}
	}

	pub(crate) fn try_lock(&self) -> bool {
		self.taken
			.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_ok()
	}

	pub(crate) fn unlock(&self) {
		let was = self.taken.swap(false, Ordering::Release);
		assert!(was, "try-lock released without a holder");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn conflict_classes() {
		assert!(AccessMode::Read.conflicts().contains(Conflicts::WRITERS));
		assert!(!AccessMode::Read.conflicts().contains(Conflicts::READERS));
		assert_eq!(AccessMode::Write.conflicts(), Conflicts::all());
		assert_eq!(AccessMode::ReadWrite.conflicts(), Conflicts::all());
		#[cfg(feature = "commutative")]
		{
			let c = AccessMode::Commutative.conflicts();
			assert!(c.contains(Conflicts::READERS | Conflicts::WRITERS));
			assert!(!c.contains(Conflicts::COMMUT));
		}
		#[cfg(feature = "reduction")]
		{
			let r = AccessMode::Reduction.conflicts();
			assert!(!r.contains(Conflicts::REDUCT));
			#[cfg(feature = "commutative")]
			assert!(r.contains(Conflicts::COMMUT));
		}
	}

	#[cfg(any(
		not(any(feature = "tg-generations", feature = "tg-compact")),
		feature = "queues"
	))]
	#[test]
	fn fifo_pair_tags() {
		let f = FifoPair::new();
		assert!(f.empty());
		let t0 = f.get_tag();
		f.adv_tail();
		assert!(!f.empty());
		assert!(f.chk_tag(t0));
		let t1 = f.get_tag();
		assert!(!f.chk_tag(t1));
		f.adv_head();
		assert!(f.empty());
		assert!(f.chk_tag(t1));
	}

	#[cfg(any(feature = "commutative", feature = "reduction"))]
	#[test]
	fn try_lock_excludes() {
		let m = TryLock::new();
		assert!(m.try_lock());
		assert!(!m.try_lock());
		m.unlock();
		assert!(m.try_lock());
		m.unlock();
	}
}
