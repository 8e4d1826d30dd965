//! Ticket-counter dependence tracking.
//!
//! Edges between tasks are never materialized. Each object keeps one
//! head/tail ticket pair per conflict class; issuing a task snapshots the
//! tails of every conflicting class into the argument's tag and takes a
//! ticket in its own class. The task may run once the head of every
//! conflicting class has reached its snapshot, which pending tasks learn by
//! being polled from the graph's pending list.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::meta::{AccessMode, Conflicts, FifoPair};
#[cfg(feature = "commutative")]
use crate::meta::TryLock;
use crate::task::TaskRef;

/// Ticket snapshots taken at issue time, one per conflict class.
#[derive(Clone, Debug, Default)]
pub(crate) struct DepTag {
	rd: u32,
	wr: u32,
	#[cfg(feature = "commutative")]
	c: u32,
	#[cfg(feature = "reduction")]
	r: u32,
}

struct Counters {
	readers: FifoPair,
	writers: FifoPair,
	#[cfg(feature = "commutative")]
	commutative: FifoPair,
	#[cfg(feature = "reduction")]
	reductions: FifoPair,
}

/// Per-object dependence metadata.
pub(crate) struct ObjectDeps {
	counters: CachePadded<Counters>,
	#[cfg(feature = "commutative")]
	mutex: TryLock,
	depth: AtomicU64,
}

impl ObjectDeps {
	pub(crate) fn new() -> Self {
		Self {
			counters: CachePadded::new(Counters {
				readers: FifoPair::new(),
				writers: FifoPair::new(),
				#[cfg(feature = "commutative")]
				commutative: FifoPair::new(),
				#[cfg(feature = "reduction")]
				reductions: FifoPair::new(),
			}),
			#[cfg(feature = "commutative")]
			mutex: TryLock::new(),
			depth: AtomicU64::new(0),
		}
	}

	fn pair(&self, class: Conflicts) -> Option<&FifoPair> {
		let c = &*self.counters;
		if class == Conflicts::READERS {
			return Some(&c.readers);
		}
		if class == Conflicts::WRITERS {
			return Some(&c.writers);
		}
		#[cfg(feature = "commutative")]
		if class == Conflicts::COMMUT {
			return Some(&c.commutative);
		}
		#[cfg(feature = "reduction")]
		if class == Conflicts::REDUCT {
			return Some(&c.reductions);
		}
		None
	}

	/// Is it safe to run a fresh task in mode `m` right now?
	pub(crate) fn match_group(&self, m: AccessMode) -> bool {
		m.conflicts()
			.iter()
			.filter_map(|class| self.pair(class))
			.all(FifoPair::empty)
	}

	/// Record a task under mode `m`: snapshot every conflicting tail into
	/// the tag and take a ticket in the task's own class.
	pub(crate) fn issue(&self, _task: &TaskRef, tag: &mut DepTag, m: AccessMode) {
		let conflicts = m.conflicts();
		let c = &*self.counters;
		if conflicts.contains(Conflicts::READERS) {
			tag.rd = c.readers.get_tag();
		}
		if conflicts.contains(Conflicts::WRITERS) {
			tag.wr = c.writers.get_tag();
		}
		#[cfg(feature = "commutative")]
		if conflicts.contains(Conflicts::COMMUT) {
			tag.c = c.commutative.get_tag();
		}
		#[cfg(feature = "reduction")]
		if conflicts.contains(Conflicts::REDUCT) {
			tag.r = c.reductions.get_tag();
		}
		self.pair(m.class()).expect("untracked class").adv_tail();
	}

	/// Has every conflicting predecessor of the tag released?
	pub(crate) fn ready(&self, tag: &DepTag, m: AccessMode) -> bool {
		let conflicts = m.conflicts();
		let c = &*self.counters;
		let mut ok = true;
		if conflicts.contains(Conflicts::READERS) {
			ok &= c.readers.chk_tag(tag.rd);
		}
		if conflicts.contains(Conflicts::WRITERS) {
			ok &= c.writers.chk_tag(tag.wr);
		}
		#[cfg(feature = "commutative")]
		if conflicts.contains(Conflicts::COMMUT) {
			ok &= c.commutative.chk_tag(tag.c);
		}
		#[cfg(feature = "reduction")]
		if conflicts.contains(Conflicts::REDUCT) {
			ok &= c.reductions.chk_tag(tag.r);
		}
		ok
	}

	/// The task completed; must pair with the `issue` that filled `tag`.
	pub(crate) fn release(&self, _task: &TaskRef, _tag: &DepTag, m: AccessMode) {
		self.pair(m.class()).expect("untracked class").adv_head();
	}

	pub(crate) fn has_readers(&self) -> bool {
		!self.counters.readers.empty()
	}

	/// Any outstanding modifier, in the rename-profitability sense.
	pub(crate) fn has_writers(&self) -> bool {
		let c = &*self.counters;
		let mut busy = !c.writers.empty();
		#[cfg(feature = "commutative")]
		{
			busy |= !c.commutative.empty();
		}
		#[cfg(feature = "reduction")]
		{
			busy |= !c.reductions.empty();
		}
		busy
	}

	#[cfg(feature = "commutative")]
	pub(crate) fn commutative_try_acquire(&self) -> bool {
		self.mutex.try_lock()
	}

	#[cfg(feature = "commutative")]
	pub(crate) fn commutative_release(&self) {
		self.mutex.unlock();
	}

	pub(crate) fn depth(&self) -> u64 {
		self.depth.load(Ordering::Relaxed)
	}

	pub(crate) fn update_depth(&self, d: u64) {
		self.depth.fetch_max(d, Ordering::Relaxed);
	}

	/// No tickets outstanding in any class.
	pub(crate) fn is_idle(&self) -> bool {
		let c = &*self.counters;
		let mut idle = c.readers.empty() & c.writers.empty();
		#[cfg(feature = "commutative")]
		{
			idle &= c.commutative.empty();
		}
		#[cfg(feature = "reduction")]
		{
			idle &= c.reductions.empty();
		}
		idle
	}
}

impl fmt::Display for ObjectDeps {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let c = &*self.counters;
		let (rh, rt) = c.readers.counts();
		let (wh, wt) = c.writers.counts();
		write!(f, "ticket_md={{readers={{{rh}, {rt}}}, writers={{{wh}, {wt}}}")?;
		#[cfg(feature = "commutative")]
		{
			let (ch, ct) = c.commutative.counts();
			write!(f, ", commutative={{{ch}, {ct}}}")?;
		}
		#[cfg(feature = "reduction")]
		{
			let (xh, xt) = c.reductions.counts();
			write!(f, ", reductions={{{xh}, {xt}}}")?;
		}
		write!(f, "}}")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::task::Task;

	fn issue(md: &ObjectDeps, m: AccessMode) -> DepTag {
		let task = Task::detached();
		let mut tag = DepTag::default();
		md.issue(&task, &mut tag, m);
		tag
	}

	fn release(md: &ObjectDeps, tag: &DepTag, m: AccessMode) {
		let task = Task::detached();
		md.release(&task, tag, m);
	}

	#[test]
	fn readers_share_a_generation() {
		let md = ObjectDeps::new();
		let a = issue(&md, AccessMode::Read);
		let b = issue(&md, AccessMode::Read);
		assert!(md.ready(&a, AccessMode::Read));
		assert!(md.ready(&b, AccessMode::Read));
		assert!(md.match_group(AccessMode::Read));
		assert!(!md.match_group(AccessMode::Write));
	}

	#[test]
	fn writer_waits_for_readers() {
		let md = ObjectDeps::new();
		let r = issue(&md, AccessMode::Read);
		let w = issue(&md, AccessMode::ReadWrite);
		assert!(!md.ready(&w, AccessMode::ReadWrite));
		release(&md, &r, AccessMode::Read);
		assert!(md.ready(&w, AccessMode::ReadWrite));
		release(&md, &w, AccessMode::ReadWrite);
		assert!(md.is_idle());
	}

	#[test]
	fn reader_waits_for_writer_only() {
		let md = ObjectDeps::new();
		let w = issue(&md, AccessMode::Write);
		let r = issue(&md, AccessMode::Read);
		assert!(!md.ready(&r, AccessMode::Read));
		release(&md, &w, AccessMode::Write);
		assert!(md.ready(&r, AccessMode::Read));
		release(&md, &r, AccessMode::Read);
	}

	#[test]
	fn issue_release_leaves_metadata_idle() {
		let md = ObjectDeps::new();
		let t = issue(&md, AccessMode::ReadWrite);
		assert!(!md.is_idle());
		release(&md, &t, AccessMode::ReadWrite);
		assert!(md.is_idle());
		assert!(md.match_group(AccessMode::Write));
	}

	#[cfg(feature = "commutative")]
	#[test]
	fn commutatives_admit_each_other() {
		let md = ObjectDeps::new();
		let a = issue(&md, AccessMode::Commutative);
		let b = issue(&md, AccessMode::Commutative);
		assert!(md.ready(&a, AccessMode::Commutative));
		assert!(md.ready(&b, AccessMode::Commutative));
		// Serialization is the mutex's job, not the counters'.
		assert!(md.commutative_try_acquire());
		assert!(!md.commutative_try_acquire());
		md.commutative_release();
		release(&md, &a, AccessMode::Commutative);
		release(&md, &b, AccessMode::Commutative);
	}

	#[cfg(feature = "reduction")]
	#[test]
	fn reductions_exclude_commutatives() {
		let md = ObjectDeps::new();
		let a = issue(&md, AccessMode::Reduction);
		let b = issue(&md, AccessMode::Reduction);
		assert!(md.ready(&a, AccessMode::Reduction));
		assert!(md.ready(&b, AccessMode::Reduction));
		#[cfg(feature = "commutative")]
		{
			let c = issue(&md, AccessMode::Commutative);
			assert!(!md.ready(&c, AccessMode::Commutative));
			release(&md, &c, AccessMode::Commutative);
		}
		release(&md, &a, AccessMode::Reduction);
		release(&md, &b, AccessMode::Reduction);
	}
}
