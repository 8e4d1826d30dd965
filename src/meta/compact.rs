//! Compact two-group dependence tracking.
//!
//! Only the running (oldest) group and the group currently being appended
//! (youngest) are materialized; tasks of intermediate generations sit in a
//! single waiting list whose generation boundaries are implied by their
//! sequence numbers. The generation count is an explicit atomic; the wakeup
//! slow path holds both the oldest and the youngest lock, oldest first.
//! Cheapest when sustained pipeline parallelism keeps the chain shallow.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use hermit_sync::SpinMutex;

use crate::meta::{AccessMode, Conflicts};
#[cfg(feature = "commutative")]
use crate::meta::TryLock;
use crate::task::TaskRef;

/// Sequence number of the generation the argument joined.
#[derive(Clone, Debug, Default)]
pub(crate) struct DepTag {
	generation: u64,
}

struct Oldest {
	id: u64,
	kind: Conflicts,
	/// Unreleased tasks in the running group.
	count: usize,
}

struct Youngest {
	id: u64,
	kind: Conflicts,
	next_id: u64,
	/// Tasks of every non-running generation, in issue order.
	waiting: VecDeque<(TaskRef, u64, Conflicts)>,
}

/// Per-object dependence metadata.
pub(crate) struct ObjectDeps {
	oldest: SpinMutex<Oldest>,
	youngest: SpinMutex<Youngest>,
	num_gens: AtomicUsize,
	#[cfg(feature = "commutative")]
	mutex: TryLock,
	depth: AtomicU64,
}

impl ObjectDeps {
	pub(crate) fn new() -> Self {
		Self {
			oldest: SpinMutex::new(Oldest {
				id: 0,
				kind: Conflicts::empty(),
				count: 0,
			}),
			youngest: SpinMutex::new(Youngest {
				id: 0,
				kind: Conflicts::empty(),
				next_id: 1,
				waiting: VecDeque::new(),
			}),
			num_gens: AtomicUsize::new(0),
			#[cfg(feature = "commutative")]
			mutex: TryLock::new(),
			depth: AtomicU64::new(0),
		}
	}

	fn joinable(class: Conflicts) -> bool {
		class != Conflicts::WRITERS
	}

	/// Is it safe to run a fresh task in mode `m` right now?
	pub(crate) fn match_group(&self, m: AccessMode) -> bool {
		match self.num_gens.load(Ordering::Acquire) {
			0 => true,
			1 => {
				let oldest = self.oldest.lock();
				oldest.kind == m.class() && Self::joinable(m.class())
			}
			_ => false,
		}
	}

	/// Join the running group when possible, else append to the waiting
	/// list with one wake token, opening a new generation on a group-type
	/// mismatch.
	pub(crate) fn issue(&self, task: &TaskRef, tag: &mut DepTag, m: AccessMode) {
		let class = m.class();
		let mut oldest = self.oldest.lock();
		match self.num_gens.load(Ordering::Acquire) {
			0 => {
				let mut youngest = self.youngest.lock();
				oldest.id = youngest.next_id;
				youngest.next_id += 1;
				oldest.kind = class;
				oldest.count = 1;
				youngest.id = oldest.id;
				youngest.kind = class;
				self.num_gens.store(1, Ordering::Release);
				tag.generation = oldest.id;
			}
			1 if oldest.kind == class && Self::joinable(class) => {
				oldest.count += 1;
				tag.generation = oldest.id;
			}
			n => {
				let mut youngest = self.youngest.lock();
				let open_new = n == 1 || youngest.kind != class || !Self::joinable(class);
				if open_new {
					youngest.id = youngest.next_id;
					youngest.next_id += 1;
					youngest.kind = class;
					self.num_gens.fetch_add(1, Ordering::AcqRel);
				}
				tag.generation = youngest.id;
				let entry = (task.clone(), youngest.id, class);
				youngest.waiting.push_back(entry);
				task.add_incoming(1);
			}
		}
	}

	/// Polling fallback; wakeups through the incoming counter are the
	/// primary mechanism.
	pub(crate) fn ready(&self, tag: &DepTag, _m: AccessMode) -> bool {
		if self.num_gens.load(Ordering::Acquire) == 0 {
			return true;
		}
		self.oldest.lock().id == tag.generation
	}

	/// Retire the task; on draining the running group, promote the next
	/// waiting generation and wake its tasks.
	pub(crate) fn release(&self, _task: &TaskRef, tag: &DepTag, _m: AccessMode) {
		let mut woken = Vec::new();
		{
			let mut oldest = self.oldest.lock();
			assert_eq!(
				oldest.id, tag.generation,
				"release from a group that is not running"
			);
			assert!(oldest.count > 0, "unpaired release");
			oldest.count -= 1;
			if oldest.count > 0 {
				return;
			}
			// Slow path: the running group drained. Take both locks.
			let mut youngest = self.youngest.lock();
			match youngest.waiting.front() {
				None => {
					oldest.kind = Conflicts::empty();
					self.num_gens.fetch_sub(1, Ordering::AcqRel);
				}
				Some(&(_, next_id, next_kind)) => {
					oldest.id = next_id;
					oldest.kind = next_kind;
					while let Some(&(_, id, _)) = youngest.waiting.front() {
						if id != next_id {
							break;
						}
						let (t, _, _) = youngest.waiting.pop_front().unwrap();
						woken.push(t);
					}
					oldest.count = woken.len();
					self.num_gens.fetch_sub(1, Ordering::AcqRel);
				}
			}
		}
		for t in &woken {
			t.wake();
		}
	}

	// The compact scheme can only answer rename-profitability queries at
	// group granularity, so any outstanding group counts as both.
	pub(crate) fn has_readers(&self) -> bool {
		self.num_gens.load(Ordering::Acquire) > 0
	}

	pub(crate) fn has_writers(&self) -> bool {
		self.num_gens.load(Ordering::Acquire) > 0
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

	pub(crate) fn is_idle(&self) -> bool {
		self.num_gens.load(Ordering::Acquire) == 0
	}
}

impl fmt::Display for ObjectDeps {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let oldest = self.oldest.lock();
		let youngest = self.youngest.lock();
		write!(
			f,
			"compact_md={{o.kind={:?} o.count={} y.kind={:?} y.waiting={} num_gens={}}}",
			oldest.kind,
			oldest.count,
			youngest.kind,
			youngest.waiting.len(),
			self.num_gens.load(Ordering::Relaxed)
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::task::Task;

	fn issue(md: &ObjectDeps, task: &TaskRef, m: AccessMode) -> DepTag {
		let mut tag = DepTag::default();
		md.issue(task, &mut tag, m);
		tag
	}

	#[test]
	fn pipeline_of_writers() {
		let md = ObjectDeps::new();
		let t1 = Task::detached();
		let t2 = Task::detached();
		let t3 = Task::detached();
		let g1 = issue(&md, &t1, AccessMode::Write);
		let g2 = issue(&md, &t2, AccessMode::Write);
		let g3 = issue(&md, &t3, AccessMode::Write);
		assert_eq!(md.num_gens.load(Ordering::Relaxed), 3);
		assert!(md.ready(&g1, AccessMode::Write));
		assert!(!md.ready(&g2, AccessMode::Write));
		md.release(&t1, &g1, AccessMode::Write);
		assert!(!t2.has_incoming());
		assert!(md.ready(&g2, AccessMode::Write));
		md.release(&t2, &g2, AccessMode::Write);
		assert!(!t3.has_incoming());
		md.release(&t3, &g3, AccessMode::Write);
		assert!(md.is_idle());
	}

	#[test]
	fn readers_coalesce_into_one_group() {
		let md = ObjectDeps::new();
		let w = Task::detached();
		let r1 = Task::detached();
		let r2 = Task::detached();
		let t_w = issue(&md, &w, AccessMode::Write);
		let t_r1 = issue(&md, &r1, AccessMode::Read);
		let t_r2 = issue(&md, &r2, AccessMode::Read);
		assert_eq!(md.num_gens.load(Ordering::Relaxed), 2);
		md.release(&w, &t_w, AccessMode::Write);
		// Both readers promoted together.
		assert!(!r1.has_incoming() && !r2.has_incoming());
		md.release(&r1, &t_r1, AccessMode::Read);
		md.release(&r2, &t_r2, AccessMode::Read);
		assert!(md.is_idle());
	}

	#[test]
	fn joins_running_reader_group() {
		let md = ObjectDeps::new();
		let r1 = Task::detached();
		let r2 = Task::detached();
		let t_r1 = issue(&md, &r1, AccessMode::Read);
		assert!(md.match_group(AccessMode::Read));
		let t_r2 = issue(&md, &r2, AccessMode::Read);
		assert!(!r2.has_incoming());
		md.release(&r1, &t_r1, AccessMode::Read);
		md.release(&r2, &t_r2, AccessMode::Read);
		assert!(md.is_idle());
	}
}
