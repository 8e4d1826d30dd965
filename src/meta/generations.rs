//! Generational dependence tracking with explicit task lists.
//!
//! An object's history is a chain of generations, each holding the tasks
//! that may run concurrently (all readers, a single writer, all
//! commutatives, all reductions). Only the oldest generation executes. A
//! task joining a younger generation takes one wake token; when the oldest
//! generation drains, every task of the next one is transitioned by an
//! atomic decrement of its incoming count.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use hermit_sync::SpinMutex;

use crate::meta::{AccessMode, Conflicts};
#[cfg(feature = "commutative")]
use crate::meta::TryLock;
use crate::task::TaskRef;

/// Which generation the argument joined.
#[derive(Clone, Debug, Default)]
pub(crate) struct DepTag {
	generation: u64,
}

struct Generation {
	id: u64,
	kind: Conflicts,
	tasks: Vec<TaskRef>,
}

impl Generation {
	/// A fresh task in class `class` may join this generation.
	fn admits(&self, class: Conflicts) -> bool {
		self.kind == class && class != Conflicts::WRITERS
	}
}

struct Chain {
	gens: VecDeque<Generation>,
	next_id: u64,
}

/// Per-object dependence metadata.
pub(crate) struct ObjectDeps {
	chain: SpinMutex<Chain>,
	#[cfg(feature = "commutative")]
	mutex: TryLock,
	depth: AtomicU64,
}

impl ObjectDeps {
	pub(crate) fn new() -> Self {
		Self {
			chain: SpinMutex::new(Chain {
				gens: VecDeque::new(),
				next_id: 0,
			}),
			#[cfg(feature = "commutative")]
			mutex: TryLock::new(),
			depth: AtomicU64::new(0),
		}
	}

	/// Is it safe to run a fresh task in mode `m` right now?
	pub(crate) fn match_group(&self, m: AccessMode) -> bool {
		let chain = self.chain.lock();
		match chain.gens.len() {
			0 => true,
			1 => chain.gens.front().unwrap().admits(m.class()),
			_ => false,
		}
	}

	/// Append the task to the chain, opening a new generation when the mode
	/// does not match the youngest group or the group is a writer.
	pub(crate) fn issue(&self, task: &TaskRef, tag: &mut DepTag, m: AccessMode) {
		let class = m.class();
		let mut chain = self.chain.lock();
		let open_new = match chain.gens.back() {
			Some(g) => !g.admits(class),
			None => true,
		};
		if open_new {
			let id = chain.next_id;
			chain.next_id += 1;
			chain.gens.push_back(Generation {
				id,
				kind: class,
				tasks: Vec::new(),
			});
		}
		let waiting = chain.gens.len() > 1;
		let newest = chain.gens.back_mut().unwrap();
		tag.generation = newest.id;
		newest.tasks.push(task.clone());
		if waiting {
			// One wake token per argument: paid back when the previous
			// generation drains.
			task.add_incoming(1);
		}
	}

	/// Polling fallback: the argument is ready when its generation has
	/// become the oldest. Wakeups through the incoming counter are the
	/// primary mechanism.
	pub(crate) fn ready(&self, tag: &DepTag, _m: AccessMode) -> bool {
		let chain = self.chain.lock();
		chain.gens.front().is_none_or(|g| g.id == tag.generation)
	}

	/// Remove the task from its generation; on draining the oldest, wake
	/// every task of the next one.
	pub(crate) fn release(&self, task: &TaskRef, tag: &DepTag, _m: AccessMode) {
		let mut woken = Vec::new();
		{
			let mut chain = self.chain.lock();
			let front = chain
				.gens
				.front_mut()
				.expect("release on object without generations");
			assert_eq!(
				front.id, tag.generation,
				"release from a generation that is not the oldest"
			);
			let pos = front
				.tasks
				.iter()
				.position(|t| std::sync::Arc::ptr_eq(t, task))
				.expect("unpaired release");
			front.tasks.swap_remove(pos);
			if front.tasks.is_empty() {
				chain.gens.pop_front();
				if let Some(next) = chain.gens.front() {
					woken.extend(next.tasks.iter().cloned());
				}
			}
		}
		for t in &woken {
			t.wake();
		}
	}

	pub(crate) fn has_readers(&self) -> bool {
		self.chain
			.lock()
			.gens
			.iter()
			.any(|g| g.kind == Conflicts::READERS)
	}

	/// Any outstanding modifier, in the rename-profitability sense.
	pub(crate) fn has_writers(&self) -> bool {
		self.chain
			.lock()
			.gens
			.iter()
			.any(|g| g.kind != Conflicts::READERS)
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
		self.chain.lock().gens.is_empty()
	}
}

impl fmt::Display for ObjectDeps {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let chain = self.chain.lock();
		write!(f, "generation_md={{gens=[")?;
		for (i, g) in chain.gens.iter().enumerate() {
			if i > 0 {
				write!(f, ", ")?;
			}
			write!(f, "{{id={}, kind={:?}, tasks={}}}", g.id, g.kind, g.tasks.len())?;
		}
		write!(f, "]}}")
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
	fn writers_open_new_generations() {
		let md = ObjectDeps::new();
		let t1 = Task::detached();
		let t2 = Task::detached();
		let g1 = issue(&md, &t1, AccessMode::Write);
		assert!(md.ready(&g1, AccessMode::Write));
		let g2 = issue(&md, &t2, AccessMode::Write);
		assert!(!md.ready(&g2, AccessMode::Write));
		assert!(t2.has_incoming());
		md.release(&t1, &g1, AccessMode::Write);
		assert!(md.ready(&g2, AccessMode::Write));
		md.release(&t2, &g2, AccessMode::Write);
		assert!(md.is_idle());
	}

	#[test]
	fn readers_join_the_oldest_generation() {
		let md = ObjectDeps::new();
		let t1 = Task::detached();
		let t2 = Task::detached();
		let g1 = issue(&md, &t1, AccessMode::Read);
		let g2 = issue(&md, &t2, AccessMode::Read);
		assert!(md.match_group(AccessMode::Read));
		assert!(md.ready(&g1, AccessMode::Read));
		assert!(md.ready(&g2, AccessMode::Read));
		assert!(!t1.has_incoming() && !t2.has_incoming());
		md.release(&t2, &g2, AccessMode::Read);
		md.release(&t1, &g1, AccessMode::Read);
		assert!(md.is_idle());
	}

	#[test]
	fn draining_readers_wakes_the_writer() {
		let md = ObjectDeps::new();
		let r1 = Task::detached();
		let r2 = Task::detached();
		let w = Task::detached();
		let t_r1 = issue(&md, &r1, AccessMode::Read);
		let t_r2 = issue(&md, &r2, AccessMode::Read);
		let t_w = issue(&md, &w, AccessMode::ReadWrite);
		assert!(w.has_incoming());
		md.release(&r1, &t_r1, AccessMode::Read);
		assert!(w.has_incoming());
		md.release(&r2, &t_r2, AccessMode::Read);
		assert!(!w.has_incoming());
		md.release(&w, &t_w, AccessMode::ReadWrite);
		assert!(md.is_idle());
	}
}
