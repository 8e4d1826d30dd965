//! Reduction arguments: privatization and finalization.
//!
//! A reduction argument carries a monoid. Tasks of one reduction episode run
//! in parallel, each mutating a per-worker private copy reserved from the
//! version's reduction map; before the next non-reduction user observes the
//! object the private copies are merged back into the master. Cheap monoids
//! merge with a serial fold; expensive monoids merge with a spawned tree of
//! pair-reduce tasks at the enclosing sync.

use std::sync::atomic::{AtomicU8, Ordering};

use crossbeam_utils::CachePadded;
use hermit_sync::SpinMutex;

use crate::dep::{DepArg, InOutDep};
use crate::meta::{AccessMode, DepTag, TryLock};
use crate::object::Versioned;
use crate::task::TaskRef;
use crate::version::{Version, VersionRef};

/// The merge rule of a reduction argument.
pub trait Monoid: Send + Sync + 'static {
	type Value: Clone + Send + 'static;

	/// Expensive monoids are merged by a spawned tree of pair-reduce tasks
	/// instead of a serial fold.
	const EXPENSIVE: bool = false;

	fn identity() -> Self::Value;

	/// Merge `from` into `into`. `from` may be left in any state.
	fn reduce(into: &mut Self::Value, from: &mut Self::Value);
}

const UNINIT: u8 = 0;
const ACTIVE: u8 = 1;
const REDUCED: u8 = 2;

struct ReduceFns<T> {
	reduce: fn(&mut T, &mut T),
	identity: fn() -> T,
}

impl<T> Copy for ReduceFns<T> {}

impl<T> Clone for ReduceFns<T> {
	fn clone(&self) -> Self {
		*self
	}
}

struct Slot<T> {
	reserved: TryLock,
	version: SpinMutex<Option<VersionRef<T>>>,
}

/// Per-version reduction bookkeeping: one private slot per worker plus the
/// episode state machine (uninit → active → reduced; a later episode
/// re-activates).
pub(crate) struct ReductionMap<T> {
	slots: Box<[CachePadded<Slot<T>>]>,
	state: AtomicU8,
	lock: SpinMutex<()>,
	fns: SpinMutex<Option<ReduceFns<T>>>,
}

impl<T: Send + 'static> ReductionMap<T> {
	pub(crate) fn new(workers: usize) -> Self {
		let slots = (0..workers.max(1))
			.map(|_| {
				CachePadded::new(Slot {
					reserved: TryLock::new(),
					version: SpinMutex::new(None),
				})
			})
			.collect();
		Self {
			slots,
			state: AtomicU8::new(UNINIT),
			lock: SpinMutex::new(()),
			fns: SpinMutex::new(None),
		}
	}

	/// Activate the map for an episode. Returns true when this issue opened
	/// the episode, in which case the caller registers the finalizer.
	fn begin_episode(&self, fns: ReduceFns<T>) -> bool {
		let _guard = self.lock.lock();
		*self.fns.lock() = Some(fns);
		let was = self.state.swap(ACTIVE, Ordering::AcqRel);
		was != ACTIVE
	}

	/// Reserve a private copy, preferring the executing worker's slot and
	/// falling back to a scan. Slots are created lazily with the identity
	/// value.
	fn enter(&self, worker: usize) -> (VersionRef<T>, usize) {
		let n = self.slots.len();
		for probe in 0..n {
			let idx = (worker + probe) % n;
			let slot = &self.slots[idx];
			if slot.reserved.try_lock() {
				let mut version = slot.version.lock();
				let v = version
					.get_or_insert_with(|| {
						let fns = (*self.fns.lock()).expect("reduction map without monoid");
						Version::create((fns.identity)(), false)
					})
					.clone();
				return (v, idx);
			}
		}
		// At most one executing task per worker holds a slot of this map.
		unreachable!("no free reduction slot");
	}

	fn leave(&self, idx: usize) {
		self.slots[idx].reserved.unlock();
	}

	/// Close the episode, handing back every touched private copy. At most
	/// one caller per episode gets the copies; everyone else sees `None`.
	fn close_episode(&self) -> Option<(Vec<VersionRef<T>>, ReduceFns<T>)> {
		if self.state.load(Ordering::Acquire) != ACTIVE {
			return None;
		}
		let _guard = self.lock.lock();
		if self.state.load(Ordering::Acquire) != ACTIVE {
			return None;
		}
		let touched = self
			.slots
			.iter()
			.filter_map(|slot| slot.version.lock().take())
			.collect();
		self.state.store(REDUCED, Ordering::Release);
		crate::stats::count(crate::stats::Counter::Finalizations);
		let fns = (*self.fns.lock()).expect("reduction map without monoid");
		Some((touched, fns))
	}

	/// Serial fold of the touched copies into `master`, used for cheap
	/// monoids and as the fallback whenever a reader becomes ready before
	/// the enclosing sync expands the episode.
	pub(crate) fn finalize_into(&self, master: &Version<T>) {
		if let Some((touched, fns)) = self.close_episode() {
			debug!("reducing {} private copies", touched.len());
			for v in &touched {
				unsafe {
					(fns.reduce)(master.value_mut(), v.value_mut());
				}
			}
		}
	}
}

/// Finalize an episode at sync time. Expensive monoids expand into a binary
/// tree of pair-reduce tasks whose root writes the master; the tree is
/// ordered against later users by the ordinary dependence rules.
fn finalize_episode<M: Monoid>(master: VersionRef<M::Value>) {
	let map = master.reduction().expect("finalizing without reduction map");
	let Some((touched, _)) = map.close_episode() else {
		return;
	};
	if !M::EXPENSIVE || touched.len() <= 1 || !crate::scheduler::in_task_context() {
		debug!("reducing {} private copies", touched.len());
		for v in &touched {
			unsafe {
				M::reduce(master.value_mut(), v.value_mut());
			}
		}
		return;
	}
	// Pair off copies level by level, then fold the last survivor into the
	// master under a serializing read-write dependence.
	let mut level = touched;
	while level.len() > 1 {
		let mut next = Vec::with_capacity(level.len().div_ceil(2));
		let mut iter = level.into_iter();
		while let Some(a) = iter.next() {
			match iter.next() {
				Some(b) => {
					crate::scheduler::spawn(
						(
							InOutDep::from_version(a.clone()),
							InOutDep::from_version(b),
						),
						|(mut a, mut b)| M::reduce(&mut *a, &mut *b),
					);
					next.push(a);
				}
				None => next.push(a),
			}
		}
		level = next;
	}
	let last = level.pop().unwrap();
	crate::scheduler::spawn(
		(
			InOutDep::from_version(master.clone()),
			InOutDep::from_version(last),
		),
		|(mut m, mut s)| M::reduce(&mut *m, &mut *s),
	);
}

/// A reduction argument over a monoid `M`.
pub struct Reduction<M: Monoid> {
	version: VersionRef<M::Value>,
	private: Option<VersionRef<M::Value>>,
	slot: usize,
	tag: DepTag,
}

/// Borrow `src` for reduction under the monoid `M`.
pub fn reduction<M: Monoid, S: Versioned<M::Value>>(src: &S) -> Reduction<M> {
	Reduction {
		version: src.current(),
		private: None,
		slot: 0,
		tag: DepTag::default(),
	}
}

impl<M: Monoid> Reduction<M> {
	fn private(&self) -> &VersionRef<M::Value> {
		self.private.as_ref().expect("reduction argument not privatized")
	}
}

impl<M: Monoid> std::ops::Deref for Reduction<M> {
	type Target = M::Value;

	fn deref(&self) -> &M::Value {
		unsafe { self.private().value() }
	}
}

impl<M: Monoid> std::ops::DerefMut for Reduction<M> {
	fn deref_mut(&mut self) -> &mut M::Value {
		unsafe { self.private().value_mut() }
	}
}

impl<M: Monoid> Clone for Reduction<M> {
	fn clone(&self) -> Self {
		Self {
			version: self.version.clone(),
			private: self.private.clone(),
			slot: self.slot,
			tag: self.tag.clone(),
		}
	}
}

impl<M: Monoid> DepArg for Reduction<M> {
	fn ini_ready(&mut self) -> bool {
		self.version.deps().match_group(AccessMode::Reduction)
	}

	fn ini_undo(&mut self) {}

	fn issue(&mut self, task: &TaskRef) {
		let workers = task.frame().workers();
		let map = self.version.reduction_or_init(workers);
		let fns = ReduceFns {
			reduce: M::reduce,
			identity: M::identity,
		};
		if map.begin_episode(fns) {
			let master = self.version.clone();
			task.frame()
				.add_finalizer(Box::new(move || finalize_episode::<M>(master)));
		}
		let deps = self.version.deps();
		deps.issue(task, &mut self.tag, AccessMode::Reduction);
		deps.update_depth(task.depth());
		crate::stats::count(crate::stats::Counter::Issues);
	}

	fn depth_of(&self) -> Option<u64> {
		Some(self.version.deps().depth())
	}

	fn ready(&self) -> bool {
		self.version.deps().ready(&self.tag, AccessMode::Reduction)
	}

	fn try_acquire(&mut self) -> bool {
		true
	}

	fn unacquire(&mut self) {}

	fn prepare(&mut self, worker: usize) {
		let map = self
			.version
			.reduction()
			.expect("reduction argument issued without map");
		let (v, idx) = map.enter(worker);
		self.private = Some(v);
		self.slot = idx;
	}

	fn release(&mut self, task: &TaskRef) {
		let map = self
			.version
			.reduction()
			.expect("reduction argument released without map");
		map.leave(self.slot);
		self.private = None;
		self.version.deps().release(task, &self.tag, AccessMode::Reduction);
	}
}
