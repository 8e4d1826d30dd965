//! Per-frame task graph and ready list.
//!
//! Each full frame owns one [`TaskGraph`]. Ready tasks pass through a FIFO
//! or, when bucketing is enabled, a fixed-size hash-of-depth table of small
//! locked lists with a tracked occupied range, so that a worker can prefer
//! tasks close to the one it just finished. Under the ticket scheme the
//! table additionally holds the pending tasks, which are polled for
//! readiness on every scan.
//!
//! `get_ready` only ever returns tasks whose incoming count is zero and
//! whose commutative acquires succeeded; a task that fails its acquire stays
//! queued and is retried by later calls.

use std::collections::VecDeque;

#[cfg(any(
	not(any(feature = "tg-generations", feature = "tg-compact")),
	feature = "depth-buckets"
))]
use hermit_sync::OnceCell;
use hermit_sync::TicketMutex;

use crate::task::TaskRef;

#[cfg(any(
	not(any(feature = "tg-generations", feature = "tg-compact")),
	feature = "depth-buckets"
))]
const BUCKET_COUNT: usize = 2048;

/// Claim a queued task for execution.
///
/// Under the ticket scheme queued pending tasks are polled (argument
/// readiness plus acquires); under the wakeup schemes only the commutative
/// acquires remain to be taken.
#[cfg(any(
	not(any(feature = "tg-generations", feature = "tg-compact")),
	feature = "depth-buckets"
))]
fn try_take(task: &TaskRef) -> bool {
	#[cfg(not(any(feature = "tg-generations", feature = "tg-compact")))]
	{
		task.poll_ready()
	}
	#[cfg(any(feature = "tg-generations", feature = "tg-compact"))]
	{
		task.claim_acquire()
	}
}

/// Hash-of-depth table of small locked task lists.
#[cfg(any(
	not(any(feature = "tg-generations", feature = "tg-compact")),
	feature = "depth-buckets"
))]
struct DepthBuckets {
	table: Vec<TicketMutex<VecDeque<TaskRef>>>,
	/// Occupied range [min, max). Grown on insert, shrunk lazily on scan.
	bounds: TicketMutex<(usize, usize)>,
}

#[cfg(any(
	not(any(feature = "tg-generations", feature = "tg-compact")),
	feature = "depth-buckets"
))]
impl DepthBuckets {
	fn new() -> Self {
		Self {
			table: (0..BUCKET_COUNT)
				.map(|_| TicketMutex::new(VecDeque::new()))
				.collect(),
			bounds: TicketMutex::new((0, 0)),
		}
	}

	fn hash(depth: u64) -> usize {
		(depth % BUCKET_COUNT as u64) as usize
	}

	fn insert(&self, task: TaskRef) {
		let h = Self::hash(task.depth());
		self.table[h].lock().push_back(task);
		self.note_occupied(h);
	}

	fn note_occupied(&self, h: usize) {
		let mut bounds = self.bounds.lock();
		let (min, max) = *bounds;
		*bounds = if min == max {
			(h, h + 1)
		} else {
			(min.min(h), max.max(h + 1))
		};
	}

	/// Take one claimable task from bucket `h`. Unready tasks rotate to the
	/// back of their list; the bucket lock is never held across a claim.
	fn probe(&self, h: usize) -> Option<TaskRef> {
		let rounds = self.table[h].lock().len();
		for _ in 0..rounds {
			let task = self.table[h].lock().pop_front()?;
			if try_take(&task) {
				return Some(task);
			}
			self.table[h].lock().push_back(task);
			// A concurrent bounds shrink may have seen the bucket empty
			// while the task was out for its claim attempt.
			self.note_occupied(h);
		}
		None
	}

	fn shrink_bounds(&self) {
		let Some(mut bounds) = self.bounds.try_lock() else {
			return;
		};
		let (mut min, mut max) = *bounds;
		while min < max && self.table[min].lock().is_empty() {
			min += 1;
		}
		while max > min && self.table[max - 1].lock().is_empty() {
			max -= 1;
		}
		*bounds = (min, max);
	}

	fn get(&self, prev_depth: Option<u64>) -> Option<TaskRef> {
		let (min, max) = *self.bounds.lock();
		if let Some(d) = prev_depth {
			// Prefer the depth the worker just retired, then one deeper.
			let h0 = Self::hash(d);
			if h0 >= min && h0 < max {
				if let Some(task) = self.probe(h0) {
					return Some(task);
				}
			}
			let h1 = Self::hash(d + 1);
			if h1 != h0 && h1 >= min && h1 < max {
				if let Some(task) = self.probe(h1) {
					return Some(task);
				}
			}
		}
		for h in min..max {
			if let Some(task) = self.probe(h) {
				return Some(task);
			}
		}
		self.shrink_bounds();
		None
	}
}

/// The ready/pending structure of one full frame.
pub(crate) struct TaskGraph {
	#[cfg(any(
		not(any(feature = "tg-generations", feature = "tg-compact")),
		not(feature = "depth-buckets")
	))]
	ready: TicketMutex<VecDeque<TaskRef>>,
	#[cfg(any(
		not(any(feature = "tg-generations", feature = "tg-compact")),
		feature = "depth-buckets"
	))]
	buckets: OnceCell<DepthBuckets>,
}

impl TaskGraph {
	pub(crate) fn new() -> Self {
		Self {
			#[cfg(any(
				not(any(feature = "tg-generations", feature = "tg-compact")),
				not(feature = "depth-buckets")
			))]
			ready: TicketMutex::new(VecDeque::new()),
			#[cfg(any(
				not(any(feature = "tg-generations", feature = "tg-compact")),
				feature = "depth-buckets"
			))]
			buckets: OnceCell::new(),
		}
	}

	#[cfg(any(
		not(any(feature = "tg-generations", feature = "tg-compact")),
		feature = "depth-buckets"
	))]
	fn buckets(&self) -> &DepthBuckets {
		self.buckets.get_or_init(DepthBuckets::new)
	}

	#[cfg(any(
		not(any(feature = "tg-generations", feature = "tg-compact")),
		not(feature = "depth-buckets")
	))]
	fn pop_fifo(&self) -> Option<TaskRef> {
		let rounds = self.ready.lock().len();
		for _ in 0..rounds {
			let task = self.ready.lock().pop_front()?;
			if task.claim_acquire() {
				return Some(task);
			}
			self.ready.lock().push_back(task);
		}
		None
	}

	/// Deliver a task whose dependences are resolved.
	pub(crate) fn add_ready(&self, task: TaskRef) {
		#[cfg(all(
			feature = "depth-buckets",
			any(feature = "tg-generations", feature = "tg-compact")
		))]
		{
			self.buckets().insert(task);
		}
		#[cfg(not(all(
			feature = "depth-buckets",
			any(feature = "tg-generations", feature = "tg-compact")
		)))]
		{
			self.ready.lock().push_back(task);
		}
	}

	/// Park a task whose arguments are not yet ready; it will be polled by
	/// ready-list scans.
	#[cfg(not(any(feature = "tg-generations", feature = "tg-compact")))]
	pub(crate) fn push_pending(&self, task: TaskRef) {
		self.buckets().insert(task);
	}

	pub(crate) fn get_ready(&self) -> Option<TaskRef> {
		self.get_ready_at(None)
	}

	/// Depth-biased variant preferring `prev_depth` and `prev_depth + 1`.
	pub(crate) fn get_ready_after(&self, prev_depth: u64) -> Option<TaskRef> {
		self.get_ready_at(Some(prev_depth))
	}

	fn get_ready_at(&self, prev_depth: Option<u64>) -> Option<TaskRef> {
		#[cfg(not(any(feature = "tg-generations", feature = "tg-compact")))]
		{
			if let Some(task) = self.pop_fifo() {
				return Some(task);
			}
			self.buckets.get().and_then(|b| b.get(prev_depth))
		}
		#[cfg(all(
			any(feature = "tg-generations", feature = "tg-compact"),
			feature = "depth-buckets"
		))]
		{
			self.buckets.get().and_then(|b| b.get(prev_depth))
		}
		#[cfg(all(
			any(feature = "tg-generations", feature = "tg-compact"),
			not(feature = "depth-buckets")
		))]
		{
			let _ = prev_depth;
			self.pop_fifo()
		}
	}
}
