//! Hyperqueues: one-producer/one-consumer queues with split access modes.
//!
//! The queue body is a list of producer chains, each a FIFO of fixed-size
//! segments. A producer task reserves its chain position when its `pushdep`
//! argument is issued (i.e. in spawn program order), appends privately while
//! running, and seals the chain at release — the per-task hypermap view and
//! its reduction into the parent collapse into that seal. Pops are fully
//! serialized against each other through a ticket pair; a pop that catches
//! up with a still-producing segment spins briefly and yields, it never
//! blocks on a condition variable.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;
use hermit_sync::SpinMutex;

use crate::dep::DepArg;
use crate::task::TaskRef;

const SEGMENT_CAP: usize = 256;

const PRODUCING: u8 = 0;
const FULL: u8 = 1;
const CONSUMED: u8 = 2;

/// One fixed-size block of queue slots. State moves one way:
/// producing → full → consumed; only the producing task writes, only the
/// consuming task reads.
struct Segment<T> {
	buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
	/// Slots initialized by the producer.
	filled: AtomicUsize,
	/// Slots moved out by the consumer.
	taken: AtomicUsize,
	state: AtomicU8,
}

unsafe impl<T: Send> Send for Segment<T> {}
unsafe impl<T: Send> Sync for Segment<T> {}

impl<T> Segment<T> {
	fn new() -> Self {
		Self {
			buf: (0..SEGMENT_CAP)
				.map(|_| UnsafeCell::new(MaybeUninit::uninit()))
				.collect(),
			filled: AtomicUsize::new(0),
			taken: AtomicUsize::new(0),
			state: AtomicU8::new(PRODUCING),
		}
	}
}

impl<T> Drop for Segment<T> {
	fn drop(&mut self) {
		// Unpopped items still own their values.
		let filled = self.filled.load(Ordering::Acquire);
		let taken = self.taken.load(Ordering::Acquire);
		for slot in &mut self.buf[taken..filled] {
			unsafe {
				slot.get_mut().assume_init_drop();
			}
		}
	}
}

/// The private view of one producer task.
struct Chain<T> {
	segments: SpinMutex<VecDeque<Arc<Segment<T>>>>,
	sealed: AtomicBool,
}

impl<T: Send> Chain<T> {
	fn new() -> Arc<Self> {
		Arc::new(Self {
			segments: SpinMutex::new(VecDeque::new()),
			sealed: AtomicBool::new(false),
		})
	}

	fn push(&self, value: T) {
		let mut segments = self.segments.lock();
		let start_new = match segments.back() {
			None => true,
			Some(seg) => seg.filled.load(Ordering::Relaxed) == SEGMENT_CAP,
		};
		if start_new {
			if let Some(last) = segments.back() {
				last.state.store(FULL, Ordering::Release);
			}
			segments.push_back(Arc::new(Segment::new()));
		}
		let seg = segments.back().unwrap();
		let idx = seg.filled.load(Ordering::Relaxed);
		unsafe {
			(*seg.buf[idx].get()).write(value);
		}
		seg.filled.store(idx + 1, Ordering::Release);
	}

	fn seal(&self) {
		self.sealed.store(true, Ordering::Release);
	}

	fn is_sealed(&self) -> bool {
		self.sealed.load(Ordering::Acquire)
	}
}

struct QueueInner<T> {
	/// Producer chains in spawn program order.
	chains: SpinMutex<VecDeque<Arc<Chain<T>>>>,
	/// Pop-ordering tickets: pops are fully serialized with other pops.
	pops: crate::meta::FifoPair,
	/// Pop tasks waiting for their ticket, under the wakeup schemes.
	#[cfg(any(feature = "tg-generations", feature = "tg-compact"))]
	waiters: SpinMutex<Vec<(TaskRef, u32)>>,
}

impl<T: Send + 'static> QueueInner<T> {
	/// Move the next item out, in push order. Spins (yielding) while the
	/// head segment is still producing.
	fn pop(&self) -> T {
		let backoff = Backoff::new();
		loop {
			let chain = self.chains.lock().front().cloned();
			let Some(chain) = chain else {
				backoff.snooze();
				continue;
			};
			let seg = chain.segments.lock().front().cloned();
			match seg {
				Some(seg) => {
					let taken = seg.taken.load(Ordering::Relaxed);
					let filled = seg.filled.load(Ordering::Acquire);
					if taken < filled {
						let value = unsafe { (*seg.buf[taken].get()).assume_init_read() };
						seg.taken.store(taken + 1, Ordering::Release);
						if taken + 1 == SEGMENT_CAP {
							seg.state.store(CONSUMED, Ordering::Release);
							chain.segments.lock().pop_front();
						}
						backoff.reset();
						return value;
					}
					if chain.is_sealed() && taken == seg.filled.load(Ordering::Acquire) {
						// Trailing segment of a finished producer.
						seg.state.store(CONSUMED, Ordering::Release);
						let mut segments = chain.segments.lock();
						if segments
							.front()
							.is_some_and(|front| Arc::ptr_eq(front, &seg))
						{
							segments.pop_front();
						}
						if segments.is_empty() {
							drop(segments);
							self.drop_chain(&chain);
						}
						continue;
					}
					backoff.snooze();
				}
				None => {
					if chain.is_sealed() {
						self.drop_chain(&chain);
						continue;
					}
					backoff.snooze();
				}
			}
		}
	}

	fn drop_chain(&self, chain: &Arc<Chain<T>>) {
		let mut chains = self.chains.lock();
		if chains.front().is_some_and(|front| Arc::ptr_eq(front, chain)) {
			chains.pop_front();
		}
	}

	/// Is an item available right now?
	fn available(&self) -> bool {
		let chains = self.chains.lock();
		for chain in chains.iter() {
			let segments = chain.segments.lock();
			for seg in segments.iter() {
				if seg.taken.load(Ordering::Relaxed) < seg.filled.load(Ordering::Acquire) {
					return true;
				}
			}
		}
		false
	}
}

/// A hyperqueue handle.
pub struct Queue<T: Send + 'static> {
	inner: Arc<QueueInner<T>>,
}

impl<T: Send + 'static> Queue<T> {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(QueueInner {
				chains: SpinMutex::new(VecDeque::new()),
				pops: crate::meta::FifoPair::new(),
				#[cfg(any(feature = "tg-generations", feature = "tg-compact"))]
				waiters: SpinMutex::new(Vec::new()),
			}),
		}
	}
}

impl<T: Send + 'static> Clone for Queue<T> {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
		}
	}
}

/// A producer argument: push items into the queue, in program order with
/// respect to other producers. Carries no inter-task dependence.
pub struct PushDep<T: Send + 'static> {
	queue: Arc<QueueInner<T>>,
	chain: Option<Arc<Chain<T>>>,
}

/// Borrow `q` for pushing.
pub fn pushdep<T: Send + 'static>(q: &Queue<T>) -> PushDep<T> {
	PushDep {
		queue: q.inner.clone(),
		chain: None,
	}
}

impl<T: Send + 'static> PushDep<T> {
	pub fn push(&self, value: T) {
		let chain = self.chain.as_ref().expect("push on an unissued queue argument");
		chain.push(value);
	}
}

impl<T: Send + 'static> Clone for PushDep<T> {
	fn clone(&self) -> Self {
		Self {
			queue: self.queue.clone(),
			chain: self.chain.clone(),
		}
	}
}

impl<T: Send + 'static> DepArg for PushDep<T> {
	fn ini_ready(&mut self) -> bool {
		true
	}

	fn ini_undo(&mut self) {}

	fn issue(&mut self, _task: &TaskRef) {
		// Reserve the chain position now: spawn order fixes item order.
		let chain = Chain::new();
		self.queue.chains.lock().push_back(chain.clone());
		self.chain = Some(chain);
		crate::stats::count(crate::stats::Counter::Issues);
	}

	fn depth_of(&self) -> Option<u64> {
		None
	}

	fn ready(&self) -> bool {
		true
	}

	fn try_acquire(&mut self) -> bool {
		true
	}

	fn unacquire(&mut self) {}

	fn prepare(&mut self, _worker: usize) {}

	fn release(&mut self, _task: &TaskRef) {
		self.chain
			.as_ref()
			.expect("releasing an unissued queue argument")
			.seal();
	}
}

/// A consumer argument: pop items in push order. Pops are fully serialized
/// with other pops of the same queue.
pub struct PopDep<T: Send + 'static> {
	queue: Arc<QueueInner<T>>,
	ticket: u32,
}

/// Borrow `q` for popping.
pub fn popdep<T: Send + 'static>(q: &Queue<T>) -> PopDep<T> {
	PopDep {
		queue: q.inner.clone(),
		ticket: 0,
	}
}

impl<T: Send + 'static> PopDep<T> {
	pub fn pop(&self) -> T {
		self.queue.pop()
	}

	/// No item is currently available. Producers still running may push
	/// more.
	pub fn empty(&self) -> bool {
		!self.queue.available()
	}
}

impl<T: Send + 'static> Clone for PopDep<T> {
	fn clone(&self) -> Self {
		Self {
			queue: self.queue.clone(),
			ticket: self.ticket,
		}
	}
}

impl<T: Send + 'static> DepArg for PopDep<T> {
	fn ini_ready(&mut self) -> bool {
		self.queue.pops.empty()
	}

	fn ini_undo(&mut self) {}

	fn issue(&mut self, _task: &TaskRef) {
		#[cfg(any(feature = "tg-generations", feature = "tg-compact"))]
		{
			let mut waiters = self.queue.waiters.lock();
			self.ticket = self.queue.pops.get_tag();
			self.queue.pops.adv_tail();
			if !self.queue.pops.chk_tag(self.ticket) {
				waiters.push((_task.clone(), self.ticket));
				_task.add_incoming(1);
			}
		}
		#[cfg(not(any(feature = "tg-generations", feature = "tg-compact")))]
		{
			self.ticket = self.queue.pops.get_tag();
			self.queue.pops.adv_tail();
		}
		crate::stats::count(crate::stats::Counter::Issues);
	}

	fn depth_of(&self) -> Option<u64> {
		None
	}

	fn ready(&self) -> bool {
		self.queue.pops.chk_tag(self.ticket)
	}

	fn try_acquire(&mut self) -> bool {
		true
	}

	fn unacquire(&mut self) {}

	fn prepare(&mut self, _worker: usize) {}

	fn release(&mut self, _task: &TaskRef) {
		#[cfg(any(feature = "tg-generations", feature = "tg-compact"))]
		{
			let mut waiters = self.queue.waiters.lock();
			self.queue.pops.adv_head();
			let next = self.queue.pops.counts().0;
			if let Some(pos) = waiters.iter().position(|(_, t)| *t == next) {
				let (task, _) = waiters.swap_remove(pos);
				drop(waiters);
				task.wake();
			}
		}
		#[cfg(not(any(feature = "tg-generations", feature = "tg-compact")))]
		self.queue.pops.adv_head();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn segments_hand_over_in_order() {
		let chain = Chain::new();
		let n = SEGMENT_CAP * 2 + 7;
		for i in 0..n {
			chain.push(i);
		}
		chain.seal();
		assert_eq!(chain.segments.lock().len(), 3);
		assert_eq!(
			chain.segments.lock()[0].state.load(Ordering::Relaxed),
			FULL
		);
		assert_eq!(
			chain.segments.lock()[2].state.load(Ordering::Relaxed),
			PRODUCING
		);
	}

	#[test]
	fn pop_follows_push_order_across_chains() {
		let q = Queue::new();
		let mut first = pushdep(&q);
		let mut second = pushdep(&q);
		let task = crate::task::Task::detached();
		first.issue(&task);
		second.issue(&task);
		second.push(10);
		first.push(1);
		first.push(2);
		first.release(&task);
		second.release(&task);
		let pop = popdep(&q);
		assert_eq!(pop.pop(), 1);
		assert_eq!(pop.pop(), 2);
		assert_eq!(pop.pop(), 10);
		assert!(pop.empty());
	}

	#[test]
	fn dropped_queue_drops_unpopped_items() {
		use std::sync::atomic::AtomicUsize;
		static DROPS: AtomicUsize = AtomicUsize::new(0);
		struct Probe;
		impl Drop for Probe {
			fn drop(&mut self) {
				DROPS.fetch_add(1, Ordering::SeqCst);
			}
		}
		DROPS.store(0, Ordering::SeqCst);
		{
			let q = Queue::new();
			let mut producer = pushdep(&q);
			let task = crate::task::Task::detached();
			producer.issue(&task);
			producer.push(Probe);
			producer.push(Probe);
			producer.release(&task);
			let consumer = popdep(&q);
			drop(consumer.pop());
		}
		assert_eq!(DROPS.load(Ordering::SeqCst), 2);
	}
}
