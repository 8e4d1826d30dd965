//! The per-task dependence record.
//!
//! Every spawned task is one [`Task`]: the back-pointer into its enclosing
//! frame's graph, the atomic incoming-edge counter, its depth in the spawn
//! tree and the boxed body (the typed argument tuple plus the closure). The
//! argument tags live inside the tuple, so the body is also the argument
//! walker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use hermit_sync::SpinMutex;

use crate::scheduler::Frame;

pub(crate) type TaskRef = Arc<Task>;

/// Type-erased argument walker and body of one task.
///
/// Implemented once, generically over the argument tuple; the scheduler only
/// drives the five walker operations and the invocation.
pub(crate) trait TaskBody: Send {
	/// Fast path: can the task run right now without entering the graph?
	/// Commutative acquires taken here are kept on success and unwound in
	/// reverse order on failure.
	fn ini_ready(&mut self) -> bool;
	/// Register every argument with its object, in declaration order.
	fn issue(&mut self, task: &TaskRef);
	/// The task's spawn-tree depth, one past its deepest tracked argument.
	fn scan_depth(&mut self) -> u64;
	/// Poll every argument's readiness (no acquires).
	fn ready(&mut self) -> bool;
	/// Take the commutative acquires; rolls back on failure.
	fn acquire(&mut self) -> bool;
	/// Pre-execution step: pending reduction finalization and reduction
	/// privatization for the executing worker.
	fn prepare(&mut self, worker: usize);
	/// Run the task's closure.
	fn invoke(&mut self);
	/// Retire every argument, pairing the issue above.
	fn release(&mut self, task: &TaskRef);
}

pub(crate) struct Task {
	/// Graph of the frame this task was spawned into; `None` only for
	/// detached records in unit tests.
	frame: Option<Arc<Frame>>,
	/// Unresolved dependences. Held at one during registration so that a
	/// concurrent release cannot wake the task before all arguments are
	/// issued.
	incoming: AtomicU32,
	depth: AtomicU64,
	/// Commutative acquires are already held (fast-path spawn or a
	/// successful readiness poll).
	acquired: AtomicBool,
	done: AtomicBool,
	body: SpinMutex<Option<Box<dyn TaskBody>>>,
}

impl Task {
	pub(crate) fn new(frame: Arc<Frame>, body: Box<dyn TaskBody>) -> TaskRef {
		Arc::new(Self {
			frame: Some(frame),
			incoming: AtomicU32::new(1),
			depth: AtomicU64::new(0),
			acquired: AtomicBool::new(false),
			done: AtomicBool::new(false),
			body: SpinMutex::new(Some(body)),
		})
	}

	/// A record without frame or body, for metadata unit tests.
	#[cfg(test)]
	pub(crate) fn detached() -> TaskRef {
		Arc::new(Self {
			frame: None,
			incoming: AtomicU32::new(0),
			depth: AtomicU64::new(0),
			acquired: AtomicBool::new(false),
			done: AtomicBool::new(false),
			body: SpinMutex::new(None),
		})
	}

	pub(crate) fn frame(&self) -> &Arc<Frame> {
		self.frame.as_ref().expect("task without a frame")
	}

	pub(crate) fn depth(&self) -> u64 {
		self.depth.load(Ordering::Relaxed)
	}

	pub(crate) fn set_depth(&self, d: u64) {
		self.depth.store(d, Ordering::Relaxed);
	}

	#[cfg(any(feature = "tg-generations", feature = "tg-compact"))]
	pub(crate) fn add_incoming(&self, n: u32) {
		self.incoming.fetch_add(n, Ordering::AcqRel);
	}

	/// Resolve one dependence; true when it was the last one.
	pub(crate) fn del_incoming(&self) -> bool {
		let prev = self.incoming.fetch_sub(1, Ordering::AcqRel);
		assert!(prev > 0, "incoming-edge counter underflow");
		prev == 1
	}

	#[cfg(test)]
	pub(crate) fn has_incoming(&self) -> bool {
		self.incoming.load(Ordering::Acquire) > 0
	}

	/// A dependence was resolved by a completing predecessor; transition to
	/// the ready list once the last one is gone.
	#[cfg(any(feature = "tg-generations", feature = "tg-compact"))]
	pub(crate) fn wake(self: &Arc<Self>) {
		if self.del_incoming() {
			self.make_ready();
		}
	}

	#[cfg(any(feature = "tg-generations", feature = "tg-compact"))]
	pub(crate) fn make_ready(self: &Arc<Self>) {
		crate::stats::count(crate::stats::Counter::Wakeups);
		if let Some(frame) = &self.frame {
			trace!("task {:p} ready at depth {}", &**self, self.depth());
			frame.graph().add_ready(self.clone());
		}
	}

	pub(crate) fn is_acquired(&self) -> bool {
		self.acquired.load(Ordering::Acquire)
	}

	pub(crate) fn set_acquired(&self) {
		self.acquired.store(true, Ordering::Release);
	}

	pub(crate) fn is_done(&self) -> bool {
		self.done.load(Ordering::Acquire)
	}

	pub(crate) fn set_done(&self) {
		self.done.store(true, Ordering::Release);
	}

	pub(crate) fn take_body(&self) -> Option<Box<dyn TaskBody>> {
		self.body.lock().take()
	}

	pub(crate) fn with_body<R>(&self, f: impl FnOnce(&mut dyn TaskBody) -> R) -> R {
		let mut guard = self.body.lock();
		f(guard.as_mut().expect("task body missing").as_mut())
	}

	/// Poll a pending task: all incoming edges resolved, every argument
	/// ready, and the commutative acquires taken.
	#[cfg(not(any(feature = "tg-generations", feature = "tg-compact")))]
	pub(crate) fn poll_ready(self: &Arc<Self>) -> bool {
		if self.incoming.load(Ordering::Acquire) != 0 {
			return false;
		}
		let mut guard = self.body.lock();
		let body = guard.as_mut().expect("polling an executed task");
		if !body.ready() || !body.acquire() {
			return false;
		}
		drop(guard);
		self.set_acquired();
		true
	}

	/// Take the commutative acquires of a woken task at ready-list pop.
	pub(crate) fn claim_acquire(self: &Arc<Self>) -> bool {
		if self.is_acquired() {
			return true;
		}
		let mut guard = self.body.lock();
		let body = guard.as_mut().expect("claiming an executed task");
		if !body.acquire() {
			return false;
		}
		drop(guard);
		self.set_acquired();
		true
	}
}
