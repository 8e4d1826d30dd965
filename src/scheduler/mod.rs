//! Worker pool, frames and the task-spawning surface.
//!
//! Every worker is one OS thread looping over: pop a ready task from the
//! frame it is helping, steal from another frame's graph, back off. Task
//! execution is blocking; the only suspension point is [`ssync`], where the
//! waiting worker keeps executing other ready tasks. Spawning is
//! non-blocking: the task is registered with its arguments' objects and
//! enqueued, and `spawn` returns.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_utils::Backoff;
use hermit_sync::SpinMutex;
use thiserror::Error;

use crate::dep::{self, BodyImpl, DepList};
use crate::graph::TaskGraph;
use crate::task::{Task, TaskRef};

/// Errors from runtime construction.
#[derive(Debug, Error)]
pub enum BuildError {
	#[error("worker count must be non-zero")]
	NoWorkers,
}

struct RtInner {
	/// Every live frame with a graph, for stealing.
	frames: SpinMutex<Vec<Weak<Frame>>>,
	shutdown: AtomicBool,
	workers: usize,
}

/// A full frame: a task that spawned children and therefore owns a graph.
///
/// Created lazily on the first spawn of a task, retired when the task has
/// synced all of its children.
pub(crate) struct Frame {
	rt: Arc<RtInner>,
	graph: TaskGraph,
	children: AtomicUsize,
	/// Reduction episodes to close at the next sync.
	finalizers: SpinMutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Frame {
	fn new(rt: Arc<RtInner>) -> Arc<Frame> {
		let frame = Arc::new(Frame {
			rt: rt.clone(),
			graph: TaskGraph::new(),
			children: AtomicUsize::new(0),
			finalizers: SpinMutex::new(Vec::new()),
		});
		rt.frames.lock().push(Arc::downgrade(&frame));
		trace!("frame {:p} created", &*frame);
		frame
	}

	pub(crate) fn graph(&self) -> &TaskGraph {
		&self.graph
	}

	pub(crate) fn workers(&self) -> usize {
		self.rt.workers
	}

	#[cfg(feature = "reduction")]
	pub(crate) fn add_finalizer(&self, f: Box<dyn FnOnce() + Send>) {
		self.finalizers.lock().push(f);
	}

	fn add_child(&self) {
		self.children.fetch_add(1, Ordering::AcqRel);
	}

	pub(crate) fn child_done(&self) {
		let prev = self.children.fetch_sub(1, Ordering::AcqRel);
		assert!(prev > 0, "child-counter underflow");
	}

	fn children(&self) -> usize {
		self.children.load(Ordering::Acquire)
	}

	fn take_finalizers(&self) -> Vec<Box<dyn FnOnce() + Send>> {
		std::mem::take(&mut *self.finalizers.lock())
	}

	/// Drop the frame from the steal registry, purging dead entries.
	fn retire(self: &Arc<Self>) {
		trace!("frame {:p} retired", &**self);
		let me = Arc::as_ptr(self);
		self.rt
			.frames
			.lock()
			.retain(|w| w.as_ptr() != me && w.strong_count() > 0);
	}
}

struct WorkerCtx {
	rt: Arc<RtInner>,
	id: usize,
	/// Depth of the last task this worker retired, feeding the
	/// depth-biased ready-list lookups.
	last_depth: Cell<u64>,
}

/// One scope per task currently executing on this thread; `frame` appears
/// once the task first spawns.
struct TaskScope {
	frame: Option<Arc<Frame>>,
}

thread_local! {
	static WORKER: RefCell<Option<WorkerCtx>> = const { RefCell::new(None) };
	static SCOPES: RefCell<Vec<TaskScope>> = const { RefCell::new(Vec::new()) };
}

fn with_worker<R>(f: impl FnOnce(&WorkerCtx) -> R) -> R {
	WORKER.with(|w| {
		let borrow = w.borrow();
		let ctx = borrow.as_ref().expect("not on a runtime worker thread");
		f(ctx)
	})
}

#[cfg(feature = "reduction")]
pub(crate) fn in_task_context() -> bool {
	SCOPES.with(|s| !s.borrow().is_empty())
}

fn current_frame() -> Option<Arc<Frame>> {
	SCOPES.with(|s| s.borrow().last().and_then(|scope| scope.frame.clone()))
}

fn ensure_current_frame() -> Arc<Frame> {
	SCOPES.with(|s| {
		let mut scopes = s.borrow_mut();
		let scope = scopes.last_mut().expect("spawn() outside of a task");
		if scope.frame.is_none() {
			let rt = with_worker(|w| w.rt.clone());
			scope.frame = Some(Frame::new(rt));
		}
		scope.frame.clone().unwrap()
	})
}

/// Walk the task's arguments: depth scan, fast-path check, issue. Returns
/// whether the task may run right now.
fn register(task: &TaskRef) -> bool {
	let fast = task.with_body(|body| {
		let depth = body.scan_depth();
		task.set_depth(depth);
		let fast = body.ini_ready();
		body.issue(task);
		fast
	});
	if fast {
		task.set_acquired();
		crate::stats::count(crate::stats::Counter::FastSpawns);
	}
	// Drop the registration guard; only now may wakeups deliver the task.
	let zero = task.del_incoming();
	#[cfg(not(any(feature = "tg-generations", feature = "tg-compact")))]
	{
		let _ = zero;
		fast
	}
	#[cfg(any(feature = "tg-generations", feature = "tg-compact"))]
	{
		fast || zero
	}
}

fn spawn_into<A, F>(frame: &Arc<Frame>, args: A, f: F) -> TaskRef
where
	A: DepList,
	F: FnOnce(A) + Send + 'static,
{
	frame.add_child();
	let task = Task::new(frame.clone(), Box::new(BodyImpl::new(args, f)));
	let ready = register(&task);
	debug!(
		"spawning task {:p} at depth {} ({})",
		&*task,
		task.depth(),
		if ready { "ready" } else { "pending" }
	);
	if ready {
		frame.graph().add_ready(task.clone());
	}
	#[cfg(not(any(feature = "tg-generations", feature = "tg-compact")))]
	if !ready {
		frame.graph().push_pending(task.clone());
	}
	task
}

/// Spawn a task under the current frame. Non-blocking; the arguments'
/// access modes decide when the task becomes ready.
pub fn spawn<A, F>(args: A, f: F)
where
	A: DepList,
	F: FnOnce(A) + Send + 'static,
{
	let frame = ensure_current_frame();
	spawn_into(&frame, args, f);
}

/// Synchronous variant of [`spawn`]: runs the task immediately when its
/// arguments are ready, otherwise helps with other work until it has run.
pub fn call<A, F>(args: A, f: F)
where
	A: DepList,
	F: FnOnce(A) + Send + 'static,
{
	let frame = ensure_current_frame();
	frame.add_child();
	let task = Task::new(frame.clone(), Box::new(BodyImpl::new(args, f)));
	let ready = register(&task);
	if ready && task.claim_acquire() {
		execute(task);
		return;
	}
	if ready {
		frame.graph().add_ready(task.clone());
	}
	#[cfg(not(any(feature = "tg-generations", feature = "tg-compact")))]
	if !ready {
		frame.graph().push_pending(task.clone());
	}
	let backoff = Backoff::new();
	while !task.is_done() {
		if !help_once(&frame) {
			backoff.snooze();
		}
	}
}

/// Call `f` directly, asserting that no argument declares a dependence.
pub fn leaf_call<A: DepList, R>(mut args: A, f: impl FnOnce(A) -> R) -> R {
	assert!(
		!dep::has_objects(&mut args),
		"leaf_call() with dependence-carrying arguments"
	);
	f(args)
}

/// Wait until every child of the current task has completed.
///
/// The waiting worker executes other ready tasks instead of blocking, and
/// pending reduction episodes are finalized before `ssync` returns.
pub fn ssync() {
	let Some(frame) = current_frame() else {
		// Nothing spawned from this task yet.
		return;
	};
	sync_frame(&frame);
}

fn sync_frame(frame: &Arc<Frame>) {
	loop {
		let backoff = Backoff::new();
		while frame.children() > 0 {
			if help_once(frame) {
				backoff.reset();
			} else if backoff.is_completed() {
				thread::yield_now();
			} else {
				backoff.snooze();
			}
		}
		let finalizers = frame.take_finalizers();
		if finalizers.is_empty() {
			break;
		}
		debug!("sync: running {} reduction finalizers", finalizers.len());
		for finalize in finalizers {
			finalize();
		}
	}
}

/// Execute one ready task from `frame` or steal one; false when idle.
fn help_once(frame: &Arc<Frame>) -> bool {
	let prev_depth = with_worker(|w| w.last_depth.get());
	if let Some(task) = frame.graph().get_ready_after(prev_depth) {
		execute(task);
		return true;
	}
	if let Some(task) = steal(&frame.rt) {
		execute(task);
		return true;
	}
	false
}

fn execute(task: TaskRef) {
	let worker = with_worker(|w| w.id);
	let mut body = task.take_body().expect("executing a task without a body");
	// Pending finalizations and reduction privatization happen between
	// leaving the ready list and running the body.
	body.prepare(worker);
	SCOPES.with(|s| s.borrow_mut().push(TaskScope { frame: None }));
	body.invoke();
	let scope = SCOPES.with(|s| s.borrow_mut().pop()).expect("scope stack unbalanced");
	if let Some(child_frame) = scope.frame {
		// A task retires only after all of its children have.
		sync_frame(&child_frame);
		child_frame.retire();
	}
	body.release(&task);
	drop(body);
	task.set_done();
	task.frame().child_done();
	with_worker(|w| w.last_depth.set(task.depth()));
}

fn steal(rt: &Arc<RtInner>) -> Option<TaskRef> {
	let len = rt.frames.lock().len();
	if len == 0 {
		return None;
	}
	let start = with_worker(|w| w.id) % len;
	for off in 0..len {
		let idx = (start + off) % len;
		let weak = rt.frames.lock().get(idx).cloned();
		let Some(weak) = weak else { continue };
		if let Some(frame) = weak.upgrade() {
			if let Some(task) = frame.graph().get_ready() {
				crate::stats::count(crate::stats::Counter::Steals);
				return Some(task);
			}
		}
	}
	None
}

fn worker_main(rt: Arc<RtInner>, id: usize) {
	WORKER.with(|w| {
		*w.borrow_mut() = Some(WorkerCtx {
			rt: rt.clone(),
			id,
			last_depth: Cell::new(0),
		});
	});
	debug!("worker {id} online");
	let backoff = Backoff::new();
	while !rt.shutdown.load(Ordering::Acquire) {
		if let Some(task) = steal(&rt) {
			execute(task);
			backoff.reset();
		} else if backoff.is_completed() {
			thread::yield_now();
		} else {
			backoff.snooze();
		}
	}
	debug!("worker {id} offline");
}

/// Configures and builds a [`Runtime`].
pub struct RuntimeBuilder {
	workers: Option<usize>,
}

impl RuntimeBuilder {
	pub fn new() -> Self {
		Self { workers: None }
	}

	/// Number of worker threads; defaults to the available parallelism.
	pub fn workers(mut self, n: usize) -> Self {
		self.workers = Some(n);
		self
	}

	pub fn build(self) -> Result<Runtime, BuildError> {
		let workers = match self.workers {
			Some(0) => return Err(BuildError::NoWorkers),
			Some(n) => n,
			None => thread::available_parallelism().map_or(1, |n| n.get()),
		};
		let inner = Arc::new(RtInner {
			frames: SpinMutex::new(Vec::new()),
			shutdown: AtomicBool::new(false),
			workers,
		});
		let handles = (0..workers)
			.map(|id| {
				let rt = inner.clone();
				thread::Builder::new()
					.name(format!("swan-worker-{id}"))
					.spawn(move || worker_main(rt, id))
					.expect("failed to spawn worker thread")
			})
			.collect();
		debug!("runtime online with {workers} workers");
		Ok(Runtime { inner, handles })
	}
}

/// The work-stealing runtime: a pool of workers executing dataflow tasks.
pub struct Runtime {
	inner: Arc<RtInner>,
	handles: Vec<thread::JoinHandle<()>>,
}

impl Runtime {
	/// A runtime with one worker per available core.
	pub fn new() -> Result<Self, BuildError> {
		RuntimeBuilder::new().build()
	}

	/// Boot the root task and block until it and all of its descendants
	/// have completed.
	pub fn run<A, F, R>(&self, args: A, f: F) -> R
	where
		A: DepList,
		F: FnOnce(A) -> R + Send + 'static,
		R: Send + 'static,
	{
		let result = Arc::new(SpinMutex::new(None));
		let slot = result.clone();
		let frame = Frame::new(self.inner.clone());
		let task = spawn_into(&frame, args, move |a| {
			*slot.lock() = Some(f(a));
		});
		// The boot thread is not a worker; it only waits.
		let backoff = Backoff::new();
		loop {
			while frame.children() > 0 {
				if backoff.is_completed() {
					thread::yield_now();
				} else {
					backoff.snooze();
				}
			}
			let finalizers = frame.take_finalizers();
			if finalizers.is_empty() {
				break;
			}
			for finalize in finalizers {
				finalize();
			}
		}
		debug_assert!(task.is_done());
		frame.retire();
		let value = result.lock().take();
		value.expect("root task produced no result")
	}
}

impl Drop for Runtime {
	fn drop(&mut self) {
		self.inner.shutdown.store(true, Ordering::Release);
		for handle in self.handles.drain(..) {
			handle.join().expect("worker thread panicked");
		}
	}
}
