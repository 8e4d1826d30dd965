//! Access-mode wrappers and the argument walker.
//!
//! Each task argument is wrapped in one of the access-mode types built by
//! [`indep`], [`outdep`], [`inoutdep`], [`cinoutdep`] and [`truedep`] (plus
//! the reduction and queue wrappers from their own modules). The wrapper
//! carries the version the argument was resolved against and the
//! scheme-specific dependence tag, and implements the per-mode contract the
//! walker drives: `ini_ready`, `issue`, `ready`, acquire/rollback, the
//! pre-execution step and `release`.
//!
//! The walker visits arguments in declaration order for `ini_ready` and
//! `issue` and unwinds rollbacks in reverse order.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::meta::{AccessMode, DepTag};
use crate::object::{ObjectSlot, Versioned};
use crate::task::{TaskBody, TaskRef};
use crate::version::VersionRef;

/// Per-argument dependence contract, dispatched over the closed set of
/// access-mode wrappers.
pub trait DepArg: Send {
	/// Fast-path readiness; a commutative wrapper takes its acquire here.
	#[doc(hidden)]
	fn ini_ready(&mut self) -> bool;
	/// Roll back the effect of a successful `ini_ready`.
	#[doc(hidden)]
	fn ini_undo(&mut self);
	/// Register the dependence with the object, renaming first if the mode
	/// allows and profits.
	#[doc(hidden)]
	fn issue(&mut self, task: &TaskRef);
	/// Dependence depth of the argument's object, for depth-tracked modes.
	#[doc(hidden)]
	fn depth_of(&self) -> Option<u64>;
	/// Poll whether every conflicting predecessor has released.
	#[doc(hidden)]
	fn ready(&self) -> bool;
	#[doc(hidden)]
	fn try_acquire(&mut self) -> bool;
	#[doc(hidden)]
	fn unacquire(&mut self);
	/// Pre-execution step: pending finalization, reduction privatization.
	#[doc(hidden)]
	fn prepare(&mut self, worker: usize);
	/// Retire the dependence; must pair the `issue` above.
	#[doc(hidden)]
	fn release(&mut self, task: &TaskRef);
	/// Does the argument take part in dependence tracking at all?
	#[doc(hidden)]
	fn is_object(&self) -> bool {
		true
	}
}

#[doc(hidden)]
pub type Slots<'a> = SmallVec<[&'a mut dyn DepArg; 8]>;

/// A tuple of task arguments.
pub trait DepList: Clone + Send + 'static {
	#[doc(hidden)]
	fn slots(&mut self) -> Slots<'_>;
}

impl DepList for () {
	fn slots(&mut self) -> Slots<'_> {
		SmallVec::new()
	}
}

macro_rules! impl_dep_list {
	($($T:ident $idx:tt),+) => {
		impl<$($T: DepArg + Clone + Send + 'static),+> DepList for ($($T,)+) {
			fn slots(&mut self) -> Slots<'_> {
				let mut slots = Slots::new();
				$(slots.push(&mut self.$idx as &mut dyn DepArg);)+
				slots
			}
		}
	};
}

impl_dep_list!(A0 0);
impl_dep_list!(A0 0, A1 1);
impl_dep_list!(A0 0, A1 1, A2 2);
impl_dep_list!(A0 0, A1 1, A2 2, A3 3);
impl_dep_list!(A0 0, A1 1, A2 2, A3 3, A4 4);
impl_dep_list!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5);
impl_dep_list!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6);
impl_dep_list!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6, A7 7);

// ---------------------------------------------------------------------
// Walker passes over the argument slots.
// ---------------------------------------------------------------------

pub(crate) fn walk_ini_ready(slots: &mut Slots<'_>) -> bool {
	for i in 0..slots.len() {
		if !slots[i].ini_ready() {
			for j in (0..i).rev() {
				slots[j].ini_undo();
			}
			return false;
		}
	}
	true
}

pub(crate) fn walk_issue(slots: &mut Slots<'_>, task: &TaskRef) {
	for slot in slots.iter_mut() {
		slot.issue(task);
	}
}

/// The task's depth is one past the deepest depth-tracked argument.
pub(crate) fn walk_depth(slots: &mut Slots<'_>) -> u64 {
	let mut depth = 0;
	for slot in slots.iter_mut() {
		if let Some(d) = slot.depth_of() {
			depth = depth.max(d + 1);
		}
	}
	depth
}

pub(crate) fn walk_ready(slots: &mut Slots<'_>) -> bool {
	slots.iter_mut().all(|slot| slot.ready())
}

pub(crate) fn walk_acquire(slots: &mut Slots<'_>) -> bool {
	for i in 0..slots.len() {
		if !slots[i].try_acquire() {
			for j in (0..i).rev() {
				slots[j].unacquire();
			}
			return false;
		}
	}
	true
}

pub(crate) fn walk_prepare(slots: &mut Slots<'_>, worker: usize) {
	for slot in slots.iter_mut() {
		slot.prepare(worker);
	}
}

pub(crate) fn walk_release(slots: &mut Slots<'_>, task: &TaskRef) {
	for slot in slots.iter_mut() {
		slot.release(task);
	}
}

// ---------------------------------------------------------------------
// Task body: the argument tuple plus the closure.
// ---------------------------------------------------------------------

pub(crate) struct BodyImpl<A: DepList, F: FnOnce(A) + Send + 'static> {
	args: A,
	f: Option<F>,
}

impl<A: DepList, F: FnOnce(A) + Send + 'static> BodyImpl<A, F> {
	pub(crate) fn new(args: A, f: F) -> Self {
		Self { args, f: Some(f) }
	}
}

impl<A: DepList, F: FnOnce(A) + Send + 'static> TaskBody for BodyImpl<A, F> {
	fn ini_ready(&mut self) -> bool {
		walk_ini_ready(&mut self.args.slots())
	}

	fn issue(&mut self, task: &TaskRef) {
		walk_issue(&mut self.args.slots(), task);
	}

	fn scan_depth(&mut self) -> u64 {
		walk_depth(&mut self.args.slots())
	}

	fn ready(&mut self) -> bool {
		walk_ready(&mut self.args.slots())
	}

	fn acquire(&mut self) -> bool {
		walk_acquire(&mut self.args.slots())
	}

	fn prepare(&mut self, worker: usize) {
		walk_prepare(&mut self.args.slots(), worker);
	}

	fn invoke(&mut self) {
		let f = self.f.take().expect("task body invoked twice");
		f(self.args.clone());
	}

	fn release(&mut self, task: &TaskRef) {
		walk_release(&mut self.args.slots(), task);
	}
}

pub(crate) fn has_objects<A: DepList>(args: &mut A) -> bool {
	args.slots().iter().any(|slot| slot.is_object())
}

// ---------------------------------------------------------------------
// Read dependence.
// ---------------------------------------------------------------------

/// A read argument: runs in parallel with other readers, after all earlier
/// modifiers of the version it was resolved against.
pub struct InDep<T: Send + 'static> {
	version: VersionRef<T>,
	tag: DepTag,
}

/// Borrow `src` for reading.
pub fn indep<T: Send + 'static>(src: &impl Versioned<T>) -> InDep<T> {
	InDep {
		version: src.current(),
		tag: DepTag::default(),
	}
}

impl<T: Send + 'static> InDep<T> {
	pub fn read(&self) -> &T {
		unsafe { self.version.value() }
	}
}

impl<T: Send + 'static> std::ops::Deref for InDep<T> {
	type Target = T;

	fn deref(&self) -> &T {
		self.read()
	}
}

impl<T: Send + 'static> Clone for InDep<T> {
	fn clone(&self) -> Self {
		Self {
			version: self.version.clone(),
			tag: self.tag.clone(),
		}
	}
}

impl<T: Send + 'static> DepArg for InDep<T> {
	fn ini_ready(&mut self) -> bool {
		self.version.deps().match_group(AccessMode::Read)
	}

	fn ini_undo(&mut self) {}

	fn issue(&mut self, task: &TaskRef) {
		let deps = self.version.deps();
		deps.issue(task, &mut self.tag, AccessMode::Read);
		deps.update_depth(task.depth());
		crate::stats::count(crate::stats::Counter::Issues);
	}

	fn depth_of(&self) -> Option<u64> {
		Some(self.version.deps().depth())
	}

	fn ready(&self) -> bool {
		self.version.deps().ready(&self.tag, AccessMode::Read)
	}

	fn try_acquire(&mut self) -> bool {
		true
	}

	fn unacquire(&mut self) {}

	fn prepare(&mut self, _worker: usize) {
		#[cfg(feature = "reduction")]
		self.version.finalize_reduction();
	}

	fn release(&mut self, task: &TaskRef) {
		self.version.deps().release(task, &self.tag, AccessMode::Read);
	}
}

// ---------------------------------------------------------------------
// Write dependence.
// ---------------------------------------------------------------------

/// A write-only argument. When the object has outstanding users it is
/// renamed to a fresh version, so a write-only task is always ready.
pub struct OutDep<T: Send + 'static> {
	slot: Option<Arc<ObjectSlot<T>>>,
	version: VersionRef<T>,
	tag: DepTag,
}

/// Borrow `src` for writing. The task must fully overwrite the value.
pub fn outdep<T: Send + 'static>(src: &impl Versioned<T>) -> OutDep<T> {
	OutDep {
		slot: src.slot(),
		version: src.current(),
		tag: DepTag::default(),
	}
}

impl<T: Send + 'static> OutDep<T> {
	pub fn put(&self, value: T) {
		unsafe {
			*self.version.value_mut() = value;
		}
	}
}

impl<T: Send + 'static> std::ops::Deref for OutDep<T> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { self.version.value() }
	}
}

impl<T: Send + 'static> std::ops::DerefMut for OutDep<T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { self.version.value_mut() }
	}
}

impl<T: Send + 'static> Clone for OutDep<T> {
	fn clone(&self) -> Self {
		Self {
			slot: self.slot.clone(),
			version: self.version.clone(),
			tag: self.tag.clone(),
		}
	}
}

impl<T: Send + 'static> DepArg for OutDep<T> {
	fn ini_ready(&mut self) -> bool {
		// A versionable out argument renames at issue when the object is
		// busy, so it never waits.
		self.version.is_versionable() || self.version.deps().match_group(AccessMode::Write)
	}

	fn ini_undo(&mut self) {}

	fn issue(&mut self, task: &TaskRef) {
		if self.version.is_versionable()
			&& (self.version.deps().has_readers() || self.version.deps().has_writers())
		{
			let slot = self.slot.as_ref().expect("versionable argument without slot");
			self.version = slot.rename();
		}
		self.version.deps().issue(task, &mut self.tag, AccessMode::Write);
		crate::stats::count(crate::stats::Counter::Issues);
	}

	fn depth_of(&self) -> Option<u64> {
		None
	}

	fn ready(&self) -> bool {
		self.version.deps().ready(&self.tag, AccessMode::Write)
	}

	fn try_acquire(&mut self) -> bool {
		true
	}

	fn unacquire(&mut self) {}

	fn prepare(&mut self, _worker: usize) {}

	fn release(&mut self, task: &TaskRef) {
		self.version.deps().release(task, &self.tag, AccessMode::Write);
	}
}

// ---------------------------------------------------------------------
// Read-write dependence.
// ---------------------------------------------------------------------

/// A read-write argument: fully serialized against every other user of the
/// object. With `rename-inout`, an object with only readers outstanding is
/// renamed eagerly (copying the current value) so the writer need not wait.
pub struct InOutDep<T: Clone + Send + 'static> {
	slot: Option<Arc<ObjectSlot<T>>>,
	version: VersionRef<T>,
	tag: DepTag,
}

/// Borrow `src` for reading and writing.
pub fn inoutdep<T: Clone + Send + 'static>(src: &impl Versioned<T>) -> InOutDep<T> {
	InOutDep {
		slot: src.slot(),
		version: src.current(),
		tag: DepTag::default(),
	}
}

impl<T: Clone + Send + 'static> std::ops::Deref for InOutDep<T> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { self.version.value() }
	}
}

impl<T: Clone + Send + 'static> std::ops::DerefMut for InOutDep<T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { self.version.value_mut() }
	}
}

impl<T: Clone + Send + 'static> Clone for InOutDep<T> {
	fn clone(&self) -> Self {
		Self {
			slot: self.slot.clone(),
			version: self.version.clone(),
			tag: self.tag.clone(),
		}
	}
}

impl<T: Clone + Send + 'static> InOutDep<T> {
	pub(crate) fn from_version(version: VersionRef<T>) -> Self {
		Self {
			slot: None,
			version,
			tag: DepTag::default(),
		}
	}
}

impl<T: Clone + Send + 'static> DepArg for InOutDep<T> {
	fn ini_ready(&mut self) -> bool {
		self.version.deps().match_group(AccessMode::ReadWrite)
	}

	fn ini_undo(&mut self) {}

	fn issue(&mut self, task: &TaskRef) {
		#[cfg(feature = "rename-inout")]
		if self.version.is_versionable()
			&& self.version.deps().has_readers()
			&& !self.version.deps().has_writers()
		{
			// Only readers outstanding: the payload is stable, so the copy
			// observes the value this argument must see.
			let slot = self.slot.as_ref().expect("versionable argument without slot");
			let old = self.version.clone();
			self.version = slot.rename();
			self.version.copy_from(&old);
			crate::stats::count(crate::stats::Counter::InoutRenames);
		}
		let deps = self.version.deps();
		deps.issue(task, &mut self.tag, AccessMode::ReadWrite);
		deps.update_depth(task.depth());
		crate::stats::count(crate::stats::Counter::Issues);
	}

	fn depth_of(&self) -> Option<u64> {
		Some(self.version.deps().depth())
	}

	fn ready(&self) -> bool {
		self.version.deps().ready(&self.tag, AccessMode::ReadWrite)
	}

	fn try_acquire(&mut self) -> bool {
		true
	}

	fn unacquire(&mut self) {}

	fn prepare(&mut self, _worker: usize) {
		#[cfg(feature = "reduction")]
		self.version.finalize_reduction();
	}

	fn release(&mut self, task: &TaskRef) {
		self.version.deps().release(task, &self.tag, AccessMode::ReadWrite);
	}
}

// ---------------------------------------------------------------------
// Commutative read-write dependence.
// ---------------------------------------------------------------------

/// A commutative read-write argument: tasks over the same object may run in
/// any order but never overlap. The per-object mutex is taken before the
/// task leaves the ready list and held until its release.
#[cfg(feature = "commutative")]
pub struct CInOutDep<T: Send + 'static> {
	version: VersionRef<T>,
	tag: DepTag,
	held: bool,
}

/// Borrow `src` for commutative mutation.
#[cfg(feature = "commutative")]
pub fn cinoutdep<T: Send + 'static>(src: &impl Versioned<T>) -> CInOutDep<T> {
	CInOutDep {
		version: src.current(),
		tag: DepTag::default(),
		held: false,
	}
}

#[cfg(feature = "commutative")]
impl<T: Send + 'static> std::ops::Deref for CInOutDep<T> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { self.version.value() }
	}
}

#[cfg(feature = "commutative")]
impl<T: Send + 'static> std::ops::DerefMut for CInOutDep<T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { self.version.value_mut() }
	}
}

#[cfg(feature = "commutative")]
impl<T: Send + 'static> Clone for CInOutDep<T> {
	fn clone(&self) -> Self {
		Self {
			version: self.version.clone(),
			tag: self.tag.clone(),
			// The clone handed to the closure does not own the acquire.
			held: false,
		}
	}
}

#[cfg(feature = "commutative")]
impl<T: Send + 'static> DepArg for CInOutDep<T> {
	fn ini_ready(&mut self) -> bool {
		let deps = self.version.deps();
		if deps.match_group(AccessMode::Commutative) && deps.commutative_try_acquire() {
			self.held = true;
			return true;
		}
		false
	}

	fn ini_undo(&mut self) {
		self.version.deps().commutative_release();
		self.held = false;
	}

	fn issue(&mut self, task: &TaskRef) {
		let deps = self.version.deps();
		deps.issue(task, &mut self.tag, AccessMode::Commutative);
		deps.update_depth(task.depth());
		crate::stats::count(crate::stats::Counter::Issues);
	}

	fn depth_of(&self) -> Option<u64> {
		Some(self.version.deps().depth())
	}

	fn ready(&self) -> bool {
		self.version.deps().ready(&self.tag, AccessMode::Commutative)
	}

	fn try_acquire(&mut self) -> bool {
		if self.held {
			return true;
		}
		if self.version.deps().commutative_try_acquire() {
			self.held = true;
			return true;
		}
		false
	}

	fn unacquire(&mut self) {
		if self.held {
			self.version.deps().commutative_release();
			self.held = false;
		}
	}

	fn prepare(&mut self, _worker: usize) {
		#[cfg(feature = "reduction")]
		self.version.finalize_reduction();
	}

	fn release(&mut self, task: &TaskRef) {
		assert!(self.held, "commutative argument released without acquire");
		self.version.deps().release(task, &self.tag, AccessMode::Commutative);
		self.version.deps().commutative_release();
		self.held = false;
	}
}

// ---------------------------------------------------------------------
// No-op dependence.
// ---------------------------------------------------------------------

/// A plain by-value argument that takes no part in dependence tracking.
pub struct TrueDep<T: Clone + Send + 'static> {
	value: T,
}

/// Pass `value` to the task without declaring any dependence.
pub fn truedep<T: Clone + Send + 'static>(value: T) -> TrueDep<T> {
	TrueDep { value }
}

impl<T: Clone + Send + 'static> TrueDep<T> {
	pub fn get(&self) -> T {
		self.value.clone()
	}
}

impl<T: Clone + Send + 'static> std::ops::Deref for TrueDep<T> {
	type Target = T;

	fn deref(&self) -> &T {
		&self.value
	}
}

impl<T: Clone + Send + 'static> Clone for TrueDep<T> {
	fn clone(&self) -> Self {
		Self {
			value: self.value.clone(),
		}
	}
}

impl<T: Clone + Send + 'static> DepArg for TrueDep<T> {
	fn ini_ready(&mut self) -> bool {
		true
	}

	fn ini_undo(&mut self) {}

	fn issue(&mut self, _task: &TaskRef) {}

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

	fn release(&mut self, _task: &TaskRef) {}

	fn is_object(&self) -> bool {
		false
	}
}
