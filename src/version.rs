//! Versions and payloads.
//!
//! A payload holds the user-visible value of an object; a version wraps one
//! payload together with the object's dependence metadata. Renaming swings
//! an object to a fresh version while earlier tasks keep the old one alive
//! through their own references, so the payload/version split lets a nested
//! task point at the same bytes from a new version without copying.

use std::cell::UnsafeCell;
use std::sync::Arc;

#[cfg(feature = "reduction")]
use hermit_sync::OnceCell;

use crate::meta::ObjectDeps;
#[cfg(feature = "reduction")]
use crate::reduction::ReductionMap;

/// The user-visible value of an object.
///
/// Reference counted through [`Arc`]; the destructor of `T` runs exactly
/// once, when the last version (or handle) referring to it goes away.
pub(crate) struct Payload<T> {
	cell: UnsafeCell<T>,
}

// Workers hand values back and forth; the dependence rules guarantee that
// either many readers or one writer touch the cell at a time.
unsafe impl<T: Send> Sync for Payload<T> {}

impl<T> Payload<T> {
	fn new(value: T) -> Arc<Self> {
		Arc::new(Self {
			cell: UnsafeCell::new(value),
		})
	}
}

/// One snapshot of an object's value.
#[doc(hidden)]
pub struct Version<T> {
	payload: Arc<Payload<T>>,
	deps: ObjectDeps,
	/// Versions with an owning object may be renamed; unversioned objects
	/// and private reduction copies keep their identity for life.
	versionable: bool,
	#[cfg(feature = "reduction")]
	reduc: OnceCell<ReductionMap<T>>,
}

#[doc(hidden)]
pub type VersionRef<T> = Arc<Version<T>>;

impl<T: Send + 'static> Version<T> {
	pub(crate) fn create(value: T, versionable: bool) -> VersionRef<T> {
		Arc::new(Self {
			payload: Payload::new(value),
			deps: ObjectDeps::new(),
			versionable,
			#[cfg(feature = "reduction")]
			reduc: OnceCell::new(),
		})
	}

	pub(crate) fn deps(&self) -> &ObjectDeps {
		&self.deps
	}

	pub(crate) fn is_versionable(&self) -> bool {
		self.versionable
	}

	/// Read access to the payload.
	///
	/// # Safety
	///
	/// The caller must hold a read-admitting issue on this version, or
	/// otherwise know that no writer is concurrently active.
	pub(crate) unsafe fn value(&self) -> &T {
		unsafe { &*self.payload.cell.get() }
	}

	/// Write access to the payload.
	///
	/// # Safety
	///
	/// The caller must be the unique active writer of this version.
	#[allow(clippy::mut_from_ref)]
	pub(crate) unsafe fn value_mut(&self) -> &mut T {
		unsafe { &mut *self.payload.cell.get() }
	}

	/// Value copy used for in/out renaming.
	#[cfg(feature = "rename-inout")]
	pub(crate) fn copy_from(&self, src: &Version<T>)
	where
		T: Clone,
	{
		// Only readers are outstanding on `src` (checked by the caller), so
		// its payload is stable; `self` is freshly created and unshared.
		unsafe {
			*self.value_mut() = src.value().clone();
		}
	}

	/// The per-version reduction map, created on first use.
	#[cfg(feature = "reduction")]
	pub(crate) fn reduction(&self) -> Option<&ReductionMap<T>> {
		self.reduc.get()
	}

	#[cfg(feature = "reduction")]
	pub(crate) fn reduction_or_init(&self, workers: usize) -> &ReductionMap<T> {
		self.reduc.get_or_init(|| ReductionMap::new(workers))
	}

	/// Merge pending per-worker reduction copies into this payload, if an
	/// episode is still open. Runs at most once per episode.
	#[cfg(feature = "reduction")]
	pub(crate) fn finalize_reduction(&self) {
		if let Some(map) = self.reduc.get() {
			map.finalize_into(self);
		}
	}
}

impl<T> Drop for Version<T> {
	fn drop(&mut self) {
		debug_assert!(
			self.deps.is_idle(),
			"dropping a version with outstanding tasks: {}",
			self.deps
		);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	static DROPS: AtomicUsize = AtomicUsize::new(0);

	struct Probe;

	impl Drop for Probe {
		fn drop(&mut self) {
			DROPS.fetch_add(1, Ordering::SeqCst);
		}
	}

	#[test]
	fn payload_destructor_runs_once() {
		DROPS.store(0, Ordering::SeqCst);
		let v = Version::create(Probe, true);
		let shared = v.clone();
		drop(v);
		assert_eq!(DROPS.load(Ordering::SeqCst), 0);
		drop(shared);
		assert_eq!(DROPS.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn zero_sized_versions_are_permitted() {
		let v = Version::create((), true);
		unsafe {
			assert_eq!(*v.value(), ());
		}
	}
}
