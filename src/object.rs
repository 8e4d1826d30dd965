//! User-visible object handles.
//!
//! An [`Object`] is a value-typed handle holding the current version of one
//! dataflow object; spawning a writer may swing it to a fresh version
//! (renaming) so the writer can proceed in parallel with earlier readers.
//! An [`Unversioned`] object has a fixed identity and never renames, which
//! makes it the right declaration for tokens and for data whose address must
//! stay stable.

use std::sync::Arc;

use hermit_sync::SpinMutex;

use crate::version::{Version, VersionRef};

/// The renameable slot behind an [`Object`].
#[doc(hidden)]
pub struct ObjectSlot<T: Send + 'static> {
	version: SpinMutex<VersionRef<T>>,
	/// Produces the payload of a fresh version on rename. The write-only
	/// renaming path never copies; in/out renaming copies separately.
	fresh: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Send + 'static> ObjectSlot<T> {
	pub(crate) fn current(&self) -> VersionRef<T> {
		self.version.lock().clone()
	}

	/// Swing the object to a fresh version and return it. Previously issued
	/// tasks keep the old version alive through their own references.
	pub(crate) fn rename(&self) -> VersionRef<T> {
		let fresh = Version::create((self.fresh)(), true);
		let mut current = self.version.lock();
		trace!(
			"renaming object {:p}: {}",
			self,
			current.deps()
		);
		*current = fresh.clone();
		crate::stats::count(crate::stats::Counter::Renames);
		fresh
	}
}

/// A versioned scalar or array object.
pub struct Object<T: Send + 'static> {
	slot: Arc<ObjectSlot<T>>,
}

impl<T: Default + Send + 'static> Object<T> {
	/// An object whose renamed versions are default-constructed.
	pub fn new(init: T) -> Self {
		Self::with_factory(init, T::default)
	}
}

impl<T: Send + 'static> Object<T> {
	/// An object with an explicit fresh-value factory, for payloads whose
	/// shape a plain default cannot reproduce (e.g. sized arrays).
	pub fn with_factory(init: T, fresh: impl Fn() -> T + Send + Sync + 'static) -> Self {
		Self {
			slot: Arc::new(ObjectSlot {
				version: SpinMutex::new(Version::create(init, true)),
				fresh: Box::new(fresh),
			}),
		}
	}

	/// Read the current value.
	///
	/// Only meaningful when no writer can be active, i.e. after an
	/// [`ssync`](crate::ssync) covering every task that uses the object.
	pub fn peek(&self) -> T
	where
		T: Clone,
	{
		let version = self.slot.current();
		unsafe { version.value().clone() }
	}
}

impl<T: Send + 'static> Clone for Object<T> {
	fn clone(&self) -> Self {
		Self {
			slot: self.slot.clone(),
		}
	}
}

/// An object with a fixed identity: never renamed, so every task addresses
/// the same version and writers serialize behind all earlier users.
pub struct Unversioned<T: Send + 'static> {
	version: VersionRef<T>,
}

impl<T: Send + 'static> Unversioned<T> {
	pub fn new(init: T) -> Self {
		Self {
			version: Version::create(init, false),
		}
	}

	/// See [`Object::peek`].
	pub fn peek(&self) -> T
	where
		T: Clone,
	{
		unsafe { self.version.value().clone() }
	}
}

impl<T: Send + 'static> Clone for Unversioned<T> {
	fn clone(&self) -> Self {
		Self {
			version: self.version.clone(),
		}
	}
}

/// Sources of versions for the access-mode constructors: [`Object`] and
/// [`Unversioned`].
pub trait Versioned<T: Send + 'static> {
	#[doc(hidden)]
	fn current(&self) -> VersionRef<T>;
	#[doc(hidden)]
	fn slot(&self) -> Option<Arc<ObjectSlot<T>>>;
}

impl<T: Send + 'static> Versioned<T> for Object<T> {
	fn current(&self) -> VersionRef<T> {
		self.slot.current()
	}

	fn slot(&self) -> Option<Arc<ObjectSlot<T>>> {
		Some(self.slot.clone())
	}
}

impl<T: Send + 'static> Versioned<T> for Unversioned<T> {
	fn current(&self) -> VersionRef<T> {
		self.version.clone()
	}

	fn slot(&self) -> Option<Arc<ObjectSlot<T>>> {
		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rename_swings_the_current_version() {
		let x = Object::new(3i32);
		let v0 = x.slot.current();
		let v1 = x.slot.rename();
		assert!(!Arc::ptr_eq(&v0, &v1));
		assert!(Arc::ptr_eq(&x.slot.current(), &v1));
		// The fresh version is default-constructed.
		assert_eq!(x.peek(), 0);
		unsafe {
			assert_eq!(*v0.value(), 3);
		}
	}

	#[test]
	fn factory_preserves_shape() {
		let n = 16;
		let x = Object::with_factory(vec![1.0f64; n], move || vec![0.0f64; n]);
		let renamed = x.slot.rename();
		unsafe {
			assert_eq!(renamed.value().len(), n);
		}
	}

	#[test]
	fn unversioned_keeps_identity() {
		let t = Unversioned::new(());
		let a = t.current();
		let b = t.current();
		assert!(Arc::ptr_eq(&a, &b));
		assert!(!a.is_versionable());
	}
}
