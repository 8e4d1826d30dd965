//! A work-stealing runtime for dataflow-annotated task programs.
//!
//! Tasks are spawned through ordinary library calls with typed access-mode
//! wrappers ([`indep`], [`outdep`], [`inoutdep`], [`cinoutdep`],
//! [`reduction`], [`truedep`], [`pushdep`], [`popdep`]). The runtime tracks
//! the dependences these annotations imply, renames write-only arguments to
//! increase parallelism, serializes commutative tasks, privatizes reductions
//! and hands ready tasks to a pool of worker threads.
//!
//! ```
//! use swan::{Object, Runtime, indep, outdep, spawn, truedep};
//!
//! let rt = Runtime::new().unwrap();
//! let out = rt.run((), |_| {
//! 	let x = Object::new(0i32);
//! 	let y = Object::new(0i32);
//! 	spawn((outdep(&x), truedep(7)), |(x, v)| x.put(v.get()));
//! 	spawn((indep(&x), outdep(&y)), |(x, y)| y.put(*x + 1));
//! 	swan::ssync();
//! 	y.peek()
//! });
//! assert_eq!(out, 8);
//! ```

#![warn(rust_2018_idioms)]
#![allow(clippy::new_without_default)]

#[macro_use]
extern crate log;

#[cfg(feature = "commutative")]
pub use crate::dep::{CInOutDep, cinoutdep};
pub use crate::dep::{
	DepArg, DepList, InDep, InOutDep, OutDep, TrueDep, indep, inoutdep, outdep, truedep,
};
pub use crate::object::{Object, Unversioned, Versioned};
#[cfg(feature = "queues")]
pub use crate::queue::{PopDep, PushDep, Queue, popdep, pushdep};
#[cfg(feature = "reduction")]
pub use crate::reduction::{Monoid, Reduction, reduction};
pub use crate::scheduler::{BuildError, Runtime, RuntimeBuilder, call, leaf_call, spawn, ssync};

// Plumbing types that appear in public signatures.
#[doc(hidden)]
pub use crate::dep::Slots;
#[doc(hidden)]
pub use crate::object::ObjectSlot;
#[doc(hidden)]
pub use crate::version::{Version, VersionRef};

mod dep;
mod graph;
mod meta;
mod object;
#[cfg(feature = "queues")]
mod queue;
#[cfg(feature = "reduction")]
mod reduction;
mod scheduler;
pub mod stats;
mod task;
mod version;
