//! Runtime instrumentation counters.
//!
//! Cheap relaxed atomics bumped from the hot paths, mainly useful to observe
//! scheduling behavior from benchmarks and tests (e.g. how often renaming
//! fired for a workload).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Copy, Clone, Debug)]
pub enum Counter {
	/// Write-only arguments redirected to a fresh version.
	Renames,
	/// In/out arguments renamed with an eager copy.
	InoutRenames,
	/// Arguments registered with object metadata.
	Issues,
	/// Tasks that passed the spawn-time fast path.
	FastSpawns,
	/// Pending-to-ready transitions.
	Wakeups,
	/// Tasks taken from another frame's graph.
	Steals,
	/// Reduction episodes merged back into their object.
	Finalizations,
}

const NUM_COUNTERS: usize = 7;

static COUNTERS: [AtomicU64; NUM_COUNTERS] = [const { AtomicU64::new(0) }; NUM_COUNTERS];

pub(crate) fn count(c: Counter) {
	COUNTERS[c as usize].fetch_add(1, Ordering::Relaxed);
}

/// A point-in-time copy of all counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Snapshot {
	pub renames: u64,
	pub inout_renames: u64,
	pub issues: u64,
	pub fast_spawns: u64,
	pub wakeups: u64,
	pub steals: u64,
	pub finalizations: u64,
}

pub fn snapshot() -> Snapshot {
	let get = |c: Counter| COUNTERS[c as usize].load(Ordering::Relaxed);
	Snapshot {
		renames: get(Counter::Renames),
		inout_renames: get(Counter::InoutRenames),
		issues: get(Counter::Issues),
		fast_spawns: get(Counter::FastSpawns),
		wakeups: get(Counter::Wakeups),
		steals: get(Counter::Steals),
		finalizations: get(Counter::Finalizations),
	}
}
