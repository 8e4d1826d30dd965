//! Finalization fires exactly once per reduction episode.
//!
//! Kept alone in this binary: the assertions below count global
//! finalizations, which any concurrent reduction test would disturb.

#![cfg(feature = "reduction")]

use swan::{Monoid, Object, RuntimeBuilder, indep, reduction, spawn, ssync, stats};

struct PlusI64;

impl Monoid for PlusI64 {
	type Value = i64;

	fn identity() -> i64 {
		0
	}

	fn reduce(into: &mut i64, from: &mut i64) {
		*into += *from;
	}
}

#[test]
fn one_finalization_per_episode() {
	let rt = RuntimeBuilder::new().workers(2).build().unwrap();

	// An episode of many tasks finalizes exactly once.
	let before = stats::snapshot();
	let total = rt.run((), |_| {
		let x = Object::new(0i64);
		for _ in 0..1_000 {
			spawn((reduction::<PlusI64, _>(&x),), |(mut r,)| *r += 1);
		}
		ssync();
		x.peek()
	});
	let after = stats::snapshot();
	assert_eq!(total, 1_000);
	assert_eq!(after.finalizations - before.finalizations, 1);

	// Two episodes on one object finalize independently.
	let before = stats::snapshot();
	let total = rt.run((), |_| {
		let x = Object::new(0i64);
		for _ in 0..50 {
			spawn((reduction::<PlusI64, _>(&x),), |(mut r,)| *r += 1);
		}
		ssync();
		for _ in 0..50 {
			spawn((reduction::<PlusI64, _>(&x),), |(mut r,)| *r += 2);
		}
		ssync();
		x.peek()
	});
	let after = stats::snapshot();
	assert_eq!(total, 150);
	assert_eq!(after.finalizations - before.finalizations, 2);

	// No reduction tasks, no finalization.
	let before = stats::snapshot();
	let v = rt.run((), |_| {
		let x = Object::new(7i64);
		spawn((indep(&x),), |(x,)| {
			let _ = *x;
		});
		ssync();
		x.peek()
	});
	let after = stats::snapshot();
	assert_eq!(v, 7);
	assert_eq!(after.finalizations - before.finalizations, 0);
}
