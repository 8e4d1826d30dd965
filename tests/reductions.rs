//! Reduction arguments: privatized updates merged before readers.

#![cfg(feature = "reduction")]

use swan::{Monoid, Object, RuntimeBuilder, indep, outdep, reduction, spawn, ssync, truedep};

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

struct ConcatU32;

impl Monoid for ConcatU32 {
	type Value = Vec<u32>;

	const EXPENSIVE: bool = true;

	fn identity() -> Vec<u32> {
		Vec::new()
	}

	fn reduce(into: &mut Vec<u32>, from: &mut Vec<u32>) {
		into.append(from);
	}
}

#[test]
fn cheap_reduction_sums() {
	let rt = RuntimeBuilder::new().workers(4).build().unwrap();
	let total = rt.run((), |_| {
		let x = Object::new(0i64);
		for _ in 0..10_000 {
			spawn((reduction::<PlusI64, _>(&x),), |(mut r,)| *r += 1);
		}
		ssync();
		x.peek()
	});
	assert_eq!(total, 10_000);
}

#[test]
fn reader_sees_the_finalized_value() {
	let rt = RuntimeBuilder::new().workers(4).build().unwrap();
	let seen = rt.run((), |_| {
		let x = Object::new(0i64);
		let out = Object::new(0i64);
		for _ in 0..100 {
			spawn((reduction::<PlusI64, _>(&x),), |(mut r,)| *r += 1);
		}
		// Ready only after the whole episode; finalization runs first.
		spawn((indep(&x), outdep(&out)), |(x, out)| out.put(*x));
		ssync();
		out.peek()
	});
	assert_eq!(seen, 100);
}

#[test]
fn expensive_reduction_merges_every_update() {
	let rt = RuntimeBuilder::new().workers(4).build().unwrap();
	let collected = rt.run((), |_| {
		let x = Object::new(Vec::<u32>::new());
		for i in 0..500u32 {
			spawn((reduction::<ConcatU32, _>(&x), truedep(i)), |(mut r, i)| {
				r.push(i.get());
			});
		}
		ssync();
		x.peek()
	});
	assert_eq!(collected.len(), 500);
	let sum: u64 = collected.iter().map(|&v| u64::from(v)).sum();
	assert_eq!(sum, (0..500u64).sum::<u64>());
}
