//! Victim selection: each worker steps through the other workers in a
//! pseudo-random, collision-resistant order using a coprime stride, seeded
//! independently per worker with a permuted congruential generator.
//!
//! The RNG itself is a cheap, `!Sync`, `Cell`-backed per-worker generator —
//! the same shape as a worker-local weak RNG used purely for victim
//! selection, not for anything requiring cryptographic quality.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::cell::Cell;

/// A worker-local victim-selection RNG. Not `Sync` — each worker owns one.
pub(crate) struct VictimRng {
    rng: std::cell::RefCell<Pcg32>,
    step: Cell<u64>,
    total_threads: u64,
}

/// Coprime stride table: for a given `total_threads`, the set of strides
/// `s` with `gcd(s, total_threads) == 1`, so the probe sequence
/// `(k + j*s) mod total_threads` visits every index exactly once before
/// repeating.
pub(crate) fn coprime_strides(total_threads: u64) -> Vec<u64> {
    if total_threads <= 1 {
        // Degenerate pool: there is nobody else to steal from. `steal()`
        // on a single-worker pool trivially returns `None` without ever
        // consulting this table.
        return vec![0];
    }
    (1..total_threads).filter(|&s| gcd(s, total_threads) == 1).collect()
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

impl VictimRng {
    pub(crate) fn new(seed: u64, total_threads: u64) -> Self {
        Self {
            rng: std::cell::RefCell::new(Pcg32::seed_from_u64(seed)),
            step: Cell::new(0),
            total_threads: total_threads.max(1),
        }
    }

    /// Pick a fresh coprime stride and a random starting offset `k`; returns
    /// an iterator-like cursor that `steal()` advances across one full
    /// sweep of the other workers.
    pub(crate) fn new_probe_sequence(&self, self_index: u64, strides: &[u64]) -> ProbeSequence {
        let mut rng = self.rng.borrow_mut();
        let stride = strides[rng.gen_range(0..strides.len())];
        let start = rng.gen_range(0..self.total_threads.max(1));
        ProbeSequence {
            self_index,
            total_threads: self.total_threads,
            stride,
            k: start,
            remaining: self.total_threads.saturating_sub(1),
        }
    }
}

/// Cursor over one full sweep of victim candidates, skipping `self_index`.
pub(crate) struct ProbeSequence {
    self_index: u64,
    total_threads: u64,
    stride: u64,
    k: u64,
    remaining: u64,
}

impl Iterator for ProbeSequence {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while self.remaining > 0 {
            self.remaining -= 1;
            let candidate = self.k % self.total_threads;
            self.k = self.k.wrapping_add(self.stride);
            if candidate != self.self_index {
                return Some(candidate);
            }
        }
        None
    }
}

/// Pick a uniformly random deque index in `[0, bound)`, for the one place an
/// *unregistered* thread needs randomness: choosing which deque to
/// `push_back` a `dispatch`ed task onto. Such a thread has no `VictimRng`
/// of its own (it
/// holds no `ThreadContext`), so this goes through `rand::thread_rng()`
/// directly rather than the per-worker PCG sequence used by `steal()`.
pub(crate) fn random_index(bound: usize) -> usize {
    rand::thread_rng().gen_range(0..bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn coprime_strides_excludes_zero_and_non_coprime_values() {
        let strides = coprime_strides(12);
        assert!(strides.iter().all(|&s| gcd(s, 12) == 1));
        assert!(!strides.contains(&0));
    }

    #[test]
    fn probe_sequence_visits_every_other_worker_exactly_once() {
        let rng = VictimRng::new(42, 8);
        let strides = coprime_strides(8);
        let seq: Vec<u64> = rng.new_probe_sequence(3, &strides).collect();
        assert_eq!(seq.len(), 7);
        let unique: HashSet<u64> = seq.iter().copied().collect();
        assert_eq!(unique.len(), 7);
        assert!(!seq.contains(&3));
    }

    #[test]
    fn single_worker_pool_has_trivial_stride_table() {
        assert_eq!(coprime_strides(1), vec![0]);
        assert_eq!(coprime_strides(0), vec![0]);
    }
}
