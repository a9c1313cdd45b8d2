// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Smallest-free-id allocator over `[1, I_MAX]`, represented as the unique
//! minimal set of disjoint, non-adjacent, ascending intervals whose union
//! is the set of ids currently in use.
//!
//! Used by the client interface (§4.5.1/§4.6) to pick fresh `fcgi_id`
//! values per connection; mirrors the template allocator the original
//! `a-components` library builds the client interface on
//! (`id_manager_template.h`).

use num_traits::{PrimInt, Unsigned};
use std::fmt::Debug;
use thiserror::Error;

/// Errors raised by [`IdAllocator`] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    /// Every id in `[1, I_MAX]` is already in use.
    #[error("id space exhausted")]
    Exhausted,
    /// [`IdAllocator::release`] was called with an id that is not in use.
    #[error("id not in use")]
    NotInUse,
}

/// A closed interval `[start, end]`, both inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Interval<I> {
    start: I,
    end: I,
}

/// Smallest-free-integer allocator over `[1, max]` for an unsigned integer
/// type `I`.
///
/// Invariant maintained by every operation: `intervals` is sorted
/// ascending, and no two intervals are adjacent or overlapping (two
/// intervals `[a,b]` and `[c,d]` with `b + 1 == c` are always merged into
/// one). This is the unique minimal representation of the in-use set.
#[derive(Debug, Clone)]
pub struct IdAllocator<I> {
    max: I,
    intervals: Vec<Interval<I>>,
}

impl<I> IdAllocator<I>
where
    I: PrimInt + Unsigned + Debug,
{
    /// Creates an allocator over `[1, max]` with no ids in use.
    pub fn new(max: I) -> Self {
        Self {
            max,
            intervals: Vec::new(),
        }
    }

    /// Number of ids currently in use.
    pub fn size(&self) -> usize {
        self.intervals
            .iter()
            .map(|iv| (iv.end - iv.start).to_usize().unwrap_or(usize::MAX) + 1)
            .sum()
    }

    /// Whether `id` is currently in use.
    pub fn is_used(&self, id: I) -> bool {
        self.intervals
            .iter()
            .any(|iv| iv.start <= id && id <= iv.end)
    }

    /// Returns the smallest unused id in `[1, max]`, marking it in use.
    ///
    /// Fails with [`AllocError::Exhausted`] when every id is in use.
    pub fn acquire(&mut self) -> Result<I, AllocError> {
        let one = I::one();

        if self.intervals.is_empty() {
            self.intervals.push(Interval { start: one, end: one });
            return Ok(one);
        }

        let first = self.intervals[0];
        if first.start > one {
            // There's a gap before the first interval; id 1 is free.
            if first.start == one + one {
                self.intervals[0].start = one;
            } else {
                self.intervals.insert(0, Interval { start: one, end: one });
            }
            return Ok(one);
        }

        // first.start == 1: the free id is first.end + 1, unless that
        // collides with the max or the next interval.
        if first.end >= self.max {
            return Err(AllocError::Exhausted);
        }
        let candidate = first.end + one;

        if self.intervals.len() > 1 && self.intervals[1].start == candidate + one {
            // Merge [1, first.end] with [candidate+1, ...] through candidate.
            let next_end = self.intervals[1].end;
            self.intervals[0].end = next_end;
            self.intervals.remove(1);
        } else {
            self.intervals[0].end = candidate;
        }
        Ok(candidate)
    }

    /// Marks `id` as no longer in use.
    ///
    /// Fails with [`AllocError::NotInUse`] if `id` was not in use.
    pub fn release(&mut self, id: I) -> Result<(), AllocError> {
        let one = I::one();
        let idx = self
            .intervals
            .iter()
            .position(|iv| iv.start <= id && id <= iv.end)
            .ok_or(AllocError::NotInUse)?;

        let iv = self.intervals[idx];
        match (iv.start == id, iv.end == id) {
            (true, true) => {
                self.intervals.remove(idx);
            }
            (true, false) => {
                self.intervals[idx].start = id + one;
            }
            (false, true) => {
                self.intervals[idx].end = id - one;
            }
            (false, false) => {
                let right = Interval {
                    start: id + one,
                    end: iv.end,
                };
                self.intervals[idx].end = id - one;
                self.intervals.insert(idx + 1, right);
            }
        }
        Ok(())
    }

    /// Every id currently in use, in ascending order. Intended for tests
    /// and introspection, not the allocation hot path.
    pub fn used_ids(&self) -> Vec<I> {
        let mut out = Vec::new();
        for iv in &self.intervals {
            let mut cur = iv.start;
            loop {
                out.push(cur);
                if cur == iv.end {
                    break;
                }
                cur = cur + I::one();
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_allocator_gives_one() {
        let mut a: IdAllocator<u16> = IdAllocator::new(65535);
        assert_eq!(a.acquire().unwrap(), 1);
        assert_eq!(a.size(), 1);
    }

    #[test]
    fn release_after_acquire_restores_prior_state() {
        let mut a: IdAllocator<u16> = IdAllocator::new(65535);
        let before = a.used_ids();
        let id = a.acquire().unwrap();
        a.release(id).unwrap();
        assert_eq!(a.used_ids(), before);
    }

    #[test]
    fn acquire_never_repeats_in_use_ids() {
        let mut a: IdAllocator<u16> = IdAllocator::new(65535);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = a.acquire().unwrap();
            assert!(seen.insert(id), "acquire returned {id} twice while in use");
        }
    }

    #[test]
    fn gap_before_min_is_preferred() {
        let mut a: IdAllocator<u16> = IdAllocator::new(65535);
        let a1 = a.acquire().unwrap();
        let a2 = a.acquire().unwrap();
        let _a3 = a.acquire().unwrap();
        assert_eq!((a1, a2), (1, 2));
        a.release(a1).unwrap();
        a.release(a2).unwrap();
        // min(S) is now 3 > 1, so the next acquire must return 1.
        assert_eq!(a.acquire().unwrap(), 1);
    }

    #[test]
    fn acquire_at_top_of_sole_interval_extends_it() {
        let mut a: IdAllocator<u16> = IdAllocator::new(5);
        for expected in 1..=5u16 {
            assert_eq!(a.acquire().unwrap(), expected);
        }
        assert_eq!(a.acquire(), Err(AllocError::Exhausted));
    }

    #[test]
    fn release_splits_interval() {
        let mut a: IdAllocator<u16> = IdAllocator::new(10);
        for _ in 0..5 {
            a.acquire().unwrap();
        }
        // S = {1,2,3,4,5}; release 3 -> {1,2} and {4,5}.
        a.release(3).unwrap();
        assert!(!a.is_used(3));
        assert!(a.is_used(2) && a.is_used(4));
        assert_eq!(a.size(), 4);
    }

    #[test]
    fn release_not_in_use_fails() {
        let mut a: IdAllocator<u16> = IdAllocator::new(10);
        assert_eq!(a.release(1), Err(AllocError::NotInUse));
    }
}
