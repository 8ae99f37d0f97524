//! Range-set transaction identifier allocator.
//!
//! Free identifiers are kept as a sorted list of disjoint, non-adjacent closed
//! ranges. A fresh allocator holds the single range `[0, 65535]`. Both
//! [`IdAllocator::allocate`] and [`IdAllocator::free`] binary-search the list,
//! so they run in O(log R) where R is the number of free ranges.
//!
//! Allocation is round-robin: a rolling cursor names the preferred id and is
//! advanced on every call. The id handed out is the cursor itself when it is
//! free, otherwise the start of the next free range, wrapping to the first
//! range when the cursor lies past all of them. Recently freed ids are
//! therefore not reused immediately.

use crate::error::{MbapError, Result};

/// Number of distinct transaction identifiers.
pub const ID_SPACE: usize = 1 << 16;

/// A closed range of free identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub start: u16,
    pub end: u16,
}

impl IdRange {
    fn single(id: u16) -> Self {
        Self { start: id, end: id }
    }

    #[inline]
    fn contains(&self, id: u16) -> bool {
        self.start <= id && id <= self.end
    }
}

/// Allocator of 16-bit transaction identifiers.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    /// Free ranges, strictly increasing and never adjacent.
    free: Vec<IdRange>,
    /// Preferred id for the next allocation.
    cursor: u16,
    /// Number of ids currently handed out.
    active: usize,
}

impl IdAllocator {
    /// Create an allocator with every id free.
    pub fn new() -> Self {
        Self {
            free: vec![IdRange {
                start: 0,
                end: u16::MAX,
            }],
            cursor: 0,
            active: 0,
        }
    }

    /// Allocate an id.
    ///
    /// Fails with invalid-operation when all 65536 ids are active.
    pub fn allocate(&mut self) -> Result<u16> {
        let preferred = self.cursor;
        self.cursor = self.cursor.wrapping_add(1);

        if self.free.is_empty() {
            return Err(MbapError::InvalidOperation(
                "no free transaction identifiers".to_string(),
            ));
        }

        // First range whose end is at or after the preferred id.
        let mut index = self.free.partition_point(|r| r.end < preferred);
        let id = if index == self.free.len() {
            index = 0;
            self.free[0].start
        } else {
            preferred.max(self.free[index].start)
        };

        self.take(index, id);
        self.active += 1;
        Ok(id)
    }

    /// Remove `id` from the range at `index`.
    fn take(&mut self, index: usize, id: u16) {
        let range = self.free[index];
        debug_assert!(range.contains(id));

        if range.start == range.end {
            self.free.remove(index);
        } else if id == range.start {
            self.free[index].start = id + 1;
        } else if id == range.end {
            self.free[index].end = id - 1;
        } else {
            self.free[index].end = id - 1;
            self.free.insert(
                index + 1,
                IdRange {
                    start: id + 1,
                    end: range.end,
                },
            );
        }
    }

    /// Return an id to the free set.
    ///
    /// Fails with invalid-operation if `id` is not currently active.
    pub fn free(&mut self, id: u16) -> Result<()> {
        // First range starting after the id; the candidate holder precedes it.
        let index = self.free.partition_point(|r| r.start <= id);
        if index > 0 && self.free[index - 1].contains(id) {
            return Err(MbapError::InvalidOperation(format!(
                "transaction identifier {} is not active",
                id
            )));
        }

        let joins_left = index > 0 && self.free[index - 1].end == id.wrapping_sub(1) && id != 0;
        let joins_right =
            index < self.free.len() && id != u16::MAX && self.free[index].start == id + 1;

        match (joins_left, joins_right) {
            (true, true) => {
                self.free[index - 1].end = self.free[index].end;
                self.free.remove(index);
            }
            (true, false) => self.free[index - 1].end = id,
            (false, true) => self.free[index].start = id,
            (false, false) => self.free.insert(index, IdRange::single(id)),
        }

        self.active -= 1;
        Ok(())
    }

    /// Check whether `id` is currently allocated.
    pub fn is_active(&self, id: u16) -> bool {
        let index = self.free.partition_point(|r| r.start <= id);
        !(index > 0 && self.free[index - 1].contains(id))
    }

    /// Number of ids currently allocated.
    #[inline]
    pub fn active_count(&self) -> usize {
        self.active
    }

    /// The free ranges, in increasing order.
    pub fn free_ranges(&self) -> &[IdRange] {
        &self.free
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn range(start: u16, end: u16) -> IdRange {
        IdRange { start, end }
    }

    fn assert_well_formed(alloc: &IdAllocator) {
        for pair in alloc.free_ranges().windows(2) {
            assert!(pair[0].start <= pair[0].end);
            assert!(
                (pair[0].end as u32) + 1 < pair[1].start as u32,
                "ranges must be increasing and non-adjacent: {:?}",
                pair
            );
        }
    }

    #[test]
    fn test_fresh_allocator_is_sequential() {
        let mut alloc = IdAllocator::new();
        for expected in 0..10u16 {
            assert_eq!(alloc.allocate().unwrap(), expected);
        }
        assert_eq!(alloc.active_count(), 10);
        assert_eq!(alloc.free_ranges(), &[range(10, u16::MAX)]);
    }

    #[test]
    fn test_free_unallocated_fails() {
        let mut alloc = IdAllocator::new();
        let err = alloc.free(5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_double_free_fails() {
        let mut alloc = IdAllocator::new();
        let id = alloc.allocate().unwrap();
        alloc.free(id).unwrap();
        assert!(alloc.free(id).is_err());
    }

    #[test]
    fn test_round_robin_does_not_reuse_immediately() {
        let mut alloc = IdAllocator::new();
        let a = alloc.allocate().unwrap();
        alloc.free(a).unwrap();
        let b = alloc.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(b, 1);
    }

    #[test]
    fn test_interior_split_and_merge() {
        let mut alloc = IdAllocator::new();
        for _ in 0..5 {
            alloc.allocate().unwrap();
        }
        // 0..=4 active. Free 2 creates a singleton between two active ids.
        alloc.free(2).unwrap();
        assert_eq!(alloc.free_ranges(), &[range(2, 2), range(5, u16::MAX)]);
        assert_well_formed(&alloc);

        // Freeing 3 merges left; freeing 4 bridges into the tail range.
        alloc.free(3).unwrap();
        assert_eq!(alloc.free_ranges(), &[range(2, 3), range(5, u16::MAX)]);
        alloc.free(4).unwrap();
        assert_eq!(alloc.free_ranges(), &[range(2, u16::MAX)]);

        alloc.free(1).unwrap();
        alloc.free(0).unwrap();
        assert_eq!(alloc.free_ranges(), &[range(0, u16::MAX)]);
        assert_eq!(alloc.active_count(), 0);
    }

    #[test]
    fn test_freed_id_behind_cursor_not_reused() {
        let mut alloc = IdAllocator::new();
        for _ in 0..4 {
            alloc.allocate().unwrap(); // 0..=3
        }
        alloc.free(1).unwrap();
        assert_eq!(alloc.allocate().unwrap(), 4);
        assert!(alloc.is_active(4));
        assert!(!alloc.is_active(1));
    }

    #[test]
    fn test_wraparound_to_first_range() {
        let mut alloc = IdAllocator::new();
        let mut ids = Vec::new();
        for _ in 0..ID_SPACE {
            ids.push(alloc.allocate().unwrap());
        }
        assert!(alloc.free_ranges().is_empty());
        assert!(alloc.allocate().is_err());

        // The failed call still advanced the cursor to 1.
        alloc.free(0).unwrap();
        alloc.free(10).unwrap();
        assert_eq!(alloc.allocate().unwrap(), 10);
        assert_eq!(alloc.allocate().unwrap(), 0);
    }

    #[test]
    fn test_allocate_all_then_free_all_restores_single_range() {
        let mut alloc = IdAllocator::new();
        let mut ids: Vec<u16> = (0..ID_SPACE).map(|_| alloc.allocate().unwrap()).collect();

        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ID_SPACE);

        // Deterministic shuffle: odd positions, then evens in reverse.
        let odds: Vec<u16> = ids.iter().copied().skip(1).step_by(2).collect();
        let mut evens: Vec<u16> = ids.iter().copied().step_by(2).collect();
        evens.reverse();
        ids = odds.into_iter().chain(evens).collect();

        for (n, id) in ids.into_iter().enumerate() {
            alloc.free(id).unwrap();
            if n % 4096 == 0 {
                assert_well_formed(&alloc);
            }
        }
        assert_eq!(alloc.free_ranges(), &[range(0, u16::MAX)]);
    }

    #[test]
    fn test_allocated_ids_never_active_twice() {
        let mut alloc = IdAllocator::new();
        let mut held = std::collections::HashSet::new();
        for step in 0..2000u32 {
            if step % 3 == 2 {
                let victim = *held.iter().next().unwrap();
                held.remove(&victim);
                alloc.free(victim).unwrap();
            } else {
                let id = alloc.allocate().unwrap();
                assert!(held.insert(id), "id {} handed out twice", id);
            }
        }
        assert_eq!(alloc.active_count(), held.len());
        assert_well_formed(&alloc);
    }

    #[test]
    fn test_interior_allocation_splits_range() {
        let mut alloc = IdAllocator::new();
        for _ in 0..10 {
            alloc.allocate().unwrap();
        }
        for id in 0..10 {
            alloc.free(id).unwrap();
        }
        assert_eq!(alloc.free_ranges(), &[range(0, u16::MAX)]);

        assert_eq!(alloc.allocate().unwrap(), 10);
        assert_eq!(alloc.free_ranges(), &[range(0, 9), range(11, u16::MAX)]);
    }

    #[test]
    fn test_edges_of_id_space() {
        let mut alloc = IdAllocator::new();
        let all: Vec<u16> = (0..ID_SPACE).map(|_| alloc.allocate().unwrap()).collect();
        assert_eq!(all[ID_SPACE - 1], u16::MAX);

        alloc.free(u16::MAX).unwrap();
        alloc.free(0).unwrap();
        assert_eq!(alloc.free_ranges(), &[range(0, 0), range(u16::MAX, u16::MAX)]);
        alloc.free(u16::MAX - 1).unwrap();
        assert_eq!(
            alloc.free_ranges(),
            &[range(0, 0), range(u16::MAX - 1, u16::MAX)]
        );
    }
}
