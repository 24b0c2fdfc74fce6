// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Expiry-ordered flow heaps.
//!
//! Two binary min-heaps over arena indices, ordered by absolute expiry:
//! one for best-effort flows and one for flows inside their guarantee
//! window.  Every flow records its heap slot, so expiry changes re-sift in
//! place in O(log n).  The capacity bound spans both heaps.

use crate::table::{FlowArena, FlowIdx};
use crate::time::Moment;

/// Index of the best-effort heap.
pub(crate) const BEST_EFFORT: usize = 0;
/// Index of the guaranteed heap.
pub(crate) const GUARANTEED: usize = 1;

/// Default capacity: effectively unbounded.
pub(crate) const DEFAULT_CAPACITY: usize = 0x7FFF_FFFF;

#[derive(Debug)]
pub(crate) struct FlowHeap {
    heaps: [Vec<FlowIdx>; 2],
    capacity: usize,
}

impl FlowHeap {
    pub(crate) fn new(capacity: usize) -> FlowHeap {
        FlowHeap {
            heaps: [Vec::new(), Vec::new()],
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.heaps[0].len() + self.heaps[1].len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    fn which(guaranteed: bool) -> usize {
        usize::from(guaranteed)
    }

    /// The soonest-expiring flow of one heap.
    pub(crate) fn top(&self, which: usize) -> Option<FlowIdx> {
        self.heaps[which].first().copied()
    }

    /// Insert a flow; its `guaranteed` flag picks the heap.
    pub(crate) fn insert(&mut self, arena: &mut FlowArena, idx: FlowIdx) {
        let which = Self::which(arena.get(idx).guaranteed);
        self.heaps[which].push(idx);
        let pos = self.heaps[which].len() - 1;
        arena.get_mut(idx).heap_place = pos;
        self.sift_up(arena, which, pos);
    }

    /// Remove a flow from whichever heap holds it.
    pub(crate) fn remove(&mut self, arena: &mut FlowArena, idx: FlowIdx) {
        let which = Self::which(arena.get(idx).guaranteed);
        let pos = arena.get(idx).heap_place;
        debug_assert_eq!(self.heaps[which][pos], idx);
        self.remove_at(arena, which, pos);
    }

    /// Update a flow's expiry (and possibly its guarantee), restoring
    /// heap order in place.
    pub(crate) fn change_expiry(
        &mut self,
        arena: &mut FlowArena,
        idx: FlowIdx,
        guaranteed: bool,
        expiry: Moment,
    ) {
        let flow = arena.get_mut(idx);
        let was_guaranteed = flow.guaranteed;
        flow.expiry = expiry;
        let pos = flow.heap_place;
        if was_guaranteed == guaranteed {
            let which = Self::which(guaranteed);
            debug_assert_eq!(self.heaps[which][pos], idx);
            self.sift_down(arena, which, pos);
            self.sift_up(arena, which, arena.get(idx).heap_place);
        } else {
            self.remove_at(arena, Self::which(was_guaranteed), pos);
            arena.get_mut(idx).guaranteed = guaranteed;
            self.insert(arena, idx);
        }
    }

    fn remove_at(&mut self, arena: &mut FlowArena, which: usize, pos: usize) {
        let last = self.heaps[which].len() - 1;
        self.heaps[which].swap(pos, last);
        self.heaps[which].pop();
        if pos <= last && pos < self.heaps[which].len() {
            let moved = self.heaps[which][pos];
            arena.get_mut(moved).heap_place = pos;
            self.sift_down(arena, which, pos);
            self.sift_up(arena, which, arena.get(moved).heap_place);
        }
    }

    fn less(arena: &FlowArena, a: FlowIdx, b: FlowIdx) -> bool {
        arena.get(a).expiry < arena.get(b).expiry
    }

    fn sift_up(&mut self, arena: &mut FlowArena, which: usize, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if Self::less(arena, self.heaps[which][pos], self.heaps[which][parent]) {
                self.heaps[which].swap(pos, parent);
                arena.get_mut(self.heaps[which][pos]).heap_place = pos;
                arena.get_mut(self.heaps[which][parent]).heap_place = parent;
                pos = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, arena: &mut FlowArena, which: usize, mut pos: usize) {
        let len = self.heaps[which].len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = pos;
            if Self::less(arena, self.heaps[which][left], self.heaps[which][smallest]) {
                smallest = left;
            }
            if right < len && Self::less(arena, self.heaps[which][right], self.heaps[which][smallest])
            {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.heaps[which].swap(pos, smallest);
            arena.get_mut(self.heaps[which][pos]).heap_place = pos;
            arena.get_mut(self.heaps[which][smallest]).heap_place = smallest;
            pos = smallest;
        }
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self, arena: &FlowArena) {
        for which in 0..2 {
            for (pos, &idx) in self.heaps[which].iter().enumerate() {
                let flow = arena.get(idx);
                assert_eq!(flow.heap_place, pos, "stale heap place for flow {idx}");
                assert_eq!(
                    usize::from(flow.guaranteed),
                    which,
                    "flow {idx} in the wrong heap"
                );
                if pos > 0 {
                    let parent = self.heaps[which][(pos - 1) / 2];
                    assert!(
                        arena.get(parent).expiry <= flow.expiry,
                        "heap order violated at {pos}"
                    );
                }
            }
        }
    }
}
