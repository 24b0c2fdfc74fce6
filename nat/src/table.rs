// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The shared flow domain: arena, maps, heap, and per-input counters.
//!
//! Rewriters that share a capacity bound share one [`FlowTable`].  Every
//! rewriter registers one map per protocol family it keys on, and one
//! input record per input spec; flows reference their owner input and the
//! maps their two entries live in, so garbage collection can tear a flow
//! down no matter which rewriter installed it.
//!
//! The table is shared through [`SharedFlowTable`], a mutex'd handle;
//! within a worker all access is sequential, the lock exists for the
//! configurations that split rewriters across workers.

use crate::flow::{Direction, Flow};
use crate::flowid::FlowId;
use crate::heap::{BEST_EFFORT, DEFAULT_CAPACITY, FlowHeap, GUARANTEED};
use crate::time::{Moment, TimeoutPair};
use ahash::RandomState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Arena index of a flow.
pub(crate) type FlowIdx = usize;

/// Identifies one hash map inside a [`FlowTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapId(pub(crate) usize);

/// Identifies one input-spec record inside a [`FlowTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputId(pub(crate) usize);

#[cfg(test)]
impl MapId {
    pub(crate) fn for_tests() -> MapId {
        MapId(0)
    }
}

#[cfg(test)]
impl InputId {
    pub(crate) fn for_tests() -> InputId {
        InputId(0)
    }
}

/// A map entry: which flow, which direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryRef {
    pub flow: FlowIdx,
    pub dir: Direction,
}

pub(crate) type FlowMap = HashMap<FlowId, EntryRef, RandomState>;

/// Per-input bookkeeping: statistics and the owner's base timeout pair
/// (used to compute the post-guarantee expiry).
#[derive(Debug)]
pub(crate) struct InputState {
    pub port: u16,
    pub count: u64,
    pub failures: u64,
    pub base: TimeoutPair,
}

/// Slot arena holding the flows themselves.
#[derive(Debug, Default)]
pub(crate) struct FlowArena {
    slots: Vec<Option<Flow>>,
    free: Vec<FlowIdx>,
}

impl FlowArena {
    fn insert(&mut self, flow: Flow) -> FlowIdx {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(flow);
            idx
        } else {
            self.slots.push(Some(flow));
            self.slots.len() - 1
        }
    }

    fn take(&mut self, idx: FlowIdx) -> Flow {
        let flow = self.slots[idx].take().expect("freeing a dead flow");
        self.free.push(idx);
        flow
    }

    pub(crate) fn get(&self, idx: FlowIdx) -> &Flow {
        self.slots[idx].as_ref().expect("stale flow index")
    }

    pub(crate) fn get_mut(&mut self, idx: FlowIdx) -> &mut Flow {
        self.slots[idx].as_mut().expect("stale flow index")
    }

    fn live(&self) -> impl Iterator<Item = (FlowIdx, &Flow)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|flow| (idx, flow)))
    }
}

/// The shared flow domain.
#[derive(Debug)]
pub struct FlowTable {
    arena: FlowArena,
    heap: FlowHeap,
    maps: Vec<FlowMap>,
    inputs: Vec<InputState>,
}

/// A [`FlowTable`] shared between rewriters (and their helpers).
pub type SharedFlowTable = Arc<Mutex<FlowTable>>;

impl Default for FlowTable {
    fn default() -> FlowTable {
        FlowTable::new()
    }
}

impl FlowTable {
    /// An empty table with an effectively unbounded capacity.
    #[must_use]
    pub fn new() -> FlowTable {
        FlowTable::with_capacity(DEFAULT_CAPACITY)
    }

    /// An empty table bounded to `capacity` flows.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> FlowTable {
        FlowTable {
            arena: FlowArena::default(),
            heap: FlowHeap::new(capacity),
            maps: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// Wrap this table into its shared handle.
    #[must_use]
    pub fn shared(self) -> SharedFlowTable {
        Arc::new(Mutex::new(self))
    }

    /// Register a new, empty flow map.
    pub fn register_map(&mut self) -> MapId {
        self.maps.push(FlowMap::default());
        MapId(self.maps.len() - 1)
    }

    pub(crate) fn register_input(&mut self, port: u16, base: TimeoutPair) -> InputId {
        self.inputs.push(InputState {
            port,
            count: 0,
            failures: 0,
            base,
        });
        InputId(self.inputs.len() - 1)
    }

    pub(crate) fn lookup(&self, map: MapId, flowid: &FlowId) -> Option<EntryRef> {
        self.maps[map.0].get(flowid).copied()
    }

    pub(crate) fn map(&self, map: MapId) -> &FlowMap {
        &self.maps[map.0]
    }

    pub(crate) fn flow(&self, idx: FlowIdx) -> &Flow {
        self.arena.get(idx)
    }

    pub(crate) fn flow_mut(&mut self, idx: FlowIdx) -> &mut Flow {
        self.arena.get_mut(idx)
    }

    /// Install a fully-formed flow: both map entries, the heap slot, and
    /// the owner's count.  Runs admission control; returns `None` (and
    /// counts a failure) when capacity pressure destroyed the new flow
    /// itself.
    pub(crate) fn install(&mut self, flow: Flow, now: Moment) -> Option<EntryRef> {
        let owner = flow.owner;
        let maps = flow.maps;
        let fwd_key = flow.entries[0].flowid;
        let rev_key = flow.entries[1].flowid;
        let idx = self.arena.insert(flow);
        trace!("installing flow {fwd_key} (idx {idx})");

        let old = self.maps[maps[0].0].insert(
            fwd_key,
            EntryRef {
                flow: idx,
                dir: Direction::Forward,
            },
        );
        debug_assert!(old.is_none(), "forward key already mapped");

        let old = self.maps[maps[1].0].insert(
            rev_key,
            EntryRef {
                flow: idx,
                dir: Direction::Reverse,
            },
        );
        self.inputs[owner.0].count += 1;
        self.heap.insert(&mut self.arena, idx);
        if let Some(old) = old
            && old.flow != idx
        {
            // A stale flow still claimed our reply key; evict it.
            self.destroy(old.flow);
        }

        if self.heap.len() > self.heap.capacity() && self.shrink_for_new_flow(idx, now) {
            self.inputs[owner.0].failures += 1;
            return None;
        }
        Some(EntryRef {
            flow: idx,
            dir: Direction::Forward,
        })
    }

    /// Tear a flow down: unmap both entries, drop the heap slot, release
    /// the arena slot.
    pub(crate) fn destroy(&mut self, idx: FlowIdx) {
        self.heap.remove(&mut self.arena, idx);
        let flow = self.arena.take(idx);
        for dir in [Direction::Forward, Direction::Reverse] {
            let key = flow.entries[dir.index()].flowid;
            let map = &mut self.maps[flow.maps[dir.index()].0];
            if map.get(&key).is_some_and(|entry| entry.flow == idx) {
                map.remove(&key);
            }
        }
        let count = &mut self.inputs[flow.owner.0].count;
        *count = count.saturating_sub(1);
        trace!("destroyed flow {} (idx {idx})", flow.entries[0].flowid);
    }

    /// Record an allocation failure against an input.
    pub(crate) fn note_failure(&mut self, input: InputId) {
        self.inputs[input.0].failures += 1;
    }

    pub(crate) fn input(&self, input: InputId) -> &InputState {
        &self.inputs[input.0]
    }

    pub(crate) fn reset_input(&mut self, input: InputId) {
        let state = &mut self.inputs[input.0];
        state.count = 0;
        state.failures = 0;
    }

    /// Update a flow's expiry, moving it between heaps if its guarantee
    /// status changed.
    pub(crate) fn refresh(&mut self, idx: FlowIdx, guaranteed: bool, expiry: Moment) {
        self.heap.change_expiry(&mut self.arena, idx, guaranteed, expiry);
    }

    /// Shift flows whose guarantee has elapsed onto the best-effort heap,
    /// extending their expiry by the owner's remaining base timeout.
    fn shift_guaranteed(&mut self, now: Moment) {
        while let Some(top) = self.heap.top(GUARANTEED) {
            if !self.arena.get(top).expired(now) {
                break;
            }
            let flow = self.arena.get(top);
            let base = self.inputs[flow.owner.0].base;
            let extension = u64::from(base.timeout.saturating_sub(base.guarantee));
            let new_expiry = flow.expiry.plus_secs(extension);
            self.heap
                .change_expiry(&mut self.arena, top, false, new_expiry);
        }
    }

    /// Destroy one flow to admit `new_idx`; honoring guarantees may mean
    /// destroying the new flow itself.  Returns true in that case.
    fn shrink_for_new_flow(&mut self, new_idx: FlowIdx, now: Moment) -> bool {
        self.shift_guaranteed(now);
        let victim = self.heap.top(BEST_EFFORT).unwrap_or(new_idx);
        self.destroy(victim);
        victim == new_idx
    }

    /// The garbage-collection sweep: age out guarantees, destroy expired
    /// best-effort flows, then enforce the capacity bound.
    pub fn gc(&mut self, now: Moment) {
        let before = self.size();
        self.shift_guaranteed(now);
        while let Some(top) = self.heap.top(BEST_EFFORT) {
            if !self.arena.get(top).expired(now) {
                break;
            }
            self.destroy(top);
        }
        while self.heap.len() > self.heap.capacity() {
            let which = if self.heap.top(BEST_EFFORT).is_some() {
                BEST_EFFORT
            } else {
                GUARANTEED
            };
            if let Some(top) = self.heap.top(which) {
                self.destroy(top);
            }
        }
        let after = self.size();
        if after != before {
            debug!("gc reaped {} flows, {} live", before - after, after);
        }
    }

    /// Evict every flow.
    pub fn clear(&mut self) {
        loop {
            let top = self
                .heap
                .top(BEST_EFFORT)
                .or_else(|| self.heap.top(GUARANTEED));
            match top {
                Some(idx) => self.destroy(idx),
                None => break,
            }
        }
    }

    /// Destroy the flows created by one input and reset its counters
    /// (used when an input spec is rewritten at runtime).
    pub(crate) fn destroy_input_flows(&mut self, input: InputId) {
        let doomed: Vec<FlowIdx> = self
            .arena
            .live()
            .filter(|(_, flow)| flow.owner == input)
            .map(|(idx, _)| idx)
            .collect();
        for idx in doomed {
            self.destroy(idx);
        }
        self.reset_input(input);
    }

    /// Number of live flows.
    #[must_use]
    pub fn size(&self) -> usize {
        self.heap.len()
    }

    /// The capacity bound.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.heap.capacity()
    }

    /// Resize the capacity bound; the next sweep enforces it.
    pub fn set_capacity(&mut self, capacity: usize, now: Moment) {
        self.heap.set_capacity(capacity);
        self.gc(now);
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        self.heap.check_invariants(&self.arena);
        let mut live = 0;
        for (idx, flow) in self.arena.live() {
            live += 1;
            for dir in [Direction::Forward, Direction::Reverse] {
                let key = flow.entries[dir.index()].flowid;
                let entry = self.maps[flow.maps[dir.index()].0]
                    .get(&key)
                    .unwrap_or_else(|| panic!("flow {idx} missing its {dir:?} map entry"));
                assert_eq!(entry.flow, idx);
                assert_eq!(entry.dir, dir);
            }
        }
        assert_eq!(live, self.heap.len(), "arena and heap disagree");
        let mapped: usize = self.maps.iter().map(HashMap::len).sum();
        assert_eq!(mapped, 2 * live, "map size is not twice the flow count");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::RewriteScope;
    use net::ip::IpProto;
    use std::net::Ipv4Addr;

    fn flowid(n: u8) -> FlowId {
        FlowId::new(
            Ipv4Addr::new(10, 0, 0, n),
            33000,
            Ipv4Addr::new(2, 0, 0, 2),
            80,
        )
    }

    fn rewritten(n: u8) -> FlowId {
        FlowId::new(
            Ipv4Addr::new(1, 0, 0, 1),
            9000 + u16::from(n),
            Ipv4Addr::new(2, 0, 0, 2),
            80,
        )
    }

    struct Fixture {
        table: FlowTable,
        map: MapId,
        input: InputId,
    }

    fn fixture(capacity: usize, guarantee: u32) -> Fixture {
        let mut table = FlowTable::with_capacity(capacity);
        let map = table.register_map();
        let input = table.register_input(
            0,
            TimeoutPair {
                timeout: 300,
                guarantee,
            },
        );
        Fixture { table, map, input }
    }

    fn add_flow(fx: &mut Fixture, n: u8, guaranteed: bool, expiry: u64) -> Option<EntryRef> {
        let flow = Flow::new(
            fx.input,
            [fx.map, fx.map],
            flowid(n),
            rewritten(n),
            [0, 1],
            IpProto::TCP,
            RewriteScope::Full,
            guaranteed,
            Moment::from_secs(expiry),
        );
        fx.table.install(flow, Moment::ZERO)
    }

    #[test]
    fn install_links_both_directions() {
        let mut fx = fixture(16, 0);
        add_flow(&mut fx, 1, false, 300).unwrap();
        fx.table.check_invariants();

        let fwd = fx.table.lookup(fx.map, &flowid(1)).unwrap();
        assert_eq!(fwd.dir, Direction::Forward);
        let rev = fx.table.lookup(fx.map, &rewritten(1).reverse()).unwrap();
        assert_eq!(rev.dir, Direction::Reverse);
        assert_eq!(fwd.flow, rev.flow);
        assert_eq!(fx.table.input(fx.input).count, 1);

        // Applying forward then reverse rewrites restores the tuple.
        let flow = fx.table.flow(fwd.flow);
        let out = flow.rewritten_flowid(Direction::Forward);
        assert_eq!(out, rewritten(1));
        assert_eq!(flow.rewritten_flowid(Direction::Reverse), flowid(1).reverse());
    }

    #[test]
    fn gc_reaps_expired_flows_in_order() {
        let mut fx = fixture(16, 0);
        add_flow(&mut fx, 1, false, 100).unwrap();
        add_flow(&mut fx, 2, false, 50).unwrap();
        add_flow(&mut fx, 3, false, 200).unwrap();
        fx.table.check_invariants();

        fx.table.gc(Moment::from_secs(49));
        assert_eq!(fx.table.size(), 3);
        fx.table.gc(Moment::from_secs(120));
        assert_eq!(fx.table.size(), 1);
        assert!(fx.table.lookup(fx.map, &flowid(2)).is_none());
        assert!(fx.table.lookup(fx.map, &flowid(1)).is_none());
        assert!(fx.table.lookup(fx.map, &flowid(3)).is_some());
        fx.table.check_invariants();
    }

    #[test]
    fn capacity_pressure_evicts_oldest_best_effort() {
        let mut fx = fixture(2, 0);
        add_flow(&mut fx, 1, false, 100).unwrap();
        add_flow(&mut fx, 2, false, 50).unwrap();
        // Admitting a third evicts the soonest-expiring (flow 2).
        add_flow(&mut fx, 3, false, 200).unwrap();
        assert_eq!(fx.table.size(), 2);
        assert!(fx.table.lookup(fx.map, &flowid(2)).is_none());
        assert!(fx.table.lookup(fx.map, &flowid(1)).is_some());
        fx.table.check_invariants();
    }

    #[test]
    fn guaranteed_flows_survive_pressure() {
        let mut fx = fixture(2, 5);
        add_flow(&mut fx, 1, true, 100).unwrap();
        add_flow(&mut fx, 2, true, 50).unwrap();
        // No best-effort flow can be reclaimed: the new flow itself dies.
        assert!(add_flow(&mut fx, 3, true, 200).is_none());
        assert_eq!(fx.table.size(), 2);
        assert!(fx.table.lookup(fx.map, &flowid(1)).is_some());
        assert!(fx.table.lookup(fx.map, &flowid(2)).is_some());
        assert!(fx.table.lookup(fx.map, &flowid(3)).is_none());
        assert_eq!(fx.table.input(fx.input).failures, 1);
        fx.table.check_invariants();
    }

    #[test]
    fn elapsed_guarantees_shift_to_best_effort() {
        let mut fx = fixture(16, 5);
        let entry = add_flow(&mut fx, 1, true, 5).unwrap();
        assert!(fx.table.flow(entry.flow).guaranteed);

        fx.table.gc(Moment::from_secs(6));
        // Still alive, now best-effort, expiring 300-5 seconds later.
        let entry = fx.table.lookup(fx.map, &flowid(1)).unwrap();
        let flow = fx.table.flow(entry.flow);
        assert!(!flow.guaranteed);
        assert_eq!(flow.expiry, Moment::from_secs(300));
        fx.table.check_invariants();
    }

    #[test]
    fn refresh_resifts_in_place() {
        let mut fx = fixture(16, 0);
        let a = add_flow(&mut fx, 1, false, 100).unwrap();
        let b = add_flow(&mut fx, 2, false, 200).unwrap();
        // Push the first flow's expiry past the second.
        fx.table.refresh(a.flow, false, Moment::from_secs(500));
        fx.table.check_invariants();
        fx.table.gc(Moment::from_secs(250));
        assert!(fx.table.lookup(fx.map, &flowid(1)).is_some());
        assert!(fx.table.lookup(fx.map, &flowid(2)).is_none());
        let _ = b;
    }

    #[test]
    fn clear_empties_everything() {
        let mut fx = fixture(16, 0);
        for n in 1..=5 {
            add_flow(&mut fx, n, n % 2 == 0, 100 + u64::from(n)).unwrap();
        }
        fx.table.clear();
        assert_eq!(fx.table.size(), 0);
        assert_eq!(fx.table.input(fx.input).count, 0);
        fx.table.check_invariants();
    }

    #[test]
    fn destroy_input_flows_resets_counters() {
        let mut fx = fixture(16, 0);
        add_flow(&mut fx, 1, false, 100).unwrap();
        add_flow(&mut fx, 2, false, 100).unwrap();
        fx.table.note_failure(fx.input);
        fx.table.destroy_input_flows(fx.input);
        assert_eq!(fx.table.size(), 0);
        assert_eq!(fx.table.input(fx.input).count, 0);
        assert_eq!(fx.table.input(fx.input).failures, 0);
    }

    #[test]
    fn arena_reuses_slots() {
        let mut fx = fixture(16, 0);
        let a = add_flow(&mut fx, 1, false, 100).unwrap();
        fx.table.destroy(a.flow);
        let b = add_flow(&mut fx, 2, false, 100).unwrap();
        assert_eq!(a.flow, b.flow, "freed slot should be reused");
        fx.table.check_invariants();
    }
}
