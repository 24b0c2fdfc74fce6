// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Pluggable allocation strategies.
//!
//! An [`IpMapper`] chooses among several patterns for a new flow.  The
//! round-robin mapper spreads flows across backends; the consistent-hash
//! mapper pins each source address to a backend and keeps most pins
//! stable as backends come and go.

use crate::flowid::FlowId;
use crate::pattern::Pattern;
use core::fmt::Debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A mapper's decision: the rewritten identifier plus the output ports
/// of the backend that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapperRewrite {
    /// The rewritten flow identifier.
    pub flowid: FlowId,
    /// Output for the forward direction.
    pub foutput: u16,
    /// Output for the reply direction.
    pub routput: u16,
}

/// One backend of a mapper: a pattern and its output ports.
#[derive(Debug, Clone)]
pub struct MapperPattern {
    /// The rewrite template.
    pub pattern: Arc<Pattern>,
    /// Output for the forward direction.
    pub foutput: u16,
    /// Output for the reply direction.
    pub routput: u16,
}

/// A strategy producing rewrite decisions for flows with no mapping.
pub trait IpMapper: Debug + Send + Sync {
    /// Produce a rewritten identifier for `flowid`, or `None` to drop.
    /// `occupied` probes the reply map for collision avoidance.
    fn rewrite_flowid(
        &self,
        flowid: &FlowId,
        occupied: &dyn Fn(&FlowId) -> bool,
    ) -> Option<MapperRewrite>;

    /// The highest (forward, reply) output ports this mapper can emit
    /// on; used for configuration-time validation.
    fn max_outputs(&self) -> (u16, u16);
}

fn max_outputs_of(backends: &[MapperPattern]) -> (u16, u16) {
    backends.iter().fold((0, 0), |(f, r), b| {
        (f.max(b.foutput), r.max(b.routput))
    })
}

/// Error raised when a mapper is built without backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("mapper needs at least one pattern")]
pub struct NoBackends;

/// Tries its backends in rotation, starting after the last success.
#[derive(Debug)]
pub struct RoundRobinMapper {
    backends: Vec<MapperPattern>,
    next: AtomicUsize,
}

impl RoundRobinMapper {
    /// Build a round-robin mapper over `backends`.
    ///
    /// # Errors
    ///
    /// Returns [`NoBackends`] when the list is empty.
    pub fn new(backends: Vec<MapperPattern>) -> Result<RoundRobinMapper, NoBackends> {
        if backends.is_empty() {
            return Err(NoBackends);
        }
        Ok(RoundRobinMapper {
            backends,
            next: AtomicUsize::new(0),
        })
    }
}

impl IpMapper for RoundRobinMapper {
    fn rewrite_flowid(
        &self,
        flowid: &FlowId,
        occupied: &dyn Fn(&FlowId) -> bool,
    ) -> Option<MapperRewrite> {
        let len = self.backends.len();
        let start = self.next.load(Ordering::Relaxed) % len;
        for i in 0..len {
            let at = (start + i) % len;
            let backend = &self.backends[at];
            if let Some(rewritten) = backend.pattern.rewrite_flowid(flowid, occupied) {
                self.next.store((at + 1) % len, Ordering::Relaxed);
                return Some(MapperRewrite {
                    flowid: rewritten,
                    foutput: backend.foutput,
                    routput: backend.routput,
                });
            }
        }
        None
    }

    fn max_outputs(&self) -> (u16, u16) {
        max_outputs_of(&self.backends)
    }
}

#[derive(Debug, Clone, Copy)]
struct HashNode {
    key: u32,
    backend: u16,
}

/// Consistent-hash mapper keyed on the source address.
///
/// Each backend receives `num_nodes` pseudo-random sort keys drawn from a
/// seeded generator in ascending backend-id order, so re-building the
/// mapper with an extra backend leaves the existing keys unchanged and
/// only around `1/n` of the address space remaps.  The keys live in a
/// complete binary tree stored breadth-first; lookup finds the smallest
/// key not below the hashed address, wrapping to the overall smallest.
#[derive(Debug)]
pub struct SourceHashMapper {
    tree: Vec<HashNode>,
    backends: Vec<MapperPattern>,
}

impl SourceHashMapper {
    /// Build a consistent-hash mapper.  `servers` pairs a stable backend
    /// id with its pattern; ids need not be contiguous.
    ///
    /// # Errors
    ///
    /// Returns [`NoBackends`] when `servers` is empty or `num_nodes` is
    /// zero.
    pub fn new(
        seed: u64,
        num_nodes: usize,
        servers: Vec<(u16, MapperPattern)>,
    ) -> Result<SourceHashMapper, NoBackends> {
        if servers.is_empty() || num_nodes == 0 {
            return Err(NoBackends);
        }
        let mut servers = servers;
        servers.sort_by_key(|(id, _)| *id);
        let max_id = servers.last().map(|(id, _)| *id).unwrap_or_default();

        // Draw keys for every id up to the maximum so that a backend's
        // keys depend only on its id and the seed, never on which other
        // backends exist.
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut nodes = Vec::with_capacity(servers.len() * num_nodes);
        let mut backend = 0u16;
        for id in 0..=max_id {
            let present = servers.iter().any(|(sid, _)| *sid == id);
            for _ in 0..num_nodes {
                let key = rng.random::<u32>() & 0x7FFF_FFFF;
                if present {
                    nodes.push(HashNode { key, backend });
                }
            }
            if present {
                backend += 1;
            }
        }
        nodes.sort_by_key(|n| n.key);

        // Lay the sorted keys into a complete binary tree in BFS order:
        // an in-order traversal of that tree visits slots in sorted
        // order.
        let mut tree = vec![HashNode { key: 0, backend: 0 }; nodes.len()];
        let mut source = nodes.into_iter();
        fill_in_order(&mut tree, 0, &mut source);

        Ok(SourceHashMapper {
            tree,
            backends: servers.into_iter().map(|(_, b)| b).collect(),
        })
    }

    /// Hash a source address to a 31-bit search key, mixing the low byte
    /// into the high bits so adjacent addresses spread out.
    fn hash_addr(addr: std::net::Ipv4Addr) -> u32 {
        let x = u32::from(addr);
        let low = x & 0xFF;
        (x.wrapping_mul((low << 24) | 1)) % 0x7FFF_FFFF
    }

    fn search(&self, key: u32) -> &HashNode {
        let mut i = 0;
        let mut candidate: Option<&HashNode> = None;
        while i < self.tree.len() {
            let node = &self.tree[i];
            if key == node.key {
                return node;
            } else if key > node.key {
                i = 2 * i + 2;
            } else {
                candidate = Some(node);
                i = 2 * i + 1;
            }
        }
        candidate.unwrap_or(&self.tree[0])
    }

    /// The backend index a source address maps to; exposed for tests and
    /// operational inspection.
    #[must_use]
    pub fn backend_for(&self, addr: std::net::Ipv4Addr) -> u16 {
        self.search(Self::hash_addr(addr)).backend
    }
}

fn fill_in_order(
    tree: &mut [HashNode],
    at: usize,
    source: &mut impl Iterator<Item = HashNode>,
) {
    if at >= tree.len() {
        return;
    }
    fill_in_order(tree, 2 * at + 1, source);
    if let Some(node) = source.next() {
        tree[at] = node;
    }
    fill_in_order(tree, 2 * at + 2, source);
}

impl IpMapper for SourceHashMapper {
    fn rewrite_flowid(
        &self,
        flowid: &FlowId,
        occupied: &dyn Fn(&FlowId) -> bool,
    ) -> Option<MapperRewrite> {
        let backend = &self.backends[usize::from(self.backend_for(flowid.saddr))];
        let rewritten = backend.pattern.rewrite_flowid(flowid, occupied)?;
        Some(MapperRewrite {
            flowid: rewritten,
            foutput: backend.foutput,
            routput: backend.routput,
        })
    }

    fn max_outputs(&self) -> (u16, u16) {
        max_outputs_of(&self.backends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn backend(n: u8) -> MapperPattern {
        MapperPattern {
            pattern: Arc::new(
                Pattern::parse(&[&format!("1.0.0.{n}"), "9000-14000", "-", "-"]).unwrap(),
            ),
            foutput: 0,
            routput: 1,
        }
    }

    fn flow(last_octet: u8) -> FlowId {
        FlowId::new(
            Ipv4Addr::new(10, 0, 0, last_octet),
            33000,
            Ipv4Addr::new(2, 0, 0, 2),
            80,
        )
    }

    #[test]
    fn round_robin_rotates_backends() {
        let mapper = RoundRobinMapper::new(vec![backend(1), backend(2), backend(3)]).unwrap();
        let free = |_: &FlowId| false;
        let a = mapper.rewrite_flowid(&flow(1), &free).unwrap();
        let b = mapper.rewrite_flowid(&flow(2), &free).unwrap();
        let c = mapper.rewrite_flowid(&flow(3), &free).unwrap();
        let d = mapper.rewrite_flowid(&flow(4), &free).unwrap();
        assert_eq!(a.flowid.saddr, Ipv4Addr::new(1, 0, 0, 1));
        assert_eq!(b.flowid.saddr, Ipv4Addr::new(1, 0, 0, 2));
        assert_eq!(c.flowid.saddr, Ipv4Addr::new(1, 0, 0, 3));
        assert_eq!(d.flowid.saddr, Ipv4Addr::new(1, 0, 0, 1));
    }

    #[test]
    fn round_robin_skips_exhausted_backends() {
        let exhausted = MapperPattern {
            pattern: Arc::new(Pattern::parse(&["1.0.0.1", "9000-9000", "-", "-"]).unwrap()),
            foutput: 0,
            routput: 1,
        };
        let taken = FlowId::new(
            Ipv4Addr::new(2, 0, 0, 2),
            80,
            Ipv4Addr::new(1, 0, 0, 1),
            9000,
        );
        let mapper = RoundRobinMapper::new(vec![exhausted, backend(2)]).unwrap();
        let out = mapper
            .rewrite_flowid(&flow(1), &move |probe| *probe == taken)
            .unwrap();
        assert_eq!(out.flowid.saddr, Ipv4Addr::new(1, 0, 0, 2));
    }

    #[test]
    fn round_robin_empty_is_rejected() {
        assert_eq!(RoundRobinMapper::new(Vec::new()).unwrap_err(), NoBackends);
    }

    #[test]
    fn consistent_hash_is_deterministic() {
        let servers = vec![(0, backend(1)), (1, backend(2)), (2, backend(3))];
        let a = SourceHashMapper::new(0x5EED, 8, servers.clone()).unwrap();
        let b = SourceHashMapper::new(0x5EED, 8, servers).unwrap();
        for n in 0..=255u8 {
            let addr = Ipv4Addr::new(10, 0, 0, n);
            assert_eq!(a.backend_for(addr), b.backend_for(addr));
        }
    }

    #[test]
    fn consistent_hash_uses_all_backends() {
        let servers = vec![(0, backend(1)), (1, backend(2)), (2, backend(3))];
        let mapper = SourceHashMapper::new(0x5EED, 16, servers).unwrap();
        let mut seen = [false; 3];
        for n in 0..=255u8 {
            for m in 0..4u8 {
                let addr = Ipv4Addr::new(10, 0, m, n);
                seen[usize::from(mapper.backend_for(addr))] = true;
            }
        }
        assert!(seen.iter().all(|s| *s), "some backend never selected");
    }

    #[test]
    fn adding_a_backend_remaps_a_minority() {
        let three = SourceHashMapper::new(
            0x5EED,
            16,
            vec![(0, backend(1)), (1, backend(2)), (2, backend(3))],
        )
        .unwrap();
        let four = SourceHashMapper::new(
            0x5EED,
            16,
            vec![
                (0, backend(1)),
                (1, backend(2)),
                (2, backend(3)),
                (3, backend(4)),
            ],
        )
        .unwrap();

        let mut stable = 0usize;
        let mut total = 0usize;
        for n in 0..=255u8 {
            let addr = Ipv4Addr::new(10, 0, 0, n);
            total += 1;
            if three.backend_for(addr) == four.backend_for(addr) {
                stable += 1;
            }
        }
        // Roughly 1/4 of the space should remap; a clear majority stays.
        assert!(
            stable * 10 >= total * 6,
            "only {stable} of {total} bindings survived"
        );
    }

    #[test]
    fn mapper_reports_max_outputs() {
        let mut b = backend(1);
        b.foutput = 3;
        b.routput = 7;
        let mapper = RoundRobinMapper::new(vec![backend(2), b]).unwrap();
        assert_eq!(mapper.max_outputs(), (3, 7));
    }
}
