// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Address-only rewriters: basic NAT without port translation.
//!
//! [`AddrRewriter`] keys on a single address — the source going out, the
//! destination coming back — and rewrites just that field.
//! [`AddrPairRewriter`] keys on the (source, destination) pair and
//! rewrites both.  Both share the flow framework with reduced keys: the
//! unused identifier fields are zero.

use crate::flow::{AnnoConfig, Flow, RewriteScope};
use crate::flowid::FlowId;
use crate::rewriter::{InputSpec, SpecKind, Verdict, resolve_spec};
use crate::spec::{InputSpecConfig, SpecError};
use crate::table::{MapId, SharedFlowTable};
use crate::time::{Moment, TimeoutPair};
use net::packet::{ANNO_LEN, Packet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

/// Configuration shared by the address-only rewriters.
#[derive(Debug, Clone)]
pub struct AddrRewriterConfig {
    /// One spec per input port.
    pub inputs: Vec<InputSpecConfig>,
    /// Number of output ports.
    pub noutputs: u16,
    /// Flow timeout in seconds (default 300).
    pub timeout: u32,
    /// Guarantee window in seconds (default off).
    pub guarantee: u32,
    /// Garbage-collection period (default 900 s).
    pub reap_interval: u32,
    /// Stamp the destination-IP annotation (default on).
    pub dst_anno: bool,
    /// Annotation byte stamped on reply packets, if any.
    pub reply_anno: Option<u8>,
}

impl Default for AddrRewriterConfig {
    fn default() -> AddrRewriterConfig {
        AddrRewriterConfig {
            inputs: Vec::new(),
            noutputs: 1,
            timeout: 300,
            guarantee: 0,
            reap_interval: 900,
            dst_anno: true,
            reply_anno: None,
        }
    }
}

#[derive(Debug)]
struct AddrCore {
    table: SharedFlowTable,
    map: MapId,
    specs: Vec<InputSpec>,
    timeouts: TimeoutPair,
    annos: AnnoConfig,
    gc_interval: u32,
    next_gc: Moment,
    scope: RewriteScope,
}

impl AddrCore {
    fn new(
        table: &SharedFlowTable,
        config: &AddrRewriterConfig,
        scope: RewriteScope,
    ) -> Result<AddrCore, SpecError> {
        if let Some(off) = config.reply_anno
            && usize::from(off) >= ANNO_LEN
        {
            return Err(SpecError::ReplyAnnoOutOfRange(off));
        }
        let mut guard = table.lock().unwrap();
        let map = guard.register_map();
        let base = TimeoutPair {
            timeout: config.timeout,
            guarantee: config.guarantee,
        };
        let mut specs = Vec::with_capacity(config.inputs.len());
        for (port, cfg) in config.inputs.iter().enumerate() {
            let (kind, foutput, routput) = resolve_spec(cfg, config.noutputs, config.noutputs)?;
            let input = guard.register_input(u16::try_from(port).unwrap_or(u16::MAX), base);
            specs.push(InputSpec {
                kind,
                foutput,
                routput,
                input,
                reply_tcp: map,
                reply_udp: map,
            });
        }
        drop(guard);
        Ok(AddrCore {
            table: Arc::clone(table),
            map,
            specs,
            timeouts: base,
            annos: AnnoConfig {
                dst_anno: config.dst_anno,
                reply_anno: config.reply_anno,
            },
            gc_interval: config.reap_interval,
            next_gc: Moment::ZERO.plus_secs(u64::from(config.reap_interval)),
            scope,
        })
    }

    fn route_unhandled(&self, port: usize) -> Verdict {
        match self.specs[port].kind {
            SpecKind::Nochange => Verdict::Emit(self.specs[port].foutput),
            _ => Verdict::Drop,
        }
    }

    fn push(&mut self, port: usize, pkt: &mut Packet, now: Moment) -> Verdict {
        if port >= self.specs.len() {
            return Verdict::Drop;
        }
        let mut table = self.table.lock().unwrap();
        if now >= self.next_gc {
            table.gc(now);
            self.next_gc = now.plus_secs(u64::from(self.gc_interval));
        }

        let Ok(ip) = pkt.ipv4() else {
            drop(table);
            return self.route_unhandled(port);
        };
        let (src, dst) = (ip.src(), ip.dst());
        let pair = self.scope == RewriteScope::AddrPair;
        let forward_key = if pair {
            FlowId::new(src, 0, dst, 0)
        } else {
            FlowId::new(src, 0, Ipv4Addr::UNSPECIFIED, 0)
        };

        let mut entry = table.lookup(self.map, &forward_key);
        if entry.is_none() && !pair {
            // Replies key on the destination address alone.
            entry = table.lookup(
                self.map,
                &FlowId::new(Ipv4Addr::UNSPECIFIED, 0, dst, 0),
            );
        }

        let entry = if let Some(entry) = entry {
            entry
        } else {
            let spec = &self.specs[port];
            let map = self.map;
            let rewritten = match &spec.kind {
                SpecKind::Drop => return Verdict::Drop,
                SpecKind::Nochange => return Verdict::Emit(spec.foutput),
                SpecKind::Keep => Some(forward_key),
                SpecKind::Pattern(pattern) => pattern
                    .rewrite_flowid(&forward_key, |id| table.map(map).contains_key(id)),
                SpecKind::Mapper(mapper) => mapper
                    .rewrite_flowid(&forward_key, &|id| table.map(map).contains_key(id))
                    .map(|rewrite| rewrite.flowid),
            };
            let Some(rewritten) = rewritten else {
                debug!("address mapping failure on input {port} for {src}");
                table.note_failure(spec.input);
                return Verdict::Drop;
            };
            let flow = Flow::new(
                spec.input,
                [self.map, self.map],
                forward_key,
                rewritten,
                [spec.foutput, spec.routput],
                ip.protocol(),
                self.scope,
                self.timeouts.guarantee != 0,
                now.plus_secs(u64::from(self.timeouts.relevant())),
            );
            let Some(entry) = table.install(flow, now) else {
                return Verdict::Drop;
            };
            debug!("new address mapping {src} => {}", rewritten.saddr);
            entry
        };

        let idx = entry.flow;
        let dir = entry.dir;
        let output = table.flow(idx).entries[dir.index()].output;
        let annos = self.annos;
        table.flow_mut(idx).apply(pkt, dir, &annos);

        let (guaranteed, secs) = if self.timeouts.guarantee != 0 {
            (true, self.timeouts.guarantee)
        } else {
            (false, self.timeouts.timeout)
        };
        table.refresh(idx, guaranteed, now.plus_secs(u64::from(secs)));
        Verdict::Emit(output)
    }
}

/// Basic NAT keyed on one address per direction.
#[derive(Debug)]
pub struct AddrRewriter(AddrCore);

impl AddrRewriter {
    /// Build an address rewriter over a shared flow table.
    ///
    /// # Errors
    ///
    /// Returns a [`SpecError`] for out-of-range outputs or a bad
    /// annotation offset.
    pub fn new(
        table: &SharedFlowTable,
        config: &AddrRewriterConfig,
    ) -> Result<AddrRewriter, SpecError> {
        Ok(AddrRewriter(AddrCore::new(
            table,
            config,
            RewriteScope::AddrOnly,
        )?))
    }

    /// Process one packet arriving on `port`.
    pub fn push(&mut self, port: usize, pkt: &mut Packet, now: Moment) -> Verdict {
        self.0.push(port, pkt, now)
    }
}

/// Per-address-pair NAT: keys on (source, destination), rewrites both.
#[derive(Debug)]
pub struct AddrPairRewriter(AddrCore);

impl AddrPairRewriter {
    /// Build an address-pair rewriter over a shared flow table.
    ///
    /// # Errors
    ///
    /// Returns a [`SpecError`] for out-of-range outputs or a bad
    /// annotation offset.
    pub fn new(
        table: &SharedFlowTable,
        config: &AddrRewriterConfig,
    ) -> Result<AddrPairRewriter, SpecError> {
        Ok(AddrPairRewriter(AddrCore::new(
            table,
            config,
            RewriteScope::AddrPair,
        )?))
    }

    /// Process one packet arriving on `port`.
    pub fn push(&mut self, port: usize, pkt: &mut Packet, now: Moment) -> Verdict {
        self.0.push(port, pkt, now)
    }
}
