// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! ICMP companions to the TCP/UDP rewriter.
//!
//! [`IcmpPingRewriter`] translates echo requests and replies, keying
//! flows on `(saddr, identifier, daddr, identifier)`.  Requests create
//! mappings through the usual input specs; replies with no mapping are
//! passed or dropped per the spec.
//!
//! [`IcmpErrorRewriter`] handles error messages (unreachable, time
//! exceeded, and friends) by reversing the mapping that matches the
//! *embedded* header, searching an ordered list of rewriters.

use crate::flow::{AnnoConfig, Flow, RewriteScope};
use crate::flowid::FlowId;
use crate::rewriter::{InputSpec, Rewriter, SpecKind, Verdict, resolve_spec};
use crate::spec::{InputSpecConfig, SpecError};
use crate::table::{MapId, SharedFlowTable};
use crate::time::{Moment, TimeoutPair};
use net::icmp4;
use net::ip::IpProto;
use net::ipv4::Ipv4;
use net::packet::{ANNO_LEN, Packet};
use std::sync::Arc;
use tracing::debug;

/// Configuration for an [`IcmpPingRewriter`].
#[derive(Debug, Clone)]
pub struct PingRewriterConfig {
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

impl Default for PingRewriterConfig {
    fn default() -> PingRewriterConfig {
        PingRewriterConfig {
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

/// Stateful rewriter for ICMP echo sessions.
#[derive(Debug)]
pub struct IcmpPingRewriter {
    pub(crate) table: SharedFlowTable,
    pub(crate) map: MapId,
    specs: Vec<InputSpec>,
    timeouts: TimeoutPair,
    annos: AnnoConfig,
    gc_interval: u32,
    next_gc: Moment,
}

impl IcmpPingRewriter {
    /// Build a ping rewriter over a shared flow table.
    ///
    /// # Errors
    ///
    /// Returns a [`SpecError`] for out-of-range outputs or a bad
    /// annotation offset.
    pub fn new(
        table: &SharedFlowTable,
        config: &PingRewriterConfig,
    ) -> Result<IcmpPingRewriter, SpecError> {
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
        Ok(IcmpPingRewriter {
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
        })
    }

    fn route_unhandled(&self, port: usize) -> Verdict {
        match self.specs[port].kind {
            SpecKind::Nochange => Verdict::Emit(self.specs[port].foutput),
            _ => Verdict::Drop,
        }
    }

    /// Process one ICMP packet arriving on `port`.
    pub fn push(&mut self, port: usize, pkt: &mut Packet, now: Moment) -> Verdict {
        if port >= self.specs.len() {
            return Verdict::Drop;
        }
        let mut table = self.table.lock().unwrap();
        if now >= self.next_gc {
            table.gc(now);
            self.next_gc = now.plus_secs(u64::from(self.gc_interval));
        }

        let parsed = pkt
            .ipv4()
            .ok()
            .map(|ip| (ip.protocol(), ip.is_first_fragment()));
        let icmp_type = match parsed {
            Some((IpProto::ICMP, true)) if pkt.transport_length() >= 8 => {
                match pkt.icmp() {
                    Ok(icmp) => icmp.icmp_type(),
                    Err(_) => {
                        drop(table);
                        return self.route_unhandled(port);
                    }
                }
            }
            _ => {
                drop(table);
                return self.route_unhandled(port);
            }
        };
        if icmp_type != icmp4::ECHO && icmp_type != icmp4::ECHO_REPLY {
            drop(table);
            return self.route_unhandled(port);
        }

        let Ok(flowid) = FlowId::from_icmp_echo(pkt) else {
            drop(table);
            return self.route_unhandled(port);
        };

        let entry = if let Some(entry) = table.lookup(self.map, &flowid) {
            entry
        } else {
            // Only requests install mappings; a reply without one is
            // routed per the input spec.
            if icmp_type != icmp4::ECHO {
                drop(table);
                return self.route_unhandled(port);
            }
            let spec = &self.specs[port];
            let map = self.map;
            let rewritten = match &spec.kind {
                SpecKind::Drop => return Verdict::Drop,
                SpecKind::Nochange => return Verdict::Emit(spec.foutput),
                SpecKind::Keep => Some(flowid),
                SpecKind::Pattern(pattern) => pattern.rewrite_flowid(&flowid, |id| {
                    // Both "ports" of an echo flow are the identifier, so
                    // normalize the probe before looking it up.
                    let mut probe = *id;
                    probe.sport = probe.dport;
                    table.map(map).contains_key(&probe)
                }),
                SpecKind::Mapper(mapper) => mapper
                    .rewrite_flowid(&flowid, &|id| {
                        let mut probe = *id;
                        probe.sport = probe.dport;
                        table.map(map).contains_key(&probe)
                    })
                    .map(|rewrite| rewrite.flowid),
            };
            let Some(mut rewritten) = rewritten else {
                debug!("ping mapping failure on input {port} for {flowid}");
                table.note_failure(spec.input);
                return Verdict::Drop;
            };
            rewritten.dport = rewritten.sport;
            let flow = Flow::new(
                spec.input,
                [self.map, self.map],
                flowid,
                rewritten,
                [spec.foutput, spec.routput],
                IpProto::ICMP,
                RewriteScope::Full,
                self.timeouts.guarantee != 0,
                now.plus_secs(u64::from(self.timeouts.relevant())),
            );
            let Some(entry) = table.install(flow, now) else {
                return Verdict::Drop;
            };
            if let Some(off) = self.annos.reply_anno {
                table.flow_mut(entry.flow).reply_anno = pkt.meta().anno_u8(usize::from(off));
            }
            debug!("new echo flow {flowid} => {rewritten}");
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

    /// Run a garbage-collection sweep now.
    pub fn gc(&mut self, now: Moment) {
        self.table.lock().unwrap().gc(now);
        self.next_gc = now.plus_secs(u64::from(self.gc_interval));
    }
}

/// Rewrites ICMP error messages by reversing the mapping that matches
/// the embedded header.
#[derive(Debug)]
pub struct IcmpErrorRewriter {
    table: SharedFlowTable,
    transport_maps: Vec<(MapId, MapId)>,
    ping_maps: Vec<MapId>,
    unmapped_output: Option<u16>,
}

impl IcmpErrorRewriter {
    /// Build an error rewriter searching `rewriters` then `pings`, in
    /// order.  With `unmapped_output` set, unmatched packets are emitted
    /// there instead of being dropped.
    ///
    /// # Errors
    ///
    /// Returns a [`SpecError`] when no rewriters are given or they do not
    /// share one flow table.
    pub fn new(
        rewriters: &[&Rewriter],
        pings: &[&IcmpPingRewriter],
        unmapped_output: Option<u16>,
    ) -> Result<IcmpErrorRewriter, SpecError> {
        let table = rewriters
            .first()
            .map(|rw| &rw.table)
            .or_else(|| pings.first().map(|rw| &rw.table))
            .ok_or(SpecError::Unknown("no rewriters supplied".to_string()))?;
        for rw in rewriters {
            if !Arc::ptr_eq(&rw.table, table) {
                return Err(SpecError::TableMismatch);
            }
        }
        for rw in pings {
            if !Arc::ptr_eq(&rw.table, table) {
                return Err(SpecError::TableMismatch);
            }
        }
        Ok(IcmpErrorRewriter {
            table: Arc::clone(table),
            transport_maps: rewriters
                .iter()
                .map(|rw| (rw.tcp_map, rw.udp_map))
                .collect(),
            ping_maps: pings.iter().map(|rw| rw.map).collect(),
            unmapped_output,
        })
    }

    fn unmapped(&self) -> Verdict {
        match self.unmapped_output {
            Some(port) => Verdict::Emit(port),
            None => Verdict::Drop,
        }
    }

    /// Process one packet.
    pub fn push(&self, pkt: &mut Packet) -> Verdict {
        let Ok(ip) = pkt.ipv4() else {
            return Verdict::Drop;
        };
        if ip.protocol() != IpProto::ICMP {
            return Verdict::Drop;
        }
        let Ok(icmp) = pkt.icmp() else {
            return Verdict::Drop;
        };
        if !icmp4::is_error_message(icmp.icmp_type()) {
            return self.unmapped();
        }

        // The embedded IP header sits after the 8-byte ICMP header and
        // must be followed by at least 8 bytes of its own payload.
        let emb_off = pkt.transport_offset() + icmp4::HEADER_LEN;
        let Ok(embedded) = Ipv4::new(&pkt.data()[emb_off.min(pkt.len())..]) else {
            return Verdict::Drop;
        };
        let emb_hlen = embedded.header_len();
        if pkt.transport_length() < icmp4::HEADER_LEN + emb_hlen + 8 {
            return Verdict::Drop;
        }
        let emb_proto = embedded.protocol();
        let emb_src = embedded.src();
        let emb_dst = embedded.dst();
        let ports_off = emb_off + emb_hlen;
        let data = pkt.data();
        let (flow, new_flow) = match emb_proto {
            IpProto::TCP | IpProto::UDP => {
                let flow = FlowId::new(
                    emb_src,
                    u16::from_be_bytes([data[ports_off], data[ports_off + 1]]),
                    emb_dst,
                    u16::from_be_bytes([data[ports_off + 2], data[ports_off + 3]]),
                );
                let table = self.table.lock().unwrap();
                let entry = self.transport_maps.iter().find_map(|(tcp, udp)| {
                    let map = if emb_proto == IpProto::TCP { *tcp } else { *udp };
                    table.lookup(map, &flow.reverse())
                });
                match entry {
                    Some(entry) => (flow, table.flow(entry.flow).entries
                        [entry.dir.flip().index()]
                    .flowid),
                    None => return self.unmapped(),
                }
            }
            IpProto::ICMP => {
                let emb_type = data[ports_off];
                if emb_type != icmp4::ECHO && emb_type != icmp4::ECHO_REPLY {
                    return self.unmapped();
                }
                let id = u16::from_be_bytes([data[ports_off + 4], data[ports_off + 5]]);
                let flow = FlowId::new(emb_src, id, emb_dst, id);
                let table = self.table.lock().unwrap();
                let entry = self
                    .ping_maps
                    .iter()
                    .find_map(|map| table.lookup(*map, &flow.reverse()));
                match entry {
                    Some(entry) => (flow, table.flow(entry.flow).entries
                        [entry.dir.flip().index()]
                    .flowid),
                    None => return self.unmapped(),
                }
            }
            _ => return self.unmapped(),
        };

        // Rewrite the outer destination when it names the mapped
        // endpoint, with a full checksum recomputation.
        if ip.dst() == flow.saddr {
            if let Ok(mut outer) = pkt.ipv4_mut() {
                outer.set_dst(new_flow.saddr);
                outer.recompute_checksum();
            }
        }

        // Reverse the embedded header in place.  Its own IP checksum is
        // left stale, as the original implementation did; end hosts do
        // not validate it inside ICMP payloads.
        let data = pkt.data_mut();
        data[emb_off + 12..emb_off + 16].copy_from_slice(&new_flow.saddr.octets());
        data[emb_off + 16..emb_off + 20].copy_from_slice(&new_flow.daddr.octets());
        match emb_proto {
            IpProto::TCP | IpProto::UDP => {
                data[ports_off..ports_off + 2].copy_from_slice(&new_flow.sport.to_be_bytes());
                data[ports_off + 2..ports_off + 4].copy_from_slice(&new_flow.dport.to_be_bytes());
            }
            _ => {
                data[ports_off + 4..ports_off + 6].copy_from_slice(&new_flow.sport.to_be_bytes());
            }
        }

        if let Ok(mut icmp) = pkt.icmp_mut() {
            icmp.recompute_checksum();
        }
        Verdict::Emit(0)
    }
}
