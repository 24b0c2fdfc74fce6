// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The TCP/UDP rewriter element.
//!
//! Per-packet hot path: validate, look the flow identifier up in the
//! per-protocol map, apply the matched mapping, refresh its expiry, and
//! emit on the mapping's output.  On a miss the input's spec decides:
//! drop, pass unchanged, or allocate a rewritten identifier and install a
//! flow — forward entry in this rewriter's map, reverse entry in the
//! reply rewriter's map (usually its own).

use crate::flow::{AnnoConfig, Flow, RewriteScope};
use crate::flowid::FlowId;
use crate::mapper::{IpMapper, MapperRewrite};
use crate::pattern::Pattern;
use crate::spec::{InputSpecConfig, SpecError};
use crate::table::{InputId, MapId, SharedFlowTable};
use crate::time::{Moment, TcpTimeouts, TimeoutPair, UdpTimeouts};
use net::ip::IpProto;
use net::packet::{ANNO_LEN, Packet};
use std::sync::Arc;
use tracing::debug;

/// What to do with a pushed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Emit the (possibly rewritten) packet on this output port.
    Emit(u16),
    /// The packet was dropped.
    Drop,
}

/// Where a rewriter installs its reverse mappings.  Obtained from the
/// reply rewriter via [`Rewriter::reply_target`]; both elements must
/// share one flow table.
#[derive(Debug, Clone)]
pub struct ReplyTarget {
    pub(crate) table: SharedFlowTable,
    pub(crate) tcp_map: MapId,
    pub(crate) udp_map: MapId,
    pub(crate) noutputs: u16,
}

/// Rewriter configuration: one input spec per input port plus the
/// keyword arguments of the configuration grammar.
#[derive(Debug, Clone)]
pub struct RewriterConfig {
    /// One spec per input port.
    pub inputs: Vec<InputSpecConfig>,
    /// Number of output ports.
    pub noutputs: u16,
    /// `TCP_TIMEOUT`: flows that have carried data (default 24 h).
    pub tcp_timeout: u32,
    /// `TCP_DONE_TIMEOUT`: both sides closed (default 240 s).
    pub tcp_done_timeout: u32,
    /// `TCP_NODATA_TIMEOUT`: no payload seen yet (default 300 s).
    pub tcp_nodata_timeout: u32,
    /// `UDP_TIMEOUT` (default 300 s).
    pub udp_timeout: u32,
    /// `UDP_STREAMING_TIMEOUT`; defaults to `UDP_TIMEOUT`.
    pub udp_streaming_timeout: Option<u32>,
    /// `GUARANTEE`: admission-proof window for fresh flows (default off).
    pub guarantee: u32,
    /// `REAP_INTERVAL`: garbage-collection period (default 900 s).
    pub reap_interval: u32,
    /// `MAPPING_CAPACITY`: resize the shared table's bound.
    pub capacity: Option<usize>,
    /// `DST_ANNO`: stamp the destination-IP annotation (default on).
    pub dst_anno: bool,
    /// `REPLY_ANNO`: annotation byte stamped on reply packets.
    pub reply_anno: Option<u8>,
    /// Install reverse mappings in another rewriter.
    pub reply: Option<ReplyTarget>,
}

impl Default for RewriterConfig {
    fn default() -> RewriterConfig {
        RewriterConfig {
            inputs: Vec::new(),
            noutputs: 1,
            tcp_timeout: 86400,
            tcp_done_timeout: 240,
            tcp_nodata_timeout: 300,
            udp_timeout: 300,
            udp_streaming_timeout: None,
            guarantee: 0,
            reap_interval: 900,
            capacity: None,
            dst_anno: true,
            reply_anno: None,
            reply: None,
        }
    }
}

impl RewriterConfig {
    /// Apply one keyword argument from the configuration grammar.
    ///
    /// # Errors
    ///
    /// Returns a [`SpecError`] for unknown keywords or malformed values.
    pub fn apply_keyword(&mut self, keyword: &str, value: &str) -> Result<(), SpecError> {
        fn secs(keyword: &'static str, value: &str) -> Result<u32, SpecError> {
            value.parse::<u32>().map_err(|_| SpecError::BadKeyword {
                keyword,
                value: value.to_string(),
            })
        }
        match keyword {
            "TCP_TIMEOUT" => self.tcp_timeout = secs("TCP_TIMEOUT", value)?,
            "TCP_DONE_TIMEOUT" => self.tcp_done_timeout = secs("TCP_DONE_TIMEOUT", value)?,
            "TCP_NODATA_TIMEOUT" => self.tcp_nodata_timeout = secs("TCP_NODATA_TIMEOUT", value)?,
            "UDP_TIMEOUT" => self.udp_timeout = secs("UDP_TIMEOUT", value)?,
            "UDP_STREAMING_TIMEOUT" => {
                self.udp_streaming_timeout = Some(secs("UDP_STREAMING_TIMEOUT", value)?);
            }
            "GUARANTEE" => self.guarantee = secs("GUARANTEE", value)?,
            "REAP_INTERVAL" => self.reap_interval = secs("REAP_INTERVAL", value)?,
            "MAPPING_CAPACITY" => {
                self.capacity =
                    Some(value.parse::<usize>().map_err(|_| SpecError::BadKeyword {
                        keyword: "MAPPING_CAPACITY",
                        value: value.to_string(),
                    })?);
            }
            "DST_ANNO" => {
                self.dst_anno = match value {
                    "true" | "1" => true,
                    "false" | "0" => false,
                    _ => {
                        return Err(SpecError::BadKeyword {
                            keyword: "DST_ANNO",
                            value: value.to_string(),
                        });
                    }
                };
            }
            "REPLY_ANNO" => {
                self.reply_anno = Some(value.parse::<u8>().map_err(|_| SpecError::BadKeyword {
                    keyword: "REPLY_ANNO",
                    value: value.to_string(),
                })?);
            }
            _ => return Err(SpecError::Unknown(keyword.to_string())),
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) enum SpecKind {
    Drop,
    Nochange,
    Keep,
    Pattern(Arc<Pattern>),
    Mapper(Arc<dyn IpMapper>),
}

#[derive(Debug, Clone)]
pub(crate) struct InputSpec {
    pub kind: SpecKind,
    pub foutput: u16,
    pub routput: u16,
    pub input: InputId,
    pub reply_tcp: MapId,
    pub reply_udp: MapId,
}

/// The stateful TCP/UDP rewriter.
#[derive(Debug)]
pub struct Rewriter {
    pub(crate) table: SharedFlowTable,
    pub(crate) tcp_map: MapId,
    pub(crate) udp_map: MapId,
    pub(crate) specs: Vec<InputSpec>,
    pub(crate) noutputs: u16,
    pub(crate) tcp_timeouts: TcpTimeouts,
    pub(crate) udp_timeouts: UdpTimeouts,
    pub(crate) annos: AnnoConfig,
    pub(crate) gc_interval: u32,
    pub(crate) next_gc: Moment,
}

pub(crate) fn check_output(output: u16, available: u16) -> Result<u16, SpecError> {
    if output >= available {
        return Err(SpecError::OutputOutOfRange { output, available });
    }
    Ok(output)
}

pub(crate) fn resolve_spec(
    cfg: &InputSpecConfig,
    noutputs: u16,
    reply_noutputs: u16,
) -> Result<(SpecKind, u16, u16), SpecError> {
    Ok(match cfg {
        InputSpecConfig::Drop => (SpecKind::Drop, 0, 0),
        InputSpecConfig::Nochange { output } => {
            (SpecKind::Nochange, check_output(*output, noutputs)?, 0)
        }
        InputSpecConfig::Keep { foutput, routput } => (
            SpecKind::Keep,
            check_output(*foutput, noutputs)?,
            check_output(*routput, reply_noutputs)?,
        ),
        InputSpecConfig::Pattern {
            pattern,
            foutput,
            routput,
        } => (
            SpecKind::Pattern(pattern.clone()),
            check_output(*foutput, noutputs)?,
            check_output(*routput, reply_noutputs)?,
        ),
        InputSpecConfig::Mapper { mapper } => {
            let (max_f, max_r) = mapper.max_outputs();
            check_output(max_f, noutputs)?;
            check_output(max_r, reply_noutputs)?;
            (SpecKind::Mapper(mapper.clone()), 0, 0)
        }
    })
}

impl Rewriter {
    /// Build a rewriter over a shared flow table.
    ///
    /// # Errors
    ///
    /// Returns a [`SpecError`] for out-of-range outputs, a bad reply
    /// pairing, or a bad annotation offset.
    pub fn new(table: &SharedFlowTable, config: &RewriterConfig) -> Result<Rewriter, SpecError> {
        if let Some(off) = config.reply_anno
            && usize::from(off) >= ANNO_LEN
        {
            return Err(SpecError::ReplyAnnoOutOfRange(off));
        }

        let mut guard = table.lock().unwrap();
        let tcp_map = guard.register_map();
        let udp_map = guard.register_map();
        if let Some(capacity) = config.capacity {
            guard.set_capacity(capacity, Moment::ZERO);
        }

        let (reply_tcp, reply_udp, reply_noutputs) = match &config.reply {
            Some(target) => {
                if !Arc::ptr_eq(&target.table, table) {
                    return Err(SpecError::TableMismatch);
                }
                (target.tcp_map, target.udp_map, target.noutputs)
            }
            None => (tcp_map, udp_map, config.noutputs),
        };

        let base = TimeoutPair {
            timeout: config.tcp_nodata_timeout,
            guarantee: config.guarantee,
        };
        let mut specs = Vec::with_capacity(config.inputs.len());
        for (port, cfg) in config.inputs.iter().enumerate() {
            let (kind, foutput, routput) = resolve_spec(cfg, config.noutputs, reply_noutputs)?;
            let input = guard.register_input(u16::try_from(port).unwrap_or(u16::MAX), base);
            specs.push(InputSpec {
                kind,
                foutput,
                routput,
                input,
                reply_tcp,
                reply_udp,
            });
        }
        drop(guard);

        Ok(Rewriter {
            table: Arc::clone(table),
            tcp_map,
            udp_map,
            specs,
            noutputs: config.noutputs,
            tcp_timeouts: TcpTimeouts {
                nodata: config.tcp_nodata_timeout,
                data: config.tcp_timeout,
                done: config.tcp_done_timeout,
                guarantee: config.guarantee,
            },
            udp_timeouts: UdpTimeouts {
                timeout: config.udp_timeout,
                streaming: config.udp_streaming_timeout.unwrap_or(config.udp_timeout),
                guarantee: config.guarantee,
            },
            annos: AnnoConfig {
                dst_anno: config.dst_anno,
                reply_anno: config.reply_anno,
            },
            gc_interval: config.reap_interval,
            next_gc: Moment::ZERO.plus_secs(u64::from(config.reap_interval)),
        })
    }

    /// The target another rewriter (or helper) uses to install reverse
    /// mappings here.
    #[must_use]
    pub fn reply_target(&self) -> ReplyTarget {
        ReplyTarget {
            table: Arc::clone(&self.table),
            tcp_map: self.tcp_map,
            udp_map: self.udp_map,
            noutputs: self.noutputs,
        }
    }

    /// The shared flow table this rewriter works against.
    #[must_use]
    pub fn table_handle(&self) -> &SharedFlowTable {
        &self.table
    }

    fn route_unhandled(&self, port: usize) -> Verdict {
        match self.specs[port].kind {
            SpecKind::Nochange => Verdict::Emit(self.specs[port].foutput),
            _ => Verdict::Drop,
        }
    }

    /// Process one packet arriving on `port`.
    pub fn push(&mut self, port: usize, pkt: &mut Packet, now: Moment) -> Verdict {
        if port >= self.specs.len() {
            return Verdict::Drop;
        }
        let mut table = self.table.lock().unwrap();
        if now >= self.next_gc {
            table.gc(now);
            self.next_gc = now.plus_secs(u64::from(self.gc_interval));
        }

        // Non-TCP/UDP, non-first fragments, and short segments are routed
        // per the input spec without touching the flow table.
        let parsed = pkt
            .ipv4()
            .ok()
            .map(|ip| (ip.protocol(), ip.is_first_fragment()));
        let proto = match parsed {
            Some((proto @ (IpProto::TCP | IpProto::UDP), true))
                if pkt.transport_length() >= 8 =>
            {
                proto
            }
            _ => {
                drop(table);
                return self.route_unhandled(port);
            }
        };
        let Ok(flowid) = FlowId::from_transport(pkt) else {
            drop(table);
            return self.route_unhandled(port);
        };
        let map = if proto == IpProto::TCP {
            self.tcp_map
        } else {
            self.udp_map
        };

        let entry = if let Some(entry) = table.lookup(map, &flowid) {
            entry
        } else {
            let spec = &self.specs[port];
            let reply_map = if proto == IpProto::TCP {
                spec.reply_tcp
            } else {
                spec.reply_udp
            };
            let decision = match &spec.kind {
                SpecKind::Drop => return Verdict::Drop,
                SpecKind::Nochange => return Verdict::Emit(spec.foutput),
                SpecKind::Keep => Some(MapperRewrite {
                    flowid,
                    foutput: spec.foutput,
                    routput: spec.routput,
                }),
                SpecKind::Pattern(pattern) => pattern
                    .rewrite_flowid(&flowid, |id| table.map(reply_map).contains_key(id))
                    .map(|rewritten| MapperRewrite {
                        flowid: rewritten,
                        foutput: spec.foutput,
                        routput: spec.routput,
                    }),
                SpecKind::Mapper(mapper) => {
                    mapper.rewrite_flowid(&flowid, &|id| table.map(reply_map).contains_key(id))
                }
            };
            let Some(rewrite) = decision else {
                debug!("mapping failure on input {port} for {flowid}");
                table.note_failure(spec.input);
                return Verdict::Drop;
            };
            let timeouts = if proto == IpProto::TCP {
                self.tcp_timeouts.base()
            } else {
                self.udp_timeouts.base()
            };
            let flow = Flow::new(
                spec.input,
                [map, reply_map],
                flowid,
                rewrite.flowid,
                [rewrite.foutput, rewrite.routput],
                proto,
                RewriteScope::Full,
                timeouts.guarantee != 0,
                now.plus_secs(u64::from(timeouts.relevant())),
            );
            let Some(entry) = table.install(flow, now) else {
                return Verdict::Drop;
            };
            if let Some(off) = self.annos.reply_anno {
                table.flow_mut(entry.flow).reply_anno = pkt.meta().anno_u8(usize::from(off));
            }
            debug!("new {proto} flow {flowid} => {}", rewrite.flowid);
            entry
        };

        let idx = entry.flow;
        let dir = entry.dir;
        let output = table.flow(idx).entries[dir.index()].output;
        let annos = self.annos;
        table.flow_mut(idx).apply(pkt, dir, &annos);

        let (guaranteed, secs) = if proto == IpProto::TCP {
            if self.tcp_timeouts.guarantee != 0 {
                (true, self.tcp_timeouts.guarantee)
            } else {
                (false, table.flow(idx).tcp_timeout(&self.tcp_timeouts))
            }
        } else if self.udp_timeouts.guarantee != 0 {
            (true, self.udp_timeouts.guarantee)
        } else {
            (false, table.flow(idx).udp_timeout(&self.udp_timeouts))
        };
        table.refresh(idx, guaranteed, now.plus_secs(u64::from(secs)));
        Verdict::Emit(output)
    }

    /// Run a garbage-collection sweep now, regardless of the reap timer.
    pub fn gc(&mut self, now: Moment) {
        self.table.lock().unwrap().gc(now);
        self.next_gc = now.plus_secs(u64::from(self.gc_interval));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternSet;
    use crate::spec::MapperSet;
    use crate::table::FlowTable;
    use net::packet::test_utils::tcp_packet;
    use net::tcp::flags;
    use std::net::Ipv4Addr;

    fn spec(s: &str) -> InputSpecConfig {
        InputSpecConfig::parse(s, &PatternSet::new(), &MapperSet::new()).unwrap()
    }

    #[test]
    fn keywords_parse_into_config() {
        let mut config = RewriterConfig::default();
        config.apply_keyword("TCP_TIMEOUT", "3600").unwrap();
        config.apply_keyword("TCP_DONE_TIMEOUT", "30").unwrap();
        config.apply_keyword("TCP_NODATA_TIMEOUT", "120").unwrap();
        config.apply_keyword("UDP_TIMEOUT", "60").unwrap();
        config.apply_keyword("UDP_STREAMING_TIMEOUT", "600").unwrap();
        config.apply_keyword("GUARANTEE", "5").unwrap();
        config.apply_keyword("REAP_INTERVAL", "60").unwrap();
        config.apply_keyword("MAPPING_CAPACITY", "1024").unwrap();
        config.apply_keyword("DST_ANNO", "false").unwrap();
        config.apply_keyword("REPLY_ANNO", "3").unwrap();
        assert_eq!(config.tcp_timeout, 3600);
        assert_eq!(config.udp_streaming_timeout, Some(600));
        assert_eq!(config.capacity, Some(1024));
        assert!(!config.dst_anno);
        assert_eq!(config.reply_anno, Some(3));

        assert!(matches!(
            config.apply_keyword("TCP_TIMEOUT", "soon").unwrap_err(),
            SpecError::BadKeyword { .. }
        ));
        assert!(matches!(
            config.apply_keyword("NO_SUCH_KEYWORD", "1").unwrap_err(),
            SpecError::Unknown(_)
        ));
    }

    #[test]
    fn construction_rejects_bad_configs() {
        let table = FlowTable::new().shared();
        let config = RewriterConfig {
            inputs: vec![spec("pass 5")],
            noutputs: 2,
            ..RewriterConfig::default()
        };
        assert!(matches!(
            Rewriter::new(&table, &config).unwrap_err(),
            SpecError::OutputOutOfRange {
                output: 5,
                available: 2
            }
        ));

        let config = RewriterConfig {
            inputs: vec![spec("drop")],
            reply_anno: Some(200),
            ..RewriterConfig::default()
        };
        assert!(matches!(
            Rewriter::new(&table, &config).unwrap_err(),
            SpecError::ReplyAnnoOutOfRange(200)
        ));

        // A reply target must live in the same flow table.
        let other_table = FlowTable::new().shared();
        let peer = Rewriter::new(
            &other_table,
            &RewriterConfig {
                inputs: vec![spec("drop")],
                ..RewriterConfig::default()
            },
        )
        .unwrap();
        let config = RewriterConfig {
            inputs: vec![spec("drop")],
            reply: Some(peer.reply_target()),
            ..RewriterConfig::default()
        };
        assert!(matches!(
            Rewriter::new(&table, &config).unwrap_err(),
            SpecError::TableMismatch
        ));
    }

    #[test]
    #[tracing_test::traced_test]
    fn new_flows_are_logged() {
        let table = FlowTable::new().shared();
        let mut nat = Rewriter::new(
            &table,
            &RewriterConfig {
                inputs: vec![spec("pattern 1.0.0.1 9000-14000 - - 0 0")],
                ..RewriterConfig::default()
            },
        )
        .unwrap();
        let mut pkt = tcp_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            33000,
            Ipv4Addr::new(2, 0, 0, 2),
            80,
            1,
            0,
            flags::SYN,
            b"",
        );
        assert_eq!(nat.push(0, &mut pkt, Moment::ZERO), Verdict::Emit(0));
        assert!(logs_contain("new tcp flow"));
    }

    #[test]
    fn reverse_mappings_install_in_the_reply_rewriter() {
        let table = FlowTable::new().shared();
        // Inbound path: its map receives the reverse mappings.
        let mut inbound = Rewriter::new(
            &table,
            &RewriterConfig {
                inputs: vec![spec("drop")],
                ..RewriterConfig::default()
            },
        )
        .unwrap();
        let mut outbound = Rewriter::new(
            &table,
            &RewriterConfig {
                inputs: vec![spec("pattern 1.0.0.1 9000-14000 - - 0 0")],
                reply: Some(inbound.reply_target()),
                ..RewriterConfig::default()
            },
        )
        .unwrap();

        let mut pkt = tcp_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            33000,
            Ipv4Addr::new(2, 0, 0, 2),
            80,
            1,
            0,
            flags::SYN,
            b"",
        );
        assert_eq!(outbound.push(0, &mut pkt, Moment::ZERO), Verdict::Emit(0));
        let mapped_port = pkt.tcp().unwrap().src_port();

        // The reply arrives at the inbound rewriter, whose own spec is
        // `drop`, and still matches the installed reverse mapping.
        let mut reply = tcp_packet(
            Ipv4Addr::new(2, 0, 0, 2),
            80,
            Ipv4Addr::new(1, 0, 0, 1),
            mapped_port,
            100,
            2,
            flags::SYN | flags::ACK,
            b"",
        );
        assert_eq!(inbound.push(0, &mut reply, Moment::ZERO), Verdict::Emit(0));
        assert_eq!(reply.ipv4().unwrap().dst(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(reply.tcp().unwrap().dst_port(), 33000);
        table.lock().unwrap().check_invariants();
    }
}
