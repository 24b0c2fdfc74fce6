// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-connection rewrite state.
//!
//! A flow owns both directions of a mapping: the forward entry keyed by
//! the original flow identifier and the reverse entry keyed by the
//! reversed rewritten identifier.  Checksum adjustments are precomputed
//! once at installation as 16-bit ones-complement deltas; applying a
//! packet is field stores plus a couple of folds.

use crate::flowid::FlowId;
use crate::seqdelta::SeqTranslation;
use crate::table::{InputId, MapId};
use crate::time::{Moment, TcpTimeouts, UdpTimeouts};
use bitflags::bitflags;
use net::checksum;
use net::ip::IpProto;
use net::packet::Packet;
use net::tcp::flags as tcpflags;

/// Mapping direction: forward entries rewrite the original flow, reverse
/// entries rewrite replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The direction the flow was created in.
    Forward,
    /// The reply direction.
    Reverse,
}

impl Direction {
    /// Index into per-direction arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Direction::Forward => 0,
            Direction::Reverse => 1,
        }
    }

    /// The opposite direction.
    #[must_use]
    pub const fn flip(self) -> Direction {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }

    /// True for the reply direction.
    #[must_use]
    pub const fn is_reverse(self) -> bool {
        matches!(self, Direction::Reverse)
    }
}

bitflags! {
    /// TCP half-close and data tracking bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct TransportState: u8 {
        const FWD_DONE = 0b0001;
        const REV_DONE = 0b0010;
        const FWD_DATA = 0b0100;
        const REV_DATA = 0b1000;
    }
}

impl TransportState {
    fn done(dir: Direction) -> TransportState {
        match dir {
            Direction::Forward => TransportState::FWD_DONE,
            Direction::Reverse => TransportState::REV_DONE,
        }
    }

    fn data(dir: Direction) -> TransportState {
        match dir {
            Direction::Forward => TransportState::FWD_DATA,
            Direction::Reverse => TransportState::REV_DATA,
        }
    }

    fn both_done(self) -> bool {
        self.contains(TransportState::FWD_DONE | TransportState::REV_DONE)
    }

    fn any_data(self) -> bool {
        self.intersects(TransportState::FWD_DATA | TransportState::REV_DATA)
    }

    fn both_data(self) -> bool {
        self.contains(TransportState::FWD_DATA | TransportState::REV_DATA)
    }
}

/// Whether a flow rewrites the full 4-tuple or only addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RewriteScope {
    /// Addresses and ports (or ICMP identifier).
    Full,
    /// Both addresses, ports untouched (per-address-pair NAT).
    AddrPair,
    /// One address per direction: the source going out, the destination
    /// coming back (basic NAT keyed on a single address).
    AddrOnly,
}

/// Annotation behavior configured on a rewriter.
#[derive(Debug, Clone, Copy)]
pub struct AnnoConfig {
    /// Stamp the destination-IP annotation with the rewritten address.
    pub dst_anno: bool,
    /// Annotation byte offset to stamp on reply packets, if any.
    pub reply_anno: Option<u8>,
}

impl Default for AnnoConfig {
    fn default() -> AnnoConfig {
        AnnoConfig {
            dst_anno: true,
            reply_anno: None,
        }
    }
}

/// One direction's half of a flow: the map key and its output port.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlowEntry {
    /// The flow identifier packets in this direction arrive with.
    pub flowid: FlowId,
    /// The element output packets in this direction leave on.
    pub output: u16,
}

/// A bidirectional mapping plus shared connection state.
#[derive(Debug)]
pub(crate) struct Flow {
    pub entries: [FlowEntry; 2],
    pub maps: [MapId; 2],
    pub proto: IpProto,
    pub scope: RewriteScope,
    pub owner: InputId,
    pub expiry: Moment,
    pub guaranteed: bool,
    pub heap_place: usize,
    pub reply_anno: u8,
    pub seq: SeqTranslation,
    state: TransportState,
    ip_csum_delta: u16,
    transport_csum_delta: u16,
}

impl Flow {
    pub(crate) fn new(
        owner: InputId,
        maps: [MapId; 2],
        flowid: FlowId,
        rewritten: FlowId,
        outputs: [u16; 2],
        proto: IpProto,
        scope: RewriteScope,
        guaranteed: bool,
        expiry: Moment,
    ) -> Flow {
        let s = flowid.halfwords();
        let d = rewritten.halfwords();
        let mut ip_csum_delta = 0;
        for i in 0..4 {
            ip_csum_delta = checksum::update(ip_csum_delta, s[i], d[i]);
        }
        let mut transport_csum_delta = ip_csum_delta;
        match (scope, proto) {
            // Address-only rewrites touch the pseudo-header alone; the
            // port halfwords are zero on both sides.
            (RewriteScope::AddrOnly | RewriteScope::AddrPair, _) => {}
            (RewriteScope::Full, IpProto::ICMP) => {
                // The echo identifier appears once in the ICMP header and
                // its checksum has no pseudo-header, so only the
                // identifier halfword contributes.
                transport_csum_delta = checksum::update(0, s[4], d[4]);
            }
            (RewriteScope::Full, _) => {
                for i in 4..6 {
                    transport_csum_delta = checksum::update(transport_csum_delta, s[i], d[i]);
                }
            }
        }
        Flow {
            entries: [
                FlowEntry {
                    flowid,
                    output: outputs[0],
                },
                FlowEntry {
                    flowid: rewritten.reverse(),
                    output: outputs[1],
                },
            ],
            maps,
            proto,
            scope,
            owner,
            expiry,
            guaranteed,
            heap_place: usize::MAX,
            reply_anno: 0,
            seq: SeqTranslation::default(),
            state: TransportState::default(),
            ip_csum_delta,
            transport_csum_delta,
        }
    }

    /// The identifier packets in `dir` are rewritten to.
    pub(crate) fn rewritten_flowid(&self, dir: Direction) -> FlowId {
        self.entries[dir.flip().index()].flowid.reverse()
    }

    pub(crate) fn expired(&self, now: Moment) -> bool {
        now >= self.expiry
    }

    /// Rewrite `pkt`, which arrived in direction `dir`.
    ///
    /// The incoming transport checksum is not verified first; a corrupted
    /// checksum stays corrupted after the incremental update and the end
    /// host discards the packet as it would have anyway.
    pub(crate) fn apply(&mut self, pkt: &mut Packet, dir: Direction, annos: &AnnoConfig) {
        let revflow = self.entries[dir.flip().index()].flowid;

        let pkt_proto = pkt.ipv4().map(|ip| ip.protocol()).unwrap_or(IpProto(0));
        let Ok(mut ip) = pkt.ipv4_mut() else {
            return;
        };
        match self.scope {
            RewriteScope::Full | RewriteScope::AddrPair => {
                ip.set_src(revflow.daddr);
                ip.set_dst(revflow.saddr);
            }
            RewriteScope::AddrOnly => {
                if dir.is_reverse() {
                    ip.set_dst(revflow.saddr);
                } else {
                    ip.set_src(revflow.daddr);
                }
            }
        }
        let csum = checksum::apply_delta(ip.header_checksum(), self.ip_csum_delta, dir.is_reverse());
        ip.set_header_checksum(csum);
        let first_fragment = ip.is_first_fragment();
        let total_len = usize::from(ip.total_len());
        let header_len = ip.header_len();

        if annos.dst_anno {
            pkt.meta_mut().dst_ip = Some(revflow.saddr);
        }
        if dir.is_reverse()
            && let Some(off) = annos.reply_anno
        {
            pkt.meta_mut().set_anno_u8(usize::from(off), self.reply_anno);
        }

        if !first_fragment {
            return;
        }

        if self.scope != RewriteScope::Full {
            // Ports stay put, but the rewritten addresses feed the
            // TCP/UDP pseudo-header sum.
            match pkt_proto {
                IpProto::TCP if pkt.transport_length() >= 18 => {
                    if let Ok(mut tcp) = pkt.tcp_mut() {
                        let csum = checksum::apply_delta(
                            tcp.checksum(),
                            self.transport_csum_delta,
                            dir.is_reverse(),
                        );
                        tcp.set_checksum(csum);
                    }
                }
                IpProto::UDP if pkt.transport_length() >= 8 => {
                    if let Ok(mut udp) = pkt.udp_mut()
                        && udp.checksum() != 0
                    {
                        let csum = checksum::apply_delta(
                            udp.checksum(),
                            self.transport_csum_delta,
                            dir.is_reverse(),
                        );
                        udp.set_checksum(csum);
                    }
                }
                _ => {}
            }
            return;
        }

        match self.proto {
            IpProto::TCP if pkt.transport_length() >= 18 => {
                self.apply_tcp(pkt, dir, revflow, total_len, header_len);
            }
            IpProto::UDP if pkt.transport_length() >= 8 => {
                self.apply_udp(pkt, dir, revflow);
            }
            IpProto::ICMP if pkt.transport_length() >= 8 => {
                self.apply_icmp(pkt, dir, revflow);
            }
            _ => {}
        }
    }

    fn apply_tcp(
        &mut self,
        pkt: &mut Packet,
        dir: Direction,
        revflow: FlowId,
        total_len: usize,
        header_len: usize,
    ) {
        let transport_len = pkt.transport_length();
        let Ok(mut tcp) = pkt.tcp_mut() else {
            return;
        };
        tcp.set_src_port(revflow.dport);
        tcp.set_dst_port(revflow.sport);
        let csum = checksum::apply_delta(
            tcp.checksum(),
            self.transport_csum_delta,
            dir.is_reverse(),
        );
        tcp.set_checksum(csum);

        // Half-close tracking.
        let have_payload = header_len + tcp.claimed_header_len() < total_len;
        let fl = tcp.flags();
        if fl & tcpflags::RST != 0 {
            self.state |= TransportState::FWD_DONE | TransportState::REV_DONE;
        } else if fl & tcpflags::FIN != 0 {
            self.state |= TransportState::done(dir);
        } else if fl & tcpflags::SYN != 0 || have_payload {
            self.state -= TransportState::done(dir);
        }
        if have_payload {
            self.state |= TransportState::data(dir);
        }

        if transport_len < tcp.claimed_header_len() {
            return;
        }

        // Sequence translation.
        self.seq.expire_stale(dir, tcp.seq());
        if self.seq.translates(dir) {
            let old = tcp.seq();
            let new = self.seq.new_seq(dir, old);
            if new != old {
                let csum = checksum::update32(tcp.checksum(), old, new);
                tcp.set_checksum(csum);
                tcp.set_seq(new);
            }
        }
        if self.seq.translates(dir.flip()) {
            let old = tcp.ack();
            let new = self.seq.new_ack(dir, old);
            if new != old {
                let csum = checksum::update32(tcp.checksum(), old, new);
                tcp.set_checksum(csum);
                tcp.set_ack(new);
            }
            // Rewrite SACK edges unless the options are the common
            // timestamp-only layout.
            let claimed = tcp.claimed_header_len();
            if claimed > 32 || (claimed == 32 && tcp.option_u32(0) != 0x0101_080A) {
                self.apply_sack(&mut tcp, dir);
            }
        }
    }

    /// Translate the left/right edges of SACK blocks (option kind 5)
    /// through the acknowledgment mapping, updating the checksum
    /// incrementally.
    fn apply_sack(&self, tcp: &mut net::tcp::TcpMut<'_>, dir: Direction) {
        let opts = tcp.options().to_vec();
        let mut i = 0;
        while i < opts.len() {
            match opts[i] {
                0 => break, // end of options
                1 => i += 1,
                5 => {
                    let Some(&len) = opts.get(i + 1) else {
                        break;
                    };
                    let len = usize::from(len);
                    if i + len > opts.len() || len % 8 != 2 {
                        break;
                    }
                    let mut off = i + 2;
                    while off + 8 <= i + len {
                        for edge in 0..2 {
                            let at = off + edge * 4;
                            let old = tcp.option_u32(at);
                            let new = self.seq.new_ack(dir, old);
                            if new != old {
                                // Edges may sit at odd halfword parity.
                                let even = (net::tcp::MIN_HEADER_LEN + at) % 2 == 0;
                                let csum = update_u32_at(tcp.checksum(), even, old, new);
                                tcp.set_checksum(csum);
                                tcp.set_option_u32(at, new);
                            }
                        }
                        off += 8;
                    }
                    break;
                }
                _ => {
                    let Some(&len) = opts.get(i + 1) else {
                        break;
                    };
                    if len < 2 {
                        break;
                    }
                    i += usize::from(len);
                }
            }
        }
    }

    fn apply_udp(&mut self, pkt: &mut Packet, dir: Direction, revflow: FlowId) {
        let Ok(mut udp) = pkt.udp_mut() else {
            return;
        };
        udp.set_src_port(revflow.dport);
        udp.set_dst_port(revflow.sport);
        // A zero checksum means "no checksum" and stays zero (RFC 768).
        if udp.checksum() != 0 {
            let csum = checksum::apply_delta(
                udp.checksum(),
                self.transport_csum_delta,
                dir.is_reverse(),
            );
            udp.set_checksum(csum);
        }
        self.state |= TransportState::data(dir);
    }

    fn apply_icmp(&mut self, pkt: &mut Packet, dir: Direction, revflow: FlowId) {
        let Ok(mut icmp) = pkt.icmp_mut() else {
            return;
        };
        icmp.set_identifier(revflow.dport);
        let csum = checksum::apply_delta(
            icmp.checksum(),
            self.transport_csum_delta,
            dir.is_reverse(),
        );
        icmp.set_checksum(csum);
        // Unlike an IP header, an ICMP message may legitimately sum to
        // zero; a +0 result from the incremental update is ambiguous, so
        // fall back to a full recomputation.
        if icmp.checksum() == 0 {
            icmp.recompute_checksum();
        }
    }

    /// The timeout that applies to this TCP flow's current state.
    pub(crate) fn tcp_timeout(&self, t: &TcpTimeouts) -> u32 {
        if self.state.both_done() {
            t.done
        } else if self.state.any_data() {
            t.data
        } else {
            t.nodata
        }
    }

    /// The timeout that applies to this UDP flow's current state.
    pub(crate) fn udp_timeout(&self, t: &UdpTimeouts) -> u32 {
        if self.state.both_data() {
            t.streaming
        } else {
            t.timeout
        }
    }

    /// Render one direction of this flow in the handler dump format.
    pub(crate) fn unparse(&self, dir: Direction, input_port: u16, expiry: Moment, now: Moment) -> String {
        let entry = &self.entries[dir.index()];
        let mut line = format!("{} => {}", entry.flowid, self.rewritten_flowid(dir));
        let delta = self.seq.current_delta(dir);
        if delta != 0 {
            line.push_str(&format!(" seq {delta:+}"));
        }
        line.push_str(&format!(
            " [{} {}] i{} exp{}",
            self.entries[0].output,
            self.entries[1].output,
            input_port,
            now.until(expiry)
        ));
        line
    }
}

/// Incremental checksum update for a 32-bit field whose alignment within
/// the 16-bit checksum grid is given by `even`.
fn update_u32_at(csum: u16, even: bool, old: u32, new: u32) -> u16 {
    if even {
        return checksum::update32(csum, old, new);
    }
    // At odd parity the four bytes weigh in swapped within their
    // halfwords.
    #[allow(clippy::cast_possible_truncation)]
    let (oh, ol, nh, nl) = (
        (old >> 16) as u16,
        old as u16,
        (new >> 16) as u16,
        new as u16,
    );
    let csum = checksum::update(csum, oh.swap_bytes(), nh.swap_bytes());
    checksum::update(csum, ol.swap_bytes(), nl.swap_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use net::packet::test_utils::{
        icmp_echo_packet, tcp_packet, tcp_packet_with_options, udp_packet, udp_packet_no_checksum,
    };
    use std::net::Ipv4Addr;

    fn inside() -> FlowId {
        FlowId::new(
            Ipv4Addr::new(10, 0, 0, 2),
            33000,
            Ipv4Addr::new(2, 0, 0, 2),
            80,
        )
    }

    fn rewritten() -> FlowId {
        FlowId::new(
            Ipv4Addr::new(1, 0, 0, 1),
            9000,
            Ipv4Addr::new(2, 0, 0, 2),
            80,
        )
    }

    fn test_flow(proto: IpProto, rewritten_id: FlowId) -> Flow {
        Flow::new(
            InputId::for_tests(),
            [MapId::for_tests(), MapId::for_tests()],
            inside(),
            rewritten_id,
            [0, 0],
            proto,
            RewriteScope::Full,
            false,
            Moment::from_secs(300),
        )
    }

    fn assert_checksums_valid(pkt: &Packet) {
        let ip = pkt.ipv4().unwrap();
        assert!(ip.checksum_valid(), "IP checksum mismatch");
        match ip.protocol() {
            IpProto::TCP => {
                let mut seg = pkt.transport().to_vec();
                let stored = u16::from_be_bytes([seg[16], seg[17]]);
                seg[16] = 0;
                seg[17] = 0;
                assert_eq!(
                    stored,
                    net::checksum::transport_checksum(ip.src(), ip.dst(), 6, &seg),
                    "TCP checksum mismatch"
                );
            }
            IpProto::UDP => {
                let mut seg = pkt.transport().to_vec();
                let stored = u16::from_be_bytes([seg[6], seg[7]]);
                if stored == 0 {
                    return;
                }
                seg[6] = 0;
                seg[7] = 0;
                assert_eq!(
                    stored,
                    net::checksum::transport_checksum(ip.src(), ip.dst(), 17, &seg),
                    "UDP checksum mismatch"
                );
            }
            IpProto::ICMP => {
                assert_eq!(
                    net::checksum::fold(net::checksum::sum_be_words(pkt.transport())),
                    0xFFFF,
                    "ICMP checksum mismatch"
                );
            }
            _ => {}
        }
    }

    #[test]
    fn forward_then_reverse_restores_tuple() {
        let mut flow = test_flow(IpProto::TCP, rewritten());
        let annos = AnnoConfig::default();

        let mut pkt = tcp_packet(
            inside().saddr,
            inside().sport,
            inside().daddr,
            inside().dport,
            1000,
            0,
            tcpflags::SYN,
            b"",
        );
        flow.apply(&mut pkt, Direction::Forward, &annos);
        let ip = pkt.ipv4().unwrap();
        let tcp = pkt.tcp().unwrap();
        assert_eq!(ip.src(), rewritten().saddr);
        assert_eq!(tcp.src_port(), rewritten().sport);
        assert_eq!(ip.dst(), rewritten().daddr);
        assert_eq!(tcp.dst_port(), rewritten().dport);
        assert_checksums_valid(&pkt);
        assert_eq!(pkt.meta().dst_ip, Some(rewritten().daddr));

        // The reply, addressed to the rewritten endpoint, is restored to
        // the original tuple.
        let mut reply = tcp_packet(
            rewritten().daddr,
            rewritten().dport,
            rewritten().saddr,
            rewritten().sport,
            5000,
            1001,
            tcpflags::ACK,
            b"",
        );
        flow.apply(&mut reply, Direction::Reverse, &annos);
        let ip = reply.ipv4().unwrap();
        let tcp = reply.tcp().unwrap();
        assert_eq!(ip.src(), inside().daddr);
        assert_eq!(ip.dst(), inside().saddr);
        assert_eq!(tcp.dst_port(), inside().sport);
        assert_checksums_valid(&reply);
    }

    #[test]
    fn udp_rewrite_updates_nonzero_checksum_only() {
        let annos = AnnoConfig::default();
        let mut flow = test_flow(IpProto::UDP, rewritten());
        let mut pkt = udp_packet(
            inside().saddr,
            inside().sport,
            inside().daddr,
            inside().dport,
            b"data",
        );
        flow.apply(&mut pkt, Direction::Forward, &annos);
        assert_checksums_valid(&pkt);

        let mut flow = test_flow(IpProto::UDP, rewritten());
        let mut pkt = udp_packet_no_checksum(
            inside().saddr,
            inside().sport,
            inside().daddr,
            inside().dport,
            b"data",
        );
        flow.apply(&mut pkt, Direction::Forward, &annos);
        assert_eq!(pkt.udp().unwrap().checksum(), 0);
        assert_eq!(pkt.udp().unwrap().src_port(), 9000);
        assert!(pkt.ipv4().unwrap().checksum_valid());
    }

    #[test]
    fn icmp_identifier_rewrite() {
        let annos = AnnoConfig::default();
        let inside_echo = FlowId::new(inside().saddr, 0x1111, inside().daddr, 0x1111);
        let out_echo = FlowId::new(Ipv4Addr::new(1, 0, 0, 1), 0x2222, inside().daddr, 0x2222);
        let mut flow = Flow::new(
            InputId::for_tests(),
            [MapId::for_tests(), MapId::for_tests()],
            inside_echo,
            out_echo,
            [0, 0],
            IpProto::ICMP,
            RewriteScope::Full,
            false,
            Moment::from_secs(300),
        );
        let mut pkt = icmp_echo_packet(
            inside_echo.saddr,
            inside_echo.daddr,
            net::icmp4::ECHO,
            0x1111,
            7,
            b"ping",
        );
        flow.apply(&mut pkt, Direction::Forward, &annos);
        assert_eq!(pkt.icmp().unwrap().identifier(), 0x2222);
        assert_eq!(pkt.ipv4().unwrap().src(), Ipv4Addr::new(1, 0, 0, 1));
        assert_checksums_valid(&pkt);
    }

    #[test]
    fn tcp_state_tracking_selects_timeouts() {
        let timeouts = TcpTimeouts {
            nodata: 300,
            data: 86400,
            done: 240,
            guarantee: 0,
        };
        let annos = AnnoConfig::default();
        let mut flow = test_flow(IpProto::TCP, rewritten());
        assert_eq!(flow.tcp_timeout(&timeouts), 300);

        // Data in one direction switches to the long timeout.
        let mut pkt = tcp_packet(
            inside().saddr,
            inside().sport,
            inside().daddr,
            inside().dport,
            1000,
            0,
            tcpflags::ACK | tcpflags::PSH,
            b"GET /",
        );
        flow.apply(&mut pkt, Direction::Forward, &annos);
        assert_eq!(flow.tcp_timeout(&timeouts), 86400);

        // FIN in both directions marks the session over.
        let mut fin = tcp_packet(
            inside().saddr,
            inside().sport,
            inside().daddr,
            inside().dport,
            1005,
            0,
            tcpflags::FIN | tcpflags::ACK,
            b"",
        );
        flow.apply(&mut fin, Direction::Forward, &annos);
        assert_eq!(flow.tcp_timeout(&timeouts), 86400);
        let mut fin_back = tcp_packet(
            rewritten().daddr,
            rewritten().dport,
            rewritten().saddr,
            rewritten().sport,
            9000,
            1006,
            tcpflags::FIN | tcpflags::ACK,
            b"",
        );
        flow.apply(&mut fin_back, Direction::Reverse, &annos);
        assert_eq!(flow.tcp_timeout(&timeouts), 240);

        // New payload reopens the half-closed side.
        let mut more = tcp_packet(
            inside().saddr,
            inside().sport,
            inside().daddr,
            inside().dport,
            1006,
            0,
            tcpflags::ACK,
            b"more",
        );
        flow.apply(&mut more, Direction::Forward, &annos);
        assert_eq!(flow.tcp_timeout(&timeouts), 86400);

        // RST closes both at once.
        let mut rst = tcp_packet(
            inside().saddr,
            inside().sport,
            inside().daddr,
            inside().dport,
            1010,
            0,
            tcpflags::RST,
            b"",
        );
        flow.apply(&mut rst, Direction::Forward, &annos);
        assert_eq!(flow.tcp_timeout(&timeouts), 240);
    }

    #[test]
    fn udp_streaming_needs_both_directions() {
        let timeouts = UdpTimeouts {
            timeout: 300,
            streaming: 3600,
            guarantee: 0,
        };
        let annos = AnnoConfig::default();
        let mut flow = test_flow(IpProto::UDP, rewritten());
        let mut pkt = udp_packet(
            inside().saddr,
            inside().sport,
            inside().daddr,
            inside().dport,
            b"x",
        );
        flow.apply(&mut pkt, Direction::Forward, &annos);
        assert_eq!(flow.udp_timeout(&timeouts), 300);
        let mut back = udp_packet(
            rewritten().daddr,
            rewritten().dport,
            rewritten().saddr,
            rewritten().sport,
            b"y",
        );
        flow.apply(&mut back, Direction::Reverse, &annos);
        assert_eq!(flow.udp_timeout(&timeouts), 3600);
    }

    #[test]
    fn seq_translation_applies_to_seq_ack_and_checksum() {
        let annos = AnnoConfig::default();
        let mut flow = test_flow(IpProto::TCP, rewritten());
        flow.seq.record(Direction::Forward, 1010, 4).unwrap();

        let mut pkt = tcp_packet(
            inside().saddr,
            inside().sport,
            inside().daddr,
            inside().dport,
            2000,
            500,
            tcpflags::ACK,
            b"abc",
        );
        flow.apply(&mut pkt, Direction::Forward, &annos);
        assert_eq!(pkt.tcp().unwrap().seq(), 2004);
        assert_eq!(pkt.tcp().unwrap().ack(), 500);
        assert_checksums_valid(&pkt);

        // The server's ack covers rewritten bytes and is shifted back.
        let mut reply = tcp_packet(
            rewritten().daddr,
            rewritten().dport,
            rewritten().saddr,
            rewritten().sport,
            500,
            2004,
            tcpflags::ACK,
            b"",
        );
        flow.apply(&mut reply, Direction::Reverse, &annos);
        assert_eq!(reply.tcp().unwrap().ack(), 2000);
        assert_checksums_valid(&reply);
    }

    #[test]
    fn sack_edges_are_translated() {
        let annos = AnnoConfig::default();
        let mut flow = test_flow(IpProto::TCP, rewritten());
        flow.seq.record(Direction::Forward, 1000, 4).unwrap();

        // SACK block acknowledging rewritten bytes [2004, 3004).
        let mut options = vec![1u8, 1, 5, 10];
        options.extend_from_slice(&2004u32.to_be_bytes());
        options.extend_from_slice(&3004u32.to_be_bytes());
        assert_eq!(options.len(), 12);

        let mut reply = tcp_packet_with_options(
            rewritten().daddr,
            rewritten().dport,
            rewritten().saddr,
            rewritten().sport,
            500,
            2004,
            tcpflags::ACK,
            &options,
            b"",
        );
        flow.apply(&mut reply, Direction::Reverse, &annos);
        let tcp = reply.tcp().unwrap();
        assert_eq!(tcp.ack(), 2000);
        assert_eq!(tcp.option_u32(4), 2000);
        assert_eq!(tcp.option_u32(8), 3000);
        assert_checksums_valid(&reply);
    }

    #[test]
    fn reply_anno_is_stamped_on_reverse_only() {
        let annos = AnnoConfig {
            dst_anno: false,
            reply_anno: Some(2),
        };
        let mut flow = test_flow(IpProto::TCP, rewritten());
        flow.reply_anno = 0x5A;

        let mut fwd = tcp_packet(
            inside().saddr,
            inside().sport,
            inside().daddr,
            inside().dport,
            1,
            0,
            tcpflags::SYN,
            b"",
        );
        flow.apply(&mut fwd, Direction::Forward, &annos);
        assert_eq!(fwd.meta().anno_u8(2), 0);
        assert_eq!(fwd.meta().dst_ip, None);

        let mut rev = tcp_packet(
            rewritten().daddr,
            rewritten().dport,
            rewritten().saddr,
            rewritten().sport,
            1,
            1,
            tcpflags::ACK,
            b"",
        );
        flow.apply(&mut rev, Direction::Reverse, &annos);
        assert_eq!(rev.meta().anno_u8(2), 0x5A);
    }

    #[test]
    fn odd_aligned_checksum_update_matches_full() {
        // Verify the parity-aware helper against a straight recompute.
        let mut data = vec![0u8; 14];
        for (i, b) in data.iter_mut().enumerate() {
            *b = u8::try_from(i).unwrap().wrapping_mul(17);
        }
        let before = net::checksum::checksum(&data);
        let old = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        let new = 0xDEAD_BEEFu32;
        data[5..9].copy_from_slice(&new.to_be_bytes());
        assert_eq!(
            update_u32_at(before, false, old, new),
            net::checksum::checksum(&data)
        );

        let before = net::checksum::checksum(&data);
        let old = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let new = 0x0102_0304u32;
        data[4..8].copy_from_slice(&new.to_be_bytes());
        assert_eq!(
            update_u32_at(before, true, old, new),
            net::checksum::checksum(&data)
        );
    }
}
