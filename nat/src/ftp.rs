// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Inline FTP PORT rewriting.
//!
//! FTP advertises its data-channel endpoint inside the control stream,
//! so a NAT must edit the payload: parse the `PORT a,b,c,d,e,f` command,
//! allocate a data-channel mapping on the data-path rewriter, splice the
//! rewritten endpoint back in, and keep the control stream's sequence
//! numbers consistent through the paired control rewriter's flow.
//!
//! Only a command at the very start of the payload is considered, as in
//! the original implementation; a PORT elsewhere in the segment is left
//! alone.

use crate::flow::{Flow, RewriteScope};
use crate::flowid::FlowId;
use crate::pattern::Pattern;
use crate::rewriter::{Rewriter, Verdict, check_output};
use crate::spec::SpecError;
use crate::table::{InputId, MapId, SharedFlowTable};
use crate::time::{Moment, TimeoutPair};
use net::ip::IpProto;
use net::packet::Packet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, trace};

/// The parsed advertisement: endpoint plus the payload span it occupies.
struct PortCommand {
    addr: Ipv4Addr,
    port: u16,
    /// Byte range of the six decimals within the payload.
    arg_start: usize,
    arg_end: usize,
}

/// Parse a `PORT a,b,c,d,e,f` command at the start of `payload`.
/// Case-insensitive; returns `None` on any malformation.
fn parse_port_command(payload: &[u8]) -> Option<PortCommand> {
    if payload.len() < 5
        || !payload[..4].eq_ignore_ascii_case(b"PORT")
        || payload[4] != b' '
    {
        return None;
    }
    let mut pos = 5;
    while pos < payload.len() && payload[pos] == b' ' {
        pos += 1;
    }
    let arg_start = pos;

    let mut nums = [0u32; 6];
    let mut which = 0;
    while pos < payload.len() && which < 6 {
        match payload[pos] {
            digit @ b'0'..=b'9' => {
                nums[which] = nums[which]
                    .saturating_mul(10)
                    .saturating_add(u32::from(digit - b'0'));
            }
            b',' => which += 1,
            _ => break,
        }
        pos += 1;
    }
    if which != 5 || pos >= payload.len() || (payload[pos] != b'\r' && payload[pos] != b'\n') {
        return None;
    }
    if nums.iter().any(|&n| n > 255) {
        return None;
    }

    #[allow(clippy::cast_possible_truncation)] // each bounded by 255
    let b = nums.map(|n| n as u8);
    Some(PortCommand {
        addr: Ipv4Addr::new(b[0], b[1], b[2], b[3]),
        port: (u16::from(b[4]) << 8) | u16::from(b[5]),
        arg_start,
        arg_end: pos,
    })
}

/// Render an endpoint in PORT notation, without a terminator.
fn render_endpoint(addr: Ipv4Addr, port: u16) -> Vec<u8> {
    let o = addr.octets();
    format!(
        "{},{},{},{},{},{}",
        o[0],
        o[1],
        o[2],
        o[3],
        port >> 8,
        port & 0xFF
    )
    .into_bytes()
}

/// The FTP PORT helper element.  Sits inline on the control channel,
/// upstream of the control rewriter, paired with the data-path rewriter
/// that will carry the data connection.
#[derive(Debug)]
pub struct FtpPortMapper {
    table: SharedFlowTable,
    control_map: MapId,
    data_map: MapId,
    pattern: Arc<Pattern>,
    foutput: u16,
    routput: u16,
    input: InputId,
    timeouts: TimeoutPair,
}

impl FtpPortMapper {
    /// Pair a control rewriter with a data rewriter and the pattern used
    /// for data-channel allocations.
    ///
    /// # Errors
    ///
    /// Returns a [`SpecError`] when the rewriters do not share a flow
    /// table or the outputs are out of range for the data rewriter.
    pub fn new(
        control: &Rewriter,
        data: &Rewriter,
        pattern: Arc<Pattern>,
        foutput: u16,
        routput: u16,
    ) -> Result<FtpPortMapper, SpecError> {
        if !Arc::ptr_eq(&control.table, &data.table) {
            return Err(SpecError::TableMismatch);
        }
        check_output(foutput, data.noutputs)?;
        check_output(routput, data.noutputs)?;
        let timeouts = data.tcp_timeouts.base();
        let input = data.table.lock().unwrap().register_input(0, timeouts);
        Ok(FtpPortMapper {
            table: Arc::clone(&control.table),
            control_map: control.tcp_map,
            data_map: data.tcp_map,
            pattern,
            foutput,
            routput,
            input,
            timeouts,
        })
    }

    /// Process one control-channel packet.  Packets without a complete
    /// PORT command pass through untouched; a non-monotone sequence
    /// trigger (a pathological retransmission) drops the packet.
    pub fn process(&mut self, pkt: &mut Packet, now: Moment) -> Verdict {
        let Some(cmd) = self.parse(pkt) else {
            return Verdict::Emit(0);
        };

        let Ok(ip) = pkt.ipv4() else {
            return Verdict::Emit(0);
        };
        let Ok(tcp) = pkt.tcp() else {
            return Verdict::Emit(0);
        };
        // Standard FTP: the data connection targets one port below the
        // control port.
        let data_dport = tcp.dst_port().wrapping_sub(1);
        let data_flow = FlowId::new(cmd.addr, cmd.port, ip.dst(), data_dport);
        let control_flowid = FlowId::new(ip.src(), tcp.src_port(), ip.dst(), tcp.dst_port());
        let seq = tcp.seq();
        let data_off = pkt.transport_offset() + tcp.claimed_header_len();

        let mut table = self.table.lock().unwrap();
        let data_map = self.data_map;
        // A retransmitted command reuses the mapping it created.
        let rewritten = if let Some(entry) = table.lookup(data_map, &data_flow) {
            table.flow(entry.flow).rewritten_flowid(entry.dir)
        } else {
            let Some(rewritten) = self
                .pattern
                .rewrite_flowid(&data_flow, |id| table.map(data_map).contains_key(id))
            else {
                debug!("ftp data-channel allocation failed for {data_flow}");
                table.note_failure(self.input);
                return Verdict::Emit(0);
            };
            let flow = Flow::new(
                self.input,
                [self.data_map, self.data_map],
                data_flow,
                rewritten,
                [self.foutput, self.routput],
                IpProto::TCP,
                RewriteScope::Full,
                self.timeouts.guarantee != 0,
                now.plus_secs(u64::from(self.timeouts.relevant())),
            );
            if table.install(flow, now).is_none() {
                return Verdict::Emit(0);
            }
            debug!("ftp data channel {data_flow} => {rewritten}");
            rewritten
        };

        // Splice the rewritten endpoint into the payload.
        let replacement = render_endpoint(rewritten.saddr, rewritten.sport);
        let abs_start = data_off + cmd.arg_start;
        let abs_end = data_off + cmd.arg_end;
        let old_len = abs_end - abs_start;
        let new_len = replacement.len();
        let old_total = pkt.len();
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let delta = new_len as i32 - old_len as i32;

        if new_len > old_len {
            pkt.grow_tail(new_len - old_len);
        }
        let data = pkt.data_mut();
        data.copy_within(abs_end..old_total, abs_start + new_len);
        data[abs_start..abs_start + new_len].copy_from_slice(&replacement);
        if old_len > new_len && pkt.shrink_tail(old_len - new_len).is_err() {
            return Verdict::Drop;
        }

        // Fix the IP length incrementally, then rebuild the TCP checksum
        // outright: the payload edit is too complex for incremental
        // update.
        #[allow(clippy::cast_possible_truncation)]
        let new_total = pkt.len() as u16;
        if let Ok(mut ip) = pkt.ipv4_mut() {
            let old_total_field = ip.total_len();
            ip.set_total_len(new_total);
            let csum = net::checksum::update(ip.header_checksum(), old_total_field, new_total);
            ip.set_header_checksum(csum);
        }
        let (src, dst) = {
            let Ok(ip) = pkt.ipv4() else {
                return Verdict::Drop;
            };
            (ip.src(), ip.dst())
        };
        if let Ok(mut tcp) = pkt.tcp_mut() {
            tcp.recompute_checksum(src, dst);
        }

        // Keep the rest of the control stream consistent: bytes after
        // this payload shift by the length difference.
        if delta != 0 {
            if let Some(entry) = table.lookup(self.control_map, &control_flowid) {
                #[allow(clippy::cast_possible_truncation)]
                let trigger = seq.wrapping_add((old_total - data_off) as u32);
                let result = table
                    .flow_mut(entry.flow)
                    .seq
                    .record(entry.dir, trigger, delta);
                if result.is_err() {
                    debug!("ftp seq trigger out of order on {control_flowid}");
                    return Verdict::Drop;
                }
            } else {
                trace!("no control flow for {control_flowid}, seq delta not recorded");
            }
        }
        Verdict::Emit(0)
    }

    /// Data-channel allocation failures so far.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.table.lock().unwrap().input(self.input).failures
    }

    /// Parse the packet down to a PORT command, if there is one.
    fn parse(&self, pkt: &Packet) -> Option<PortCommand> {
        let ip = pkt.ipv4().ok()?;
        if ip.protocol() != IpProto::TCP || !ip.is_first_fragment() {
            return None;
        }
        let tcp = pkt.tcp().ok()?;
        let data_off = tcp.claimed_header_len();
        if data_off < net::tcp::MIN_HEADER_LEN || data_off >= pkt.transport_length() {
            return None;
        }
        parse_port_command(&pkt.transport()[data_off..])
    }
}
