// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Control-plane handlers: flow dumps, counters, lookups, and runtime
//! reconfiguration of individual input specs.

use crate::flowid::FlowId;
use crate::rewriter::{Rewriter, SpecKind, resolve_spec};
use crate::spec::{InputSpecConfig, SpecError};
use crate::table::{FlowTable, MapId};
use crate::time::Moment;
use core::fmt::Write as _;

fn dump_map(table: &FlowTable, map: MapId, now: Moment) -> String {
    let mut out = String::new();
    for (_, entry) in table.map(map) {
        let flow = table.flow(entry.flow);
        let input_port = table.input(flow.owner).port;
        // Guaranteed flows are shown with the expiry they would get once
        // shifted to best effort.
        let expiry = if flow.guaranteed {
            let base = table.input(flow.owner).base;
            flow.expiry
                .plus_secs(u64::from(base.timeout.saturating_sub(base.guarantee)))
        } else {
            flow.expiry
        };
        let _ = writeln!(out, "{}", flow.unparse(entry.dir, input_port, expiry, now));
    }
    out
}

impl Rewriter {
    /// Dump the TCP flow table, one mapping direction per line.
    #[must_use]
    pub fn tcp_table(&self, now: Moment) -> String {
        dump_map(&self.table.lock().unwrap(), self.tcp_map, now)
    }

    /// Dump the UDP flow table.
    #[must_use]
    pub fn udp_table(&self, now: Moment) -> String {
        dump_map(&self.table.lock().unwrap(), self.udp_map, now)
    }

    /// Dump both flow tables.
    #[must_use]
    pub fn table_dump(&self, now: Moment) -> String {
        let guard = self.table.lock().unwrap();
        let mut out = dump_map(&guard, self.tcp_map, now);
        out.push_str(&dump_map(&guard, self.udp_map, now));
        out
    }

    /// Total mappings installed through this rewriter's inputs.
    #[must_use]
    pub fn nmappings(&self) -> u64 {
        let guard = self.table.lock().unwrap();
        self.specs
            .iter()
            .map(|spec| guard.input(spec.input).count)
            .sum()
    }

    /// Total allocation failures across this rewriter's inputs.
    #[must_use]
    pub fn mapping_failures(&self) -> u64 {
        let guard = self.table.lock().unwrap();
        self.specs
            .iter()
            .map(|spec| guard.input(spec.input).failures)
            .sum()
    }

    /// Live flows in the shared table.
    #[must_use]
    pub fn size(&self) -> usize {
        self.table.lock().unwrap().size()
    }

    /// The shared table's capacity bound.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.table.lock().unwrap().capacity()
    }

    /// Resize the shared table's capacity, evicting as needed.
    pub fn set_capacity(&self, capacity: usize, now: Moment) {
        self.table.lock().unwrap().set_capacity(capacity, now);
    }

    /// Evict every flow in the shared table.
    pub fn clear(&self) {
        self.table.lock().unwrap().clear();
    }

    /// Return the rewritten 4-tuple a flow identifier maps to, searching
    /// TCP then UDP.
    #[must_use]
    pub fn lookup(&self, flowid: &FlowId) -> Option<FlowId> {
        let guard = self.table.lock().unwrap();
        [self.tcp_map, self.udp_map].into_iter().find_map(|map| {
            let entry = guard.lookup(map, flowid)?;
            Some(guard.flow(entry.flow).rewritten_flowid(entry.dir))
        })
    }

    /// Describe one input's spec (the `pattern<i>` read handler).
    #[must_use]
    pub fn input_spec_dump(&self, port: usize) -> Option<String> {
        let spec = self.specs.get(port)?;
        let mut out = match &spec.kind {
            SpecKind::Drop => "<drop>".to_string(),
            SpecKind::Nochange => "<nochange>".to_string(),
            SpecKind::Keep => "<keep>".to_string(),
            SpecKind::Pattern(pattern) => pattern.to_string(),
            SpecKind::Mapper(_) => "<mapper>".to_string(),
        };
        let count = self.table.lock().unwrap().input(spec.input).count;
        if count > 0 {
            let _ = write!(out, " [{count}]");
        }
        Some(out)
    }

    /// Replace one input's spec at runtime (the `pattern<i>` write
    /// handler).  Flows created by the old spec are destroyed and the
    /// input's counters reset.
    ///
    /// # Errors
    ///
    /// Returns a [`SpecError`] when the port does not exist or the new
    /// spec references an out-of-range output.
    pub fn set_input_spec(&mut self, port: usize, cfg: &InputSpecConfig) -> Result<(), SpecError> {
        if port >= self.specs.len() {
            return Err(SpecError::Unknown(format!("input {port}")));
        }
        // The reply element's output count equals this one's unless the
        // rewriter was built with an explicit reply target; the spec kept
        // its validated reply maps either way.
        let (kind, foutput, routput) = resolve_spec(cfg, self.noutputs, self.noutputs)?;
        let spec = &mut self.specs[port];
        let mut guard = self.table.lock().unwrap();
        guard.destroy_input_flows(spec.input);
        spec.kind = kind;
        spec.foutput = foutput;
        spec.routput = routput;
        Ok(())
    }
}
