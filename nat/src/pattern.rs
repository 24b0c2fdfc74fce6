// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Rewritten flow-identifier allocation.
//!
//! A pattern is a template `SADDR SPORT DADDR DPORT` where each field is
//! either a fixed value or `-` (keep the packet's own value).  Exactly one
//! field may carry a range: the source port (NAPT) or the source address
//! (NAT).  Allocation substitutes the fixed fields, then picks a free
//! value in the range by probing the reply map, so a fresh mapping never
//! collides with a live reverse mapping.

use crate::flowid::FlowId;
use core::fmt::{Display, Formatter};
use rand::Rng;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// An error in a pattern specification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    /// The template does not have four fields.
    #[error("syntax error, expected SADDR SPORT DADDR DPORT")]
    Syntax,
    /// The source address field does not parse.
    #[error("bad source address")]
    BadSourceAddress,
    /// The source port field does not parse.
    #[error("bad source port")]
    BadSourcePort,
    /// The destination address field does not parse.
    #[error("bad destination address")]
    BadDestAddress,
    /// The destination port field does not parse.
    #[error("bad destination port")]
    BadDestPort,
    /// Both the address and the port carry a range.
    #[error("only one of SADDR and SPORT may carry a range")]
    TwoRanges,
    /// A named pattern was registered twice.
    #[error("duplicate pattern name {0:?}")]
    DuplicateName(String),
    /// A named pattern is not in the registry.
    #[error("no such pattern {0:?}")]
    NoSuchPattern(String),
}

/// Which template field carries the allocation range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variation {
    /// No range; the template is fixed.
    None,
    /// Range on the source port; the value is the range size minus one.
    Port(u32),
    /// Range on the source address; the value is the range size minus one.
    Addr(u32),
}

/// A rewrite template with collision-avoiding range allocation.
///
/// Patterns are shared between input specs (and across rewriters) as
/// `Arc<Pattern>`; the sequential rotor is interior-mutable so sharing a
/// pattern shares its allocation cursor.
#[derive(Debug)]
pub struct Pattern {
    saddr: Option<Ipv4Addr>,
    sport: u16,
    daddr: Option<Ipv4Addr>,
    dport: u16,
    variation: Variation,
    sequential: bool,
    same_first: bool,
    next_variation: AtomicU32,
}

impl Pattern {
    /// Parse a four-word template.  Range forms are `L-H` on the port,
    /// `A-B` or `A.B.C.D/N` on the source address, with the modifiers `#`
    /// (sequential allocation) and `?` (no stickiness) appended to the
    /// ranged field.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] describing the offending field.
    pub fn parse(words: &[&str]) -> Result<Pattern, PatternError> {
        let [saddr_w, sport_w, daddr_w, dport_w] = words else {
            return Err(PatternError::Syntax);
        };

        let mut sequential = false;
        let mut same_first = true;
        let mut variation = Variation::None;

        let saddr = if *saddr_w == "-" {
            None
        } else if let Ok(addr) = Ipv4Addr::from_str(saddr_w) {
            Some(addr)
        } else if let Some((base, top)) =
            addr_variation(saddr_w, &mut sequential, &mut same_first)
        {
            variation = Variation::Addr(top);
            Some(base)
        } else {
            return Err(PatternError::BadSourceAddress);
        };

        let sport = if *sport_w == "-" {
            0
        } else if let Ok(port) = parse_port(sport_w) {
            port
        } else if let Some((base, top)) = port_variation(sport_w, &mut sequential, &mut same_first)
        {
            if variation != Variation::None {
                return Err(PatternError::TwoRanges);
            }
            variation = Variation::Port(top);
            base
        } else {
            return Err(PatternError::BadSourcePort);
        };

        let daddr = if *daddr_w == "-" {
            None
        } else {
            Some(Ipv4Addr::from_str(daddr_w).map_err(|_| PatternError::BadDestAddress)?)
        };

        let dport = if *dport_w == "-" {
            0
        } else {
            parse_port(dport_w).map_err(|_| PatternError::BadDestPort)?
        };

        if matches!(variation, Variation::Addr(_)) && saddr.is_none() {
            return Err(PatternError::BadSourceAddress);
        }

        Ok(Pattern {
            saddr,
            sport,
            daddr,
            dport,
            variation,
            sequential,
            same_first,
            next_variation: AtomicU32::new(0),
        })
    }

    /// Compose the rewritten flow identifier for `flowid`, allocating a
    /// range value that `occupied` reports free against the reply map.
    /// Returns `None` when the range is exhausted; the caller drops the
    /// packet and counts a mapping failure.
    pub fn rewrite_flowid(
        &self,
        flowid: &FlowId,
        occupied: impl Fn(&FlowId) -> bool,
    ) -> Option<FlowId> {
        let mut rewritten = *flowid;
        if let Some(addr) = self.saddr {
            rewritten.saddr = addr;
        }
        if self.sport != 0 {
            rewritten.sport = self.sport;
        }
        if let Some(addr) = self.daddr {
            rewritten.daddr = addr;
        }
        if self.dport != 0 {
            rewritten.dport = self.dport;
        }

        let top = match self.variation {
            Variation::None => return Some(rewritten),
            Variation::Port(top) | Variation::Addr(top) => top,
        };
        let is_port = matches!(self.variation, Variation::Port(_));
        let base = if is_port {
            u32::from(self.sport)
        } else {
            self.saddr.map(u32::from).unwrap_or_default()
        };

        // The probe key is the reply-direction lookup: reply packets for a
        // candidate carry it as their destination.
        let mut lookup = rewritten.reverse();
        let probe = |lookup: &mut FlowId, val: u32| {
            if is_port {
                #[allow(clippy::cast_possible_truncation)] // port ranges stay below 2^16
                {
                    lookup.dport = (base + val) as u16;
                }
            } else {
                lookup.daddr = Ipv4Addr::from(base.wrapping_add(val));
            }
        };

        let mut found = None;
        if self.same_first {
            // Stickiness: prefer the packet's own port (or address).
            let own = if is_port {
                u32::from(flowid.sport)
            } else {
                u32::from(flowid.saddr)
            };
            let val = own.wrapping_sub(base);
            if val <= top {
                probe(&mut lookup, val);
                if !occupied(&lookup) {
                    found = Some(val);
                }
            }
        }

        if found.is_none() {
            let mut val = if self.sequential {
                let next = self.next_variation.load(Ordering::Relaxed);
                if next > top { 0 } else { next }
            } else {
                rand::rng().random_range(0..=top)
            };
            for _ in 0..=top {
                probe(&mut lookup, val);
                if !occupied(&lookup) {
                    found = Some(val);
                    break;
                }
                val = if val == top { 0 } else { val + 1 };
            }
        }

        let val = found?;
        if is_port {
            rewritten.sport = lookup.dport;
        } else {
            rewritten.saddr = lookup.daddr;
        }
        self.next_variation.store(val + 1, Ordering::Relaxed);
        Some(rewritten)
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match (self.saddr, self.variation) {
            (Some(addr), Variation::Addr(top)) => {
                write!(f, "{addr}-{}", Ipv4Addr::from(u32::from(addr).wrapping_add(top)))?;
            }
            (Some(addr), _) => write!(f, "{addr}")?,
            (None, _) => write!(f, "-")?,
        }
        match (self.sport, self.variation) {
            (0, _) => write!(f, " -")?,
            (port, Variation::Port(top)) => {
                write!(f, " {port}-{}", u32::from(port) + top)?;
            }
            (port, _) => write!(f, " {port}")?,
        }
        match self.daddr {
            Some(addr) => write!(f, " {addr}")?,
            None => write!(f, " -")?,
        }
        match self.dport {
            0 => write!(f, " -"),
            port => write!(f, " {port}"),
        }
    }
}

fn parse_port(word: &str) -> Result<u16, ()> {
    match word.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(()),
    }
}

/// Strip a trailing `#` (sequential) or `?` (no stickiness) modifier.
fn strip_modifiers<'a>(word: &'a str, sequential: &mut bool, same_first: &mut bool) -> &'a str {
    if let Some(rest) = word.strip_suffix('#') {
        *sequential = true;
        *same_first = false;
        rest
    } else if let Some(rest) = word.strip_suffix('?') {
        *same_first = false;
        rest
    } else {
        word
    }
}

fn port_variation(word: &str, sequential: &mut bool, same_first: &mut bool) -> Option<(u16, u32)> {
    let word = strip_modifiers(word, sequential, same_first);
    let (low, high) = word.split_once('-')?;
    let low = low.parse::<u16>().ok()?;
    let high = high.parse::<u16>().ok()?;
    if low == 0 || high < low {
        return None;
    }
    Some((low, u32::from(high) - u32::from(low)))
}

fn addr_variation(
    word: &str,
    sequential: &mut bool,
    same_first: &mut bool,
) -> Option<(Ipv4Addr, u32)> {
    let word = strip_modifiers(word, sequential, same_first);
    if let Some((low, high)) = word.split_once('-') {
        let low = Ipv4Addr::from_str(low).ok()?;
        let high = Ipv4Addr::from_str(high).ok()?;
        if u32::from(high) < u32::from(low) {
            return None;
        }
        return Some((low, u32::from(high) - u32::from(low)));
    }
    if let Some((addr, prefix)) = word.split_once('/') {
        let addr = Ipv4Addr::from_str(addr).ok()?;
        let prefix = prefix.parse::<u8>().ok()?;
        if prefix > 32 {
            return None;
        }
        let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        return match prefix {
            32 => Some((addr, 0)),
            31 => Some((Ipv4Addr::from(u32::from(addr) & mask), 1)),
            _ => {
                // Skip the network address and broadcast by convention.
                let base = (u32::from(addr) & mask) | 1;
                Some((Ipv4Addr::from(base), !mask - 2))
            }
        };
    }
    None
}

/// A router-wide registry of named patterns.  Input specs of the form
/// `pattern NAME FOUT ROUT` resolve against it; sharing a name shares the
/// pattern's collision domain and rotor.
#[derive(Debug, Default)]
pub struct PatternSet {
    patterns: HashMap<String, Arc<Pattern>>,
}

impl PatternSet {
    /// An empty registry.
    #[must_use]
    pub fn new() -> PatternSet {
        PatternSet::default()
    }

    /// Register `pattern` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError::DuplicateName`] when the name is taken.
    pub fn insert(&mut self, name: &str, pattern: Pattern) -> Result<(), PatternError> {
        if self.patterns.contains_key(name) {
            return Err(PatternError::DuplicateName(name.to_string()));
        }
        self.patterns.insert(name.to_string(), Arc::new(pattern));
        Ok(())
    }

    /// Look up a named pattern.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Pattern>> {
        self.patterns.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> FlowId {
        FlowId::new(
            Ipv4Addr::new(10, 0, 0, 2),
            33000,
            Ipv4Addr::new(2, 0, 0, 2),
            80,
        )
    }

    fn no_collisions(_: &FlowId) -> bool {
        false
    }

    #[test]
    fn fixed_pattern_substitutes_fields() {
        let p = Pattern::parse(&["1.0.0.1", "9000", "-", "-"]).unwrap();
        let out = p.rewrite_flowid(&flow(), no_collisions).unwrap();
        assert_eq!(
            out,
            FlowId::new(
                Ipv4Addr::new(1, 0, 0, 1),
                9000,
                Ipv4Addr::new(2, 0, 0, 2),
                80
            )
        );
    }

    #[test]
    fn dash_fields_pass_through() {
        let p = Pattern::parse(&["-", "-", "-", "-"]).unwrap();
        assert_eq!(p.rewrite_flowid(&flow(), no_collisions).unwrap(), flow());
    }

    #[test]
    fn port_range_allocates_within_bounds() {
        let p = Pattern::parse(&["1.0.0.1", "9000-14000", "-", "-"]).unwrap();
        let out = p.rewrite_flowid(&flow(), no_collisions).unwrap();
        assert_eq!(out.saddr, Ipv4Addr::new(1, 0, 0, 1));
        assert!((9000..=14000).contains(&out.sport));
    }

    #[test]
    fn stickiness_keeps_own_port_when_free() {
        let p = Pattern::parse(&["1.0.0.1", "30000-40000", "-", "-"]).unwrap();
        let out = p.rewrite_flowid(&flow(), no_collisions).unwrap();
        assert_eq!(out.sport, 33000);
    }

    #[test]
    fn collision_probe_uses_reply_key() {
        let p = Pattern::parse(&["1.0.0.1", "9000-9001", "-", "-"]).unwrap();
        // Pretend 9000 is taken by a live reverse mapping.
        let taken =
            FlowId::new(Ipv4Addr::new(2, 0, 0, 2), 80, Ipv4Addr::new(1, 0, 0, 1), 9000);
        let out = p
            .rewrite_flowid(&flow(), move |probe| *probe == taken)
            .unwrap();
        assert_eq!(out.sport, 9001);
    }

    #[test]
    fn exhausted_range_returns_none() {
        let p = Pattern::parse(&["1.0.0.1", "9000-9000", "-", "-"]).unwrap();
        assert!(p.rewrite_flowid(&flow(), |_| true).is_none());
    }

    #[test]
    fn sequential_mode_advances_the_rotor() {
        let p = Pattern::parse(&["1.0.0.1", "9000-9005#", "-", "-"]).unwrap();
        let a = p.rewrite_flowid(&flow(), no_collisions).unwrap();
        let b = p.rewrite_flowid(&flow(), no_collisions).unwrap();
        let c = p.rewrite_flowid(&flow(), no_collisions).unwrap();
        assert_eq!((a.sport, b.sport, c.sport), (9000, 9001, 9002));
    }

    #[test]
    fn question_mark_disables_stickiness_only() {
        let p = Pattern::parse(&["1.0.0.1", "9000-9001?", "-", "-"]).unwrap();
        let out = p.rewrite_flowid(&flow(), no_collisions).unwrap();
        assert!((9000..=9001).contains(&out.sport));
    }

    #[test]
    fn address_range_allocates_nat_style() {
        let p = Pattern::parse(&["1.0.0.1-1.0.0.4#", "-", "-", "-"]).unwrap();
        let out = p.rewrite_flowid(&flow(), no_collisions).unwrap();
        assert_eq!(out.saddr, Ipv4Addr::new(1, 0, 0, 1));
        assert_eq!(out.sport, 33000); // untouched in pure NAT
        let out = p.rewrite_flowid(&flow(), no_collisions).unwrap();
        assert_eq!(out.saddr, Ipv4Addr::new(1, 0, 0, 2));
    }

    #[test]
    fn prefix_form_excludes_network_and_broadcast() {
        let mut seq = false;
        let mut same = true;
        let (base, top) = addr_variation("1.0.0.0/24", &mut seq, &mut same).unwrap();
        assert_eq!(base, Ipv4Addr::new(1, 0, 0, 1));
        assert_eq!(top, 253); // .1 through .254
        let (base, top) = addr_variation("1.0.0.6/31", &mut seq, &mut same).unwrap();
        assert_eq!(base, Ipv4Addr::new(1, 0, 0, 6));
        assert_eq!(top, 1);
        let (_, top) = addr_variation("1.0.0.6/32", &mut seq, &mut same).unwrap();
        assert_eq!(top, 0);
    }

    #[test]
    fn rejects_malformed_templates() {
        assert_eq!(
            Pattern::parse(&["1.0.0.1", "9000"]).unwrap_err(),
            PatternError::Syntax
        );
        assert_eq!(
            Pattern::parse(&["bogus", "-", "-", "-"]).unwrap_err(),
            PatternError::BadSourceAddress
        );
        assert_eq!(
            Pattern::parse(&["-", "0", "-", "-"]).unwrap_err(),
            PatternError::BadSourcePort
        );
        assert_eq!(
            Pattern::parse(&["-", "9000-80", "-", "-"]).unwrap_err(),
            PatternError::BadSourcePort
        );
        assert_eq!(
            Pattern::parse(&["1.0.0.1-1.0.0.9", "9000-9001", "-", "-"]).unwrap_err(),
            PatternError::TwoRanges
        );
        assert_eq!(
            Pattern::parse(&["-", "-", "-", "70000"]).unwrap_err(),
            PatternError::BadDestPort
        );
    }

    #[test]
    fn unparse_roundtrips_the_template() {
        let p = Pattern::parse(&["1.0.0.1", "9000-14000", "-", "-"]).unwrap();
        assert_eq!(p.to_string(), "1.0.0.1 9000-14000 - -");
        let p = Pattern::parse(&["1.0.0.1-1.0.0.9", "-", "2.0.0.2", "80"]).unwrap();
        assert_eq!(p.to_string(), "1.0.0.1-1.0.0.9 - 2.0.0.2 80");
    }

    #[test]
    fn registry_resolves_and_rejects_duplicates() {
        let mut set = PatternSet::new();
        set.insert("to_www", Pattern::parse(&["1.0.0.1", "9000", "-", "-"]).unwrap())
            .unwrap();
        assert!(set.get("to_www").is_some());
        assert!(set.get("missing").is_none());
        assert_eq!(
            set.insert("to_www", Pattern::parse(&["-", "-", "-", "-"]).unwrap())
                .unwrap_err(),
            PatternError::DuplicateName("to_www".to_string())
        );
    }
}
