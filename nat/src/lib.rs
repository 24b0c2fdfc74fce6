// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all)]
#![warn(clippy::pedantic, rustdoc::all)]
#![allow(clippy::module_name_repetitions)]

//! Stateful network address translation for the rewriter dataplane.
//!
//! The central element is the [`Rewriter`]: it keeps bidirectional
//! flow-to-flow mappings for TCP and UDP traffic, with timeout-driven
//! eviction, capacity-bounded admission, and per-mapping TCP sequence
//! translation.  Fresh rewritten identifiers come from [`Pattern`]s
//! (address/port templates with collision-avoiding range allocation) or
//! from pluggable [`IpMapper`] strategies.  Companions cover ICMP echo
//! sessions, ICMP errors, address-only NAT, and inline FTP PORT editing.
//!
//! Rewriters that share a capacity domain share one [`FlowTable`]; the
//! hot path is synchronous and single-threaded per the cooperative
//! scheduling model, with a mutex around the table for deployments that
//! split elements across workers.
//!
//! # Example
//!
//! ```
//! use natgw_nat::{
//!     FlowTable, InputSpecConfig, MapperSet, Moment, PatternSet, Rewriter, RewriterConfig,
//!     Verdict,
//! };
//! use net::packet::test_utils::tcp_packet;
//! use std::net::Ipv4Addr;
//!
//! let table = FlowTable::new().shared();
//! let patterns = PatternSet::new();
//! let mappers = MapperSet::new();
//! let config = RewriterConfig {
//!     inputs: vec![
//!         // Outbound traffic is source-NAT'd to 1.0.0.1 with a fresh port.
//!         InputSpecConfig::parse("pattern 1.0.0.1 9000-14000 - - 0 1", &patterns, &mappers)
//!             .unwrap(),
//!         // Inbound traffic without a mapping is dropped.
//!         InputSpecConfig::parse("drop", &patterns, &mappers).unwrap(),
//!     ],
//!     noutputs: 2,
//!     ..RewriterConfig::default()
//! };
//! let mut nat = Rewriter::new(&table, &config).unwrap();
//!
//! let mut pkt = tcp_packet(
//!     Ipv4Addr::new(10, 0, 0, 2),
//!     33000,
//!     Ipv4Addr::new(2, 0, 0, 2),
//!     80,
//!     1000,
//!     0,
//!     net::tcp::flags::SYN,
//!     b"",
//! );
//! assert_eq!(nat.push(0, &mut pkt, Moment::ZERO), Verdict::Emit(0));
//! assert_eq!(pkt.ipv4().unwrap().src(), Ipv4Addr::new(1, 0, 0, 1));
//! ```

pub mod addr;
pub mod element;
pub mod flow;
pub mod flowid;
pub mod ftp;
mod handlers;
mod heap;
pub mod icmp;
pub mod mapper;
pub mod pattern;
pub mod rewriter;
pub mod seqdelta;
pub mod spec;
pub mod table;
pub mod time;


pub use addr::{AddrPairRewriter, AddrRewriter, AddrRewriterConfig};
pub use flow::{AnnoConfig, Direction};
pub use flowid::FlowId;
pub use ftp::FtpPortMapper;
pub use icmp::{IcmpErrorRewriter, IcmpPingRewriter, PingRewriterConfig};
pub use mapper::{IpMapper, MapperPattern, MapperRewrite, RoundRobinMapper, SourceHashMapper};
pub use pattern::{Pattern, PatternError, PatternSet};
pub use rewriter::{ReplyTarget, Rewriter, RewriterConfig, Verdict};
pub use spec::{InputSpecConfig, MapperSet, SpecError};
pub use table::{FlowTable, SharedFlowTable};
pub use time::{Clock, Moment};
