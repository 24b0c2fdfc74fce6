// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![forbid(unsafe_code)]
#![deny(missing_docs, clippy::all)]
#![warn(clippy::pedantic)]

//! # Pipeline Building Blocks
//!
//! This crate provides the building blocks for composing packet functions
//! into processing pipelines.  There are two ways of linking functions in
//! sequence:
//!
//! - [`StaticChain`]: statically chain functions at compile time,
//! - [`DynPipeline`]: assemble a pipeline of boxed stages at runtime.
//!
//! A packet function is anything that implements [`NetworkFunction`]: it
//! consumes an iterator of packets and yields an iterator of packets,
//! dropping, mutating, or passing each one through.  The [`sample_nfs`]
//! module holds a few small examples.
//!
//! ```
//! use natgw_pipeline::sample_nfs::{DecrementTtl, Passthrough};
//! use natgw_pipeline::{DynPipeline, NetworkFunction, StaticChain};
//! use net::packet::test_utils::udp_packet;
//! use std::net::Ipv4Addr;
//!
//! let mut pipeline = DynPipeline::new()
//!     .add_stage(Passthrough.chain(DecrementTtl))
//!     .add_stage(DecrementTtl);
//!
//! let pkt = udp_packet(
//!     Ipv4Addr::new(1, 2, 3, 4),
//!     5000,
//!     Ipv4Addr::new(5, 6, 7, 8),
//!     53,
//!     b"",
//! );
//! let out: Vec<_> = pipeline.process(std::iter::once(pkt)).collect();
//! assert_eq!(out.len(), 1);
//! ```
//!
//! Statically chained stages compile to direct calls; keep such chains
//! short, and wrap longer compositions in a [`DynPipeline`].

mod dyn_nf;
mod pipeline;
pub mod sample_nfs;
mod static_nf;

pub use dyn_nf::{DynNetworkFunction, nf_dyn};
pub use pipeline::DynPipeline;
pub use static_nf::{Chain, NetworkFunction, StaticChain};
