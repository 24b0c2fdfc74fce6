// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Pipeline adapters for the rewriter elements.
//!
//! Each adapter implements [`NetworkFunction`], consuming the packet's
//! input-port metadata and stamping the chosen output port; dropped
//! packets disappear from the stream.  Time comes from a [`Clock`], so
//! tests can pin it.

use crate::ftp::FtpPortMapper;
use crate::icmp::{IcmpErrorRewriter, IcmpPingRewriter};
use crate::rewriter::{Rewriter, Verdict};
use crate::time::Clock;
use net::packet::Packet;
use pipeline::NetworkFunction;

fn route(pkt: &mut Packet, verdict: Verdict) -> bool {
    match verdict {
        Verdict::Emit(out) => {
            pkt.meta_mut().out_port = out;
            true
        }
        Verdict::Drop => false,
    }
}

/// A [`Rewriter`] as a pipeline stage.
#[derive(Debug)]
pub struct RewriterElement {
    /// The wrapped rewriter.
    pub rewriter: Rewriter,
    /// The element's time source.
    pub clock: Clock,
}

impl RewriterElement {
    /// Wrap `rewriter` with a system clock.
    #[must_use]
    pub fn new(rewriter: Rewriter) -> RewriterElement {
        RewriterElement {
            rewriter,
            clock: Clock::system(),
        }
    }
}

impl NetworkFunction for RewriterElement {
    fn process<'a, Input: Iterator<Item = Packet> + 'a>(
        &'a mut self,
        input: Input,
    ) -> impl Iterator<Item = Packet> + 'a {
        input.filter_map(move |mut pkt| {
            let port = usize::from(pkt.meta().in_port);
            let verdict = self.rewriter.push(port, &mut pkt, self.clock.now());
            route(&mut pkt, verdict).then_some(pkt)
        })
    }
}

/// An [`IcmpPingRewriter`] as a pipeline stage.
#[derive(Debug)]
pub struct PingRewriterElement {
    /// The wrapped rewriter.
    pub rewriter: IcmpPingRewriter,
    /// The element's time source.
    pub clock: Clock,
}

impl PingRewriterElement {
    /// Wrap `rewriter` with a system clock.
    #[must_use]
    pub fn new(rewriter: IcmpPingRewriter) -> PingRewriterElement {
        PingRewriterElement {
            rewriter,
            clock: Clock::system(),
        }
    }
}

impl NetworkFunction for PingRewriterElement {
    fn process<'a, Input: Iterator<Item = Packet> + 'a>(
        &'a mut self,
        input: Input,
    ) -> impl Iterator<Item = Packet> + 'a {
        input.filter_map(move |mut pkt| {
            let port = usize::from(pkt.meta().in_port);
            let verdict = self.rewriter.push(port, &mut pkt, self.clock.now());
            route(&mut pkt, verdict).then_some(pkt)
        })
    }
}

/// An [`IcmpErrorRewriter`] as a pipeline stage.
#[derive(Debug)]
pub struct IcmpErrorElement {
    /// The wrapped rewriter.
    pub rewriter: IcmpErrorRewriter,
}

impl NetworkFunction for IcmpErrorElement {
    fn process<'a, Input: Iterator<Item = Packet> + 'a>(
        &'a mut self,
        input: Input,
    ) -> impl Iterator<Item = Packet> + 'a {
        input.filter_map(move |mut pkt| {
            let verdict = self.rewriter.push(&mut pkt);
            route(&mut pkt, verdict).then_some(pkt)
        })
    }
}

/// An [`FtpPortMapper`] as a pipeline stage on the control channel.
#[derive(Debug)]
pub struct FtpPortMapperElement {
    /// The wrapped helper.
    pub helper: FtpPortMapper,
    /// The element's time source.
    pub clock: Clock,
}

impl FtpPortMapperElement {
    /// Wrap `helper` with a system clock.
    #[must_use]
    pub fn new(helper: FtpPortMapper) -> FtpPortMapperElement {
        FtpPortMapperElement {
            helper,
            clock: Clock::system(),
        }
    }
}

impl NetworkFunction for FtpPortMapperElement {
    fn process<'a, Input: Iterator<Item = Packet> + 'a>(
        &'a mut self,
        input: Input,
    ) -> impl Iterator<Item = Packet> + 'a {
        input.filter_map(move |mut pkt| {
            let verdict = self.helper.process(&mut pkt, self.clock.now());
            route(&mut pkt, verdict).then_some(pkt)
        })
    }
}
