// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Object-safe adapter over [`NetworkFunction`].

use crate::static_nf::NetworkFunction;
use net::packet::Packet;

/// A boxed iterator of packets, used to erase stage types at runtime.
pub type PacketIter<'a> = Box<dyn Iterator<Item = Packet> + 'a>;

/// Object-safe form of [`NetworkFunction`], suitable for storage in a
/// [`crate::DynPipeline`].
pub trait DynNetworkFunction {
    /// Process `input`, yielding the surviving packets.
    fn process_dyn<'a>(&'a mut self, input: PacketIter<'a>) -> PacketIter<'a>;
}

struct DynNetworkFunctionImpl<NF: NetworkFunction> {
    nf: NF,
}

impl<NF: NetworkFunction> DynNetworkFunction for DynNetworkFunctionImpl<NF> {
    fn process_dyn<'a>(&'a mut self, input: PacketIter<'a>) -> PacketIter<'a> {
        Box::new(self.nf.process(input))
    }
}

/// Box a [`NetworkFunction`] into its object-safe form.
pub fn nf_dyn<NF: NetworkFunction + 'static>(nf: NF) -> Box<dyn DynNetworkFunction> {
    Box::new(DynNetworkFunctionImpl { nf })
}
