// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The [`NetworkFunction`] trait and static chaining.

use net::packet::Packet;

/// A packet-processing function: an iterator transformer over owned
/// packets.  Implementations may drop, mutate, or reorder packets, but
/// must be driven to exhaustion by the caller.
pub trait NetworkFunction {
    /// Process `input`, yielding the surviving packets.
    fn process<'a, Input: Iterator<Item = Packet> + 'a>(
        &'a mut self,
        input: Input,
    ) -> impl Iterator<Item = Packet> + 'a;
}

/// Static composition of two network functions; built by
/// [`StaticChain::chain`].
#[derive(Debug)]
pub struct Chain<First, Second> {
    first: First,
    second: Second,
}

impl<First: NetworkFunction, Second: NetworkFunction> NetworkFunction for Chain<First, Second> {
    fn process<'a, Input: Iterator<Item = Packet> + 'a>(
        &'a mut self,
        input: Input,
    ) -> impl Iterator<Item = Packet> + 'a {
        let Chain { first, second } = self;
        second.process(first.process(input))
    }
}

/// Extension trait for chaining network functions statically.
pub trait StaticChain: NetworkFunction + Sized {
    /// Feed this function's output into `next`.
    fn chain<Next: NetworkFunction>(self, next: Next) -> Chain<Self, Next> {
        Chain {
            first: self,
            second: next,
        }
    }
}

impl<T: NetworkFunction> StaticChain for T {}
