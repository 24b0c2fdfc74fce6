// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Runtime-assembled pipelines.

use crate::dyn_nf::{DynNetworkFunction, PacketIter, nf_dyn};
use crate::static_nf::NetworkFunction;
use net::packet::Packet;

/// A pipeline of boxed network functions assembled at runtime.
///
/// The pipeline itself implements [`NetworkFunction`] and can be used
/// anywhere a single stage is expected.
#[derive(Default)]
pub struct DynPipeline {
    nfs: Vec<Box<dyn DynNetworkFunction>>,
}

impl DynPipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new() -> DynPipeline {
        DynPipeline { nfs: Vec::new() }
    }

    /// Append a stage to the pipeline.
    #[must_use]
    pub fn add_stage(mut self, nf: impl NetworkFunction + 'static) -> DynPipeline {
        self.nfs.push(nf_dyn(nf));
        self
    }

    /// Number of stages in the pipeline.
    #[must_use]
    pub fn num_stages(&self) -> usize {
        self.nfs.len()
    }
}

impl NetworkFunction for DynPipeline {
    fn process<'a, Input: Iterator<Item = Packet> + 'a>(
        &'a mut self,
        input: Input,
    ) -> impl Iterator<Item = Packet> + 'a {
        let mut iter: PacketIter<'a> = Box::new(input);
        for nf in &mut self.nfs {
            iter = nf.process_dyn(iter);
        }
        iter
    }
}
