//! Executable plans produced by the graph compiler
//!
//! A [`CompiledPlan`] owns every texture it references. Texture slots are indices
//! into [`CompiledPlan::textures`]; several steps may share a slot when their
//! lifetimes do not overlap.

use crate::backend::{Backend, TextureKey};
use crate::graph::NodeId;
use crate::pipeline_cache::CachedPipeline;
use crate::region::Region;
use crate::texture_pool::{PooledTexture, TexturePool};
use std::sync::Arc;

/// Upper bound on input slots per filter
pub const MAX_FILTER_INPUTS: usize = 4;

/// Compute workgroup size in both dimensions
pub const COMPUTE_WORKGROUP_SIZE: u32 = 8;

/// Per-dispatch uniform at binding 0
///
/// Mirrors the `DispatchInfo` struct declared by every filter shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DispatchHeader {
    pub output_origin: [i32; 2],
    pub output_size: [u32; 2],
    /// Origin (xy) and size (zw) of each input texture in working space
    pub input_origins: [[i32; 4]; MAX_FILTER_INPUTS],
}

impl DispatchHeader {
    pub fn new(output: Region, inputs: &[Region]) -> Self {
        let mut input_origins = [[0; 4]; MAX_FILTER_INPUTS];
        for (slot, region) in input_origins.iter_mut().zip(inputs) {
            *slot = [region.x, region.y, region.width as i32, region.height as i32];
        }
        Self {
            output_origin: [output.x, output.y],
            output_size: [output.width, output.height],
            input_origins,
        }
    }
}

/// Pixels of a caller-supplied image, converted to the working space
#[derive(Debug, Clone)]
pub struct SourceUpload {
    pub node: NodeId,
    pub texture: usize,
    pub region: Region,
    /// Premultiplied RGBA floats covering `region`
    pub pixels: Vec<f32>,
}

/// One compute dispatch
#[derive(Debug)]
pub struct DispatchStep<P> {
    pub node: NodeId,
    pub filter: &'static str,
    pub pipeline: Arc<CachedPipeline<P>>,
    /// Texture slots bound at bindings 3.., in input slot order
    pub inputs: Vec<usize>,
    pub output: usize,
    pub region: Region,
    pub header: DispatchHeader,
    /// Runtime parameters, one vec4 each, bound at binding 1
    pub params: Vec<[f32; 4]>,
    pub workgroups: (u32, u32),
}

/// Uploads and dispatches for one render, in execution order
#[derive(Debug)]
pub struct CompiledPlan<B: Backend> {
    pub(crate) uploads: Vec<SourceUpload>,
    pub(crate) steps: Vec<DispatchStep<B::Pipeline>>,
    pub(crate) textures: Vec<PooledTexture<B::Texture>>,
    pub(crate) output: usize,
    pub(crate) region: Region,
}

impl<B: Backend> CompiledPlan<B> {
    pub fn uploads(&self) -> &[SourceUpload] {
        &self.uploads
    }

    pub fn steps(&self) -> &[DispatchStep<B::Pipeline>] {
        &self.steps
    }

    pub fn textures(&self) -> &[PooledTexture<B::Texture>] {
        &self.textures
    }

    /// Slot of the texture holding the final image
    pub fn output(&self) -> usize {
        self.output
    }

    /// Region the output texture covers
    pub fn region(&self) -> Region {
        self.region
    }

    pub fn texture_key(&self, slot: usize) -> Option<TextureKey> {
        self.textures.get(slot).map(PooledTexture::key)
    }

    /// Returns every texture to the pool without running the plan
    pub fn release(self, backend: &B, pool: &TexturePool<B>) {
        for texture in self.textures {
            pool.release(backend, texture);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_header_layout() {
        assert_eq!(std::mem::size_of::<DispatchHeader>(), 80);

        let header = DispatchHeader::new(Region::new(-2, 3, 4, 5), &[Region::new(-4, 1, 8, 9)]);
        assert_eq!(header.output_origin, [-2, 3]);
        assert_eq!(header.output_size, [4, 5]);
        assert_eq!(header.input_origins[0], [-4, 1, 8, 9]);
        assert_eq!(header.input_origins[1], [0; 4]);
    }
}
