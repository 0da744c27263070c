//! Lazily evaluated GPU image filters on wgpu
//!
//! Client code describes an image as an immutable [`FilterGraph`]. Nothing touches
//! the GPU until [`Executor::render`] is called: the graph is then compiled into a
//! [`CompiledPlan`] of compute dispatches, run on the device and read back.
//! Compiled pipelines and intermediate textures are cached across renders.

mod backend;
mod compiler;
mod context;
mod error;
mod executor;
mod filters;
mod format;
mod graph;
mod pipeline_cache;
mod plan;
mod region;
mod shader_registry;
mod texture_pool;

#[cfg(test)]
mod testing;

pub use backend::{Backend, PipelineRequest, TextureKey};
pub use compiler::GraphCompiler;
pub use context::{ComputeKernel, GpuContext};
pub use error::RenderError;
pub use executor::{Executor, ExecutorConfig, RenderOptions, RenderResult};
pub use filters::{BuiltinFilter, FilterCatalog, FilterDefinition, ParameterKind, ParameterSpec, RegionRule, ResolvedParams, builtin_filters};
pub use format::{AlphaMode, ImageBuffer, PixelFormat, encode_working};
pub use graph::{FilterGraph, FilterNode, GraphNode, NodeId, ParamValue, SourceNodes};
pub use pipeline_cache::{CachedPipeline, PipelineCache, PipelineKey, VariantSignature};
pub use plan::{CompiledPlan, DispatchHeader, DispatchStep, SourceUpload};
pub use region::Region;
pub use shader_registry::{ShaderRegistry, ShaderSource};
pub use texture_pool::{PooledTexture, TexturePool};
