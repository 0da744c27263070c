//! Device abstraction used by the pool, the pipeline cache and the compiler

use crate::error::RenderError;
use crate::filters::FilterDefinition;
use crate::format::PixelFormat;
use crate::shader_registry::ShaderSource;
use std::fmt;
use std::future::Future;

/// Shape of a pooled texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureKey {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl TextureKey {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self { width, height, format }
    }
}

impl fmt::Display for TextureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {:?}", self.width, self.height, self.format)
    }
}

/// Everything needed to build one compute pipeline variant
#[derive(Debug, Clone, Copy)]
pub struct PipelineRequest<'a> {
    pub filter: &'a FilterDefinition,
    pub shader: &'a ShaderSource,
    /// Values for the shader's override constants
    pub constants: &'a [(String, f64)],
}

/// A device capable of allocating textures and compiling compute pipelines
///
/// The generation changes whenever the underlying device is recreated. Resources
/// tagged with an older generation must not be handed out again.
pub trait Backend: Send + Sync {
    type Texture: Clone + fmt::Debug + Send + Sync + 'static;
    type Pipeline: fmt::Debug + Send + Sync + 'static;

    fn generation(&self) -> u64;

    fn max_texture_dimension(&self) -> u32;

    fn create_texture(&self, key: &TextureKey) -> Result<Self::Texture, RenderError>;

    fn create_pipeline<'a>(&'a self, request: PipelineRequest<'a>) -> impl Future<Output = Result<Self::Pipeline, RenderError>> + Send + 'a;
}
