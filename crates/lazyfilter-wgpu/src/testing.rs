//! In-memory backend for unit tests

use crate::backend::{Backend, PipelineRequest, TextureKey};
use crate::error::RenderError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct FakeTexture {
    pub serial: u64,
    pub key: TextureKey,
}

#[derive(Debug, PartialEq)]
pub struct FakePipeline {
    pub filter: String,
    pub constants: Vec<(String, f64)>,
}

/// Counts allocations and compiles; never touches a GPU
#[derive(Debug)]
pub struct FakeBackend {
    generation: AtomicU64,
    textures: AtomicU64,
    compiles: Arc<AtomicUsize>,
    compile_delay: Duration,
    max_dimension: u32,
    fail_compiles: bool,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            generation: AtomicU64::new(1),
            textures: AtomicU64::new(0),
            compiles: Arc::new(AtomicUsize::new(0)),
            compile_delay: Duration::ZERO,
            max_dimension: 8192,
            fail_compiles: false,
        }
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every compile sleep so concurrent callers overlap
    pub fn with_compile_delay(mut self, delay: Duration) -> Self {
        self.compile_delay = delay;
        self
    }

    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    pub fn failing_compiles(mut self) -> Self {
        self.fail_compiles = true;
        self
    }

    pub fn texture_allocations(&self) -> u64 {
        self.textures.load(Ordering::SeqCst)
    }

    pub fn compilations(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    /// Simulates a recreated device
    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl Backend for FakeBackend {
    type Texture = FakeTexture;
    type Pipeline = FakePipeline;

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn max_texture_dimension(&self) -> u32 {
        self.max_dimension
    }

    fn create_texture(&self, key: &TextureKey) -> Result<FakeTexture, RenderError> {
        let serial = self.textures.fetch_add(1, Ordering::SeqCst);
        Ok(FakeTexture { serial, key: *key })
    }

    async fn create_pipeline<'a>(&'a self, request: PipelineRequest<'a>) -> Result<FakePipeline, RenderError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if !self.compile_delay.is_zero() {
            tokio::time::sleep(self.compile_delay).await;
        }
        if self.fail_compiles {
            return Err(RenderError::CompilationFailed {
                filter: request.filter.id.to_string(),
                message: "rejected by fake backend".to_string(),
            });
        }
        Ok(FakePipeline {
            filter: request.filter.id.to_string(),
            constants: request.constants.to_vec(),
        })
    }
}
