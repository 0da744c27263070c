//! Memoized compute pipelines keyed by filter and shader variant

use crate::backend::{Backend, PipelineRequest};
use crate::error::RenderError;
use crate::filters::FilterDefinition;
use crate::shader_registry::ShaderRegistry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// Compile-time parameter values that select a shader variant
///
/// Rendered as sorted `NAME=value` pairs joined by commas; empty when the filter
/// has no compile-time parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct VariantSignature(String);

impl VariantSignature {
    pub fn from_constants(constants: &[(String, f64)]) -> Self {
        let mut pairs = constants.iter().map(|(name, value)| format!("{name}={value}")).collect::<Vec<_>>();
        pairs.sort();
        Self(pairs.join(","))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VariantSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub filter: String,
    pub variant: VariantSignature,
}

impl fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.variant.as_str().is_empty() {
            write!(f, "{}", self.filter)
        } else {
            write!(f, "{}[{}]", self.filter, self.variant)
        }
    }
}

/// A compiled pipeline and the device generation and shader source that produced it
#[derive(Debug)]
pub struct CachedPipeline<P> {
    key: PipelineKey,
    generation: u64,
    source: u64,
    pipeline: P,
}

impl<P> CachedPipeline<P> {
    pub fn key(&self) -> &PipelineKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }
}

type Slot<P> = Arc<OnceCell<Result<Arc<CachedPipeline<P>>, RenderError>>>;

/// Get-or-compile table with at most one compile in flight per key
///
/// Concurrent misses on the same key share one compile: the first caller runs it
/// and the others await the same cell. Failed compiles are not cached.
#[derive(Debug)]
pub struct PipelineCache<B: Backend> {
    slots: Mutex<HashMap<PipelineKey, Slot<B::Pipeline>>>,
    compilations: AtomicUsize,
}

impl<B: Backend> Default for PipelineCache<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> PipelineCache<B> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            compilations: AtomicUsize::new(0),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<PipelineKey, Slot<B::Pipeline>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, key: &PipelineKey, generation: u64, source: u64) -> Slot<B::Pipeline> {
        let mut slots = self.slots();
        if let Some(slot) = slots.get(key) {
            let stale = matches!(slot.get(), Some(Ok(cached)) if cached.generation != generation || cached.source != source);
            if !stale {
                return slot.clone();
            }
        }
        let slot: Slot<B::Pipeline> = Arc::new(OnceCell::new());
        slots.insert(key.clone(), slot.clone());
        slot
    }

    /// Returns the pipeline for `filter` compiled with `constants`, compiling on a miss
    ///
    /// A cached pipeline built from a different device generation or an older shader
    /// source counts as a miss.
    pub async fn get_pipeline(
        &self,
        backend: &B,
        registry: &ShaderRegistry,
        filter: &FilterDefinition,
        constants: &[(String, f64)],
    ) -> Result<Arc<CachedPipeline<B::Pipeline>>, RenderError> {
        let key = PipelineKey {
            filter: filter.id.to_string(),
            variant: VariantSignature::from_constants(constants),
        };
        let shader = registry.source(filter.id).ok_or_else(|| RenderError::ShaderNotFound(filter.id.to_string()))?;
        let source = shader.fingerprint();
        let generation = backend.generation();
        let slot = self.slot(&key, generation, source);

        let result = slot
            .get_or_init(|| async {
                self.compilations.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(%key, generation, "compiling pipeline");
                let pipeline = backend.create_pipeline(PipelineRequest { filter, shader: &shader, constants }).await?;
                Ok(Arc::new(CachedPipeline {
                    key: key.clone(),
                    generation,
                    source,
                    pipeline,
                }))
            })
            .await
            .clone();

        if result.is_err() {
            let mut slots = self.slots();
            if slots.get(&key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                slots.remove(&key);
            }
        }
        result
    }

    /// Forgets every cached pipeline; the next request for any key recompiles
    pub fn invalidate_all(&self) {
        let mut slots = self.slots();
        let dropped = slots.len();
        slots.clear();
        tracing::debug!(dropped, "invalidated pipeline cache");
    }

    /// Number of compiles started over the cache's lifetime
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
