//! Render entry point: device ownership, plan execution and readback
//!
//! The [`Executor`] owns the device slot, the filter catalog, the shader registry,
//! the pipeline cache and the texture pool. A render obtains the device (creating it
//! on first use), compiles the graph, uploads sources, records one compute pass per
//! step, submits, waits for completion and reads the output back.

use crate::backend::Backend;
use crate::compiler::GraphCompiler;
use crate::context::GpuContext;
use crate::error::RenderError;
use crate::filters::FilterCatalog;
use crate::format::{AlphaMode, PixelFormat, encode_working};
use crate::graph::FilterGraph;
use crate::pipeline_cache::PipelineCache;
use crate::plan::{CompiledPlan, SourceUpload};
use crate::region::Region;
use crate::shader_registry::ShaderRegistry;
use crate::texture_pool::{PooledTexture, TexturePool};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use wgpu::util::DeviceExt;

/// Bytes per working-space pixel
const WORKING_PIXEL_BYTES: u32 = 16;

/// Device selection and resource retention settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
    /// Label given to the device
    pub label: String,
    /// Idle textures kept per size and format; unbounded when `None`
    pub max_idle_per_key: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            label: "lazyfilter-wgpu".to_string(),
            max_idle_per_key: None,
        }
    }
}

/// Output layout requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RenderOptions {
    pub format: PixelFormat,
    pub alpha: AlphaMode,
}

/// Pixels produced by one render
///
/// The output texture stays checked out of the pool while the result is alive;
/// hand the result to [`Executor::reclaim`] to recycle it.
#[derive(Debug)]
pub struct RenderResult {
    /// Rows of `region.width` pixels in `format`, top to bottom
    pub pixels: Bytes,
    pub region: Region,
    pub format: PixelFormat,
    pub alpha: AlphaMode,
    texture: PooledTexture<wgpu::Texture>,
}

impl RenderResult {
    pub fn width(&self) -> u32 {
        self.region.width
    }

    pub fn height(&self) -> u32 {
        self.region.height
    }

    /// The GPU texture holding the result in the working space
    pub fn texture(&self) -> &wgpu::Texture {
        self.texture.texture()
    }
}

/// Textures of a plan between compilation and readback
///
/// Dropped before submission, the textures go back to the pool. Dropped after
/// submission, they are discarded since the GPU may still be using them.
struct InFlightTextures<'a> {
    executor: &'a Executor,
    context: Arc<GpuContext>,
    textures: Vec<PooledTexture<wgpu::Texture>>,
    submitted: bool,
}

impl InFlightTextures<'_> {
    /// Hands out the output texture and returns the rest to the pool
    fn finish(mut self, output: usize) -> PooledTexture<wgpu::Texture> {
        let mut textures = std::mem::take(&mut self.textures);
        let output = textures.swap_remove(output);
        for texture in textures {
            self.executor.textures.release(&self.context, texture);
        }
        output
    }
}

impl Drop for InFlightTextures<'_> {
    fn drop(&mut self) {
        if self.textures.is_empty() {
            return;
        }
        if self.submitted {
            tracing::warn!(textures = self.textures.len(), "render abandoned after submission; discarding its textures");
            self.textures.clear();
        } else {
            for texture in self.textures.drain(..) {
                self.executor.textures.release(&self.context, texture);
            }
        }
    }
}

/// Owns the GPU device and every cache built on it
#[derive(Debug)]
pub struct Executor {
    config: ExecutorConfig,
    device: tokio::sync::Mutex<Option<Arc<GpuContext>>>,
    generations: AtomicU64,
    catalog: FilterCatalog,
    shaders: ShaderRegistry,
    pipelines: PipelineCache<GpuContext>,
    textures: TexturePool<GpuContext>,
}

impl Executor {
    /// Creates an executor; the device is requested on first use
    pub fn new(config: ExecutorConfig) -> Self {
        let textures = TexturePool::new(config.max_idle_per_key);
        Self {
            config,
            device: tokio::sync::Mutex::new(None),
            generations: AtomicU64::new(0),
            catalog: FilterCatalog::with_builtins(),
            shaders: ShaderRegistry::with_builtins(),
            pipelines: PipelineCache::new(),
            textures,
        }
    }

    /// Process-wide executor built from the default configuration
    pub fn global() -> &'static Executor {
        static EXECUTOR: OnceLock<Executor> = OnceLock::new();
        EXECUTOR.get_or_init(|| Executor::new(ExecutorConfig::default()))
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn catalog(&self) -> &FilterCatalog {
        &self.catalog
    }

    pub fn shaders(&self) -> &ShaderRegistry {
        &self.shaders
    }

    pub fn pipelines(&self) -> &PipelineCache<GpuContext> {
        &self.pipelines
    }

    pub fn textures(&self) -> &TexturePool<GpuContext> {
        &self.textures
    }

    /// Returns the current device, creating it if there is none or the last one was lost
    ///
    /// Concurrent first callers share a single initialization.
    async fn context(&self) -> Result<Arc<GpuContext>, RenderError> {
        let mut slot = self.device.lock().await;
        if let Some(context) = slot.as_ref() {
            if !context.is_lost() {
                return Ok(context.clone());
            }
            tracing::info!(generation = context.generation(), "replacing lost GPU device");
            *slot = None;
            self.pipelines.invalidate_all();
            self.textures.clear();
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let context = Arc::new(GpuContext::new(&self.config, generation).await?);
        *slot = Some(context.clone());
        Ok(context)
    }

    /// Initializes the device ahead of the first render
    pub async fn initialize(&self) -> Result<(), RenderError> {
        self.context().await.map(|_| ())
    }

    /// Drops every cached pipeline and idle texture
    pub fn clear_caches(&self) {
        self.pipelines.invalidate_all();
        self.textures.clear();
    }

    /// Resets every cache after the device was lost and builds the error to report
    async fn device_lost(&self, context: &Arc<GpuContext>, message: String) -> RenderError {
        context.mark_lost();
        {
            let mut slot = self.device.lock().await;
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, context)) {
                *slot = None;
            }
        }
        self.clear_caches();
        tracing::warn!(%message, "render failed: device lost");
        RenderError::DeviceLost(message)
    }

    /// Renders `region` of `graph` as premultiplied RGBA8
    pub async fn render(&self, graph: &FilterGraph, region: Region) -> Result<RenderResult, RenderError> {
        self.render_with(graph, region, RenderOptions::default()).await
    }

    /// Renders `region` of `graph` in the requested output layout
    ///
    /// [`Region::INFINITE`] renders the graph's whole extent.
    pub async fn render_with(&self, graph: &FilterGraph, region: Region, options: RenderOptions) -> Result<RenderResult, RenderError> {
        let context = self.context().await?;

        let compiler = GraphCompiler::new(context.as_ref(), &self.catalog, &self.shaders, &self.pipelines, &self.textures);
        let plan = match compiler.compile(graph, region).await {
            Ok(plan) => plan,
            Err(e) if context.is_lost() => return Err(self.device_lost(&context, e.to_string()).await),
            Err(e) => return Err(e),
        };
        if context.is_lost() {
            plan.release(&context, &self.textures);
            return Err(self.device_lost(&context, "device lost during compilation".to_string()).await);
        }

        let result = self.execute(context, plan, options).await?;
        tracing::debug!(region = %result.region, format = ?result.format, bytes = result.pixels.len(), "render complete");
        Ok(result)
    }

    /// Blocking variant of [`Executor::render_with`]
    pub fn render_blocking(&self, graph: &FilterGraph, region: Region, options: RenderOptions) -> Result<RenderResult, RenderError> {
        pollster::block_on(self.render_with(graph, region, options))
    }

    /// Returns a result's output texture to the pool
    pub async fn reclaim(&self, result: RenderResult) {
        let slot = self.device.lock().await;
        match slot.as_ref() {
            Some(context) => self.textures.release(context, result.texture),
            None => drop(result),
        }
    }

    fn upload(context: &GpuContext, texture: &wgpu::Texture, upload: &SourceUpload) {
        context.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&upload.pixels),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(upload.region.width * WORKING_PIXEL_BYTES),
                rows_per_image: Some(upload.region.height),
            },
            wgpu::Extent3d {
                width: upload.region.width,
                height: upload.region.height,
                depth_or_array_layers: 1,
            },
        );
    }

    async fn execute(&self, context: Arc<GpuContext>, plan: CompiledPlan<GpuContext>, options: RenderOptions) -> Result<RenderResult, RenderError> {
        let CompiledPlan {
            uploads,
            steps,
            textures,
            output,
            region,
        } = plan;
        if context.is_lost() {
            drop(textures);
            return Err(self.device_lost(&context, "device lost before submission".to_string()).await);
        }
        let mut in_flight = InFlightTextures {
            executor: self,
            context: context.clone(),
            textures,
            submitted: false,
        };

        let ((buffer, submission, padded_bytes_per_row, unpadded_bytes_per_row), error) = context.scoped(|device| {
            for upload in &uploads {
                Self::upload(&context, in_flight.textures[upload.texture].texture(), upload);
            }

            let views = in_flight
                .textures
                .iter()
                .map(|t| t.texture().create_view(&wgpu::TextureViewDescriptor::default()))
                .collect::<Vec<_>>();

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Render Encoder") });

            for step in &steps {
                let kernel = step.pipeline.pipeline();
                let header = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(step.filter),
                    contents: bytemuck::bytes_of(&step.header),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
                // Filters without runtime parameters still get a minimal block.
                let params = if step.params.is_empty() { vec![[0.0f32; 4]] } else { step.params.clone() };
                let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(step.filter),
                    contents: bytemuck::cast_slice(&params),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

                let mut entries = vec![
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: header.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: params.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(&views[step.output]),
                    },
                ];
                for (index, input) in step.inputs.iter().enumerate() {
                    entries.push(wgpu::BindGroupEntry {
                        binding: 3 + index as u32,
                        resource: wgpu::BindingResource::TextureView(&views[*input]),
                    });
                }

                let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(step.filter),
                    layout: &kernel.layout,
                    entries: &entries,
                });

                let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(step.filter),
                    timestamp_writes: None,
                });
                compute_pass.set_pipeline(&kernel.pipeline);
                compute_pass.set_bind_group(0, &bind_group, &[]);
                compute_pass.dispatch_workgroups(step.workgroups.0, step.workgroups.1, 1);
            }

            // Rows in the readback buffer must be aligned.
            let unpadded_bytes_per_row = region.width * WORKING_PIXEL_BYTES;
            let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
            let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Readback Buffer"),
                size: padded_bytes_per_row as u64 * region.height as u64,
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                mapped_at_creation: false,
            });
            encoder.copy_texture_to_buffer(
                wgpu::TexelCopyTextureInfo {
                    texture: in_flight.textures[output].texture(),
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::TexelCopyBufferInfo {
                    buffer: &buffer,
                    layout: wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(padded_bytes_per_row),
                        rows_per_image: Some(region.height),
                    },
                },
                wgpu::Extent3d {
                    width: region.width,
                    height: region.height,
                    depth_or_array_layers: 1,
                },
            );

            let submission = context.queue.submit(std::iter::once(encoder.finish()));
            (buffer, submission, padded_bytes_per_row, unpadded_bytes_per_row)
        });
        in_flight.submitted = true;
        tracing::debug!(steps = steps.len(), uploads = uploads.len(), "submitted render");

        match error {
            None => {}
            Some(error @ wgpu::Error::OutOfMemory { .. }) => return Err(RenderError::ResourceExhausted(error.to_string())),
            // Every binding was checked when the plan was compiled; a rejection here means the device is gone.
            Some(error) => return Err(self.device_lost(&context, error.to_string()).await),
        }

        let buffer_slice = buffer.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |v| {
            let _ = sender.send(v);
        });

        // Waiting blocks, so it runs on its own thread while this task yields.
        let (poll_sender, poll_receiver) = futures_intrusive::channel::shared::oneshot_channel();
        let poller = context.device.clone();
        let spawned = std::thread::Builder::new().name("lazyfilter-wgpu-poll".to_string()).spawn(move || {
            let _ = poll_sender.send(poller.poll(wgpu::PollType::WaitForSubmissionIndex(submission)).map_err(|e| e.to_string()));
        });
        if let Err(e) = spawned {
            return Err(RenderError::ResourceExhausted(format!("spawning GPU poll thread: {e}")));
        }
        match poll_receiver.receive().await {
            Some(Ok(_)) => {}
            Some(Err(message)) => return Err(self.device_lost(&context, message).await),
            None => return Err(self.device_lost(&context, "GPU poll thread exited early".to_string()).await),
        }
        match receiver.receive().await {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(self.device_lost(&context, e.to_string()).await),
            None => return Err(self.device_lost(&context, "readback was never completed".to_string()).await),
        }
        if context.is_lost() {
            return Err(self.device_lost(&context, "device lost during render".to_string()).await);
        }

        let mut working = Vec::with_capacity(region.width as usize * region.height as usize * 4);
        {
            let data = buffer_slice.get_mapped_range();
            for row in data.chunks(padded_bytes_per_row as usize) {
                working.extend_from_slice(bytemuck::cast_slice::<u8, f32>(&row[..unpadded_bytes_per_row as usize]));
            }
        }
        buffer.unmap();

        let texture = in_flight.finish(output);
        Ok(RenderResult {
            pixels: Bytes::from(encode_working(&working, options.format, options.alpha)),
            region,
            format: options.format,
            alpha: options.alpha,
            texture,
        })
    }
}
