//! wgpu device and queue wrapped as a [`Backend`]

use crate::backend::{Backend, PipelineRequest, TextureKey};
use crate::error::RenderError;
use crate::executor::ExecutorConfig;
use crate::plan::DispatchHeader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Texture usages of every pooled texture
pub const TEXTURE_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::STORAGE_BINDING
    .union(wgpu::TextureUsages::TEXTURE_BINDING)
    .union(wgpu::TextureUsages::COPY_DST)
    .union(wgpu::TextureUsages::COPY_SRC);

const ENTRY_POINT: &str = "main";

/// A filter pipeline together with the bind group layout it was built with
#[derive(Debug)]
pub struct ComputeKernel {
    pub pipeline: wgpu::ComputePipeline,
    pub layout: wgpu::BindGroupLayout,
}

/// An initialized device and queue
#[derive(Debug)]
pub struct GpuContext {
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    generation: u64,
    lost: Arc<AtomicBool>,
    /// Held for the length of every push/pop bracket; the scope stack is per device
    error_scopes: Mutex<()>,
}

impl GpuContext {
    /// Requests an adapter and device
    ///
    /// # Arguments
    /// * `config` - Adapter selection and device label
    /// * `generation` - Identifies this device among all devices the executor has created
    pub async fn new(config: &ExecutorConfig, generation: u64) -> Result<Self, RenderError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: config.power_preference,
                compatible_surface: None,
                force_fallback_adapter: config.force_fallback_adapter,
            })
            .await
            .map_err(|e| RenderError::DeviceUnavailable(e.to_string()))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some(&config.label),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
                memory_hints: wgpu::MemoryHints::default(),
                trace: Default::default(),
            })
            .await
            .map_err(|e| RenderError::DeviceUnavailable(e.to_string()))?;

        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            tracing::warn!(?reason, %message, generation, "GPU device lost");
            flag.store(true, Ordering::SeqCst);
        });
        let flag = lost.clone();
        device.on_uncaptured_error(Box::new(move |error| {
            tracing::error!(%error, generation, "uncaptured GPU error; treating the device as lost");
            flag.store(true, Ordering::SeqCst);
        }));

        let adapter_info = adapter.get_info();
        tracing::info!(adapter = %adapter_info.name, backend = ?adapter_info.backend, generation, "initialized GPU device");

        Ok(Self {
            device,
            queue,
            adapter_info,
            generation,
            lost,
            error_scopes: Mutex::new(()),
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Whether the device-lost callback has fired
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_lost(&self) {
        self.lost.store(true, Ordering::SeqCst);
    }

    /// Runs `f` inside validation and out-of-memory error scopes
    ///
    /// Returns the first error either scope caught. Brackets from concurrent callers
    /// are serialized so no caller pops a scope another one pushed.
    pub(crate) fn scoped<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> (T, Option<wgpu::Error>) {
        let _bracket = self.error_scopes.lock().unwrap_or_else(|e| e.into_inner());
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        // Native error scopes resolve as soon as they are popped.
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        (value, validation.or(out_of_memory))
    }

    fn bind_group_layout_entries(inputs: usize) -> Vec<wgpu::BindGroupLayoutEntry> {
        let uniform = |binding: u32, size: Option<u64>| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: size.and_then(wgpu::BufferSize::new),
            },
            count: None,
        };

        let mut entries = vec![
            uniform(0, Some(std::mem::size_of::<DispatchHeader>() as u64)),
            // Parameter blocks differ per filter; sized at bind time.
            uniform(1, None),
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::StorageTexture {
                    access: wgpu::StorageTextureAccess::WriteOnly,
                    format: wgpu::TextureFormat::Rgba32Float,
                    view_dimension: wgpu::TextureViewDimension::D2,
                },
                count: None,
            },
        ];

        for index in 0..inputs {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: 3 + index as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
        }

        entries
    }
}

impl Backend for GpuContext {
    type Texture = wgpu::Texture;
    type Pipeline = ComputeKernel;

    fn generation(&self) -> u64 {
        self.generation
    }

    fn max_texture_dimension(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    fn create_texture(&self, key: &TextureKey) -> Result<wgpu::Texture, RenderError> {
        let max = self.max_texture_dimension();
        if key.width > max || key.height > max {
            return Err(RenderError::ResourceExhausted(format!("texture {key} exceeds the device limit of {max}")));
        }

        let (texture, error) = self.scoped(|device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&format!("Pooled Texture {key}")),
                size: wgpu::Extent3d {
                    width: key.width,
                    height: key.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: key.format.to_wgpu(),
                usage: TEXTURE_USAGE,
                view_formats: &[],
            })
        });
        match error {
            None => Ok(texture),
            Some(error @ wgpu::Error::OutOfMemory { .. }) => Err(RenderError::ResourceExhausted(format!("allocating texture {key}: {error}"))),
            // Keys are validated up front, so a rejected allocation means the device is gone.
            Some(error) => {
                self.mark_lost();
                Err(RenderError::DeviceLost(format!("allocating texture {key}: {error}")))
            }
        }
    }

    async fn create_pipeline<'a>(&'a self, request: PipelineRequest<'a>) -> Result<ComputeKernel, RenderError> {
        let label = request.filter.id;
        let failed = |message: String| RenderError::CompilationFailed {
            filter: label.to_string(),
            message,
        };

        let constants = request.constants.iter().map(|(name, value)| (name.as_str(), *value)).collect::<Vec<_>>();
        let ((pipeline, layout), error) = self.scoped(|device| {
            let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(request.shader.wgsl.clone()),
            });

            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &Self::bind_group_layout_entries(request.filter.inputs.len()),
            });

            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });

            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &shader_module,
                entry_point: Some(ENTRY_POINT),
                compilation_options: wgpu::PipelineCompilationOptions {
                    constants: &constants,
                    ..Default::default()
                },
                cache: None,
            });
            (pipeline, layout)
        });

        match error {
            None => {}
            Some(error @ wgpu::Error::OutOfMemory { .. }) => return Err(RenderError::ResourceExhausted(format!("compiling '{label}': {error}"))),
            Some(error) => return Err(failed(error.to_string())),
        }
        tracing::debug!(filter = label, constants = ?request.constants, "created compute pipeline");
        Ok(ComputeKernel { pipeline, layout })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Option<GpuContext> {
        match pollster::block_on(GpuContext::new(&ExecutorConfig::default(), 1)) {
            Ok(context) => Some(context),
            Err(e) => {
                eprintln!("skipping GPU test: {e}");
                None
            }
        }
    }

    #[test]
    fn test_concurrent_scopes_keep_their_own_errors() {
        let Some(context) = context() else { return };

        std::thread::scope(|s| {
            for worker in 0..4 {
                let context = &context;
                s.spawn(move || {
                    let broken = worker % 2 == 0;
                    let source = if broken { "fn main( {" } else { "@compute @workgroup_size(1) fn main() {}" };
                    for _ in 0..25 {
                        let (_module, error) = context.scoped(|device| {
                            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                                label: Some("scoped"),
                                source: wgpu::ShaderSource::Wgsl(source.into()),
                            })
                        });
                        assert_eq!(error.is_some(), broken, "worker {worker}: {error:?}");
                    }
                });
            }
        });
        assert!(!context.is_lost());
    }

    #[test]
    fn test_oversized_texture_is_resource_exhausted() {
        let Some(context) = context() else { return };
        let side = context.max_texture_dimension() + 1;

        let result = context.create_texture(&TextureKey::new(side, 1, crate::format::PixelFormat::WORKING));
        assert!(matches!(result, Err(RenderError::ResourceExhausted(_))), "{result:?}");
        assert!(!context.is_lost());
    }
}
