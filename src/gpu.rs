// ============================================================================
// gpu.rs — particle-sync
// wgpu adapter. Logical queues share the device's single wgpu queue; fences
// advance from submitted-work-done callbacks while the device is polled.
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::camera::FrameConstants;
use crate::config::AdapterSelection;
use crate::device::{
    AdapterInfo, BufferDesc, Capabilities, Command, CommandQueue, Device, GpuBuffer, QueueDesc,
    QueueKind, SharedHandle,
};
use crate::error::{PipelineError, PipelineResult};
use crate::fence::{Fence, WeakFence};
use crate::pipeline::{create_particle_pipeline, ParticlePipeline, SPRITE_VERTICES, TARGET_FORMAT};

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

struct GpuState {
    name: String,
    lost: AtomicBool,
    fences: Mutex<Vec<WeakFence>>,
}

impl GpuState {
    fn lose(&self, reason: &str) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            log::error!("{}: device lost: {reason}", self.name);
        }
        for fence in self.live_fences() {
            fence.mark_lost();
        }
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn owns(&self, fence: &Fence) -> bool {
        self.live_fences().iter().any(|own| own.same_as(fence))
    }

    fn live_fences(&self) -> Vec<Fence> {
        self.fences.lock().iter().filter_map(WeakFence::upgrade).collect()
    }
}

// ======================== Resources ========================

#[derive(Clone)]
pub struct WgpuBuffer {
    label: Arc<str>,
    size: u64,
    buffer: Arc<wgpu::Buffer>,
}

impl WgpuBuffer {
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

impl GpuBuffer for WgpuBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Offscreen color target a frame slot draws into.
#[derive(Clone)]
pub struct WgpuTarget {
    texture: Arc<wgpu::Texture>,
    view: Arc<wgpu::TextureView>,
}

impl WgpuTarget {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }
}

// ======================== Device ========================

pub struct WgpuDevice {
    info: AdapterInfo,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pipeline: Arc<ParticlePipeline>,
    state: Arc<GpuState>,
}

impl WgpuDevice {
    /// Opens the adapter named by `selection`.
    pub fn open(selection: &AdapterSelection) -> PipelineResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = select_adapter(&instance, selection)?;
        let adapter_info = adapter.get_info();
        log::info!("GPU: {} ({:?})", adapter_info.name, adapter_info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("particle_sync_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|e| PipelineError::NoSuitableAdapter(format!("failed to create device: {e}")))?;

        let state = Arc::new(GpuState {
            name: adapter_info.name.clone(),
            lost: AtomicBool::new(false),
            fences: Mutex::new(Vec::new()),
        });
        {
            let state = Arc::clone(&state);
            device.on_uncaptured_error(Box::new(move |err: wgpu::Error| {
                state.lose(&err.to_string());
            }));
        }
        {
            let state = Arc::clone(&state);
            device.set_device_lost_callback(move |reason, message| {
                state.lose(&format!("{reason:?}: {message}"));
            });
        }

        let pipeline = Arc::new(create_particle_pipeline(&device, TARGET_FORMAT));

        Ok(Self {
            info: AdapterInfo {
                name: adapter_info.name.clone(),
                backend: format!("{:?}", adapter_info.backend),
                discrete: adapter_info.device_type == wgpu::DeviceType::DiscreteGpu,
            },
            device: Arc::new(device),
            queue: Arc::new(queue),
            pipeline,
            state,
        })
    }

    pub fn raw(&self) -> &wgpu::Device {
        &self.device
    }

    fn unavailable(&self, what: &str) -> PipelineError {
        PipelineError::CapabilityUnavailable(format!(
            "{what} on '{}': wgpu exposes no shared handles",
            self.info.name
        ))
    }
}

fn select_adapter(
    instance: &wgpu::Instance,
    selection: &AdapterSelection,
) -> PipelineResult<wgpu::Adapter> {
    let request = |power_preference: wgpu::PowerPreference| {
        pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
    };
    let adapter = match selection {
        AdapterSelection::HighPerformance => request(wgpu::PowerPreference::HighPerformance),
        AdapterSelection::LowPower => request(wgpu::PowerPreference::LowPower),
        AdapterSelection::Index(index) => instance
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .nth(*index),
        AdapterSelection::Name(name) => instance
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .find(|adapter| adapter.get_info().name.contains(name.as_str())),
    };
    adapter.ok_or_else(|| {
        PipelineError::NoSuitableAdapter(format!("no adapter matches {selection:?}"))
    })
}

impl Device for WgpuDevice {
    type Buffer = WgpuBuffer;
    type RenderTarget = WgpuTarget;
    type Queue = WgpuQueue;

    fn info(&self) -> &AdapterInfo {
        &self.info
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn create_queue(&self, desc: &QueueDesc) -> PipelineResult<WgpuQueue> {
        Ok(WgpuQueue {
            label: desc.label.clone(),
            kind: desc.kind,
            device: Arc::clone(&self.device),
            queue: Arc::clone(&self.queue),
            pipeline: Arc::clone(&self.pipeline),
            state: Arc::clone(&self.state),
            timeout: desc.fence_timeout,
        })
    }

    fn create_fence(&self, label: &str) -> Fence {
        let device = Arc::downgrade(&self.device);
        let fence = Fence::with_progress(label, move || {
            if let Some(device) = device.upgrade() {
                let _ = device.poll(wgpu::Maintain::Poll);
            }
        });
        if self.state.is_lost() {
            fence.mark_lost();
        }
        let mut fences = self.state.fences.lock();
        fences.retain(WeakFence::is_alive);
        fences.push(fence.downgrade());
        drop(fences);
        fence
    }

    fn create_buffer(&self, desc: &BufferDesc) -> PipelineResult<WgpuBuffer> {
        if desc.shared {
            return Err(self.unavailable("shared buffer"));
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.label),
            size: desc.size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(WgpuBuffer {
            label: desc.label.as_str().into(),
            size: desc.size,
            buffer: Arc::new(buffer),
        })
    }

    fn create_render_target(
        &self,
        label: &str,
        width: u32,
        height: u32,
    ) -> PipelineResult<WgpuTarget> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(WgpuTarget {
            texture: Arc::new(texture),
            view: Arc::new(view),
        })
    }

    fn export_buffer(&self, _buffer: &WgpuBuffer) -> PipelineResult<SharedHandle> {
        Err(self.unavailable("buffer export"))
    }

    fn open_shared_buffer(&self, _handle: SharedHandle) -> PipelineResult<WgpuBuffer> {
        Err(self.unavailable("buffer import"))
    }

    fn export_fence(&self, _fence: &Fence) -> PipelineResult<SharedHandle> {
        Err(self.unavailable("fence export"))
    }

    fn open_shared_fence(&self, _handle: SharedHandle) -> PipelineResult<Fence> {
        Err(self.unavailable("fence import"))
    }

    fn wait_for_idle(&self) -> PipelineResult<()> {
        let _ = self.device.poll(wgpu::Maintain::Wait);
        for fence in self.state.live_fences() {
            fence.wait_until(fence.requested_value(), IDLE_TIMEOUT)?;
        }
        Ok(())
    }
}

// ======================== Queue ========================

/// Logical queue over the device's wgpu queue.
pub struct WgpuQueue {
    label: String,
    kind: QueueKind,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pipeline: Arc<ParticlePipeline>,
    state: Arc<GpuState>,
    timeout: Duration,
}

impl WgpuQueue {
    fn check_alive(&self) -> PipelineResult<()> {
        if self.state.is_lost() {
            return Err(PipelineError::Submission {
                queue: self.label.clone(),
                reason: "device lost".into(),
            });
        }
        Ok(())
    }

    fn encode_draw(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        particles: &WgpuBuffer,
        count: u32,
        target: &WgpuTarget,
        constants: &FrameConstants,
    ) {
        let bind_group = self.pipeline.bind_group(&self.device, constants, particles.raw());
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("particles_pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &target.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        if count > 0 {
            pass.set_pipeline(&self.pipeline.render_pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..SPRITE_VERTICES, 0..count);
        }
    }
}

impl CommandQueue for WgpuQueue {
    type Device = WgpuDevice;

    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn submit(&self, commands: Vec<Command<WgpuDevice>>) -> PipelineResult<()> {
        self.check_alive()?;
        for command in &commands {
            command.validate(&self.label)?;
        }

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(&self.label),
        });
        for command in &commands {
            match command {
                Command::CopyBuffer { src, dst, size } => {
                    encoder.copy_buffer_to_buffer(src.raw(), 0, dst.raw(), 0, *size);
                }
                Command::Upload { dst, offset, data } => {
                    self.queue.write_buffer(dst.raw(), *offset, data);
                }
                Command::DrawParticles {
                    particles,
                    count,
                    target,
                    constants,
                } => self.encode_draw(&mut encoder, particles, *count, target, constants),
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn signal(&self, fence: &Fence, value: u64) -> PipelineResult<()> {
        self.check_alive()?;
        let fence = fence.clone();
        self.queue.on_submitted_work_done(move || fence.complete(value));
        Ok(())
    }

    fn wait(&self, fence: &Fence, value: u64) -> PipelineResult<()> {
        self.check_alive()?;
        // Work signaled on this device is already ahead of us in the single
        // wgpu queue. Anything else has to be waited for on the host.
        if self.state.owns(fence) && fence.requested_value() >= value {
            return Ok(());
        }
        log::trace!("{}: host wait on {} for {value}", self.label, fence.label());
        fence.wait_until(value, self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wgpu_adapters_never_share_handles() {
        // Machines without a usable adapter have nothing to check.
        let Ok(device) = WgpuDevice::open(&AdapterSelection::HighPerformance) else {
            return;
        };
        assert!(!device.capabilities().shared_handles);
        let fence = device.create_fence("probe");
        assert!(matches!(
            device.export_fence(&fence),
            Err(PipelineError::CapabilityUnavailable(_))
        ));
        device.wait_for_idle().unwrap();
    }
}
