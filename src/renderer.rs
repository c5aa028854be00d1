// ============================================================================
// renderer.rs — particle-sync
// Frame orchestration: copy gated on the producer fence, buffer exchange,
// frame pacing, draw submission, and cross-adapter session management.
// ============================================================================

use std::sync::Arc;

use crate::bridge::{CrossAdapterSyncBridge, SharedHandles};
use crate::camera::CameraState;
use crate::config::RenderConfig;
use crate::copy::CopyPipeline;
use crate::device::{AdapterShared, BufferDesc, Command, Device, SharedHandle};
use crate::error::{PipelineError, PipelineResult};
use crate::exchange::BufferExchange;
use crate::fence::{Fence, WaitHandle};
use crate::frame::{Frame, FrameScheduler, FrameState, HeadlessPresenter, Presenter};
use crate::particles::{particle_bytes, ParticleSource};

/// Render stage of the particle pipeline.
///
/// Owns the local buffer exchange, the copy stage, the frame ring, and an
/// optional cross-adapter bridge. Driven from a single thread; every
/// cross-queue dependency is expressed as a fence wait on a queue.
pub struct Render<D: Device> {
    config: RenderConfig,
    device: Arc<D>,
    exchange: BufferExchange<D::Buffer>,
    copy: CopyPipeline<D>,
    scheduler: FrameScheduler<D>,
    bridge: Option<CrossAdapterSyncBridge<D>>,
    shared_render_fence: Option<SharedHandle>,
    presenter: Box<dyn Presenter<D>>,
    camera: CameraState,
    async_mode: bool,
    particle_size: f32,
    particle_intensity: f32,
    queue_extension: bool,
    frames_drawn: u64,
}

impl<D: Device> Render<D> {
    pub fn new(config: RenderConfig, device: Arc<D>) -> PipelineResult<Self> {
        config.validate()?;

        let queue_extension =
            config.features.max_performance_queue && device.capabilities().max_performance_queues;
        if config.features.max_performance_queue && !queue_extension {
            log::warn!(
                "'{}' has no max-performance queue extension, using default submission path",
                device.info().name
            );
        }

        let timeout = config.fence_timeout();
        let size = particle_bytes(config.particle_capacity);
        let make = |label: &str| {
            device.create_buffer(&BufferDesc {
                label: label.into(),
                size,
                shared: false,
            })
        };
        let exchange = BufferExchange::new([make("render_0")?, make("render_1")?]);
        let copy = CopyPipeline::new(
            device.as_ref(),
            config.particle_capacity,
            queue_extension,
            timeout,
        )?;
        let scheduler = FrameScheduler::new(
            device.as_ref(),
            config.frame_count,
            config.window.width,
            config.window.height,
            queue_extension,
            timeout,
        )?;

        log::info!(
            "Renderer ready on '{}' ({}): {} particles, {} frames in flight",
            device.info().name,
            device.info().backend,
            config.particle_capacity,
            config.frame_count
        );

        Ok(Self {
            particle_size: config.particle_size,
            particle_intensity: config.particle_intensity,
            config,
            device,
            exchange,
            copy,
            scheduler,
            bridge: None,
            shared_render_fence: None,
            presenter: Box::new(HeadlessPresenter::new()),
            camera: CameraState::default(),
            async_mode: false,
            queue_extension,
            frames_drawn: 0,
        })
    }

    pub fn with_presenter(mut self, presenter: impl Presenter<D> + 'static) -> Self {
        self.presenter = Box::new(presenter);
        self
    }

    /// Names the adapter the particle producer runs on. Shared state is then
    /// exported from it instead of from the render adapter.
    pub fn set_producer_adapter(&mut self, producer: Arc<D>) -> PipelineResult<()> {
        match CrossAdapterSyncBridge::new(producer) {
            Ok(bridge) => {
                self.bridge = Some(bridge);
                Ok(())
            }
            Err(err) => {
                log::warn!("{err}; staying in single-adapter mode");
                Err(err)
            }
        }
    }

    /// Draws one frame of `active` particles produced by `source`.
    ///
    /// `compute_fence_value` is the producer fence value marking its output
    /// complete. The copy of the first `copied` particles waits for it on the
    /// copy queue. `copied` may differ from `active`; only a copy larger than
    /// the buffers is rejected, before anything is submitted.
    ///
    /// On return `compute_fence_value` holds the render fence value after
    /// which the producer may overwrite the buffer it handed over. The
    /// returned handle completes with the frame.
    pub fn draw<S: ParticleSource<D>>(
        &mut self,
        active: u32,
        source: &S,
        compute_fence_value: &mut u64,
        copied: u32,
    ) -> PipelineResult<WaitHandle> {
        let capacity = self.config.particle_capacity;
        if copied > capacity {
            return Err(PipelineError::BufferOverrun {
                requested: copied,
                capacity,
            });
        }
        if active > capacity {
            return Err(PipelineError::InvalidParticleCount(format!(
                "{active} active particles exceed buffer capacity of {capacity}"
            )));
        }

        let render_fence = self.scheduler.fence().clone();
        let source_value = *compute_fence_value;

        let (ready_fence, ready_value, particles) =
            match self.bridge.as_mut().and_then(CrossAdapterSyncBridge::session_mut) {
                Some(session) => {
                    let dst = session.exchange.current_write_buffer().producer.clone();
                    let release = session.exchange.write_release_value();
                    let copy = session.copy.copy(
                        source.fence(),
                        source_value,
                        source.buffer(),
                        &dst,
                        Some((&session.release, release)),
                        copied,
                    )?;
                    session.exchange.advance();
                    let read = session.exchange.current_read_buffer().consumer.clone();
                    (session.fence.clone(), copy.value(), read)
                }
                None => {
                    let dst = self.exchange.current_write_buffer().clone();
                    let release = self.exchange.write_release_value();
                    let copy = self.copy.copy(
                        source.fence(),
                        source_value,
                        source.buffer(),
                        &dst,
                        Some((&render_fence, release)),
                        copied,
                    )?;
                    self.exchange.advance();
                    let read = self.exchange.current_read_buffer().clone();
                    (copy.fence().clone(), copy.value(), read)
                }
            };

        let frame_index = self.scheduler.begin_frame()?;
        self.scheduler.queue_wait(&ready_fence, ready_value)?;

        let constants = self.camera.constants(
            self.config.aspect_ratio(),
            self.particle_size,
            self.particle_intensity,
        );
        let target = self.scheduler.current_target()?.clone();
        self.scheduler.record(Command::DrawParticles {
            particles,
            count: active,
            target,
            constants,
        })?;
        let handle = self.scheduler.submit()?;
        self.mark_read(handle.value());
        self.scheduler.present(self.presenter.as_mut())?;
        self.frames_drawn += 1;

        log::debug!(
            "frame {} (slot {frame_index}): {active} drawn, {copied} copied, producer {source_value}, render {}",
            self.frames_drawn,
            handle.value()
        );

        *compute_fence_value = handle.value();
        if !self.async_mode {
            handle.wait(self.config.fence_timeout())?;
        }
        Ok(handle)
    }

    fn mark_read(&mut self, render_value: u64) {
        match self.bridge.as_mut().and_then(CrossAdapterSyncBridge::session_mut) {
            Some(session) => session.exchange.mark_read(render_value),
            None => self.exchange.mark_read(render_value),
        }
    }

    /// Creates the shared buffer pair and fence on the producer adapter (the
    /// render adapter if none was set) and returns their handles.
    pub fn export_shared_state(&mut self) -> PipelineResult<SharedHandles> {
        if self.bridge.is_none() {
            self.set_producer_adapter(Arc::clone(&self.device))?;
        }
        let Some(bridge) = self.bridge.as_mut() else {
            return Err(PipelineError::CapabilityUnavailable("no producer adapter".into()));
        };
        bridge.export_shared_state(self.config.particle_capacity)
    }

    /// Shareable handle of the render fence, exported on first use. The
    /// producing adapter waits on it before reusing a buffer a frame reads.
    pub fn shared_fence_handle(&mut self) -> PipelineResult<SharedHandle> {
        if let Some(handle) = self.shared_render_fence {
            return Ok(handle);
        }
        let handle = self.device.export_fence(self.scheduler.fence())?;
        self.shared_render_fence = Some(handle);
        Ok(handle)
    }

    /// Opens `handles` on the render adapter and switches draws to the shared
    /// pair. The handles may come from another renderer or another process;
    /// copies then run on the producer adapter if one was set, otherwise on
    /// the render adapter. On failure the renderer stays in single-adapter
    /// mode and keeps drawing.
    pub fn adopt_shared_state(&mut self, handles: SharedHandles) -> PipelineResult<()> {
        let result = self.try_adopt(handles);
        if let Err(err) = &result {
            log::warn!("Could not adopt shared state: {err}; staying in single-adapter mode");
        }
        result
    }

    fn try_adopt(&mut self, handles: SharedHandles) -> PipelineResult<()> {
        if !self.device.capabilities().shared_handles {
            return Err(PipelineError::CapabilityUnavailable(format!(
                "'{}' cannot open shared handles",
                self.device.info().name
            )));
        }
        if handles.capacity < self.config.particle_capacity {
            return Err(PipelineError::Config(format!(
                "shared buffers hold {} particles, renderer needs {}",
                handles.capacity, self.config.particle_capacity
            )));
        }
        let render_fence = self.shared_fence_handle()?;

        self.scheduler.drain()?;
        self.copy.drain()?;
        if self.bridge.is_none() {
            self.bridge = Some(CrossAdapterSyncBridge::new(Arc::clone(&self.device))?);
        }
        let Some(bridge) = self.bridge.as_mut() else {
            return Err(PipelineError::CapabilityUnavailable("no producer adapter".into()));
        };
        if let Some(session) = bridge.session() {
            session.copy.drain()?;
        }
        bridge.import_shared_state(
            self.device.as_ref(),
            handles,
            render_fence,
            self.queue_extension,
            self.config.fence_timeout(),
        )
    }

    /// When on, `draw` returns without waiting for the frame to finish.
    pub fn set_async_mode(&mut self, enabled: bool) {
        self.async_mode = enabled;
    }

    pub fn is_async(&self) -> bool {
        self.async_mode
    }

    /// Blocks until every queue the renderer submits to has drained.
    pub fn wait_for_idle(&self) -> PipelineResult<()> {
        self.scheduler.drain()?;
        self.copy.drain()?;
        if let Some(session) = self.bridge.as_ref().and_then(CrossAdapterSyncBridge::session) {
            session.copy.drain()?;
            session.fence.wait_until(session.copy.fence_value(), self.config.fence_timeout())?;
        }
        self.device.wait_for_idle()
    }

    pub fn set_particle_size(&mut self, size: f32) {
        self.particle_size = size;
    }

    pub fn set_particle_intensity(&mut self, intensity: f32) {
        self.particle_intensity = intensity;
    }

    pub fn camera_mut(&mut self) -> &mut CameraState {
        &mut self.camera
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn num_frames(&self) -> usize {
        self.scheduler.frame_count()
    }

    pub fn render_fence(&self) -> &Fence {
        self.scheduler.fence()
    }

    /// Local render buffer pair. Draws read `buffers()[buffer_index()]`; a
    /// producer on the render adapter may fill the other one directly.
    pub fn buffers(&self) -> &[D::Buffer; 2] {
        self.exchange.buffers()
    }

    /// Producer-side views of the shared pair this renderer exported.
    pub fn exported_buffers(&self) -> Option<&[D::Buffer; 2]> {
        self.bridge.as_ref().and_then(CrossAdapterSyncBridge::exported_buffers)
    }

    /// Toggle index of the exchange draws currently use.
    pub fn buffer_index(&self) -> usize {
        match self.bridge.as_ref().and_then(CrossAdapterSyncBridge::session) {
            Some(session) => session.exchange.index(),
            None => self.exchange.index(),
        }
    }

    /// Slot the next draw records into.
    pub fn frame_index(&self) -> usize {
        self.scheduler.next_index()
    }

    pub fn frame_state(&self, index: usize) -> Option<FrameState> {
        self.scheduler.frame_state(index)
    }

    /// Whether the next draw would block waiting for slot `index`.
    pub fn would_block(&self, index: usize) -> bool {
        self.scheduler.would_block(index)
    }

    pub fn render_target(&self, index: usize) -> Option<&D::RenderTarget> {
        self.scheduler.frame(index).map(Frame::target)
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    /// Whether queues were created through the max-performance extension.
    pub fn supports_queue_extension(&self) -> bool {
        self.queue_extension
    }

    pub fn is_cross_adapter(&self) -> bool {
        self.bridge.as_ref().is_some_and(CrossAdapterSyncBridge::is_active)
    }
}

impl<D: Device> AdapterShared for Render<D> {
    type Device = D;

    fn device(&self) -> &Arc<D> {
        &self.device
    }

    fn wait_for_idle(&self) -> PipelineResult<()> {
        Render::wait_for_idle(self)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::device::{Capabilities, CommandQueue, GpuBuffer, QueueDesc, QueueKind};
    use crate::error::ErrorClass;
    use crate::particles::{Particle, ParticleSimulation};
    use crate::soft::{SoftBuffer, SoftDevice, SoftPlatform, SoftQueue};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Producer with fixed contents whose fence the test advances by hand.
    struct StaticSource {
        queue: SoftQueue,
        fence: Fence,
        buffer: SoftBuffer,
    }

    impl StaticSource {
        fn new(device: &SoftDevice, capacity: u32) -> Self {
            let queue = device
                .create_queue(&QueueDesc {
                    label: "producer_queue".into(),
                    kind: QueueKind::Compute,
                    max_performance: false,
                    fence_timeout: TIMEOUT,
                })
                .unwrap();
            let buffer = device
                .create_buffer(&BufferDesc {
                    label: "producer".into(),
                    size: particle_bytes(capacity),
                    shared: false,
                })
                .unwrap();
            let particles: Vec<Particle> = (0..capacity)
                .map(|i| Particle {
                    position: [i as f32, 0.0, 0.0, 1.0],
                })
                .collect();
            queue
                .submit(vec![Command::Upload {
                    dst: buffer.clone(),
                    offset: 0,
                    data: bytemuck::cast_slice(&particles).to_vec(),
                }])
                .unwrap();
            Self {
                queue,
                fence: device.create_fence("producer_fence"),
                buffer,
            }
        }

        fn publish(&self, value: u64) {
            self.fence.signal(&self.queue, value).unwrap();
        }
    }

    /// Sum of the first `count` particle x positions a `StaticSource` holds.
    fn checksum(count: u32) -> f64 {
        (0..count).map(f64::from).sum()
    }

    impl ParticleSource<SoftDevice> for StaticSource {
        fn fence(&self) -> &Fence {
            &self.fence
        }

        fn buffer(&self) -> &SoftBuffer {
            &self.buffer
        }
    }

    fn config(capacity: u32) -> RenderConfig {
        RenderConfig {
            particle_capacity: capacity,
            frame_count: 2,
            ..RenderConfig::default()
        }
    }

    fn legacy() -> Capabilities {
        Capabilities {
            shared_handles: false,
            max_performance_queues: false,
        }
    }

    #[test]
    fn three_draws_toggle_buffers_and_rotate_frames() {
        let platform = SoftPlatform::new();
        let device = Arc::new(SoftDevice::new(&platform, "adapter"));
        let presenter = HeadlessPresenter::new();
        let mut render = Render::new(config(1000), Arc::clone(&device))
            .unwrap()
            .with_presenter(presenter.clone());
        let source = StaticSource::new(&device, 1000);

        let mut handles = Vec::new();
        let mut toggles = Vec::new();
        let mut frames = Vec::new();
        for value in [10, 11, 12] {
            source.publish(value);
            frames.push(render.frame_index());
            let mut fence_value = value;
            let handle = render.draw(500, &source, &mut fence_value, 500).unwrap();
            assert_eq!(fence_value, handle.value());
            toggles.push(render.buffer_index());
            handles.push(handle);
        }

        let values: Vec<u64> = handles.iter().map(WaitHandle::value).collect();
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(toggles, [1, 0, 1]);
        assert_eq!(frames, [0, 1, 0]);
        assert_eq!(presenter.recent(), [0, 1, 0]);

        crate::fence::wait_all(&handles, TIMEOUT).unwrap();
        let stats = render.render_target(0).unwrap().stats();
        assert_eq!(stats.draws, 2);
        assert_eq!(stats.last_count, 500);
    }

    #[test]
    fn oversized_copy_fails_without_side_effects() {
        let platform = SoftPlatform::new();
        let device = Arc::new(SoftDevice::new(&platform, "adapter"));
        let mut render = Render::new(config(1000), Arc::clone(&device)).unwrap();
        let source = StaticSource::new(&device, 1000);
        source.publish(10);
        device.wait_for_idle().unwrap();

        let submissions = device.submission_count();
        let mut fence_value = 10;
        let err = render.draw(1000, &source, &mut fence_value, 1500).unwrap_err();

        assert!(matches!(
            err,
            PipelineError::BufferOverrun {
                requested: 1500,
                capacity: 1000
            }
        ));
        assert!(!err.is_fatal());
        assert_eq!(fence_value, 10);
        assert_eq!(device.submission_count(), submissions);
        assert_eq!(render.buffer_index(), 0);
        assert_eq!(render.frame_index(), 0);
        assert_eq!(render.render_fence().requested_value(), 0);
    }

    #[test]
    fn copy_beyond_the_source_buffer_is_a_precondition_error() {
        let platform = SoftPlatform::new();
        let device = Arc::new(SoftDevice::new(&platform, "adapter"));
        let mut render = Render::new(config(1000), Arc::clone(&device)).unwrap();
        let source = StaticSource::new(&device, 100);
        source.publish(1);
        device.wait_for_idle().unwrap();

        let submissions = device.submission_count();
        let mut fence_value = 1;
        let err = render.draw(100, &source, &mut fence_value, 500).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::BufferOverrun {
                requested: 500,
                capacity: 100
            }
        ));
        assert_eq!(err.class(), ErrorClass::Precondition);
        assert_eq!(fence_value, 1);
        assert_eq!(device.submission_count(), submissions);
        assert_eq!(render.buffer_index(), 0);
        assert_eq!(render.frame_index(), 0);

        render.draw(100, &source, &mut fence_value, 100).unwrap();
        assert_eq!(render.frames_drawn(), 1);
    }

    #[test]
    fn too_many_active_particles_is_rejected() {
        let platform = SoftPlatform::new();
        let device = Arc::new(SoftDevice::new(&platform, "adapter"));
        let mut render = Render::new(config(100), Arc::clone(&device)).unwrap();
        let source = StaticSource::new(&device, 100);
        let mut fence_value = 0;
        assert!(matches!(
            render.draw(101, &source, &mut fence_value, 10),
            Err(PipelineError::InvalidParticleCount(_))
        ));
    }

    #[test]
    fn unsupported_platform_falls_back_to_single_adapter() {
        let platform = SoftPlatform::new();
        let device = Arc::new(SoftDevice::new(&platform, "legacy").with_capabilities(legacy()));
        let mut render = Render::new(config(1000), Arc::clone(&device)).unwrap();

        let export = render.export_shared_state().unwrap_err();
        assert!(matches!(export, PipelineError::CapabilityUnavailable(_)));

        let handles = SharedHandles {
            buffers: [crate::device::SharedHandle(1), crate::device::SharedHandle(2)],
            fence: crate::device::SharedHandle(3),
            capacity: 1000,
        };
        let adopt = render.adopt_shared_state(handles).unwrap_err();
        assert!(matches!(adopt, PipelineError::CapabilityUnavailable(_)));
        assert!(!render.is_cross_adapter());

        let source = StaticSource::new(&device, 1000);
        for value in 1..=3 {
            source.publish(value);
            let mut fence_value = value;
            render.draw(1000, &source, &mut fence_value, 1000).unwrap();
        }
        assert_eq!(render.frames_drawn(), 3);
    }

    #[test]
    fn cross_adapter_frames_read_producer_data() {
        let platform = SoftPlatform::new();
        let producer = Arc::new(SoftDevice::new(&platform, "compute_adapter"));
        let consumer = Arc::new(SoftDevice::new(&platform, "render_adapter"));
        let mut render = Render::new(config(256), Arc::clone(&consumer)).unwrap();

        render.set_producer_adapter(Arc::clone(&producer)).unwrap();
        let handles = render.export_shared_state().unwrap();
        // The consumer may live in another process.
        let text = serde_json::to_string(&handles).unwrap();
        render.adopt_shared_state(serde_json::from_str(&text).unwrap()).unwrap();
        assert!(render.is_cross_adapter());

        let source = StaticSource::new(&producer, 256);
        for (value, active) in [(1, 256), (2, 128), (3, 64)] {
            source.publish(value);
            let mut fence_value = value;
            render.draw(active, &source, &mut fence_value, 256).unwrap();
        }
        render.wait_for_idle().unwrap();

        let stats = render.render_target(0).unwrap().stats();
        assert_eq!(stats.last_count, 64);
        assert_eq!(stats.last_checksum, checksum(64));
        assert_eq!(render.buffer_index(), 1);
    }

    #[test]
    fn separate_renderer_adopts_exported_state() {
        let platform = SoftPlatform::new();
        let producer = Arc::new(SoftDevice::new(&platform, "compute_adapter"));
        let consumer = Arc::new(SoftDevice::new(&platform, "render_adapter"));

        let mut exporter = Render::new(config(256), Arc::clone(&producer)).unwrap();
        let text = serde_json::to_string(&exporter.export_shared_state().unwrap()).unwrap();

        let mut render = Render::new(config(256), Arc::clone(&consumer)).unwrap();
        render.adopt_shared_state(serde_json::from_str(&text).unwrap()).unwrap();
        assert!(render.is_cross_adapter());
        assert!(!exporter.is_cross_adapter());

        let source = StaticSource::new(&consumer, 256);
        for value in 1..=2 {
            source.publish(value);
            let mut fence_value = value;
            render.draw(128, &source, &mut fence_value, 256).unwrap();
        }
        render.wait_for_idle().unwrap();

        assert_eq!(render.render_target(1).unwrap().stats().last_checksum, checksum(128));
        // Both copies landed in memory the exporter owns.
        let exported = exporter.exported_buffers().unwrap();
        assert_eq!(exported[0].read(), source.buffer.read());
        assert_eq!(exported[1].read(), source.buffer.read());
    }

    #[test]
    fn render_fence_is_shared_through_a_handle() {
        let platform = SoftPlatform::new();
        let producer = SoftDevice::new(&platform, "compute_adapter");
        let consumer = Arc::new(SoftDevice::new(&platform, "render_adapter"));
        let mut render = Render::new(config(64), consumer).unwrap();

        let handle = render.shared_fence_handle().unwrap();
        assert_eq!(render.shared_fence_handle().unwrap(), handle);
        let seen = producer.open_shared_fence(handle).unwrap();
        assert!(seen.same_as(render.render_fence()));

        assert!(render.exported_buffers().is_none());
        for buffer in render.buffers() {
            assert_eq!(buffer.size(), particle_bytes(64));
        }
    }

    #[test]
    fn async_mode_returns_before_the_frame_completes() {
        let platform = SoftPlatform::new();
        let device =
            Arc::new(SoftDevice::new(&platform, "adapter").with_latency(Duration::from_millis(50)));
        let mut render = Render::new(config(64), Arc::clone(&device)).unwrap();
        render.set_async_mode(true);
        let source = StaticSource::new(&device, 64);

        source.publish(1);
        let mut fence_value = 1;
        let handle = render.draw(64, &source, &mut fence_value, 64).unwrap();
        assert!(!handle.is_complete());
        handle.wait(TIMEOUT).unwrap();

        render.set_async_mode(false);
        source.publish(2);
        let mut fence_value = 2;
        let handle = render.draw(64, &source, &mut fence_value, 64).unwrap();
        assert!(handle.is_complete());
    }

    #[test]
    fn simulation_feeds_the_renderer_in_a_loop() {
        let platform = SoftPlatform::new();
        let device = Arc::new(SoftDevice::new(&platform, "adapter"));
        let mut render = Render::new(config(128), Arc::clone(&device)).unwrap();
        render.set_async_mode(true);
        let render_fence = render.render_fence().clone();
        let mut sim = ParticleSimulation::new(device.as_ref(), 128, TIMEOUT).unwrap();

        let mut release = None;
        let mut last = 0;
        for _ in 0..8 {
            let produced = sim.step(release.map(|value| (&render_fence, value))).unwrap();
            let mut fence_value = produced;
            let handle = render.draw(128, &sim, &mut fence_value, 128).unwrap();
            assert!(handle.value() > last);
            last = handle.value();
            release = Some(fence_value);
        }
        render.wait_for_idle().unwrap();
        assert_eq!(render.frames_drawn(), 8);
        assert_eq!(render.render_target(1).unwrap().stats().draws, 4);
    }

    #[test]
    fn device_loss_is_fatal_at_the_draw_boundary() {
        let platform = SoftPlatform::new();
        let device = Arc::new(SoftDevice::new(&platform, "adapter"));
        let mut render = Render::new(config(64), Arc::clone(&device)).unwrap();
        let source = StaticSource::new(&device, 64);

        device.lose();
        let mut fence_value = 1;
        let err = render.draw(64, &source, &mut fence_value, 64).unwrap_err();
        assert!(err.is_fatal());
        assert!(AdapterShared::wait_for_idle(&render).is_err());
    }

    #[test]
    fn queue_extension_is_reported_only_when_available() {
        let platform = SoftPlatform::new();
        let mut wanted = config(64);
        wanted.features.max_performance_queue = true;

        let capable = Arc::new(SoftDevice::new(&platform, "capable"));
        assert!(Render::new(wanted.clone(), capable).unwrap().supports_queue_extension());

        let plain = Arc::new(SoftDevice::new(&platform, "plain").with_capabilities(legacy()));
        let render = Render::new(wanted, plain).unwrap();
        assert!(!render.supports_queue_extension());
        assert_eq!(render.num_frames(), 2);
    }
}
