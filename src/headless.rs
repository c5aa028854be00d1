// ============================================================================
// headless.rs — particle-sync
// Headless runner: drives the producer and renderer for a fixed number of
// frames and writes a JSON run report.
// ============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use serde::Serialize;

use crate::config::RenderConfig;
use crate::device::Device;
use crate::error::{ErrorClass, PipelineResult};
use crate::gpu::WgpuDevice;
use crate::particles::ParticleSimulation;
use crate::renderer::Render;
use crate::soft::{SoftDevice, SoftPlatform};

#[derive(Clone, Debug)]
pub struct HeadlessConfig {
    pub frames: u32,
    /// Particles drawn per frame. Defaults to the full capacity.
    pub particles: Option<u32>,
    /// Particles copied per frame. Defaults to the drawn count.
    pub copied: Option<u32>,
    pub cross_adapter: bool,
    pub async_mode: bool,
    pub progress_interval: u32,
    /// Per-submission latency of the software adapter.
    pub latency: Duration,
    pub report_path: Option<PathBuf>,
    pub render: RenderConfig,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            frames: 1_000,
            particles: None,
            copied: None,
            cross_adapter: false,
            async_mode: true,
            progress_interval: 250,
            latency: Duration::ZERO,
            report_path: None,
            render: RenderConfig::default(),
        }
    }
}

// ======================== Run Report ========================

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub timestamp: String,
    pub app_version: String,
    pub backend: String,
    pub render_adapter: String,
    pub producer_adapter: String,
    pub cross_adapter: bool,
    pub async_mode: bool,
    pub frames: u32,
    pub active_particles: u32,
    pub copied_particles: u32,
    pub final_render_fence: u64,
    pub final_buffer_index: usize,
    pub elapsed_secs: f64,
    pub fps: f64,
}

impl RunReport {
    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        log::info!("Saved run report to {:?}", path);
        Ok(())
    }
}

// ======================== Runners ========================

/// Runs on the software adapter. Cross-adapter runs put the producer on a
/// second software adapter of the same platform.
pub fn run_soft(config: &HeadlessConfig) -> PipelineResult<RunReport> {
    let platform = SoftPlatform::new();
    let render = Arc::new(SoftDevice::new(&platform, "soft_render").with_latency(config.latency));
    let producer = if config.cross_adapter {
        Arc::new(SoftDevice::new(&platform, "soft_compute").with_latency(config.latency))
    } else {
        Arc::clone(&render)
    };
    run_with(config, render, producer)
}

/// Runs on a wgpu adapter. wgpu cannot share handles between adapters, so
/// cross-adapter runs fall back to a single adapter.
pub fn run_wgpu(config: &HeadlessConfig) -> PipelineResult<RunReport> {
    let device = Arc::new(WgpuDevice::open(&config.render.adapter)?);
    run_with(config, Arc::clone(&device), device)
}

pub fn run_with<D: Device>(
    config: &HeadlessConfig,
    render_device: Arc<D>,
    producer_device: Arc<D>,
) -> PipelineResult<RunReport> {
    let capacity = config.render.particle_capacity;
    let active = config.particles.unwrap_or(capacity);
    let copied = config.copied.unwrap_or(active);
    let timeout = config.render.fence_timeout();

    let mut render = Render::new(config.render.clone(), Arc::clone(&render_device))?;
    render.set_async_mode(config.async_mode);
    if config.cross_adapter {
        if let Err(err) = link_adapters(&mut render, &producer_device) {
            if err.class() != ErrorClass::CapabilityUnavailable {
                return Err(err);
            }
        }
    }
    // Without a live session the producer must share the render adapter.
    let producer_device = if render.is_cross_adapter() {
        producer_device
    } else {
        Arc::clone(&render_device)
    };
    let mut simulation = ParticleSimulation::new(producer_device.as_ref(), capacity, timeout)?;
    let render_fence = render.render_fence().clone();

    log::info!(
        "Headless run started: {} frames, {} drawn / {} copied of {}{}",
        config.frames,
        active,
        copied,
        capacity,
        if render.is_cross_adapter() { " (cross-adapter)" } else { "" }
    );

    let started = Instant::now();
    let mut last_report = Instant::now();
    let mut last_report_frame = 0u32;
    let mut release = None;

    for step in 0..config.frames {
        let produced = simulation.step(release.map(|value| (&render_fence, value)))?;
        let mut fence_value = produced;
        render.draw(active, &simulation, &mut fence_value, copied)?;
        release = Some(fence_value);

        if config.progress_interval > 0 && (step + 1) % config.progress_interval == 0 {
            let done = step + 1;
            let total_elapsed = started.elapsed().as_secs_f64().max(1e-6);
            let total_fps = done as f64 / total_elapsed;

            let window_elapsed = last_report.elapsed().as_secs_f64().max(1e-6);
            let window_fps = (done - last_report_frame) as f64 / window_elapsed;

            let remaining = config.frames.saturating_sub(done);
            let eta_secs = if total_fps > 1e-6 {
                remaining as f64 / total_fps
            } else {
                0.0
            };

            log::info!(
                "Headless progress: {}/{} | fps={:.0} (window {:.0}) | render fence={} | ETA={:.1} s",
                done,
                config.frames,
                total_fps,
                window_fps,
                fence_value,
                eta_secs,
            );

            last_report = Instant::now();
            last_report_frame = done;
        }
    }

    render.wait_for_idle()?;
    simulation.drain()?;

    let elapsed_secs = started.elapsed().as_secs_f64();
    let report = RunReport {
        timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        backend: render_device.info().backend.clone(),
        render_adapter: render_device.info().name.clone(),
        producer_adapter: producer_device.info().name.clone(),
        cross_adapter: render.is_cross_adapter(),
        async_mode: config.async_mode,
        frames: config.frames,
        active_particles: active,
        copied_particles: copied,
        final_render_fence: render.render_fence().completed_value(),
        final_buffer_index: render.buffer_index(),
        elapsed_secs,
        fps: config.frames as f64 / elapsed_secs.max(1e-6),
    };
    log::info!(
        "Headless run finished: {} frames in {:.2} s ({:.0} fps)",
        report.frames,
        report.elapsed_secs,
        report.fps
    );

    if let Some(path) = &config.report_path {
        report.save(path)?;
    }
    Ok(report)
}

fn link_adapters<D: Device>(render: &mut Render<D>, producer: &Arc<D>) -> PipelineResult<()> {
    render.set_producer_adapter(Arc::clone(producer))?;
    let handles = render.export_shared_state()?;
    render.adopt_shared_state(handles)
}
