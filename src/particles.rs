// ============================================================================
// particles.rs — particle-sync
// Particle layout, the producer contract, and a demo producer that stands in
// for the compute stage.
// ============================================================================

use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use rand::Rng;

use crate::device::{BufferDesc, Command, CommandQueue, Device, QueueDesc, QueueKind};
use crate::error::PipelineResult;
use crate::exchange::BufferExchange;
use crate::fence::Fence;

// ======================== Layout ========================

/// Position of one particle as laid out in simulation buffers.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Particle {
    pub position: [f32; 4],
}

/// Bytes per particle in every simulation and shared buffer.
pub const PARTICLE_STRIDE: u64 = std::mem::size_of::<Particle>() as u64;

/// Bytes needed to hold `count` particles.
pub fn particle_bytes(count: u32) -> u64 {
    u64::from(count) * PARTICLE_STRIDE
}

/// Reinterprets raw buffer contents as particles. Trailing bytes that do not
/// form a whole particle are ignored.
pub fn decode_particles(bytes: &[u8]) -> Vec<Particle> {
    bytes
        .chunks_exact(PARTICLE_STRIDE as usize)
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

// ======================== Producer Contract ========================

/// The compute stage as seen by the renderer.
///
/// `buffer()` is the buffer holding the most recent results; it is complete
/// once `fence()` reaches the value the producer hands to `Render::draw`.
pub trait ParticleSource<D: Device> {
    fn fence(&self) -> &Fence;
    fn buffer(&self) -> &D::Buffer;
}

// ======================== Demo Producer ========================

/// Placeholder compute stage: seeds particles on a disc and rotates them a
/// little each step, uploading results on its own compute queue.
pub struct ParticleSimulation<D: Device> {
    queue: D::Queue,
    fence: Fence,
    fence_value: u64,
    buffers: BufferExchange<D::Buffer>,
    particles: Vec<Particle>,
    angular_speed: f32,
    timeout: Duration,
}

impl<D: Device> ParticleSimulation<D> {
    pub fn new(device: &D, capacity: u32, timeout: Duration) -> PipelineResult<Self> {
        let queue = device.create_queue(&QueueDesc {
            label: "compute_queue".into(),
            kind: QueueKind::Compute,
            max_performance: false,
            fence_timeout: timeout,
        })?;
        let fence = device.create_fence("compute_fence");

        let size = particle_bytes(capacity);
        let buffers = BufferExchange::new([
            device.create_buffer(&BufferDesc {
                label: "simulation_0".into(),
                size,
                shared: false,
            })?,
            device.create_buffer(&BufferDesc {
                label: "simulation_1".into(),
                size,
                shared: false,
            })?,
        ]);

        let mut rng = rand::thread_rng();
        let particles = (0..capacity)
            .map(|_| {
                let radius: f32 = rng.gen_range(0.05..1.0);
                let angle: f32 = rng.gen_range(0.0..std::f32::consts::TAU);
                let height: f32 = rng.gen_range(-0.05..0.05);
                Particle {
                    position: [radius * angle.cos(), height, radius * angle.sin(), 1.0],
                }
            })
            .collect();

        Ok(Self {
            queue,
            fence,
            fence_value: 0,
            buffers,
            particles,
            angular_speed: 0.01,
            timeout,
        })
    }

    /// Advances the simulation one step and returns the fence value that marks
    /// the new results complete.
    ///
    /// `release` is the render fence and value returned by the previous
    /// `draw`; the upload into the reused buffer waits for it on the queue.
    pub fn step(&mut self, release: Option<(&Fence, u64)>) -> PipelineResult<u64> {
        for particle in &mut self.particles {
            let [x, y, z, w] = particle.position;
            // Inner particles orbit faster.
            let radius = (x * x + z * z).sqrt().max(0.05);
            let (sin, cos) = (self.angular_speed / radius).sin_cos();
            particle.position = [x * cos - z * sin, y, x * sin + z * cos, w];
        }

        if let Some((fence, value)) = release {
            self.queue.wait(fence, value)?;
        }
        self.queue.submit(vec![Command::Upload {
            dst: self.buffers.current_write_buffer().clone(),
            offset: 0,
            data: bytemuck::cast_slice(&self.particles).to_vec(),
        }])?;
        self.buffers.advance();

        self.fence_value += 1;
        self.fence.signal(&self.queue, self.fence_value)?;
        Ok(self.fence_value)
    }

    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    pub fn capacity(&self) -> u32 {
        self.particles.len() as u32
    }

    /// Blocks until every step submitted so far has completed.
    pub fn drain(&self) -> PipelineResult<()> {
        self.fence.wait_until(self.fence_value, self.timeout)
    }
}

impl<D: Device> ParticleSource<D> for ParticleSimulation<D> {
    fn fence(&self) -> &Fence {
        &self.fence
    }

    fn buffer(&self) -> &D::Buffer {
        self.buffers.current_read_buffer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::{SoftDevice, SoftPlatform};

    #[test]
    fn particle_stride_matches_float4() {
        assert_eq!(PARTICLE_STRIDE, 16);
        assert_eq!(particle_bytes(1000), 16_000);
    }

    #[test]
    fn step_uploads_and_signals() {
        let platform = SoftPlatform::new();
        let device = SoftDevice::new(&platform, "compute");
        let mut sim = ParticleSimulation::new(&device, 64, Duration::from_secs(5)).unwrap();

        let first = sim.step(None).unwrap();
        let second = sim.step(None).unwrap();
        assert_eq!((first, second), (1, 2));

        sim.drain().unwrap();
        let uploaded = decode_particles(&sim.buffer().read());
        assert_eq!(uploaded.len(), 64);
        assert!(uploaded.iter().all(|p| p.position[3] == 1.0));
    }
}
