// ============================================================================
// device.rs — particle-sync
// Backend seam: devices, command queues, the commands they execute, and the
// shareable handles used for cross-adapter linkage.
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::camera::FrameConstants;
use crate::error::{PipelineError, PipelineResult};
use crate::fence::Fence;
use crate::particles::PARTICLE_STRIDE;

// ======================== Descriptors ========================

/// Role of a hardware queue. Each stage submits to its own queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    Compute,
    Copy,
    Render,
}

impl QueueKind {
    pub fn name(self) -> &'static str {
        match self {
            QueueKind::Compute => "compute",
            QueueKind::Copy => "copy",
            QueueKind::Render => "render",
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueueDesc {
    pub label: String,
    pub kind: QueueKind,
    /// Request the vendor max-performance (no throttling) queue path. Only
    /// honored when [`Capabilities::max_performance_queues`] is set.
    pub max_performance: bool,
    /// Bound for waits the queue performs on the host's behalf.
    pub fence_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    /// Buffer may be exported to another adapter.
    pub shared: bool,
}

/// Optional features a device may or may not expose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Buffers and fences can be exported as OS-level shared handles.
    pub shared_handles: bool,
    /// Queues can be created with the vendor max-performance extension.
    pub max_performance_queues: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AdapterInfo {
    pub name: String,
    pub backend: String,
    pub discrete: bool,
}

/// OS-level shareable handle for a buffer or fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SharedHandle(pub u64);

// ======================== Commands ========================

/// Buffers know their own size so submissions can be bounds-checked.
pub trait GpuBuffer: Clone + Send + Sync + 'static {
    fn size(&self) -> u64;
    fn label(&self) -> &str;
}

/// Work recorded into a command list and executed in order by a queue.
pub enum Command<D: Device> {
    /// Copy `size` bytes from the start of `src` to the start of `dst`.
    CopyBuffer {
        src: D::Buffer,
        dst: D::Buffer,
        size: u64,
    },
    /// Host data written into `dst` at `offset` when the list executes.
    Upload {
        dst: D::Buffer,
        offset: u64,
        data: Vec<u8>,
    },
    /// Draw `count` particles from `particles` into `target`.
    DrawParticles {
        particles: D::Buffer,
        count: u32,
        target: D::RenderTarget,
        constants: FrameConstants,
    },
}

impl<D: Device> Command<D> {
    /// Bounds-checks the command against its buffers.
    pub fn validate(&self, queue: &str) -> PipelineResult<()> {
        let overrun = |what: &str, needed: u64, buffer: &D::Buffer| PipelineError::Submission {
            queue: queue.to_owned(),
            reason: format!(
                "{what} needs {needed} bytes but '{}' holds {}",
                buffer.label(),
                buffer.size()
            ),
        };
        match self {
            Command::CopyBuffer { src, dst, size } => {
                if *size > src.size() {
                    return Err(overrun("copy source", *size, src));
                }
                if *size > dst.size() {
                    return Err(overrun("copy destination", *size, dst));
                }
            }
            Command::Upload { dst, offset, data } => {
                let end = offset + data.len() as u64;
                if end > dst.size() {
                    return Err(overrun("upload", end, dst));
                }
            }
            Command::DrawParticles {
                particles, count, ..
            } => {
                let needed = u64::from(*count) * PARTICLE_STRIDE;
                if needed > particles.size() {
                    return Err(overrun("draw", needed, particles));
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::CopyBuffer { .. } => "copy_buffer",
            Command::Upload { .. } => "upload",
            Command::DrawParticles { .. } => "draw_particles",
        }
    }
}

// ======================== Traits ========================

/// One physical adapter opened for use by the pipeline.
pub trait Device: Send + Sync + Sized + 'static {
    type Buffer: GpuBuffer;
    type RenderTarget: Clone + Send + Sync + 'static;
    type Queue: CommandQueue<Device = Self>;

    fn info(&self) -> &AdapterInfo;
    fn capabilities(&self) -> Capabilities;

    fn create_queue(&self, desc: &QueueDesc) -> PipelineResult<Self::Queue>;
    /// Fences created here are wired to the device's loss notification.
    fn create_fence(&self, label: &str) -> Fence;
    fn create_buffer(&self, desc: &BufferDesc) -> PipelineResult<Self::Buffer>;
    fn create_render_target(
        &self,
        label: &str,
        width: u32,
        height: u32,
    ) -> PipelineResult<Self::RenderTarget>;

    fn export_buffer(&self, buffer: &Self::Buffer) -> PipelineResult<SharedHandle>;
    fn open_shared_buffer(&self, handle: SharedHandle) -> PipelineResult<Self::Buffer>;
    fn export_fence(&self, fence: &Fence) -> PipelineResult<SharedHandle>;
    fn open_shared_fence(&self, handle: SharedHandle) -> PipelineResult<Fence>;

    /// Blocks until every queue of the device is idle.
    fn wait_for_idle(&self) -> PipelineResult<()>;
}

/// A hardware queue. Submissions, waits, and signals execute in call order.
pub trait CommandQueue: Send + Sync + 'static {
    type Device: Device;

    fn label(&self) -> &str;
    fn kind(&self) -> QueueKind;

    fn submit(&self, commands: Vec<Command<Self::Device>>) -> PipelineResult<()>;

    /// Raise `fence` to `value` after all prior work. Use [`Fence::signal`],
    /// which enforces monotonic requests, rather than calling this directly.
    fn signal(&self, fence: &Fence, value: u64) -> PipelineResult<()>;

    /// Hold back later work on this queue until `fence` reaches `value`.
    fn wait(&self, fence: &Fence, value: u64) -> PipelineResult<()>;
}

/// Behavior shared by objects that own work on an adapter.
pub trait AdapterShared {
    type Device: Device;

    fn device(&self) -> &Arc<Self::Device>;

    /// Drains every queue the object submits to.
    fn wait_for_idle(&self) -> PipelineResult<()>;
}
