// ============================================================================
// copy.rs — particle-sync
// Dedicated copy queue moving producer output into render-owned buffers.
// ============================================================================

use std::time::Duration;

use crate::device::{Command, CommandQueue, Device, GpuBuffer, QueueDesc, QueueKind};
use crate::error::{PipelineError, PipelineResult};
use crate::fence::{Fence, WaitHandle};
use crate::particles::{particle_bytes, PARTICLE_STRIDE};

/// Copy stage. Every copy waits on its source fence on the queue, so the
/// host never blocks here.
pub struct CopyPipeline<D: Device> {
    queue: D::Queue,
    fence: Fence,
    fence_value: u64,
    capacity: u32,
    timeout: Duration,
}

impl<D: Device> CopyPipeline<D> {
    /// Creates the copy queue and its own fence.
    pub fn new(
        device: &D,
        capacity: u32,
        max_performance: bool,
        timeout: Duration,
    ) -> PipelineResult<Self> {
        let fence = device.create_fence("copy_fence");
        Self::with_fence(device, fence, capacity, max_performance, timeout)
    }

    /// Creates the copy queue signaling an existing fence, such as one that
    /// was exported for another adapter.
    pub fn with_fence(
        device: &D,
        fence: Fence,
        capacity: u32,
        max_performance: bool,
        timeout: Duration,
    ) -> PipelineResult<Self> {
        let queue = device.create_queue(&QueueDesc {
            label: "copy_queue".into(),
            kind: QueueKind::Copy,
            max_performance,
            fence_timeout: timeout,
        })?;
        let fence_value = fence.requested_value();
        Ok(Self {
            queue,
            fence,
            fence_value,
            capacity,
            timeout,
        })
    }

    /// Copies the first `count` particles of `src` into `dst`.
    ///
    /// The queue waits for `source_fence` to reach `source_value` and, when
    /// given, for `release` (the last reader of `dst`). Returns the handle
    /// that completes when `dst` holds the data. A `count` larger than the
    /// configured capacity or than either buffer fails before anything is
    /// queued.
    pub fn copy(
        &mut self,
        source_fence: &Fence,
        source_value: u64,
        src: &D::Buffer,
        dst: &D::Buffer,
        release: Option<(&Fence, u64)>,
        count: u32,
    ) -> PipelineResult<WaitHandle> {
        let held = src.size().min(dst.size()) / PARTICLE_STRIDE;
        let capacity = u64::from(self.capacity).min(held) as u32;
        if count > capacity {
            return Err(PipelineError::BufferOverrun {
                requested: count,
                capacity,
            });
        }

        self.queue.wait(source_fence, source_value)?;
        if let Some((fence, value)) = release {
            if value > 0 {
                self.queue.wait(fence, value)?;
            }
        }
        self.queue.submit(vec![Command::CopyBuffer {
            src: src.clone(),
            dst: dst.clone(),
            size: particle_bytes(count),
        }])?;

        self.fence_value += 1;
        self.fence.signal(&self.queue, self.fence_value)?;
        Ok(self.fence.handle(self.fence_value))
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn queue(&self) -> &D::Queue {
        &self.queue
    }

    /// Blocks until every submitted copy has landed.
    pub fn drain(&self) -> PipelineResult<()> {
        self.fence.wait_until(self.fence_value, self.timeout)
    }
}
