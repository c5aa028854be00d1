// ============================================================================
// bridge.rs — particle-sync
// Cross-adapter linkage: a buffer pair and fence created on the producing
// adapter, exported as OS handles and opened on the consuming adapter.
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::copy::CopyPipeline;
use crate::device::{BufferDesc, Device, GpuBuffer, SharedHandle};
use crate::error::{PipelineError, PipelineResult};
use crate::exchange::BufferExchange;
use crate::fence::Fence;
use crate::particles::particle_bytes;

/// Handles a consumer needs to join a cross-adapter session. Plain data, so
/// it can cross a process boundary as JSON.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedHandles {
    pub buffers: [SharedHandle; 2],
    pub fence: SharedHandle,
    /// Particle capacity of each shared buffer.
    pub capacity: u32,
}

/// One shared buffer as seen from each adapter.
pub struct SharedBuffer<D: Device> {
    pub producer: D::Buffer,
    pub consumer: D::Buffer,
}

/// Live cross-adapter session: the shared ping-pong pair, the imported
/// fence the consumer waits on, and the producer-side copy stage that
/// signals it.
pub struct SharedBufferPair<D: Device> {
    pub exchange: BufferExchange<SharedBuffer<D>>,
    pub fence: Fence,
    /// Consumer render fence opened on the producing adapter. Copies into a
    /// shared buffer wait on it for the buffer's last reader.
    pub release: Fence,
    pub copy: CopyPipeline<D>,
}

/// Objects behind an export. Holding them keeps the handles valid.
struct Exported<D: Device> {
    handles: SharedHandles,
    buffers: [D::Buffer; 2],
    _fence: Fence,
}

pub struct CrossAdapterSyncBridge<D: Device> {
    producer: Arc<D>,
    exported: Option<Exported<D>>,
    session: Option<SharedBufferPair<D>>,
}

impl<D: Device> CrossAdapterSyncBridge<D> {
    /// `producer` is the adapter that exports shared state and runs the copy
    /// stage into it. Fails with `CapabilityUnavailable` when it cannot share
    /// handles.
    pub fn new(producer: Arc<D>) -> PipelineResult<Self> {
        if !producer.capabilities().shared_handles {
            return Err(PipelineError::CapabilityUnavailable(format!(
                "producer adapter '{}' cannot share handles",
                producer.info().name
            )));
        }
        Ok(Self {
            producer,
            exported: None,
            session: None,
        })
    }

    pub fn producer(&self) -> &Arc<D> {
        &self.producer
    }

    /// Creates the shared pair and shared fence on the producing adapter and
    /// exports them. The objects stay alive with the bridge; a previous
    /// export is released.
    pub fn export_shared_state(&mut self, capacity: u32) -> PipelineResult<SharedHandles> {
        let size = particle_bytes(capacity);
        let make = |label: &str| {
            self.producer.create_buffer(&BufferDesc {
                label: label.into(),
                size,
                shared: true,
            })
        };
        let buffers = [make("shared_0")?, make("shared_1")?];
        let fence = self.producer.create_fence("shared_fence");

        let handles = SharedHandles {
            buffers: [
                self.producer.export_buffer(&buffers[0])?,
                self.producer.export_buffer(&buffers[1])?,
            ],
            fence: self.producer.export_fence(&fence)?,
            capacity,
        };

        log::info!(
            "exported shared state from '{}': buffers {:?}, fence {:?}",
            self.producer.info().name,
            handles.buffers,
            handles.fence
        );
        self.exported = Some(Exported {
            handles,
            buffers,
            _fence: fence,
        });
        Ok(handles)
    }

    /// Handles of the live export, if any.
    pub fn exported_handles(&self) -> Option<SharedHandles> {
        self.exported.as_ref().map(|exported| exported.handles)
    }

    /// Producer-side buffers of the live export. A producer may write them
    /// directly instead of going through a copy.
    pub fn exported_buffers(&self) -> Option<&[D::Buffer; 2]> {
        self.exported.as_ref().map(|exported| &exported.buffers)
    }

    /// Opens `handles` on the consuming adapter and on the producing adapter
    /// and starts the session. The handles may come from another bridge or
    /// another process.
    ///
    /// `render_fence` is the consumer's exported render fence. The producing
    /// adapter opens it so its copy queue can wait for render completion.
    pub fn import_shared_state(
        &mut self,
        consumer: &D,
        handles: SharedHandles,
        render_fence: SharedHandle,
        max_performance: bool,
        timeout: Duration,
    ) -> PipelineResult<()> {
        if !consumer.capabilities().shared_handles {
            return Err(PipelineError::CapabilityUnavailable(format!(
                "consumer adapter '{}' cannot open shared handles",
                consumer.info().name
            )));
        }

        let needed = particle_bytes(handles.capacity);
        let open = |device: &D, handle: SharedHandle| -> PipelineResult<D::Buffer> {
            let buffer = device.open_shared_buffer(handle)?;
            if buffer.size() < needed {
                return Err(PipelineError::Config(format!(
                    "shared buffer {handle:?} holds {} bytes, {} particles need {needed}",
                    buffer.size(),
                    handles.capacity
                )));
            }
            Ok(buffer)
        };
        let c0 = open(consumer, handles.buffers[0])?;
        let c1 = open(consumer, handles.buffers[1])?;
        let fence = consumer.open_shared_fence(handles.fence)?;

        let producer = self.producer.as_ref();
        let p0 = open(producer, handles.buffers[0])?;
        let p1 = open(producer, handles.buffers[1])?;
        let signaled = producer.open_shared_fence(handles.fence)?;
        let release = producer.open_shared_fence(render_fence)?;
        let copy = CopyPipeline::with_fence(
            producer,
            signaled,
            handles.capacity,
            max_performance,
            timeout,
        )?;

        self.session = Some(SharedBufferPair {
            exchange: BufferExchange::new([
                SharedBuffer {
                    producer: p0,
                    consumer: c0,
                },
                SharedBuffer {
                    producer: p1,
                    consumer: c1,
                },
            ]),
            fence,
            release,
            copy,
        });
        log::info!(
            "cross-adapter session active: '{}' -> '{}'",
            self.producer.info().name,
            consumer.info().name
        );
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&SharedBufferPair<D>> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut SharedBufferPair<D>> {
        self.session.as_mut()
    }
}
