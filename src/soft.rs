// ============================================================================
// soft.rs — particle-sync
// Software adapter: queues are worker threads that execute ops in order, and a
// platform object plays the OS table of shareable kernel handles.
// ============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::camera::FrameConstants;
use crate::device::{
    AdapterInfo, BufferDesc, Capabilities, Command, CommandQueue, Device, GpuBuffer, QueueDesc,
    QueueKind, SharedHandle,
};
use crate::error::{PipelineError, PipelineResult};
use crate::fence::{Fence, WeakFence};
use crate::particles::{decode_particles, particle_bytes};

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

// ======================== Platform ========================

/// Entries do not keep their objects alive: a handle stops resolving once
/// every owner has dropped the object.
enum SharedObject {
    Buffer(Weak<SoftBufferInner>),
    Fence(WeakFence),
}

impl SharedObject {
    fn is_alive(&self) -> bool {
        match self {
            SharedObject::Buffer(buffer) => buffer.strong_count() > 0,
            SharedObject::Fence(fence) => fence.is_alive(),
        }
    }
}

/// Process-wide table of shared objects, standing in for OS handles.
/// Devices created on the same platform can open each other's exports.
pub struct SoftPlatform {
    objects: Mutex<HashMap<u64, SharedObject>>,
    next_handle: AtomicU64,
}

impl SoftPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    fn register(&self, object: SharedObject) -> SharedHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut objects = self.objects.lock();
        objects.retain(|_, entry| entry.is_alive());
        objects.insert(handle, object);
        SharedHandle(handle)
    }

    fn open_buffer(&self, handle: SharedHandle) -> Option<SoftBuffer> {
        match self.objects.lock().get(&handle.0) {
            Some(SharedObject::Buffer(inner)) => inner.upgrade().map(|inner| SoftBuffer { inner }),
            _ => None,
        }
    }

    fn open_fence(&self, handle: SharedHandle) -> Option<Fence> {
        match self.objects.lock().get(&handle.0) {
            Some(SharedObject::Fence(fence)) => fence.upgrade(),
            _ => None,
        }
    }

    /// Exported objects that are still alive.
    pub fn shared_object_count(&self) -> usize {
        self.objects.lock().values().filter(|object| object.is_alive()).count()
    }
}

// ======================== Resources ========================

struct SoftBufferInner {
    label: String,
    size: u64,
    data: Mutex<Vec<u8>>,
}

/// Host-memory buffer. Clones alias the same memory.
#[derive(Clone)]
pub struct SoftBuffer {
    inner: Arc<SoftBufferInner>,
}

impl SoftBuffer {
    fn new(label: &str, size: u64) -> Self {
        Self {
            inner: Arc::new(SoftBufferInner {
                label: label.to_owned(),
                size,
                data: Mutex::new(vec![0; size as usize]),
            }),
        }
    }

    /// Copies the whole buffer out.
    pub fn read(&self) -> Vec<u8> {
        self.inner.data.lock().clone()
    }

    fn read_prefix(&self, len: u64) -> Vec<u8> {
        self.inner.data.lock()[..len as usize].to_vec()
    }

    fn write(&self, offset: u64, bytes: &[u8]) {
        let start = offset as usize;
        self.inner.data.lock()[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn same_memory(&self, other: &SoftBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl GpuBuffer for SoftBuffer {
    fn size(&self) -> u64 {
        self.inner.size
    }

    fn label(&self) -> &str {
        &self.inner.label
    }
}

/// What a software render target has been asked to draw.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetStats {
    pub draws: u64,
    pub particles_drawn: u64,
    pub last_count: u32,
    /// Sum of the xyz components of every particle in the last draw.
    pub last_checksum: f64,
    pub last_constants: Option<FrameConstants>,
}

struct SoftTargetInner {
    label: String,
    width: u32,
    height: u32,
    stats: Mutex<TargetStats>,
}

#[derive(Clone)]
pub struct SoftTarget {
    inner: Arc<SoftTargetInner>,
}

impl SoftTarget {
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.inner.width, self.inner.height)
    }

    pub fn stats(&self) -> TargetStats {
        self.inner.stats.lock().clone()
    }
}

// ======================== Device ========================

struct DeviceState {
    name: String,
    lost: AtomicBool,
    fences: Mutex<Vec<WeakFence>>,
    queues: Mutex<Vec<Weak<SoftQueueInner>>>,
}

impl DeviceState {
    fn lose(&self) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            log::error!("{}: device removed", self.name);
        }
        for fence in self.fences.lock().iter().filter_map(WeakFence::upgrade) {
            fence.mark_lost();
        }
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

/// Software adapter.
pub struct SoftDevice {
    info: AdapterInfo,
    capabilities: Capabilities,
    platform: Arc<SoftPlatform>,
    latency: Duration,
    state: Arc<DeviceState>,
}

impl SoftDevice {
    /// Creates an adapter on `platform` with every capability available.
    pub fn new(platform: &Arc<SoftPlatform>, name: &str) -> Self {
        Self {
            info: AdapterInfo {
                name: name.to_owned(),
                backend: "software".into(),
                discrete: false,
            },
            capabilities: Capabilities {
                shared_handles: true,
                max_performance_queues: true,
            },
            platform: Arc::clone(platform),
            latency: Duration::ZERO,
            state: Arc::new(DeviceState {
                name: name.to_owned(),
                lost: AtomicBool::new(false),
                fences: Mutex::new(Vec::new()),
                queues: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Every command list takes at least `latency` to execute. Applies to
    /// queues created afterwards.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Simulates device removal: queued work is dropped and every fence
    /// created by this device fails pending waits.
    pub fn lose(&self) {
        self.state.lose();
    }

    pub fn is_lost(&self) -> bool {
        self.state.is_lost()
    }

    /// Total command lists accepted by the device's queues.
    pub fn submission_count(&self) -> u64 {
        self.live_queues()
            .iter()
            .map(|queue| queue.submissions.load(Ordering::Relaxed))
            .sum()
    }

    pub fn platform(&self) -> &Arc<SoftPlatform> {
        &self.platform
    }

    fn live_queues(&self) -> Vec<Arc<SoftQueueInner>> {
        let mut queues = self.state.queues.lock();
        queues.retain(|queue| queue.strong_count() > 0);
        queues.iter().filter_map(Weak::upgrade).collect()
    }

    fn require_sharing(&self) -> PipelineResult<()> {
        if self.capabilities.shared_handles {
            Ok(())
        } else {
            Err(PipelineError::CapabilityUnavailable(format!(
                "adapter '{}' cannot share handles",
                self.info.name
            )))
        }
    }
}

impl Device for SoftDevice {
    type Buffer = SoftBuffer;
    type RenderTarget = SoftTarget;
    type Queue = SoftQueue;

    fn info(&self) -> &AdapterInfo {
        &self.info
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn create_queue(&self, desc: &QueueDesc) -> PipelineResult<SoftQueue> {
        let (sender, receiver) = unbounded();
        let worker = {
            let state = Arc::clone(&self.state);
            let label = desc.label.clone();
            let latency = self.latency;
            let timeout = desc.fence_timeout;
            thread::Builder::new()
                .name(format!("{}-{}", self.info.name, desc.label))
                .spawn(move || run_queue(&label, receiver, &state, latency, timeout))
                .map_err(|e| worker_start_failed(&desc.label, e))?
        };

        let inner = Arc::new(SoftQueueInner {
            label: desc.label.clone(),
            kind: desc.kind,
            sender,
            worker: Mutex::new(Some(worker)),
            state: Arc::clone(&self.state),
            submissions: AtomicU64::new(0),
            idle: Fence::new(&format!("{}_idle", desc.label)),
            idle_value: AtomicU64::new(0),
        });
        self.state.queues.lock().push(Arc::downgrade(&inner));

        log::debug!(
            "{}: created {} queue '{}'{}",
            self.info.name,
            desc.kind.name(),
            desc.label,
            if desc.max_performance { " (max performance)" } else { "" }
        );
        Ok(SoftQueue { inner })
    }

    fn create_fence(&self, label: &str) -> Fence {
        let fence = Fence::new(label);
        if self.state.is_lost() {
            fence.mark_lost();
        }
        let mut fences = self.state.fences.lock();
        fences.retain(WeakFence::is_alive);
        fences.push(fence.downgrade());
        fence
    }

    fn create_buffer(&self, desc: &BufferDesc) -> PipelineResult<SoftBuffer> {
        if desc.shared {
            self.require_sharing()?;
        }
        Ok(SoftBuffer::new(&desc.label, desc.size))
    }

    fn create_render_target(
        &self,
        label: &str,
        width: u32,
        height: u32,
    ) -> PipelineResult<SoftTarget> {
        Ok(SoftTarget {
            inner: Arc::new(SoftTargetInner {
                label: label.to_owned(),
                width,
                height,
                stats: Mutex::new(TargetStats::default()),
            }),
        })
    }

    fn export_buffer(&self, buffer: &SoftBuffer) -> PipelineResult<SharedHandle> {
        self.require_sharing()?;
        Ok(self
            .platform
            .register(SharedObject::Buffer(Arc::downgrade(&buffer.inner))))
    }

    fn open_shared_buffer(&self, handle: SharedHandle) -> PipelineResult<SoftBuffer> {
        self.require_sharing()?;
        self.platform
            .open_buffer(handle)
            .ok_or(PipelineError::InvalidSharedHandle(handle))
    }

    fn export_fence(&self, fence: &Fence) -> PipelineResult<SharedHandle> {
        self.require_sharing()?;
        Ok(self.platform.register(SharedObject::Fence(fence.downgrade())))
    }

    fn open_shared_fence(&self, handle: SharedHandle) -> PipelineResult<Fence> {
        self.require_sharing()?;
        self.platform
            .open_fence(handle)
            .ok_or(PipelineError::InvalidSharedHandle(handle))
    }

    fn wait_for_idle(&self) -> PipelineResult<()> {
        for queue in self.live_queues() {
            queue.flush()?;
        }
        Ok(())
    }
}

// ======================== Queue ========================

enum QueueOp {
    Execute(Vec<Command<SoftDevice>>),
    Wait(Fence, u64),
    Signal(Fence, u64),
    Shutdown,
}

struct SoftQueueInner {
    label: String,
    kind: QueueKind,
    sender: Sender<QueueOp>,
    worker: Mutex<Option<JoinHandle<()>>>,
    state: Arc<DeviceState>,
    submissions: AtomicU64,
    idle: Fence,
    idle_value: AtomicU64,
}

impl SoftQueueInner {
    fn send(&self, op: QueueOp) -> PipelineResult<()> {
        if self.state.is_lost() {
            return Err(PipelineError::Submission {
                queue: self.label.clone(),
                reason: "device lost".into(),
            });
        }
        self.sender.send(op).map_err(|_| PipelineError::Submission {
            queue: self.label.clone(),
            reason: "queue worker exited".into(),
        })
    }

    /// Blocks until everything sent so far has executed.
    fn flush(&self) -> PipelineResult<()> {
        if self.state.is_lost() {
            return Err(PipelineError::DeviceLost {
                fence: self.idle.label().to_owned(),
                awaited: self.idle_value.load(Ordering::Relaxed),
                completed: self.idle.completed_value(),
            });
        }
        let value = self.idle_value.fetch_add(1, Ordering::AcqRel) + 1;
        self.send(QueueOp::Signal(self.idle.clone(), value))?;
        self.idle.wait_until(value, IDLE_TIMEOUT)
    }
}

impl Drop for SoftQueueInner {
    fn drop(&mut self) {
        let _ = self.sender.send(QueueOp::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

/// In-order software queue backed by a worker thread.
#[derive(Clone)]
pub struct SoftQueue {
    inner: Arc<SoftQueueInner>,
}

impl SoftQueue {
    pub fn submission_count(&self) -> u64 {
        self.inner.submissions.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> PipelineResult<()> {
        self.inner.flush()
    }
}

impl CommandQueue for SoftQueue {
    type Device = SoftDevice;

    fn label(&self) -> &str {
        &self.inner.label
    }

    fn kind(&self) -> QueueKind {
        self.inner.kind
    }

    fn submit(&self, commands: Vec<Command<SoftDevice>>) -> PipelineResult<()> {
        for command in &commands {
            command.validate(&self.inner.label)?;
        }
        self.inner.send(QueueOp::Execute(commands))?;
        self.inner.submissions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn signal(&self, fence: &Fence, value: u64) -> PipelineResult<()> {
        self.inner.send(QueueOp::Signal(fence.clone(), value))
    }

    fn wait(&self, fence: &Fence, value: u64) -> PipelineResult<()> {
        self.inner.send(QueueOp::Wait(fence.clone(), value))
    }
}

/// A queue without a worker cannot execute anything, so this is fatal.
fn worker_start_failed(queue: &str, err: std::io::Error) -> PipelineError {
    PipelineError::Submission {
        queue: queue.to_owned(),
        reason: format!("failed to start queue worker: {err}"),
    }
}

fn run_queue(
    label: &str,
    receiver: Receiver<QueueOp>,
    state: &DeviceState,
    latency: Duration,
    timeout: Duration,
) {
    while let Ok(op) = receiver.recv() {
        if let QueueOp::Shutdown = op {
            break;
        }
        if state.is_lost() {
            continue;
        }
        match op {
            QueueOp::Wait(fence, value) => {
                if let Err(err) = fence.wait_until(value, timeout) {
                    log::error!("{label}: queue wait failed: {err}");
                    state.lose();
                }
            }
            QueueOp::Signal(fence, value) => {
                log::trace!("{label}: {} reached {value}", fence.label());
                fence.complete(value);
            }
            QueueOp::Execute(commands) => {
                if !latency.is_zero() {
                    thread::sleep(latency);
                }
                for command in commands {
                    execute(command);
                }
            }
            QueueOp::Shutdown => break,
        }
    }
}

fn execute(command: Command<SoftDevice>) {
    match command {
        Command::CopyBuffer { src, dst, size } => {
            let bytes = src.read_prefix(size);
            dst.write(0, &bytes);
        }
        Command::Upload { dst, offset, data } => dst.write(offset, &data),
        Command::DrawParticles {
            particles,
            count,
            target,
            constants,
        } => {
            let drawn = decode_particles(&particles.read_prefix(particle_bytes(count)));
            let checksum = drawn
                .iter()
                .map(|p| f64::from(p.position[0] + p.position[1] + p.position[2]))
                .sum();
            let mut stats = target.inner.stats.lock();
            stats.draws += 1;
            stats.particles_drawn += u64::from(count);
            stats.last_count = count;
            stats.last_checksum = checksum;
            stats.last_constants = Some(constants);
        }
    }
}
