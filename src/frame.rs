// ============================================================================
// frame.rs — particle-sync
// Fixed ring of frame slots paced by the render fence.
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::device::{Command, CommandQueue, Device, QueueDesc, QueueKind};
use crate::error::{PipelineError, PipelineResult};
use crate::fence::{Fence, WaitHandle};

/// Default number of frames in flight.
pub const FRAME_COUNT: usize = 2;

/// Lifecycle of one frame slot.
///
/// `Idle → Recording → Submitted → PresentPending`, and back to `Idle` when
/// the slot comes round again and its fence target has been reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Recording,
    Submitted,
    PresentPending,
}

/// One slot of the ring. The command list and render target belong to the
/// slot for the life of the scheduler.
pub struct Frame<D: Device> {
    index: usize,
    fence_target: u64,
    state: FrameState,
    commands: Vec<Command<D>>,
    target: D::RenderTarget,
}

impl<D: Device> Frame<D> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Render fence value that marks the slot's last submission complete.
    pub fn fence_target(&self) -> u64 {
        self.fence_target
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn target(&self) -> &D::RenderTarget {
        &self.target
    }
}

// ======================== Presentation ========================

/// Hands finished frames to the display. Window and swap-chain setup live
/// outside the crate.
pub trait Presenter<D: Device>: Send {
    fn present(&mut self, target: &D::RenderTarget, frame_index: usize) -> PipelineResult<()>;
}

const PRESENT_HISTORY: usize = 64;

#[derive(Default)]
struct PresentLog {
    count: u64,
    recent: VecDeque<usize>,
}

/// Presenter for runs without a window. Clones share one log of presented
/// slot indices, so a test can keep a copy after handing one to the renderer.
#[derive(Clone, Default)]
pub struct HeadlessPresenter {
    log: Arc<Mutex<PresentLog>>,
}

impl HeadlessPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presented_count(&self) -> u64 {
        self.log.lock().count
    }

    /// Most recently presented slot indices, oldest first.
    pub fn recent(&self) -> Vec<usize> {
        self.log.lock().recent.iter().copied().collect()
    }
}

impl<D: Device> Presenter<D> for HeadlessPresenter {
    fn present(&mut self, _target: &D::RenderTarget, frame_index: usize) -> PipelineResult<()> {
        let mut log = self.log.lock();
        log.count += 1;
        if log.recent.len() == PRESENT_HISTORY {
            log.recent.pop_front();
        }
        log.recent.push_back(frame_index);
        Ok(())
    }
}

// ======================== Scheduler ========================

/// Owns the render queue, the render fence, and the frame ring.
///
/// Slots are used in strict round robin. A slot is recycled lazily: only when
/// [`begin_frame`](Self::begin_frame) comes back to it, after waiting for its
/// previous fence target.
pub struct FrameScheduler<D: Device> {
    queue: D::Queue,
    fence: Fence,
    fence_value: u64,
    frames: Vec<Frame<D>>,
    next: usize,
    current: Option<usize>,
    timeout: Duration,
    extent: (u32, u32),
}

impl<D: Device> FrameScheduler<D> {
    pub fn new(
        device: &D,
        frame_count: usize,
        width: u32,
        height: u32,
        max_performance: bool,
        timeout: Duration,
    ) -> PipelineResult<Self> {
        if frame_count == 0 {
            return Err(PipelineError::Config("frame count must be at least 1".into()));
        }
        let queue = device.create_queue(&QueueDesc {
            label: "render_queue".into(),
            kind: QueueKind::Render,
            max_performance,
            fence_timeout: timeout,
        })?;
        let fence = device.create_fence("render_fence");

        let mut frames = Vec::with_capacity(frame_count);
        for index in 0..frame_count {
            frames.push(Frame {
                index,
                fence_target: 0,
                state: FrameState::Idle,
                commands: Vec::new(),
                target: device.create_render_target(&format!("frame_{index}"), width, height)?,
            });
        }

        Ok(Self {
            queue,
            fence,
            fence_value: 0,
            frames,
            next: 0,
            current: None,
            timeout,
            extent: (width, height),
        })
    }

    /// Claims the next slot for recording, blocking until the GPU has
    /// finished the slot's previous submission.
    pub fn begin_frame(&mut self) -> PipelineResult<usize> {
        if let Some(index) = self.current {
            return Err(PipelineError::InvalidFrameState {
                index,
                expected: FrameState::PresentPending,
                actual: self.frames[index].state,
            });
        }

        let index = self.next;
        let frame = &mut self.frames[index];
        if frame.state != FrameState::Idle {
            if !self.fence.reached(frame.fence_target) {
                log::trace!("frame {index}: waiting for render fence {}", frame.fence_target);
            }
            self.fence.wait_until(frame.fence_target, self.timeout)?;
            frame.commands.clear();
            frame.state = FrameState::Idle;
        }

        frame.state = FrameState::Recording;
        self.current = Some(index);
        self.next = (index + 1) % self.frames.len();
        Ok(index)
    }

    /// Whether `begin_frame` would block if slot `index` were next.
    pub fn would_block(&self, index: usize) -> bool {
        self.frames
            .get(index)
            .is_some_and(|frame| !self.fence.reached(frame.fence_target))
    }

    /// Makes the render queue wait for `fence` before this frame's work runs.
    pub fn queue_wait(&self, fence: &Fence, value: u64) -> PipelineResult<()> {
        self.expect_current(FrameState::Recording)?;
        self.queue.wait(fence, value)
    }

    pub fn record(&mut self, command: Command<D>) -> PipelineResult<()> {
        let index = self.expect_current(FrameState::Recording)?;
        self.frames[index].commands.push(command);
        Ok(())
    }

    /// Render target of the slot being recorded.
    pub fn current_target(&self) -> PipelineResult<&D::RenderTarget> {
        let index = self.expect_current(FrameState::Recording)?;
        Ok(&self.frames[index].target)
    }

    /// Submits the recorded commands and signals the render fence. The
    /// returned handle completes when the GPU has finished the frame.
    pub fn submit(&mut self) -> PipelineResult<WaitHandle> {
        let index = self.expect_current(FrameState::Recording)?;
        let frame = &mut self.frames[index];
        let commands = std::mem::take(&mut frame.commands);
        self.queue.submit(commands)?;

        self.fence_value += 1;
        self.fence.signal(&self.queue, self.fence_value)?;
        frame.fence_target = self.fence_value;
        frame.state = FrameState::Submitted;
        Ok(self.fence.handle(self.fence_value))
    }

    /// Queues the submitted frame for display.
    pub fn present(&mut self, presenter: &mut dyn Presenter<D>) -> PipelineResult<()> {
        let index = self.expect_current(FrameState::Submitted)?;
        let frame = &mut self.frames[index];
        presenter.present(&frame.target, index)?;
        frame.state = FrameState::PresentPending;
        self.current = None;
        Ok(())
    }

    /// Blocks until every submitted frame has completed.
    pub fn drain(&self) -> PipelineResult<()> {
        self.fence.wait_until(self.fence_value, self.timeout)
    }

    pub fn frame(&self, index: usize) -> Option<&Frame<D>> {
        self.frames.get(index)
    }

    pub fn frame_state(&self, index: usize) -> Option<FrameState> {
        self.frames.get(index).map(Frame::state)
    }

    /// Slot the next `begin_frame` will claim.
    pub fn next_index(&self) -> usize {
        self.next
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    pub fn queue(&self) -> &D::Queue {
        &self.queue
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    fn expect_current(&self, expected: FrameState) -> PipelineResult<usize> {
        let index = self.current.unwrap_or(self.next);
        let actual = self.frames[index].state;
        if self.current.is_some() && actual == expected {
            Ok(index)
        } else {
            Err(PipelineError::InvalidFrameState {
                index,
                expected,
                actual,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::{SoftDevice, SoftPlatform};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn run_frame(
        scheduler: &mut FrameScheduler<SoftDevice>,
        presenter: &mut HeadlessPresenter,
    ) -> usize {
        let index = scheduler.begin_frame().unwrap();
        scheduler.submit().unwrap();
        scheduler.present(presenter).unwrap();
        index
    }

    #[test]
    fn slots_rotate_in_strict_round_robin() {
        let platform = SoftPlatform::new();
        let device = SoftDevice::new(&platform, "render");
        let mut scheduler =
            FrameScheduler::new(&device, FRAME_COUNT, 64, 64, false, TIMEOUT).unwrap();
        let mut presenter = HeadlessPresenter::new();

        let order: Vec<usize> = (0..5).map(|_| run_frame(&mut scheduler, &mut presenter)).collect();
        assert_eq!(order, [0, 1, 0, 1, 0]);
        assert_eq!(presenter.recent(), order);
        assert_eq!(scheduler.fence_value(), 5);
        scheduler.drain().unwrap();
    }

    #[test]
    fn states_follow_the_lifecycle() {
        let platform = SoftPlatform::new();
        let device = SoftDevice::new(&platform, "render");
        let mut scheduler = FrameScheduler::new(&device, 2, 64, 64, false, TIMEOUT).unwrap();
        let mut presenter = HeadlessPresenter::new();

        assert_eq!(scheduler.frame_state(0), Some(FrameState::Idle));
        scheduler.begin_frame().unwrap();
        assert_eq!(scheduler.frame_state(0), Some(FrameState::Recording));
        let handle = scheduler.submit().unwrap();
        assert_eq!(scheduler.frame_state(0), Some(FrameState::Submitted));
        scheduler.present(&mut presenter).unwrap();
        assert_eq!(scheduler.frame_state(0), Some(FrameState::PresentPending));
        assert_eq!(scheduler.frame(0).unwrap().fence_target(), handle.value());
        handle.wait(TIMEOUT).unwrap();
    }

    #[test]
    fn out_of_order_calls_are_rejected() {
        let platform = SoftPlatform::new();
        let device = SoftDevice::new(&platform, "render");
        let mut scheduler = FrameScheduler::new(&device, 2, 64, 64, false, TIMEOUT).unwrap();
        let mut presenter = HeadlessPresenter::new();

        assert!(matches!(
            scheduler.submit(),
            Err(PipelineError::InvalidFrameState { index: 0, .. })
        ));
        scheduler.begin_frame().unwrap();
        assert!(matches!(
            scheduler.present(&mut presenter),
            Err(PipelineError::InvalidFrameState {
                expected: FrameState::Submitted,
                actual: FrameState::Recording,
                ..
            })
        ));
        assert!(scheduler.begin_frame().is_err());
        assert_eq!(scheduler.fence_value(), 0);
    }

    #[test]
    fn stale_slot_blocks_until_its_fence_completes() {
        let platform = SoftPlatform::new();
        let device = SoftDevice::new(&platform, "render").with_latency(Duration::from_millis(100));
        let mut scheduler = FrameScheduler::new(&device, 2, 64, 64, false, TIMEOUT).unwrap();
        let mut presenter = HeadlessPresenter::new();

        run_frame(&mut scheduler, &mut presenter);
        assert!(scheduler.would_block(0));
        assert!(!scheduler.would_block(1));
        run_frame(&mut scheduler, &mut presenter);

        assert_eq!(scheduler.begin_frame().unwrap(), 0);
        assert!(scheduler.fence().reached(1));
        assert!(!scheduler.would_block(0));
    }

    #[test]
    fn zero_slots_is_a_configuration_error() {
        let platform = SoftPlatform::new();
        let device = SoftDevice::new(&platform, "render");
        assert!(matches!(
            FrameScheduler::new(&device, 0, 64, 64, false, TIMEOUT),
            Err(PipelineError::Config(_))
        ));
    }
}
