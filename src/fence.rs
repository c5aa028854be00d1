// ============================================================================
// fence.rs — particle-sync
// Monotonic completion counters and the wait handles returned to callers.
// ============================================================================

//! A [`Fence`] is the only primitive that orders work between the producer,
//! copy, and render stages. Queues raise it after the work submitted before
//! the signal completes; any thread or other queue waits for `value >= target`.
//!
//! ```text
//!   compute queue ──signal(F)──▶ [compute fence] ◀──wait(F)── copy queue
//!   copy queue    ──signal(C)──▶ [copy fence]    ◀──wait(C)── render queue
//!   render queue  ──signal(R)──▶ [render fence]  ◀──wait(R)── caller / producer
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::device::CommandQueue;
use crate::error::{PipelineError, PipelineResult};

/// Longest sleep between progress polls while waiting.
const WAIT_SLICE: Duration = Duration::from_millis(1);

type ProgressHook = Box<dyn Fn() + Send + Sync>;

struct FenceInner {
    label: String,
    completed: AtomicU64,
    requested: AtomicU64,
    lost: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
    progress: Option<ProgressHook>,
}

/// Monotonically increasing completion counter shared between stages.
///
/// Cloning a fence yields another reference to the same counter, which is
/// how imported (cross-adapter) fences observe the exporter's progress.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    pub fn new(label: &str) -> Self {
        Self::build(label, None)
    }

    /// Creates a fence whose waits call `progress` between checks. Backends
    /// that only deliver completions while being polled install one.
    pub fn with_progress(label: &str, progress: impl Fn() + Send + Sync + 'static) -> Self {
        Self::build(label, Some(Box::new(progress)))
    }

    fn build(label: &str, progress: Option<ProgressHook>) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                label: label.to_owned(),
                completed: AtomicU64::new(0),
                requested: AtomicU64::new(0),
                lost: AtomicBool::new(false),
                lock: Mutex::new(()),
                cond: Condvar::new(),
                progress,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Highest value the fence has reached.
    pub fn completed_value(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Highest value a queue has been asked to signal.
    pub fn requested_value(&self) -> u64 {
        self.inner.requested.load(Ordering::Acquire)
    }

    /// Non-blocking check for `completed >= value`.
    pub fn reached(&self, value: u64) -> bool {
        if self.completed_value() >= value {
            return true;
        }
        self.poll_progress();
        self.completed_value() >= value
    }

    /// Asks `queue` to raise this fence to `value` once everything submitted
    /// to it so far has finished.
    pub fn signal<Q: CommandQueue>(&self, queue: &Q, value: u64) -> PipelineResult<()> {
        let current = self.requested_value();
        if value <= current {
            return Err(PipelineError::FenceRegression {
                fence: self.inner.label.clone(),
                requested: value,
                current,
            });
        }
        self.inner.requested.store(value, Ordering::Release);
        log::trace!("{}: signal {} on queue '{}'", self.inner.label, value, queue.label());
        queue.signal(self, value)
    }

    /// Records completion up to `value`. Called by queue backends; a lower
    /// value than the current one is ignored so the counter never decreases.
    pub fn complete(&self, value: u64) {
        let previous = self.inner.completed.fetch_max(value, Ordering::AcqRel);
        if value > previous {
            let _guard = self.inner.lock.lock();
            self.inner.cond.notify_all();
        }
    }

    /// Flags the owning device as lost. Pending and future waits that are not
    /// already satisfied fail with [`PipelineError::DeviceLost`].
    pub fn mark_lost(&self) {
        self.inner.lost.store(true, Ordering::Release);
        let _guard = self.inner.lock.lock();
        self.inner.cond.notify_all();
    }

    pub fn is_lost(&self) -> bool {
        self.inner.lost.load(Ordering::Acquire)
    }

    /// Blocks until the fence reaches `value`.
    ///
    /// Returns [`PipelineError::DeviceLost`] if the device is lost first and
    /// [`PipelineError::FenceTimeout`] once `timeout` expires.
    pub fn wait_until(&self, value: u64, timeout: Duration) -> PipelineResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.reached(value) {
                return Ok(());
            }
            if self.is_lost() {
                log::error!("{}: device lost while waiting for {}", self.inner.label, value);
                return Err(self.lost_error(value));
            }
            let now = Instant::now();
            if now >= deadline {
                log::error!(
                    "{}: wait for {} expired after {:?} (completed {})",
                    self.inner.label,
                    value,
                    timeout,
                    self.completed_value()
                );
                return Err(PipelineError::FenceTimeout {
                    fence: self.inner.label.clone(),
                    awaited: value,
                    completed: self.completed_value(),
                    timeout,
                });
            }

            let mut slice = deadline - now;
            if self.inner.progress.is_some() {
                slice = slice.min(WAIT_SLICE);
            }
            let mut guard = self.inner.lock.lock();
            if self.completed_value() < value && !self.is_lost() {
                self.inner.cond.wait_for(&mut guard, slice);
            }
        }
    }

    /// Completion token for `value`.
    pub fn handle(&self, value: u64) -> WaitHandle {
        WaitHandle {
            fence: self.clone(),
            value,
        }
    }

    /// True when both fences are the same counter.
    pub fn same_as(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Reference that does not keep the counter alive.
    pub fn downgrade(&self) -> WeakFence {
        WeakFence {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn poll_progress(&self) {
        if let Some(progress) = &self.inner.progress {
            progress();
        }
    }

    fn lost_error(&self, value: u64) -> PipelineError {
        PipelineError::DeviceLost {
            fence: self.inner.label.clone(),
            awaited: value,
            completed: self.completed_value(),
        }
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("label", &self.inner.label)
            .field("completed", &self.completed_value())
            .field("requested", &self.requested_value())
            .field("lost", &self.is_lost())
            .finish()
    }
}

/// Non-owning fence reference, held by device and handle tables.
#[derive(Clone)]
pub struct WeakFence {
    inner: Weak<FenceInner>,
}

impl WeakFence {
    pub fn upgrade(&self) -> Option<Fence> {
        self.inner.upgrade().map(|inner| Fence { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

// ======================== Wait Handles ========================

/// Completion token for one fence value.
///
/// Returned by `Render::draw`; callers may poll it, block on it, or batch it
/// with others through [`wait_all`] / [`wait_any`].
#[derive(Clone, Debug)]
pub struct WaitHandle {
    fence: Fence,
    value: u64,
}

impl WaitHandle {
    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    pub fn is_complete(&self) -> bool {
        self.fence.reached(self.value)
    }

    pub fn wait(&self, timeout: Duration) -> PipelineResult<()> {
        self.fence.wait_until(self.value, timeout)
    }
}

/// Blocks until every handle completes. The timeout bounds the whole batch.
pub fn wait_all(handles: &[WaitHandle], timeout: Duration) -> PipelineResult<()> {
    let deadline = Instant::now() + timeout;
    for handle in handles {
        let remaining = deadline.saturating_duration_since(Instant::now());
        handle.wait(remaining)?;
    }
    Ok(())
}

/// Blocks until at least one handle completes and returns its index.
pub fn wait_any(handles: &[WaitHandle], timeout: Duration) -> PipelineResult<usize> {
    if handles.is_empty() {
        return Err(PipelineError::Config("wait_any called with no handles".into()));
    }
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(index) = handles.iter().position(WaitHandle::is_complete) {
            return Ok(index);
        }
        if let Some(lost) = handles.iter().find(|h| h.fence.is_lost()) {
            return Err(lost.fence.lost_error(lost.value));
        }
        let now = Instant::now();
        if now >= deadline {
            let first = &handles[0];
            return Err(PipelineError::FenceTimeout {
                fence: first.fence.label().to_owned(),
                awaited: first.value,
                completed: first.fence.completed_value(),
                timeout,
            });
        }
        // Sleep on the first fence; completions elsewhere are picked up on
        // the next slice.
        let first = &handles[0].fence;
        let mut guard = first.inner.lock.lock();
        if first.completed_value() < handles[0].value && !first.is_lost() {
            first.inner.cond.wait_for(&mut guard, (deadline - now).min(WAIT_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn completion_never_decreases() {
        let fence = Fence::new("compute");
        fence.complete(5);
        fence.complete(3);
        assert_eq!(fence.completed_value(), 5);
        assert!(fence.reached(5));
        assert!(!fence.reached(6));
    }

    #[test]
    fn signal_requests_must_increase() {
        use crate::device::{Device, QueueDesc, QueueKind};
        use crate::soft::{SoftDevice, SoftPlatform};

        let platform = SoftPlatform::new();
        let device = SoftDevice::new(&platform, "soft");
        let queue = device
            .create_queue(&QueueDesc {
                label: "compute".into(),
                kind: QueueKind::Compute,
                max_performance: false,
                fence_timeout: Duration::from_secs(5),
            })
            .unwrap();
        let fence = device.create_fence("compute");

        fence.signal(&queue, 4).unwrap();
        for stale in [4, 2] {
            let err = fence.signal(&queue, stale).unwrap_err();
            match &err {
                PipelineError::FenceRegression {
                    requested, current, ..
                } => {
                    assert_eq!(*requested, stale);
                    assert_eq!(*current, 4);
                }
                other => panic!("unexpected error: {other}"),
            }
            assert!(!err.is_fatal());
            assert_eq!(fence.requested_value(), 4);
        }

        fence.wait_until(4, Duration::from_secs(5)).unwrap();
        assert_eq!(fence.completed_value(), 4);
    }

    #[test]
    fn weak_reference_does_not_keep_the_fence_alive() {
        let fence = Fence::new("short_lived");
        let weak = fence.downgrade();
        assert!(weak.upgrade().is_some_and(|f| f.same_as(&fence)));
        drop(fence);
        assert!(!weak.is_alive());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn wait_wakes_on_completion_from_another_thread() {
        let fence = Fence::new("copy");
        let signaler = fence.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaler.complete(2);
        });
        fence.wait_until(2, Duration::from_secs(5)).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn expired_wait_reports_timeout() {
        let fence = Fence::new("render");
        fence.complete(1);
        let err = fence.wait_until(2, Duration::from_millis(10)).unwrap_err();
        match err {
            PipelineError::FenceTimeout {
                awaited, completed, ..
            } => {
                assert_eq!(awaited, 2);
                assert_eq!(completed, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn lost_fence_fails_waits_immediately() {
        let fence = Fence::new("render");
        fence.mark_lost();
        let err = fence.wait_until(1, Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, PipelineError::DeviceLost { .. }));
        // Values already reached still succeed.
        assert!(fence.wait_until(0, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn progress_hook_drives_completion() {
        let slot: Arc<std::sync::OnceLock<Fence>> = Arc::new(std::sync::OnceLock::new());
        let hook_slot = Arc::clone(&slot);
        let fence = Fence::with_progress("polled", move || {
            if let Some(fence) = hook_slot.get() {
                fence.complete(3);
            }
        });
        slot.set(fence.clone()).unwrap();
        fence.wait_until(3, Duration::from_secs(1)).unwrap();
        assert_eq!(fence.completed_value(), 3);
    }

    #[test]
    fn batch_waits() {
        let a = Fence::new("a");
        let b = Fence::new("b");
        b.complete(7);
        let handles = [a.handle(1), b.handle(7)];
        assert_eq!(wait_any(&handles, Duration::from_secs(1)).unwrap(), 1);
        assert!(wait_all(&handles, Duration::from_millis(5)).is_err());
        a.complete(1);
        wait_all(&handles, Duration::from_secs(1)).unwrap();
    }
}
