// ============================================================================
// error.rs — particle-sync
// Pipeline error type and its fatal / precondition / capability taxonomy.
// ============================================================================

use std::time::Duration;

use thiserror::Error;

use crate::device::SharedHandle;
use crate::frame::FrameState;

/// How the caller is expected to react to a [`PipelineError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Device loss or failed submission. The pipeline is unusable; abort or
    /// rebuild it from scratch.
    Fatal,
    /// The caller passed something invalid. Nothing was submitted.
    Precondition,
    /// A platform or driver feature is missing. Detected at setup, the
    /// pipeline keeps running on its fallback path.
    CapabilityUnavailable,
}

/// Every error the synchronization pipeline reports.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The device owning the fence was lost while a wait was pending.
    #[error("device lost while waiting on fence '{fence}' for {awaited} (completed {completed})")]
    DeviceLost {
        fence: String,
        awaited: u64,
        completed: u64,
    },

    /// A fence wait expired. Treated as device loss, never retried.
    #[error("fence '{fence}' did not reach {awaited} within {timeout:?} (completed {completed})")]
    FenceTimeout {
        fence: String,
        awaited: u64,
        completed: u64,
        timeout: Duration,
    },

    /// A queue refused or failed a submission.
    #[error("submission to queue '{queue}' failed: {reason}")]
    Submission { queue: String, reason: String },

    /// No adapter matched the requested selection.
    #[error("no suitable adapter: {0}")]
    NoSuitableAdapter(String),

    /// More particles were requested for copy than the buffers hold.
    #[error("copy of {requested} particles exceeds buffer capacity of {capacity}")]
    BufferOverrun { requested: u32, capacity: u32 },

    /// A particle count is invalid for a reason other than a copy overrun.
    #[error("invalid particle count: {0}")]
    InvalidParticleCount(String),

    /// A fence signal was requested at a value not above the last request.
    #[error("fence '{fence}' cannot be signaled to {requested}: already requested {current}")]
    FenceRegression {
        fence: String,
        requested: u64,
        current: u64,
    },

    /// A frame slot operation was called out of order.
    #[error("frame slot {index} is {actual:?}, expected {expected:?}")]
    InvalidFrameState {
        index: usize,
        expected: FrameState,
        actual: FrameState,
    },

    /// A shared handle does not name a live shared object.
    #[error("shared handle {0:?} does not refer to a shared object")]
    InvalidSharedHandle(SharedHandle),

    /// Cross-adapter sharing or a vendor queue extension is unsupported.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::DeviceLost { .. }
            | PipelineError::FenceTimeout { .. }
            | PipelineError::Submission { .. }
            | PipelineError::NoSuitableAdapter(_) => ErrorClass::Fatal,
            PipelineError::CapabilityUnavailable(_) => ErrorClass::CapabilityUnavailable,
            PipelineError::BufferOverrun { .. }
            | PipelineError::InvalidParticleCount(_)
            | PipelineError::FenceRegression { .. }
            | PipelineError::InvalidFrameState { .. }
            | PipelineError::InvalidSharedHandle(_)
            | PipelineError::Config(_)
            | PipelineError::Io(_)
            | PipelineError::Json(_) => ErrorClass::Precondition,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

/// Result alias used throughout the crate.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_device_loss_are_distinct_but_both_fatal() {
        let lost = PipelineError::DeviceLost {
            fence: "render".into(),
            awaited: 4,
            completed: 3,
        };
        let expired = PipelineError::FenceTimeout {
            fence: "render".into(),
            awaited: 4,
            completed: 3,
            timeout: Duration::from_millis(10),
        };
        assert!(lost.is_fatal());
        assert!(expired.is_fatal());
        assert!(!matches!(expired, PipelineError::DeviceLost { .. }));
    }

    #[test]
    fn overrun_is_a_precondition_violation() {
        let err = PipelineError::BufferOverrun {
            requested: 1500,
            capacity: 1000,
        };
        assert_eq!(err.class(), ErrorClass::Precondition);
        assert_eq!(
            err.to_string(),
            "copy of 1500 particles exceeds buffer capacity of 1000"
        );
    }

    #[test]
    fn missing_sharing_degrades_instead_of_failing() {
        let err = PipelineError::CapabilityUnavailable("shared handles".into());
        assert_eq!(err.class(), ErrorClass::CapabilityUnavailable);
        assert!(!err.is_fatal());
    }
}
