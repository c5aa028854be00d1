// ============================================================================
// lib.rs — particle-sync
// Fence-ordered synchronization between an asynchronous particle producer and
// a render consumer, on one adapter or across two.
// ============================================================================

pub mod bridge;
pub mod camera;
pub mod config;
pub mod copy;
pub mod device;
pub mod error;
pub mod exchange;
pub mod fence;
pub mod frame;
pub mod gpu;
pub mod headless;
pub mod particles;
pub mod pipeline;
pub mod renderer;
pub mod soft;

pub use bridge::{CrossAdapterSyncBridge, SharedHandles};
pub use config::RenderConfig;
pub use device::{AdapterShared, CommandQueue, Device};
pub use error::{ErrorClass, PipelineError, PipelineResult};
pub use exchange::BufferExchange;
pub use fence::{wait_all, wait_any, Fence, WaitHandle};
pub use frame::{FrameScheduler, FrameState, HeadlessPresenter, Presenter, FRAME_COUNT};
pub use particles::{Particle, ParticleSimulation, ParticleSource};
pub use renderer::Render;
