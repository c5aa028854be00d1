// ============================================================================
// config.rs — particle-sync
// Renderer construction parameters, JSON loading, and validation.
// ============================================================================

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::frame::FRAME_COUNT;

/// Largest frame ring the scheduler accepts.
pub const MAX_FRAME_COUNT: usize = 4;

/// Which physical adapter the renderer opens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterSelection {
    #[default]
    HighPerformance,
    LowPower,
    /// Position in the platform's adapter enumeration.
    Index(usize),
    /// First adapter whose name contains this string.
    Name(String),
}

/// Optional features the caller asks for. Unsupported ones degrade with a
/// warning rather than failing construction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Create queues through the vendor max-performance extension.
    pub max_performance_queue: bool,
    /// Expect a producer on another adapter.
    pub cross_adapter: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowRect {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 1280,
            height: 720,
        }
    }
}

/// Everything a renderer needs at construction. Immutable afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Opaque native window/surface handle owned by the caller. Zero means
    /// offscreen.
    pub surface: u64,
    /// Particles each simulation or shared buffer can hold.
    pub particle_capacity: u32,
    pub adapter: AdapterSelection,
    pub features: FeatureFlags,
    pub fullscreen: bool,
    pub window: WindowRect,
    pub frame_count: usize,
    /// Bound on every blocking fence wait. Expiry is fatal.
    pub fence_timeout_ms: u64,
    pub particle_size: f32,
    pub particle_intensity: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            surface: 0,
            particle_capacity: 100_000,
            adapter: AdapterSelection::default(),
            features: FeatureFlags::default(),
            fullscreen: false,
            window: WindowRect::default(),
            frame_count: FRAME_COUNT,
            fence_timeout_ms: 5_000,
            particle_size: 0.01,
            particle_intensity: 1.0,
        }
    }
}

impl RenderConfig {
    /// Reads a JSON config. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        log::info!("Loaded render config from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.particle_capacity == 0 {
            return Err(PipelineError::Config("particle_capacity must be positive".into()));
        }
        if !(1..=MAX_FRAME_COUNT).contains(&self.frame_count) {
            return Err(PipelineError::Config(format!(
                "frame_count must be between 1 and {MAX_FRAME_COUNT}, got {}",
                self.frame_count
            )));
        }
        if self.fence_timeout_ms == 0 {
            return Err(PipelineError::Config("fence_timeout_ms must be positive".into()));
        }
        if self.window.width == 0 || self.window.height == 0 {
            return Err(PipelineError::Config(format!(
                "window must have a non-zero size, got {}x{}",
                self.window.width, self.window.height
            )));
        }
        if !(self.particle_size.is_finite() && self.particle_size > 0.0) {
            return Err(PipelineError::Config(format!(
                "particle_size must be positive, got {}",
                self.particle_size
            )));
        }
        Ok(())
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.window.width as f32 / self.window.height.max(1) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RenderConfig::default();
        config.validate().unwrap();
        assert_eq!(config.frame_count, 2);
        assert_eq!(config.fence_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: RenderConfig = serde_json::from_str(
            r#"{ "particle_capacity": 1000, "adapter": { "Index": 1 }, "features": { "cross_adapter": true } }"#,
        )
        .unwrap();
        assert_eq!(config.particle_capacity, 1000);
        assert_eq!(config.adapter, AdapterSelection::Index(1));
        assert!(config.features.cross_adapter);
        assert!(!config.features.max_performance_queue);
        assert_eq!(config.window, WindowRect::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let too_many_frames = RenderConfig {
            frame_count: 5,
            ..RenderConfig::default()
        };
        assert!(matches!(too_many_frames.validate(), Err(PipelineError::Config(_))));

        let empty = RenderConfig {
            particle_capacity: 0,
            ..RenderConfig::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn load_reads_json_from_disk() {
        let path = std::env::temp_dir()
            .join(format!("particle-sync-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "frame_count": 3, "particle_size": 0.02 }"#).unwrap();
        let config = RenderConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.frame_count, 3);
        assert_eq!(config.particle_size, 0.02);
    }
}
