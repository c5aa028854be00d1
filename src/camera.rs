// ============================================================================
// camera.rs — particle-sync
// Top-down camera state and the per-draw constants handed to the render pass.
// ============================================================================

/// Per-draw constants uploaded alongside every particle draw.
///
/// Matrices are column-major, one inner array per column, matching WGSL's
/// `mat4x4<f32>` layout.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FrameConstants {
    pub world_view_projection: [[f32; 4]; 4],
    /// Rotates view-space sprite corners back into world space.
    pub inverse_view: [[f32; 4]; 4],
    pub particle_size: f32,
    pub particle_intensity: f32,
    pub _pad: [f32; 2],
}

const IDENTITY: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

impl Default for FrameConstants {
    fn default() -> Self {
        Self {
            world_view_projection: IDENTITY,
            inverse_view: IDENTITY,
            particle_size: 1.0,
            particle_intensity: 1.0,
            _pad: [0.0; 2],
        }
    }
}

impl FrameConstants {
    /// Applies the world-view-projection matrix to a point.
    pub fn project(&self, point: [f32; 4]) -> [f32; 4] {
        mul(&self.world_view_projection, point)
    }
}

fn mul(m: &[[f32; 4]; 4], v: [f32; 4]) -> [f32; 4] {
    let mut out = [0.0; 4];
    for (col, &scale) in m.iter().zip(v.iter()) {
        for (o, c) in out.iter_mut().zip(col.iter()) {
            *o += c * scale;
        }
    }
    out
}

/// CPU-side camera state. The camera looks straight down the y axis at the
/// particle disc; `offset` pans across the xz plane.
pub struct CameraState {
    pub offset: [f32; 2],
    pub zoom: f32,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            offset: [0.0, 0.0],
            zoom: 1.0,
        }
    }
}

impl CameraState {
    /// Pan in screen units. Speed is inversely proportional to zoom so
    /// movement feels consistent on screen.
    pub fn pan(&mut self, dx: f32, dy: f32) {
        self.offset[0] += dx / self.zoom;
        self.offset[1] += dy / self.zoom;
    }

    pub fn apply_scroll(&mut self, scroll_y: f32) {
        self.zoom *= 1.0 + scroll_y * 0.1;
        self.zoom = self.zoom.clamp(0.1, 50.0);
    }

    /// Builds the draw constants for a target with the given aspect ratio.
    pub fn constants(
        &self,
        aspect: f32,
        particle_size: f32,
        particle_intensity: f32,
    ) -> FrameConstants {
        let sx = self.zoom / aspect.max(f32::EPSILON);
        let sy = self.zoom;
        // world (x, y, z) -> view (x, z, y): a pure axis swap, so it is its
        // own inverse.
        let swap_yz = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        FrameConstants {
            world_view_projection: [
                [sx, 0.0, 0.0, 0.0],
                [0.0, 0.0, 0.25, 0.0],
                [0.0, sy, 0.0, 0.0],
                [-sx * self.offset[0], -sy * self.offset[1], 0.5, 1.0],
            ],
            inverse_view: swap_yz,
            particle_size,
            particle_intensity,
            _pad: [0.0; 2],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_match_the_shader_uniform_size() {
        assert_eq!(std::mem::size_of::<FrameConstants>(), 144);
    }

    #[test]
    fn disc_edge_lands_on_clip_edge() {
        let camera = CameraState::default();
        let c = camera.constants(2.0, 0.01, 1.0);
        assert_eq!(c.project([0.0, 0.0, 1.0, 1.0]), [0.0, 1.0, 0.5, 1.0]);
        assert_eq!(c.project([1.0, 0.0, 0.0, 1.0]), [0.5, 0.0, 0.5, 1.0]);
        assert_eq!(c.particle_size, 0.01);
    }

    #[test]
    fn pan_recenters_and_scroll_is_clamped() {
        let mut camera = CameraState::default();
        camera.pan(0.5, 0.0);
        let c = camera.constants(1.0, 1.0, 1.0);
        assert_eq!(c.project([0.5, 0.0, 0.0, 1.0])[0], 0.0);

        for _ in 0..200 {
            camera.apply_scroll(1.0);
        }
        assert_eq!(camera.zoom, 50.0);
    }
}
