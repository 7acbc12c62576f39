//! Camera and view management.

use bitflags::bitflags;
use glam::{Mat4, Vec3};

/// Pitch is kept inside this range (degrees) to avoid gimbal flip.
pub const PITCH_LIMIT: f32 = 89.0;

/// Scale applied to raw cursor deltas before sensitivity.
const LOOK_SCALE: f32 = 0.1;

/// Scale applied to scroll wheel steps.
const DOLLY_SCALE: f32 = 0.1;

bitflags! {
    /// Directions the camera is currently moving in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CameraMovement: u8 {
        const FORWARD = 1 << 0;
        const BACKWARD = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
        const UP = 1 << 4;
        const DOWN = 1 << 5;
    }
}

/// Yaw and pitch in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rotator {
    pub yaw: f32,
    pub pitch: f32,
}

impl Default for Rotator {
    fn default() -> Self {
        Self {
            yaw: -90.0,
            pitch: 0.0,
        }
    }
}

impl Rotator {
    /// Unit view direction.
    pub fn front(&self) -> Vec3 {
        let (yaw, pitch) = (self.yaw.to_radians(), self.pitch.to_radians());
        Vec3::new(yaw.cos() * pitch.cos(), pitch.sin(), yaw.sin() * pitch.cos()).normalize()
    }

    pub fn right(&self) -> Vec3 {
        self.front().cross(Vec3::Y).normalize()
    }

    pub fn up(&self) -> Vec3 {
        self.right().cross(self.front()).normalize()
    }
}

/// Free-flying perspective camera.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub rotation: Rotator,
    /// Vertical field of view in degrees.
    pub fov: f32,
    pub near: f32,
    pub far: f32,
    /// Units per second.
    pub speed: f32,
    pub sensitivity: f32,
    pub movement: CameraMovement,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 3.0),
            rotation: Rotator::default(),
            fov: 45.0,
            near: 0.1,
            far: 1000.0,
            speed: 1.0,
            sensitivity: 1.0,
            movement: CameraMovement::empty(),
        }
    }
}

impl Camera {
    pub fn front(&self) -> Vec3 {
        self.rotation.front()
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.front(), Vec3::Y)
    }

    /// Perspective projection with Vulkan's downward clip-space Y.
    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        let mut projection = Mat4::perspective_rh(self.fov.to_radians(), aspect, self.near, self.far);
        projection.y_axis.y *= -1.0;
        projection
    }

    pub fn view_projection(&self, aspect: f32) -> Mat4 {
        self.projection_matrix(aspect) * self.view_matrix()
    }

    /// Turn by a cursor delta in pixels. Moving the cursor up looks up.
    pub fn rotate(&mut self, delta_x: f32, delta_y: f32) {
        let scale = self.sensitivity * LOOK_SCALE;
        self.rotation.yaw += delta_x * scale;
        self.rotation.pitch = (self.rotation.pitch - delta_y * scale).clamp(-PITCH_LIMIT, PITCH_LIMIT);
    }

    /// Move along the view direction by scroll wheel steps.
    pub fn dolly(&mut self, steps: f32) {
        self.position += self.front() * steps * DOLLY_SCALE;
    }

    /// Advance the position by the active movement flags.
    pub fn update(&mut self, delta_seconds: f32) {
        if self.movement.is_empty() {
            return;
        }
        let front = self.front();
        let right = self.rotation.right();
        let up = self.rotation.up();

        let mut direction = Vec3::ZERO;
        for (flag, axis) in [
            (CameraMovement::FORWARD, front),
            (CameraMovement::BACKWARD, -front),
            (CameraMovement::RIGHT, right),
            (CameraMovement::LEFT, -right),
            (CameraMovement::UP, up),
            (CameraMovement::DOWN, -up),
        ] {
            if self.movement.contains(flag) {
                direction += axis;
            }
        }

        self.position += direction * self.speed * delta_seconds;
    }
}

/// Per-frame scene uniform block.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SceneUniforms {
    pub projection_view: [[f32; 4]; 4],
    pub camera_position: [f32; 4],
}

impl SceneUniforms {
    pub fn new(camera: &Camera, aspect: f32) -> Self {
        Self {
            projection_view: camera.view_projection(aspect).to_cols_array_2d(),
            camera_position: camera.position.extend(1.0).to_array(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn default_looks_down_negative_z() {
        let camera = Camera::default();
        let front = camera.front();
        assert_relative_eq!(front.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(front.y, 0.0, epsilon = 1e-6);
        assert_relative_eq!(front.z, -1.0, epsilon = 1e-6);
    }

    #[test]
    fn pitch_is_clamped() {
        let mut camera = Camera::default();
        camera.rotate(0.0, -10_000.0);
        assert_relative_eq!(camera.rotation.pitch, PITCH_LIMIT);
        camera.rotate(0.0, 10_000.0);
        assert_relative_eq!(camera.rotation.pitch, -PITCH_LIMIT);
    }

    #[test]
    fn rotation_uses_sensitivity() {
        let mut camera = Camera {
            sensitivity: 2.0,
            ..Default::default()
        };
        camera.rotate(10.0, 0.0);
        assert_relative_eq!(camera.rotation.yaw, -88.0);
    }

    #[test]
    fn dolly_moves_along_front() {
        let mut camera = Camera::default();
        camera.dolly(10.0);
        assert_relative_eq!(camera.position.z, 2.0, epsilon = 1e-5);
    }

    #[test]
    fn movement_flags_translate() {
        let mut camera = Camera {
            speed: 2.0,
            movement: CameraMovement::FORWARD | CameraMovement::RIGHT,
            ..Default::default()
        };
        camera.update(0.5);
        assert_relative_eq!(camera.position.x, 1.0, epsilon = 1e-5);
        assert_relative_eq!(camera.position.z, 2.0, epsilon = 1e-5);

        camera.movement = CameraMovement::FORWARD | CameraMovement::BACKWARD;
        let before = camera.position;
        camera.update(1.0);
        assert_relative_eq!(camera.position.distance(before), 0.0, epsilon = 1e-5);
    }

    #[test]
    fn projection_flips_y() {
        let camera = Camera::default();
        let projection = camera.projection_matrix(1.0);
        assert!(projection.y_axis.y < 0.0);
    }

    #[test]
    fn scene_uniforms_carry_position() {
        let camera = Camera::default();
        let uniforms = SceneUniforms::new(&camera, 16.0 / 9.0);
        assert_eq!(uniforms.camera_position, [0.0, 0.0, 3.0, 1.0]);
    }
}
