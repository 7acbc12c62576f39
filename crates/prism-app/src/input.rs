//! Window input to camera control translation.
//!
//! Movement keys and mouse look only act while the right mouse button is
//! held; the cursor is hidden and grabbed for that time.

use prism_render::{Camera, CameraMovement};
use winit::event::{DeviceEvent, ElementState, MouseButton, MouseScrollDelta, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{CursorGrabMode, Window};

/// Pixels that count as one scroll line for touchpads.
const PIXELS_PER_SCROLL_LINE: f64 = 40.0;

/// Camera movement bound to a key.
pub const fn movement_for_key(key: KeyCode) -> Option<CameraMovement> {
    match key {
        KeyCode::KeyW => Some(CameraMovement::FORWARD),
        KeyCode::KeyS => Some(CameraMovement::BACKWARD),
        KeyCode::KeyA => Some(CameraMovement::LEFT),
        KeyCode::KeyD => Some(CameraMovement::RIGHT),
        KeyCode::KeyQ => Some(CameraMovement::DOWN),
        KeyCode::KeyE | KeyCode::Space => Some(CameraMovement::UP),
        _ => None,
    }
}

/// Scroll amount in lines.
pub fn scroll_lines(delta: MouseScrollDelta) -> f32 {
    match delta {
        MouseScrollDelta::LineDelta(_, y) => y,
        MouseScrollDelta::PixelDelta(position) => (position.y / PIXELS_PER_SCROLL_LINE) as f32,
    }
}

/// Change to apply to the cursor after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorChange {
    Grab,
    Release,
}

/// Tracks the look button and feeds events into a [`Camera`].
#[derive(Debug, Default)]
pub struct CameraController {
    looking: bool,
}

impl CameraController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the right mouse button is held.
    pub const fn is_looking(&self) -> bool {
        self.looking
    }

    /// Movement keys only act while looking. Releasing the look button
    /// clears them.
    pub fn key(&self, camera: &mut Camera, key: KeyCode, pressed: bool) {
        if !self.looking {
            return;
        }
        if let Some(flag) = movement_for_key(key) {
            camera.movement.set(flag, pressed);
        }
    }

    pub fn mouse_button(
        &mut self,
        camera: &mut Camera,
        button: MouseButton,
        pressed: bool,
    ) -> Option<CursorChange> {
        if button != MouseButton::Right || pressed == self.looking {
            return None;
        }
        self.looking = pressed;
        if pressed {
            Some(CursorChange::Grab)
        } else {
            camera.movement = CameraMovement::empty();
            Some(CursorChange::Release)
        }
    }

    /// Raw mouse motion in pixels.
    pub fn mouse_motion(&self, camera: &mut Camera, delta_x: f64, delta_y: f64) {
        if self.looking {
            camera.rotate(delta_x as f32, delta_y as f32);
        }
    }

    pub fn scroll(camera: &mut Camera, delta: MouseScrollDelta) {
        camera.dolly(scroll_lines(delta));
    }

    /// Apply a window event. Returns the cursor change it causes, if any.
    pub fn window_event(&mut self, camera: &mut Camera, event: &WindowEvent) -> Option<CursorChange> {
        match event {
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(code) = event.physical_key {
                    if !event.repeat {
                        self.key(camera, code, event.state == ElementState::Pressed);
                    }
                }
                None
            }
            WindowEvent::MouseInput { state, button, .. } => {
                self.mouse_button(camera, *button, *state == ElementState::Pressed)
            }
            WindowEvent::MouseWheel { delta, .. } => {
                Self::scroll(camera, *delta);
                None
            }
            WindowEvent::Focused(false) => {
                self.mouse_button(camera, MouseButton::Right, false)
            }
            _ => None,
        }
    }

    pub fn device_event(&self, camera: &mut Camera, event: &DeviceEvent) {
        if let DeviceEvent::MouseMotion { delta } = event {
            self.mouse_motion(camera, delta.0, delta.1);
        }
    }
}

/// Grab or release the cursor, falling back to confinement where locking
/// is unsupported.
pub fn apply_cursor_change(window: &Window, change: CursorChange) {
    match change {
        CursorChange::Grab => {
            if let Err(e) = window.set_cursor_grab(CursorGrabMode::Locked) {
                if let Err(e2) = window.set_cursor_grab(CursorGrabMode::Confined) {
                    tracing::warn!("Failed to grab cursor: {e}, {e2}");
                }
            }
            window.set_cursor_visible(false);
        }
        CursorChange::Release => {
            if let Err(e) = window.set_cursor_grab(CursorGrabMode::None) {
                tracing::warn!("Failed to release cursor: {e}");
            }
            window.set_cursor_visible(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winit::dpi::PhysicalPosition;

    #[test]
    fn keys_map_to_movement() {
        assert_eq!(movement_for_key(KeyCode::KeyW), Some(CameraMovement::FORWARD));
        assert_eq!(movement_for_key(KeyCode::KeyQ), Some(CameraMovement::DOWN));
        assert_eq!(movement_for_key(KeyCode::KeyE), Some(CameraMovement::UP));
        assert_eq!(movement_for_key(KeyCode::Space), Some(CameraMovement::UP));
        assert_eq!(movement_for_key(KeyCode::KeyZ), None);
    }

    #[test]
    fn movement_requires_look_button() {
        let mut camera = Camera::default();
        let mut controller = CameraController::new();

        controller.key(&mut camera, KeyCode::KeyW, true);
        assert!(camera.movement.is_empty());

        assert_eq!(
            controller.mouse_button(&mut camera, MouseButton::Right, true),
            Some(CursorChange::Grab)
        );
        controller.key(&mut camera, KeyCode::KeyW, true);
        controller.key(&mut camera, KeyCode::KeyD, true);
        assert_eq!(
            camera.movement,
            CameraMovement::FORWARD | CameraMovement::RIGHT
        );
        controller.key(&mut camera, KeyCode::KeyW, false);
        assert_eq!(camera.movement, CameraMovement::RIGHT);

        assert_eq!(
            controller.mouse_button(&mut camera, MouseButton::Right, false),
            Some(CursorChange::Release)
        );
        assert!(camera.movement.is_empty());
    }

    #[test]
    fn keys_while_not_looking_leave_movement_alone() {
        let mut camera = Camera::default();
        let controller = CameraController::new();
        camera.movement = CameraMovement::LEFT;

        controller.key(&mut camera, KeyCode::KeyW, true);
        controller.key(&mut camera, KeyCode::KeyA, false);
        assert_eq!(camera.movement, CameraMovement::LEFT);
    }

    #[test]
    fn other_buttons_are_ignored() {
        let mut camera = Camera::default();
        let mut controller = CameraController::new();
        assert_eq!(
            controller.mouse_button(&mut camera, MouseButton::Left, true),
            None
        );
        assert!(!controller.is_looking());
        assert_eq!(
            controller.mouse_button(&mut camera, MouseButton::Right, false),
            None
        );
    }

    #[test]
    fn look_only_while_held() {
        let mut camera = Camera::default();
        let mut controller = CameraController::new();
        controller.mouse_motion(&mut camera, 100.0, 0.0);
        assert!((camera.rotation.yaw + 90.0).abs() < 1e-5);

        controller.mouse_button(&mut camera, MouseButton::Right, true);
        controller.mouse_motion(&mut camera, 100.0, -5000.0);
        assert!((camera.rotation.yaw + 80.0).abs() < 1e-4);
        assert!((camera.rotation.pitch - 89.0).abs() < 1e-5);
    }

    #[test]
    fn scroll_dollies() {
        assert!((scroll_lines(MouseScrollDelta::LineDelta(0.0, 2.0)) - 2.0).abs() < f32::EPSILON);
        assert!(
            (scroll_lines(MouseScrollDelta::PixelDelta(PhysicalPosition::new(0.0, 80.0))) - 2.0)
                .abs()
                < f32::EPSILON
        );

        let mut camera = Camera::default();
        CameraController::scroll(&mut camera, MouseScrollDelta::LineDelta(0.0, 10.0));
        assert!((camera.position.z - 2.0).abs() < 1e-5);
    }
}
