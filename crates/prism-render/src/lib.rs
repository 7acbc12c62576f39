//! Scene and frame recording for the Prism engine.
//!
//! This crate provides:
//! - Model and texture import behind [`ModelImporter`]
//! - Object load/unload with per-object GPU resources and descriptors
//! - Camera and scene uniforms
//! - Mesh-task command recording, optionally into offscreen viewport images
//! - Precompiled SPIR-V loading

pub mod camera;
pub mod draw;
pub mod error;
pub mod import;
pub mod scene;
pub mod shader;
pub mod viewport;

pub use camera::{Camera, CameraMovement, Rotator, SceneUniforms};
pub use draw::{task_count, ColorTarget, DrawPushConstants, FrameTarget, MeshRenderer};
pub use error::{RenderError, Result};
pub use import::{ImportedModel, ModelImporter, ObjImporter, TextureData};
pub use scene::{
    MaterialData, ObjectAllocation, ObjectId, ObjectRegistry, Scene, SceneConfig, Transform,
};
pub use viewport::ViewportTargets;
pub use shader::ShaderSet;
