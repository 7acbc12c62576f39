//! Mesh optimization and meshlet generation for the Prism engine.
//!
//! This crate turns raw vertex/index streams into GPU-friendly meshlets:
//! - Vertex deduplication (remap)
//! - Vertex cache, overdraw and vertex fetch optimization
//! - Greedy meshlet partitioning with per-meshlet reordering
//!
//! Everything here runs on the CPU at load time and has no GPU dependency.

pub mod cache;
pub mod error;
pub mod fetch;
pub mod meshlet;
pub mod overdraw;
pub mod remap;
pub mod vertex;

mod builder;

pub use builder::{build_meshlets, MeshletMesh, MeshletOptions};
pub use error::{MeshError, Result};
pub use meshlet::Meshlet;
pub use vertex::Vertex;

/// Engine-wide meshlet constants.
///
/// These must match the limits compiled into the task and mesh shaders.
pub mod constants {
    /// Maximum number of unique vertices referenced by one meshlet.
    pub const MAX_MESHLET_VERTICES: usize = 64;
    /// Maximum number of triangles emitted by one meshlet.
    pub const MAX_MESHLET_PRIMITIVES: usize = 124;
    /// Number of meshlets processed by one task shader workgroup.
    pub const MAX_MESHLETS_PER_TASK: u32 = 32;
    /// Default overdraw/vertex-cache trade-off (allow 5% extra cache misses).
    pub const DEFAULT_OVERDRAW_THRESHOLD: f32 = 1.05;
}
