//! Mesh processing errors.

use thiserror::Error;

/// Errors produced while optimizing geometry or building meshlets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// The mesh has no vertices or no indices.
    #[error("Mesh has no geometry")]
    EmptyGeometry,

    /// The index count does not describe a whole number of triangles.
    #[error("Index count {0} is not a multiple of 3")]
    IncompleteTriangles(usize),

    /// An index references a vertex that does not exist.
    #[error("Index {index} out of range for {vertex_count} vertices")]
    IndexOutOfRange { index: u32, vertex_count: usize },

    /// Meshlet limits are outside of what the packed format can represent.
    #[error("Invalid meshlet options: {0}")]
    InvalidOptions(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, MeshError>;
