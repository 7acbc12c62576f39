//! Render errors.

use prism_gpu::GpuError;
use prism_mesh::MeshError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading objects or recording frames.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    /// Model or texture could not be decoded.
    #[error("Failed to import {path}: {reason}")]
    Import { path: PathBuf, reason: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// SPIR-V blob is malformed.
    #[error("Invalid SPIR-V in {0}")]
    InvalidSpirv(String),

    /// Every descriptor slot is taken.
    #[error("Object capacity of {0} reached")]
    CapacityReached(u32),
}

impl RenderError {
    pub(crate) fn import(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Import {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RenderError>;
