//! Precompiled SPIR-V loading.

use crate::error::{RenderError, Result};
use std::path::{Path, PathBuf};

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// File names of the mesh pipeline stages inside the shader directory.
pub const TASK_SHADER: &str = "meshlet.task.spv";
pub const MESH_SHADER: &str = "meshlet.mesh.spv";
pub const FRAGMENT_SHADER: &str = "meshlet.frag.spv";

/// Convert little-endian bytes into SPIR-V words.
pub fn bytes_to_spirv(bytes: &[u8], label: &str) -> Result<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(RenderError::InvalidSpirv(format!(
            "{label}: length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    if words[0] != SPIRV_MAGIC {
        return Err(RenderError::InvalidSpirv(format!(
            "{label}: bad magic number {:#010x}",
            words[0]
        )));
    }
    Ok(words)
}

/// Read one SPIR-V file.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path).map_err(|source| RenderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    bytes_to_spirv(&bytes, &path.display().to_string())
}

/// SPIR-V for the three mesh pipeline stages.
#[derive(Debug, Clone)]
pub struct ShaderSet {
    pub task: Vec<u32>,
    pub mesh: Vec<u32>,
    pub fragment: Vec<u32>,
}

impl ShaderSet {
    /// Load all stages from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let set = Self {
            task: load_spirv(&dir.join(TASK_SHADER))?,
            mesh: load_spirv(&dir.join(MESH_SHADER))?,
            fragment: load_spirv(&dir.join(FRAGMENT_SHADER))?,
        };
        tracing::debug!("Loaded mesh pipeline shaders from {}", dir.display());
        Ok(set)
    }

    /// Paths the loader reads, for diagnostics.
    pub fn paths(dir: &Path) -> [PathBuf; 3] {
        [TASK_SHADER, MESH_SHADER, FRAGMENT_SHADER].map(|name| dir.join(name))
    }
}
