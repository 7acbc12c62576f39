//! Model and texture import.
//!
//! Geometry comes from Wavefront OBJ files through `tobj`, textures through
//! `image`. Both sit behind [`ModelImporter`] so the scene never depends on a
//! file format.

use crate::error::{RenderError, Result};
use prism_mesh::Vertex;
use std::io::BufRead;
use std::path::Path;

/// Triangulated geometry of one model file, all shapes merged.
#[derive(Debug, Clone, Default)]
pub struct ImportedModel {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// Tightly packed RGBA8 pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl TextureData {
    /// Built-in 2x2 opaque white texture used when a texture cannot be read.
    pub fn placeholder() -> Self {
        Self {
            width: 2,
            height: 2,
            pixels: vec![u8::MAX; 2 * 2 * 4],
        }
    }

    /// Byte length the pixel data must have for the dimensions.
    pub const fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Decodes models and textures from paths.
pub trait ModelImporter {
    fn load_model(&self, path: &Path) -> Result<ImportedModel>;

    fn load_texture(&self, path: &Path) -> Result<TextureData>;
}

/// OBJ geometry and any image format the `image` crate decodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjImporter;

impl ObjImporter {
    /// Parse OBJ text, ignoring material libraries.
    pub fn parse<R: BufRead>(reader: &mut R, name: &str) -> Result<ImportedModel> {
        let (models, _) = tobj::load_obj_buf(
            reader,
            &tobj::LoadOptions {
                single_index: true,
                triangulate: true,
                ..Default::default()
            },
            |_| Ok(Default::default()),
        )
        .map_err(|e| RenderError::import(name, e))?;

        let mut imported = ImportedModel {
            name: name.to_string(),
            ..Default::default()
        };

        for model in &models {
            let mesh = &model.mesh;
            let base = imported.vertices.len() as u32;
            let vertex_count = mesh.positions.len() / 3;
            let has_normals = mesh.normals.len() == mesh.positions.len();
            let has_uvs = mesh.texcoords.len() / 2 == vertex_count;

            for i in 0..vertex_count {
                let position = [
                    mesh.positions[3 * i],
                    mesh.positions[3 * i + 1],
                    mesh.positions[3 * i + 2],
                ];
                let normal = if has_normals {
                    [
                        mesh.normals[3 * i],
                        mesh.normals[3 * i + 1],
                        mesh.normals[3 * i + 2],
                    ]
                } else {
                    [0.0; 3]
                };
                // OBJ has v pointing up; Vulkan samples top-down.
                let uv = if has_uvs {
                    [mesh.texcoords[2 * i], 1.0 - mesh.texcoords[2 * i + 1]]
                } else {
                    [0.0; 2]
                };
                imported.vertices.push(Vertex::new(position, normal, uv));
            }

            let first_index = imported.indices.len();
            imported
                .indices
                .extend(mesh.indices.iter().map(|&index| base + index));

            if !has_normals {
                generate_normals(&mut imported.vertices, &imported.indices[first_index..]);
            }
        }

        if imported.indices.is_empty() {
            return Err(RenderError::import(name, "no triangles"));
        }

        tracing::debug!(
            "Imported {}: {} shapes, {} vertices, {} triangles",
            name,
            models.len(),
            imported.vertices.len(),
            imported.indices.len() / 3
        );
        Ok(imported)
    }
}

impl ModelImporter for ObjImporter {
    fn load_model(&self, path: &Path) -> Result<ImportedModel> {
        let file = std::fs::File::open(path).map_err(|source| RenderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = std::io::BufReader::new(file);
        let name = path
            .file_stem()
            .map_or_else(|| path.display().to_string(), |s| s.to_string_lossy().into_owned());
        Self::parse(&mut reader, &name)
    }

    fn load_texture(&self, path: &Path) -> Result<TextureData> {
        let image = image::open(path)
            .map_err(|e| RenderError::import(path, e))?
            .to_rgba8();
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(RenderError::import(path, "empty image"));
        }
        Ok(TextureData {
            width,
            height,
            pixels: image.into_raw(),
        })
    }
}

/// Area-weighted vertex normals for the given triangles.
pub fn generate_normals(vertices: &mut [Vertex], indices: &[u32]) {
    use glam::Vec3;

    let mut accumulated = vec![Vec3::ZERO; vertices.len()];
    for triangle in indices.chunks_exact(3) {
        let [a, b, c] = [triangle[0], triangle[1], triangle[2]].map(|i| i as usize);
        if a >= vertices.len() || b >= vertices.len() || c >= vertices.len() {
            continue;
        }
        let pa = Vec3::from(vertices[a].position);
        let pb = Vec3::from(vertices[b].position);
        let pc = Vec3::from(vertices[c].position);
        let face = (pb - pa).cross(pc - pa);
        for i in [a, b, c] {
            accumulated[i] += face;
        }
    }

    for (vertex, normal) in vertices.iter_mut().zip(accumulated) {
        if normal != Vec3::ZERO {
            vertex.normal = normal.normalize().to_array();
        }
    }
}
