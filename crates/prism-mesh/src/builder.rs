//! Full geometry optimization pipeline.

use crate::cache::optimize_vertex_cache;
use crate::constants::{DEFAULT_OVERDRAW_THRESHOLD, MAX_MESHLET_PRIMITIVES, MAX_MESHLET_VERTICES};
use crate::error::{MeshError, Result};
use crate::fetch::optimize_vertex_fetch;
use crate::meshlet::{build_meshlets_scan, optimize_meshlet, Meshlet};
use crate::overdraw::optimize_overdraw;
use crate::remap::{generate_vertex_remap, remap_index_buffer, remap_vertex_buffer};
use crate::vertex::Vertex;

/// Meshlet generation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshletOptions {
    /// Maximum unique vertices per meshlet (at most 255).
    pub max_vertices: usize,
    /// Maximum triangles per meshlet (multiple of 4).
    pub max_triangles: usize,
    /// Allowed vertex cache miss increase when optimizing for overdraw.
    pub overdraw_threshold: f32,
}

impl Default for MeshletOptions {
    fn default() -> Self {
        Self {
            max_vertices: MAX_MESHLET_VERTICES,
            max_triangles: MAX_MESHLET_PRIMITIVES,
            overdraw_threshold: DEFAULT_OVERDRAW_THRESHOLD,
        }
    }
}

impl MeshletOptions {
    fn validate(&self) -> Result<()> {
        if !(3..=255).contains(&self.max_vertices) {
            return Err(MeshError::InvalidOptions(format!(
                "max_vertices must be in 3..=255, got {}",
                self.max_vertices
            )));
        }
        if self.max_triangles == 0 || self.max_triangles > 512 || self.max_triangles % 4 != 0 {
            return Err(MeshError::InvalidOptions(format!(
                "max_triangles must be a nonzero multiple of 4 up to 512, got {}",
                self.max_triangles
            )));
        }
        if self.overdraw_threshold.is_nan() || self.overdraw_threshold < 1.0 {
            return Err(MeshError::InvalidOptions(format!(
                "overdraw_threshold must be at least 1.0, got {}",
                self.overdraw_threshold
            )));
        }
        Ok(())
    }
}

/// Optimized geometry and its meshlet partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshletMesh {
    /// Deduplicated vertices in fetch order.
    pub vertices: Vec<Vertex>,
    /// Optimized triangle list indexing `vertices`.
    pub indices: Vec<u32>,
    /// Global vertex index for every local meshlet vertex.
    pub meshlet_vertices: Vec<u32>,
    /// Packed local triangle indices, each meshlet padded to 4 bytes.
    pub meshlet_triangles: Vec<u8>,
    /// Meshlet descriptors.
    pub meshlets: Vec<Meshlet>,
}

impl MeshletMesh {
    /// Number of meshlets.
    pub fn meshlet_count(&self) -> u32 {
        self.meshlets.len() as u32
    }

    /// Number of triangles covered by all meshlets.
    pub fn triangle_count(&self) -> usize {
        self.meshlets.iter().map(|m| m.triangle_count as usize).sum()
    }

    /// Triangles of one meshlet as global vertex indices.
    pub fn meshlet_triangles_global(&self, meshlet: &Meshlet) -> Vec<[u32; 3]> {
        let vertices = &self.meshlet_vertices[meshlet.vertex_offset as usize..]
            [..meshlet.vertex_count as usize];
        self.meshlet_triangles[meshlet.triangle_offset as usize..]
            [..meshlet.triangle_count as usize * 3]
            .chunks_exact(3)
            .map(|t| {
                [
                    vertices[t[0] as usize],
                    vertices[t[1] as usize],
                    vertices[t[2] as usize],
                ]
            })
            .collect()
    }
}

/// Convert raw vertex/index streams into optimized geometry and meshlets.
///
/// Runs, in order: vertex deduplication, vertex cache optimization,
/// overdraw optimization, vertex fetch optimization, greedy meshlet
/// partitioning and per-meshlet reordering.
pub fn build_meshlets(
    vertices: &[Vertex],
    indices: &[u32],
    options: &MeshletOptions,
) -> Result<MeshletMesh> {
    options.validate()?;

    if vertices.is_empty() || indices.is_empty() {
        return Err(MeshError::EmptyGeometry);
    }
    if indices.len() % 3 != 0 {
        return Err(MeshError::IncompleteTriangles(indices.len()));
    }

    let (remap, unique_count) = generate_vertex_remap(indices, vertices)?;
    let unique_vertices = remap_vertex_buffer(vertices, unique_count, &remap);
    let remapped = remap_index_buffer(indices, &remap);

    let cache_ordered = optimize_vertex_cache(&remapped, unique_count);

    let positions: Vec<[f32; 3]> = unique_vertices.iter().map(|v| v.position).collect();
    let mut optimized_indices =
        optimize_overdraw(&cache_ordered, &positions, options.overdraw_threshold);

    let optimized_vertices = optimize_vertex_fetch(&mut optimized_indices, &unique_vertices);

    let mut buffers = build_meshlets_scan(
        &optimized_indices,
        optimized_vertices.len(),
        options.max_vertices,
        options.max_triangles,
    );

    for meshlet in &buffers.meshlets {
        let vertices = &mut buffers.vertices[meshlet.vertex_offset as usize..]
            [..meshlet.vertex_count as usize];
        let triangles = &mut buffers.triangles[meshlet.triangle_offset as usize..]
            [..meshlet.triangle_count as usize * 3];
        optimize_meshlet(vertices, triangles);
    }

    tracing::debug!(
        "Built {} meshlets from {} vertices ({} unique) and {} triangles",
        buffers.meshlets.len(),
        vertices.len(),
        optimized_vertices.len(),
        optimized_indices.len() / 3
    );

    Ok(MeshletMesh {
        vertices: optimized_vertices,
        indices: optimized_indices,
        meshlet_vertices: buffers.vertices,
        meshlet_triangles: buffers.triangles,
        meshlets: buffers.meshlets,
    })
}
