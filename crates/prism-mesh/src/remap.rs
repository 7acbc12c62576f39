//! Vertex deduplication.
//!
//! Identical vertices (compared byte for byte) are merged so every unique
//! vertex appears once in the output vertex buffer.

use crate::error::{MeshError, Result};
use bytemuck::Pod;
use hashbrown::HashMap;

/// Marker for vertices that are never referenced by the index buffer.
pub const UNUSED: u32 = u32::MAX;

/// Generate a remap table that merges byte-identical vertices.
///
/// Returns the table (one entry per input vertex, `UNUSED` for vertices
/// that no index references) and the number of unique vertices. New
/// indices are handed out in order of first reference.
pub fn generate_vertex_remap<V: Pod>(indices: &[u32], vertices: &[V]) -> Result<(Vec<u32>, usize)> {
    let mut remap = vec![UNUSED; vertices.len()];
    let mut unique: HashMap<&[u8], u32> = HashMap::with_capacity(vertices.len());
    let mut next = 0u32;

    for &index in indices {
        let slot = remap
            .get_mut(index as usize)
            .ok_or(MeshError::IndexOutOfRange {
                index,
                vertex_count: vertices.len(),
            })?;

        if *slot != UNUSED {
            continue;
        }

        let key = bytemuck::bytes_of(&vertices[index as usize]);
        *slot = *unique.entry(key).or_insert_with(|| {
            let id = next;
            next += 1;
            id
        });
    }

    Ok((remap, next as usize))
}

/// Rewrite an index buffer through a remap table.
pub fn remap_index_buffer(indices: &[u32], remap: &[u32]) -> Vec<u32> {
    indices.iter().map(|&i| remap[i as usize]).collect()
}

/// Build the compacted vertex buffer described by a remap table.
pub fn remap_vertex_buffer<V: Pod>(vertices: &[V], unique_count: usize, remap: &[u32]) -> Vec<V> {
    let mut output = vec![V::zeroed(); unique_count];
    for (vertex, &target) in vertices.iter().zip(remap) {
        if target != UNUSED {
            output[target as usize] = *vertex;
        }
    }
    output
}
