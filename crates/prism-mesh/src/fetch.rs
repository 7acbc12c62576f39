//! Vertex fetch optimization.

use crate::remap::UNUSED;

/// Reorder vertices to match the order in which the index buffer first
/// references them, rewriting `indices` in place.
///
/// Vertices that no index references are dropped from the output.
pub fn optimize_vertex_fetch<V: Copy>(indices: &mut [u32], vertices: &[V]) -> Vec<V> {
    let mut remap = vec![UNUSED; vertices.len()];
    let mut output = Vec::with_capacity(vertices.len());

    for index in indices.iter_mut() {
        let slot = &mut remap[*index as usize];
        if *slot == UNUSED {
            *slot = output.len() as u32;
            output.push(vertices[*index as usize]);
        }
        *index = *slot;
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertices_follow_first_use() {
        let vertices = ['a', 'b', 'c', 'd'];
        let mut indices = vec![3, 1, 0, 3, 0, 2];

        let reordered = optimize_vertex_fetch(&mut indices, &vertices);
        assert_eq!(reordered, vec!['d', 'b', 'a', 'c']);
        assert_eq!(indices, vec![0, 1, 2, 0, 2, 3]);
    }

    #[test]
    fn unreferenced_vertices_are_dropped() {
        let vertices = [1u8, 2, 3, 4, 5];
        let mut indices = vec![4, 2, 0];
        let reordered = optimize_vertex_fetch(&mut indices, &vertices);
        assert_eq!(reordered, vec![5, 3, 1]);
    }
}
