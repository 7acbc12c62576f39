//! Meshlet partitioning.
//!
//! A meshlet is a small cluster of triangles with its own local vertex list.
//! Triangles are stored as three `u8` local vertex indices each, and every
//! meshlet's triangle range starts on a 4-byte boundary so the mesh shader
//! can read it as packed `uint` words.

use bytemuck::{Pod, Zeroable};

/// Sentinel for "vertex not yet in the current meshlet".
const NOT_IN_MESHLET: u8 = u8::MAX;

/// A meshlet descriptor, laid out as the mesh shader reads it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Meshlet {
    /// Offset into the shared meshlet vertex list.
    pub vertex_offset: u32,
    /// Byte offset into the shared meshlet triangle buffer (multiple of 4).
    pub triangle_offset: u32,
    /// Number of local vertices.
    pub vertex_count: u32,
    /// Number of triangles.
    pub triangle_count: u32,
}

impl Meshlet {
    /// Number of triangle index bytes this meshlet occupies, including padding.
    pub const fn padded_triangle_bytes(&self) -> usize {
        padded_len(self.triangle_count as usize * 3)
    }
}

/// Round a byte length up to a multiple of 4.
pub const fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// Output of [`build_meshlets_scan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshletBuffers {
    pub meshlets: Vec<Meshlet>,
    /// Global vertex index per local meshlet vertex.
    pub vertices: Vec<u32>,
    /// Packed local triangle indices.
    pub triangles: Vec<u8>,
}

/// Upper bound on the number of meshlets produced for a given index count.
pub fn meshlet_bound(index_count: usize, max_vertices: usize, max_triangles: usize) -> usize {
    let triangle_count = index_count / 3;
    // Worst case every triangle brings three new vertices.
    let triangles_per_meshlet = max_triangles.min(max_vertices / 3).max(1);
    triangle_count.div_ceil(triangles_per_meshlet)
}

struct MeshletBuilder {
    local: Vec<u8>,
    current: Meshlet,
}

impl MeshletBuilder {
    fn finish(&mut self, out: &mut MeshletBuffers) {
        if self.current.triangle_count == 0 {
            return;
        }

        let start = self.current.vertex_offset as usize;
        for &v in &out.vertices[start..] {
            self.local[v as usize] = NOT_IN_MESHLET;
        }

        out.triangles.resize(padded_len(out.triangles.len()), 0);
        out.meshlets.push(self.current);

        self.current = Meshlet {
            vertex_offset: out.vertices.len() as u32,
            triangle_offset: out.triangles.len() as u32,
            vertex_count: 0,
            triangle_count: 0,
        };
    }
}

/// Partition triangles into meshlets in index buffer order.
///
/// Triangles are added greedily to the current meshlet until the next one
/// would exceed `max_vertices` unique vertices or `max_triangles` triangles;
/// a trailing partial meshlet keeps its real (smaller) counts.
///
/// `max_vertices` must be at most 255 so local indices fit in a byte.
pub fn build_meshlets_scan(
    indices: &[u32],
    vertex_count: usize,
    max_vertices: usize,
    max_triangles: usize,
) -> MeshletBuffers {
    debug_assert!((3..=255).contains(&max_vertices));
    debug_assert!(max_triangles >= 1);

    let bound = meshlet_bound(indices.len(), max_vertices, max_triangles);
    let mut out = MeshletBuffers {
        meshlets: Vec::with_capacity(bound),
        vertices: Vec::with_capacity(indices.len()),
        triangles: Vec::with_capacity(indices.len() + bound * 3),
    };
    let mut builder = MeshletBuilder {
        local: vec![NOT_IN_MESHLET; vertex_count],
        current: Meshlet::default(),
    };

    for corners in indices.chunks_exact(3) {
        let (a, b, c) = (corners[0], corners[1], corners[2]);

        let is_new = |v: u32| builder.local[v as usize] == NOT_IN_MESHLET;
        let new_vertices = usize::from(is_new(a))
            + usize::from(is_new(b) && b != a)
            + usize::from(is_new(c) && c != a && c != b);

        if builder.current.vertex_count as usize + new_vertices > max_vertices
            || builder.current.triangle_count as usize >= max_triangles
        {
            builder.finish(&mut out);
        }

        for v in [a, b, c] {
            if builder.local[v as usize] == NOT_IN_MESHLET {
                builder.local[v as usize] = builder.current.vertex_count as u8;
                out.vertices.push(v);
                builder.current.vertex_count += 1;
            }
        }

        out.triangles.extend_from_slice(&[
            builder.local[a as usize],
            builder.local[b as usize],
            builder.local[c as usize],
        ]);
        builder.current.triangle_count += 1;
    }

    builder.finish(&mut out);
    out
}

/// Reorder one meshlet's triangles and vertices for locality.
///
/// Triangles are greedily chained so each next triangle reuses as many
/// already-emitted vertices as possible, then local vertices are renumbered
/// in order of first use. Each triangle keeps its winding.
pub fn optimize_meshlet(vertices: &mut [u32], triangles: &mut [u8]) {
    let vertex_count = vertices.len();
    let triangle_count = triangles.len() / 3;
    if triangle_count == 0 {
        return;
    }

    let mut seen = vec![false; vertex_count];
    for i in 0..triangle_count {
        let mut best = i;
        let mut best_score = -1i32;
        for j in i..triangle_count {
            let score = triangles[j * 3..j * 3 + 3]
                .iter()
                .filter(|&&v| seen[v as usize])
                .count() as i32;
            if score > best_score {
                best = j;
                best_score = score;
                if score == 3 {
                    break;
                }
            }
        }

        if best != i {
            for k in 0..3 {
                triangles.swap(i * 3 + k, best * 3 + k);
            }
        }
        for &v in &triangles[i * 3..i * 3 + 3] {
            seen[v as usize] = true;
        }
    }

    let mut remap = vec![NOT_IN_MESHLET; vertex_count];
    let mut next = 0u8;
    for local in triangles[..triangle_count * 3].iter_mut() {
        let slot = &mut remap[*local as usize];
        if *slot == NOT_IN_MESHLET {
            *slot = next;
            next += 1;
        }
        *local = *slot;
    }

    let original = vertices.to_vec();
    for (old, &new) in remap.iter().enumerate() {
        if new != NOT_IN_MESHLET {
            vertices[new as usize] = original[old];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip(triangles: u32) -> Vec<u32> {
        (0..triangles).flat_map(|t| [t, t + 1, t + 2]).collect()
    }

    #[test]
    fn meshlet_descriptor_layout() {
        assert_eq!(std::mem::size_of::<Meshlet>(), 16);
    }

    #[test]
    fn padding_rounds_to_words() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(3), 4);
        assert_eq!(padded_len(4), 4);
        assert_eq!(padded_len(372), 372);
        assert_eq!(padded_len(373), 376);
    }

    #[test]
    fn respects_vertex_limit() {
        let indices = strip(100);
        let out = build_meshlets_scan(&indices, 102, 16, 124);
        assert!(out.meshlets.len() > 1);
        for m in &out.meshlets {
            assert!(m.vertex_count <= 16);
            assert_eq!(m.triangle_offset % 4, 0);
        }
        let total: u32 = out.meshlets.iter().map(|m| m.triangle_count).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn respects_triangle_limit() {
        // Same three vertices over and over never hits the vertex limit.
        let indices: Vec<u32> = (0..10).flat_map(|_| [0, 1, 2]).collect();
        let out = build_meshlets_scan(&indices, 3, 64, 4);
        let counts: Vec<u32> = out.meshlets.iter().map(|m| m.triangle_count).collect();
        assert_eq!(counts, vec![4, 4, 2]);
        assert!(out.meshlets.iter().all(|m| m.vertex_count == 3));
    }

    #[test]
    fn trailing_meshlet_keeps_true_counts() {
        let indices = strip(5);
        let out = build_meshlets_scan(&indices, 7, 64, 4);
        assert_eq!(out.meshlets.len(), 2);
        let last = out.meshlets[1];
        assert_eq!(last.triangle_count, 1);
        assert_eq!(last.vertex_count, 3);
        assert_eq!(out.triangles.len() % 4, 0);
    }

    #[test]
    fn local_indices_resolve_to_input() {
        let indices = strip(20);
        let out = build_meshlets_scan(&indices, 22, 8, 6);
        let mut rebuilt = Vec::new();
        for m in &out.meshlets {
            let verts = &out.vertices[m.vertex_offset as usize..][..m.vertex_count as usize];
            let tris = &out.triangles[m.triangle_offset as usize..][..m.triangle_count as usize * 3];
            rebuilt.extend(tris.iter().map(|&l| verts[l as usize]));
        }
        assert_eq!(rebuilt, indices);
    }

    #[test]
    fn optimize_meshlet_renumbers_by_first_use() {
        let mut vertices = vec![10, 20, 30, 40];
        let mut triangles = vec![3, 2, 1, 0, 1, 2];
        let before: Vec<[u32; 3]> = triangles
            .chunks_exact(3)
            .map(|t| [vertices[t[0] as usize], vertices[t[1] as usize], vertices[t[2] as usize]])
            .collect();

        optimize_meshlet(&mut vertices, &mut triangles);

        assert_eq!(&triangles[..3], &[0, 1, 2]);
        let mut after: Vec<[u32; 3]> = triangles
            .chunks_exact(3)
            .map(|t| [vertices[t[0] as usize], vertices[t[1] as usize], vertices[t[2] as usize]])
            .collect();
        let mut before = before;
        before.sort_unstable();
        after.sort_unstable();
        assert_eq!(before, after);
    }

    #[test]
    fn bound_covers_worst_case() {
        let indices: Vec<u32> = (0..300).collect();
        let out = build_meshlets_scan(&indices, 300, 64, 124);
        assert!(out.meshlets.len() <= meshlet_bound(300, 64, 124));
    }
}
