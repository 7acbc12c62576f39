//! Overdraw optimization.
//!
//! Splits a cache-optimized index buffer into clusters whose local vertex
//! cache efficiency stays within a threshold of the original, then sorts the
//! clusters so outward-facing geometry is drawn first. The threshold trades
//! vertex cache misses for reduced overdraw: 1.05 allows 5% more misses.

/// FIFO cache size used to find cluster boundaries.
const CACHE_SIZE: u32 = 16;

struct FifoCache {
    timestamps: Vec<u32>,
    timestamp: u32,
}

impl FifoCache {
    fn new(vertex_count: usize) -> Self {
        Self {
            timestamps: vec![0; vertex_count],
            timestamp: CACHE_SIZE + 1,
        }
    }

    fn flush(&mut self) {
        self.timestamp += CACHE_SIZE + 1;
    }

    fn misses(&mut self, corners: &[u32]) -> u32 {
        let mut misses = 0;
        for &v in corners {
            if self.timestamp - self.timestamps[v as usize] > CACHE_SIZE {
                self.timestamps[v as usize] = self.timestamp;
                self.timestamp += 1;
                misses += 1;
            }
        }
        misses
    }
}

/// Cluster starts where the cache is effectively flushed (all three
/// vertices of a triangle miss).
fn hard_boundaries(indices: &[u32], vertex_count: usize) -> Vec<usize> {
    let mut cache = FifoCache::new(vertex_count);
    let mut boundaries = Vec::new();

    for (triangle, corners) in indices.chunks_exact(3).enumerate() {
        if cache.misses(corners) == 3 || triangle == 0 {
            boundaries.push(triangle);
        }
    }

    boundaries
}

/// Split each hard cluster wherever the running miss ratio falls within the
/// threshold of the whole cluster's ratio.
fn soft_boundaries(
    indices: &[u32],
    vertex_count: usize,
    hard: &[usize],
    threshold: f32,
) -> Vec<usize> {
    let triangle_count = indices.len() / 3;
    let mut cache = FifoCache::new(vertex_count);
    let mut boundaries = Vec::with_capacity(hard.len());

    for (i, &start) in hard.iter().enumerate() {
        let end = hard.get(i + 1).copied().unwrap_or(triangle_count);

        cache.flush();
        let cluster_misses: u32 = (start..end)
            .map(|t| cache.misses(&indices[t * 3..t * 3 + 3]))
            .sum();
        let cluster_threshold = threshold * (cluster_misses as f32 / (end - start) as f32);

        boundaries.push(start);

        cache.flush();
        let mut running_misses = 0u32;
        let mut running_triangles = 0u32;
        for t in start..end {
            running_misses += cache.misses(&indices[t * 3..t * 3 + 3]);
            running_triangles += 1;

            if t + 1 < end && running_misses as f32 / running_triangles as f32 <= cluster_threshold {
                boundaries.push(t + 1);
                cache.flush();
                running_misses = 0;
                running_triangles = 0;
            }
        }
    }

    boundaries
}

fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Sort key of a cluster: how far its area-weighted centroid lies in front of
/// the mesh centroid along the cluster's average normal.
fn cluster_sort_key(indices: &[u32], positions: &[[f32; 3]], mesh_centroid: [f32; 3]) -> f32 {
    let mut centroid = [0.0f32; 3];
    let mut normal = [0.0f32; 3];
    let mut area_sum = 0.0f32;

    for corners in indices.chunks_exact(3) {
        let p0 = positions[corners[0] as usize];
        let p1 = positions[corners[1] as usize];
        let p2 = positions[corners[2] as usize];

        let n = cross(sub(p1, p0), sub(p2, p0));
        let area = dot(n, n).sqrt();

        for axis in 0..3 {
            centroid[axis] += (p0[axis] + p1[axis] + p2[axis]) / 3.0 * area;
            normal[axis] += n[axis];
        }
        area_sum += area;
    }

    if area_sum <= 0.0 {
        return 0.0;
    }

    let centroid = centroid.map(|c| c / area_sum);
    let length = dot(normal, normal).sqrt();
    if length <= 0.0 {
        return 0.0;
    }
    let normal = normal.map(|n| n / length);

    dot(sub(centroid, mesh_centroid), normal)
}

/// Reorder a vertex-cache-optimized index buffer to reduce overdraw.
///
/// `positions` holds one position per vertex. The output contains exactly
/// the input triangles, with the order inside each cluster preserved.
pub fn optimize_overdraw(indices: &[u32], positions: &[[f32; 3]], threshold: f32) -> Vec<u32> {
    let triangle_count = indices.len() / 3;
    if triangle_count == 0 {
        return Vec::new();
    }

    let hard = hard_boundaries(indices, positions.len());
    let clusters = soft_boundaries(indices, positions.len(), &hard, threshold);

    let mut mesh_centroid = [0.0f32; 3];
    for &index in indices {
        let p = positions[index as usize];
        for axis in 0..3 {
            mesh_centroid[axis] += p[axis];
        }
    }
    let mesh_centroid = mesh_centroid.map(|c| c / indices.len() as f32);

    let mut order: Vec<(f32, usize, usize)> = clusters
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = clusters.get(i + 1).copied().unwrap_or(triangle_count);
            let key = cluster_sort_key(&indices[start * 3..end * 3], positions, mesh_centroid);
            (key, start, end)
        })
        .collect();

    // Outward-facing clusters first; stable so equal keys keep cache order.
    order.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut output = Vec::with_capacity(indices.len());
    for (_, start, end) in order {
        output.extend_from_slice(&indices[start * 3..end * 3]);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted_triangles(indices: &[u32]) -> Vec<[u32; 3]> {
        let mut triangles: Vec<[u32; 3]> = indices
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect();
        triangles.sort_unstable();
        triangles
    }

    fn cube() -> (Vec<[f32; 3]>, Vec<u32>) {
        let positions = vec![
            [-1.0, -1.0, -1.0],
            [1.0, -1.0, -1.0],
            [1.0, 1.0, -1.0],
            [-1.0, 1.0, -1.0],
            [-1.0, -1.0, 1.0],
            [1.0, -1.0, 1.0],
            [1.0, 1.0, 1.0],
            [-1.0, 1.0, 1.0],
        ];
        let indices = vec![
            0, 2, 1, 0, 3, 2, // back
            4, 5, 6, 4, 6, 7, // front
            0, 1, 5, 0, 5, 4, // bottom
            3, 6, 2, 3, 7, 6, // top
            0, 4, 7, 0, 7, 3, // left
            1, 2, 6, 1, 6, 5, // right
        ];
        (positions, indices)
    }

    #[test]
    fn preserves_triangles() {
        let (positions, indices) = cube();
        let optimized = optimize_overdraw(&indices, &positions, 1.05);
        assert_eq!(sorted_triangles(&indices), sorted_triangles(&optimized));
    }

    #[test]
    fn first_boundary_is_first_triangle() {
        let (positions, indices) = cube();
        let hard = hard_boundaries(&indices, positions.len());
        assert_eq!(hard[0], 0);

        let soft = soft_boundaries(&indices, positions.len(), &hard, 1.05);
        assert_eq!(soft[0], 0);
        assert!(soft.windows(2).all(|w| w[0] < w[1]));
        assert!(soft.iter().all(|&b| b < indices.len() / 3));
    }

    #[test]
    fn degenerate_geometry_is_kept() {
        let positions = vec![[0.0; 3]; 3];
        let indices = vec![0, 1, 2, 2, 1, 0];
        let optimized = optimize_overdraw(&indices, &positions, 1.05);
        assert_eq!(sorted_triangles(&indices), sorted_triangles(&optimized));
    }
}
