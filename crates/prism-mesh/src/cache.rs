//! Vertex cache optimization.
//!
//! Reorders triangles so consecutive triangles reuse recently transformed
//! vertices, using Tom Forsyth's linear-speed scoring heuristic.

/// Size of the simulated LRU cache used for scoring.
const CACHE_SIZE: usize = 32;
const CACHE_DECAY_POWER: f32 = 1.5;
const LAST_TRIANGLE_SCORE: f32 = 0.75;
const VALENCE_BOOST_SCALE: f32 = 2.0;
const VALENCE_BOOST_POWER: f32 = 0.5;

const NOT_CACHED: usize = usize::MAX;

fn vertex_score(cache_position: usize, remaining: u32) -> f32 {
    if remaining == 0 {
        return -1.0;
    }

    let mut score = if cache_position == NOT_CACHED {
        0.0
    } else if cache_position < 3 {
        // The three vertices of the last emitted triangle get a fixed score so
        // the next triangle does not simply repeat the previous one.
        LAST_TRIANGLE_SCORE
    } else {
        let scaler = 1.0 / (CACHE_SIZE - 3) as f32;
        (1.0 - (cache_position - 3) as f32 * scaler).powf(CACHE_DECAY_POWER)
    };

    // Vertices with few remaining triangles are boosted to get rid of them early.
    score += VALENCE_BOOST_SCALE * (remaining as f32).powf(-VALENCE_BOOST_POWER);
    score
}

/// Reorder an index buffer for post-transform vertex cache locality.
///
/// The output contains exactly the input triangles, each with its
/// original vertex order, in a new sequence.
pub fn optimize_vertex_cache(indices: &[u32], vertex_count: usize) -> Vec<u32> {
    let triangle_count = indices.len() / 3;
    if triangle_count == 0 {
        return Vec::new();
    }

    // Remaining triangle count per vertex.
    let mut live = vec![0u32; vertex_count];
    for &index in indices {
        live[index as usize] += 1;
    }

    // Vertex -> triangle adjacency in CSR form. The first `live[v]` entries of
    // each range are the triangles that have not been emitted yet.
    let mut offsets = vec![0usize; vertex_count + 1];
    for v in 0..vertex_count {
        offsets[v + 1] = offsets[v] + live[v] as usize;
    }
    let mut adjacency = vec![0u32; indices.len()];
    let mut fill = offsets[..vertex_count].to_vec();
    for (triangle, corners) in indices.chunks_exact(3).enumerate() {
        for &v in corners {
            adjacency[fill[v as usize]] = triangle as u32;
            fill[v as usize] += 1;
        }
    }

    let mut cache_position = vec![NOT_CACHED; vertex_count];
    let mut vertex_scores: Vec<f32> = live
        .iter()
        .map(|&remaining| vertex_score(NOT_CACHED, remaining))
        .collect();
    let mut triangle_scores: Vec<f32> = indices
        .chunks_exact(3)
        .map(|c| c.iter().map(|&v| vertex_scores[v as usize]).sum())
        .collect();

    let mut emitted = vec![false; triangle_count];
    let mut cache: Vec<u32> = Vec::with_capacity(CACHE_SIZE + 3);
    let mut output = Vec::with_capacity(indices.len());
    let mut cursor = 0usize;

    let mut next_triangle = triangle_scores
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(t, _)| t);

    while output.len() < triangle_count * 3 {
        let triangle = match next_triangle {
            Some(t) => t,
            None => {
                // Nothing adjacent to the cache is left; continue from the
                // first triangle that has not been emitted.
                while emitted[cursor] {
                    cursor += 1;
                }
                cursor
            }
        };

        emitted[triangle] = true;
        let corners = [
            indices[triangle * 3],
            indices[triangle * 3 + 1],
            indices[triangle * 3 + 2],
        ];
        output.extend_from_slice(&corners);

        for &v in &corners {
            let v = v as usize;
            let start = offsets[v];
            let len = live[v] as usize;
            let pending = &mut adjacency[start..start + len];
            if let Some(pos) = pending.iter().position(|&t| t as usize == triangle) {
                pending.swap(pos, len - 1);
                live[v] -= 1;
            }
        }

        // Emitted vertices move to the front; older entries shift back.
        let mut new_cache: Vec<u32> = Vec::with_capacity(CACHE_SIZE + 3);
        for &v in &corners {
            if !new_cache.contains(&v) {
                new_cache.push(v);
            }
        }
        for &v in &cache {
            if !new_cache.contains(&v) {
                new_cache.push(v);
            }
        }

        for (position, &v) in new_cache.iter().enumerate() {
            cache_position[v as usize] = if position < CACHE_SIZE {
                position
            } else {
                NOT_CACHED
            };
        }

        for &v in &new_cache {
            let v = v as usize;
            let score = vertex_score(cache_position[v], live[v]);
            let delta = score - vertex_scores[v];
            vertex_scores[v] = score;
            for &t in &adjacency[offsets[v]..offsets[v] + live[v] as usize] {
                triangle_scores[t as usize] += delta;
            }
        }

        next_triangle = None;
        let mut best_score = f32::MIN;
        for &v in &new_cache {
            let v = v as usize;
            for &t in &adjacency[offsets[v]..offsets[v] + live[v] as usize] {
                let score = triangle_scores[t as usize];
                if score > best_score {
                    best_score = score;
                    next_triangle = Some(t as usize);
                }
            }
        }

        new_cache.truncate(CACHE_SIZE);
        cache = new_cache;
    }

    output
}

/// Average number of vertex shader invocations per triangle for a FIFO
/// cache of the given size.
pub fn average_cache_miss_ratio(indices: &[u32], vertex_count: usize, cache_size: u32) -> f32 {
    let triangle_count = indices.len() / 3;
    if triangle_count == 0 {
        return 0.0;
    }

    let mut timestamps = vec![0u32; vertex_count];
    let mut timestamp = cache_size + 1;
    let mut misses = 0u32;
    for &v in indices {
        if timestamp - timestamps[v as usize] > cache_size {
            timestamps[v as usize] = timestamp;
            timestamp += 1;
            misses += 1;
        }
    }

    misses as f32 / triangle_count as f32
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

    /// A `size` x `size` grid of quads with triangles emitted column-major,
    /// which is close to the worst case for a small cache.
    fn grid(size: u32) -> (Vec<u32>, usize) {
        let stride = size + 1;
        let mut indices = Vec::new();
        for x in 0..size {
            for y in 0..size {
                let i = y * stride + x;
                indices.extend_from_slice(&[i, i + stride, i + 1]);
                indices.extend_from_slice(&[i + 1, i + stride, i + stride + 1]);
            }
        }
        (indices, (stride * stride) as usize)
    }

    #[test]
    fn preserves_triangles() {
        let (indices, vertex_count) = grid(8);
        let optimized = optimize_vertex_cache(&indices, vertex_count);
        assert_eq!(sorted_triangles(&indices), sorted_triangles(&optimized));
    }

    #[test]
    fn does_not_increase_cache_misses_on_grid() {
        let (indices, vertex_count) = grid(32);
        let optimized = optimize_vertex_cache(&indices, vertex_count);

        let before = average_cache_miss_ratio(&indices, vertex_count, CACHE_SIZE as u32);
        let after = average_cache_miss_ratio(&optimized, vertex_count, CACHE_SIZE as u32);
        assert!(after <= before, "ACMR went from {before} to {after}");
    }

    #[test]
    fn handles_degenerate_triangles() {
        let indices = [0, 0, 1, 1, 2, 3, 2, 2, 2];
        let optimized = optimize_vertex_cache(&indices, 4);
        assert_eq!(sorted_triangles(&indices), sorted_triangles(&optimized));
    }

    #[test]
    fn empty_input() {
        assert!(optimize_vertex_cache(&[], 0).is_empty());
        assert_eq!(average_cache_miss_ratio(&[], 0, 16), 0.0);
    }
}
