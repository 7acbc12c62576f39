//! Frame timing statistics.

use std::time::Instant;

/// Delta time and FPS extremes over a session.
#[derive(Debug, Clone)]
pub struct FrameStats {
    last_frame: Instant,
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
    samples: u64,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            last_frame: Instant::now(),
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
            samples: 0,
        }
    }
}

impl FrameStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seconds since the previous call; also records the FPS sample.
    pub fn tick(&mut self) -> f32 {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f64();
        self.last_frame = now;
        self.record(dt);
        dt as f32
    }

    /// Record a frame that took `dt` seconds. Zero-length frames are skipped.
    pub fn record(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let fps = 1.0 / dt;
        self.min_fps = self.min_fps.min(fps);
        self.max_fps = self.max_fps.max(fps);
        self.fps_sum += fps;
        self.samples += 1;
    }

    pub const fn samples(&self) -> u64 {
        self.samples
    }

    /// Minimum, maximum and average FPS, if any frame was recorded.
    pub fn summary(&self) -> Option<(f64, f64, f64)> {
        (self.samples > 0).then(|| {
            (
                self.min_fps,
                self.max_fps,
                self.fps_sum / self.samples as f64,
            )
        })
    }

    /// Log the summary.
    pub fn report(&self) {
        if let Some((min, max, avg)) = self.summary() {
            tracing::info!("FPS Statistics:");
            tracing::info!("  Min: {min:.1}");
            tracing::info!("  Max: {max:.1}");
            tracing::info!("  Avg: {avg:.1}");
            tracing::info!("  Total frames: {}", self.samples);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_has_no_summary() {
        assert!(FrameStats::new().summary().is_none());
    }

    #[test]
    fn tracks_extremes() {
        let mut stats = FrameStats::new();
        stats.record(0.01);
        stats.record(0.02);
        stats.record(0.0);
        let (min, max, avg) = stats.summary().unwrap();
        assert!((min - 50.0).abs() < 1e-9);
        assert!((max - 100.0).abs() < 1e-9);
        assert!((avg - 75.0).abs() < 1e-9);
        assert_eq!(stats.samples(), 2);
    }
}
