use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration with tunable thresholds.
///
/// The defaults are calibrated for surveillance-style footage: sparse motion,
/// long static stretches, occasional sudden scene changes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often to sample frames for change detection, in seconds.
    pub sample_interval: f64,

    /// Change score in [0,1] at or above which a frame is a keyframe
    /// candidate. Lower = more sensitive.
    pub change_threshold: f64,

    /// Minimum seconds between accepted keyframes (debounce).
    pub min_change_interval: f64,

    /// Maximum seconds without a keyframe before one is forced.
    pub max_gap: f64,

    /// Histogram correlation at or above which the structural stage is
    /// skipped entirely.
    pub early_exit_similarity: f64,

    /// Weight of the global (histogram) signal in the combined score; the
    /// structural signal gets `1 - alpha`.
    pub alpha: f64,

    /// Gaussian blur sigma applied before comparison, to suppress sensor noise.
    pub blur_sigma: f32,

    /// Maximum transport width of encoded keyframes, in pixels.
    pub keyframe_max_width: u32,

    /// JPEG quality in (0,1] for bulk (file) keyframes.
    pub jpeg_quality: f32,

    /// JPEG quality in (0,1] for live single-frame keyframes.
    pub jpeg_quality_live: f32,

    /// Optional directory for persisting keyframes to disk. Writes are
    /// asynchronous and never block detection.
    pub keyframes_dir: Option<PathBuf>,

    /// Maximum images per VLM describe call.
    pub dispatch_batch_size: usize,

    /// Analysis window length for live monitoring, in seconds.
    pub window_duration: f64,

    /// Length of the first live window, shorter for fast initial feedback.
    pub first_window_duration: f64,

    /// Process-wide VLM/evaluator call budget per minute.
    pub rate_limit_per_minute: u32,

    /// Process-wide VLM/evaluator call budget per hour.
    pub rate_limit_per_hour: u32,

    /// Per-attempt timeout on a describe call.
    pub describe_timeout: Duration,

    /// Per-attempt timeout on an evaluate call.
    pub evaluate_timeout: Duration,

    /// Idle timeout on a live source read before it counts as a decode failure.
    pub live_read_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_interval: 0.3,
            change_threshold: 0.10,
            min_change_interval: 0.5,
            max_gap: 10.0,
            early_exit_similarity: 0.95,
            alpha: 0.4,
            blur_sigma: 1.5,
            keyframe_max_width: 512,
            jpeg_quality: 0.6,
            jpeg_quality_live: 0.8,
            keyframes_dir: None,
            dispatch_batch_size: 5,
            window_duration: 6.0,
            first_window_duration: 2.0,
            rate_limit_per_minute: 30,
            rate_limit_per_hour: 500,
            describe_timeout: Duration::from_secs(60),
            evaluate_timeout: Duration::from_secs(30),
            live_read_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// JPEG quality for the `image` encoder (1-100) given the session mode.
    pub fn jpeg_quality_u8(&self, live: bool) -> u8 {
        let q = if live {
            self.jpeg_quality_live
        } else {
            self.jpeg_quality
        };
        (q.clamp(0.01, 1.0) * 100.0).round() as u8
    }
}
