//! Change detection: decides which frames are worth sending to the VLM.
//!
//! Frames are compared against the last *kept* keyframe, not the previous
//! frame, so slow drift accumulates until it crosses the threshold instead
//! of escaping one small step at a time.

pub mod debounce;
pub mod score;

pub use debounce::GapPolicy;
pub use score::{change_score, preprocess, FramePrep};

use crate::config::EngineConfig;
use crate::models::{Frame, KeyframeCandidate, TriggerReason};

/// Seconds within which a bounded source's final frame is considered already
/// covered by the previous keyframe.
const LAST_FRAME_SLACK: f64 = 0.5;

/// Stateful keyframe selector for one session. Single-threaded; sessions get
/// their own instance and share nothing.
pub struct KeyframeExtractor {
    change_threshold: f64,
    early_exit_similarity: f64,
    alpha: f64,
    blur_sigma: f32,
    reference: Option<FramePrep>,
    gap: GapPolicy,
    frames_seen: u64,
}

impl KeyframeExtractor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            change_threshold: config.change_threshold,
            early_exit_similarity: config.early_exit_similarity,
            alpha: config.alpha,
            blur_sigma: config.blur_sigma,
            reference: None,
            gap: GapPolicy::new(config.min_change_interval, config.max_gap),
            frames_seen: 0,
        }
    }

    /// Score one frame and decide whether to keep it. CPU-bound; callers on
    /// the async path run this under `spawn_blocking`.
    pub fn process(&mut self, frame: &Frame) -> Option<KeyframeCandidate> {
        self.frames_seen += 1;
        let prep = score::preprocess(frame, self.blur_sigma);

        let resolution_changed = self
            .reference
            .as_ref()
            .map(|r| r.source_width != frame.width || r.source_height != frame.height)
            .unwrap_or(false);

        if self.reference.is_none() || resolution_changed {
            // A mid-stream resize invalidates every stored comparison, so the
            // stream restarts from a fresh reference.
            if resolution_changed {
                self.gap.reset();
            }
            self.gap.record_accept(frame.timestamp);
            self.reference = Some(prep);
            return Some(KeyframeCandidate {
                frame: frame.clone(),
                reason: TriggerReason::First,
                score: 1.0,
            });
        }

        let reference = self.reference.as_ref().expect("reference checked above");
        let score = score::change_score(&prep, reference, self.early_exit_similarity, self.alpha);

        let reason = self
            .gap
            .evaluate(score >= self.change_threshold, frame.timestamp)?;

        self.gap.record_accept(frame.timestamp);
        self.reference = Some(prep);
        Some(KeyframeCandidate {
            frame: frame.clone(),
            reason,
            score,
        })
    }

    /// Bookend emission at end of a bounded source: keep the final frame
    /// unless a keyframe already landed within the last half second.
    pub fn finalize(&mut self, frame: &Frame) -> Option<KeyframeCandidate> {
        if let Some(since) = self.gap.since_last(frame.timestamp) {
            if since < LAST_FRAME_SLACK {
                return None;
            }
        }

        let prep = score::preprocess(frame, self.blur_sigma);
        let score = match self.reference.as_ref() {
            Some(reference) => {
                score::change_score(&prep, reference, self.early_exit_similarity, self.alpha)
            }
            None => 1.0,
        };
        self.gap.record_accept(frame.timestamp);
        self.reference = Some(prep);
        Some(KeyframeCandidate {
            frame: frame.clone(),
            reason: TriggerReason::Last,
            score,
        })
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }
}
