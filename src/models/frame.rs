use serde::{Deserialize, Serialize};

/// One decoded video frame: packed RGB24 pixels plus positional metadata.
///
/// `index` counts decoded frames from the start of the source and is strictly
/// monotonic. `timestamp` is seconds from source start — container time for
/// files, wall clock from session start for live feeds.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub timestamp: f64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(index: u64, timestamp: f64, width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), (width * height * 3) as usize);
        Self {
            index,
            timestamp,
            width,
            height,
            data,
        }
    }
}

/// Why a frame was selected as a keyframe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// First frame of the session, or first after a resolution change.
    First,
    /// Final frame of a bounded source.
    Last,
    /// Change score crossed the threshold.
    Changed,
    /// Max-gap timer forced a keyframe in a static scene.
    MaxGap,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::First => "first",
            TriggerReason::Last => "last",
            TriggerReason::Changed => "changed",
            TriggerReason::MaxGap => "max_gap",
        }
    }
}

/// A frame the detector decided to keep, before sink processing.
#[derive(Debug, Clone)]
pub struct KeyframeCandidate {
    pub frame: Frame,
    pub reason: TriggerReason,
    /// Change score in [0,1] at the moment of selection.
    pub score: f64,
}

/// A transport-ready keyframe: downscaled JPEG plus selection metadata,
/// with the VLM description filled in after dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Strictly monotonic within a session.
    pub index: u64,
    pub timestamp: f64,
    pub trigger: TriggerReason,
    pub change_score: f64,
    /// Base64 JPEG, downscaled to the configured transport width.
    pub image_base64: String,
    /// VLM-produced description. Empty until dispatch completes.
    #[serde(default)]
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TriggerReason::MaxGap).unwrap(),
            "\"max_gap\""
        );
        assert_eq!(TriggerReason::MaxGap.as_str(), "max_gap");
    }
}
