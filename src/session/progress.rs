use serde::Serialize;

use crate::models::{Report, TriggerReason};

/// Why a session ended. File sessions end `Complete` or `Error`; live
/// sessions end `Stopped`, `SourceUnreachable`, or `Error`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Complete,
    Stopped,
    SourceUnreachable,
    Error(String),
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::Complete => write!(f, "complete"),
            EndReason::Stopped => write!(f, "stopped"),
            EndReason::SourceUnreachable => write!(f, "source_unreachable"),
            EndReason::Error(reason) => write!(f, "error:{reason}"),
        }
    }
}

/// Events on a session's progress stream. Finite for file analysis,
/// indefinite for live monitoring; the stream always terminates with `Ended`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        session_id: String,
        video_id: String,
    },
    Keyframe {
        index: u64,
        timestamp: f64,
        trigger: TriggerReason,
        change_score: f64,
    },
    /// A live window closed and was handed to dispatch.
    WindowClosed {
        window_index: u64,
        observations: usize,
    },
    Report(Box<Report>),
    Ended(EndReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_reason_formats_match_the_command_surface() {
        assert_eq!(EndReason::Complete.to_string(), "complete");
        assert_eq!(EndReason::Stopped.to_string(), "stopped");
        assert_eq!(
            EndReason::SourceUnreachable.to_string(),
            "source_unreachable"
        );
        assert_eq!(
            EndReason::Error("decode failed".into()).to_string(),
            "error:decode failed"
        );
    }
}
