use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::frame::Observation;
use super::policy::{RuleMode, Severity};

/// Lifecycle of a checklist-mode rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChecklistStatus {
    /// Not yet verified this validity period.
    Pending,
    /// Verified and still within the validity duration.
    Compliant,
    /// Validity duration elapsed; needs re-verification.
    Expired,
}

/// The evaluator's judgement of one rule for one analysis window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub rule_id: String,
    pub rule_description: String,
    pub compliant: bool,
    pub severity: Severity,
    /// Reasoning citing timestamps and observations.
    pub reason: String,
    /// Seconds into the source where the evidence was first observed.
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub mode: RuleMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checklist_status: Option<ChecklistStatus>,
    /// Wall clock when a satisfied checklist rule expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Timestamped transcription of the source's audio track.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    #[serde(default)]
    pub full_text: String,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    #[serde(default)]
    pub language: String,
    /// Audio duration in seconds.
    #[serde(default)]
    pub duration: f64,
}

impl Transcript {
    pub fn is_empty(&self) -> bool {
        self.full_text.trim().is_empty()
    }
}

/// One compliance report, produced per file analysis or per live window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub video_id: String,
    pub summary: String,
    pub overall_compliant: bool,
    /// Non-compliant verdicts only.
    pub incidents: Vec<Verdict>,
    /// Every verdict, compliant or not.
    pub all_verdicts: Vec<Verdict>,
    pub recommendations: Vec<String>,
    /// Ordered by observation index.
    pub frame_observations: Vec<Observation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Transcript>,
    pub analyzed_at: DateTime<Utc>,
    pub total_frames_analyzed: usize,
    /// Media duration in seconds (window duration for live).
    pub video_duration: f64,
    /// Populated when the report is partial due to a dispatch failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Report {
    /// A best-effort report carrying whatever was collected before a failure.
    /// A failed session never produces an empty response.
    pub fn partial(
        video_id: String,
        observations: Vec<Observation>,
        video_duration: f64,
        error: String,
    ) -> Self {
        Report {
            video_id,
            summary: format!("[ANALYSIS ERROR] {error}"),
            overall_compliant: false,
            incidents: Vec::new(),
            all_verdicts: Vec::new(),
            recommendations: vec!["Retry the analysis or check service availability.".to_string()],
            total_frames_analyzed: observations.len(),
            frame_observations: observations,
            transcript: None,
            analyzed_at: Utc::now(),
            video_duration,
            error: Some(error),
        }
    }

    /// Fold a set of verdicts into the report, keeping the incident subset
    /// and the overall flag consistent.
    pub fn absorb_verdicts(&mut self, verdicts: Vec<Verdict>) {
        for verdict in verdicts {
            if !verdict.compliant {
                self.overall_compliant = false;
                self.incidents.push(verdict.clone());
            }
            self.all_verdicts.push(verdict);
        }
    }
}
