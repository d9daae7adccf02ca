pub mod frame;
pub mod policy;
pub mod report;

pub use frame::{Frame, KeyframeCandidate, Observation, TriggerReason};
pub use policy::{
    MatchMode, Policy, ReferenceCategory, ReferenceImage, Rule, RuleFrequency, RuleMode, Severity,
};
pub use report::{ChecklistStatus, Report, Transcript, TranscriptSegment, Verdict};
