use log::warn;
use serde::{Deserialize, Serialize};

/// Impact level of a rule violation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::High
    }
}

/// How a rule's verdict behaves across analysis windows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleMode {
    /// Re-evaluated every window, every frame.
    Incident,
    /// Satisfied once, then held satisfied for the validity duration.
    Checklist,
}

impl Default for RuleMode {
    fn default() -> Self {
        RuleMode::Incident
    }
}

/// How often the rule's condition must hold for compliance.
///
/// This distinction drives prior-context propagation on live sessions:
/// "every person wears a helmet" (always) must be re-checked each window,
/// while "the speaker says X" (at_least_once) stays satisfied once observed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleFrequency {
    Always,
    AtLeastOnce,
    AtLeastN,
}

impl Default for RuleFrequency {
    fn default() -> Self {
        RuleFrequency::Always
    }
}

/// One compliance rule, supplied externally and immutable within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub description: String,
    /// Free-form category tag: "badge", "ppe", "speech", "custom", ...
    /// Rules tagged "speech" are evaluated against the audio transcript.
    #[serde(default, rename = "type")]
    pub rule_type: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub mode: RuleMode,
    /// Seconds a satisfied checklist rule stays valid. Checklist mode only.
    #[serde(default)]
    pub validity_duration: Option<u64>,
    #[serde(default)]
    pub frequency: RuleFrequency,
    /// Required occurrence count. `at_least_n` only.
    #[serde(default)]
    pub frequency_count: Option<u32>,
}

impl Rule {
    pub fn is_speech(&self) -> bool {
        self.rule_type.eq_ignore_ascii_case("speech")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceCategory {
    People,
    Badges,
    Objects,
}

impl Default for ReferenceCategory {
    fn default() -> Self {
        ReferenceCategory::Objects
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Only this is allowed; absence of a match is a violation.
    MustMatch,
    /// This must NOT be present; a match is a violation.
    MustNotMatch,
}

impl Default for MatchMode {
    fn default() -> Self {
        MatchMode::MustMatch
    }
}

/// A visual reference (badge design, authorized person, prohibited object)
/// shipped to the VLM ahead of the surveillance frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceImage {
    pub id: String,
    pub label: String,
    pub image_base64: String,
    #[serde(default)]
    pub category: ReferenceCategory,
    #[serde(default)]
    pub match_mode: MatchMode,
    /// Per-reference checks the VLM must answer explicitly.
    #[serde(default)]
    pub checks: Vec<String>,
}

/// The full compliance policy for one session or window.
/// Immutable once a session starts; changing policy means stop + start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Free-form natural-language additions to the policy.
    #[serde(default)]
    pub custom_prompt: String,
    /// Whether to transcribe and evaluate audio.
    #[serde(default)]
    pub include_audio: bool,
    #[serde(default)]
    pub reference_images: Vec<ReferenceImage>,
    /// Ids of references active this run. Only these are sent to the VLM;
    /// empty means no reference checking.
    #[serde(default)]
    pub enabled_reference_ids: Vec<String>,
    /// Textual summary of previous windows' verdicts, for live sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_context: Option<String>,
}

const KNOWN_POLICY_FIELDS: &[&str] = &[
    "rules",
    "custom_prompt",
    "include_audio",
    "reference_images",
    "enabled_reference_ids",
    "prior_context",
];

impl Policy {
    /// Parse the canonical JSON surface. Unknown top-level fields are ignored
    /// with a warning; missing fields take defaults.
    pub fn from_json(raw: &str) -> Result<Policy, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        if let Some(map) = value.as_object() {
            for key in map.keys() {
                if !KNOWN_POLICY_FIELDS.contains(&key.as_str()) {
                    warn!("ignoring unknown policy field: {key}");
                }
            }
        }
        serde_json::from_value(value)
    }

    /// References whose id appears in `enabled_reference_ids`.
    pub fn enabled_references(&self) -> Vec<&ReferenceImage> {
        if self.enabled_reference_ids.is_empty() {
            return Vec::new();
        }
        self.reference_images
            .iter()
            .filter(|r| self.enabled_reference_ids.iter().any(|id| id == &r.id))
            .collect()
    }

    pub fn visual_rules(&self) -> Vec<&Rule> {
        self.rules.iter().filter(|r| !r.is_speech()).collect()
    }

    pub fn speech_rules(&self) -> Vec<&Rule> {
        self.rules.iter().filter(|r| r.is_speech()).collect()
    }

    /// A policy with no rules and no custom prompt evaluates nothing.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.custom_prompt.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "rules": [
            {"id": "r1", "description": "All persons must wear a helmet",
             "type": "ppe", "severity": "high", "mode": "incident",
             "frequency": "always"},
            {"id": "r2", "description": "Say the safety phrase three times",
             "type": "speech", "severity": "medium", "mode": "checklist",
             "validity_duration": 28800,
             "frequency": "at_least_n", "frequency_count": 3}
        ],
        "custom_prompt": "Construction site, day shift.",
        "include_audio": true,
        "reference_images": [
            {"id": "u1", "label": "Approved badge", "image_base64": "aGk=",
             "category": "badges", "match_mode": "must_match",
             "checks": ["Is the badge green?"]}
        ],
        "enabled_reference_ids": ["u1"]
    }"#;

    #[test]
    fn parses_canonical_policy_json() {
        let policy = Policy::from_json(SAMPLE).unwrap();
        assert_eq!(policy.rules.len(), 2);
        assert_eq!(policy.rules[0].severity, Severity::High);
        assert_eq!(policy.rules[1].frequency, RuleFrequency::AtLeastN);
        assert_eq!(policy.rules[1].frequency_count, Some(3));
        assert_eq!(policy.rules[1].validity_duration, Some(28800));
        assert!(policy.include_audio);
        assert_eq!(policy.enabled_references().len(), 1);
        assert_eq!(policy.visual_rules().len(), 1);
        assert_eq!(policy.speech_rules().len(), 1);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let policy = Policy::from_json(r#"{"rules": []}"#).unwrap();
        assert!(!policy.include_audio);
        assert!(policy.custom_prompt.is_empty());
        assert!(policy.enabled_reference_ids.is_empty());
        assert!(policy.is_empty());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let policy = Policy::from_json(r#"{"rules": [], "shiny_new_field": 1}"#).unwrap();
        assert!(policy.rules.is_empty());
    }

    #[test]
    fn round_trips_through_json() {
        let policy = Policy::from_json(SAMPLE).unwrap();
        let encoded = serde_json::to_string(&policy).unwrap();
        let decoded = Policy::from_json(&encoded).unwrap();
        assert_eq!(encoded, serde_json::to_string(&decoded).unwrap());
    }

    #[test]
    fn disabled_references_are_not_sent() {
        let mut policy = Policy::from_json(SAMPLE).unwrap();
        policy.enabled_reference_ids.clear();
        assert!(policy.enabled_references().is_empty());
    }
}
