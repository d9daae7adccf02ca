//! Cross-window compliance state.
//!
//! Two mechanisms with different scopes:
//!   - [`PriorState`] is per session: it remembers which "at least once"
//!     rules were satisfied, the last verdict per "always" rule, compact
//!     observation digests, and the accumulated transcript.
//!   - [`ChecklistStore`] is process-wide: a satisfied checklist rule stays
//!     satisfied for its validity duration across sessions, until reset.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use log::info;

use crate::models::{ChecklistStatus, Policy, Report, RuleFrequency, RuleMode};

/// Compact per-observation metadata retained after a report is handed off.
/// Full observations (with image payloads) are not kept.
const RECENT_ACTIVITY_LIMIT: usize = 5;
const DIGEST_MAX_CHARS: usize = 120;
const REASON_MAX_CHARS: usize = 100;

#[derive(Debug, Default)]
pub struct PriorState {
    satisfied: HashSet<String>,
    last_verdicts: HashMap<String, (bool, String)>,
    recent_activity: VecDeque<String>,
    accumulated_transcript: String,
    window_index: u64,
}

impl PriorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window_index(&self) -> u64 {
        self.window_index
    }

    pub fn accumulated_transcript(&self) -> &str {
        &self.accumulated_transcript
    }

    /// Build the prior-context string for the next window's evaluation.
    ///
    /// Rules whose condition must hold continuously get their previous
    /// verdict as context and are always re-evaluated. Rules that only need
    /// to occur once are marked SATISFIED once met, with an instruction not
    /// to re-flag them.
    pub fn build_context(&self, policy: &Policy) -> Option<String> {
        if self.window_index == 0 {
            return None;
        }

        let mut lines = vec![format!(
            "PRIOR CONTEXT from {} earlier window(s):",
            self.window_index
        )];

        for rule in &policy.rules {
            match rule.frequency {
                RuleFrequency::AtLeastOnce | RuleFrequency::AtLeastN => {
                    if self.satisfied.contains(&rule.id) {
                        lines.push(format!(
                            "- Rule {} (must occur at least once): SATISFIED in an earlier \
                             window. Do not re-flag; report it as compliant.",
                            rule.id
                        ));
                    } else if rule.frequency == RuleFrequency::AtLeastN {
                        lines.push(format!(
                            "- Rule {} (must occur at least {} times): not yet satisfied; \
                             count occurrences across the entire session.",
                            rule.id,
                            rule.frequency_count.unwrap_or(1)
                        ));
                    } else {
                        lines.push(format!(
                            "- Rule {} (must occur at least once): not yet observed.",
                            rule.id
                        ));
                    }
                }
                RuleFrequency::Always => {
                    if let Some((compliant, reason)) = self.last_verdicts.get(&rule.id) {
                        lines.push(format!(
                            "- Rule {} (holds in every frame): previous window was {} ({}). \
                             Re-evaluate against the current evidence only.",
                            rule.id,
                            if *compliant {
                                "compliant"
                            } else {
                                "NON-COMPLIANT"
                            },
                            truncate(reason, REASON_MAX_CHARS)
                        ));
                    }
                }
            }
        }

        if !self.recent_activity.is_empty() {
            lines.push("Recent activity:".to_string());
            for digest in &self.recent_activity {
                lines.push(format!("  {digest}"));
            }
        }

        Some(lines.join("\n"))
    }

    /// Force verdicts of already-satisfied "at least once" rules to stay
    /// compliant. Prior context instructs the evaluator, but the guarantee
    /// must not depend on the model following instructions.
    pub fn enforce_satisfied(&self, policy: &Policy, report: &mut Report) {
        if self.satisfied.is_empty() {
            return;
        }
        let mut changed = false;
        for verdict in &mut report.all_verdicts {
            let satisfied_once = policy.rules.iter().any(|rule| {
                rule.id == verdict.rule_id
                    && matches!(
                        rule.frequency,
                        RuleFrequency::AtLeastOnce | RuleFrequency::AtLeastN
                    )
            });
            if satisfied_once && self.satisfied.contains(&verdict.rule_id) && !verdict.compliant {
                info!(
                    "suppressing re-flag of satisfied rule {} in window {}",
                    verdict.rule_id, self.window_index
                );
                verdict.compliant = true;
                verdict.reason =
                    "Requirement already satisfied in an earlier window of this session."
                        .to_string();
                changed = true;
            }
        }
        if changed {
            rebuild_incident_view(report);
        }
    }

    /// Fold an emitted window report into cross-window state. Called strictly
    /// after the report is sent, so the next window sees the updated context.
    pub fn note_report(&mut self, policy: &Policy, report: &Report) {
        for verdict in &report.all_verdicts {
            let Some(rule) = policy.rules.iter().find(|r| r.id == verdict.rule_id) else {
                continue;
            };
            match rule.frequency {
                RuleFrequency::AtLeastOnce | RuleFrequency::AtLeastN => {
                    if verdict.compliant {
                        self.satisfied.insert(rule.id.clone());
                    }
                }
                RuleFrequency::Always => {
                    self.last_verdicts
                        .insert(rule.id.clone(), (verdict.compliant, verdict.reason.clone()));
                }
            }
        }

        for obs in &report.frame_observations {
            if obs.description.is_empty() {
                continue;
            }
            self.recent_activity.push_back(format!(
                "[t={:.1}s] {}",
                obs.timestamp,
                truncate(&obs.description, DIGEST_MAX_CHARS)
            ));
            while self.recent_activity.len() > RECENT_ACTIVITY_LIMIT {
                self.recent_activity.pop_front();
            }
        }

        if let Some(transcript) = &report.transcript {
            if !transcript.full_text.trim().is_empty() {
                if !self.accumulated_transcript.is_empty() {
                    self.accumulated_transcript.push(' ');
                }
                self.accumulated_transcript
                    .push_str(transcript.full_text.trim());
            }
        }

        self.window_index += 1;
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}

fn rebuild_incident_view(report: &mut Report) {
    report.incidents = report
        .all_verdicts
        .iter()
        .filter(|v| !v.compliant)
        .cloned()
        .collect();
    report.overall_compliant = report.incidents.is_empty();
}

#[derive(Debug, Clone)]
struct ChecklistEntry {
    status: ChecklistStatus,
    last_verified: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
}

/// Process-wide checklist memory. Prevents a satisfied checklist rule (a
/// badge shown once) from being re-flagged every window for its whole
/// validity period.
#[derive(Debug, Default)]
pub struct ChecklistStore {
    states: HashMap<String, ChecklistEntry>,
}

impl ChecklistStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile a window's checklist verdicts with stored state.
    ///
    /// A rule inside its validity period is held compliant regardless of the
    /// window's verdict. An expired rule is re-evaluated on this window's own
    /// evidence; whatever the verdict says then stands, and a fresh
    /// compliant verdict restarts the validity period.
    pub fn apply(&mut self, policy: &Policy, report: &mut Report, now: DateTime<Utc>) {
        let mut changed = false;
        for verdict in &mut report.all_verdicts {
            let Some(rule) = policy.rules.iter().find(|r| r.id == verdict.rule_id) else {
                continue;
            };
            if rule.mode != RuleMode::Checklist {
                continue;
            }

            let held = match self.states.get_mut(&rule.id) {
                Some(entry) if entry.status == ChecklistStatus::Compliant => {
                    match entry.expires_at {
                        Some(expiry) if now > expiry => {
                            entry.status = ChecklistStatus::Expired;
                            info!("checklist rule {} expired at {expiry}", rule.id);
                            false
                        }
                        _ => true,
                    }
                }
                _ => false,
            };

            if held {
                let entry = &self.states[&rule.id];
                if !verdict.compliant {
                    verdict.compliant = true;
                    verdict.reason = format!(
                        "Checklist requirement verified earlier{}; still within its validity period.",
                        entry
                            .last_verified
                            .map(|t| format!(" at {}", t.to_rfc3339()))
                            .unwrap_or_default()
                    );
                    changed = true;
                }
                verdict.checklist_status = Some(ChecklistStatus::Compliant);
                verdict.expires_at = entry.expires_at;
                continue;
            }

            if verdict.compliant {
                let expires_at = verdict.expires_at.or_else(|| {
                    rule.validity_duration
                        .map(|secs| now + chrono::Duration::seconds(secs as i64))
                });
                verdict.checklist_status = Some(ChecklistStatus::Compliant);
                verdict.expires_at = expires_at;
                self.states.insert(
                    rule.id.clone(),
                    ChecklistEntry {
                        status: ChecklistStatus::Compliant,
                        last_verified: Some(now),
                        expires_at,
                    },
                );
            } else {
                let was_expired = self
                    .states
                    .get(&rule.id)
                    .map(|e| e.status == ChecklistStatus::Expired)
                    .unwrap_or(false);
                verdict.checklist_status = Some(if was_expired {
                    ChecklistStatus::Expired
                } else {
                    ChecklistStatus::Pending
                });
                self.states.insert(
                    rule.id.clone(),
                    ChecklistEntry {
                        status: verdict.checklist_status.expect("set above"),
                        last_verified: None,
                        expires_at: None,
                    },
                );
            }
        }
        if changed {
            rebuild_incident_view(report);
        }
    }

    pub fn reset(&mut self) {
        self.states.clear();
        info!("checklist state reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Observation, Rule, Severity, TriggerReason, Verdict};

    fn rule(id: &str, frequency: RuleFrequency, mode: RuleMode) -> Rule {
        Rule {
            id: id.to_string(),
            description: format!("rule {id}"),
            rule_type: "custom".to_string(),
            severity: Severity::High,
            mode,
            validity_duration: Some(3600),
            frequency,
            frequency_count: None,
        }
    }

    fn verdict(id: &str, compliant: bool) -> Verdict {
        Verdict {
            rule_id: id.to_string(),
            rule_description: format!("rule {id}"),
            compliant,
            severity: Severity::High,
            reason: "as observed".to_string(),
            timestamp: Some(2.0),
            mode: RuleMode::Incident,
            checklist_status: None,
            expires_at: None,
        }
    }

    fn report_with(verdicts: Vec<Verdict>) -> Report {
        let mut report = Report::partial("vid".into(), Vec::new(), 6.0, "seed".into());
        report.error = None;
        report.summary = "window".into();
        report.overall_compliant = true;
        report.absorb_verdicts(verdicts);
        report
    }

    #[test]
    fn no_context_before_the_first_report() {
        let prior = PriorState::new();
        let policy = Policy {
            rules: vec![rule("r1", RuleFrequency::Always, RuleMode::Incident)],
            ..Policy::default()
        };
        assert!(prior.build_context(&policy).is_none());
    }

    #[test]
    fn at_least_once_rule_is_marked_satisfied() {
        let mut prior = PriorState::new();
        let policy = Policy {
            rules: vec![rule("hello", RuleFrequency::AtLeastOnce, RuleMode::Incident)],
            ..Policy::default()
        };

        prior.note_report(&policy, &report_with(vec![verdict("hello", true)]));
        let context = prior.build_context(&policy).unwrap();
        assert!(context.contains("SATISFIED"));
        assert!(context.contains("Do not re-flag"));
    }

    #[test]
    fn always_rules_are_never_suppressed() {
        let mut prior = PriorState::new();
        let policy = Policy {
            rules: vec![rule("helmet", RuleFrequency::Always, RuleMode::Incident)],
            ..Policy::default()
        };

        // Window K: compliant.
        prior.note_report(&policy, &report_with(vec![verdict("helmet", true)]));
        let context = prior.build_context(&policy).unwrap();
        assert!(context.contains("Re-evaluate"));

        // Window K+1: violation must stand despite the prior compliant verdict.
        let mut report = report_with(vec![verdict("helmet", false)]);
        prior.enforce_satisfied(&policy, &mut report);
        assert!(!report.overall_compliant);
        assert_eq!(report.incidents.len(), 1);
    }

    #[test]
    fn satisfied_rule_verdict_is_forced_compliant() {
        let mut prior = PriorState::new();
        let policy = Policy {
            rules: vec![rule("hello", RuleFrequency::AtLeastOnce, RuleMode::Incident)],
            ..Policy::default()
        };
        prior.note_report(&policy, &report_with(vec![verdict("hello", true)]));

        // Evaluator mistakenly re-flags in the next window.
        let mut report = report_with(vec![verdict("hello", false)]);
        prior.enforce_satisfied(&policy, &mut report);
        assert!(report.overall_compliant);
        assert!(report.incidents.is_empty());
        assert!(report.all_verdicts[0].reason.contains("already satisfied"));
    }

    #[test]
    fn transcript_accumulates_across_windows() {
        let mut prior = PriorState::new();
        let policy = Policy::default();
        let mut report = report_with(Vec::new());
        report.transcript = Some(crate::models::Transcript {
            full_text: "hello world".into(),
            ..Default::default()
        });
        prior.note_report(&policy, &report);

        let mut second = report_with(Vec::new());
        second.transcript = Some(crate::models::Transcript {
            full_text: "again".into(),
            ..Default::default()
        });
        prior.note_report(&policy, &second);

        assert_eq!(prior.accumulated_transcript(), "hello world again");
        assert_eq!(prior.window_index(), 2);
    }

    #[test]
    fn recent_activity_is_compact_and_bounded() {
        let mut prior = PriorState::new();
        let policy = Policy::default();
        let mut report = report_with(Vec::new());
        for i in 0..10 {
            report.frame_observations.push(Observation {
                index: i,
                timestamp: i as f64,
                trigger: TriggerReason::Changed,
                change_score: 0.2,
                image_base64: "aGk=".into(),
                description: format!("observation number {i} with detail"),
            });
        }
        prior.note_report(&policy, &report);
        assert_eq!(prior.recent_activity.len(), RECENT_ACTIVITY_LIMIT);
    }

    #[test]
    fn checklist_holds_within_validity_period() {
        let mut store = ChecklistStore::new();
        let policy = Policy {
            rules: vec![rule("badge", RuleFrequency::Always, RuleMode::Checklist)],
            ..Policy::default()
        };
        let now = Utc::now();

        // Window K: verified.
        let mut first = report_with(vec![verdict("badge", true)]);
        store.apply(&policy, &mut first, now);
        assert_eq!(
            first.all_verdicts[0].checklist_status,
            Some(ChecklistStatus::Compliant)
        );
        assert!(first.all_verdicts[0].expires_at.is_some());

        // Window K+1: evaluator no longer sees the badge; rule is held.
        let mut second = report_with(vec![verdict("badge", false)]);
        store.apply(&policy, &mut second, now + chrono::Duration::seconds(60));
        assert!(second.all_verdicts[0].compliant);
        assert!(second.overall_compliant);
        assert!(second.all_verdicts[0].reason.contains("validity period"));
    }

    #[test]
    fn checklist_expiry_requires_reverification() {
        let mut store = ChecklistStore::new();
        let policy = Policy {
            rules: vec![rule("badge", RuleFrequency::Always, RuleMode::Checklist)],
            ..Policy::default()
        };
        let now = Utc::now();

        let mut first = report_with(vec![verdict("badge", true)]);
        store.apply(&policy, &mut first, now);

        // Past expiry: the hold is gone, the window's own verdict stands.
        let later = now + chrono::Duration::seconds(7200);
        let mut second = report_with(vec![verdict("badge", false)]);
        store.apply(&policy, &mut second, later);
        assert!(!second.all_verdicts[0].compliant);
        assert_eq!(
            second.all_verdicts[0].checklist_status,
            Some(ChecklistStatus::Expired)
        );

        // Re-verification restarts the validity period.
        let mut third = report_with(vec![verdict("badge", true)]);
        store.apply(&policy, &mut third, later + chrono::Duration::seconds(60));
        assert_eq!(
            third.all_verdicts[0].checklist_status,
            Some(ChecklistStatus::Compliant)
        );
        assert!(third.all_verdicts[0].expires_at.unwrap() > later);
    }

    #[test]
    fn reset_clears_held_state() {
        let mut store = ChecklistStore::new();
        let policy = Policy {
            rules: vec![rule("badge", RuleFrequency::Always, RuleMode::Checklist)],
            ..Policy::default()
        };
        let now = Utc::now();
        let mut first = report_with(vec![verdict("badge", true)]);
        store.apply(&policy, &mut first, now);
        store.reset();

        let mut second = report_with(vec![verdict("badge", false)]);
        store.apply(&policy, &mut second, now + chrono::Duration::seconds(1));
        assert!(!second.all_verdicts[0].compliant);
        assert_eq!(
            second.all_verdicts[0].checklist_status,
            Some(ChecklistStatus::Pending)
        );
    }
}
