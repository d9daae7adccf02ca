//! Condensed focus prompts for describe calls, derived from the policy so
//! the vision model attends to what the rules actually care about.

use crate::models::{MatchMode, Policy, ReferenceCategory};

/// Severity-tagged rule digest plus custom context. Empty when the policy
/// has nothing visual to focus on.
pub fn focus_prompt(policy: &Policy) -> String {
    let visual_rules = policy.visual_rules();
    let references = policy.enabled_references();
    if visual_rules.is_empty() && policy.custom_prompt.is_empty() && references.is_empty() {
        return String::new();
    }

    let mut parts = vec!["Pay special attention to the following compliance requirements:".into()];
    for rule in &visual_rules {
        parts.push(format!(
            "- [{}] {}",
            severity_tag(rule.severity),
            rule.description
        ));
    }
    if !policy.custom_prompt.is_empty() {
        parts.push(format!("\nAdditional context: {}", policy.custom_prompt));
    }
    if !references.is_empty() {
        parts.push(reference_instructions(policy));
    }
    parts.join("\n")
}

/// Structured per-reference check instructions. Reference images precede the
/// surveillance frames in the describe call, so the instructions index them
/// by position.
fn reference_instructions(policy: &Policy) -> String {
    let references = policy.enabled_references();
    let mut parts = vec![
        "\nVISUAL REFERENCE IMAGES are provided before the surveillance frames.".to_string(),
        "For EACH reference image, answer the checks listed below.\n".to_string(),
    ];

    for (i, reference) in references.iter().enumerate() {
        let mode_label = match reference.match_mode {
            MatchMode::MustMatch => "AUTHORIZED",
            MatchMode::MustNotMatch => "UNAUTHORIZED",
        };
        parts.push(format!(
            "  REFERENCE {} [{}] [{}]: \"{}\"",
            i + 1,
            category_tag(reference.category),
            mode_label,
            reference.label
        ));

        let checks: Vec<&String> = reference
            .checks
            .iter()
            .filter(|c| !c.trim().is_empty())
            .collect();
        if checks.is_empty() {
            parts.push(match reference.match_mode {
                MatchMode::MustMatch => {
                    "    Check: Is this present/visible in the frame?".to_string()
                }
                MatchMode::MustNotMatch => {
                    "    Check: Is this present? It should NOT be.".to_string()
                }
            });
        } else {
            parts.push("    Checks for this reference:".to_string());
            for (ci, check) in checks.iter().enumerate() {
                parts.push(format!("      {}. {}", ci + 1, check));
            }
        }
        parts.push(String::new());
    }

    parts.push(
        "For each reference, answer each check explicitly. Be conclusive: state YES or NO, \
         then explain. For people compare facial features, hair, clothing, build; for badges \
         compare color, shape, logo, text; for objects compare shape, size, color, markings."
            .to_string(),
    );
    parts.join("\n")
}

fn severity_tag(severity: crate::models::Severity) -> &'static str {
    match severity {
        crate::models::Severity::Low => "LOW",
        crate::models::Severity::Medium => "MEDIUM",
        crate::models::Severity::High => "HIGH",
        crate::models::Severity::Critical => "CRITICAL",
    }
}

fn category_tag(category: ReferenceCategory) -> &'static str {
    match category {
        ReferenceCategory::People => "PEOPLE",
        ReferenceCategory::Badges => "BADGES",
        ReferenceCategory::Objects => "OBJECTS",
    }
}
