//! Dispatch state machine: Idle -> Describing -> Evaluating -> Reporting,
//! with bounded retries and an explicit at-most-one-in-flight invariant per
//! engine (one engine per session; the dispatcher task drives windows
//! sequentially).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::warn;
use rand::Rng;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{ClientError, EngineError};
use crate::models::{
    ChecklistStatus, Observation, Policy, Report, Rule, RuleMode, Transcript, Verdict,
};

use super::client::{
    DescribeImage, DescribeRequest, EvaluationRequest, PolicyEvaluator, ReportBody, VisionModel,
};
use super::prompt;
use super::rate_limit::RateLimiter;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Attempts per external call, including the first.
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatchState {
    Idle = 0,
    Describing = 1,
    Evaluating = 2,
    Reporting = 3,
    Retrying = 4,
}

/// One analysis window handed to the engine as a whole unit.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub video_id: String,
    pub observations: Vec<Observation>,
    pub policy: Policy,
    pub transcript: Option<Transcript>,
    /// Transcript text carried over from earlier windows of a live session.
    pub accumulated_transcript: String,
    pub video_duration: f64,
}

pub struct DispatchEngine {
    vision: Arc<dyn VisionModel>,
    evaluator: Arc<dyn PolicyEvaluator>,
    limiter: RateLimiter,
    batch_size: usize,
    describe_timeout: Duration,
    evaluate_timeout: Duration,
    state: AtomicU8,
}

impl DispatchEngine {
    pub fn new(
        vision: Arc<dyn VisionModel>,
        evaluator: Arc<dyn PolicyEvaluator>,
        limiter: RateLimiter,
        config: &EngineConfig,
    ) -> Self {
        Self {
            vision,
            evaluator,
            limiter,
            batch_size: config.dispatch_batch_size.max(1),
            describe_timeout: config.describe_timeout,
            evaluate_timeout: config.evaluate_timeout,
            state: AtomicU8::new(DispatchState::Idle as u8),
        }
    }

    pub fn state(&self) -> DispatchState {
        match self.state.load(Ordering::SeqCst) {
            1 => DispatchState::Describing,
            2 => DispatchState::Evaluating,
            3 => DispatchState::Reporting,
            4 => DispatchState::Retrying,
            _ => DispatchState::Idle,
        }
    }

    fn enter(&self, next: DispatchState) {
        self.state.store(next as u8, Ordering::SeqCst);
    }

    /// Run one window to a report. Transient collaborator failures are
    /// retried; persistent failures produce a partial report rather than an
    /// error. The only error paths out are cancellation and caller bugs.
    pub async fn run_window(
        &self,
        mut job: DispatchJob,
        cancel: &CancellationToken,
    ) -> Result<Report, EngineError> {
        debug_assert_eq!(
            self.state(),
            DispatchState::Idle,
            "a second window entered dispatch while one was in flight"
        );
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // --- Describing ---
        self.enter(DispatchState::Describing);
        if let Err(err) = self.describe_all(&mut job, cancel).await {
            self.enter(DispatchState::Idle);
            return match err {
                EngineError::Cancelled => Err(EngineError::Cancelled),
                EngineError::Client(client_err) => Ok(self.give_up(&job, client_err.to_string())),
                other => Err(other),
            };
        }

        // --- Evaluating ---
        self.enter(DispatchState::Evaluating);
        let report = match self.evaluate_window(&job, cancel).await {
            Ok(report) => report,
            Err(EngineError::Client(client_err)) => {
                self.enter(DispatchState::Idle);
                return Ok(self.give_up(&job, client_err.to_string()));
            }
            Err(err) => {
                self.enter(DispatchState::Idle);
                return Err(err);
            }
        };

        // --- Reporting ---
        self.enter(DispatchState::Reporting);
        log_info!(
            "window report for {}: {} ({} incidents, {} frames)",
            job.video_id,
            if report.overall_compliant {
                "COMPLIANT"
            } else {
                "NON-COMPLIANT"
            },
            report.incidents.len(),
            report.total_frames_analyzed
        );
        self.enter(DispatchState::Idle);
        Ok(report)
    }

    /// Fill in descriptions for every observation, batch by batch, with at
    /// most one describe call in flight.
    async fn describe_all(
        &self,
        job: &mut DispatchJob,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if job.observations.is_empty() || !has_visual_work(&job.policy) {
            return Ok(());
        }

        let references: Vec<_> = job.policy.enabled_references().into_iter().cloned().collect();
        // Each reference rides along as an extra image in every call, so the
        // frame budget shrinks accordingly.
        let effective_batch = self.batch_size.saturating_sub(references.len()).max(1);
        let focus = prompt::focus_prompt(&job.policy);

        for batch in job.observations.chunks_mut(effective_batch) {
            let request = DescribeRequest {
                images: batch
                    .iter()
                    .map(|obs| DescribeImage {
                        timestamp: obs.timestamp,
                        image_base64: obs.image_base64.clone(),
                    })
                    .collect(),
                focus_prompt: focus.clone(),
                references: references.clone(),
            };

            let descriptions = self
                .with_retries(cancel, "describe", || {
                    let request = request.clone();
                    async move {
                        timeout(self.describe_timeout, self.vision.describe(request))
                            .await
                            .unwrap_or_else(|_| {
                                Err(ClientError::Transient("describe call timed out".into()))
                            })
                    }
                })
                .await?;

            for (i, obs) in batch.iter_mut().enumerate() {
                obs.description = descriptions
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| "No observation returned for this frame.".to_string());
            }
        }
        Ok(())
    }

    /// Visual evaluation plus the speech-rule path, merged into one report.
    async fn evaluate_window(
        &self,
        job: &DispatchJob,
        cancel: &CancellationToken,
    ) -> Result<Report, EngineError> {
        let visual_rules: Vec<Rule> = job.policy.visual_rules().into_iter().cloned().collect();
        let speech_rules: Vec<Rule> = job.policy.speech_rules().into_iter().cloned().collect();
        let run_visual = has_visual_work(&job.policy) && !job.observations.is_empty();
        let run_speech = !speech_rules.is_empty() && job.policy.include_audio;

        let mut report = Report {
            video_id: job.video_id.clone(),
            summary: String::new(),
            overall_compliant: true,
            incidents: Vec::new(),
            all_verdicts: Vec::new(),
            recommendations: Vec::new(),
            frame_observations: job.observations.clone(),
            transcript: job.transcript.clone(),
            analyzed_at: Utc::now(),
            total_frames_analyzed: job.observations.len(),
            video_duration: job.video_duration,
            error: None,
        };

        if run_visual {
            let visual_policy = Policy {
                rules: visual_rules,
                include_audio: false,
                ..job.policy.clone()
            };
            let body = self
                .evaluate_with_parse_retry(
                    EvaluationRequest {
                        video_id: job.video_id.clone(),
                        observations: job.observations.clone(),
                        transcript: job.transcript.clone(),
                        policy: visual_policy,
                        video_duration: job.video_duration,
                        strict: false,
                    },
                    cancel,
                )
                .await?;

            report.summary = body.summary;
            report.recommendations = body.recommendations;
            report.absorb_verdicts(align_verdicts(&job.policy, body.verdicts));
        }

        if run_speech {
            let speech_verdicts = self
                .evaluate_speech(job, &speech_rules, cancel)
                .await?;
            let speech_incidents = speech_verdicts.iter().filter(|v| !v.compliant).count();
            report.absorb_verdicts(speech_verdicts);

            if report.summary.is_empty() {
                report.summary = format!(
                    "Speech analysis complete. {} violation(s) out of {} rules.",
                    speech_incidents,
                    report.all_verdicts.len()
                );
            } else if speech_incidents > 0 {
                report.summary.push_str(&format!(
                    " Speech analysis: {speech_incidents} audio violation(s) detected."
                ));
            }
        }

        if report.summary.is_empty() {
            report.summary = format!(
                "{} frame(s) observed; no rules to evaluate.",
                report.total_frames_analyzed
            );
        }
        Ok(report)
    }

    /// Speech rules run against the accumulated transcript. An empty
    /// transcript short-circuits without an evaluator call: nothing spoken
    /// cannot satisfy a speech rule.
    async fn evaluate_speech(
        &self,
        job: &DispatchJob,
        speech_rules: &[Rule],
        cancel: &CancellationToken,
    ) -> Result<Vec<Verdict>, EngineError> {
        let current_text = job
            .transcript
            .as_ref()
            .map(|t| t.full_text.trim())
            .unwrap_or("");
        let has_text = !current_text.is_empty() || !job.accumulated_transcript.trim().is_empty();

        if !has_text {
            return Ok(speech_rules
                .iter()
                .map(|rule| {
                    let mut verdict = Verdict {
                        rule_id: rule.id.clone(),
                        rule_description: rule.description.clone(),
                        compliant: false,
                        severity: rule.severity,
                        reason: "No speech detected. Cannot evaluate speech compliance.".to_string(),
                        timestamp: None,
                        mode: rule.mode,
                        checklist_status: None,
                        expires_at: None,
                    };
                    if rule.mode == RuleMode::Checklist {
                        verdict.checklist_status = Some(ChecklistStatus::Pending);
                    }
                    verdict
                })
                .collect());
        }

        let mut transcript = job.transcript.clone().unwrap_or_default();
        if !job.accumulated_transcript.is_empty() {
            transcript.full_text = format!(
                "{} {}",
                job.accumulated_transcript.trim(),
                transcript.full_text
            )
            .trim()
            .to_string();
        }

        let speech_policy = Policy {
            rules: speech_rules.to_vec(),
            reference_images: Vec::new(),
            enabled_reference_ids: Vec::new(),
            ..job.policy.clone()
        };

        let body = self
            .evaluate_with_parse_retry(
                EvaluationRequest {
                    video_id: job.video_id.clone(),
                    observations: Vec::new(),
                    transcript: Some(transcript),
                    policy: speech_policy,
                    video_duration: job.video_duration,
                    strict: false,
                },
                cancel,
            )
            .await?;

        Ok(align_verdicts(&job.policy, body.verdicts))
    }

    /// One evaluator call with the standard transient retry loop, plus a
    /// single strict-mode retry after a structured-output parse failure.
    async fn evaluate_with_parse_retry(
        &self,
        request: EvaluationRequest,
        cancel: &CancellationToken,
    ) -> Result<ReportBody, EngineError> {
        let first = self
            .with_retries(cancel, "evaluate", || {
                let request = request.clone();
                async move {
                    timeout(self.evaluate_timeout, self.evaluator.evaluate(request))
                        .await
                        .unwrap_or_else(|_| {
                            Err(ClientError::Transient("evaluate call timed out".into()))
                        })
                }
            })
            .await;

        match first {
            Err(EngineError::Client(ClientError::Parse(detail))) => {
                log_warn!("evaluator output unparseable ({detail}), retrying in strict mode");
                let strict_request = EvaluationRequest {
                    strict: true,
                    ..request
                };
                self.with_retries(cancel, "evaluate[strict]", || {
                    let request = strict_request.clone();
                    async move {
                        timeout(self.evaluate_timeout, self.evaluator.evaluate(request))
                            .await
                            .unwrap_or_else(|_| {
                                Err(ClientError::Transient("evaluate call timed out".into()))
                            })
                    }
                })
                .await
            }
            other => other,
        }
    }

    /// Transient-failure retry loop shared by all collaborator calls. Honors
    /// the rate limiter on every attempt, backs off exponentially with
    /// jitter, and discards results that complete after cancellation.
    async fn with_retries<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        mut call: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ClientError>>,
    {
        let mut delay = BACKOFF_BASE;
        for attempt in 1..=MAX_ATTEMPTS {
            self.limiter.acquire(cancel).await?;

            let result = call().await;
            if cancel.is_cancelled() {
                // In-flight call was allowed to complete; its result is
                // discarded per the cancellation contract.
                return Err(EngineError::Cancelled);
            }

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                    self.enter(DispatchState::Retrying);
                    let jittered = delay.mul_f64(0.5 + rand::thread_rng().gen::<f64>());
                    log_warn!(
                        "{what} attempt {attempt}/{MAX_ATTEMPTS} failed ({err}), retrying in {jittered:?}"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(jittered) => {}
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    }
                    delay = (delay * 2).min(BACKOFF_CAP);
                }
                Err(err) => {
                    log_warn!("{what} failed without retry budget: {err}");
                    return Err(EngineError::Client(err));
                }
            }
        }
        unreachable!("retry loop exits via return");
    }

    /// Persistent failure: emit a best-effort partial report, never raise.
    fn give_up(&self, job: &DispatchJob, error: String) -> Report {
        log_warn!("window for {} gave up: {error}", job.video_id);
        let mut report = Report::partial(
            job.video_id.clone(),
            job.observations.clone(),
            job.video_duration,
            error,
        );
        report.transcript = job.transcript.clone();
        report
    }
}

fn has_visual_work(policy: &Policy) -> bool {
    !policy.visual_rules().is_empty() || !policy.custom_prompt.is_empty()
}

/// Align evaluator verdicts with the policy: a verdict naming a rule absent
/// from the policy is dropped, and severity, mode, and description are
/// inherited from the rule so the evaluator cannot drift them.
fn align_verdicts(policy: &Policy, verdicts: Vec<Verdict>) -> Vec<Verdict> {
    let mut aligned = Vec::with_capacity(verdicts.len());
    for mut verdict in verdicts {
        let Some(rule) = policy.rules.iter().find(|r| r.id == verdict.rule_id) else {
            warn!(
                "dropping verdict for unknown rule id {:?}",
                verdict.rule_id
            );
            continue;
        };
        verdict.severity = rule.severity;
        verdict.mode = rule.mode;
        verdict.rule_description = rule.description.clone();
        if rule.mode == RuleMode::Checklist {
            if verdict.compliant {
                verdict.checklist_status = Some(ChecklistStatus::Compliant);
                if let Some(secs) = rule.validity_duration {
                    verdict.expires_at =
                        Some(Utc::now() + chrono::Duration::seconds(secs as i64));
                }
            } else if verdict.checklist_status.is_none() {
                verdict.checklist_status = Some(ChecklistStatus::Pending);
            }
        }
        aligned.push(verdict);
    }
    aligned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RuleFrequency, Severity};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;

    struct ScriptedVision {
        calls: AtomicUsize,
        concurrent: AtomicBool,
        in_call: AtomicBool,
        failures_before_success: AtomicUsize,
        batch_sizes: Mutex<Vec<usize>>,
    }

    impl ScriptedVision {
        fn new(failures_before_success: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                concurrent: AtomicBool::new(false),
                in_call: AtomicBool::new(false),
                failures_before_success: AtomicUsize::new(failures_before_success),
                batch_sizes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VisionModel for ScriptedVision {
        async fn describe(&self, request: DescribeRequest) -> Result<Vec<String>, ClientError> {
            if self.in_call.swap(true, Ordering::SeqCst) {
                self.concurrent.store(true, Ordering::SeqCst);
            }
            tokio::task::yield_now().await;
            self.in_call.store(false, Ordering::SeqCst);

            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batch_sizes
                .lock()
                .unwrap()
                .push(request.images.len());

            if self.failures_before_success.load(Ordering::SeqCst) > 0 {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                return Err(ClientError::Transient("503".into()));
            }
            Ok(request
                .images
                .iter()
                .map(|img| format!("scene at t={}", img.timestamp))
                .collect())
        }
    }

    struct ScriptedEvaluator {
        parse_failures: AtomicUsize,
        strict_seen: AtomicBool,
        verdict_rule_ids: Vec<(String, bool)>,
    }

    impl ScriptedEvaluator {
        fn compliant_for(rule_ids: &[(&str, bool)]) -> Self {
            Self {
                parse_failures: AtomicUsize::new(0),
                strict_seen: AtomicBool::new(false),
                verdict_rule_ids: rule_ids
                    .iter()
                    .map(|(id, ok)| (id.to_string(), *ok))
                    .collect(),
            }
        }

        fn with_parse_failures(mut self, n: usize) -> Self {
            self.parse_failures = AtomicUsize::new(n);
            self
        }
    }

    #[async_trait]
    impl PolicyEvaluator for ScriptedEvaluator {
        async fn evaluate(&self, request: EvaluationRequest) -> Result<ReportBody, ClientError> {
            if request.strict {
                self.strict_seen.store(true, Ordering::SeqCst);
            }
            if self.parse_failures.load(Ordering::SeqCst) > 0 {
                self.parse_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ClientError::Parse("not json".into()));
            }
            Ok(ReportBody {
                summary: "scripted summary".into(),
                overall_compliant: self.verdict_rule_ids.iter().all(|(_, ok)| *ok),
                verdicts: self
                    .verdict_rule_ids
                    .iter()
                    .map(|(id, ok)| Verdict {
                        rule_id: id.clone(),
                        rule_description: String::new(),
                        compliant: *ok,
                        severity: Severity::Low,
                        reason: "scripted".into(),
                        timestamp: Some(1.0),
                        mode: RuleMode::Incident,
                        checklist_status: None,
                        expires_at: None,
                    })
                    .collect(),
                recommendations: vec!["scripted rec".into()],
            })
        }
    }

    fn rule(id: &str) -> Rule {
        Rule {
            id: id.to_string(),
            description: format!("rule {id}"),
            rule_type: "ppe".to_string(),
            severity: Severity::High,
            mode: RuleMode::Incident,
            validity_duration: None,
            frequency: RuleFrequency::Always,
            frequency_count: None,
        }
    }

    fn observation(index: u64, ts: f64) -> Observation {
        Observation {
            index,
            timestamp: ts,
            trigger: crate::models::TriggerReason::Changed,
            change_score: 0.2,
            image_base64: "aGk=".to_string(),
            description: String::new(),
        }
    }

    fn job_with(observations: Vec<Observation>, policy: Policy) -> DispatchJob {
        DispatchJob {
            video_id: "vid0".into(),
            observations,
            policy,
            transcript: None,
            accumulated_transcript: String::new(),
            video_duration: 10.0,
        }
    }

    fn engine(
        vision: Arc<ScriptedVision>,
        evaluator: Arc<ScriptedEvaluator>,
    ) -> DispatchEngine {
        DispatchEngine::new(
            vision,
            evaluator,
            RateLimiter::new(1000, 10000),
            &EngineConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fills_descriptions_in_batches_of_five() {
        let vision = Arc::new(ScriptedVision::new(0));
        let evaluator = Arc::new(ScriptedEvaluator::compliant_for(&[("r1", true)]));
        let engine = engine(Arc::clone(&vision), Arc::clone(&evaluator));

        let observations: Vec<_> = (0..7).map(|i| observation(i, i as f64)).collect();
        let policy = Policy {
            rules: vec![rule("r1")],
            ..Policy::default()
        };
        let report = engine
            .run_window(job_with(observations, policy), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(vision.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*vision.batch_sizes.lock().unwrap(), vec![5, 2]);
        assert!(report
            .frame_observations
            .iter()
            .all(|obs| obs.description.starts_with("scene at")));
        assert!(!vision.concurrent.load(Ordering::SeqCst));
        assert_eq!(engine.state(), DispatchState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn reference_images_shrink_the_batch() {
        let vision = Arc::new(ScriptedVision::new(0));
        let evaluator = Arc::new(ScriptedEvaluator::compliant_for(&[("r1", true)]));
        let engine = engine(Arc::clone(&vision), evaluator);

        let policy = Policy {
            rules: vec![rule("r1")],
            reference_images: vec![crate::models::ReferenceImage {
                id: "ref1".into(),
                label: "badge".into(),
                image_base64: "aGk=".into(),
                category: crate::models::ReferenceCategory::Badges,
                match_mode: crate::models::MatchMode::MustMatch,
                checks: vec![],
            }],
            enabled_reference_ids: vec!["ref1".into()],
            ..Policy::default()
        };
        let observations: Vec<_> = (0..8).map(|i| observation(i, i as f64)).collect();
        engine
            .run_window(job_with(observations, policy), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*vision.batch_sizes.lock().unwrap(), vec![4, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let vision = Arc::new(ScriptedVision::new(2));
        let evaluator = Arc::new(ScriptedEvaluator::compliant_for(&[("r1", true)]));
        let engine = engine(Arc::clone(&vision), evaluator);

        let policy = Policy {
            rules: vec![rule("r1")],
            ..Policy::default()
        };
        let report = engine
            .run_window(
                job_with(vec![observation(0, 0.0)], policy),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(vision.calls.load(Ordering::SeqCst), 3);
        assert!(report.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_emit_partial_report() {
        let vision = Arc::new(ScriptedVision::new(99));
        let evaluator = Arc::new(ScriptedEvaluator::compliant_for(&[("r1", true)]));
        let engine = engine(vision, evaluator);

        let policy = Policy {
            rules: vec![rule("r1")],
            ..Policy::default()
        };
        let report = engine
            .run_window(
                job_with(vec![observation(0, 0.0)], policy),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.error.is_some());
        assert!(report.summary.contains("ANALYSIS ERROR"));
        assert_eq!(report.frame_observations.len(), 1);
        assert!(report.all_verdicts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn parse_failure_retries_once_in_strict_mode() {
        let vision = Arc::new(ScriptedVision::new(0));
        let evaluator = Arc::new(
            ScriptedEvaluator::compliant_for(&[("r1", true)]).with_parse_failures(1),
        );
        let engine = engine(vision, Arc::clone(&evaluator));

        let policy = Policy {
            rules: vec![rule("r1")],
            ..Policy::default()
        };
        let report = engine
            .run_window(
                job_with(vec![observation(0, 0.0)], policy),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(evaluator.strict_seen.load(Ordering::SeqCst));
        assert!(report.error.is_none());
        assert_eq!(report.all_verdicts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn double_parse_failure_reports_partially() {
        let vision = Arc::new(ScriptedVision::new(0));
        let evaluator = Arc::new(
            ScriptedEvaluator::compliant_for(&[("r1", true)]).with_parse_failures(2),
        );
        let engine = engine(vision, evaluator);

        let policy = Policy {
            rules: vec![rule("r1")],
            ..Policy::default()
        };
        let report = engine
            .run_window(
                job_with(vec![observation(0, 0.0)], policy),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.error.is_some());
        assert!(report.all_verdicts.is_empty());
        assert!(report.summary.contains("ANALYSIS ERROR"));
    }

    #[tokio::test(start_paused = true)]
    async fn verdicts_for_unknown_rules_are_dropped() {
        let vision = Arc::new(ScriptedVision::new(0));
        let evaluator = Arc::new(ScriptedEvaluator::compliant_for(&[
            ("r1", false),
            ("ghost", false),
        ]));
        let engine = engine(vision, evaluator);

        let policy = Policy {
            rules: vec![rule("r1")],
            ..Policy::default()
        };
        let report = engine
            .run_window(
                job_with(vec![observation(0, 0.0)], policy),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.all_verdicts.len(), 1);
        assert_eq!(report.all_verdicts[0].rule_id, "r1");
        // Severity inherited from the rule, not the evaluator's answer.
        assert_eq!(report.all_verdicts[0].severity, Severity::High);
        assert_eq!(report.incidents.len(), 1);
        assert!(!report.overall_compliant);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_audio_fails_speech_rules_without_an_evaluator_call() {
        let vision = Arc::new(ScriptedVision::new(0));
        let evaluator = Arc::new(ScriptedEvaluator::compliant_for(&[]));
        let engine = engine(vision, evaluator);

        let mut speech_rule = rule("s1");
        speech_rule.rule_type = "speech".to_string();
        let mut checklist_rule = rule("s2");
        checklist_rule.rule_type = "speech".to_string();
        checklist_rule.mode = RuleMode::Checklist;

        let policy = Policy {
            rules: vec![speech_rule, checklist_rule],
            include_audio: true,
            ..Policy::default()
        };
        let mut job = job_with(Vec::new(), policy);
        job.transcript = Some(Transcript::default());

        let report = engine
            .run_window(job, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.all_verdicts.len(), 2);
        assert!(report.all_verdicts.iter().all(|v| !v.compliant));
        assert!(report.all_verdicts[0].reason.contains("No speech detected"));
        assert_eq!(
            report.all_verdicts[1].checklist_status,
            Some(ChecklistStatus::Pending)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_discards_inflight_results() {
        let vision = Arc::new(ScriptedVision::new(0));
        let evaluator = Arc::new(ScriptedEvaluator::compliant_for(&[("r1", true)]));
        let engine = engine(vision, evaluator);

        let policy = Policy {
            rules: vec![rule("r1")],
            ..Policy::default()
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = engine
            .run_window(job_with(vec![observation(0, 0.0)], policy), &cancel)
            .await;

        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
