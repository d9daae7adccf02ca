//! Session lifecycle: one owner per running analysis or camera.
//!
//! A session exclusively owns its source, detector state, ring, sink, and
//! dispatch engine; the manager only holds the cancellation token and task
//! handle needed for `stop`. The rate limiter and checklist store are the
//! process-global exceptions, shared across sessions behind locks.

pub mod file_worker;
pub mod live_worker;
pub mod prior;
pub mod progress;

pub use prior::{ChecklistStore, PriorState};
pub use progress::{EndReason, ProgressEvent};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use log::info;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dispatch::{DispatchEngine, PolicyEvaluator, RateLimiter, Transcriber, VisionModel};
use crate::models::Policy;

/// Shared handles a worker needs to run one session.
#[derive(Clone)]
pub(crate) struct WorkerCtx {
    pub config: EngineConfig,
    pub engine: Arc<DispatchEngine>,
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub checklist: Arc<Mutex<ChecklistStore>>,
    pub events: mpsc::UnboundedSender<ProgressEvent>,
    pub cancel: CancellationToken,
    pub session_id: String,
    pub include_audio: bool,
}

impl WorkerCtx {
    pub fn emit(&self, event: ProgressEvent) {
        // A dropped receiver just means nobody is watching anymore.
        let _ = self.events.send(event);
    }
}

/// A running session as handed to the caller: its id plus the progress
/// stream. The stream is finite for files, indefinite for live monitoring,
/// and always terminates with an `Ended` event.
pub struct Session {
    pub id: String,
    pub events: mpsc::UnboundedReceiver<ProgressEvent>,
}

struct ActiveSession {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct SessionManager {
    config: EngineConfig,
    vision: Arc<dyn VisionModel>,
    evaluator: Arc<dyn PolicyEvaluator>,
    transcriber: Option<Arc<dyn Transcriber>>,
    limiter: RateLimiter,
    checklist: Arc<Mutex<ChecklistStore>>,
    sessions: tokio::sync::Mutex<HashMap<String, ActiveSession>>,
}

impl SessionManager {
    pub fn new(
        vision: Arc<dyn VisionModel>,
        evaluator: Arc<dyn PolicyEvaluator>,
        transcriber: Option<Arc<dyn Transcriber>>,
        config: EngineConfig,
    ) -> Self {
        let limiter = RateLimiter::new(config.rate_limit_per_minute, config.rate_limit_per_hour);
        Self {
            config,
            vision,
            evaluator,
            transcriber,
            limiter,
            checklist: Arc::new(Mutex::new(ChecklistStore::new())),
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Analyze a video file to completion: one report on the progress
    /// stream, then the session terminates.
    pub async fn start_file_analysis(&self, path: &str, policy: Policy) -> Result<Session> {
        validate_policy(&policy)?;
        let (session, ctx) = self.prepare_session(&policy).await;
        let path = path.to_string();
        let task = tokio::spawn(file_worker::run_file(path, policy, ctx.clone()));
        self.register(&session.id, ctx.cancel.clone(), task).await;
        Ok(session)
    }

    /// Monitor a live source until `stop`: one report per window on the
    /// progress stream.
    pub async fn start_live_monitoring(
        &self,
        uri: &str,
        policy: Policy,
        window_duration: Option<f64>,
    ) -> Result<Session> {
        validate_policy(&policy)?;
        let (session, ctx) = self.prepare_session(&policy).await;
        let uri = uri.to_string();
        let task = tokio::spawn(live_worker::run_live(
            uri,
            policy,
            window_duration,
            ctx.clone(),
        ));
        self.register(&session.id, ctx.cancel.clone(), task).await;
        Ok(session)
    }

    /// Cooperative cancel. In-flight model calls are allowed to complete but
    /// their results are discarded; the session's tasks observe cancellation
    /// at their next suspension point. Returns false for an unknown id.
    pub async fn stop(&self, session_id: &str) -> bool {
        let entry = self.sessions.lock().await.remove(session_id);
        let Some(active) = entry else {
            return false;
        };
        info!("stopping session {session_id}");
        active.cancel.cancel();
        let _ = active.task.await;
        true
    }

    /// Stop every running session.
    pub async fn stop_all(&self) {
        let drained: Vec<(String, ActiveSession)> =
            self.sessions.lock().await.drain().collect();
        for (id, active) in drained {
            info!("stopping session {id}");
            active.cancel.cancel();
            let _ = active.task.await;
        }
    }

    /// Clear process-wide checklist state.
    pub fn reset_state(&self) {
        self.checklist
            .lock()
            .expect("checklist lock poisoned")
            .reset();
    }

    /// Ids of sessions whose worker is still running.
    pub async fn active_sessions(&self) -> Vec<String> {
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|(_, active)| !active.task.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn prepare_session(&self, policy: &Policy) -> (Session, WorkerCtx) {
        let session_id = Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(DispatchEngine::new(
            Arc::clone(&self.vision),
            Arc::clone(&self.evaluator),
            self.limiter.clone(),
            &self.config,
        ));

        let ctx = WorkerCtx {
            config: self.config.clone(),
            engine,
            transcriber: self.transcriber.clone(),
            checklist: Arc::clone(&self.checklist),
            events: events_tx,
            cancel: CancellationToken::new(),
            session_id: session_id.clone(),
            include_audio: policy.include_audio,
        };

        (
            Session {
                id: session_id,
                events: events_rx,
            },
            ctx,
        )
    }

    async fn register(&self, session_id: &str, cancel: CancellationToken, task: JoinHandle<()>) {
        let mut sessions = self.sessions.lock().await;
        // Completed sessions are reaped lazily on the next start.
        sessions.retain(|_, active| !active.task.is_finished());
        sessions.insert(session_id.to_string(), ActiveSession { cancel, task });
    }
}

fn validate_policy(policy: &Policy) -> Result<()> {
    if policy.is_empty() {
        bail!("policy must contain at least one rule or a custom prompt");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{
        DescribeRequest, EvaluationRequest, ReportBody,
    };
    use crate::error::ClientError;
    use async_trait::async_trait;

    struct NullVision;

    #[async_trait]
    impl VisionModel for NullVision {
        async fn describe(&self, request: DescribeRequest) -> Result<Vec<String>, ClientError> {
            Ok(vec![String::from("empty scene"); request.images.len()])
        }
    }

    struct NullEvaluator;

    #[async_trait]
    impl PolicyEvaluator for NullEvaluator {
        async fn evaluate(&self, _request: EvaluationRequest) -> Result<ReportBody, ClientError> {
            Ok(ReportBody {
                summary: "nothing to report".into(),
                overall_compliant: true,
                verdicts: Vec::new(),
                recommendations: Vec::new(),
            })
        }
    }

    fn manager() -> SessionManager {
        SessionManager::new(
            Arc::new(NullVision),
            Arc::new(NullEvaluator),
            None,
            EngineConfig::default(),
        )
    }

    fn simple_policy() -> Policy {
        Policy {
            custom_prompt: "anything notable".into(),
            ..Policy::default()
        }
    }

    #[tokio::test]
    async fn empty_policy_is_rejected() {
        let manager = manager();
        let result = manager
            .start_file_analysis("/tmp/whatever.mp4", Policy::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unreadable_file_ends_with_error_event() {
        let manager = manager();
        let mut session = manager
            .start_file_analysis("/nonexistent/video.mp4", simple_policy())
            .await
            .unwrap();

        let mut ended = None;
        while let Some(event) = session.events.recv().await {
            if let ProgressEvent::Ended(reason) = event {
                ended = Some(reason);
                break;
            }
        }
        match ended {
            Some(EndReason::Error(reason)) => {
                assert!(reason.contains("unreadable source"), "reason: {reason}")
            }
            other => panic!("expected error end, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_live_source_ends_with_source_unreachable() {
        let manager = manager();
        let mut session = manager
            .start_live_monitoring("rtsp://127.0.0.1:1/none", simple_policy(), None)
            .await
            .unwrap();

        let mut ended = None;
        while let Some(event) = session.events.recv().await {
            if let ProgressEvent::Ended(reason) = event {
                ended = Some(reason);
                break;
            }
        }
        assert_eq!(ended, Some(EndReason::SourceUnreachable));
    }

    #[tokio::test]
    async fn stopping_an_unknown_session_is_a_noop() {
        let manager = manager();
        assert!(!manager.stop("no-such-session").await);
    }
}
