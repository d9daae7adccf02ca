//! Contracts for the external collaborators: vision model, policy evaluator,
//! and transcriber. The engine is generic over these seams; wire formats and
//! prompt engineering live on the other side.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::models::{Observation, Policy, ReferenceImage, Transcript, Verdict};

/// One image handed to the vision model, with its media timestamp so the
/// model can anchor descriptions in time.
#[derive(Debug, Clone)]
pub struct DescribeImage {
    pub timestamp: f64,
    pub image_base64: String,
}

/// A batched describe call: ordered surveillance frames, a condensed focus
/// prompt derived from the policy, and any enabled reference images.
#[derive(Debug, Clone)]
pub struct DescribeRequest {
    pub images: Vec<DescribeImage>,
    pub focus_prompt: String,
    pub references: Vec<ReferenceImage>,
}

/// Produces one textual description per input image, in input order.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn describe(&self, request: DescribeRequest) -> Result<Vec<String>, ClientError>;
}

/// Everything the evaluator needs to judge one analysis window.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub video_id: String,
    pub observations: Vec<Observation>,
    pub transcript: Option<Transcript>,
    pub policy: Policy,
    pub video_duration: f64,
    /// Set on the single retry after a structured-output parse failure; the
    /// evaluator should respond with its strictest output formatting.
    pub strict: bool,
}

/// The evaluator's structured answer for one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportBody {
    pub summary: String,
    pub overall_compliant: bool,
    pub verdicts: Vec<Verdict>,
    pub recommendations: Vec<String>,
}

#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(&self, request: EvaluationRequest) -> Result<ReportBody, ClientError>;
}

#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub audio: Vec<u8>,
    pub language_hint: Option<String>,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, request: TranscribeRequest) -> Result<Transcript, ClientError>;
}
