//! Keyframe dispatch: fans observation batches out to the vision model, then
//! observations + transcript + policy into the compliance evaluator, with
//! per-session ordering, at-most-one-in-flight backpressure, bounded
//! retries, and process-wide rate limiting.

pub mod client;
pub mod engine;
pub mod prompt;
pub mod rate_limit;

pub use client::{
    DescribeImage, DescribeRequest, EvaluationRequest, PolicyEvaluator, ReportBody,
    TranscribeRequest, Transcriber, VisionModel,
};
pub use engine::{DispatchEngine, DispatchJob, DispatchState};
pub use rate_limit::RateLimiter;
