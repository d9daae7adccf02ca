//! Streaming change-detection and keyframe-dispatch engine for policy-based
//! video monitoring.
//!
//! The pipeline per session:
//!
//! ```text
//! Frame Source -> [Capture Ring if live] -> Change Detector -> Debouncer
//!     -> Keyframe Sink -> Dispatch Engine -> external VLM / evaluator
//! ```
//!
//! The expensive part of the product is the external vision model; the whole
//! point of this crate is deciding, in real time and under bounded memory,
//! which few frames are worth paying for. Everything past the sink talks to
//! external collaborators through the traits in [`dispatch`].

pub mod config;
pub mod detect;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod ring;
pub mod session;
pub mod sink;
pub mod source;
pub mod utils;

pub use config::EngineConfig;
pub use error::{ClientError, EngineError};
pub use models::{
    Frame, KeyframeCandidate, Observation, Policy, Report, Rule, Transcript, TriggerReason,
    Verdict,
};
pub use session::{EndReason, ProgressEvent, Session, SessionManager};
