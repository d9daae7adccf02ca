use thiserror::Error;

/// Failures surfaced by the engine itself (as opposed to its external
/// collaborators, which fail with [`ClientError`]).
#[derive(Debug, Error)]
pub enum EngineError {
    /// The source could not be opened, or a live source exhausted its decode
    /// failure budget. Fatal to the session.
    #[error("unreadable source: {0}")]
    UnreadableSource(String),

    /// A single frame failed to decode. Transient; the caller skips the frame.
    #[error("decode error: {0}")]
    Decode(String),

    /// Cooperative stop. Not a failure; the session tears down cleanly.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Failures returned by the VLM / evaluator / transcriber collaborators.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Timeout, 429, 5xx. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// Authentication failure or 4xx other than 429. Never retried.
    #[error("permanent: {0}")]
    Permanent(String),

    /// Structured output could not be parsed or validated. Retried once in
    /// strict mode, then the window is reported partially.
    #[error("structured output parse failure: {0}")]
    Parse(String),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transient(_))
    }
}
