//! Unbounded live source: camera device or network stream.
//!
//! Decode failures are recoverable. The child is respawned with bounded
//! exponential backoff (100 ms to 5 s, reset on success); only after 30
//! consecutive failures does the source give up with `UnreadableSource`.
//! Timestamps are synthesized from wall clock at the point of decode, since
//! live inputs may not carry usable container timestamps.

use std::time::Duration;

use log::{info, warn};
use tokio::time::{timeout, Instant};

use crate::error::EngineError;
use crate::models::Frame;

use super::ffmpeg::{live_input_args, FfmpegDecoder};
use super::probe::probe;

const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_FAILURES: u32 = 30;

pub struct LiveSource {
    uri: String,
    decoder: Option<FfmpegDecoder>,
    width: u32,
    height: u32,
    origin: Instant,
    next_index: u64,
    consecutive_failures: u32,
    backoff: Duration,
    read_timeout: Duration,
}

impl LiveSource {
    pub async fn open(uri: &str, read_timeout: Duration) -> Result<Self, EngineError> {
        let mut source = Self {
            uri: uri.to_string(),
            decoder: None,
            width: 0,
            height: 0,
            origin: Instant::now(),
            next_index: 0,
            consecutive_failures: 0,
            backoff: BACKOFF_MIN,
            read_timeout,
        };

        // The first connection must succeed; a source that never produced a
        // frame is unreadable, not recovering.
        source
            .respawn()
            .await
            .map_err(|err| EngineError::UnreadableSource(format!("{uri}: {err}")))?;

        Ok(source)
    }

    /// Re-probe and restart the decoder child. Resolution is re-read on every
    /// respawn, so a stream that comes back resized flows through as frames
    /// with new dimensions (downstream resets its reference on mismatch).
    async fn respawn(&mut self) -> anyhow::Result<()> {
        self.decoder = None;
        let meta = probe(&self.uri).await?;
        self.width = meta.width;
        self.height = meta.height;

        let args = live_input_args(&self.uri);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.decoder = Some(FfmpegDecoder::spawn(&args, meta.width, meta.height)?);
        info!(
            "live source connected: {} at {}x{}",
            self.uri, meta.width, meta.height
        );
        Ok(())
    }

    async fn note_failure(&mut self, what: &str) -> Result<(), EngineError> {
        self.consecutive_failures += 1;
        warn!(
            "live source failure {}/{} ({what}): backing off {:?}",
            self.consecutive_failures, MAX_CONSECUTIVE_FAILURES, self.backoff
        );
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            return Err(EngineError::UnreadableSource(format!(
                "{}: {} consecutive decode failures",
                self.uri, self.consecutive_failures
            )));
        }
        tokio::time::sleep(self.backoff).await;
        self.backoff = (self.backoff * 2).min(BACKOFF_MAX);
        Ok(())
    }

    /// Next decoded frame. Blocks through reconnect attempts; the only error
    /// it returns is a fatal `UnreadableSource` after the failure budget.
    pub async fn next(&mut self) -> Result<Frame, EngineError> {
        loop {
            if self.decoder.is_none() {
                if let Err(err) = self.respawn().await {
                    self.note_failure(&err.to_string()).await?;
                    continue;
                }
            }

            let decoder = self.decoder.as_mut().expect("decoder present after respawn");
            match timeout(self.read_timeout, decoder.read_frame()).await {
                Ok(Ok(Some(data))) => {
                    self.consecutive_failures = 0;
                    self.backoff = BACKOFF_MIN;
                    let index = self.next_index;
                    self.next_index += 1;
                    let timestamp = self.origin.elapsed().as_secs_f64();
                    return Ok(Frame::new(index, timestamp, self.width, self.height, data));
                }
                Ok(Ok(None)) => {
                    let detail = decoder.last_stderr();
                    self.decoder = None;
                    self.note_failure(&format!("stream ended: {detail}")).await?;
                }
                Ok(Err(err)) => {
                    self.decoder = None;
                    self.note_failure(&err.to_string()).await?;
                }
                Err(_) => {
                    self.decoder = None;
                    self.note_failure("read timed out").await?;
                }
            }
        }
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
