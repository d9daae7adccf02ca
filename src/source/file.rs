//! Bounded file source: sequential forward decode, never seeks.
//!
//! Container seek on compressed video is 5-10x slower than sequential decode
//! because the decoder must hunt for the nearest I-frame and roll forward.
//! We keep our own frame counter and derive timestamps by construction.

use anyhow::Result;

use crate::error::EngineError;
use crate::models::Frame;

use super::ffmpeg::{file_input_args, FfmpegDecoder};
use super::probe::{probe, VideoMeta};

pub struct FileSource {
    decoder: FfmpegDecoder,
    meta: VideoMeta,
    next_index: u64,
}

impl FileSource {
    pub async fn open(path: &str) -> Result<Self, EngineError> {
        let meta = probe(path)
            .await
            .map_err(|err| EngineError::UnreadableSource(format!("{path}: {err}")))?;

        let args = file_input_args(path);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let decoder = FfmpegDecoder::spawn(&args, meta.width, meta.height)
            .map_err(|err| EngineError::UnreadableSource(format!("{path}: {err}")))?;

        Ok(Self {
            decoder,
            meta,
            next_index: 0,
        })
    }

    pub fn meta(&self) -> &VideoMeta {
        &self.meta
    }

    /// Next decoded frame, or `None` at end of stream. Timestamps come from
    /// the container frame rate: `index / fps`.
    pub async fn next(&mut self) -> Result<Option<Frame>, EngineError> {
        let data = self
            .decoder
            .read_frame()
            .await
            .map_err(|err| EngineError::Decode(format!("{err}; {}", self.decoder.last_stderr())))?;

        let Some(data) = data else {
            return Ok(None);
        };

        let index = self.next_index;
        self.next_index += 1;
        let timestamp = if self.meta.fps > 0.0 {
            index as f64 / self.meta.fps
        } else {
            0.0
        };

        Ok(Some(Frame::new(
            index,
            timestamp,
            self.meta.width,
            self.meta.height,
            data,
        )))
    }

    /// Decoded frames per sample step at the configured cadence; at least 1.
    pub fn sample_step(&self, sample_interval: f64) -> u64 {
        ((self.meta.fps * sample_interval) as u64).max(1)
    }
}
