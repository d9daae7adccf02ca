//! Keyframe sink: turns accepted candidates into transport-ready
//! observations with stable, strictly increasing indexes.

pub mod writer;

pub use writer::DiskWriter;

use std::io::Cursor;
use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::config::EngineConfig;
use crate::models::{KeyframeCandidate, Observation};

pub struct KeyframeSink {
    max_width: u32,
    jpeg_quality: u8,
    next_index: u64,
    keyframes_dir: Option<PathBuf>,
    writer: Option<DiskWriter>,
}

impl KeyframeSink {
    /// `live` selects the higher single-frame JPEG quality.
    pub fn new(config: &EngineConfig, live: bool) -> Self {
        let writer = config.keyframes_dir.as_ref().map(|_| DiskWriter::new());
        Self {
            max_width: config.keyframe_max_width,
            jpeg_quality: config.jpeg_quality_u8(live),
            next_index: 0,
            keyframes_dir: config.keyframes_dir.clone(),
            writer,
        }
    }

    /// Downscale, encode, and index one accepted candidate. CPU-bound; the
    /// async path runs this under `spawn_blocking`. The observation index is
    /// assigned here, before any disk write is queued, so a dropped write can
    /// never duplicate or reorder observations.
    pub fn process(&mut self, candidate: &KeyframeCandidate) -> Result<Observation> {
        let jpeg = encode_jpeg(
            &candidate.frame.data,
            candidate.frame.width,
            candidate.frame.height,
            self.max_width,
            self.jpeg_quality,
        )?;

        let index = self.next_index;
        self.next_index += 1;

        if let (Some(dir), Some(writer)) = (&self.keyframes_dir, &self.writer) {
            writer.enqueue(dir.join(format!("change_{index:04}.jpg")), jpeg.clone());
        }

        Ok(Observation {
            index,
            timestamp: candidate.frame.timestamp,
            trigger: candidate.reason,
            change_score: (candidate.score * 10_000.0).round() / 10_000.0,
            image_base64: base64::engine::general_purpose::STANDARD.encode(&jpeg),
            description: String::new(),
        })
    }

    /// Drain pending disk writes. Call once at session end.
    pub async fn close(mut self) {
        if let Some(writer) = self.writer.take() {
            writer.close().await;
        }
    }

    pub fn emitted(&self) -> u64 {
        self.next_index
    }
}

/// Resize to at most `max_width` (aspect preserved, never upscaled) and
/// encode as JPEG.
fn encode_jpeg(
    rgb: &[u8],
    width: u32,
    height: u32,
    max_width: u32,
    quality: u8,
) -> Result<Vec<u8>> {
    let img = RgbImage::from_raw(width, height, rgb.to_vec())
        .context("frame buffer does not match its dimensions")?;

    let img = if width > max_width {
        let scale = max_width as f64 / width as f64;
        let new_height = ((height as f64 * scale).round() as u32).max(1);
        imageops::resize(&img, max_width, new_height, FilterType::CatmullRom)
    } else {
        img
    };

    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&img)
        .context("jpeg encode failed")?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Frame, TriggerReason};

    fn candidate(index: u64, ts: f64, w: u32, h: u32) -> KeyframeCandidate {
        KeyframeCandidate {
            frame: Frame::new(index, ts, w, h, vec![128; (w * h * 3) as usize]),
            reason: TriggerReason::Changed,
            score: 0.42,
        }
    }

    #[tokio::test]
    async fn indexes_are_strictly_monotonic() {
        let mut sink = KeyframeSink::new(&EngineConfig::default(), false);
        let a = sink.process(&candidate(0, 0.0, 64, 48)).unwrap();
        let b = sink.process(&candidate(5, 1.5, 64, 48)).unwrap();
        let c = sink.process(&candidate(9, 2.7, 64, 48)).unwrap();
        assert_eq!((a.index, b.index, c.index), (0, 1, 2));
        assert_eq!(sink.emitted(), 3);
    }

    #[tokio::test]
    async fn wide_frames_are_downscaled_to_max_width() {
        let mut sink = KeyframeSink::new(&EngineConfig::default(), false);
        let obs = sink.process(&candidate(0, 0.0, 1024, 512)).unwrap();

        let jpeg = base64::engine::general_purpose::STANDARD
            .decode(obs.image_base64)
            .unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 512);
        assert_eq!(decoded.height(), 256);
    }

    #[tokio::test]
    async fn small_frames_are_not_upscaled() {
        let mut sink = KeyframeSink::new(&EngineConfig::default(), false);
        let obs = sink.process(&candidate(0, 0.0, 64, 48)).unwrap();

        let jpeg = base64::engine::general_purpose::STANDARD
            .decode(obs.image_base64)
            .unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[tokio::test]
    async fn keyframes_are_persisted_when_dir_configured() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            keyframes_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let mut sink = KeyframeSink::new(&config, false);
        sink.process(&candidate(0, 0.0, 64, 48)).unwrap();
        sink.process(&candidate(3, 0.9, 64, 48)).unwrap();
        sink.close().await;

        assert!(dir.path().join("change_0000.jpg").exists());
        assert!(dir.path().join("change_0001.jpg").exists());
    }
}
