//! Audio capture for transcription: 16 kHz mono WAV via ffmpeg, the format
//! speech models expect.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use tokio::process::Command;

use super::ffmpeg::live_input_args;

/// Files below this size have no usable audio payload (header only).
const MIN_AUDIO_BYTES: usize = 1000;

const EXTRACT_TIMEOUT: Duration = Duration::from_secs(60);

/// Extract the full audio track of a file. `Ok(None)` when the file has no
/// usable audio.
pub async fn extract_file_audio(path: &str) -> Result<Option<Vec<u8>>> {
    let args: Vec<String> = vec!["-i".into(), path.into()];
    run_audio_pipeline(&args, None).await
}

/// Record `duration` seconds of audio from a live source. `Ok(None)` when
/// the source carries no audio.
pub async fn record_live_audio(uri: &str, duration: f64) -> Result<Option<Vec<u8>>> {
    let args = live_input_args(uri);
    run_audio_pipeline(&args, Some(duration)).await
}

async fn run_audio_pipeline(input_args: &[String], duration: Option<f64>) -> Result<Option<Vec<u8>>> {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-nostdin").arg("-loglevel").arg("error");
    cmd.args(input_args);
    if let Some(secs) = duration {
        cmd.arg("-t").arg(format!("{secs:.2}"));
    }
    cmd.args([
        "-vn", // no video
        "-acodec",
        "pcm_s16le",
        "-ar",
        "16000",
        "-ac",
        "1",
        "-f",
        "wav",
        "pipe:1",
    ])
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .stdin(Stdio::null())
    .kill_on_drop(true);

    let wait = duration
        .map(|secs| Duration::from_secs_f64(secs) + EXTRACT_TIMEOUT)
        .unwrap_or(EXTRACT_TIMEOUT);
    let output = tokio::time::timeout(wait, cmd.output())
        .await
        .context("audio extraction timed out")?
        .context("failed to run ffmpeg for audio extraction")?;

    if !output.status.success() || output.stdout.len() < MIN_AUDIO_BYTES {
        info!(
            "no usable audio track (status: {:?}, {} bytes)",
            output.status.code(),
            output.stdout.len()
        );
        return Ok(None);
    }

    Ok(Some(output.stdout))
}
