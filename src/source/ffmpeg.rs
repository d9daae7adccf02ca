//! Rawvideo decoder child process.
//!
//! One ffmpeg child per source, decoding to packed RGB24 on stdout. stderr is
//! drained concurrently by its own task; letting it back up past the pipe
//! buffer deadlocks the child against our stdout reads.

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

pub struct FfmpegDecoder {
    child: Child,
    stdout: ChildStdout,
    stderr_task: Option<JoinHandle<()>>,
    last_stderr: Arc<Mutex<String>>,
    frame_len: usize,
}

impl FfmpegDecoder {
    /// Spawn `ffmpeg` with the given input arguments, decoding the first
    /// video stream to rgb24 frames of `width` x `height` on stdout.
    pub fn spawn(input_args: &[&str], width: u32, height: u32) -> Result<Self> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-nostdin")
            .arg("-loglevel")
            .arg("warning")
            .args(input_args)
            .args(["-map", "0:v:0", "-an"])
            // Pin the output geometry so a mid-stream input resize cannot
            // desynchronize the fixed-size rawvideo framing.
            .arg("-vf")
            .arg(format!("scale={width}:{height}"))
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!("spawning decoder: {cmd:?}");
        let mut child = cmd.spawn().context("failed to spawn ffmpeg")?;

        let stdout = child
            .stdout
            .take()
            .context("ffmpeg stdout was not captured")?;
        let stderr = child
            .stderr
            .take()
            .context("ffmpeg stderr was not captured")?;

        let last_stderr = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&last_stderr);
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("ffmpeg: {line}");
                if !line.trim().is_empty() {
                    *sink.lock().expect("stderr sink lock poisoned") = line;
                }
            }
        });

        Ok(Self {
            child,
            stdout,
            stderr_task: Some(stderr_task),
            last_stderr,
            frame_len: (width * height * 3) as usize,
        })
    }

    /// Read exactly one frame. `Ok(None)` on clean end of stream.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.frame_len];
        match self.stdout.read_exact(&mut buf).await {
            Ok(_) => Ok(Some(buf)),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err).context("failed reading frame from decoder"),
        }
    }

    /// Most recent stderr line, for error context after a failure.
    pub fn last_stderr(&self) -> String {
        self.last_stderr
            .lock()
            .expect("stderr sink lock poisoned")
            .clone()
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        // kill_on_drop reaps the child; the drain task ends at pipe close.
        let _ = self.child.start_kill();
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// Input argument set for a file path.
pub fn file_input_args(path: &str) -> Vec<String> {
    vec!["-i".to_string(), path.to_string()]
}

/// Input argument set for a live device or URL.
///
/// Accepted forms: a V4L2 device path (`/dev/video0`), a bare device index
/// (`"0"`), or a network URL (`rtsp://`, `http://`, `https://`).
pub fn live_input_args(uri: &str) -> Vec<String> {
    if let Ok(index) = uri.parse::<u32>() {
        return vec![
            "-f".to_string(),
            "v4l2".to_string(),
            "-i".to_string(),
            format!("/dev/video{index}"),
        ];
    }
    if uri.starts_with("/dev/") {
        return vec![
            "-f".to_string(),
            "v4l2".to_string(),
            "-i".to_string(),
            uri.to_string(),
        ];
    }
    if uri.starts_with("rtsp://") {
        return vec![
            "-rtsp_transport".to_string(),
            "tcp".to_string(),
            "-i".to_string(),
            uri.to_string(),
        ];
    }
    vec!["-i".to_string(), uri.to_string()]
}
