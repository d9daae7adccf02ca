//! Container metadata via ffprobe.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::process::Command;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Basic metadata of a video source, extracted before decoding starts.
#[derive(Debug, Clone, Serialize)]
pub struct VideoMeta {
    pub duration: f64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub total_frames: u64,
    pub resolution: String,
    pub aspect_ratio: String,
}

/// Probe a file path or live URL for its first video stream.
pub async fn probe(uri: &str) -> Result<VideoMeta> {
    let run = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate,nb_frames,duration",
            "-show_entries",
            "format=duration",
            "-of",
            "json",
        ])
        .arg(uri)
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(PROBE_TIMEOUT, run)
        .await
        .context("ffprobe timed out")?
        .context("failed to run ffprobe")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("ffprobe failed: {}", stderr.trim());
    }

    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).context("ffprobe produced invalid JSON")?;

    let stream = parsed["streams"]
        .get(0)
        .context("source has no video stream")?;

    let width = stream["width"].as_u64().unwrap_or(0) as u32;
    let height = stream["height"].as_u64().unwrap_or(0) as u32;
    if width == 0 || height == 0 {
        bail!("video stream reports zero resolution");
    }

    let fps = stream["r_frame_rate"]
        .as_str()
        .and_then(parse_rate)
        .unwrap_or(0.0);

    let duration = stream["duration"]
        .as_str()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| {
            parsed["format"]["duration"]
                .as_str()
                .and_then(|d| d.parse::<f64>().ok())
        })
        .unwrap_or(0.0);

    let total_frames = stream["nb_frames"]
        .as_str()
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or_else(|| (duration * fps).round() as u64);

    Ok(VideoMeta {
        duration,
        fps,
        width,
        height,
        total_frames,
        resolution: format!("{width}x{height}"),
        aspect_ratio: aspect_label(width, height),
    })
}

/// Parse an ffprobe rational like "30000/1001".
fn parse_rate(raw: &str) -> Option<f64> {
    let mut parts = raw.splitn(2, '/');
    let num: f64 = parts.next()?.parse().ok()?;
    match parts.next() {
        Some(den) => {
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => Some(num),
    }
}

fn aspect_label(width: u32, height: u32) -> String {
    if height == 0 {
        return format!("{width}:{height}");
    }
    let ratio = width as f64 / height as f64;
    if (ratio - 16.0 / 9.0).abs() < 0.1 {
        "16:9".to_string()
    } else if (ratio - 4.0 / 3.0).abs() < 0.1 {
        "4:3".to_string()
    } else if (ratio - 1.0).abs() < 0.1 {
        "1:1".to_string()
    } else {
        format!("{width}:{height}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_integer_and_rational_rates() {
        assert_eq!(parse_rate("30"), Some(30.0));
        let ntsc = parse_rate("30000/1001").unwrap();
        assert!((ntsc - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("0/0"), None);
    }

    #[test]
    fn labels_common_aspect_ratios() {
        assert_eq!(aspect_label(1920, 1080), "16:9");
        assert_eq!(aspect_label(640, 480), "4:3");
        assert_eq!(aspect_label(512, 512), "1:1");
        assert_eq!(aspect_label(640, 360), "16:9");
        assert_eq!(aspect_label(1000, 300), "1000:300");
    }
}
