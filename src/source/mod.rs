//! Frame sources: bounded files and unbounded live feeds, both decoding
//! through an ffmpeg child to packed RGB24.

pub mod audio;
pub mod ffmpeg;
pub mod file;
pub mod live;
pub mod probe;

pub use file::FileSource;
pub use live::LiveSource;
pub use probe::{probe, VideoMeta};

use sha2::{Digest, Sha256};

/// Stable 12-hex-digit id for a file source, derived from its path and size.
/// Re-analyzing the same file yields the same id.
pub fn file_video_id(path: &str) -> String {
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let digest = Sha256::digest(format!("{path}_{size}").as_bytes());
    hex_prefix(&digest, 12)
}

/// Random id for a live session.
pub fn live_video_id() -> String {
    let digest = Sha256::digest(uuid::Uuid::new_v4().as_bytes());
    hex_prefix(&digest, 12)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}
