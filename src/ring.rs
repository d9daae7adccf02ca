//! Single-slot capture ring for live sources.
//!
//! Decouples decode rate from detection rate with bounded memory: one frame,
//! regardless of how far the consumer falls behind. Intermediate frames are
//! intentionally dropped so the detector always works on the freshest view
//! of the scene.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::models::Frame;

#[derive(Clone)]
pub struct CaptureRing {
    inner: Arc<RingInner>,
}

struct RingInner {
    slot: Mutex<Option<Frame>>,
    notify: Notify,
}

impl CaptureRing {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RingInner {
                slot: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Store a frame, overwriting any unread one. The grabber task calls this
    /// as fast as the source yields.
    pub fn put(&self, frame: Frame) {
        {
            let mut slot = self.inner.slot.lock().expect("ring lock poisoned");
            *slot = Some(frame);
        }
        self.inner.notify.notify_one();
    }

    /// Wait until a frame is present and take it. Always returns the most
    /// recently stored frame.
    pub async fn take(&self) -> Frame {
        loop {
            {
                let mut slot = self.inner.slot.lock().expect("ring lock poisoned");
                if let Some(frame) = slot.take() {
                    return frame;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Non-blocking variant; `None` when no unread frame is present.
    pub fn try_take(&self) -> Option<Frame> {
        self.inner.slot.lock().expect("ring lock poisoned").take()
    }
}

impl Default for CaptureRing {
    fn default() -> Self {
        Self::new()
    }
}
