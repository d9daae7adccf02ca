//! Process-wide token bucket for external model calls.
//!
//! Sessions share one limiter: provider-side RPM/RPH budgets apply to the
//! process, not to any single camera. Acquisition blocks until a slot frees
//! up or the session is cancelled.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<VecDeque<Instant>>>,
    per_minute: u32,
    per_hour: u32,
}

impl RateLimiter {
    pub fn new(per_minute: u32, per_hour: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            per_minute,
            per_hour,
        }
    }

    /// Take one call slot, waiting for refill if both windows are saturated.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        loop {
            let wait = {
                let mut calls = self.inner.lock().expect("rate limiter lock poisoned");
                let now = Instant::now();
                while let Some(&front) = calls.front() {
                    if now.duration_since(front) >= HOUR {
                        calls.pop_front();
                    } else {
                        break;
                    }
                }

                let in_minute = calls
                    .iter()
                    .rev()
                    .take_while(|&&t| now.duration_since(t) < MINUTE)
                    .count() as u32;
                let in_hour = calls.len() as u32;

                if in_minute < self.per_minute && in_hour < self.per_hour {
                    calls.push_back(now);
                    None
                } else if in_hour >= self.per_hour {
                    // Wait for the oldest call to age out of the hour window.
                    calls.front().map(|&t| HOUR - now.duration_since(t))
                } else {
                    // Wait for the oldest call inside the minute window.
                    calls
                        .iter()
                        .rev()
                        .take_while(|&&t| now.duration_since(t) < MINUTE)
                        .last()
                        .map(|&t| MINUTE - now.duration_since(t))
                }
            };

            let Some(wait) = wait else {
                return Ok(());
            };

            debug!("rate limited, waiting {wait:?} for refill");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }

    /// Current number of tracked calls, for diagnostics.
    pub fn in_flight_window(&self) -> usize {
        self.inner.lock().expect("rate limiter lock poisoned").len()
    }
}
