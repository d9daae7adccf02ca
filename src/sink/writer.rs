//! Asynchronous keyframe disk writer.
//!
//! Detection never blocks on disk I/O: writes go through a small bounded
//! queue serviced by a dedicated task. On overflow the oldest pending write
//! is dropped, never the current detection result.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::warn;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Maximum pending writes before drop-oldest kicks in.
const QUEUE_BOUND: usize = 16;

struct WriteJob {
    path: PathBuf,
    bytes: Vec<u8>,
}

struct WriterState {
    queue: VecDeque<WriteJob>,
    closed: bool,
    dropped: u64,
}

pub struct DiskWriter {
    state: Arc<Mutex<WriterState>>,
    notify: Arc<Notify>,
    worker: Option<JoinHandle<()>>,
}

impl DiskWriter {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(WriterState {
            queue: VecDeque::new(),
            closed: false,
            dropped: 0,
        }));
        let notify = Arc::new(Notify::new());

        let worker_state = Arc::clone(&state);
        let worker_notify = Arc::clone(&notify);
        let worker = tokio::spawn(async move {
            loop {
                let job = {
                    let mut guard = worker_state.lock().expect("writer lock poisoned");
                    match guard.queue.pop_front() {
                        Some(job) => Some(job),
                        None if guard.closed => break,
                        None => None,
                    }
                };

                match job {
                    Some(job) => {
                        if let Some(parent) = job.path.parent() {
                            let _ = tokio::fs::create_dir_all(parent).await;
                        }
                        if let Err(err) = tokio::fs::write(&job.path, &job.bytes).await {
                            warn!("keyframe write failed for {}: {err}", job.path.display());
                        }
                    }
                    None => worker_notify.notified().await,
                }
            }
        });

        Self {
            state,
            notify,
            worker: Some(worker),
        }
    }

    /// Queue a write. Non-blocking; drops the oldest pending job on overflow.
    pub fn enqueue(&self, path: PathBuf, bytes: Vec<u8>) {
        {
            let mut guard = self.state.lock().expect("writer lock poisoned");
            if guard.closed {
                return;
            }
            guard.queue.push_back(WriteJob { path, bytes });
            if guard.queue.len() > QUEUE_BOUND {
                if let Some(dropped) = guard.queue.pop_front() {
                    guard.dropped += 1;
                    warn!(
                        "keyframe write queue full, dropping {} (total dropped: {})",
                        dropped.path.display(),
                        guard.dropped
                    );
                }
            }
        }
        self.notify.notify_one();
    }

    pub fn dropped_count(&self) -> u64 {
        self.state.lock().expect("writer lock poisoned").dropped
    }

    /// Drain remaining writes and stop the worker.
    pub async fn close(mut self) {
        {
            let mut guard = self.state.lock().expect("writer lock poisoned");
            guard.closed = true;
        }
        self.notify.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            {
                let mut guard = self.state.lock().expect("writer lock poisoned");
                guard.closed = true;
            }
            self.notify.notify_one();
            // Pending writes finish in the background; the task is not
            // awaited here because Drop cannot be async.
            drop(worker);
        }
    }
}
