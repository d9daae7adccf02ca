//! Live monitoring pipeline.
//!
//! Four tasks per session, sharing nothing mutable across sessions:
//!   grabber    — pulls frames from the source into the single-slot ring
//!   detector   — (this function's main loop) samples the ring on a fixed
//!                cadence, scores frames, accumulates windows
//!   sink write — owned by the sink, drains keyframe disk writes
//!   dispatcher — consumes closed windows, one at a time, and emits reports
//!
//! Window N+1 accumulates while window N is still dispatching; the
//! dispatcher's sequential loop keeps dispatch at-most-one-in-flight.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::{spawn_blocking, JoinHandle};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::detect::KeyframeExtractor;
use crate::dispatch::{DispatchJob, TranscribeRequest};
use crate::error::EngineError;
use crate::models::{Observation, Policy, Transcript};
use crate::ring::CaptureRing;
use crate::sink::KeyframeSink;
use crate::source::{audio, live_video_id, LiveSource};

use super::prior::PriorState;
use super::progress::{EndReason, ProgressEvent};
use super::WorkerCtx;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

struct WindowBatch {
    index: u64,
    observations: Vec<Observation>,
    duration: f64,
    audio: Option<JoinHandle<Option<Vec<u8>>>>,
}

pub(crate) async fn run_live(
    uri: String,
    policy: Policy,
    window_duration: Option<f64>,
    ctx: WorkerCtx,
) {
    let video_id = live_video_id();

    let mut source = match LiveSource::open(&uri, ctx.config.live_read_timeout).await {
        Ok(source) => source,
        Err(err) => {
            log_warn!("live session {} failed to open {uri}: {err}", ctx.session_id);
            ctx.emit(ProgressEvent::Ended(EndReason::SourceUnreachable));
            return;
        }
    };

    ctx.emit(ProgressEvent::Started {
        session_id: ctx.session_id.clone(),
        video_id: video_id.clone(),
    });

    let steady_window = window_duration.unwrap_or(ctx.config.window_duration);
    let first_window = ctx.config.first_window_duration.min(steady_window);
    log_info!(
        "live monitoring {uri}: first window {first_window}s, then {steady_window}s"
    );

    // Internal token: a fatal source failure cancels the whole session, not
    // just the grabber.
    let session_cancel = ctx.cancel.child_token();
    let fatal: Arc<Mutex<Option<EndReason>>> = Arc::new(Mutex::new(None));

    let ring = CaptureRing::new();
    let grabber = {
        let ring = ring.clone();
        let cancel = session_cancel.clone();
        let fatal = Arc::clone(&fatal);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = source.next() => match next {
                        Ok(frame) => ring.put(frame),
                        Err(err) => {
                            log_warn!("live source gave up: {err}");
                            *fatal.lock().expect("fatal flag lock poisoned") =
                                Some(EndReason::SourceUnreachable);
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        })
    };

    let (window_tx, window_rx) = mpsc::unbounded_channel::<WindowBatch>();
    let dispatcher = tokio::spawn(dispatch_windows(
        ctx.clone(),
        policy.clone(),
        video_id.clone(),
        window_rx,
        session_cancel.clone(),
    ));

    // --- Detector loop ---
    // Extractor and sink shuttle through spawn_blocking each sample; the
    // Option is empty only while the blocking task owns them.
    let mut pipeline: Option<(KeyframeExtractor, KeyframeSink)> = Some((
        KeyframeExtractor::new(&ctx.config),
        KeyframeSink::new(&ctx.config, true),
    ));
    let mut ticker = interval(Duration::from_secs_f64(ctx.config.sample_interval));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut window: Vec<Observation> = Vec::new();
    let mut window_index: u64 = 0;
    let mut window_started = Instant::now();
    let mut current_window = first_window;
    let mut audio_task = start_window_audio(&ctx, &uri, current_window);

    loop {
        tokio::select! {
            _ = session_cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Some(frame) = ring.try_take() {
            let (mut extractor, mut sink) = pipeline.take().expect("pipeline in flight");
            let joined = spawn_blocking(move || {
                let obs = extractor
                    .process(&frame)
                    .map(|kept| sink.process(&kept))
                    .transpose();
                (extractor, sink, obs)
            })
            .await;
            match joined {
                Ok((extractor, sink, obs)) => {
                    pipeline = Some((extractor, sink));
                    match obs {
                        Ok(Some(obs)) => {
                            ctx.emit(ProgressEvent::Keyframe {
                                index: obs.index,
                                timestamp: obs.timestamp,
                                trigger: obs.trigger,
                                change_score: obs.change_score,
                            });
                            window.push(obs);
                        }
                        Ok(None) => {}
                        Err(err) => log_warn!("keyframe encoding failed: {err}"),
                    }
                }
                Err(err) => {
                    *fatal.lock().expect("fatal flag lock poisoned") =
                        Some(EndReason::Error(format!("detection worker panicked: {err}")));
                    session_cancel.cancel();
                    break;
                }
            }
        }

        if window_started.elapsed().as_secs_f64() >= current_window {
            let batch = WindowBatch {
                index: window_index,
                observations: std::mem::take(&mut window),
                duration: window_started.elapsed().as_secs_f64(),
                audio: audio_task.take(),
            };
            ctx.emit(ProgressEvent::WindowClosed {
                window_index: batch.index,
                observations: batch.observations.len(),
            });
            if window_tx.send(batch).is_err() {
                break;
            }
            window_index += 1;
            window_started = Instant::now();
            current_window = steady_window;
            audio_task = start_window_audio(&ctx, &uri, current_window);
        }
    }

    // --- Teardown ---
    session_cancel.cancel();
    drop(window_tx);
    if let Some(task) = audio_task.take() {
        task.abort();
    }
    let _ = grabber.await;
    let _ = dispatcher.await;
    if let Some((_, sink)) = pipeline.take() {
        sink.close().await;
    }

    let reason = if ctx.cancel.is_cancelled() {
        EndReason::Stopped
    } else {
        fatal
            .lock()
            .expect("fatal flag lock poisoned")
            .take()
            .unwrap_or(EndReason::Stopped)
    };
    log_info!("live session {} ended: {reason}", ctx.session_id);
    ctx.emit(ProgressEvent::Ended(reason));
}

/// Start recording this window's audio concurrently with frame accumulation.
fn start_window_audio(
    ctx: &WorkerCtx,
    uri: &str,
    duration: f64,
) -> Option<JoinHandle<Option<Vec<u8>>>> {
    if !ctx.include_audio || ctx.transcriber.is_none() {
        return None;
    }
    let uri = uri.to_string();
    Some(tokio::spawn(async move {
        match audio::record_live_audio(&uri, duration).await {
            Ok(bytes) => bytes,
            Err(err) => {
                log_warn!("live audio capture failed (non-fatal): {err}");
                None
            }
        }
    }))
}

/// Sequential window dispatch. One window in flight at any instant; later
/// windows queue behind it in arrival (and therefore index) order.
async fn dispatch_windows(
    ctx: WorkerCtx,
    policy: Policy,
    video_id: String,
    mut windows: mpsc::UnboundedReceiver<WindowBatch>,
    cancel: CancellationToken,
) {
    let mut prior = PriorState::new();

    while let Some(batch) = windows.recv().await {
        if cancel.is_cancelled() {
            break;
        }
        if batch.observations.is_empty() {
            log_info!("window {} closed with no keyframes, skipping dispatch", batch.index);
            continue;
        }

        let transcript = window_transcript(&ctx, batch.audio).await;

        let mut window_policy = policy.clone();
        window_policy.prior_context =
            merge_context(policy.prior_context.clone(), prior.build_context(&policy));

        let job = DispatchJob {
            video_id: video_id.clone(),
            observations: batch.observations,
            policy: window_policy,
            transcript,
            accumulated_transcript: prior.accumulated_transcript().to_string(),
            video_duration: batch.duration,
        };

        match ctx.engine.run_window(job, &cancel).await {
            Ok(mut report) => {
                prior.enforce_satisfied(&policy, &mut report);
                ctx.checklist
                    .lock()
                    .expect("checklist lock poisoned")
                    .apply(&policy, &mut report, Utc::now());
                ctx.emit(ProgressEvent::Report(Box::new(report.clone())));
                // Cross-window state moves only after the report is out, so
                // the next window sees exactly what was reported.
                prior.note_report(&policy, &report);
            }
            Err(EngineError::Cancelled) => break,
            Err(err) => {
                log_warn!("window {} dispatch failed: {err}", batch.index);
            }
        }
    }
}

async fn window_transcript(
    ctx: &WorkerCtx,
    audio_task: Option<JoinHandle<Option<Vec<u8>>>>,
) -> Option<Transcript> {
    if !ctx.include_audio {
        return None;
    }
    let transcriber = ctx.transcriber.as_ref()?;

    let bytes = match audio_task {
        Some(task) => task.await.ok().flatten(),
        None => None,
    };
    let Some(bytes) = bytes else {
        return Some(Transcript::default());
    };

    match transcriber
        .transcribe(TranscribeRequest {
            audio: bytes,
            language_hint: None,
        })
        .await
    {
        Ok(transcript) => Some(transcript),
        Err(err) => {
            log_warn!("window transcription failed (non-fatal): {err}");
            Some(Transcript::default())
        }
    }
}

fn merge_context(user: Option<String>, built: Option<String>) -> Option<String> {
    match (user, built) {
        (Some(u), Some(b)) => Some(format!("{u}\n\n{b}")),
        (Some(u), None) => Some(u),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
