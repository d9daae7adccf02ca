//! File analysis pipeline: sequential decode, change detection, one dispatch
//! window, one report.

use chrono::Utc;
use tokio::task::spawn_blocking;

use crate::detect::KeyframeExtractor;
use crate::dispatch::{DispatchJob, TranscribeRequest};
use crate::error::EngineError;
use crate::models::{Frame, Observation, Policy, Transcript};
use crate::sink::KeyframeSink;
use crate::source::{audio, file_video_id, FileSource};

use super::progress::{EndReason, ProgressEvent};
use super::WorkerCtx;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub(crate) async fn run_file(path: String, policy: Policy, ctx: WorkerCtx) {
    let video_id = file_video_id(&path);

    let mut source = match FileSource::open(&path).await {
        Ok(source) => source,
        Err(err) => {
            log_warn!("file session {} failed to open: {err}", ctx.session_id);
            ctx.emit(ProgressEvent::Ended(EndReason::Error(err.to_string())));
            return;
        }
    };

    ctx.emit(ProgressEvent::Started {
        session_id: ctx.session_id.clone(),
        video_id: video_id.clone(),
    });

    let meta = source.meta().clone();
    let step = source.sample_step(ctx.config.sample_interval);
    log_info!(
        "analyzing {path}: {:.1}s at {:.1} fps, sampling every {step} frame(s)",
        meta.duration,
        meta.fps
    );

    let mut extractor = KeyframeExtractor::new(&ctx.config);
    let mut sink = KeyframeSink::new(&ctx.config, false);
    let mut observations: Vec<Observation> = Vec::new();
    let mut last_frame: Option<Frame> = None;
    let mut decode_errors = 0u64;

    loop {
        let next = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                sink.close().await;
                ctx.emit(ProgressEvent::Ended(EndReason::Stopped));
                return;
            }
            next = source.next() => next,
        };

        match next {
            Ok(Some(frame)) => {
                if frame.index % step == 0 {
                    let (returned_extractor, returned_sink, returned_frame, produced) =
                        match detect_one(extractor, sink, frame).await {
                            Ok(parts) => parts,
                            Err(err) => {
                                fail_session(&ctx, err);
                                return;
                            }
                        };
                    extractor = returned_extractor;
                    sink = returned_sink;
                    last_frame = returned_frame;
                    if let Some(obs) = produced {
                        ctx.emit(ProgressEvent::Keyframe {
                            index: obs.index,
                            timestamp: obs.timestamp,
                            trigger: obs.trigger,
                            change_score: obs.change_score,
                        });
                        observations.push(obs);
                    }
                } else {
                    last_frame = Some(frame);
                }
            }
            Ok(None) => break,
            Err(EngineError::Decode(detail)) => {
                decode_errors += 1;
                log_warn!("skipping undecodable frame ({decode_errors} so far): {detail}");
            }
            Err(err) => {
                fail_session(&ctx, anyhow::anyhow!(err));
                return;
            }
        }
    }

    // Bookend: keep the final frame unless a keyframe just landed.
    if let Some(frame) = last_frame.take() {
        let result = spawn_blocking(move || {
            let obs = extractor
                .finalize(&frame)
                .map(|kept| sink.process(&kept))
                .transpose();
            (sink, obs)
        })
        .await;
        match result {
            Ok((returned_sink, Ok(produced))) => {
                sink = returned_sink;
                if let Some(obs) = produced {
                    ctx.emit(ProgressEvent::Keyframe {
                        index: obs.index,
                        timestamp: obs.timestamp,
                        trigger: obs.trigger,
                        change_score: obs.change_score,
                    });
                    observations.push(obs);
                }
            }
            Ok((returned_sink, Err(err))) => {
                sink = returned_sink;
                log_warn!("final frame processing failed: {err}");
            }
            Err(err) => {
                ctx.emit(ProgressEvent::Ended(EndReason::Error(format!(
                    "detection worker panicked: {err}"
                ))));
                return;
            }
        }
    }

    sink.close().await;
    log_info!(
        "detection complete for {video_id}: {} keyframe(s), {} decode error(s)",
        observations.len(),
        decode_errors
    );

    let transcript = if policy.include_audio {
        Some(transcribe_file(&path, &ctx).await)
    } else {
        None
    };

    let job = DispatchJob {
        video_id,
        observations,
        policy: policy.clone(),
        transcript,
        accumulated_transcript: String::new(),
        video_duration: meta.duration,
    };

    match ctx.engine.run_window(job, &ctx.cancel).await {
        Ok(mut report) => {
            ctx.checklist
                .lock()
                .expect("checklist lock poisoned")
                .apply(&policy, &mut report, Utc::now());
            ctx.emit(ProgressEvent::Report(Box::new(report)));
            ctx.emit(ProgressEvent::Ended(EndReason::Complete));
        }
        Err(EngineError::Cancelled) => {
            ctx.emit(ProgressEvent::Ended(EndReason::Stopped));
        }
        Err(err) => {
            ctx.emit(ProgressEvent::Ended(EndReason::Error(err.to_string())));
        }
    }
}

type DetectParts = (
    KeyframeExtractor,
    KeyframeSink,
    Option<Frame>,
    Option<Observation>,
);

/// Run scoring and encoding off the async thread; state structs travel in
/// and out of the blocking task.
async fn detect_one(
    mut extractor: KeyframeExtractor,
    mut sink: KeyframeSink,
    frame: Frame,
) -> anyhow::Result<DetectParts> {
    let joined = spawn_blocking(move || {
        let obs = extractor
            .process(&frame)
            .map(|kept| sink.process(&kept))
            .transpose();
        (extractor, sink, frame, obs)
    })
    .await?;
    let (extractor, sink, frame, obs) = joined;
    Ok((extractor, sink, Some(frame), obs?))
}

fn fail_session(ctx: &WorkerCtx, err: anyhow::Error) {
    log_warn!("file session {} failed: {err}", ctx.session_id);
    ctx.emit(ProgressEvent::Ended(EndReason::Error(err.to_string())));
}

/// Audio path for files. When audio is requested the report always carries a
/// transcript; a silent file yields an empty one so speech rules can report
/// "no speech detected" rather than vanish.
async fn transcribe_file(path: &str, ctx: &WorkerCtx) -> Transcript {
    let Some(transcriber) = ctx.transcriber.as_ref() else {
        log_warn!("audio requested but no transcriber is configured");
        return Transcript::default();
    };

    let audio = match audio::extract_file_audio(path).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Transcript::default(),
        Err(err) => {
            log_warn!("audio extraction failed (non-fatal): {err}");
            return Transcript::default();
        }
    };

    match transcriber
        .transcribe(TranscribeRequest {
            audio,
            language_hint: None,
        })
        .await
    {
        Ok(transcript) => transcript,
        Err(err) => {
            log_warn!("transcription failed (non-fatal): {err}");
            Transcript::default()
        }
    }
}
